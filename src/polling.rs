//! Client-side observation of a gateway order after checkout redirect.
//!
//! Polling only reads. A timeout is an observed failure for display purposes:
//! the order stays pending and can still be settled later by the webhook or a
//! manual verify.

use std::time::Duration;

use tokio::time::{Instant, interval_at, sleep_until};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::orders::OrderService;
use crate::types::Order;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Paid(Order),
    /// The deadline passed while the order was still unpaid; carries the last
    /// observed state.
    TimedOut(Order),
}

#[derive(Clone)]
pub struct PaymentPoller {
    orders: OrderService,
    interval: Duration,
    timeout: Duration,
}

impl PaymentPoller {
    pub fn new(orders: OrderService) -> Self {
        Self {
            orders,
            interval: POLL_INTERVAL,
            timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Polls the order every interval until it is paid or the timeout elapses.
    ///
    /// Transient read failures are logged and the next tick tries again.
    pub async fn await_settlement(&self, order_id: Uuid) -> Result<PollOutcome, LedgerError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut last = self.orders.order(order_id).await?;
        let mut ticker = interval_at(start + self.interval, self.interval);

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    debug!(%order_id, "gave up waiting for payment");
                    return Ok(PollOutcome::TimedOut(last));
                }
                _ = ticker.tick() => {
                    match self.orders.order(order_id).await {
                        Ok(order) if order.is_paid() => return Ok(PollOutcome::Paid(order)),
                        Ok(order) => last = order,
                        Err(e @ LedgerError::OrderNotFound(_)) => return Err(e),
                        Err(e) => warn!(%order_id, error = %e, "error checking payment status"),
                    }
                }
            }
        }
    }
}
