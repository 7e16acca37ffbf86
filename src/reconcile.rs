//! Payment reconciliation: converges gateway webhooks and manual
//! verify-and-complete calls onto one idempotent pending -> paid transition.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::{error, info, warn};

use crate::error::LedgerError;
use crate::gateway::PaymentGatewayRef;
use crate::store::{LedgerStoreRef, SettleWrite};
use crate::types::{EntrySource, Order, PaymentStatus, Transaction, TransactionType};
use crate::wallet::WalletService;

/// The only gateway event that settles an order.
pub const CHARGE_SUCCESS_EVENT: &str = "charge.success";

/// The header carrying the hex HMAC-SHA512 of the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Checks a webhook signature against the raw request body.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha512>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// A gateway webhook delivery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookData {
    pub reference: String,
    /// Minor units, as reported by the sender. Informational only.
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub status: String,
}

/// How a settlement request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// This call performed the transition.
    Settled(Order),
    /// The order was already paid; nothing changed.
    AlreadySettled(Order),
}

impl Settlement {
    pub fn order(&self) -> &Order {
        match self {
            Settlement::Settled(o) | Settlement::AlreadySettled(o) => o,
        }
    }
}

/// How a webhook delivery was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    NotFound,
    AlreadyProcessed(Order),
    Processed(Order),
    VerificationFailed(String),
    /// Not a successful-charge event; acknowledged without side effects.
    Ignored,
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: LedgerStoreRef,
    gateway: PaymentGatewayRef,
    wallet: WalletService,
}

impl ReconciliationService {
    pub fn new(store: LedgerStoreRef, gateway: PaymentGatewayRef, wallet: WalletService) -> Self {
        Self {
            store,
            gateway,
            wallet,
        }
    }

    pub async fn handle_webhook(&self, event: WebhookEvent) -> Result<WebhookOutcome, LedgerError> {
        let reference = event.data.reference;
        info!(event = %event.event, %reference, "webhook received");

        if event.event != CHARGE_SUCCESS_EVENT || event.data.status != "success" {
            return Ok(WebhookOutcome::Ignored);
        }

        match self.verify_and_complete(&reference).await {
            Ok(Settlement::Settled(order)) => Ok(WebhookOutcome::Processed(order)),
            Ok(Settlement::AlreadySettled(order)) => Ok(WebhookOutcome::AlreadyProcessed(order)),
            Err(LedgerError::OrderNotFound(_)) => {
                warn!(%reference, "webhook for unknown reference");
                Ok(WebhookOutcome::NotFound)
            }
            Err(LedgerError::VerificationFailed { reason, .. }) => {
                Ok(WebhookOutcome::VerificationFailed(reason))
            }
            Err(e) => {
                error!(%reference, error = %e, "webhook processing failed");
                Err(e)
            }
        }
    }

    /// Checks the order, asks the gateway to confirm the charge, and marks
    /// the order paid. At most one purchase entry is ever written per order,
    /// however many times or however concurrently this is called.
    pub async fn verify_and_complete(&self, payment_ref: &str) -> Result<Settlement, LedgerError> {
        let order = self
            .store
            .order_by_payment_ref(payment_ref)
            .await?
            .ok_or_else(|| LedgerError::OrderNotFound(payment_ref.to_string()))?;

        match order.payment_status {
            PaymentStatus::Paid => {
                info!(%payment_ref, "payment already verified");
                return Ok(Settlement::AlreadySettled(order));
            }
            PaymentStatus::Failed => {
                return Err(LedgerError::VerificationFailed {
                    reference: payment_ref.to_string(),
                    reason: "order is marked failed".to_string(),
                });
            }
            PaymentStatus::Pending => {}
        }

        let verification = self.gateway.verify(payment_ref).await?;
        if !verification.success {
            warn!(%payment_ref, status = %verification.status, "gateway did not confirm payment");
            return Err(LedgerError::VerificationFailed {
                reference: payment_ref.to_string(),
                reason: format!("gateway status {}", verification.status),
            });
        }
        if verification.amount != order.amount {
            warn!(%payment_ref, expected = %order.amount, charged = %verification.amount, "charged amount does not match order");
            return Err(LedgerError::VerificationFailed {
                reference: payment_ref.to_string(),
                reason: format!(
                    "charged {} but order costs {}",
                    verification.amount, order.amount
                ),
            });
        }

        let entry = Transaction::completed(
            order.user_id,
            TransactionType::Purchase,
            -order.amount,
            EntrySource::Gateway,
            order.purchase_reference(),
        );
        match self.store.settle_order(payment_ref, entry).await? {
            SettleWrite::Settled(order) => {
                info!(order_id = %order.id, %payment_ref, amount = %order.amount, "payment verified and order paid");
                self.wallet.reward_after_settlement(&order).await;
                Ok(Settlement::Settled(order))
            }
            SettleWrite::NotPending(order) if order.is_paid() => {
                info!(%payment_ref, "lost settlement race, order already paid");
                Ok(Settlement::AlreadySettled(order))
            }
            SettleWrite::NotPending(order) => Err(LedgerError::VerificationFailed {
                reference: payment_ref.to_string(),
                reason: format!("order is {}", order.payment_status),
            }),
            SettleWrite::Missing => Err(LedgerError::OrderNotFound(payment_ref.to_string())),
        }
    }
}
