//! Operator-triggered delivery. One-way: a delivered order is never undelivered.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::{DeliveryWrite, LedgerStoreRef};
use crate::types::Order;

#[derive(Clone)]
pub struct FulfillmentGate {
    store: LedgerStoreRef,
}

impl FulfillmentGate {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self { store }
    }

    /// Marks a paid order delivered. Repeating it on a delivered order is a
    /// no-op; an unpaid order is refused.
    pub async fn fulfill_order(&self, order_id: Uuid) -> Result<Order, LedgerError> {
        match self.store.mark_delivered(order_id).await? {
            DeliveryWrite::Delivered(order) => {
                info!(%order_id, phone = %order.phone, "order delivered");
                Ok(order)
            }
            DeliveryWrite::NotPaid(order) => {
                warn!(%order_id, status = %order.payment_status, "refusing to deliver unpaid order");
                Err(LedgerError::OrderNotPaid(order_id))
            }
            DeliveryWrite::Missing => Err(LedgerError::OrderNotFound(order_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerStore;
    use crate::store::memory::InMemoryLedgerStore;
    use crate::types::{DeliveryStatus, EntrySource, Network, PaymentMethod, PaymentStatus};
    use crate::types::{Transaction, TransactionType};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn gate_with_order() -> (FulfillmentGate, Arc<InMemoryLedgerStore>, Order) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let order = Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            network: Network::Telecel,
            bundle_gb: 2,
            amount: dec!(12),
            phone: "0200000000".into(),
            payment_ref: "PAY-fulfil".into(),
            payment_status: PaymentStatus::Pending,
            delivery_status: DeliveryStatus::Pending,
            payment_method: PaymentMethod::Gateway,
            created_at: Utc::now(),
        };
        store.insert_order(&order).await.unwrap();
        (FulfillmentGate::new(store.clone()), store, order)
    }

    #[tokio::test]
    async fn test_unpaid_order_is_not_delivered() {
        let (gate, store, order) = gate_with_order().await;

        assert!(matches!(
            gate.fulfill_order(order.id).await,
            Err(LedgerError::OrderNotPaid(_))
        ));
        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_paid_order_is_delivered_once_and_for_all() {
        let (gate, store, order) = gate_with_order().await;
        let entry = Transaction::completed(
            order.user_id,
            TransactionType::Purchase,
            -order.amount,
            EntrySource::Gateway,
            order.purchase_reference(),
        );
        store.settle_order(&order.payment_ref, entry).await.unwrap();

        let delivered = gate.fulfill_order(order.id).await.unwrap();
        assert_eq!(delivered.delivery_status, DeliveryStatus::Delivered);

        let again = gate.fulfill_order(order.id).await.unwrap();
        assert_eq!(again.delivery_status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_missing_order() {
        let (gate, _, _) = gate_with_order().await;
        assert!(matches!(
            gate.fulfill_order(Uuid::new_v4()).await,
            Err(LedgerError::OrderNotFound(_))
        ));
    }
}
