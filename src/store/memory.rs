use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DeliveryWrite, LedgerStore, SettleWrite, UserWrite, WalletChange, WalletWrite};
use crate::types::{
    DeliveryStatus, Order, PaymentStatus, Settings, Transaction, User, apply_delta,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    /// Append order is newest-last.
    transactions: Vec<Transaction>,
    orders: Vec<Order>,
    settings: Settings,
}

impl Tables {
    fn transaction_by_reference(&self, reference: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.reference == reference)
    }

    fn order_index_by_ref(&self, payment_ref: &str) -> Option<usize> {
        self.orders.iter().position(|o| o.payment_ref == payment_ref)
    }
}

/// A thread-safe in-memory ledger store.
///
/// All tables sit behind one `RwLock`, so every composite write is applied
/// under a single write guard. Used by tests and local runs.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables {
                settings,
                ..Default::default()
            })),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_user(&self, user: &User) -> Result<UserWrite> {
        let mut tables = self.tables.write().await;
        if tables.users.contains_key(&user.id) {
            return Ok(UserWrite::DuplicateId);
        }
        if tables.users.values().any(|u| u.email == user.email) {
            return Ok(UserWrite::DuplicateEmail);
        }
        if tables
            .users
            .values()
            .any(|u| u.referral_code == user.referral_code)
        {
            return Ok(UserWrite::DuplicateReferralCode);
        }
        tables.users.insert(user.id, user.clone());
        Ok(UserWrite::Inserted)
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(&id).cloned())
    }

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.referral_code == code)
            .cloned())
    }

    async fn apply_wallet_change(&self, change: WalletChange) -> Result<WalletWrite> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.transaction_by_reference(&change.entry.reference) {
            return Ok(WalletWrite::DuplicateReference(existing.clone()));
        }

        let Some(user) = tables.users.get_mut(&change.user_id) else {
            bail!("user {} vanished during wallet change", change.user_id);
        };
        if user.wallet_balance != change.expected_balance {
            return Ok(WalletWrite::BalanceChanged);
        }

        let Some(balance) = apply_delta(user.wallet_balance, change.entry.amount) else {
            bail!(
                "wallet change of {} would take user {} out of range",
                change.entry.amount,
                change.user_id
            );
        };
        user.wallet_balance = balance;

        tables.transactions.push(change.entry);
        if let Some(order) = change.order {
            tables.orders.push(order);
        }
        Ok(WalletWrite::Applied { balance })
    }

    async fn transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn transaction_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transaction_by_reference(reference).cloned())
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.order_index_by_ref(&order.payment_ref).is_some() {
            bail!("duplicate payment reference {}", order.payment_ref);
        }
        tables.orders.push(order.clone());
        Ok(())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn order_by_payment_ref(&self, payment_ref: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .order_index_by_ref(payment_ref)
            .map(|i| tables.orders[i].clone()))
    }

    async fn orders(&self, user_id: Option<Uuid>) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .iter()
            .rev()
            .filter(|o| user_id.is_none_or(|id| o.user_id == id))
            .cloned()
            .collect())
    }

    async fn settle_order(&self, payment_ref: &str, entry: Transaction) -> Result<SettleWrite> {
        let mut tables = self.tables.write().await;
        let Some(index) = tables.order_index_by_ref(payment_ref) else {
            return Ok(SettleWrite::Missing);
        };
        if tables.orders[index].payment_status != PaymentStatus::Pending {
            return Ok(SettleWrite::NotPending(tables.orders[index].clone()));
        }
        if tables.transaction_by_reference(&entry.reference).is_some() {
            bail!("settlement entry {} already exists", entry.reference);
        }

        tables.orders[index].payment_status = PaymentStatus::Paid;
        tables.transactions.push(entry);
        Ok(SettleWrite::Settled(tables.orders[index].clone()))
    }

    async fn mark_delivered(&self, order_id: Uuid) -> Result<DeliveryWrite> {
        let mut tables = self.tables.write().await;
        let Some(order) = tables.orders.iter_mut().find(|o| o.id == order_id) else {
            return Ok(DeliveryWrite::Missing);
        };
        if order.payment_status != PaymentStatus::Paid {
            return Ok(DeliveryWrite::NotPaid(order.clone()));
        }
        order.delivery_status = DeliveryStatus::Delivered;
        Ok(DeliveryWrite::Delivered(order.clone()))
    }

    async fn settings(&self) -> Result<Settings> {
        let tables = self.tables.read().await;
        Ok(tables.settings.clone())
    }

    async fn replace_settings(&self, expected_version: i64, settings: &Settings) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.settings.version != expected_version {
            return Ok(false);
        }
        tables.settings = Settings {
            version: expected_version + 1,
            ..settings.clone()
        };
        Ok(true)
    }
}
