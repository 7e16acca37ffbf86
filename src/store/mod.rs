//! The ledger store port and its adapters.
//!
//! Every method that touches more than one row is atomic: either all of its
//! writes land or none do.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::{Order, Settings, Transaction, User};

/// A balance mutation guarded by a compare-and-swap on the current balance.
#[derive(Debug, Clone)]
pub struct WalletChange {
    pub user_id: Uuid,
    /// The balance the caller based its decision on.
    pub expected_balance: Decimal,
    /// The entry to append; its amount is the signed balance delta.
    pub entry: Transaction,
    /// An order to create in the same unit of work.
    pub order: Option<Order>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalletWrite {
    /// Balance updated, entry appended, order (if any) created.
    Applied { balance: Decimal },
    /// The balance moved since it was read; nothing was written.
    BalanceChanged,
    /// An entry with the same reference already exists; nothing was written.
    DuplicateReference(Transaction),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleWrite {
    /// This call moved the order from pending to paid and appended the entry.
    Settled(Order),
    /// The order was no longer pending; nothing was written.
    NotPending(Order),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryWrite {
    Delivered(Order),
    NotPaid(Order),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserWrite {
    Inserted,
    DuplicateId,
    DuplicateEmail,
    DuplicateReferralCode,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> Result<UserWrite>;
    async fn user(&self, id: Uuid) -> Result<Option<User>>;
    async fn user_by_referral_code(&self, code: &str) -> Result<Option<User>>;

    /// Applies `change` only if the user's balance still equals
    /// `change.expected_balance`.
    async fn apply_wallet_change(&self, change: WalletChange) -> Result<WalletWrite>;

    /// The user's entries, newest first.
    async fn transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>>;
    async fn transaction_by_reference(&self, reference: &str) -> Result<Option<Transaction>>;

    async fn insert_order(&self, order: &Order) -> Result<()>;
    async fn order(&self, id: Uuid) -> Result<Option<Order>>;
    async fn order_by_payment_ref(&self, payment_ref: &str) -> Result<Option<Order>>;
    /// Orders newest first, optionally only those of one user.
    async fn orders(&self, user_id: Option<Uuid>) -> Result<Vec<Order>>;

    /// Sets the order to paid where it is still pending and, only when that
    /// update wins, appends `entry`.
    async fn settle_order(&self, payment_ref: &str, entry: Transaction) -> Result<SettleWrite>;

    /// Sets the order to delivered where it is paid.
    async fn mark_delivered(&self, order_id: Uuid) -> Result<DeliveryWrite>;

    async fn settings(&self) -> Result<Settings>;
    /// Replaces the settings row where its version still equals
    /// `expected_version`. The stored version becomes `expected_version + 1`.
    async fn replace_settings(&self, expected_version: i64, settings: &Settings) -> Result<bool>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
