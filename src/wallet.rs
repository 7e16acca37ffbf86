//! Wallet credits (top-ups, referral rewards) and the compare-and-swap write
//! shared by every balance mutation.

use backon::Retryable;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::gateway::PaymentGatewayRef;
use crate::pricing::PricingOracle;
use crate::retry::{conflict, conflict_backoff, is_conflict};
use crate::store::{LedgerStore, LedgerStoreRef, WalletChange, WalletWrite};
use crate::types::{
    Amount, CURRENCY, EntrySource, Order, Transaction, TransactionType, User, apply_delta,
};

/// The outcome of a balance mutation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Committed {
    Applied { balance: Decimal, entry: Transaction },
    /// An entry with the same reference was already on the ledger.
    Replayed(Transaction),
}

/// Reads the user, lets `plan` decide on the entry (and order) to write, and
/// commits it conditionally on the balance that was read. Lost races are
/// retried under `conflict_backoff`.
pub(crate) async fn mutate_balance<F>(
    store: &dyn LedgerStore,
    user_id: Uuid,
    plan: F,
) -> Result<Committed, LedgerError>
where
    F: Fn(&User) -> Result<(Transaction, Option<Order>), LedgerError>,
{
    let plan = &plan;
    let result = (move || async move { try_mutate_balance(store, user_id, plan).await })
        .retry(conflict_backoff())
        .when(is_conflict)
        .notify(|_, delay| {
            debug!(%user_id, ?delay, "wallet balance changed concurrently, retrying");
        })
        .await;

    if result.as_ref().is_err_and(is_conflict) {
        warn!(%user_id, "wallet update kept conflicting, giving up");
    }
    result
}

async fn try_mutate_balance<F>(
    store: &dyn LedgerStore,
    user_id: Uuid,
    plan: &F,
) -> Result<Committed, LedgerError>
where
    F: Fn(&User) -> Result<(Transaction, Option<Order>), LedgerError>,
{
    let user = store
        .user(user_id)
        .await?
        .ok_or(LedgerError::UserNotFound(user_id))?;
    let (entry, order) = plan(&user)?;

    let change = WalletChange {
        user_id,
        expected_balance: user.wallet_balance,
        entry: entry.clone(),
        order,
    };
    match store.apply_wallet_change(change).await? {
        WalletWrite::Applied { balance } => Ok(Committed::Applied { balance, entry }),
        WalletWrite::DuplicateReference(existing) => Ok(Committed::Replayed(existing)),
        WalletWrite::BalanceChanged => Err(conflict()),
    }
}

/// The result of a top-up.
#[derive(Debug, Clone, Serialize)]
pub struct TopUp {
    pub entry: Transaction,
    pub balance: Decimal,
    /// The reference had already been credited; nothing changed.
    pub replayed: bool,
}

/// A user's balance with their ledger history.
#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub currency: &'static str,
    pub transactions: Vec<Transaction>,
}

#[derive(Clone)]
pub struct WalletService {
    store: LedgerStoreRef,
    gateway: PaymentGatewayRef,
    pricing: PricingOracle,
    referral_reward_percent: Decimal,
}

impl WalletService {
    pub fn new(
        store: LedgerStoreRef,
        gateway: PaymentGatewayRef,
        pricing: PricingOracle,
        referral_reward_percent: Decimal,
    ) -> Self {
        Self {
            store,
            gateway,
            pricing,
            referral_reward_percent,
        }
    }

    /// Credits a top-up the user paid for through the gateway.
    ///
    /// The gateway must confirm a successful charge of exactly `amount` under
    /// `gateway_reference` before anything is credited. Replays of an already
    /// credited reference credit nothing and skip the gateway.
    pub async fn top_up(
        &self,
        user_id: Uuid,
        amount: Decimal,
        gateway_reference: &str,
    ) -> Result<TopUp, LedgerError> {
        let amount = Amount::new(amount)?;
        let reference = format!("TOP-{gateway_reference}");

        if let Some(existing) = self.store.transaction_by_reference(&reference).await? {
            return self.replayed_top_up(user_id, existing).await;
        }

        let verification = self.gateway.verify(gateway_reference).await?;
        if !verification.success {
            warn!(%user_id, %gateway_reference, status = %verification.status, "gateway did not confirm top-up");
            return Err(LedgerError::VerificationFailed {
                reference: gateway_reference.to_string(),
                reason: format!("gateway status {}", verification.status),
            });
        }
        if verification.amount != amount.value() {
            warn!(%user_id, %gateway_reference, requested = %amount.value(), charged = %verification.amount, "top-up amount does not match charge");
            return Err(LedgerError::VerificationFailed {
                reference: gateway_reference.to_string(),
                reason: format!(
                    "charged {} but top-up asks for {}",
                    verification.amount,
                    amount.value()
                ),
            });
        }

        match self
            .credit(user_id, TransactionType::Topup, amount, &reference)
            .await?
        {
            Committed::Applied { balance, entry } => {
                info!(%user_id, amount = %entry.amount, %balance, %reference, "wallet topped up");
                Ok(TopUp {
                    entry,
                    balance,
                    replayed: false,
                })
            }
            Committed::Replayed(entry) => self.replayed_top_up(user_id, entry).await,
        }
    }

    /// Credits the wallet without a gateway charge. Operator tooling only.
    pub async fn manual_top_up(&self, user_id: Uuid, amount: Decimal) -> Result<TopUp, LedgerError> {
        let amount = Amount::new(amount)?;
        let reference = format!("TOP-{}", Uuid::new_v4().simple());

        match self
            .credit(user_id, TransactionType::Topup, amount, &reference)
            .await?
        {
            Committed::Applied { balance, entry } => {
                info!(%user_id, amount = %entry.amount, %balance, %reference, "wallet credited by operator");
                Ok(TopUp {
                    entry,
                    balance,
                    replayed: false,
                })
            }
            Committed::Replayed(_) => {
                Err(anyhow::anyhow!("top-up reference {reference} already on the ledger").into())
            }
        }
    }

    async fn replayed_top_up(&self, user_id: Uuid, entry: Transaction) -> Result<TopUp, LedgerError> {
        if entry.user_id != user_id {
            warn!(%user_id, owner = %entry.user_id, reference = %entry.reference, "top-up reference belongs to another user");
            return Err(LedgerError::VerificationFailed {
                reference: entry.reference,
                reason: "reference already credited to another wallet".to_string(),
            });
        }

        info!(%user_id, reference = %entry.reference, "top-up already credited");
        let balance = self.balance(user_id).await?;
        Ok(TopUp {
            entry,
            balance,
            replayed: true,
        })
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<Decimal, LedgerError> {
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;
        Ok(user.wallet_balance)
    }

    /// The user's ledger entries, newest first.
    pub async fn transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.store.transactions(user_id).await?)
    }

    pub async fn summary(&self, user_id: Uuid) -> Result<WalletSummary, LedgerError> {
        let balance = self.balance(user_id).await?;
        let transactions = self.transactions(user_id).await?;
        Ok(WalletSummary {
            user_id,
            balance,
            currency: CURRENCY,
            transactions,
        })
    }

    /// Pays the buyer's referrer their share of a settled order.
    ///
    /// Returns the reward entry when this call wrote it.
    pub async fn reward_referrer(&self, order: &Order) -> Result<Option<Transaction>, LedgerError> {
        if !order.is_paid() || !self.pricing.referrals_enabled().await? {
            return Ok(None);
        }
        let Some(buyer) = self.store.user(order.user_id).await? else {
            return Ok(None);
        };
        let Some(referrer_id) = buyer.referred_by else {
            return Ok(None);
        };

        let reward = order
            .amount
            .checked_mul(self.referral_reward_percent)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .map(|v| v.round_dp(2));
        let Some(Ok(reward)) = reward.map(Amount::new) else {
            debug!(order_id = %order.id, "order too small or too large for a referral reward");
            return Ok(None);
        };

        match self
            .credit(referrer_id, TransactionType::Reward, reward, &order.reward_reference())
            .await?
        {
            Committed::Applied { balance, entry } => {
                info!(%referrer_id, order_id = %order.id, amount = %entry.amount, %balance, "referral reward paid");
                Ok(Some(entry))
            }
            Committed::Replayed(_) => Ok(None),
        }
    }

    /// Rewards the referrer without letting a failure leak into the
    /// settlement that triggered it.
    pub(crate) async fn reward_after_settlement(&self, order: &Order) {
        if let Err(e) = self.reward_referrer(order).await {
            warn!(order_id = %order.id, error = %e, "referral reward not paid");
        }
    }

    async fn credit(
        &self,
        user_id: Uuid,
        kind: TransactionType,
        amount: Amount,
        reference: &str,
    ) -> Result<Committed, LedgerError> {
        mutate_balance(self.store.as_ref(), user_id, |user| {
            if apply_delta(user.wallet_balance, amount.value()).is_none() {
                return Err(LedgerError::InvalidAmount(amount.value()));
            }
            let entry =
                Transaction::completed(user_id, kind, amount.value(), EntrySource::Wallet, reference);
            Ok((entry, None))
        })
        .await
    }
}
