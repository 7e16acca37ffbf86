//! The pricing oracle: price per GB and the referral programme switch.
//!
//! Reads go straight to the settings row, so a reader always sees the latest
//! committed write. Orders copy the price into their own `amount`, which is
//! never recomputed.

use backon::Retryable;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::retry::{conflict, conflict_backoff, is_conflict};
use crate::store::LedgerStoreRef;
use crate::types::{Settings, validate_price};

#[derive(Clone)]
pub struct PricingOracle {
    store: LedgerStoreRef,
}

impl PricingOracle {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self { store }
    }

    pub async fn settings(&self) -> Result<Settings, LedgerError> {
        self.store
            .settings()
            .await
            .map_err(LedgerError::PricingUnavailable)
    }

    pub async fn current_price_per_unit(&self) -> Result<Decimal, LedgerError> {
        Ok(self.settings().await?.price_per_gb)
    }

    pub async fn set_price_per_unit(&self, price: Decimal) -> Result<Settings, LedgerError> {
        let price = validate_price(price)?;
        let settings = self
            .update(|s| Settings {
                price_per_gb: price,
                ..s.clone()
            })
            .await?;
        info!(%price, version = settings.version, "price per GB updated");
        Ok(settings)
    }

    pub async fn referrals_enabled(&self) -> Result<bool, LedgerError> {
        Ok(self.settings().await?.referrals_enabled)
    }

    pub async fn set_referrals_enabled(&self, enabled: bool) -> Result<Settings, LedgerError> {
        let settings = self
            .update(|s| Settings {
                referrals_enabled: enabled,
                ..s.clone()
            })
            .await?;
        info!(enabled, version = settings.version, "referral programme toggled");
        Ok(settings)
    }

    async fn update<F>(&self, apply: F) -> Result<Settings, LedgerError>
    where
        F: Fn(&Settings) -> Settings,
    {
        let apply = &apply;
        let result = (move || async move { self.try_update(apply).await })
            .retry(conflict_backoff())
            .when(is_conflict)
            .notify(|_, delay| debug!(?delay, "settings changed concurrently, retrying"))
            .await;

        if result.as_ref().is_err_and(is_conflict) {
            warn!("settings update kept conflicting, giving up");
        }
        result
    }

    async fn try_update<F>(&self, apply: &F) -> Result<Settings, LedgerError>
    where
        F: Fn(&Settings) -> Settings,
    {
        let current = self.store.settings().await?;
        let next = apply(&current);
        if !self.store.replace_settings(current.version, &next).await? {
            return Err(conflict());
        }
        Ok(Settings {
            version: current.version + 1,
            ..next
        })
    }
}
