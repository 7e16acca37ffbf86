//! Profile creation. Authentication itself lives with the identity provider;
//! this only records the profile the ledger hangs off.

use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::{LedgerStoreRef, UserWrite};
use crate::types::{Role, User, new_referral_code};

const REFERRAL_CODE_ATTEMPTS: usize = 5;

/// The request to create a profile.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    /// The identity provider's ID for the user; generated when absent.
    pub id: Option<Uuid>,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    /// The referral code of the user who invited this one.
    pub referral_code: Option<String>,
}

#[derive(Clone)]
pub struct AccountService {
    store: LedgerStoreRef,
    referral_codes: fn() -> String,
}

impl AccountService {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self {
            store,
            referral_codes: new_referral_code,
        }
    }

    #[cfg(test)]
    fn with_code_generator(mut self, referral_codes: fn() -> String) -> Self {
        self.referral_codes = referral_codes;
        self
    }

    /// Creates a user-role profile with an empty wallet and a fresh referral code.
    ///
    /// An unknown referral code is ignored rather than rejected.
    pub async fn register(&self, req: NewUser) -> Result<User, LedgerError> {
        let referred_by = match req.referral_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let referrer = self.store.user_by_referral_code(&code.to_uppercase()).await?;
                if referrer.is_none() {
                    warn!(%code, "ignoring unknown referral code");
                }
                referrer.map(|u| u.id)
            }
            _ => None,
        };

        let mut user = User {
            id: req.id.unwrap_or_else(Uuid::new_v4),
            email: req.email.trim().to_lowercase(),
            name: req.name,
            phone: req.phone,
            role: Role::User,
            wallet_balance: Decimal::ZERO,
            referral_code: (self.referral_codes)(),
            referred_by,
            created_at: Utc::now(),
        };

        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            match self.store.insert_user(&user).await? {
                UserWrite::Inserted => {
                    info!(user_id = %user.id, referred = user.referred_by.is_some(), "profile created");
                    return Ok(user);
                }
                UserWrite::DuplicateId => {
                    return Err(LedgerError::UserConflict(format!("user {}", user.id)));
                }
                UserWrite::DuplicateEmail => {
                    return Err(LedgerError::UserConflict(format!("email {}", user.email)));
                }
                UserWrite::DuplicateReferralCode => {
                    debug!(code = %user.referral_code, "referral code taken, drawing another");
                    user.referral_code = (self.referral_codes)();
                }
            }
        }

        error!(user_id = %user.id, "referral codes kept colliding");
        Err(LedgerError::Storage(anyhow!(
            "could not allocate a unique referral code after {REFERRAL_CODE_ATTEMPTS} attempts"
        )))
    }

    pub async fn user(&self, id: Uuid) -> Result<User, LedgerError> {
        self.store
            .user(id)
            .await?
            .ok_or(LedgerError::UserNotFound(id))
    }
}
