//! The card / mobile-money gateway's verification API.
//!
//! Webhook payloads are never trusted on their own; every settlement asks the
//! gateway to confirm the charge first.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway misconfigured: {0}")]
    Config(String),
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected gateway response: {0}")]
    Unexpected(String),
}

/// The gateway's verdict on a charge.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// The charge exists and completed.
    pub success: bool,
    /// The charged amount in major currency units.
    pub amount: Decimal,
    /// The gateway's own status string, e.g. `success` or `abandoned`.
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn verify(&self, reference: &str) -> Result<Verification, GatewayError>;
}

pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout: Duration,
}

/// A Paystack-compatible verification client.
pub struct PaystackGateway {
    client: Client,
    config: GatewayConfig,
}

#[derive(Deserialize)]
struct VerifyResponse {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<VerifyData>,
}

#[derive(Deserialize)]
struct VerifyData {
    status: String,
    /// Minor units (pesewas).
    amount: i64,
}

impl PaystackGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.secret_key.is_empty() {
            return Err(GatewayError::Config("secret key not configured".into()));
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    async fn verify(&self, reference: &str) -> Result<Verification, GatewayError> {
        let url = format!(
            "{}/transaction/verify/{}",
            self.config.base_url.trim_end_matches('/'),
            reference
        );
        debug!(%reference, "verifying charge with gateway");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        if response.status().is_server_error() {
            return Err(GatewayError::Unexpected(format!(
                "verification returned {}",
                response.status()
            )));
        }

        let body: VerifyResponse = response.json().await?;
        match body.data {
            Some(data) if body.status => Ok(Verification {
                success: data.status == "success",
                amount: minor_to_major(data.amount),
                status: data.status,
            }),
            _ => {
                warn!(%reference, message = %body.message, "gateway did not confirm the charge");
                Ok(Verification {
                    success: false,
                    amount: Decimal::ZERO,
                    status: body.message,
                })
            }
        }
    }
}

/// Converts gateway minor units into major units.
pub fn minor_to_major(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

#[derive(Clone)]
enum Script {
    Answer(Verification),
    Unreachable,
}

/// A gateway double answering from canned verifications.
///
/// Unknown references verify as failed.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    scripts: Arc<RwLock<HashMap<String, Script>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `reference` verify as a successful charge of `amount`.
    pub async fn approve(&self, reference: &str, amount: Decimal) {
        self.script(
            reference,
            Script::Answer(Verification {
                success: true,
                amount,
                status: "success".to_string(),
            }),
        )
        .await;
    }

    /// Makes `reference` verify as a failed charge.
    pub async fn decline(&self, reference: &str) {
        self.script(
            reference,
            Script::Answer(Verification {
                success: false,
                amount: Decimal::ZERO,
                status: "failed".to_string(),
            }),
        )
        .await;
    }

    /// Makes verifying `reference` fail as if the gateway were down.
    pub async fn fail(&self, reference: &str) {
        self.script(reference, Script::Unreachable).await;
    }

    async fn script(&self, reference: &str, script: Script) {
        self.scripts
            .write()
            .await
            .insert(reference.to_string(), script);
    }

    /// How many verifications have been requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn verify(&self, reference: &str) -> Result<Verification, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripts = self.scripts.read().await;
        match scripts.get(reference) {
            Some(Script::Answer(verification)) => Ok(verification.clone()),
            Some(Script::Unreachable) => Err(GatewayError::Unexpected(format!(
                "verification of {reference} timed out"
            ))),
            None => Ok(Verification {
                success: false,
                amount: Decimal::ZERO,
                status: "not_found".to_string(),
            }),
        }
    }
}
