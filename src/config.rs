use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::gateway::GatewayConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    pub gateway_timeout_ms: u64,
    /// Shared secret operator tooling presents in `x-operator-token`.
    pub operator_token: String,
    /// Seeds the settings row on first start.
    pub default_price_per_gb: Decimal,
    pub referral_reward_percent: Decimal,
    /// Require a valid `x-paystack-signature` on webhook deliveries, keyed
    /// by the gateway secret.
    pub verify_webhook_signatures: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("gateway_base_url", "https://api.paystack.co")?
            .set_default("gateway_timeout_ms", 10_000)?
            .set_default("default_price_per_gb", "6")?
            .set_default("referral_reward_percent", "10")?
            .set_default("verify_webhook_signatures", true)?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }

    /// The secret webhook signatures are checked against, if checking is on.
    pub fn webhook_secret(&self) -> Option<String> {
        self.verify_webhook_signatures
            .then(|| self.gateway_secret_key.clone())
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.gateway_base_url.clone(),
            secret_key: self.gateway_secret_key.clone(),
            timeout: Duration::from_millis(self.gateway_timeout_ms),
        }
    }
}
