//! Order settlement and wallet ledger for a mobile-data bundle storefront.
//!
//! Orders are paid either from a prepaid wallet or through an external
//! payment gateway. Every balance change is recorded as a ledger entry, and
//! gateway settlements are idempotent under duplicate webhooks and manual
//! verification.

pub mod accounts;
pub mod api;
pub mod config;
pub mod error;
pub mod fulfillment;
pub mod gateway;
pub mod orders;
pub mod polling;
pub mod pricing;
pub mod reconcile;
pub mod responses;
pub mod retry;
pub mod store;
pub mod types;
pub mod wallet;

use anyhow::Context;
use anyhow::Result;
use sqlx::{PgPool, postgres::PgPoolOptions};

pub use crate::api::{AppState, init_router};
pub use crate::config::Config;
pub use crate::error::LedgerError;

/// Initializes the database pool.
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}
