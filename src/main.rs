use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use bundle_ledger::{
    AppState, Config,
    gateway::PaystackGateway,
    init_pool, init_router,
    store::postgres::PgLedgerStore,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = init_pool(&config.database_url).await?;
    let store = PgLedgerStore::new(pool);
    store.migrate().await?;
    store.seed_settings(config.default_price_per_gb).await?;

    let gateway = PaystackGateway::new(config.gateway())?;
    let app_state = AppState::new(
        Arc::new(store),
        Arc::new(gateway),
        config.operator_token.clone(),
        config.referral_reward_percent,
    )
    .with_webhook_secret(config.webhook_secret());

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;

    let app = init_router(app_state);

    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
