use std::sync::Arc;
use std::time::Duration;

use bundle_ledger::accounts::NewUser;
use bundle_ledger::gateway::ScriptedGateway;
use bundle_ledger::orders::NewOrder;
use bundle_ledger::polling::{POLL_TIMEOUT, PaymentPoller, PollOutcome};
use bundle_ledger::store::memory::InMemoryLedgerStore;
use bundle_ledger::types::{Network, Order, PaymentMethod, PaymentStatus};
use bundle_ledger::{AppState, LedgerError};
use rust_decimal_macros::dec;
use tokio::time::Instant;
use uuid::Uuid;

async fn pending_order() -> (AppState, ScriptedGateway, Order) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let gateway = ScriptedGateway::new();
    let app = AppState::new(store, Arc::new(gateway.clone()), "op-secret", dec!(10));

    let user = app
        .accounts
        .register(NewUser {
            id: None,
            email: "poller@example.com".into(),
            name: "Poller".into(),
            phone: None,
            referral_code: None,
        })
        .await
        .unwrap();
    let order = app
        .orders
        .create_order(NewOrder {
            user_id: user.id,
            network: Network::Telecel,
            bundle_gb: 4,
            phone: "0201112222".into(),
            payment_method: PaymentMethod::Gateway,
        })
        .await
        .unwrap();

    (app, gateway, order)
}

#[tokio::test(start_paused = true)]
async fn test_poller_sees_settlement() {
    let (app, gateway, order) = pending_order().await;
    gateway.approve(&order.payment_ref, dec!(24)).await;

    let settler = app.clone();
    let reference = order.payment_ref.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        settler.reconciliation.verify_and_complete(&reference).await.unwrap();
    });

    let started = Instant::now();
    let outcome = PaymentPoller::new(app.orders.clone())
        .await_settlement(order.id)
        .await
        .unwrap();

    match outcome {
        PollOutcome::Paid(paid) => assert_eq!(paid.id, order.id),
        other => panic!("expected paid, got {other:?}"),
    }
    assert!(started.elapsed() < POLL_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_poller_times_out_without_failing_the_order() {
    let (app, _, order) = pending_order().await;

    let started = Instant::now();
    let outcome = PaymentPoller::new(app.orders.clone())
        .with_interval(Duration::from_secs(1))
        .with_timeout(Duration::from_secs(10))
        .await_settlement(order.id)
        .await
        .unwrap();

    assert!(matches!(outcome, PollOutcome::TimedOut(ref o) if o.id == order.id));
    assert!(started.elapsed() >= Duration::from_secs(10));

    let stored = app.orders.order(order.id).await.unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_poller_unknown_order() {
    let (app, _, _) = pending_order().await;

    assert!(matches!(
        PaymentPoller::new(app.orders.clone())
            .await_settlement(Uuid::new_v4())
            .await,
        Err(LedgerError::OrderNotFound(_))
    ));
}
