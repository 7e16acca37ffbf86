use std::sync::Arc;

use bundle_ledger::accounts::NewUser;
use bundle_ledger::gateway::ScriptedGateway;
use bundle_ledger::orders::NewOrder;
use bundle_ledger::reconcile::{CHARGE_SUCCESS_EVENT, Settlement, WebhookData, WebhookEvent, WebhookOutcome};
use bundle_ledger::store::LedgerStore;
use bundle_ledger::store::memory::InMemoryLedgerStore;
use bundle_ledger::types::{
    DeliveryStatus, EntrySource, Network, Order, PaymentMethod, PaymentStatus, TransactionType, User,
};
use bundle_ledger::{AppState, LedgerError};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Shop {
    app: AppState,
    store: Arc<InMemoryLedgerStore>,
    gateway: ScriptedGateway,
}

fn shop() -> Shop {
    let store = Arc::new(InMemoryLedgerStore::new());
    let gateway = ScriptedGateway::new();
    let app = AppState::new(store.clone(), Arc::new(gateway.clone()), "op-secret", dec!(10));
    Shop { app, store, gateway }
}

impl Shop {
    async fn customer(&self, email: &str, referral_code: Option<&str>, balance: Decimal) -> User {
        let user = self
            .app
            .accounts
            .register(NewUser {
                id: None,
                email: email.into(),
                name: "Customer".into(),
                phone: Some("0241112222".into()),
                referral_code: referral_code.map(Into::into),
            })
            .await
            .unwrap();
        if balance > Decimal::ZERO {
            self.app.wallet.manual_top_up(user.id, balance).await.unwrap();
        }
        self.app.accounts.user(user.id).await.unwrap()
    }

    async fn buy(&self, user_id: Uuid, bundle_gb: u32, payment_method: PaymentMethod) -> Result<Order, LedgerError> {
        self.app
            .orders
            .create_order(NewOrder {
                user_id,
                network: Network::Mtn,
                bundle_gb,
                phone: "0549876543".into(),
                payment_method,
            })
            .await
    }

    async fn wallet_entries_sum(&self, user_id: Uuid) -> Decimal {
        self.store
            .transactions(user_id)
            .await
            .unwrap()
            .iter()
            .filter(|t| t.source == EntrySource::Wallet)
            .map(|t| t.amount)
            .sum()
    }
}

fn charge_success(reference: &str) -> WebhookEvent {
    WebhookEvent {
        event: CHARGE_SUCCESS_EVENT.into(),
        data: WebhookData {
            reference: reference.into(),
            amount: 0,
            status: "success".into(),
        },
    }
}

#[tokio::test]
async fn test_wallet_purchase_debits_and_records_one_entry() {
    let shop = shop();
    let user = shop.customer("ama@example.com", None, dec!(50)).await;

    let order = shop.buy(user.id, 5, PaymentMethod::Wallet).await.unwrap();

    assert_eq!(order.amount, dec!(30));
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert!(order.payment_ref.starts_with("ORD-"));
    assert_eq!(shop.app.wallet.balance(user.id).await.unwrap(), dec!(20));

    let purchases: Vec<_> = shop
        .store
        .transactions(user.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionType::Purchase)
        .collect();
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].amount, dec!(-30));
    assert_eq!(purchases[0].reference, order.purchase_reference());
    assert_eq!(shop.wallet_entries_sum(user.id).await, dec!(20));
}

#[tokio::test]
async fn test_insufficient_balance_creates_nothing() {
    let shop = shop();
    let user = shop.customer("kwame@example.com", None, dec!(20)).await;

    let result = shop.buy(user.id, 10, PaymentMethod::Wallet).await;

    assert!(matches!(
        result,
        Err(LedgerError::InsufficientFunds { required, available })
            if required == dec!(60) && available == dec!(20)
    ));
    assert_eq!(shop.app.wallet.balance(user.id).await.unwrap(), dec!(20));
    assert!(shop.app.orders.orders(Some(user.id)).await.unwrap().is_empty());
    assert_eq!(shop.store.transactions(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_webhook_settles_once_and_leaves_wallet_alone() {
    let shop = shop();
    let user = shop.customer("efua@example.com", None, dec!(20)).await;
    let order = shop.buy(user.id, 5, PaymentMethod::Gateway).await.unwrap();
    shop.gateway.approve(&order.payment_ref, dec!(30)).await;

    let first = shop.app.reconciliation.handle_webhook(charge_success(&order.payment_ref)).await.unwrap();
    let second = shop.app.reconciliation.handle_webhook(charge_success(&order.payment_ref)).await.unwrap();

    assert!(matches!(first, WebhookOutcome::Processed(ref o) if o.is_paid()));
    assert!(matches!(second, WebhookOutcome::AlreadyProcessed(ref o) if o.id == order.id));

    let entries: Vec<_> = shop
        .store
        .transactions(user.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionType::Purchase)
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, dec!(-30));
    assert_eq!(entries[0].source, EntrySource::Gateway);

    assert_eq!(shop.app.orders.order(order.id).await.unwrap().payment_status, PaymentStatus::Paid);
    assert_eq!(shop.app.wallet.balance(user.id).await.unwrap(), dec!(20));
    assert_eq!(shop.wallet_entries_sum(user.id).await, dec!(20));
}

#[tokio::test]
async fn test_webhook_and_manual_verify_converge() {
    let shop = shop();
    let user = shop.customer("kojo@example.com", None, Decimal::ZERO).await;
    let order = shop.buy(user.id, 2, PaymentMethod::Gateway).await.unwrap();
    shop.gateway.approve(&order.payment_ref, dec!(12)).await;

    let manual = shop.app.reconciliation.verify_and_complete(&order.payment_ref).await.unwrap();
    let hook = shop.app.reconciliation.handle_webhook(charge_success(&order.payment_ref)).await.unwrap();

    assert!(matches!(manual, Settlement::Settled(_)));
    assert!(matches!(hook, WebhookOutcome::AlreadyProcessed(_)));
    assert_eq!(shop.store.transactions(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_top_up_adds_to_balance() {
    let shop = shop();
    let user = shop.customer("akosua@example.com", None, dec!(20)).await;

    shop.gateway.approve("PAY-card-25", dec!(25)).await;
    let top_up = shop.app.wallet.top_up(user.id, dec!(25), "PAY-card-25").await.unwrap();

    assert_eq!(top_up.balance, dec!(45));
    assert_eq!(top_up.entry.kind, TransactionType::Topup);
    assert_eq!(shop.app.wallet.balance(user.id).await.unwrap(), dec!(45));
    assert_eq!(shop.wallet_entries_sum(user.id).await, dec!(45));
}

#[tokio::test]
async fn test_price_change_does_not_touch_existing_orders() {
    let shop = shop();
    let user = shop.customer("yaa@example.com", None, Decimal::ZERO).await;
    let order = shop.buy(user.id, 5, PaymentMethod::Gateway).await.unwrap();
    assert_eq!(order.amount, dec!(30));

    shop.app.pricing.set_price_per_unit(dec!(8)).await.unwrap();
    shop.gateway.approve(&order.payment_ref, dec!(30)).await;

    let settled = shop.app.reconciliation.verify_and_complete(&order.payment_ref).await.unwrap();
    assert_eq!(settled.order().amount, dec!(30));

    let entries = shop.store.transactions(user.id).await.unwrap();
    assert_eq!(entries[0].amount, dec!(-30));

    let next = shop.buy(user.id, 5, PaymentMethod::Gateway).await.unwrap();
    assert_eq!(next.amount, dec!(40));
}

#[tokio::test]
async fn test_fulfilment_requires_payment() {
    let shop = shop();
    let user = shop.customer("nana@example.com", None, Decimal::ZERO).await;
    let order = shop.buy(user.id, 1, PaymentMethod::Gateway).await.unwrap();

    assert!(matches!(
        shop.app.fulfillment.fulfill_order(order.id).await,
        Err(LedgerError::OrderNotPaid(id)) if id == order.id
    ));
    assert_eq!(
        shop.app.orders.order(order.id).await.unwrap().delivery_status,
        DeliveryStatus::Pending
    );

    shop.gateway.approve(&order.payment_ref, dec!(6)).await;
    shop.app.reconciliation.verify_and_complete(&order.payment_ref).await.unwrap();
    let delivered = shop.app.fulfillment.fulfill_order(order.id).await.unwrap();
    assert_eq!(delivered.delivery_status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn test_referrer_is_rewarded_once_per_paid_order() {
    let shop = shop();
    shop.app.pricing.set_referrals_enabled(true).await.unwrap();
    let referrer = shop.customer("kofi@example.com", None, Decimal::ZERO).await;
    let friend = shop
        .customer("adjoa@example.com", Some(referrer.referral_code.as_str()), dec!(50))
        .await;
    assert_eq!(friend.referred_by, Some(referrer.id));

    let wallet_order = shop.buy(friend.id, 5, PaymentMethod::Wallet).await.unwrap();
    assert_eq!(shop.app.wallet.balance(referrer.id).await.unwrap(), dec!(3));

    let gateway_order = shop.buy(friend.id, 2, PaymentMethod::Gateway).await.unwrap();
    shop.gateway.approve(&gateway_order.payment_ref, dec!(12)).await;
    for _ in 0..3 {
        shop.app
            .reconciliation
            .handle_webhook(charge_success(&gateway_order.payment_ref))
            .await
            .unwrap();
    }

    let rewards: Vec<_> = shop
        .store
        .transactions(referrer.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionType::Reward)
        .collect();
    assert_eq!(rewards.len(), 2);
    assert!(rewards.iter().any(|r| r.reference == wallet_order.reward_reference()));
    assert!(rewards.iter().any(|r| r.reference == gateway_order.reward_reference()));
    assert_eq!(shop.app.wallet.balance(referrer.id).await.unwrap(), dec!(4.20));
    assert_eq!(shop.wallet_entries_sum(referrer.id).await, dec!(4.20));
}

#[tokio::test]
async fn test_no_reward_while_programme_disabled() {
    let shop = shop();
    let referrer = shop.customer("fiifi@example.com", None, Decimal::ZERO).await;
    let friend = shop
        .customer("esi@example.com", Some(referrer.referral_code.as_str()), dec!(10))
        .await;

    shop.buy(friend.id, 1, PaymentMethod::Wallet).await.unwrap();

    assert_eq!(shop.app.wallet.balance(referrer.id).await.unwrap(), Decimal::ZERO);
    assert!(shop.store.transactions(referrer.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_and_credits_keep_ledger_consistent() {
    let shop = Arc::new(shop());
    let user = shop.customer("edem@example.com", None, dec!(30)).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let shop = shop.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                shop.buy(user.id, 1, PaymentMethod::Wallet).await.map(|_| ())
            } else {
                shop.app.wallet.manual_top_up(user.id, dec!(5)).await.map(|_| ())
            }
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(())
            | Err(LedgerError::InsufficientFunds { .. })
            | Err(LedgerError::ConcurrencyConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let balance = shop.app.wallet.balance(user.id).await.unwrap();
    assert!(balance >= Decimal::ZERO);
    assert_eq!(balance, shop.wallet_entries_sum(user.id).await);

    let paid_orders = shop
        .app
        .orders
        .orders(Some(user.id))
        .await
        .unwrap()
        .into_iter()
        .filter(Order::is_paid)
        .count();
    let purchases = shop
        .store
        .transactions(user.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionType::Purchase)
        .count();
    assert_eq!(paid_orders, purchases);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_webhooks_write_a_single_entry() {
    let shop = Arc::new(shop());
    let user = shop.customer("selasi@example.com", None, Decimal::ZERO).await;
    let order = shop.buy(user.id, 3, PaymentMethod::Gateway).await.unwrap();
    shop.gateway.approve(&order.payment_ref, dec!(18)).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let shop = shop.clone();
        let reference = order.payment_ref.clone();
        handles.push(tokio::spawn(async move {
            shop.app.reconciliation.handle_webhook(charge_success(&reference)).await
        }));
    }

    let mut processed = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            WebhookOutcome::Processed(_) => processed += 1,
            WebhookOutcome::AlreadyProcessed(_) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(shop.store.transactions(user.id).await.unwrap().len(), 1);
    assert!(shop.app.orders.order(order.id).await.unwrap().is_paid());
}
