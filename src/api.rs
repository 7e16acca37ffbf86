use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, warn};
use uuid::Uuid;

use crate::accounts::{AccountService, NewUser};
use crate::error::{ApiError, ApiErrorWithMeta, E_ORDER_NOT_FOUND, E_UNAUTHORIZED, E_VERIFICATION_FAILED};
use crate::fulfillment::FulfillmentGate;
use crate::gateway::PaymentGatewayRef;
use crate::orders::{NewOrder, OrderService};
use crate::pricing::PricingOracle;
use crate::reconcile::{
    ReconciliationService, SIGNATURE_HEADER, Settlement, WebhookEvent, WebhookOutcome,
    verify_signature,
};
use crate::responses::{ApiOk, RequestMeta, meta_middleware, new_meta};
use crate::store::LedgerStoreRef;
use crate::types::{CURRENCY, Order, Settings, Transaction, User};
use crate::wallet::{TopUp, WalletService, WalletSummary};

/// The header operator tooling authenticates with.
pub const OPERATOR_TOKEN_HEADER: &str = "x-operator-token";

/// The application state.
#[derive(Clone)]
pub struct AppState {
    pub accounts: AccountService,
    pub orders: OrderService,
    pub reconciliation: ReconciliationService,
    pub fulfillment: FulfillmentGate,
    pub wallet: WalletService,
    pub pricing: PricingOracle,
    /// The token operator routes require.
    pub operator_token: String,
    /// When set, webhook deliveries must be signed with this secret.
    pub webhook_secret: Option<String>,
}

impl AppState {
    /// Wires every service over one store and one gateway.
    pub fn new(
        store: LedgerStoreRef,
        gateway: PaymentGatewayRef,
        operator_token: impl Into<String>,
        referral_reward_percent: Decimal,
    ) -> Self {
        let pricing = PricingOracle::new(store.clone());
        let wallet = WalletService::new(
            store.clone(),
            gateway.clone(),
            pricing.clone(),
            referral_reward_percent,
        );
        Self {
            accounts: AccountService::new(store.clone()),
            orders: OrderService::new(store.clone(), pricing.clone(), wallet.clone()),
            reconciliation: ReconciliationService::new(store.clone(), gateway, wallet.clone()),
            fulfillment: FulfillmentGate::new(store),
            wallet,
            pricing,
            operator_token: operator_token.into(),
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.filter(|s| !s.is_empty());
        self
    }
}

/// The request to top up a wallet from a gateway charge.
#[derive(Deserialize)]
pub struct TopUpRequest {
    pub amount: Decimal,
    /// The gateway reference of the charge that funded the top-up.
    pub reference: String,
}

/// An operator credit, made without a gateway charge.
#[derive(Deserialize)]
pub struct CreditRequest {
    pub amount: Decimal,
}

/// The filter for listing orders.
#[derive(Deserialize)]
pub struct OrdersQuery {
    pub user_id: Option<Uuid>,
}

/// The response after a verify-and-complete call.
#[derive(Serialize)]
pub struct VerifyResponse {
    pub order: Order,
    /// True when the order had already been paid before this call.
    pub already_settled: bool,
}

/// The response after a webhook delivery.
#[derive(Serialize)]
pub struct WebhookResponse {
    pub outcome: &'static str,
    pub order_id: Option<Uuid>,
}

/// The request to change the price per GB.
#[derive(Deserialize)]
pub struct SetPriceRequest {
    pub price_per_gb: Decimal,
}

/// The request to toggle the referral programme.
#[derive(Deserialize)]
pub struct SetReferralsRequest {
    pub enabled: bool,
}

/// The current price per GB.
#[derive(Serialize)]
pub struct PriceResponse {
    pub price_per_gb: Decimal,
    pub currency: &'static str,
    pub version: i64,
}

impl From<Settings> for PriceResponse {
    fn from(s: Settings) -> Self {
        Self {
            price_per_gb: s.price_per_gb,
            currency: CURRENCY,
            version: s.version,
        }
    }
}

/// The referral programme switch.
#[derive(Serialize)]
pub struct ReferralsResponse {
    pub enabled: bool,
    pub version: i64,
}

impl From<Settings> for ReferralsResponse {
    fn from(s: Settings) -> Self {
        Self {
            enabled: s.referrals_enabled,
            version: s.version,
        }
    }
}

pub fn init_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/settings/price",
            get(get_price_handler).put(set_price_handler),
        )
        .route(
            "/settings/referrals",
            get(get_referrals_handler).put(set_referrals_handler),
        )
        .route("/orders", get(list_all_orders_handler))
        .route("/orders/{id}/fulfil", post(fulfil_order_handler))
        .route("/users/{id}/credits", post(credit_wallet_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/users", post(register_user_handler))
        .route("/users/{id}", get(get_user_handler))
        .route("/users/{id}/wallet", get(get_wallet_handler))
        .route("/users/{id}/transactions", get(list_transactions_handler))
        .route("/users/{id}/topups", post(top_up_handler))
        .route("/orders", post(create_order_handler).get(list_orders_handler))
        .route("/orders/{id}", get(get_order_handler))
        .route("/payments/{reference}/verify", post(verify_payment_handler))
        .route("/webhooks/gateway", post(webhook_handler))
        .nest("/admin", admin)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn require_operator(State(st): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let presented = req
        .headers()
        .get(OPERATOR_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    if !st.operator_token.is_empty() && presented == Some(st.operator_token.as_str()) {
        return next.run(req).await;
    }

    let meta = req
        .extensions()
        .get::<RequestMeta>()
        .cloned()
        .unwrap_or_else(new_meta);
    ApiError::Unauthorized("operator token required".into())
        .with_meta(meta)
        .with_code(E_UNAUTHORIZED)
        .into_response()
}

async fn register_user_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewUser>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = st
        .accounts
        .register(req)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::created("user registered", user, meta))
}

async fn get_user_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = st
        .accounts
        .user(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("user fetched", user, meta))
}

async fn get_wallet_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<WalletSummary>, ApiErrorWithMeta> {
    let summary = st
        .wallet
        .summary(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("wallet fetched", summary, meta))
}

async fn list_transactions_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Transaction>>, ApiErrorWithMeta> {
    let transactions = st
        .wallet
        .transactions(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("transactions fetched", transactions, meta))
}

async fn top_up_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<TopUpRequest>,
) -> Result<ApiOk<TopUp>, ApiErrorWithMeta> {
    let top_up = st
        .wallet
        .top_up(id, req.amount, &req.reference)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    if top_up.replayed {
        Ok(ApiOk::ok("top-up already credited", top_up, meta))
    } else {
        Ok(ApiOk::created("wallet topped up", top_up, meta))
    }
}

async fn credit_wallet_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreditRequest>,
) -> Result<ApiOk<TopUp>, ApiErrorWithMeta> {
    let top_up = st
        .wallet
        .manual_top_up(id, req.amount)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::created("wallet credited", top_up, meta))
}

async fn create_order_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewOrder>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = st
        .orders
        .create_order(req)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::created("order created", order, meta))
}

async fn list_orders_handler(
    State(st): State<AppState>,
    Query(query): Query<OrdersQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Order>>, ApiErrorWithMeta> {
    let orders = st
        .orders
        .orders(query.user_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("orders fetched", orders, meta))
}

async fn get_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = st
        .orders
        .order(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("order fetched", order, meta))
}

async fn verify_payment_handler(
    State(st): State<AppState>,
    Path(reference): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<VerifyResponse>, ApiErrorWithMeta> {
    let settlement = st
        .reconciliation
        .verify_and_complete(&reference)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    let already_settled = matches!(settlement, Settlement::AlreadySettled(_));
    let order = settlement.order().clone();
    Ok(ApiOk::ok(
        "payment verified",
        VerifyResponse {
            order,
            already_settled,
        },
        meta,
    ))
}

async fn webhook_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiOk<WebhookResponse>, ApiErrorWithMeta> {
    if let Some(secret) = st.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            warn!(request_id = %meta.request_id, "rejecting webhook with a bad signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".into())
                .with_meta(meta)
                .with_code(E_UNAUTHORIZED));
        }
    }

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        ApiError::BadRequest(format!("malformed webhook body: {e}")).with_meta(meta.clone())
    })?;

    let outcome = st
        .reconciliation
        .handle_webhook(event)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    let (message, outcome, order_id) = match outcome {
        WebhookOutcome::Processed(order) => ("payment verified successfully", "processed", Some(order.id)),
        WebhookOutcome::AlreadyProcessed(order) => {
            ("payment already verified", "already_processed", Some(order.id))
        }
        WebhookOutcome::Ignored => ("event not handled", "ignored", None),
        WebhookOutcome::NotFound => {
            return Err(ApiError::NotFound("order not found".into())
                .with_meta(meta)
                .with_code(E_ORDER_NOT_FOUND));
        }
        WebhookOutcome::VerificationFailed(reason) => {
            return Err(ApiError::BadRequest(format!("payment verification failed: {reason}"))
                .with_meta(meta)
                .with_code(E_VERIFICATION_FAILED));
        }
    };

    Ok(ApiOk::ok(message, WebhookResponse { outcome, order_id }, meta))
}

async fn get_price_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PriceResponse>, ApiErrorWithMeta> {
    let settings = st
        .pricing
        .settings()
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("price fetched", settings.into(), meta))
}

async fn set_price_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<SetPriceRequest>,
) -> Result<ApiOk<PriceResponse>, ApiErrorWithMeta> {
    let settings = st
        .pricing
        .set_price_per_unit(req.price_per_gb)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("price updated", settings.into(), meta))
}

async fn get_referrals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ReferralsResponse>, ApiErrorWithMeta> {
    let settings = st
        .pricing
        .settings()
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("referral setting fetched", settings.into(), meta))
}

async fn set_referrals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<SetReferralsRequest>,
) -> Result<ApiOk<ReferralsResponse>, ApiErrorWithMeta> {
    let settings = st
        .pricing
        .set_referrals_enabled(req.enabled)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("referral setting updated", settings.into(), meta))
}

async fn list_all_orders_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Order>>, ApiErrorWithMeta> {
    let orders = st
        .orders
        .orders(None)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("orders fetched", orders, meta))
}

async fn fulfil_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = st
        .fulfillment
        .fulfill_order(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("order fulfilled", order, meta))
}
