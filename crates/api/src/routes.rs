use crate::actions::*;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tradebot_core::{Event, Subscription, Ticker, Token, Trade, TraderStats, User};
use uuid::Uuid;

type Params<T> = Result<Json<T>, JsonRejection>;

/// One `POST` route per operation, named as clients call it.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Diagnostics
        .route("/echo", post(echo))
        .route("/ping", post(ping))
        .route("/getTicker", post(get_ticker))
        // Accounts
        .route("/me", post(me))
        .route("/changeMyUsername", post(change_my_username))
        .route("/registerUsername", post(register_username))
        .route("/listUsers", post(list_users))
        .route("/listMyTokens", post(list_my_tokens))
        // Events, trades, stats
        .route("/listTraders", post(list_traders))
        .route("/consumeEvent", post(consume_event))
        .route("/listMyTrades", post(list_my_trades))
        .route("/listMyEvents", post(list_my_events))
        .route("/listMyProviderEvents", post(list_my_provider_events))
        .route("/listMyProviderTrades", post(list_my_provider_trades))
        .route("/listMyProviderStats", post(list_my_provider_stats))
        .route("/getMyStats", post(get_my_stats))
        // Providers
        .route("/listProviders", post(list_providers))
        .route("/listMyProviders", post(list_my_providers))
        .route("/createProvider", post(create_provider))
        // Subscriptions
        .route("/createSubscription", post(create_subscription))
        .route("/listMySubscriptions", post(list_my_subscriptions))
        .route("/isSubscribed", post(is_subscribed))
        .route("/cancelSubscription", post(cancel_subscription))
        .route("/transferSubscription", post(transfer_subscription))
}

// ---------------------------------------------------------------------------
// Health & diagnostics
// ---------------------------------------------------------------------------

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn echo(State(state): State<Arc<AppState>>, payload: Params<Value>) -> ApiResult<Json<Value>> {
    let Json(payload) = payload?;
    Ok(Json(state.actions.echo(payload).await))
}

async fn ping(State(state): State<Arc<AppState>>) -> Json<&'static str> {
    Json(state.actions.ping().await)
}

async fn get_ticker(State(state): State<Arc<AppState>>) -> ApiResult<Json<Ticker>> {
    Ok(Json(state.actions.get_ticker().await?))
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

async fn me(State(state): State<Arc<AppState>>, params: Params<TokenParams>) -> ApiResult<Json<User>> {
    let Json(params) = params?;
    Ok(Json(state.actions.me(params).await?))
}

async fn change_my_username(
    State(state): State<Arc<AppState>>,
    params: Params<UsernameParams>,
) -> ApiResult<Json<User>> {
    let Json(params) = params?;
    Ok(Json(state.actions.change_my_username(params).await?))
}

async fn register_username(
    State(state): State<Arc<AppState>>,
    params: Params<UsernameParams>,
) -> ApiResult<Json<Registration>> {
    let Json(params) = params?;
    Ok(Json(state.actions.register_username(params).await?))
}

async fn list_users(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.actions.list_users().await?))
}

async fn list_my_tokens(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<Vec<Token>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_tokens(params).await?))
}

// ---------------------------------------------------------------------------
// Events, trades, stats
// ---------------------------------------------------------------------------

async fn list_traders(State(state): State<Arc<AppState>>) -> Json<Vec<Uuid>> {
    Json(state.actions.list_traders().await)
}

async fn consume_event(
    State(state): State<Arc<AppState>>,
    params: Params<ConsumeEventParams>,
) -> ApiResult<Json<Event>> {
    let Json(params) = params?;
    Ok(Json(state.actions.consume_event(params).await?))
}

async fn list_my_trades(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<Vec<Trade>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_trades(params).await?))
}

async fn list_my_events(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_events(params).await?))
}

async fn list_my_provider_events(
    State(state): State<Arc<AppState>>,
    params: Params<ProviderParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_provider_events(params).await?))
}

async fn list_my_provider_trades(
    State(state): State<Arc<AppState>>,
    params: Params<ProviderParams>,
) -> ApiResult<Json<Vec<Trade>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_provider_trades(params).await?))
}

async fn list_my_provider_stats(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<Vec<WithStats<User>>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_provider_stats(params).await?))
}

async fn get_my_stats(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<TraderStats>> {
    let Json(params) = params?;
    Ok(Json(state.actions.get_my_stats(params).await?))
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

async fn list_providers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<WithStats<User>>>> {
    Ok(Json(state.actions.list_providers().await?))
}

async fn list_my_providers(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<Vec<WithStats<User>>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_providers(params).await?))
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    params: Params<CreateProviderParams>,
) -> ApiResult<Json<ProviderRegistration>> {
    let Json(params) = params?;
    Ok(Json(state.actions.create_provider(params).await?))
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    params: Params<ProviderParams>,
) -> ApiResult<Json<Subscription>> {
    let Json(params) = params?;
    Ok(Json(state.actions.create_subscription(params).await?))
}

async fn list_my_subscriptions(
    State(state): State<Arc<AppState>>,
    params: Params<TokenParams>,
) -> ApiResult<Json<Vec<WithStats<Subscription>>>> {
    let Json(params) = params?;
    Ok(Json(state.actions.list_my_subscriptions(params).await?))
}

async fn is_subscribed(
    State(state): State<Arc<AppState>>,
    params: Params<ProviderParams>,
) -> ApiResult<Json<bool>> {
    let Json(params) = params?;
    Ok(Json(state.actions.is_subscribed(params).await?))
}

async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    params: Params<SubscriptionParams>,
) -> ApiResult<Json<Subscription>> {
    let Json(params) = params?;
    Ok(Json(state.actions.cancel_subscription(params).await?))
}

async fn transfer_subscription(
    State(state): State<Arc<AppState>>,
    params: Params<TransferParams>,
) -> ApiResult<Json<Subscription>> {
    let Json(params) = params?;
    Ok(Json(state.actions.transfer_subscription(params).await?))
}
