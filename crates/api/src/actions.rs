//! Request handlers behind the RPC surface.
//!
//! Each operation validates the caller's token, checks ownership where it
//! applies and delegates to a single collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use tradebot_core::*;
use tradebot_data::Stores;
use tradebot_engine::TraderRegistry;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

const DEFAULT_PROVIDER_DESCRIPTION: &str = "User Generated Provider Key.";

const INVALID_TOKEN: &str = "Your token has expired or is invalid.";
const EXPIRED_TOKEN: &str = "token is no longer valid";
const USERNAME_TAKEN: &str = "Another user already claimed this username.";
const NOT_YOUR_PROVIDER: &str = "provider does not belong to you.";
const NOT_YOUR_SUBSCRIPTION: &str = "You do not own this subscription.";

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TokenParams {
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsernameParams {
    pub token: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateProviderParams {
    pub token: Option<String>,
    pub username: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderParams {
    pub token: Option<String>,
    pub providerid: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionParams {
    pub token: Option<String>,
    pub subscriptionid: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransferParams {
    pub token: Option<String>,
    pub subscriptionid: Option<Uuid>,
    pub recipientid: Option<Uuid>,
}

/// An event as sent by a client: a token, an optional id and action, and
/// any other fields, which are stored as-is.
#[derive(Debug, Default, Deserialize)]
pub struct ConsumeEventParams {
    pub token: Option<String>,
    pub id: Option<Uuid>,
    pub action: Option<SignalAction>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub user: User,
    pub token: Token,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRegistration {
    pub provider: User,
    pub token: Token,
}

/// A record with the trader stats of the account it refers to.
#[derive(Debug, Clone, Serialize)]
pub struct WithStats<T> {
    #[serde(flatten)]
    pub record: T,
    pub stats: TraderStats,
}

/// Records that can be decorated with trader stats.
pub trait StatsSubject {
    /// Account whose stats belong to this record.
    fn stats_id(&self) -> Uuid;
    fn updated(&self) -> DateTime<Utc>;
}

impl StatsSubject for User {
    fn stats_id(&self) -> Uuid {
        self.id
    }

    fn updated(&self) -> DateTime<Utc> {
        self.updated
    }
}

impl StatsSubject for Subscription {
    fn stats_id(&self) -> Uuid {
        self.providerid
    }

    fn updated(&self) -> DateTime<Utc> {
        self.updated
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn required<'a>(value: Option<&'a str>, message: &str) -> ApiResult<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(message.to_string())),
    }
}

fn required_id(value: Option<Uuid>, message: &str) -> ApiResult<Uuid> {
    value.ok_or_else(|| ApiError::BadRequest(message.to_string()))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The request-handling facade over the platform's collaborators.
pub struct Actions {
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    trades: Arc<dyn TradeStore>,
    events: Arc<dyn EventStore>,
    ticker: Arc<dyn TickerSource>,
    traders: Arc<TraderRegistry>,
    /// Held while an event is stamped, stored and applied, so traders see
    /// events in `created` order.
    consume_lock: Mutex<()>,
}

impl Actions {
    pub fn new(stores: Stores, ticker: Arc<dyn TickerSource>, traders: Arc<TraderRegistry>) -> Self {
        Self {
            users: stores.users,
            tokens: stores.tokens,
            subscriptions: stores.subscriptions,
            trades: stores.trades,
            events: stores.events,
            ticker,
            traders,
            consume_lock: Mutex::new(()),
        }
    }

    /// Resolve a presented token to the account it acts for.
    async fn authenticate(&self, token: Option<&str>) -> ApiResult<Uuid> {
        let secret = required(token, "token required")?;
        let token = self.tokens.get(secret).await.map_err(|e| match e {
            StoreError::NotFound(_) => ApiError::Unauthorized(INVALID_TOKEN.to_string()),
            other => other.into(),
        })?;
        token
            .active_user()
            .ok_or_else(|| ApiError::Unauthorized(EXPIRED_TOKEN.to_string()))
    }

    /// Fetch a provider account and check the caller owns it.
    async fn owned_provider(&self, userid: Uuid, providerid: Option<Uuid>) -> ApiResult<User> {
        let providerid = required_id(providerid, "providerid required")?;
        let provider = self.users.get(providerid).await?;
        if !provider.is_owned_by(userid) {
            return Err(ApiError::Forbidden(NOT_YOUR_PROVIDER.to_string()));
        }
        Ok(provider)
    }

    /// Fetch a subscription and check the caller holds it.
    async fn owned_subscription(&self, userid: Uuid, id: Uuid) -> ApiResult<Subscription> {
        let sub = self.subscriptions.get(id).await?;
        if sub.userid != userid {
            return Err(ApiError::Forbidden(NOT_YOUR_SUBSCRIPTION.to_string()));
        }
        Ok(sub)
    }

    async fn claim_username(&self, username: &str) -> ApiResult<String> {
        let username = username.to_lowercase();
        if self.users.find_by_username(&username).await?.is_some() {
            return Err(ApiError::Conflict(USERNAME_TAKEN.to_string()));
        }
        Ok(username)
    }

    /// Attach trader stats to each record, most recently updated first.
    async fn merge_trader_stats<T: StatsSubject>(&self, list: Vec<T>) -> Vec<WithStats<T>> {
        let mut merged = Vec::with_capacity(list.len());
        for record in list {
            let stats = self.traders.stats_or_default(record.stats_id()).await;
            if stats.updated.is_none() {
                debug!(id = %record.stats_id(), "No trader state, using empty stats");
            }
            merged.push(WithStats { record, stats });
        }
        merged.sort_by(|a, b| b.record.updated().cmp(&a.record.updated()));
        merged
    }

    // -- Diagnostics ------------------------------------------------------

    pub async fn echo(&self, payload: Value) -> Value {
        payload
    }

    pub async fn ping(&self) -> &'static str {
        "ok"
    }

    pub async fn get_ticker(&self) -> ApiResult<Ticker> {
        Ok(self.ticker.ticker().await?)
    }

    // -- Accounts ---------------------------------------------------------

    pub async fn me(&self, params: TokenParams) -> ApiResult<User> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        Ok(self.users.get(userid).await?)
    }

    pub async fn change_my_username(&self, params: UsernameParams) -> ApiResult<User> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let username = required(params.username.as_deref(), "username required")?;
        let username = self.claim_username(username).await?;

        let user = self.users.update_username(userid, &username).await?;
        info!(user = %userid, %username, "Username changed");
        Ok(user)
    }

    pub async fn register_username(&self, params: UsernameParams) -> ApiResult<Registration> {
        let username = required(params.username.as_deref(), "username required")?;
        let username = self.claim_username(username).await?;

        let user = self.users.create(NewUser::user(username)).await?;
        let token = self
            .tokens
            .generate(TokenIssuer::Tradebot, AccountKind::User)
            .await?;
        let token = self.tokens.validate(&token.id, user.id).await?;

        info!(user = %user.id, username = %user.username, "User registered");
        Ok(Registration { user, token })
    }

    pub async fn list_users(&self) -> ApiResult<Vec<User>> {
        Ok(self.users.list_sorted().await?)
    }

    pub async fn list_my_tokens(&self, params: TokenParams) -> ApiResult<Vec<Token>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        Ok(self.tokens.list_by_user(userid).await?)
    }

    // -- Events, trades, stats ---------------------------------------------

    pub async fn list_traders(&self) -> Vec<Uuid> {
        self.traders.keys().await
    }

    pub async fn consume_event(&self, params: ConsumeEventParams) -> ApiResult<Event> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let ticker = self.ticker.ticker().await?;

        let _guard = self.consume_lock.lock().await;
        let event = Event::new(params.id, userid, params.action, ticker, params.fields);
        let Upserted { event, inserted } = self.events.upsert(event).await?;
        if !inserted {
            debug!(event = %event.id, "Event re-sent, fields refreshed");
            return Ok(event);
        }

        // The trader only advances once its closed trades are stored. On
        // failure the event is removed so a retry with the same id starts over.
        let (trader, trades) = self.traders.preview(&event).await;
        for trade in &trades {
            if let Err(e) = self.trades.insert(trade.clone()).await {
                error!(
                    user = %userid,
                    event = %event.id,
                    trade = %trade.id,
                    error = %e,
                    "Failed to store closed trade, rolling back event"
                );
                if let Err(rollback) = self.events.remove(event.id).await {
                    error!(event = %event.id, error = %rollback, "Event rollback failed");
                }
                return Err(e.into());
            }
            info!(
                user = %userid,
                side = trade.side.as_str(),
                return_pct = %trade.return_pct,
                "Trade closed"
            );
        }
        self.traders.commit(trader).await;

        Ok(event)
    }

    pub async fn list_my_trades(&self, params: TokenParams) -> ApiResult<Vec<Trade>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        Ok(self.trades.list_by_user(userid, SortOrder::Asc).await?)
    }

    pub async fn list_my_events(&self, params: TokenParams) -> ApiResult<Vec<Event>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        Ok(self.events.list_by_user(userid).await?)
    }

    pub async fn list_my_provider_events(&self, params: ProviderParams) -> ApiResult<Vec<Event>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let provider = self.owned_provider(userid, params.providerid).await?;
        Ok(self.events.list_by_user(provider.id).await?)
    }

    pub async fn list_my_provider_trades(&self, params: ProviderParams) -> ApiResult<Vec<Trade>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let provider = self.owned_provider(userid, params.providerid).await?;
        Ok(self.trades.list_by_user(provider.id, SortOrder::Desc).await?)
    }

    pub async fn list_my_provider_stats(
        &self,
        params: TokenParams,
    ) -> ApiResult<Vec<WithStats<User>>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let list = self.users.list_by_owner(userid).await?;
        Ok(self.merge_trader_stats(list).await)
    }

    pub async fn get_my_stats(&self, params: TokenParams) -> ApiResult<TraderStats> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        self.traders.get(userid).await.ok_or_else(|| {
            ApiError::NotFound("trader not found, you have no events recorded.".to_string())
        })
    }

    // -- Providers ----------------------------------------------------------

    pub async fn list_providers(&self) -> ApiResult<Vec<WithStats<User>>> {
        let list = self.users.list_by_kind(AccountKind::Provider).await?;
        Ok(self.merge_trader_stats(list).await)
    }

    pub async fn list_my_providers(&self, params: TokenParams) -> ApiResult<Vec<WithStats<User>>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let list = self
            .users
            .list_by_owner_and_kind(userid, AccountKind::Provider)
            .await?;
        Ok(self.merge_trader_stats(list).await)
    }

    pub async fn create_provider(
        &self,
        params: CreateProviderParams,
    ) -> ApiResult<ProviderRegistration> {
        let username = required(params.username.as_deref(), "username required")?;
        let userid = self.authenticate(params.token.as_deref()).await?;
        let username = self.claim_username(username).await?;
        let description = params
            .description
            .unwrap_or_else(|| DEFAULT_PROVIDER_DESCRIPTION.to_string());

        let provider = self
            .users
            .create(NewUser::provider(username, userid, description))
            .await?;

        // API token the provider pushes events with.
        let token = self
            .tokens
            .generate(TokenIssuer::User, AccountKind::Provider)
            .await?;
        let token = self.tokens.validate(&token.id, provider.id).await?;

        info!(owner = %userid, provider = %provider.id, "Provider created");
        Ok(ProviderRegistration { provider, token })
    }

    // -- Subscriptions --------------------------------------------------------

    pub async fn create_subscription(&self, params: ProviderParams) -> ApiResult<Subscription> {
        let providerid = required_id(params.providerid, "providerid required")?;
        let userid = self.authenticate(params.token.as_deref()).await?;

        let provider = self.users.get(providerid).await?;
        if provider.is_owned_by(userid) || provider.id == userid {
            return Err(ApiError::Forbidden(
                "You cannot subscribe to this provider.".to_string(),
            ));
        }
        if !provider.is_provider() {
            return Err(ApiError::BadRequest(
                "You may only subscribe to provider accounts.".to_string(),
            ));
        }
        if self.subscriptions.is_subscribed(userid, providerid).await? {
            return Err(ApiError::Conflict(
                "You have already subscribed to this provider.".to_string(),
            ));
        }

        let sub = self.subscriptions.create(userid, providerid).await?;
        info!(user = %userid, provider = %providerid, subscription = %sub.id, "Subscribed");
        Ok(sub)
    }

    pub async fn list_my_subscriptions(
        &self,
        params: TokenParams,
    ) -> ApiResult<Vec<WithStats<Subscription>>> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let list = self.subscriptions.list_by_user(userid).await?;
        Ok(self.merge_trader_stats(list).await)
    }

    pub async fn is_subscribed(&self, params: ProviderParams) -> ApiResult<bool> {
        let userid = self.authenticate(params.token.as_deref()).await?;
        let providerid = required_id(params.providerid, "providerid required")?;
        Ok(self.subscriptions.is_subscribed(userid, providerid).await?)
    }

    pub async fn cancel_subscription(&self, params: SubscriptionParams) -> ApiResult<Subscription> {
        let subscriptionid = required_id(params.subscriptionid, "subscriptionid required")?;
        let userid = self.authenticate(params.token.as_deref()).await?;
        self.owned_subscription(userid, subscriptionid).await?;

        let sub = self
            .subscriptions
            .update(subscriptionid, SubscriptionPatch::cancel())
            .await?;
        info!(user = %userid, subscription = %subscriptionid, "Subscription cancelled");
        Ok(sub)
    }

    pub async fn transfer_subscription(&self, params: TransferParams) -> ApiResult<Subscription> {
        let subscriptionid = required_id(params.subscriptionid, "subscriptionid required")?;
        let secret = required(params.token.as_deref(), "token required")?;
        let recipientid = required_id(params.recipientid, "recipientid required")?;
        let userid = self.authenticate(Some(secret)).await?;

        let recipient = self.users.get(recipientid).await?;
        self.owned_subscription(userid, subscriptionid).await?;

        info!(subscription = %subscriptionid, recipient = %recipient.id, "Sending subscription");
        Ok(self
            .subscriptions
            .update(subscriptionid, SubscriptionPatch::transfer(recipient.id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{actions, FixedTicker};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tradebot_data::memory::MemoryTradeStore;

    async fn register(actions: &Actions, name: &str) -> (User, String) {
        let reg = actions
            .register_username(UsernameParams {
                username: Some(name.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        (reg.user, reg.token.id)
    }

    async fn provider(actions: &Actions, token: &str, name: &str) -> (User, String) {
        let reg = actions
            .create_provider(CreateProviderParams {
                token: Some(token.to_string()),
                username: Some(name.to_string()),
                description: None,
            })
            .await
            .unwrap();
        (reg.provider, reg.token.id)
    }

    fn token(token: &str) -> TokenParams {
        TokenParams {
            token: Some(token.to_string()),
        }
    }

    fn signal(token: &str, action: SignalAction) -> ConsumeEventParams {
        ConsumeEventParams {
            token: Some(token.to_string()),
            action: Some(action),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_echo_and_ping() {
        let (actions, _) = actions();
        assert_eq!(actions.echo(json!({"a": [1, 2]})).await, json!({"a": [1, 2]}));
        assert_eq!(actions.ping().await, "ok");
    }

    #[tokio::test]
    async fn test_token_required_everywhere() {
        let (actions, _) = actions();
        let missing = || TokenParams::default();

        let errors = vec![
            actions.me(missing()).await.unwrap_err(),
            actions.list_my_trades(missing()).await.unwrap_err(),
            actions.list_my_events(missing()).await.unwrap_err(),
            actions.list_my_tokens(missing()).await.unwrap_err(),
            actions.get_my_stats(missing()).await.unwrap_err(),
            actions.list_my_providers(missing()).await.unwrap_err(),
            actions.list_my_provider_stats(missing()).await.unwrap_err(),
            actions.list_my_subscriptions(missing()).await.unwrap_err(),
            actions
                .consume_event(ConsumeEventParams::default())
                .await
                .unwrap_err(),
        ];
        for err in errors {
            assert!(matches!(err, ApiError::BadRequest(ref m) if m == "token required"));
        }
    }

    #[tokio::test]
    async fn test_unknown_and_unbound_tokens_rejected() {
        let (actions, _) = actions();
        let err = actions.me(token("not-a-token")).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == INVALID_TOKEN));

        // Generated but never validated.
        let raw = actions
            .tokens
            .generate(TokenIssuer::Tradebot, AccountKind::User)
            .await
            .unwrap();
        let err = actions.list_my_events(token(&raw.id)).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == EXPIRED_TOKEN));
    }

    #[tokio::test]
    async fn test_register_and_me() {
        let (actions, _) = actions();
        let (user, secret) = register(&actions, "Alice").await;
        assert_eq!(user.username, "alice");
        assert_eq!(user.kind, AccountKind::User);

        let me = actions.me(token(&secret)).await.unwrap();
        assert_eq!(me, user);

        let tokens = actions.list_my_tokens(token(&secret)).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].issuer, TokenIssuer::Tradebot);
        assert!(tokens[0].valid);
    }

    #[tokio::test]
    async fn test_register_requires_free_username() {
        let (actions, _) = actions();
        register(&actions, "alice").await;

        let err = actions
            .register_username(UsernameParams {
                username: Some("ALICE".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(ref m) if m == USERNAME_TAKEN));

        let err = actions
            .register_username(UsernameParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "username required"));
    }

    #[tokio::test]
    async fn test_change_my_username() {
        let (actions, _) = actions();
        let (_, secret) = register(&actions, "alice").await;
        register(&actions, "bob").await;

        let err = actions
            .change_my_username(UsernameParams {
                token: Some(secret.clone()),
                username: Some("Bob".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let user = actions
            .change_my_username(UsernameParams {
                token: Some(secret.clone()),
                username: Some("Carol".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(user.username, "carol");

        let err = actions
            .change_my_username(UsernameParams {
                token: Some(secret),
                username: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "username required"));
    }

    #[tokio::test]
    async fn test_consume_event_builds_trades_and_stats() {
        let (actions, ticker) = actions();
        let (user, secret) = register(&actions, "alice").await;

        let err = actions.get_my_stats(token(&secret)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        ticker.set(dec!(100));
        let entry = actions
            .consume_event(signal(&secret, SignalAction::BuyEntry))
            .await
            .unwrap();
        assert_eq!(entry.userid, user.id);
        assert_eq!(entry.ticker.last_price, dec!(100));

        ticker.set(dec!(120));
        actions
            .consume_event(signal(&secret, SignalAction::ExitLong))
            .await
            .unwrap();

        let trades = actions.list_my_trades(token(&secret)).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].return_pct, dec!(20));

        let stats = actions.get_my_stats(token(&secret)).await.unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.total_trades, 1);
        assert_eq!(actions.list_traders().await, vec![user.id]);
        assert_eq!(actions.list_my_events(token(&secret)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_consume_event_keeps_free_fields_and_is_idempotent() {
        let (actions, _) = actions();
        let (user, secret) = register(&actions, "alice").await;

        let id = Uuid::new_v4();
        let mut fields = Map::new();
        fields.insert("note".to_string(), json!("breakout"));
        fields.insert("userid".to_string(), json!(Uuid::new_v4()));
        let params = || ConsumeEventParams {
            token: Some(secret.clone()),
            id: Some(id),
            action: Some(SignalAction::BuyEntry),
            fields: fields.clone(),
        };

        let event = actions.consume_event(params()).await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.userid, user.id);
        assert_eq!(event.fields.get("note"), Some(&json!("breakout")));

        actions.consume_event(params()).await.unwrap();
        let stats = actions.get_my_stats(token(&secret)).await.unwrap();
        assert_eq!(stats.events, 1);
    }

    #[tokio::test]
    async fn test_consume_event_fails_when_exchange_down() {
        let (actions, ticker) = actions();
        let (_, secret) = register(&actions, "alice").await;
        ticker.fail();

        let err = actions
            .consume_event(signal(&secret, SignalAction::BuyEntry))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
        assert!(actions.list_my_events(token(&secret)).await.unwrap().is_empty());
        assert!(actions.get_ticker().await.is_err());
    }

    #[tokio::test]
    async fn test_create_provider_and_listings() {
        let (actions, _) = actions();
        let (owner, secret) = register(&actions, "alice").await;
        let (prov, prov_token) = provider(&actions, &secret, "Alpha").await;

        assert_eq!(prov.username, "alpha");
        assert_eq!(prov.kind, AccountKind::Provider);
        assert_eq!(prov.userid, Some(owner.id));
        assert_eq!(prov.description.as_deref(), Some(DEFAULT_PROVIDER_DESCRIPTION));

        // The provider key acts as the provider account.
        let me = actions.me(token(&prov_token)).await.unwrap();
        assert_eq!(me.id, prov.id);

        let mine = actions.list_my_providers(token(&secret)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].record.id, prov.id);
        assert_eq!(mine[0].stats, TraderStats::default());

        assert_eq!(actions.list_providers().await.unwrap().len(), 1);
        assert_eq!(actions.list_my_provider_stats(token(&secret)).await.unwrap().len(), 1);
        assert_eq!(actions.list_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_provider_requires_username_and_token() {
        let (actions, _) = actions();
        let err = actions
            .create_provider(CreateProviderParams {
                token: Some("x".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "username required"));

        let err = actions
            .create_provider(CreateProviderParams {
                username: Some("alpha".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "token required"));
    }

    #[tokio::test]
    async fn test_provider_events_and_trades_are_owner_only() {
        let (actions, ticker) = actions();
        let (_, alice) = register(&actions, "alice").await;
        let (_, bob) = register(&actions, "bob").await;
        let (prov, prov_token) = provider(&actions, &alice, "alpha").await;

        ticker.set(dec!(200));
        actions
            .consume_event(signal(&prov_token, SignalAction::SellEntry))
            .await
            .unwrap();
        ticker.set(dec!(190));
        actions
            .consume_event(signal(&prov_token, SignalAction::ExitShort))
            .await
            .unwrap();
        ticker.set(dec!(180));
        actions
            .consume_event(signal(&prov_token, SignalAction::BuyEntry))
            .await
            .unwrap();
        ticker.set(dec!(200));
        actions
            .consume_event(signal(&prov_token, SignalAction::ExitAll))
            .await
            .unwrap();

        let params = |t: &str| ProviderParams {
            token: Some(t.to_string()),
            providerid: Some(prov.id),
        };

        let events = actions.list_my_provider_events(params(&alice)).await.unwrap();
        assert_eq!(events.len(), 4);
        let trades = actions.list_my_provider_trades(params(&alice)).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades[0].closed >= trades[1].closed);

        let err = actions.list_my_provider_events(params(&bob)).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(ref m) if m == NOT_YOUR_PROVIDER));
        let err = actions.list_my_provider_trades(params(&bob)).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let err = actions
            .list_my_provider_events(ProviderParams {
                token: Some(alice.clone()),
                providerid: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "providerid required"));

        let listed = actions.list_providers().await.unwrap();
        assert_eq!(listed[0].stats.total_trades, 2);
        assert_eq!(listed[0].stats.events, 4);
    }

    #[tokio::test]
    async fn test_subscription_rules() {
        let (actions, _) = actions();
        let (alice_user, alice) = register(&actions, "alice").await;
        let (_, bob) = register(&actions, "bob").await;
        let (prov, _) = provider(&actions, &alice, "alpha").await;

        let sub_params = |t: &str, id: Uuid| ProviderParams {
            token: Some(t.to_string()),
            providerid: Some(id),
        };

        // Owners cannot subscribe to their own providers.
        let err = actions
            .create_subscription(sub_params(&alice, prov.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        // Plain users are not subscribable.
        let err = actions
            .create_subscription(sub_params(&bob, alice_user.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m.contains("provider accounts")));

        assert!(!actions.is_subscribed(sub_params(&bob, prov.id)).await.unwrap());
        let sub = actions.create_subscription(sub_params(&bob, prov.id)).await.unwrap();
        assert!(actions.is_subscribed(sub_params(&bob, prov.id)).await.unwrap());

        let err = actions
            .create_subscription(sub_params(&bob, prov.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let listed = actions.list_my_subscriptions(token(&bob)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.id, sub.id);

        let err = actions
            .create_subscription(ProviderParams {
                token: Some(bob.clone()),
                providerid: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "providerid required"));
    }

    #[tokio::test]
    async fn test_cancel_subscription() {
        let (actions, _) = actions();
        let (_, alice) = register(&actions, "alice").await;
        let (_, bob) = register(&actions, "bob").await;
        let (prov, _) = provider(&actions, &alice, "alpha").await;
        let sub = actions
            .create_subscription(ProviderParams {
                token: Some(bob.clone()),
                providerid: Some(prov.id),
            })
            .await
            .unwrap();

        let cancel = |t: &str| SubscriptionParams {
            token: Some(t.to_string()),
            subscriptionid: Some(sub.id),
        };

        let err = actions.cancel_subscription(cancel(&alice)).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(ref m) if m == NOT_YOUR_SUBSCRIPTION));

        let cancelled = actions.cancel_subscription(cancel(&bob)).await.unwrap();
        assert!(cancelled.done);
        assert!(!actions
            .is_subscribed(ProviderParams {
                token: Some(bob.clone()),
                providerid: Some(prov.id),
            })
            .await
            .unwrap());

        // A cancelled subscription can be taken out again.
        actions
            .create_subscription(ProviderParams {
                token: Some(bob),
                providerid: Some(prov.id),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transfer_subscription() {
        let (actions, _) = actions();
        let (_, alice) = register(&actions, "alice").await;
        let (_, bob) = register(&actions, "bob").await;
        let (carol_user, carol) = register(&actions, "carol").await;
        let (prov, _) = provider(&actions, &alice, "alpha").await;
        let sub = actions
            .create_subscription(ProviderParams {
                token: Some(bob.clone()),
                providerid: Some(prov.id),
            })
            .await
            .unwrap();

        let transfer = |t: &str, recipient: Uuid| TransferParams {
            token: Some(t.to_string()),
            subscriptionid: Some(sub.id),
            recipientid: Some(recipient),
        };

        let err = actions
            .transfer_subscription(transfer(&bob, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = actions
            .transfer_subscription(transfer(&carol, carol_user.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let moved = actions
            .transfer_subscription(transfer(&bob, carol_user.id))
            .await
            .unwrap();
        assert_eq!(moved.userid, carol_user.id);
        assert!(actions.list_my_subscriptions(token(&bob)).await.unwrap().is_empty());
        assert_eq!(actions.list_my_subscriptions(token(&carol)).await.unwrap().len(), 1);

        let err = actions
            .transfer_subscription(TransferParams {
                token: Some(bob),
                subscriptionid: Some(sub.id),
                recipientid: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "recipientid required"));
    }

    /// Trade store that can be switched into failing every insert.
    struct FlakyTrades {
        inner: MemoryTradeStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl TradeStore for FlakyTrades {
        async fn insert(&self, trade: Trade) -> Result<Trade, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Database("connection reset".to_string()));
            }
            self.inner.insert(trade).await
        }

        async fn list_by_user(&self, userid: Uuid, order: SortOrder) -> Result<Vec<Trade>, StoreError> {
            self.inner.list_by_user(userid, order).await
        }
    }

    #[tokio::test]
    async fn test_resent_event_replays_to_live_state() {
        let ticker = Arc::new(FixedTicker::new(dec!(100)));
        let stores = Stores::memory();
        let events = stores.events.clone();
        let actions = Actions::new(stores, ticker.clone(), Arc::new(TraderRegistry::new()));
        let (_, secret) = register(&actions, "alice").await;

        let id = Uuid::new_v4();
        let entry = || ConsumeEventParams {
            token: Some(secret.clone()),
            id: Some(id),
            action: Some(SignalAction::BuyEntry),
            ..Default::default()
        };
        actions.consume_event(entry()).await.unwrap();
        ticker.set(dec!(120));
        actions
            .consume_event(signal(&secret, SignalAction::ExitLong))
            .await
            .unwrap();
        ticker.set(dec!(110));
        let resent = actions.consume_event(entry()).await.unwrap();
        assert_eq!(resent.ticker.last_price, dec!(100));

        let live = actions.get_my_stats(token(&secret)).await.unwrap();
        let rebuilt = TraderRegistry::new();
        rebuilt.replay(&events.list_all().await.unwrap()).await;
        let replayed = rebuilt.get(resent.userid).await.unwrap();

        assert_eq!(live.total_trades, 1);
        assert!(live.position.is_none());
        assert_eq!(replayed.total_trades, live.total_trades);
        assert_eq!(replayed.net_return, live.net_return);
        assert_eq!(replayed.position, live.position);
    }

    #[tokio::test]
    async fn test_consume_event_rolls_back_when_trade_store_fails() {
        let trades = Arc::new(FlakyTrades {
            inner: MemoryTradeStore::new(),
            failing: AtomicBool::new(false),
        });
        let mut stores = Stores::memory();
        stores.trades = trades.clone();
        let ticker = Arc::new(FixedTicker::new(dec!(100)));
        let actions = Actions::new(stores, ticker.clone(), Arc::new(TraderRegistry::new()));
        let (_, secret) = register(&actions, "alice").await;

        actions
            .consume_event(signal(&secret, SignalAction::BuyEntry))
            .await
            .unwrap();

        let exit = ConsumeEventParams {
            id: Some(Uuid::new_v4()),
            ..signal(&secret, SignalAction::ExitLong)
        };
        let retry = ConsumeEventParams {
            id: exit.id,
            ..signal(&secret, SignalAction::ExitLong)
        };
        ticker.set(dec!(90));
        trades.failing.store(true, Ordering::SeqCst);
        let err = actions.consume_event(exit).await.unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));

        assert_eq!(actions.list_my_events(token(&secret)).await.unwrap().len(), 1);
        let stats = actions.get_my_stats(token(&secret)).await.unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.position.map(|p| p.side), Some(PositionSide::Long));

        trades.failing.store(false, Ordering::SeqCst);
        actions.consume_event(retry).await.unwrap();
        let stored = actions.list_my_trades(token(&secret)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].return_pct, dec!(-10));
        assert_eq!(actions.get_my_stats(token(&secret)).await.unwrap().total_trades, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_events_replay_to_live_state() {
        let stores = Stores::memory();
        let events = stores.events.clone();
        let actions = Arc::new(Actions::new(
            stores,
            Arc::new(FixedTicker::new(dec!(100))),
            Arc::new(TraderRegistry::new()),
        ));
        let (user, secret) = register(&actions, "alice").await;

        let mut handles = Vec::new();
        for i in 0..40 {
            let actions = actions.clone();
            let secret = secret.clone();
            let action = if i % 2 == 0 {
                SignalAction::BuyEntry
            } else {
                SignalAction::SellEntry
            };
            handles.push(tokio::spawn(async move {
                actions.consume_event(signal(&secret, action)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let live = actions.get_my_stats(token(&secret)).await.unwrap();
        let rebuilt = TraderRegistry::new();
        rebuilt.replay(&events.list_all().await.unwrap()).await;
        let replayed = rebuilt.get(user.id).await.unwrap();

        assert_eq!(live.events, 40);
        assert_eq!(replayed.total_trades, live.total_trades);
        assert_eq!(replayed.position, live.position);

        let stored = actions.list_my_trades(token(&secret)).await.unwrap();
        assert_eq!(stored.len(), live.total_trades);
    }

    #[tokio::test]
    async fn test_stat_listings_are_most_recently_updated_first() {
        let (actions, ticker) = actions();
        let (_, alice) = register(&actions, "alice").await;
        let (_, bob) = register(&actions, "bob").await;
        let (alpha, alpha_token) = provider(&actions, &alice, "alpha").await;
        let (beta, beta_token) = provider(&actions, &alice, "beta").await;

        ticker.set(dec!(100));
        actions
            .consume_event(signal(&beta_token, SignalAction::BuyEntry))
            .await
            .unwrap();
        ticker.set(dec!(105));
        actions
            .consume_event(signal(&beta_token, SignalAction::ExitLong))
            .await
            .unwrap();

        // Renaming makes alpha the most recently updated provider.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        actions
            .change_my_username(UsernameParams {
                token: Some(alpha_token),
                username: Some("alpha2".to_string()),
            })
            .await
            .unwrap();

        let ids = |list: &Vec<WithStats<User>>| list.iter().map(|w| w.record.id).collect::<Vec<_>>();
        let listed = actions.list_providers().await.unwrap();
        assert_eq!(ids(&listed), vec![alpha.id, beta.id]);
        assert_eq!(listed[0].stats, TraderStats::default());
        assert_eq!(listed[1].stats.events, 2);
        assert_eq!(listed[1].stats.total_trades, 1);

        let mine = actions.list_my_providers(token(&alice)).await.unwrap();
        assert_eq!(ids(&mine), vec![alpha.id, beta.id]);
        let owned = actions.list_my_provider_stats(token(&alice)).await.unwrap();
        assert_eq!(ids(&owned), vec![alpha.id, beta.id]);

        let subscribe = |id: Uuid| ProviderParams {
            token: Some(bob.clone()),
            providerid: Some(id),
        };
        let alpha_sub = actions.create_subscription(subscribe(alpha.id)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let beta_sub = actions.create_subscription(subscribe(beta.id)).await.unwrap();

        let subs = actions.list_my_subscriptions(token(&bob)).await.unwrap();
        assert_eq!(subs[0].record.id, beta_sub.id);
        assert_eq!(subs[0].stats.events, 2);
        assert_eq!(subs[1].record.id, alpha_sub.id);
        assert_eq!(subs[1].stats.events, 0);

        // Cancelling touches the alpha subscription.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        actions
            .cancel_subscription(SubscriptionParams {
                token: Some(bob.clone()),
                subscriptionid: Some(alpha_sub.id),
            })
            .await
            .unwrap();
        let subs = actions.list_my_subscriptions(token(&bob)).await.unwrap();
        assert_eq!(subs[0].record.id, alpha_sub.id);
        assert_eq!(subs[1].record.id, beta_sub.id);
    }

    #[tokio::test]
    async fn test_get_ticker_forwards_source() {
        let ticker = Arc::new(FixedTicker::new(dec!(42)));
        let actions = Actions::new(
            Stores::memory(),
            ticker.clone(),
            Arc::new(TraderRegistry::new()),
        );
        assert_eq!(actions.get_ticker().await.unwrap().last_price, dec!(42));
    }
}
