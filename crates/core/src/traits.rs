use crate::events::*;
use crate::models::*;
use async_trait::async_trait;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Store Errors
// ---------------------------------------------------------------------------

/// Errors that can occur in a data store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn user_not_found(id: Uuid) -> Self {
        StoreError::NotFound(format!("user not found: {id}"))
    }

    pub fn subscription_not_found(id: Uuid) -> Self {
        StoreError::NotFound(format!("subscription not found: {id}"))
    }

    pub fn username_taken(username: &str) -> Self {
        StoreError::Conflict(format!("username already taken: {username}"))
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Account storage.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fetch an account, failing with `NotFound` if absent.
    async fn get(&self, id: Uuid) -> Result<User, StoreError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Create an account. A taken username is a `Conflict`.
    async fn create(&self, new_user: NewUser) -> Result<User, StoreError>;

    async fn update_username(&self, id: Uuid, username: &str) -> Result<User, StoreError>;

    /// All accounts, oldest first.
    async fn list_sorted(&self) -> Result<Vec<User>, StoreError>;

    async fn list_by_kind(&self, kind: AccountKind) -> Result<Vec<User>, StoreError>;

    /// Accounts owned by `owner`.
    async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<User>, StoreError>;

    async fn list_by_owner_and_kind(
        &self,
        owner: Uuid,
        kind: AccountKind,
    ) -> Result<Vec<User>, StoreError>;
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Credential issuance and lookup.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Resolve a presented secret.
    async fn get(&self, id: &str) -> Result<Token, StoreError>;

    /// Mint an unbound token that is not yet valid.
    async fn generate(&self, issuer: TokenIssuer, kind: AccountKind) -> Result<Token, StoreError>;

    /// Bind a token to an account and mark it valid.
    async fn validate(&self, id: &str, userid: Uuid) -> Result<Token, StoreError>;

    /// Tokens bound to an account, oldest first.
    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Token>, StoreError>;
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Subscription, StoreError>;

    async fn create(&self, userid: Uuid, providerid: Uuid) -> Result<Subscription, StoreError>;

    /// Whether `userid` holds an active subscription to `providerid`.
    async fn is_subscribed(&self, userid: Uuid, providerid: Uuid) -> Result<bool, StoreError>;

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Subscription>, StoreError>;

    async fn update(&self, id: Uuid, patch: SubscriptionPatch) -> Result<Subscription, StoreError>;
}

// ---------------------------------------------------------------------------
// Trades & Events
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert(&self, trade: Trade) -> Result<Trade, StoreError>;

    /// Trades of one user ordered by close time.
    async fn list_by_user(&self, userid: Uuid, order: SortOrder) -> Result<Vec<Trade>, StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert by id. Re-sending an id refreshes only the free-form `fields`;
    /// the stored `action`, `ticker` and `created` are kept and returned.
    /// Re-sending another user's event id is a `Conflict`.
    async fn upsert(&self, event: Event) -> Result<Upserted, StoreError>;

    /// Delete an event by id. Missing ids are a `NotFound`.
    async fn remove(&self, id: Uuid) -> Result<(), StoreError>;

    /// Events of one user, oldest first.
    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Every stored event, oldest first.
    async fn list_all(&self) -> Result<Vec<Event>, StoreError>;
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Errors from the exchange client.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Exchange API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("Unexpected response: {0}")]
    Parse(String),
    #[error("No ticker returned for {0}")]
    EmptyTicker(String),
}

/// Source of the current market quote.
#[async_trait]
pub trait TickerSource: Send + Sync {
    async fn ticker(&self) -> Result<Ticker, ExchangeError>;
}
