//! Process-local stores backed by `tokio::sync::RwLock`.
//!
//! Records are kept in insertion order, so listings are stable for equal
//! timestamps.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tradebot_core::*;
use uuid::Uuid;

use crate::generate_token_secret;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<Vec<User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered(users: &[User], pred: impl Fn(&User) -> bool) -> Vec<User> {
        let mut list: Vec<User> = users.iter().filter(|u| pred(u)).cloned().collect();
        list.sort_by_key(|u| u.created);
        list
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get(&self, id: Uuid) -> Result<User, StoreError> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| StoreError::user_not_found(id))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn create(&self, new_user: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.username == new_user.username) {
            return Err(StoreError::username_taken(&new_user.username));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: new_user.username,
            kind: new_user.kind,
            description: new_user.description,
            userid: new_user.userid,
            created: now,
            updated: now,
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn update_username(&self, id: Uuid, username: &str) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.username == username && u.id != id) {
            return Err(StoreError::username_taken(username));
        }
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| StoreError::user_not_found(id))?;
        user.username = username.to_string();
        user.updated = Utc::now();
        Ok(user.clone())
    }

    async fn list_sorted(&self) -> Result<Vec<User>, StoreError> {
        Ok(Self::filtered(&self.users.read().await, |_| true))
    }

    async fn list_by_kind(&self, kind: AccountKind) -> Result<Vec<User>, StoreError> {
        Ok(Self::filtered(&self.users.read().await, |u| u.kind == kind))
    }

    async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<User>, StoreError> {
        Ok(Self::filtered(&self.users.read().await, |u| u.is_owned_by(owner)))
    }

    async fn list_by_owner_and_kind(
        &self,
        owner: Uuid,
        kind: AccountKind,
    ) -> Result<Vec<User>, StoreError> {
        Ok(Self::filtered(&self.users.read().await, |u| {
            u.is_owned_by(owner) && u.kind == kind
        }))
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Vec<Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, id: &str) -> Result<Token, StoreError> {
        self.tokens
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("token not found".to_string()))
    }

    async fn generate(&self, issuer: TokenIssuer, kind: AccountKind) -> Result<Token, StoreError> {
        let now = Utc::now();
        let token = Token {
            id: generate_token_secret(),
            issuer,
            kind,
            userid: None,
            valid: false,
            created: now,
            updated: now,
        };
        self.tokens.write().await.push(token.clone());
        Ok(token)
    }

    async fn validate(&self, id: &str, userid: Uuid) -> Result<Token, StoreError> {
        let mut tokens = self.tokens.write().await;
        let token = tokens
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound("token not found".to_string()))?;
        token.userid = Some(userid);
        token.valid = true;
        token.updated = Utc::now();
        Ok(token.clone())
    }

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Token>, StoreError> {
        let mut list: Vec<Token> = self
            .tokens
            .read()
            .await
            .iter()
            .filter(|t| t.userid == Some(userid))
            .cloned()
            .collect();
        list.sort_by_key(|t| t.created);
        Ok(list)
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, id: Uuid) -> Result<Subscription, StoreError> {
        self.subscriptions
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::subscription_not_found(id))
    }

    async fn create(&self, userid: Uuid, providerid: Uuid) -> Result<Subscription, StoreError> {
        let now = Utc::now();
        let sub = Subscription {
            id: Uuid::new_v4(),
            userid,
            providerid,
            done: false,
            created: now,
            updated: now,
        };
        self.subscriptions.write().await.push(sub.clone());
        Ok(sub)
    }

    async fn is_subscribed(&self, userid: Uuid, providerid: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .iter()
            .any(|s| s.userid == userid && s.providerid == providerid && s.is_active()))
    }

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Subscription>, StoreError> {
        let mut list: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.userid == userid)
            .cloned()
            .collect();
        list.sort_by_key(|s| s.created);
        Ok(list)
    }

    async fn update(&self, id: Uuid, patch: SubscriptionPatch) -> Result<Subscription, StoreError> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::subscription_not_found(id))?;
        patch.apply(sub);
        Ok(sub.clone())
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTradeStore {
    trades: RwLock<Vec<Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn insert(&self, trade: Trade) -> Result<Trade, StoreError> {
        self.trades.write().await.push(trade.clone());
        Ok(trade)
    }

    async fn list_by_user(&self, userid: Uuid, order: SortOrder) -> Result<Vec<Trade>, StoreError> {
        let mut list: Vec<Trade> = self
            .trades
            .read()
            .await
            .iter()
            .filter(|t| t.userid == userid)
            .cloned()
            .collect();
        list.sort_by_key(|t| t.closed);
        if order == SortOrder::Desc {
            list.reverse();
        }
        Ok(list)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert(&self, event: Event) -> Result<Upserted, StoreError> {
        let mut events = self.events.write().await;
        if let Some(existing) = events.iter_mut().find(|e| e.id == event.id) {
            if existing.userid != event.userid {
                return Err(StoreError::Conflict(format!(
                    "event {} belongs to another user",
                    event.id
                )));
            }
            existing.fields = event.fields;
            return Ok(Upserted {
                event: existing.clone(),
                inserted: false,
            });
        }
        events.push(event.clone());
        Ok(Upserted {
            event,
            inserted: true,
        })
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.id != id);
        if events.len() == before {
            return Err(StoreError::NotFound(format!("event not found: {id}")));
        }
        Ok(())
    }

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Event>, StoreError> {
        let mut list: Vec<Event> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.userid == userid)
            .cloned()
            .collect();
        list.sort_by_key(|e| e.created);
        Ok(list)
    }

    async fn list_all(&self) -> Result<Vec<Event>, StoreError> {
        let mut list = self.events.read().await.clone();
        list.sort_by_key(|e| e.created);
        Ok(list)
    }
}
