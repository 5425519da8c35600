pub mod db;
pub mod memory;

use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tradebot_core::{EventStore, SubscriptionStore, TokenStore, TradeStore, UserStore};

/// Length of a generated token secret.
pub const TOKEN_LENGTH: usize = 48;

/// Generate a random alphanumeric token secret.
pub fn generate_token_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// The set of stores the request handlers depend on.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub trades: Arc<dyn TradeStore>,
    pub events: Arc<dyn EventStore>,
}

impl Stores {
    /// Process-local stores. Everything is lost on restart.
    pub fn memory() -> Self {
        Self {
            users: Arc::new(memory::MemoryUserStore::new()),
            tokens: Arc::new(memory::MemoryTokenStore::new()),
            subscriptions: Arc::new(memory::MemorySubscriptionStore::new()),
            trades: Arc::new(memory::MemoryTradeStore::new()),
            events: Arc::new(memory::MemoryEventStore::new()),
        }
    }

    /// PostgreSQL-backed stores sharing one pool.
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            users: Arc::new(db::PgUserStore::new(pool.clone())),
            tokens: Arc::new(db::PgTokenStore::new(pool.clone())),
            subscriptions: Arc::new(db::PgSubscriptionStore::new(pool.clone())),
            trades: Arc::new(db::PgTradeStore::new(pool.clone())),
            events: Arc::new(db::PgEventStore::new(pool)),
        }
    }
}
