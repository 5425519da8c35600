use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use tradebot_core::*;
use uuid::Uuid;

use crate::generate_token_secret;

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

fn bad_column(column: &str, value: &str) -> StoreError {
    StoreError::Database(format!("unexpected {column} value: {value}"))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

const USER_COLUMNS: &str = "id, username, kind, description, userid, created, updated";

fn user_from_row(r: &PgRow) -> Result<User, StoreError> {
    let kind: String = r.try_get("kind").map_err(db_err)?;
    Ok(User {
        id: r.try_get("id").map_err(db_err)?,
        username: r.try_get("username").map_err(db_err)?,
        kind: AccountKind::parse(&kind).ok_or_else(|| bad_column("kind", &kind))?,
        description: r.try_get("description").map_err(db_err)?,
        userid: r.try_get("userid").map_err(db_err)?,
        created: r.try_get("created").map_err(db_err)?,
        updated: r.try_get("updated").map_err(db_err)?,
    })
}

fn users_from_rows(rows: &[PgRow]) -> Result<Vec<User>, StoreError> {
    rows.iter().map(user_from_row).collect()
}

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get(&self, id: Uuid) -> Result<User, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => user_from_row(&r),
            None => Err(StoreError::user_not_found(id)),
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create(&self, new_user: NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO users (id, username, kind, description, userid, created, updated)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.username)
        .bind(new_user.kind.as_str())
        .bind(&new_user.description)
        .bind(new_user.userid)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                debug!(username = %new_user.username, "Unique violation on insert");
                StoreError::username_taken(&new_user.username)
            } else {
                db_err(e)
            }
        })?;
        user_from_row(&row)
    }

    async fn update_username(&self, id: Uuid, username: &str) -> Result<User, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET username = $2, updated = $3 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(username)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                debug!(user = %id, %username, "Unique violation on rename");
                StoreError::username_taken(username)
            } else {
                db_err(e)
            }
        })?;
        match row {
            Some(r) => user_from_row(&r),
            None => Err(StoreError::user_not_found(id)),
        }
    }

    async fn list_sorted(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY created ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        users_from_rows(&rows)
    }

    async fn list_by_kind(&self, kind: AccountKind) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE kind = $1 ORDER BY created ASC"
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        users_from_rows(&rows)
    }

    async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE userid = $1 ORDER BY created ASC"
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        users_from_rows(&rows)
    }

    async fn list_by_owner_and_kind(
        &self,
        owner: Uuid,
        kind: AccountKind,
    ) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE userid = $1 AND kind = $2 ORDER BY created ASC"
        ))
        .bind(owner)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        users_from_rows(&rows)
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

const TOKEN_COLUMNS: &str = "id, issuer, kind, userid, valid, created, updated";

fn token_from_row(r: &PgRow) -> Result<Token, StoreError> {
    let issuer: String = r.try_get("issuer").map_err(db_err)?;
    let kind: String = r.try_get("kind").map_err(db_err)?;
    Ok(Token {
        id: r.try_get("id").map_err(db_err)?,
        issuer: TokenIssuer::parse(&issuer).ok_or_else(|| bad_column("issuer", &issuer))?,
        kind: AccountKind::parse(&kind).ok_or_else(|| bad_column("kind", &kind))?,
        userid: r.try_get("userid").map_err(db_err)?,
        valid: r.try_get("valid").map_err(db_err)?,
        created: r.try_get("created").map_err(db_err)?,
        updated: r.try_get("updated").map_err(db_err)?,
    })
}

pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn get(&self, id: &str) -> Result<Token, StoreError> {
        let row = sqlx::query(&format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => token_from_row(&r),
            None => Err(StoreError::NotFound("token not found".to_string())),
        }
    }

    async fn generate(&self, issuer: TokenIssuer, kind: AccountKind) -> Result<Token, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO tokens (id, issuer, kind, userid, valid, created, updated)
             VALUES ($1, $2, $3, NULL, FALSE, $4, $4)
             RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(generate_token_secret())
        .bind(issuer.as_str())
        .bind(kind.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        token_from_row(&row)
    }

    async fn validate(&self, id: &str, userid: Uuid) -> Result<Token, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE tokens SET userid = $2, valid = TRUE, updated = $3
             WHERE id = $1 RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(id)
        .bind(userid)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(r) => token_from_row(&r),
            None => Err(StoreError::NotFound("token not found".to_string())),
        }
    }

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Token>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE userid = $1 ORDER BY created ASC"
        ))
        .bind(userid)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(token_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

const SUBSCRIPTION_COLUMNS: &str = "id, userid, providerid, done, created, updated";

fn subscription_from_row(r: &PgRow) -> Result<Subscription, StoreError> {
    Ok(Subscription {
        id: r.try_get("id").map_err(db_err)?,
        userid: r.try_get("userid").map_err(db_err)?,
        providerid: r.try_get("providerid").map_err(db_err)?,
        done: r.try_get("done").map_err(db_err)?,
        created: r.try_get("created").map_err(db_err)?,
        updated: r.try_get("updated").map_err(db_err)?,
    })
}

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, id: Uuid) -> Result<Subscription, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(r) => subscription_from_row(&r),
            None => Err(StoreError::subscription_not_found(id)),
        }
    }

    async fn create(&self, userid: Uuid, providerid: Uuid) -> Result<Subscription, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO subscriptions (id, userid, providerid, done, created, updated)
             VALUES ($1, $2, $3, FALSE, $4, $4)
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(userid)
        .bind(providerid)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        subscription_from_row(&row)
    }

    async fn is_subscribed(&self, userid: Uuid, providerid: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT 1 FROM subscriptions
                WHERE userid = $1 AND providerid = $2 AND done = FALSE
             ) AS subscribed",
        )
        .bind(userid)
        .bind(providerid)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("subscribed").map_err(db_err)
    }

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE userid = $1 ORDER BY created ASC"
        ))
        .bind(userid)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn update(&self, id: Uuid, patch: SubscriptionPatch) -> Result<Subscription, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE subscriptions
             SET done = COALESCE($2, done), userid = COALESCE($3, userid), updated = $4
             WHERE id = $1
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(id)
        .bind(patch.done)
        .bind(patch.userid)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(r) => subscription_from_row(&r),
            None => Err(StoreError::subscription_not_found(id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn trade_from_row(r: &PgRow) -> Result<Trade, StoreError> {
    let side: String = r.try_get("side").map_err(db_err)?;
    Ok(Trade {
        id: r.try_get("id").map_err(db_err)?,
        userid: r.try_get("userid").map_err(db_err)?,
        side: PositionSide::parse(&side).ok_or_else(|| bad_column("side", &side))?,
        entry_price: r.try_get("entry_price").map_err(db_err)?,
        exit_price: r.try_get("exit_price").map_err(db_err)?,
        return_pct: r.try_get("return_pct").map_err(db_err)?,
        entry_event: r.try_get("entry_event").map_err(db_err)?,
        exit_event: r.try_get("exit_event").map_err(db_err)?,
        opened: r.try_get("opened").map_err(db_err)?,
        closed: r.try_get("closed").map_err(db_err)?,
    })
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn insert(&self, trade: Trade) -> Result<Trade, StoreError> {
        sqlx::query(
            "INSERT INTO trades (
                id, userid, side, entry_price, exit_price, return_pct,
                entry_event, exit_event, opened, closed
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(trade.id)
        .bind(trade.userid)
        .bind(trade.side.as_str())
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.return_pct)
        .bind(trade.entry_event)
        .bind(trade.exit_event)
        .bind(trade.opened)
        .bind(trade.closed)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(trade)
    }

    async fn list_by_user(&self, userid: Uuid, order: SortOrder) -> Result<Vec<Trade>, StoreError> {
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let rows = sqlx::query(&format!(
            "SELECT id, userid, side, entry_price, exit_price, return_pct,
                    entry_event, exit_event, opened, closed
             FROM trades WHERE userid = $1 ORDER BY closed {direction}"
        ))
        .bind(userid)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(trade_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn event_from_row(r: &PgRow) -> Result<Event, StoreError> {
    let action: Option<String> = r.try_get("action").map_err(db_err)?;
    let action = match action {
        Some(a) => Some(SignalAction::parse(&a).ok_or_else(|| bad_column("action", &a))?),
        None => None,
    };
    let ticker: Value = r.try_get("ticker").map_err(db_err)?;
    let fields: Value = r.try_get("fields").map_err(db_err)?;
    Ok(Event {
        id: r.try_get("id").map_err(db_err)?,
        userid: r.try_get("userid").map_err(db_err)?,
        action,
        ticker: serde_json::from_value(ticker)
            .map_err(|e| StoreError::Database(format!("bad ticker column: {e}")))?,
        created: r.try_get("created").map_err(db_err)?,
        fields: match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        },
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert(&self, event: Event) -> Result<Upserted, StoreError> {
        let ticker = serde_json::to_value(&event.ticker)
            .map_err(|e| StoreError::Database(format!("ticker encode failed: {e}")))?;
        let fields = Value::Object(event.fields.clone());

        // xmax = 0 only for freshly inserted rows. A re-sent id only refreshes
        // `fields`. The WHERE clause leaves rows of other users untouched, in
        // which case nothing is returned.
        let row = sqlx::query(
            "INSERT INTO events (id, userid, action, ticker, fields, created)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE
             SET fields = EXCLUDED.fields
             WHERE events.userid = EXCLUDED.userid
             RETURNING id, userid, action, ticker, fields, created, (xmax = 0) AS inserted",
        )
        .bind(event.id)
        .bind(event.userid)
        .bind(event.action.map(|a| a.as_str()))
        .bind(&ticker)
        .bind(&fields)
        .bind(event.created)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => Ok(Upserted {
                inserted: r.try_get("inserted").map_err(db_err)?,
                event: event_from_row(&r)?,
            }),
            None => Err(StoreError::Conflict(format!(
                "event {} belongs to another user",
                event.id
            ))),
        }
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event not found: {id}")));
        }
        Ok(())
    }

    async fn list_by_user(&self, userid: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, userid, action, ticker, fields, created
             FROM events WHERE userid = $1 ORDER BY created ASC",
        )
        .bind(userid)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, userid, action, ticker, fields, created FROM events ORDER BY created ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }
}
