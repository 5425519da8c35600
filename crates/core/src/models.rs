use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// What an account (or the token bound to it) represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// A person using the platform.
    User,
    /// A signal source other users can subscribe to.
    Provider,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::User => "user",
            AccountKind::Provider => "provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(AccountKind::User),
            "provider" => Some(AccountKind::Provider),
            _ => None,
        }
    }
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Lowercase, unique across all accounts.
    pub username: String,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Owning account, set for providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userid: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl User {
    pub fn is_provider(&self) -> bool {
        self.kind == AccountKind::Provider
    }

    pub fn is_owned_by(&self, owner: Uuid) -> bool {
        self.userid == Some(owner)
    }
}

/// Input for creating an account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub kind: AccountKind,
    pub description: Option<String>,
    pub userid: Option<Uuid>,
}

impl NewUser {
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: AccountKind::User,
            description: None,
            userid: None,
        }
    }

    pub fn provider(username: impl Into<String>, owner: Uuid, description: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: AccountKind::Provider,
            description: Some(description.into()),
            userid: Some(owner),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Who minted a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenIssuer {
    /// Issued by the platform at registration.
    Tradebot,
    /// Issued on behalf of a user (provider API keys).
    User,
}

impl TokenIssuer {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenIssuer::Tradebot => "tradebot",
            TokenIssuer::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tradebot" => Some(TokenIssuer::Tradebot),
            "user" => Some(TokenIssuer::User),
            _ => None,
        }
    }
}

/// An opaque credential. The `id` is the secret the caller presents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub issuer: TokenIssuer,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    /// Account the token acts for, once validated.
    pub userid: Option<Uuid>,
    pub valid: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Token {
    /// The bound account, if the token is usable.
    pub fn active_user(&self) -> Option<Uuid> {
        if self.valid {
            self.userid
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// A user following a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    /// Subscriber.
    pub userid: Uuid,
    pub providerid: Uuid,
    /// Set once cancelled.
    pub done: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        !self.done
    }
}

/// Partial update of a subscription. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub done: Option<bool>,
    pub userid: Option<Uuid>,
}

impl SubscriptionPatch {
    pub fn cancel() -> Self {
        Self {
            done: Some(true),
            userid: None,
        }
    }

    pub fn transfer(recipient: Uuid) -> Self {
        Self {
            done: None,
            userid: Some(recipient),
        }
    }

    pub fn apply(&self, sub: &mut Subscription) {
        if let Some(done) = self.done {
            sub.done = done;
        }
        if let Some(userid) = self.userid {
            sub.userid = userid;
        }
        sub.updated = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// Latest exchange quote for the traded symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// A closed position derived from a user's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub userid: Uuid,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Percent return of the position.
    pub return_pct: Decimal,
    pub entry_event: Uuid,
    pub exit_event: Uuid,
    pub opened: DateTime<Utc>,
    pub closed: DateTime<Utc>,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.return_pct > Decimal::ZERO
    }

    pub fn is_loser(&self) -> bool {
        self.return_pct < Decimal::ZERO
    }
}

/// Percent return of a position opened at `entry` and closed at `exit`.
pub fn position_return(side: PositionSide, entry: Decimal, exit: Decimal) -> Decimal {
    if entry.is_zero() {
        return Decimal::ZERO;
    }
    let diff = match side {
        PositionSide::Long => exit - entry,
        PositionSide::Short => entry - exit,
    };
    diff / entry * Decimal::ONE_HUNDRED
}

/// Ordering for time-sorted listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ---------------------------------------------------------------------------
// Trader Stats
// ---------------------------------------------------------------------------

/// Position currently held by a trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub entry_event: Uuid,
    pub opened: DateTime<Utc>,
}

/// Aggregate performance of one trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderStats {
    pub events: u64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent of trades with a positive return.
    pub win_rate: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    /// Sum of trade returns, in percent.
    pub net_return: Decimal,
    pub profit_factor: Decimal,
    pub avg_return: Decimal,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
    /// Largest peak-to-trough fall of the cumulative return curve.
    pub max_drawdown: Decimal,
    pub position: Option<OpenPosition>,
    pub updated: Option<DateTime<Utc>>,
}

impl Default for TraderStats {
    fn default() -> Self {
        Self {
            events: 0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: Decimal::ZERO,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            net_return: Decimal::ZERO,
            profit_factor: Decimal::ZERO,
            avg_return: Decimal::ZERO,
            best_trade: Decimal::ZERO,
            worst_trade: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            position: None,
            updated: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_return_long_and_short() {
        assert_eq!(position_return(PositionSide::Long, dec!(100), dec!(110)), dec!(10));
        assert_eq!(position_return(PositionSide::Short, dec!(100), dec!(110)), dec!(-10));
        assert_eq!(position_return(PositionSide::Long, Decimal::ZERO, dec!(5)), Decimal::ZERO);
    }

    #[test]
    fn test_token_active_user_requires_valid() {
        let now = Utc::now();
        let userid = Uuid::new_v4();
        let mut token = Token {
            id: "abc".to_string(),
            issuer: TokenIssuer::Tradebot,
            kind: AccountKind::User,
            userid: Some(userid),
            valid: false,
            created: now,
            updated: now,
        };
        assert_eq!(token.active_user(), None);
        token.valid = true;
        assert_eq!(token.active_user(), Some(userid));
    }

    #[test]
    fn test_subscription_patch_only_touches_given_fields() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let mut sub = Subscription {
            id: Uuid::new_v4(),
            userid: owner,
            providerid: Uuid::new_v4(),
            done: false,
            created: now,
            updated: now,
        };
        SubscriptionPatch::cancel().apply(&mut sub);
        assert!(sub.done);
        assert_eq!(sub.userid, owner);

        let recipient = Uuid::new_v4();
        SubscriptionPatch::transfer(recipient).apply(&mut sub);
        assert!(sub.done);
        assert_eq!(sub.userid, recipient);
    }

    #[test]
    fn test_user_serializes_kind_as_type() {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            kind: AccountKind::Provider,
            description: None,
            userid: None,
            created: now,
            updated: now,
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["type"], "provider");
        assert!(value.get("description").is_none());
    }
}
