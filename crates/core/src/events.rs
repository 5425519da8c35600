use crate::models::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Trading intent carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    BuyEntry,
    SellEntry,
    ExitLong,
    ExitShort,
    ExitAll,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::BuyEntry => "buy_entry",
            SignalAction::SellEntry => "sell_entry",
            SignalAction::ExitLong => "exit_long",
            SignalAction::ExitShort => "exit_short",
            SignalAction::ExitAll => "exit_all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy_entry" => Some(SignalAction::BuyEntry),
            "sell_entry" => Some(SignalAction::SellEntry),
            "exit_long" => Some(SignalAction::ExitLong),
            "exit_short" => Some(SignalAction::ExitShort),
            "exit_all" => Some(SignalAction::ExitAll),
            _ => None,
        }
    }
}

/// Keys owned by the platform; callers cannot set them through free-form fields.
const RESERVED_FIELDS: &[&str] = &["id", "userid", "action", "ticker", "created"];

/// A signal pushed by a user or provider, stamped with the ticker at arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub userid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SignalAction>,
    pub ticker: Ticker,
    pub created: DateTime<Utc>,
    /// Everything else the caller sent.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(
        id: Option<Uuid>,
        userid: Uuid,
        action: Option<SignalAction>,
        ticker: Ticker,
        mut fields: Map<String, Value>,
    ) -> Self {
        for key in RESERVED_FIELDS {
            fields.remove(*key);
        }
        Self {
            id: id.unwrap_or_else(Uuid::new_v4),
            userid,
            action,
            ticker,
            created: Utc::now(),
            fields,
        }
    }
}

/// Result of an event upsert.
#[derive(Debug, Clone)]
pub struct Upserted {
    pub event: Event,
    /// False when an event with the same id was replaced.
    pub inserted: bool,
}
