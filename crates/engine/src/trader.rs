use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tradebot_core::*;
use uuid::Uuid;

use crate::metrics;

/// Position and trade history of a single user, rebuilt from their events.
#[derive(Debug, Clone)]
pub struct Trader {
    userid: Uuid,
    position: Option<OpenPosition>,
    trades: Vec<Trade>,
    events: u64,
    updated: Option<DateTime<Utc>>,
}

impl Trader {
    pub fn new(userid: Uuid) -> Self {
        Self {
            userid,
            position: None,
            trades: Vec::new(),
            events: 0,
            updated: None,
        }
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        self.position.as_ref()
    }

    /// Apply one event at its ticker's last price. Returns the trades it closed.
    pub fn consume(&mut self, event: &Event) -> Vec<Trade> {
        self.events += 1;
        self.updated = Some(event.created);

        let Some(action) = event.action else {
            return Vec::new();
        };

        let mut closed = Vec::new();
        match action {
            SignalAction::BuyEntry => {
                closed.extend(self.close_if(event, Some(PositionSide::Short)));
                self.open_if_flat(event, PositionSide::Long);
            }
            SignalAction::SellEntry => {
                closed.extend(self.close_if(event, Some(PositionSide::Long)));
                self.open_if_flat(event, PositionSide::Short);
            }
            SignalAction::ExitLong => closed.extend(self.close_if(event, Some(PositionSide::Long))),
            SignalAction::ExitShort => {
                closed.extend(self.close_if(event, Some(PositionSide::Short)))
            }
            SignalAction::ExitAll => closed.extend(self.close_if(event, None)),
        }

        self.trades.extend(closed.iter().cloned());
        closed
    }

    pub fn stats(&self) -> TraderStats {
        metrics::compute_stats(&self.trades, self.events, self.position.clone(), self.updated)
    }

    fn open_if_flat(&mut self, event: &Event, side: PositionSide) {
        if self.position.is_some() {
            return;
        }
        debug!(user = %self.userid, side = side.as_str(), price = %event.ticker.last_price, "Opening position");
        self.position = Some(OpenPosition {
            side,
            entry_price: event.ticker.last_price,
            entry_event: event.id,
            opened: event.created,
        });
    }

    /// Close the open position if it is on `side` (any side when `None`).
    fn close_if(&mut self, event: &Event, side: Option<PositionSide>) -> Option<Trade> {
        let matches = match (&self.position, side) {
            (Some(pos), Some(side)) => pos.side == side,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }

        let pos = self.position.take()?;
        let exit_price = event.ticker.last_price;
        let trade = Trade {
            id: Uuid::new_v4(),
            userid: self.userid,
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            return_pct: position_return(pos.side, pos.entry_price, exit_price),
            entry_event: pos.entry_event,
            exit_event: event.id,
            opened: pos.opened,
            closed: event.created,
        };
        debug!(user = %self.userid, return_pct = %trade.return_pct, "Closed position");
        Some(trade)
    }
}

/// All traders known to the platform, keyed by user id.
///
/// A trader exists once at least one event has been consumed for that user.
#[derive(Default)]
pub struct TraderRegistry {
    traders: RwLock<HashMap<Uuid, Trader>>,
}

impl TraderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed an event to its user's trader, creating the trader if needed.
    pub async fn consume(&self, event: &Event) -> Vec<Trade> {
        let mut traders = self.traders.write().await;
        traders
            .entry(event.userid)
            .or_insert_with(|| Trader::new(event.userid))
            .consume(event)
    }

    /// Apply an event to a copy of its user's trader. The registry is left
    /// unchanged until the copy is passed to [`commit`](Self::commit).
    pub async fn preview(&self, event: &Event) -> (Trader, Vec<Trade>) {
        let mut trader = self
            .traders
            .read()
            .await
            .get(&event.userid)
            .cloned()
            .unwrap_or_else(|| Trader::new(event.userid));
        let trades = trader.consume(event);
        (trader, trades)
    }

    /// Store a trader produced by [`preview`](Self::preview).
    pub async fn commit(&self, trader: Trader) {
        self.traders.write().await.insert(trader.userid, trader);
    }

    /// Stats for a user, if they have any events recorded.
    pub async fn get(&self, userid: Uuid) -> Option<TraderStats> {
        self.traders.read().await.get(&userid).map(Trader::stats)
    }

    /// Stats for a user, or empty stats without registering a trader.
    pub async fn stats_or_default(&self, userid: Uuid) -> TraderStats {
        self.get(userid).await.unwrap_or_default()
    }

    /// Ids of all traders, sorted.
    pub async fn keys(&self) -> Vec<Uuid> {
        let mut keys: Vec<Uuid> = self.traders.read().await.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Rebuild state from stored events (oldest first). Emitted trades are dropped
    /// since they were persisted when the events first arrived.
    pub async fn replay(&self, events: &[Event]) {
        for event in events {
            self.consume(event).await;
        }
        info!(
            events = events.len(),
            traders = self.traders.read().await.len(),
            "Trader state rebuilt"
        );
    }
}
