//! Trader stats engine.
//!
//! Turns each user's stream of signal events into positions and closed
//! trades, and summarizes them as [`TraderStats`](tradebot_core::TraderStats).

pub mod metrics;
pub mod trader;

pub use trader::{Trader, TraderRegistry};
