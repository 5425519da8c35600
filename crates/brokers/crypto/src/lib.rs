//! Crypto exchange adapters.
//!
//! Public REST market data from Bybit v5, used to stamp consumed events
//! with the current quote.

pub mod bybit;

pub use bybit::{BybitConfig, BybitTickerClient};
