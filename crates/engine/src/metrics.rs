use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tradebot_core::*;

/// Profit factor reported when there are winners but no losers.
const PROFIT_FACTOR_CAP: Decimal = dec!(999.99);

/// Compute aggregate trader stats from the closed trade log.
pub fn compute_stats(
    trades: &[Trade],
    events: u64,
    position: Option<OpenPosition>,
    updated: Option<DateTime<Utc>>,
) -> TraderStats {
    let total_trades = trades.len();
    let winning_trades = trades.iter().filter(|t| t.is_winner()).count();
    let losing_trades = trades.iter().filter(|t| t.is_loser()).count();

    let gross_profit: Decimal = trades
        .iter()
        .filter(|t| t.is_winner())
        .map(|t| t.return_pct)
        .sum();

    let gross_loss: Decimal = trades
        .iter()
        .filter(|t| t.is_loser())
        .map(|t| t.return_pct.abs())
        .sum();

    let net_return: Decimal = trades.iter().map(|t| t.return_pct).sum();

    let win_rate = if total_trades == 0 {
        Decimal::ZERO
    } else {
        Decimal::from(winning_trades) / Decimal::from(total_trades) * dec!(100)
    };

    let profit_factor = if gross_loss.is_zero() {
        if gross_profit > Decimal::ZERO {
            PROFIT_FACTOR_CAP
        } else {
            Decimal::ZERO
        }
    } else {
        gross_profit / gross_loss
    };

    let avg_return = if total_trades == 0 {
        Decimal::ZERO
    } else {
        net_return / Decimal::from(total_trades)
    };

    let best_trade = trades
        .iter()
        .map(|t| t.return_pct)
        .max()
        .unwrap_or(Decimal::ZERO);

    let worst_trade = trades
        .iter()
        .map(|t| t.return_pct)
        .min()
        .unwrap_or(Decimal::ZERO);

    TraderStats {
        events,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        gross_profit,
        gross_loss,
        net_return,
        profit_factor,
        avg_return,
        best_trade,
        worst_trade,
        max_drawdown: compute_max_drawdown(trades),
        position,
        updated,
    }
}

/// Largest peak-to-trough fall of the cumulative return curve, starting flat.
fn compute_max_drawdown(trades: &[Trade]) -> Decimal {
    let mut equity = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut max_drawdown = Decimal::ZERO;

    for trade in trades {
        equity += trade.return_pct;
        if equity > peak {
            peak = equity;
        }
        let drawdown = peak - equity;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
        }
    }

    max_drawdown
}
