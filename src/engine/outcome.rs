//! Outcome Resolver
//!
//! Pure mapping from aggregate wager totals and a random sample to the
//! round's binary result. The sample is an explicit input so the function
//! stays deterministic and testable; production draws it from `thread_rng`.
//!
//! Half the time the minority side is rewarded, half the time the majority
//! side: a deliberate asymmetric payout shape, not a neutral coin flip. An
//! empty pool yields `buy_ratio = 0`, which biases the no-bets case toward
//! buy on the minority branch and sell on the majority branch; preserved as
//! documented behavior.

use crate::models::{BetDirection, RoundOutcome};

pub fn resolve(total_buy: f64, total_sell: f64, sample: f64) -> RoundOutcome {
    let pool = total_buy + total_sell;
    let buy_ratio = if pool > 0.0 { total_buy / pool } else { 0.0 };

    if sample < 0.5 {
        // Minority-favoring branch.
        if buy_ratio >= 0.5 {
            BetDirection::Sell
        } else {
            BetDirection::Buy
        }
    } else {
        // Majority-favoring branch.
        if buy_ratio >= 0.5 {
            BetDirection::Buy
        } else {
            BetDirection::Sell
        }
    }
}
