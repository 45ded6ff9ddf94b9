//! Persistence collaborators for the round lifecycle engine.
//!
//! The engine only sees the `RoundStore` trait; `GameDb` is the SQLite
//! implementation used in production. Every operation fails with a plain
//! `anyhow::Error`, treated uniformly by the engine as recoverable.

mod game_db;

pub use game_db::GameDb;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Bet, BetResult, LedgerEntry, Round, RoundOutcome};

/// Per-bet verdict applied by the settlement batch commit.
#[derive(Debug, Clone)]
pub struct BetSettlement {
    pub bet_id: String,
    pub result: BetResult,
    pub round_result: RoundOutcome,
}

#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Most recently created round, if any.
    async fn fetch_latest_round(&self) -> Result<Option<Round>>;

    async fn create_round(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Round>;

    async fn fetch_round(&self, round_id: &str) -> Result<Option<Round>>;

    /// Persist the outcome of a round and mark it completed. The update is
    /// guarded on `result IS NULL`, so an already-set result is never
    /// overwritten.
    async fn set_round_result(
        &self,
        round_id: &str,
        result: RoundOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Bets for a round that have not been touched by settlement yet.
    async fn unprocessed_bets(&self, round_id: &str) -> Result<Vec<Bet>>;

    /// Mark a set of bets settled in one all-or-nothing batch.
    async fn mark_bets_settled(
        &self,
        updates: &[BetSettlement],
        processed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Credit a winning bet: balance increment plus the win ledger row,
    /// committed together. Keyed on `bet_id`, so a repeat is a no-op.
    async fn apply_win_credit(&self, entry: &LedgerEntry) -> Result<()>;

    /// Append the loss ledger row for a losing bet. No balance change; the
    /// stake was deducted at placement. Keyed on `bet_id` like wins.
    async fn record_loss(&self, entry: &LedgerEntry) -> Result<()>;

    /// Processed bets whose ledger row is missing: the feed for the
    /// reconciliation pass that repairs credits lost to a crash between the
    /// settlement batch commit and the per-bet credit step.
    async fn settled_bets_missing_ledger(&self) -> Result<Vec<Bet>>;
}
