//! Settlement Processor
//!
//! Closes out the wagers of a finished round: one atomic batch marks every
//! unprocessed bet with its win/lose verdict, then the per-bet credit and
//! ledger operations run as an unordered set of futures joined before
//! settlement is considered complete. Repeat invocations filter on
//! `processed = false`, so nothing is ever re-marked or re-credited.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Bet, BetResult, LedgerEntry, RoundOutcome};
use crate::storage::{BetSettlement, RoundStore};

#[derive(Debug, Clone, Default)]
pub struct SettlementReport {
    pub settled: usize,
    pub wins: usize,
    pub losses: usize,
    pub credited: f64,
}

pub struct SettlementProcessor<S: RoundStore> {
    store: Arc<S>,
    payout_multiplier: f64,
}

impl<S: RoundStore> SettlementProcessor<S> {
    pub fn new(store: Arc<S>, payout_multiplier: f64) -> Self {
        Self {
            store,
            payout_multiplier,
        }
    }

    /// Settle every unprocessed bet of `round_id` against `result`.
    ///
    /// If the batch commit fails, no bet is marked and the error propagates.
    /// If a post-batch credit fails, the error also propagates, but the
    /// marked bets stay marked; `reconcile` repairs the missing credits on
    /// the next initialization.
    pub async fn settle(
        &self,
        round_id: &str,
        result: RoundOutcome,
    ) -> Result<SettlementReport> {
        let bets = self
            .store
            .unprocessed_bets(round_id)
            .await
            .context("load unprocessed bets")?;
        if bets.is_empty() {
            return Ok(SettlementReport::default());
        }

        let now = Utc::now();
        let updates: Vec<BetSettlement> = bets
            .iter()
            .map(|bet| BetSettlement {
                bet_id: bet.id.clone(),
                result: verdict(bet.direction, result),
                round_result: result,
            })
            .collect();

        self.store
            .mark_bets_settled(&updates, now)
            .await
            .context("settlement batch commit")?;

        self.apply_ledger(&bets, result, now).await
    }

    /// Re-apply the credit/ledger step for processed bets whose ledger row
    /// never landed. Safe to run any number of times: the per-bet credit is
    /// keyed on the ledger row's `bet_id`.
    pub async fn reconcile(&self) -> Result<usize> {
        let stranded = self
            .store
            .settled_bets_missing_ledger()
            .await
            .context("scan for uncredited settled bets")?;
        if stranded.is_empty() {
            return Ok(0);
        }

        let mut repaired = 0usize;
        for bet in &stranded {
            let Some(round_result) = bet.round_result else {
                warn!(bet_id = %bet.id, "settled bet missing round result; skipping");
                continue;
            };
            self.apply_one(bet, round_result, Utc::now())
                .await
                .with_context(|| format!("reconcile bet {}", bet.id))?;
            repaired += 1;
        }
        Ok(repaired)
    }

    async fn apply_ledger(
        &self,
        bets: &[Bet],
        result: RoundOutcome,
        now: DateTime<Utc>,
    ) -> Result<SettlementReport> {
        let mut report = SettlementReport {
            settled: bets.len(),
            ..Default::default()
        };

        let outcomes = join_all(bets.iter().map(|bet| async move {
            let applied = self.apply_one(bet, result, now).await;
            (bet, applied)
        }))
        .await;

        let mut failures = 0usize;
        for (bet, applied) in outcomes {
            match applied {
                Ok(verdict) => match verdict {
                    BetResult::Win => {
                        report.wins += 1;
                        report.credited += bet.amount * self.payout_multiplier;
                    }
                    BetResult::Lose => report.losses += 1,
                },
                Err(e) => {
                    warn!(bet_id = %bet.id, "ledger operation failed: {e:#}");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(anyhow!(
                "{failures} of {} ledger operations failed; reconciliation will repair them",
                bets.len()
            ));
        }
        Ok(report)
    }

    async fn apply_one(
        &self,
        bet: &Bet,
        result: RoundOutcome,
        now: DateTime<Utc>,
    ) -> Result<BetResult> {
        let verdict = verdict(bet.direction, result);
        let amount = match verdict {
            BetResult::Win => bet.amount * self.payout_multiplier,
            BetResult::Lose => bet.amount,
        };
        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            user_id: bet.user_id.clone(),
            kind: verdict,
            amount,
            round_id: bet.round_id.clone(),
            bet_id: bet.id.clone(),
            direction: bet.direction,
            round_result: result,
            created_at: now,
        };
        match verdict {
            BetResult::Win => self.store.apply_win_credit(&entry).await?,
            BetResult::Lose => self.store.record_loss(&entry).await?,
        }
        Ok(verdict)
    }
}

fn verdict(direction: crate::models::BetDirection, result: RoundOutcome) -> BetResult {
    if direction == result {
        BetResult::Win
    } else {
        BetResult::Lose
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BetDirection;
    use crate::storage::GameDb;
    use chrono::Duration;
    use tempfile::tempdir;

    async fn seeded_round(db: &GameDb) -> (String, Vec<String>) {
        let now = Utc::now();
        let round = db
            .create_round(now - Duration::seconds(60), now)
            .await
            .expect("create round");
        db.upsert_user("alice", 0.0).await.expect("alice");
        db.upsert_user("bob", 0.0).await.expect("bob");
        db.upsert_user("carol", 0.0).await.expect("carol");

        let b1 = db
            .insert_bet(&round.id, "alice", BetDirection::Buy, 100.0)
            .await
            .expect("b1");
        let b2 = db
            .insert_bet(&round.id, "bob", BetDirection::Sell, 40.0)
            .await
            .expect("b2");
        let b3 = db
            .insert_bet(&round.id, "carol", BetDirection::Buy, 10.0)
            .await
            .expect("b3");
        (round.id, vec![b1.id, b2.id, b3.id])
    }

    #[tokio::test]
    async fn test_settle_assigns_verdicts_and_credits_winners() {
        let dir = tempdir().expect("tempdir");
        let db = Arc::new(GameDb::new(dir.path().join("g.db").to_str().unwrap()).expect("db"));
        let (round_id, _) = seeded_round(&db).await;

        let processor = SettlementProcessor::new(db.clone(), 1.9);
        let report = processor
            .settle(&round_id, BetDirection::Buy)
            .await
            .expect("settle");

        assert_eq!(report.settled, 3);
        assert_eq!(report.wins, 2);
        assert_eq!(report.losses, 1);
        // Win credits are exactly amount * 1.9 for direction == result.
        assert_eq!(report.credited, 100.0 * 1.9 + 10.0 * 1.9);
        assert_eq!(db.user_balance("alice").await.expect("alice"), 100.0 * 1.9);
        assert_eq!(db.user_balance("carol").await.expect("carol"), 10.0 * 1.9);
        // Losing bets receive no credit.
        assert_eq!(db.user_balance("bob").await.expect("bob"), 0.0);

        // One ledger row per settled bet.
        let ledger = db.ledger_for_round(&round_id).await.expect("ledger");
        assert_eq!(ledger.len(), 3);
        assert_eq!(
            ledger.iter().filter(|e| e.kind == BetResult::Win).count(),
            2
        );
        assert!(db.unprocessed_bets(&round_id).await.expect("left").is_empty());
    }

    #[tokio::test]
    async fn test_settle_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let db = Arc::new(GameDb::new(dir.path().join("g.db").to_str().unwrap()).expect("db"));
        let (round_id, _) = seeded_round(&db).await;

        let processor = SettlementProcessor::new(db.clone(), 1.9);
        processor
            .settle(&round_id, BetDirection::Buy)
            .await
            .expect("first");
        let second = processor
            .settle(&round_id, BetDirection::Buy)
            .await
            .expect("second");

        assert_eq!(second.settled, 0);
        assert_eq!(db.user_balance("alice").await.expect("alice"), 100.0 * 1.9);
        assert_eq!(db.ledger_for_round(&round_id).await.expect("ledger").len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_uncredited_wins() {
        let dir = tempdir().expect("tempdir");
        let db = Arc::new(GameDb::new(dir.path().join("g.db").to_str().unwrap()).expect("db"));
        let (round_id, bet_ids) = seeded_round(&db).await;

        // Batch commit landed but the process died before any credit ran.
        let bets = db.unprocessed_bets(&round_id).await.expect("bets");
        let updates: Vec<BetSettlement> = bets
            .iter()
            .map(|b| BetSettlement {
                bet_id: b.id.clone(),
                result: verdict(b.direction, BetDirection::Buy),
                round_result: BetDirection::Buy,
            })
            .collect();
        db.mark_bets_settled(&updates, Utc::now()).await.expect("batch");

        let processor = SettlementProcessor::new(db.clone(), 1.9);
        let repaired = processor.reconcile().await.expect("reconcile");
        assert_eq!(repaired, bet_ids.len());
        assert_eq!(db.user_balance("alice").await.expect("alice"), 100.0 * 1.9);
        assert_eq!(db.user_balance("bob").await.expect("bob"), 0.0);

        // A second pass finds nothing left to repair.
        assert_eq!(processor.reconcile().await.expect("again"), 0);
        assert_eq!(db.user_balance("alice").await.expect("alice"), 100.0 * 1.9);
    }

    #[tokio::test]
    async fn test_settle_empty_round_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let db = Arc::new(GameDb::new(dir.path().join("g.db").to_str().unwrap()).expect("db"));
        let now = Utc::now();
        let round = db
            .create_round(now - Duration::seconds(60), now)
            .await
            .expect("round");

        let processor = SettlementProcessor::new(db.clone(), 1.9);
        let report = processor
            .settle(&round.id, BetDirection::Sell)
            .await
            .expect("settle");
        assert_eq!(report.settled, 0);
        assert!(db.ledger_for_round(&round.id).await.expect("ledger").is_empty());
    }
}
