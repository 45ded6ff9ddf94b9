//! Round Lifecycle Engine
//!
//! The single writer of round state. One spawned task owns the current
//! round and drives every transition off a 1-second tick: recompute time
//! left, publish a time update, and on zero enter the finalize sequence
//! (resolve outcome → persist → settle → create successor → announce).
//! The finalize sequence runs inline in the tick task, so no tick can
//! overlap it and a round is finalized at most once per closure.
//!
//! Any failure inside the finalize sequence escalates to recovery: wait a
//! fixed delay, then reinitialize from durable state. Reinitialization
//! re-reads the latest persisted round, finishes its finalize sequence if
//! a result is already stored, and re-runs the settlement reconciliation
//! pass, so repeated failures only delay progress; they never double-pay
//! or skip a round.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::engine::{clock::RoundClock, outcome, settlement::SettlementProcessor};
use crate::models::{
    Config, GameSnapshot, Round, RoundChangePayload, TimeUpdatePayload, WsServerEvent,
};
use crate::storage::RoundStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub round_duration_secs: i64,
    pub betting_window_secs: i64,
    pub payout_multiplier: f64,
    pub tick_interval: Duration,
    pub recovery_delay: Duration,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            round_duration_secs: cfg.round_duration_secs,
            betting_window_secs: cfg.betting_window_secs,
            payout_multiplier: cfg.payout_multiplier,
            tick_interval: Duration::from_millis(cfg.tick_interval_ms),
            recovery_delay: Duration::from_secs(cfg.recovery_delay_secs),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Cheap read-side handle: committed-state snapshots plus event
/// subscriptions. The transport layer holds one of these and carries no
/// game logic of its own.
#[derive(Clone)]
pub struct EngineHandle {
    committed: Arc<RwLock<Option<Round>>>,
    events: broadcast::Sender<WsServerEvent>,
    clock: RoundClock,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<WsServerEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the last fully committed round, with time left and phase
    /// recomputed against the wall clock at read time. Never exposes
    /// half-finalized state: the engine swaps the committed round only
    /// after the successor exists.
    pub fn state(&self) -> Option<GameSnapshot> {
        let committed = self.committed.read();
        committed
            .as_ref()
            .map(|round| self.clock.snapshot(round, Utc::now()))
    }
}

type OutcomeSampler = Box<dyn Fn() -> f64 + Send + Sync>;

pub struct RoundLifecycleEngine<S: RoundStore> {
    store: Arc<S>,
    settlement: SettlementProcessor<S>,
    clock: RoundClock,
    cfg: EngineConfig,
    events: broadcast::Sender<WsServerEvent>,
    committed: Arc<RwLock<Option<Round>>>,
    current: Option<Round>,
    sampler: OutcomeSampler,
}

impl<S: RoundStore + 'static> RoundLifecycleEngine<S> {
    pub fn new(store: Arc<S>, cfg: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let settlement = SettlementProcessor::new(store.clone(), cfg.payout_multiplier);
        let clock = RoundClock::new(cfg.round_duration_secs, cfg.betting_window_secs);
        Self {
            store,
            settlement,
            clock,
            cfg,
            events,
            committed: Arc::new(RwLock::new(None)),
            current: None,
            sampler: Box::new(|| rand::thread_rng().gen::<f64>()),
        }
    }

    /// Spawn the engine onto the runtime and return its read-side handle.
    pub fn spawn(store: Arc<S>, cfg: EngineConfig) -> EngineHandle {
        let engine = Self::new(store, cfg);
        let handle = engine.handle();
        tokio::spawn(engine.run());
        handle
    }

    /// Replace the outcome sample source. Production keeps the default
    /// thread-rng draw; tests inject fixed samples.
    pub fn with_sampler(mut self, sampler: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            committed: self.committed.clone(),
            events: self.events.clone(),
            clock: self.clock,
        }
    }

    /// Run forever: initialize, tick until a finalize sequence fails, then
    /// recover and reinitialize. There is no retry ceiling; a permanently
    /// broken store shows up as a stall in time updates, not a crash.
    pub async fn run(mut self) {
        info!("🎰 Round lifecycle engine starting");
        loop {
            if let Err(e) = self.initialize().await {
                warn!(
                    "initialization failed: {e:#}; retrying in {:?}",
                    self.cfg.recovery_delay
                );
                tokio::time::sleep(self.cfg.recovery_delay).await;
                continue;
            }

            if let Err(e) = self.drive().await {
                error!(
                    "finalize sequence failed: {e:#}; reinitializing in {:?}",
                    self.cfg.recovery_delay
                );
                tokio::time::sleep(self.cfg.recovery_delay).await;
            }
        }
    }

    /// Resume the latest persisted round, finish its finalize sequence if a
    /// result is already stored, or open a fresh round if none exists. Also
    /// repairs credits stranded by a crash mid-settlement before any ticking
    /// resumes.
    pub async fn initialize(&mut self) -> Result<()> {
        let latest = self
            .store
            .fetch_latest_round()
            .await
            .context("load latest round")?;

        match latest {
            Some(r) if r.result.is_none() => {
                let time_left = self.clock.time_left(r.end_time, Utc::now());
                info!(round_id = %r.id, time_left, "resuming persisted round");
                self.commit_round(r);
            }
            Some(r) => {
                // The previous instance resolved this round but may have
                // died before settling it or opening the successor. Finish
                // the finalize sequence; already-processed bets are skipped.
                info!(round_id = %r.id, "finishing interrupted finalization");
                self.finalize(&r.id).await?;
            }
            None => {
                let round = self.open_round(Utc::now()).await?;
                info!(round_id = %round.id, "opened fresh round");
                self.commit_round(round);
            }
        }

        let repaired = self
            .settlement
            .reconcile()
            .await
            .context("reconcile settled bets")?;
        if repaired > 0 {
            warn!("repaired {repaired} settled bets with missing ledger entries");
        }
        Ok(())
    }

    /// Tick loop. Runs until a finalize sequence fails; the caller decides
    /// how to recover. The interval is reset after each finalization so the
    /// successor round starts with a full tick.
    async fn drive(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.tick(Utc::now()).await? {
                ticker.reset();
            }
        }
    }

    /// One clock tick: publish a time update and, on reaching zero, run the
    /// full finalize sequence. Returns true when a finalization happened.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let round = self
            .current
            .clone()
            .context("tick before initialization")?;

        let time_left = self.clock.time_left(round.end_time, now);
        let _ = self.events.send(WsServerEvent::TimeUpdate(TimeUpdatePayload {
            round_id: round.id.clone(),
            time_left,
            phase: self.clock.phase(time_left),
        }));

        if time_left > 0 {
            return Ok(false);
        }

        self.finalize(&round.id).await?;
        Ok(true)
    }

    /// Finalize sequence: resolve (or reuse) the outcome, settle wagers,
    /// create the successor round, then publish the round change. Every
    /// step re-reads durable state, so a rerun after a partial failure
    /// picks up exactly where the durable state says it is.
    async fn finalize(&mut self, round_id: &str) -> Result<()> {
        info!(round_id, "round ended; finalizing");

        let round = self
            .store
            .fetch_round(round_id)
            .await
            .context("load round for finalization")?
            .with_context(|| format!("round {round_id} vanished during finalization"))?;

        let result = match round.result {
            Some(result) => {
                // A prior instance already resolved this round before a
                // restart; reuse the stored result.
                info!(round_id, result = result.as_str(), "reusing persisted result");
                result
            }
            None => {
                let sample = (self.sampler)();
                let result = outcome::resolve(round.total_buy, round.total_sell, sample);
                self.store
                    .set_round_result(&round.id, result, Utc::now())
                    .await
                    .context("persist round result")?;
                info!(
                    round_id,
                    result = result.as_str(),
                    total_buy = round.total_buy,
                    total_sell = round.total_sell,
                    "round result persisted"
                );
                result
            }
        };

        let report = self
            .settlement
            .settle(&round.id, result)
            .await
            .context("settle round")?;
        if report.settled > 0 {
            info!(
                round_id,
                settled = report.settled,
                wins = report.wins,
                losses = report.losses,
                credited = report.credited,
                "settlement complete"
            );
        }

        let successor = self.open_round(Utc::now()).await?;
        let time_left = self.clock.time_left(successor.end_time, Utc::now());
        info!(round_id = %successor.id, "new round started");

        let payload = RoundChangePayload {
            round_id: successor.id.clone(),
            start_time: successor.start_time,
            end_time: successor.end_time,
            time_left,
        };
        self.commit_round(successor);
        let _ = self.events.send(WsServerEvent::RoundChange(payload));

        Ok(())
    }

    async fn open_round(&self, now: DateTime<Utc>) -> Result<Round> {
        let end = now + ChronoDuration::seconds(self.cfg.round_duration_secs);
        self.store
            .create_round(now, end)
            .await
            .context("create round")
    }

    fn commit_round(&mut self, round: Round) {
        *self.committed.write() = Some(round.clone());
        self.current = Some(round);
    }
}
