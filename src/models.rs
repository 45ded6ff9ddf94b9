use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a wager within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetDirection {
    Buy,
    Sell,
}

impl BetDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetDirection::Buy => "buy",
            BetDirection::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(BetDirection::Buy),
            "sell" => Some(BetDirection::Sell),
            _ => None,
        }
    }
}

/// Binary outcome of a completed round. Shares wire values with BetDirection.
pub type RoundOutcome = BetDirection;

/// Win/lose verdict assigned to a bet by settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetResult {
    Win,
    Lose,
}

impl BetResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetResult::Win => "win",
            BetResult::Lose => "lose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "win" => Some(BetResult::Win),
            "lose" => Some(BetResult::Lose),
            _ => None,
        }
    }
}

/// Sub-phase of an active round, derived from time left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Betting,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Active,
    Completed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Active => "active",
            RoundStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RoundStatus::Active),
            "completed" => Some(RoundStatus::Completed),
            _ => None,
        }
    }
}

/// One fixed-duration betting cycle with a single binary outcome.
///
/// Invariant: `result` is set iff `status == Completed`; once set it is
/// never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_buy: f64,
    pub total_sell: f64,
    pub bet_count: i64,
    pub result: Option<RoundOutcome>,
    pub status: RoundStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A wager placed during a round's betting window. Created by the placement
/// path (out of scope here); read-only to everything except the one
/// settlement pass that closes its round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub round_id: String,
    pub user_id: String,
    pub direction: BetDirection,
    pub amount: f64,
    pub processed: bool,
    pub result: Option<BetResult>,
    pub round_result: Option<RoundOutcome>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Append-only ledger entry, exactly one per settled bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub kind: BetResult,
    pub amount: f64,
    pub round_id: String,
    pub bet_id: String,
    pub direction: BetDirection,
    pub round_result: RoundOutcome,
    pub created_at: DateTime<Utc>,
}

/// Read-only view of the committed engine state, servable at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub round_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub time_left: i64,
    pub phase: Phase,
}

/// Events published by the engine and fanned out to WebSocket clients.
/// Wire names are camelCase to match the frontend protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WsServerEvent {
    TimeUpdate(TimeUpdatePayload),
    RoundChange(RoundChangePayload),
    GameState(GameSnapshot),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeUpdatePayload {
    pub round_id: String,
    pub time_left: i64,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundChangePayload {
    pub round_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub time_left: i64,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub round_duration_secs: i64,
    pub betting_window_secs: i64,
    pub payout_multiplier: f64,
    pub tick_interval_ms: u64,
    pub recovery_delay_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./updown.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse()
            .unwrap_or(3001);

        let round_duration_secs = std::env::var("ROUND_DURATION_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let betting_window_secs = std::env::var("BETTING_WINDOW_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let payout_multiplier = std::env::var("PAYOUT_MULTIPLIER")
            .unwrap_or_else(|_| "1.9".to_string())
            .parse()
            .unwrap_or(1.9);

        let tick_interval_ms = std::env::var("TICK_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        let recovery_delay_secs = std::env::var("RECOVERY_DELAY_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        Ok(Self {
            database_path,
            port,
            round_duration_secs,
            betting_window_secs,
            payout_multiplier,
            tick_interval_ms,
            recovery_delay_secs,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./updown.db".to_string(),
            port: 3001,
            round_duration_secs: 60,
            betting_window_secs: 30,
            payout_multiplier: 1.9,
            tick_interval_ms: 1000,
            recovery_delay_secs: 5,
        }
    }
}
