//! Round lifecycle engine and its collaborators.
//!
//! Leaves first: `clock` (countdown + phase), `outcome` (pure resolver),
//! `settlement` (idempotent win/lose processing). `lifecycle` composes them
//! with the storage and broadcast collaborators into the state machine that
//! runs the game.

pub mod clock;
pub mod lifecycle;
pub mod outcome;
pub mod settlement;

pub use clock::RoundClock;
pub use lifecycle::{EngineConfig, EngineHandle, RoundLifecycleEngine};
pub use settlement::{SettlementProcessor, SettlementReport};
