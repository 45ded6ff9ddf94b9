//! UpDown Backend Library
//!
//! Exposes the round lifecycle engine, storage layer and API surface for
//! use by the binary and the integration tests.

pub mod api;
pub mod engine;
pub mod models;
pub mod storage;

use engine::EngineHandle;

/// Application state shared across handlers and the WebSocket fan-out.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}
