// ===============================
// src/lib.rs
// ===============================
//! hedge_arena: timed trading rounds over a shared, shock-driven price feed.
//!
//! A [`lobby::Lobby`] owns profiles, the ticker catalog and games. Each
//! [`game::Game`] bundles the Round Clock, Event Dispatcher, Price Ledger,
//! Portfolio Store, Trade Executor, Scoring Engine and Leaderboard for one
//! game; [`scheduler::run`] drives it in real time.

pub mod bots;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod executor;
pub mod game;
pub mod leaderboard;
pub mod lobby;
pub mod metrics;
pub mod plan;
pub mod portfolio;
pub mod prices;
pub mod recorder;
pub mod scheduler;
pub mod scoring;

pub use errors::{EngineError, EngineResult};
pub use executor::TradeRequest;
pub use game::Game;
pub use lobby::Lobby;
