//! Real-time contest synchronisation client.
//!
//! Keeps a local view of a programming contest (phase, countdowns, leaderboard and the
//! user's registration) consistent with the server by combining REST fetches, a live push
//! channel and a smoothed estimate of the server clock.

pub mod config;
pub mod dto;
pub mod error;
/// Async plumbing: REST client, live channel and the per-contest driver.
pub mod services;
/// Single-owner contest state and its components.
pub mod state;

pub use config::SyncConfig;
pub use services::contest_sync::ContestSync;
