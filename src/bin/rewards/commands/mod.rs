//! CLI commands

pub mod claim;
pub mod leaderboard;
pub mod pending;
pub mod prizes;
pub mod retry;
pub mod verify;
