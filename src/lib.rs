//! # Soul Signature Sync Library
//!
//! This library keeps OAuth connections alive and harvests platform data on a
//! schedule: a token refresh scheduler renews expiring access tokens, a poll
//! scheduler pulls raw activity from each connected platform, and an HTTP API
//! exposes manual triggers plus health checks.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod inflight;
pub mod models;
pub mod poller;
pub mod providers;
pub mod rate_limit;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
