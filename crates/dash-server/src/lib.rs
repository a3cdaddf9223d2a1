//! Dashboard HTTP server
//!
//! Wires the telemetry and container cores from `dash-core` into an axum
//! router, plus configuration loading.

pub mod api;
pub mod app;
pub mod config;
