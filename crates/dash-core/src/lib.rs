//! Core library for the self-hosted ops dashboard
//!
//! This crate provides the core functionality for:
//! - Host telemetry polling, history, alerts and fan-out
//! - Bounded-concurrency container stats with request coalescing
//! - Rate limiting for the container API
//! - Health checks and observability

pub mod clock;
pub mod docker;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod rate_limit;
pub mod telemetry;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{DashboardMetrics, StructuredLogger};
pub use rate_limit::{RateLimited, RateLimiter};
