//! Host telemetry pipeline
//!
//! The [`AdaptivePoller`] samples the host through a [`HostMetricsProvider`]
//! and stores results in the [`TelemetryCache`], which keeps the latest
//! sample, a bounded [`RingHistory`], runs the [`AlertEngine`] and fans out
//! events through the [`Broadcaster`].

mod alerts;
mod broadcaster;
mod cache;
mod history;
mod poller;
mod provider;


pub use alerts::{AlertEngine, AlertThresholds, Threshold, DEFAULT_ALERT_COOLDOWN};
pub use broadcaster::{
    Broadcaster, PublishOutcome, Subscription, TelemetryEvent, DEFAULT_SUBSCRIBER_BUFFER,
};
pub use cache::{CacheConfig, TelemetryCache};
pub use history::{RingHistory, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_WINDOW};
pub use poller::{
    transition, AdaptivePoller, AdaptivePollerBuilder, PollerConfig, PollerState, Transition,
};
pub use provider::{
    CpuLoad, FsEntry, HostMetricsProvider, MemorySnapshot, NetInterface, NetStat,
    SysinfoProvider,
};
