//! Threshold alerts with per-level cooldown
//!
//! Each metric is compared against a warning and a critical threshold. Only
//! the highest level reached is reported. Every `type:level` pair has its own
//! cooldown, so a sustained incident re-alerts once per window.

use crate::models::{AlertEvent, AlertLevel, AlertType, Sample};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Default cooldown between two alerts of the same type and level (5 minutes)
pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Warning/critical pair for one metric, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    /// Highest level reached by `value`, inclusive on both bounds
    pub fn level_for(&self, value: f64) -> Option<(AlertLevel, f64)> {
        if value >= self.critical {
            Some((AlertLevel::Critical, self.critical))
        } else if value >= self.warning {
            Some((AlertLevel::Warning, self.warning))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub cpu: Threshold,
    pub memory: Threshold,
    pub storage: Threshold,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: Threshold::new(85.0, 95.0),
            memory: Threshold::new(80.0, 90.0),
            storage: Threshold::new(85.0, 95.0),
        }
    }
}

impl AlertThresholds {
    pub fn for_type(&self, alert_type: AlertType) -> &Threshold {
        match alert_type {
            AlertType::Cpu => &self.cpu,
            AlertType::Memory => &self.memory,
            AlertType::Storage => &self.storage,
        }
    }
}

/// Threshold evaluator with cooldown bookkeeping
pub struct AlertEngine {
    thresholds: AlertThresholds,
    cooldown_millis: i64,
    /// `type:level` -> last emission (Unix ms)
    last_fired: Mutex<HashMap<String, i64>>,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(AlertThresholds::default())
    }
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            cooldown_millis: DEFAULT_ALERT_COOLDOWN.as_millis() as i64,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Set a custom cooldown window
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_millis = cooldown.as_millis() as i64;
        self
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Evaluate a sample at `now` (Unix ms) and return the alerts to emit.
    ///
    /// The cooldown check and the update of `last_fired` happen under the same
    /// lock, so concurrent evaluations cannot both emit the same key.
    pub fn evaluate(&self, sample: &Sample, now: i64) -> Vec<AlertEvent> {
        let mut last_fired = self
            .last_fired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut events = Vec::new();
        for alert_type in AlertType::ALL {
            let value = alert_type.value_of(sample);
            let Some((level, threshold)) = self.thresholds.for_type(alert_type).level_for(value)
            else {
                continue;
            };

            let key = AlertEvent::key(alert_type, level);
            if let Some(&last) = last_fired.get(&key) {
                if now - last < self.cooldown_millis {
                    continue;
                }
            }

            last_fired.insert(key.clone(), now);
            events.push(AlertEvent {
                id: key,
                alert_type,
                level,
                value,
                threshold,
                timestamp: now,
            });
        }

        events
    }

    /// Forget cooldown entries older than the window
    pub fn prune(&self, now: i64) {
        let mut last_fired = self
            .last_fired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last_fired.retain(|_, last| now - *last < self.cooldown_millis);
    }
}
