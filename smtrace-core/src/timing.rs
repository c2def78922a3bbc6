//! Phase timing.
//!
//! The caller owns a [`TimingContext`] and opens a [`TimingScope`] per
//! phase; dropping the scope records the elapsed time.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Elapsed time of one named phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Measurement {
    pub name: String,
    pub elapsed_ns: u64,
    /// Items processed in the phase, if counted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<u64>,
}

impl Measurement {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns)
    }
}

/// Collected phase measurements.
#[derive(Debug, Default, Clone)]
pub struct TimingContext {
    measurements: Vec<Measurement>,
}

impl TimingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing a phase until the returned scope is dropped.
    pub fn scope(&mut self, name: impl Into<String>) -> TimingScope<'_> {
        TimingScope {
            ctx: self,
            name: name.into(),
            start: Instant::now(),
            items: None,
        }
    }

    pub fn record(&mut self, name: impl Into<String>, elapsed: Duration, items: Option<u64>) {
        self.measurements.push(Measurement {
            name: name.into(),
            elapsed_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            items,
        });
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Last measurement recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&Measurement> {
        self.measurements.iter().rev().find(|m| m.name == name)
    }

    pub fn total(&self) -> Duration {
        self.measurements.iter().map(Measurement::elapsed).sum()
    }
}

/// Open phase; records its duration on drop.
pub struct TimingScope<'a> {
    ctx: &'a mut TimingContext,
    name: String,
    start: Instant,
    items: Option<u64>,
}

impl TimingScope<'_> {
    pub fn set_items(&mut self, items: u64) {
        self.items = Some(items);
    }
}

impl Drop for TimingScope<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        debug!(
            phase = %self.name,
            elapsed_us = elapsed.as_micros() as u64,
            items = ?self.items,
            "phase complete"
        );
        let name = std::mem::take(&mut self.name);
        self.ctx.record(name, elapsed, self.items);
    }
}
