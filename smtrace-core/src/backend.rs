//! Kernel-side data used by variables and entity resolution.
//!
//! Some variables (CPU time, preemption and syscall counters) cannot be
//! computed from the userspace event alone; they ask a [`KernelBackend`]
//! for what happened to the entity over an interval.

use crate::event::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};

/// Source of per-thread kernel information.
pub trait KernelBackend {
    /// Number of `attribute` occurrences for `entity` in `[start, end]`.
    fn counter(
        &self,
        entity: EntityId,
        start: Timestamp,
        end: Timestamp,
        attribute: &str,
    ) -> Option<u64>;

    /// Nanoseconds `entity` spent running on any CPU in `[start, end]`.
    fn cpu_time(&self, entity: EntityId, start: Timestamp, end: Timestamp) -> Option<u64>;

    /// Entity running on `cpu` at `timestamp`.
    fn thread_on_cpu(&self, cpu: u32, timestamp: Timestamp) -> Option<EntityId>;
}

/// Backend with no kernel data; every query is unanswerable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackend;

impl KernelBackend for NoBackend {
    fn counter(&self, _: EntityId, _: Timestamp, _: Timestamp, _: &str) -> Option<u64> {
        None
    }

    fn cpu_time(&self, _: EntityId, _: Timestamp, _: Timestamp) -> Option<u64> {
        None
    }

    fn thread_on_cpu(&self, _: u32, _: Timestamp) -> Option<EntityId> {
        None
    }
}

/// A thread scheduled on a CPU over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRun {
    pub cpu: u32,
    pub entity: EntityId,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// A single counted occurrence (a syscall, a preemption, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    pub entity: EntityId,
    pub timestamp: Timestamp,
    pub attribute: String,
}

/// One line of a kernel log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelRecord {
    Run(ThreadRun),
    Counter(CounterSample),
}

/// In-memory kernel backend built from scheduling runs and counter samples.
#[derive(Debug, Default, Clone)]
pub struct KernelLog {
    runs: Vec<ThreadRun>,
    counters: Vec<CounterSample>,
}

impl KernelLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = KernelRecord>) -> Self {
        let mut log = Self::new();
        for record in records {
            log.push(record);
        }
        log
    }

    pub fn push(&mut self, record: KernelRecord) {
        match record {
            KernelRecord::Run(run) => self.runs.push(run),
            KernelRecord::Counter(sample) => self.counters.push(sample),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.counters.is_empty()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

impl KernelBackend for KernelLog {
    fn counter(
        &self,
        entity: EntityId,
        start: Timestamp,
        end: Timestamp,
        attribute: &str,
    ) -> Option<u64> {
        if self.counters.is_empty() {
            return None;
        }
        let count = self
            .counters
            .iter()
            .filter(|s| s.entity == entity && s.attribute == attribute)
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .count();
        Some(count as u64)
    }

    fn cpu_time(&self, entity: EntityId, start: Timestamp, end: Timestamp) -> Option<u64> {
        if self.runs.is_empty() {
            return None;
        }
        let total = self
            .runs
            .iter()
            .filter(|r| r.entity == entity)
            .map(|r| {
                let lo = r.start.max(start);
                let hi = r.end.min(end);
                hi.saturating_sub(lo)
            })
            .sum();
        Some(total)
    }

    fn thread_on_cpu(&self, cpu: u32, timestamp: Timestamp) -> Option<EntityId> {
        self.runs
            .iter()
            .find(|r| r.cpu == cpu && r.start <= timestamp && timestamp < r.end)
            .map(|r| r.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> KernelLog {
        KernelLog::from_records(vec![
            KernelRecord::Run(ThreadRun {
                cpu: 0,
                entity: EntityId(1),
                start: 0,
                end: 100,
            }),
            KernelRecord::Run(ThreadRun {
                cpu: 0,
                entity: EntityId(2),
                start: 100,
                end: 150,
            }),
            KernelRecord::Run(ThreadRun {
                cpu: 1,
                entity: EntityId(1),
                start: 150,
                end: 300,
            }),
            KernelRecord::Counter(CounterSample {
                entity: EntityId(1),
                timestamp: 20,
                attribute: "syscalls".to_string(),
            }),
            KernelRecord::Counter(CounterSample {
                entity: EntityId(1),
                timestamp: 250,
                attribute: "syscalls".to_string(),
            }),
            KernelRecord::Counter(CounterSample {
                entity: EntityId(1),
                timestamp: 100,
                attribute: "preempt".to_string(),
            }),
        ])
    }

    #[test]
    fn test_cpu_time_overlap() {
        let log = sample_log();
        assert_eq!(log.cpu_time(EntityId(1), 50, 200), Some(50 + 50));
        assert_eq!(log.cpu_time(EntityId(2), 0, 1000), Some(50));
        assert_eq!(log.cpu_time(EntityId(3), 0, 1000), Some(0));
    }

    #[test]
    fn test_counter_range() {
        let log = sample_log();
        assert_eq!(log.counter(EntityId(1), 0, 300, "syscalls"), Some(2));
        assert_eq!(log.counter(EntityId(1), 21, 300, "syscalls"), Some(1));
        assert_eq!(log.counter(EntityId(1), 0, 300, "preempt"), Some(1));
        assert_eq!(log.counter(EntityId(2), 0, 300, "preempt"), Some(0));
    }

    #[test]
    fn test_thread_on_cpu() {
        let log = sample_log();
        assert_eq!(log.thread_on_cpu(0, 50), Some(EntityId(1)));
        assert_eq!(log.thread_on_cpu(0, 100), Some(EntityId(2)));
        assert_eq!(log.thread_on_cpu(1, 100), None);
    }

    #[test]
    fn test_empty_log_is_unanswerable() {
        let log = KernelLog::new();
        assert!(log.is_empty());
        assert_eq!(log.cpu_time(EntityId(1), 0, 10), None);
        assert_eq!(log.counter(EntityId(1), 0, 10, "syscalls"), None);
        assert_eq!(NoBackend.cpu_time(EntityId(1), 0, 10), None);
    }

    #[test]
    fn test_record_json_shape() {
        let record: KernelRecord = serde_json::from_str(
            r#"{"counter": {"entity": 3, "timestamp": 5, "attribute": "preempt"}}"#,
        )
        .unwrap();
        assert!(matches!(record, KernelRecord::Counter(ref c) if c.entity == EntityId(3)));
    }
}
