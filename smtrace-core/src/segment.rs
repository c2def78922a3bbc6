//! Validity segments.
//!
//! Once the stream is finalized, step histories are folded into time ranges
//! labelled with the constraints that were violated over them. Segments
//! sharing the same range, entity and status are merged.

use crate::constraint::{Constraint, ConstraintId, StatusValue, Verdict};
use crate::event::{EntityId, Timestamp};
use crate::instance::{Instance, TimeRange};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A time range of an entity, valid or labelled with violated constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub start: Timestamp,
    pub end: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_constraints: Vec<String>,
}

impl Segment {
    pub fn valid(range: TimeRange, entity: Option<EntityId>) -> Self {
        Self {
            start: range.start,
            end: range.end,
            entity,
            invalid_constraints: Vec::new(),
        }
    }

    pub fn invalid(range: TimeRange, entity: Option<EntityId>, constraint: String) -> Self {
        Self {
            start: range.start,
            end: range.end,
            entity,
            invalid_constraints: vec![constraint],
        }
    }

    pub fn status(&self) -> StatusValue {
        if self.invalid_constraints.is_empty() {
            StatusValue::Valid
        } else {
            StatusValue::Invalid
        }
    }

    pub fn duration(&self) -> Timestamp {
        self.end.saturating_sub(self.start)
    }

    fn key(&self) -> SegmentKey {
        (self.start, self.end, self.entity, self.status())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start={} end={} duration={}",
            self.start,
            self.end,
            self.duration()
        )?;
        match self.entity {
            Some(entity) => write!(f, " tid={}", entity)?,
            None => f.write_str(" tid=-")?,
        }
        write!(f, " status={}", self.status())?;
        if !self.invalid_constraints.is_empty() {
            write!(f, " invalid=[{}]", self.invalid_constraints.join(", "))?;
        }
        Ok(())
    }
}

type SegmentKey = (Timestamp, Timestamp, Option<EntityId>, StatusValue);

/// Deduplicated segment set, in insertion order.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct SegmentStore {
    segments: Vec<Segment>,
    #[serde(skip)]
    index: HashMap<SegmentKey, usize>,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment, merging its labels into an existing segment with the
    /// same range, entity and status.
    pub fn insert(&mut self, segment: Segment) {
        let key = segment.key();
        match self.index.get(&key) {
            Some(&i) => {
                let existing = &mut self.segments[i];
                for label in segment.invalid_constraints {
                    if !existing.invalid_constraints.contains(&label) {
                        existing.invalid_constraints.push(label);
                    }
                }
            }
            None => {
                self.index.insert(key, self.segments.len());
                self.segments.push(segment);
            }
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn invalid(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| s.status() == StatusValue::Invalid)
    }

    pub fn into_vec(self) -> Vec<Segment> {
        self.segments
    }
}

/// A verdict of one step of one instance.
#[derive(Debug, Clone, Copy)]
pub struct StepVerdict<'a> {
    pub instance: &'a Instance,
    pub step: usize,
    pub verdict: &'a Verdict,
}

impl StepVerdict<'_> {
    pub fn timestamp(&self) -> Timestamp {
        self.instance.steps()[self.step].timestamp()
    }
}

/// Turns the invalid and valid steps of one constraint into segments.
pub trait SegmentProducer {
    fn produce(
        &self,
        constraint: &Constraint,
        label: &str,
        invalid: &[StepVerdict<'_>],
        valid: &[StepVerdict<'_>],
        store: &mut SegmentStore,
    );
}

/// Emits the interval of the constrained variable for every step.
///
/// The interval runs from the step that (re)initialized the variable to the
/// step itself. When the value came from an event field the step's own
/// timestamp is used.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableIntervalProducer;

impl VariableIntervalProducer {
    fn range(constraint: &Constraint, at: &StepVerdict<'_>) -> TimeRange {
        at.instance
            .variable_interval(at.step, constraint.variable())
            .unwrap_or_else(|| TimeRange::new(at.timestamp(), at.timestamp()))
    }
}

impl SegmentProducer for VariableIntervalProducer {
    fn produce(
        &self,
        constraint: &Constraint,
        label: &str,
        invalid: &[StepVerdict<'_>],
        valid: &[StepVerdict<'_>],
        store: &mut SegmentStore,
    ) {
        for at in invalid {
            store.insert(Segment::invalid(
                Self::range(constraint, at),
                at.instance.entity(),
                label.to_string(),
            ));
        }
        for at in valid {
            store.insert(Segment::valid(
                Self::range(constraint, at),
                at.instance.entity(),
            ));
        }
    }
}

struct Bucket<'a> {
    constraint: Arc<Constraint>,
    label: String,
    invalid: Vec<StepVerdict<'a>>,
    valid: Vec<StepVerdict<'a>>,
}

/// Buckets verdicts per constraint and hands every constraint that was
/// violated at least once to `producer`.
pub fn extract_segments(instances: &[Instance], producer: &dyn SegmentProducer) -> SegmentStore {
    let mut buckets: BTreeMap<ConstraintId, Bucket<'_>> = BTreeMap::new();

    for instance in instances {
        for (step, s) in instance.steps().iter().enumerate() {
            for verdict in s.verdicts() {
                let status = verdict.status();
                if status != StatusValue::Invalid && status != StatusValue::Valid {
                    continue;
                }

                let bucket = buckets
                    .entry(verdict.constraint().id())
                    .or_insert_with(|| Bucket {
                        constraint: Arc::clone(verdict.constraint()),
                        label: verdict.label(),
                        invalid: Vec::new(),
                        valid: Vec::new(),
                    });
                let at = StepVerdict {
                    instance,
                    step,
                    verdict,
                };
                if status == StatusValue::Invalid {
                    bucket.invalid.push(at);
                } else {
                    bucket.valid.push(at);
                }
            }
        }
    }

    let mut store = SegmentStore::new();
    for bucket in buckets.values().filter(|b| !b.invalid.is_empty()) {
        producer.produce(
            &bucket.constraint,
            &bucket.label,
            &bucket.invalid,
            &bucket.valid,
            &mut store,
        );
    }
    store
}
