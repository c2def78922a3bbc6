//! Instance group - dispatches a trace to the instances of one model.
//!
//! The group owns every instance ever spawned, the open instances indexed
//! globally and per entity, and the adaptive registry. It is fed events one
//! at a time in timestamp order, then finalized exactly once.

use crate::adaptive::{AdaptiveRegistry, AdaptiveStrategy, ClusterStrategy};
use crate::backend::{KernelBackend, NoBackend};
use crate::error::CoreError;
use crate::event::{EntityId, EntityResolver, FieldResolver, Timestamp, TraceEvent};
use crate::instance::{EvalContext, Instance};
use crate::model::Model;
use crate::segment::{self, SegmentProducer, SegmentStore};
use crate::timing::TimingContext;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Index of an instance in the group's permanent list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceId(pub usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to a received event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The model never consumes this event type.
    Filtered,
    /// No instance took the event and no initial transition matched.
    Unmatched,
    /// An open instance consumed the event.
    Advanced(InstanceId),
    /// A new instance was spawned from the event.
    Spawned(InstanceId),
}

/// Event counters of a group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Events accepted for dispatch, filtered ones included. Out of order
    /// events are rejected before they are counted.
    pub received: u64,
    pub filtered: u64,
    pub unmatched: u64,
    pub advanced: u64,
    pub spawned: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Receiving,
    Finalized,
}

/// Instances of one model over one trace.
pub struct InstanceGroup {
    model: Arc<Model>,
    resolver: Box<dyn EntityResolver>,
    backend: Arc<dyn KernelBackend>,
    strategy: Box<dyn AdaptiveStrategy>,
    all_instances_valid: bool,

    /// Every instance ever spawned.
    instances: Vec<Instance>,
    /// Open instances in spawn order.
    open: Vec<InstanceId>,
    /// Open instances per entity; buckets stay once created.
    per_entity: HashMap<EntityId, Vec<InstanceId>>,

    adaptive: AdaptiveRegistry,
    phase: Phase,
    last_timestamp: Option<Timestamp>,
    stats: GroupStats,
}

impl InstanceGroup {
    /// Creates a group resolving entities from the default thread id field,
    /// with no kernel data and the clustering strategy.
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            resolver: Box::new(FieldResolver::default()),
            backend: Arc::new(NoBackend),
            strategy: Box::new(ClusterStrategy),
            all_instances_valid: false,
            instances: Vec::new(),
            open: Vec::new(),
            per_entity: HashMap::new(),
            adaptive: AdaptiveRegistry::new(),
            phase: Phase::Receiving,
            last_timestamp: None,
            stats: GroupStats::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: impl EntityResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn KernelBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_strategy(mut self, strategy: impl AdaptiveStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Learn adaptive constraints as if every observed run were valid.
    pub fn with_all_instances_valid(mut self, all_instances_valid: bool) -> Self {
        self.all_instances_valid = all_instances_valid;
        self
    }

    /// Dispatches one event.
    pub fn receive_event(&mut self, event: &TraceEvent) -> Result<Dispatch, CoreError> {
        if self.phase == Phase::Finalized {
            return Err(CoreError::StreamFinalized {
                event: event.name.clone(),
            });
        }

        if !self.model.is_reachable_event(&event.name) {
            self.stats.received += 1;
            self.stats.filtered += 1;
            return Ok(Dispatch::Filtered);
        }

        if let Some(previous) = self.last_timestamp {
            if event.timestamp < previous {
                return Err(CoreError::OutOfOrder {
                    event: event.name.clone(),
                    timestamp: event.timestamp,
                    previous,
                });
            }
        }
        self.last_timestamp = Some(event.timestamp);
        self.stats.received += 1;

        let entity = self.resolver.resolve(event);
        let mut ctx = EvalContext {
            entity,
            backend: self.backend.as_ref(),
            adaptive: &mut self.adaptive,
        };

        let candidates = match entity.and_then(|e| self.per_entity.get(&e)) {
            Some(bucket) => bucket,
            None => &self.open,
        };

        let mut advanced = None;
        for &id in candidates {
            if self.instances[id.0].received_event(event, &mut ctx) {
                advanced = Some(id);
                break;
            }
        }

        if let Some(id) = advanced {
            self.stats.advanced += 1;
            if !self.instances[id.0].has_next_node() {
                self.close(id);
            }
            return Ok(Dispatch::Advanced(id));
        }

        let model = Arc::clone(&self.model);
        let Some(transition) = model.initial_transition_for(event) else {
            self.stats.unmatched += 1;
            return Ok(Dispatch::Unmatched);
        };

        let instance = Instance::spawn(Arc::clone(&model), transition, event, &mut ctx);
        let id = InstanceId(self.instances.len());
        let open = instance.has_next_node();
        let bound = instance.entity();
        self.instances.push(instance);
        self.stats.spawned += 1;

        if open {
            self.open.push(id);
            if let Some(e) = bound {
                self.per_entity.entry(e).or_default().push(id);
            }
        } else {
            self.stats.closed += 1;
        }

        debug!(instance = %id, entity = ?bound, event = %event.name, ts = event.timestamp, "spawned instance");
        Ok(Dispatch::Spawned(id))
    }

    fn close(&mut self, id: InstanceId) {
        self.open.retain(|&i| i != id);
        if let Some(bucket) = self.instances[id.0]
            .entity()
            .and_then(|e| self.per_entity.get_mut(&e))
        {
            bucket.retain(|&i| i != id);
        }
        self.stats.closed += 1;
    }

    /// Ends the stream and finalizes every adaptive constraint. Returns how
    /// many adaptive constraints reached a decision.
    pub fn finished_receiving(&mut self) -> Result<usize, CoreError> {
        if self.phase == Phase::Finalized {
            return Err(CoreError::AlreadyFinalized);
        }
        self.phase = Phase::Finalized;

        let decided = self
            .adaptive
            .finalize(self.strategy.as_ref(), self.all_instances_valid)?;

        info!(
            model = %self.model.name(),
            instances = self.instances.len(),
            open = self.open.len(),
            adaptive = self.adaptive.len(),
            decided,
            strategy = self.strategy.name(),
            "stream finalized"
        );
        Ok(decided)
    }

    /// Feeds every event, then finalizes, timing both phases.
    pub fn build_on<I>(&mut self, events: I, timing: &mut TimingContext) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = TraceEvent>,
    {
        {
            let mut scope = timing.scope("receive");
            let mut count = 0u64;
            for event in events {
                self.receive_event(&event)?;
                count += 1;
            }
            scope.set_items(count);
        }
        {
            let mut scope = timing.scope("finalize");
            scope.set_items(self.adaptive.len() as u64);
            self.finished_receiving()?;
        }
        Ok(())
    }

    /// Drops verdicts of adaptive constraints that could not be decided.
    pub fn clean_up_adaptive(&mut self) -> Result<usize, CoreError> {
        if self.phase != Phase::Finalized {
            return Err(CoreError::NotFinalized);
        }
        let dropped = self
            .instances
            .iter_mut()
            .map(Instance::clean_up_adaptive)
            .sum();
        debug!(dropped, "dropped undecided adaptive verdicts");
        Ok(dropped)
    }

    /// Folds the step histories into segments.
    pub fn extract_segments(
        &self,
        producer: &dyn SegmentProducer,
    ) -> Result<SegmentStore, CoreError> {
        if self.phase != Phase::Finalized {
            return Err(CoreError::NotFinalized);
        }
        Ok(segment::extract_segments(&self.instances, producer))
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(id.0)
    }

    pub fn open_ids(&self) -> &[InstanceId] {
        &self.open
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Open instances bound to `entity`, if the entity was ever seen.
    pub fn entity_bucket(&self, entity: EntityId) -> Option<&[InstanceId]> {
        self.per_entity.get(&entity).map(Vec::as_slice)
    }

    pub fn adaptive(&self) -> &AdaptiveRegistry {
        &self.adaptive
    }

    pub fn stats(&self) -> GroupStats {
        self.stats
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == Phase::Finalized
    }

    pub fn all_instances_valid(&self) -> bool {
        self.all_instances_valid
    }
}

impl fmt::Debug for InstanceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceGroup")
            .field("model", &self.model.name())
            .field("instances", &self.instances.len())
            .field("open", &self.open.len())
            .field("phase", &self.phase)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::PercentileStrategy;
    use crate::constraint::StatusValue;
    use crate::event::DEFAULT_ENTITY_FIELD;
    use crate::segment::VariableIntervalProducer;
    use serde_json::json;

    fn ev(name: &str, ts: u64, tid: i64) -> TraceEvent {
        TraceEvent::new(name, ts).with_field(DEFAULT_ENTITY_FIELD, tid)
    }

    fn io_model() -> Arc<Model> {
        Arc::new(
            Model::from_json(&json!({
                "name": "io",
                "nodes": [
                    {"name": "busy", "variables": [{"name": "deadline/t"}]},
                    {"name": "done"}
                ],
                "initial": [{"event": "enter", "to": "busy"}],
                "transitions": [
                    {"from": "busy", "event": "exit", "to": "done", "guards": ["deadline/t < 100"]}
                ]
            }))
            .unwrap(),
        )
    }

    fn guard_model() -> Arc<Model> {
        Arc::new(
            Model::from_json(&json!({
                "name": "guard",
                "nodes": [{"name": "A"}, {"name": "B"}],
                "initial": [{"event": "enter", "to": "B", "guards": ["x > 10"]}]
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_spawn_and_advance_per_entity() {
        let mut group = InstanceGroup::new(io_model());

        assert_eq!(group.receive_event(&ev("enter", 0, 1)).unwrap(), Dispatch::Spawned(InstanceId(0)));
        assert_eq!(group.receive_event(&ev("enter", 10, 2)).unwrap(), Dispatch::Spawned(InstanceId(1)));
        assert_eq!(group.open_count(), 2);

        // entity 2 exits first and is routed to its own instance
        assert_eq!(group.receive_event(&ev("exit", 50, 2)).unwrap(), Dispatch::Advanced(InstanceId(1)));
        assert_eq!(group.open_ids(), &[InstanceId(0)]);
        assert_eq!(group.entity_bucket(EntityId(2)), Some(&[][..]));

        assert_eq!(group.receive_event(&ev("exit", 200, 1)).unwrap(), Dispatch::Advanced(InstanceId(0)));
        assert_eq!(group.open_count(), 0);
        assert_eq!(group.instances().len(), 2);

        group.finished_receiving().unwrap();
        assert_eq!(group.instances()[0].status(), StatusValue::Invalid);
        assert_eq!(group.instances()[1].status(), StatusValue::Valid);

        let stats = group.stats();
        assert_eq!((stats.spawned, stats.advanced, stats.closed), (2, 2, 2));
    }

    #[test]
    fn test_unknown_entity_scans_open_instances() {
        let mut group = InstanceGroup::new(io_model());
        group.receive_event(&TraceEvent::new("enter", 0)).unwrap();
        assert_eq!(group.instances()[0].entity(), None);

        // entity 5 has no bucket, so every open instance is a candidate
        assert_eq!(group.receive_event(&ev("exit", 10, 5)).unwrap(), Dispatch::Advanced(InstanceId(0)));
    }

    #[test]
    fn test_only_first_acceptor_advances() {
        let model = Arc::new(
            Model::from_json(&json!({
                "name": "tick",
                "nodes": [{"name": "busy"}, {"name": "wait"}, {"name": "done"}],
                "initial": [{"event": "enter", "to": "busy"}],
                "transitions": [
                    {"from": "busy", "event": "tick", "to": "wait"},
                    {"from": "wait", "event": "exit", "to": "done"}
                ]
            }))
            .unwrap(),
        );
        let mut group = InstanceGroup::new(model);
        group.receive_event(&TraceEvent::new("enter", 0)).unwrap();
        group.receive_event(&TraceEvent::new("enter", 1)).unwrap();
        assert_eq!(group.open_ids(), &[InstanceId(0), InstanceId(1)]);

        // both instances sit in "busy" and could take the tick
        assert_eq!(
            group.receive_event(&TraceEvent::new("tick", 2)).unwrap(),
            Dispatch::Advanced(InstanceId(0))
        );
        assert_eq!(group.instances()[0].step_count(), 2);
        assert_eq!(group.instances()[1].step_count(), 1);
        assert_eq!(group.instances()[1].current_node().name(), "busy");
        assert_eq!(group.open_ids(), &[InstanceId(0), InstanceId(1)]);

        // instance 0 has moved on, so the next tick goes to instance 1
        assert_eq!(
            group.receive_event(&TraceEvent::new("tick", 3)).unwrap(),
            Dispatch::Advanced(InstanceId(1))
        );
        assert_eq!(group.stats().advanced, 2);
        assert_eq!(group.instances().len(), 2);
    }

    #[test]
    fn test_filtered_and_unmatched() {
        let mut group = InstanceGroup::new(io_model());
        assert_eq!(group.receive_event(&ev("noise", 0, 1)).unwrap(), Dispatch::Filtered);
        // reachable but nothing open and not an initial event
        assert_eq!(group.receive_event(&ev("exit", 1, 1)).unwrap(), Dispatch::Unmatched);
        assert!(group.instances().is_empty());
        assert_eq!(group.stats().filtered, 1);
        assert_eq!(group.stats().unmatched, 1);
    }

    #[test]
    fn test_protocol_violations() {
        let mut group = InstanceGroup::new(io_model());
        assert!(matches!(
            group.extract_segments(&VariableIntervalProducer),
            Err(CoreError::NotFinalized)
        ));
        assert!(matches!(group.clean_up_adaptive(), Err(CoreError::NotFinalized)));

        group.receive_event(&ev("enter", 100, 1)).unwrap();
        assert!(matches!(
            group.receive_event(&ev("exit", 50, 1)),
            Err(CoreError::OutOfOrder { previous: 100, .. })
        ));
        assert_eq!(group.stats().received, 1);
        assert_eq!(group.instances()[0].step_count(), 1);

        group.finished_receiving().unwrap();
        assert!(matches!(group.finished_receiving(), Err(CoreError::AlreadyFinalized)));
        assert!(matches!(
            group.receive_event(&ev("exit", 200, 1)),
            Err(CoreError::StreamFinalized { .. })
        ));
    }

    #[test]
    fn test_guarded_initial_transition_segments() {
        let mut group = InstanceGroup::new(guard_model());
        group
            .receive_event(&ev("enter", 100, 1).with_field("x", 5))
            .unwrap();
        group
            .receive_event(&ev("enter", 150, 2).with_field("x", 20))
            .unwrap();
        group.finished_receiving().unwrap();

        assert_eq!(group.instances().len(), 2);
        assert_eq!(group.open_count(), 0);
        let first = &group.instances()[0];
        assert_eq!(first.entity(), Some(EntityId(1)));
        assert_eq!(first.steps()[0].status(), StatusValue::Invalid);
        assert_eq!(group.instances()[1].steps()[0].status(), StatusValue::Valid);

        let segments = group.extract_segments(&VariableIntervalProducer).unwrap();
        let invalid: Vec<_> = segments.invalid().collect();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].entity, Some(EntityId(1)));
        assert_eq!(invalid[0].invalid_constraints, vec!["x > 10".to_string()]);
        assert_eq!((invalid[0].start, invalid[0].end), (100, 100));
    }

    #[test]
    fn test_segments_span_variable_interval() {
        let mut group = InstanceGroup::new(io_model());
        for event in [ev("enter", 0, 1), ev("enter", 5, 2), ev("exit", 60, 2), ev("exit", 300, 1)] {
            group.receive_event(&event).unwrap();
        }
        group.finished_receiving().unwrap();

        let segments = group.extract_segments(&VariableIntervalProducer).unwrap();
        assert_eq!(segments.len(), 2);
        let invalid = segments.invalid().next().unwrap();
        assert_eq!((invalid.start, invalid.end), (0, 300));
        assert_eq!(invalid.entity, Some(EntityId(1)));
        let valid = &segments.segments()[1];
        assert_eq!((valid.start, valid.end, valid.entity), (5, 60, Some(EntityId(2))));
    }

    #[test]
    fn test_build_on_records_timings() {
        let mut group = InstanceGroup::new(io_model());
        let mut timing = TimingContext::new();
        group
            .build_on(vec![ev("enter", 0, 1), ev("exit", 10, 1)], &mut timing)
            .unwrap();
        assert!(group.is_finalized());
        assert_eq!(timing.get("receive").unwrap().items, Some(2));
        assert!(timing.get("finalize").is_some());
    }

    #[test]
    fn test_clean_up_drops_undecided_adaptive() {
        let model = Arc::new(
            Model::from_json(&json!({
                "name": "adaptive",
                "nodes": [{"name": "run"}],
                "initial": [{"event": "tick", "to": "run", "guards": ["v < ? && w ? ?"]}]
            }))
            .unwrap(),
        );
        let mut group = InstanceGroup::new(model).with_strategy(PercentileStrategy::new(90.0));
        for (i, v) in [1, 2, 3].iter().enumerate() {
            let event = ev("tick", i as u64, i as i64)
                .with_field("v", *v)
                .with_field("w", *v);
            group.receive_event(&event).unwrap();
        }
        assert_eq!(group.finished_receiving().unwrap(), 1);
        assert_eq!(group.adaptive().len(), 2);
        assert_eq!(group.instances()[0].status(), StatusValue::Uncertain);

        assert_eq!(group.clean_up_adaptive().unwrap(), 3);
        assert_eq!(group.instances()[0].status(), StatusValue::Valid);
        assert_eq!(group.instances()[0].steps()[0].verdicts().len(), 1);
    }
}
