//! Instance state management.
//!
//! An instance is one run of the model for one entity. It keeps every step
//! it took, the live variables of the nodes it went through, and derives its
//! status from the verdicts recorded along the way.

use crate::adaptive::AdaptiveRegistry;
use crate::backend::KernelBackend;
use crate::constraint::{worst_status, StatusValue, Verdict};
use crate::event::{EntityId, Timestamp, TraceEvent};
use crate::model::{Model, Node, NodeId, Transition};
use crate::variable::Variable;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Everything constraint evaluation needs besides the instance itself.
pub struct EvalContext<'a> {
    /// Entity the event resolved to.
    pub entity: Option<EntityId>,
    pub backend: &'a dyn KernelBackend,
    pub adaptive: &'a mut AdaptiveRegistry,
}

/// Closed time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// One transition taken by an instance.
#[derive(Debug, Clone)]
pub struct Step {
    node: NodeId,
    event: TraceEvent,
    verdicts: Vec<Verdict>,
    /// Step index that last initialized each variable, as seen by the
    /// constraints of this step.
    variables_last_init: BTreeMap<String, usize>,
}

impl Step {
    /// Node entered by this step.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn event(&self) -> &TraceEvent {
        &self.event
    }

    pub fn timestamp(&self) -> Timestamp {
        self.event.timestamp
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn variables_last_init(&self) -> &BTreeMap<String, usize> {
        &self.variables_last_init
    }

    /// Worst verdict of the step.
    pub fn status(&self) -> StatusValue {
        self.verdicts
            .iter()
            .fold(StatusValue::Valid, |acc, v| worst_status(acc, v.status()))
    }
}

/// A model run for one entity.
#[derive(Debug, Clone)]
pub struct Instance {
    model: Arc<Model>,
    entity: Option<EntityId>,
    current: NodeId,
    steps: Vec<Step>,
    variables: HashMap<String, Variable>,
    last_init: BTreeMap<String, usize>,
}

impl Instance {
    /// Creates an instance from the initial transition matched by `event`.
    ///
    /// The instance is bound to the entity `event` resolved to, if any. The
    /// initial transition's guards are evaluated and recorded as step 0.
    pub fn spawn(
        model: Arc<Model>,
        transition: &Transition,
        event: &TraceEvent,
        ctx: &mut EvalContext<'_>,
    ) -> Self {
        let mut instance = Self {
            model,
            entity: ctx.entity,
            current: transition.target(),
            steps: Vec::new(),
            variables: HashMap::new(),
            last_init: BTreeMap::new(),
        };
        instance.take(transition, event, ctx);
        instance
    }

    /// Offers `event` to the instance. Returns whether it was consumed.
    pub fn received_event(&mut self, event: &TraceEvent, ctx: &mut EvalContext<'_>) -> bool {
        if let Some(entity) = self.entity {
            if ctx.entity != Some(entity) {
                return false;
            }
        }

        let model = Arc::clone(&self.model);
        let Some(transition) = model.node(self.current).transition_for(event) else {
            return false;
        };

        self.take(transition, event, ctx);
        true
    }

    fn take(&mut self, transition: &Transition, event: &TraceEvent, ctx: &mut EvalContext<'_>) {
        let this: &Self = self;
        let verdicts: Vec<Verdict> = transition
            .constraints()
            .iter()
            .map(|c| c.verify(this, event, ctx))
            .collect();

        let snapshot = self.last_init.clone();
        let index = self.steps.len();
        let target = transition.target();

        let model = Arc::clone(&self.model);
        for decl in model.node(target).variables() {
            match self.variables.get_mut(&decl.name) {
                Some(var) => var.reset(event),
                None => {
                    self.variables
                        .insert(decl.name.clone(), decl.instantiate(event));
                }
            }
            self.last_init.insert(decl.name.clone(), index);
        }

        self.steps.push(Step {
            node: target,
            event: event.clone(),
            verdicts,
            variables_last_init: snapshot,
        });
        self.current = target;
    }

    /// Current value of a variable, falling back to the numeric event field
    /// of the same name.
    pub(crate) fn value_of(
        &self,
        name: &str,
        event: &TraceEvent,
        backend: &dyn KernelBackend,
    ) -> Option<f64> {
        match self.variables.get(name) {
            Some(var) => match var.current(event, self.entity, backend) {
                Ok(value) => Some(value),
                Err(e) => {
                    trace!(variable = name, error = %e, "variable unreadable");
                    None
                }
            },
            None => event.numeric_field(name),
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn current_node_id(&self) -> NodeId {
        self.current
    }

    pub fn current_node(&self) -> &Node {
        self.model.node(self.current)
    }

    /// False once the instance entered a terminal node.
    pub fn has_next_node(&self) -> bool {
        !self.current_node().is_terminal()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    /// Timestamp of the first step.
    pub fn start(&self) -> Option<Timestamp> {
        self.steps.first().map(Step::timestamp)
    }

    /// Timestamp of the last step.
    pub fn end(&self) -> Option<Timestamp> {
        self.steps.last().map(Step::timestamp)
    }

    /// Worst status over every step.
    pub fn status(&self) -> StatusValue {
        self.steps
            .iter()
            .fold(StatusValue::Valid, |acc, s| worst_status(acc, s.status()))
    }

    /// Same node sequence and same event names.
    pub fn is_comparable(&self, other: &Instance) -> bool {
        self.steps.len() == other.steps.len()
            && self
                .steps
                .iter()
                .zip(&other.steps)
                .all(|(a, b)| a.node == b.node && a.event.name == b.event.name)
    }

    /// Steps whose timestamp falls in `range`.
    pub fn steps_in_interval(&self, range: TimeRange) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(move |s| range.contains(s.timestamp()))
    }

    /// Interval from the (re)initialization of `name` to step `step`, as seen
    /// by that step's constraints.
    pub fn variable_interval(&self, step: usize, name: &str) -> Option<TimeRange> {
        let at = self.steps.get(step)?;
        let init = *at.variables_last_init.get(name)?;
        let start = self.steps.get(init)?.timestamp();
        Some(TimeRange::new(start, at.timestamp()))
    }

    /// Drops verdicts of adaptive constraints that could not be decided.
    /// Returns how many were dropped.
    pub fn clean_up_adaptive(&mut self) -> usize {
        let mut dropped = 0;
        for step in &mut self.steps {
            let before = step.verdicts.len();
            step.verdicts.retain(Verdict::can_be_used);
            dropped += before - step.verdicts.len();
        }
        dropped
    }
}
