//! # smtrace-core
//!
//! Trace-driven state machine engine for smtrace.
//!
//! This crate provides:
//! - Model (graph) parsing, validation and export
//! - Guard constraints, static and adaptive
//! - Instances replaying a trace per entity
//! - Instance groups dispatching events and finalizing adaptive constraints
//! - Segment extraction over the recorded step histories

pub mod adaptive;
pub mod backend;
pub mod constraint;
pub mod error;
pub mod event;
pub mod group;
pub mod instance;
pub mod model;
pub mod report;
pub mod segment;
pub mod timing;
pub mod variable;

pub use adaptive::{
    AdaptiveRegistry, AdaptiveSlot, AdaptiveStrategy, ClusterStrategy, Decision,
    PercentileStrategy,
};
pub use backend::{KernelBackend, KernelLog, KernelRecord, NoBackend};
pub use constraint::{worst_status, Constraint, ConstraintId, Operator, StatusValue, Verdict};
pub use error::CoreError;
pub use event::{EntityId, EntityResolver, FieldResolver, Timestamp, TraceEvent};
pub use group::{Dispatch, GroupStats, InstanceGroup, InstanceId};
pub use instance::{Instance, Step, TimeRange};
pub use model::{Model, ModelRaw, Node, NodeId};
pub use report::InstanceReport;
pub use segment::{Segment, SegmentProducer, SegmentStore, VariableIntervalProducer};
pub use timing::TimingContext;
pub use variable::{VariableDecl, VariableKind};
