//! Per-node variables.
//!
//! A node declares variables by name; the part before `/` selects the kind
//! (`deadline/t`, `cputime/c`, `syscalls/n`, `field/prio`). Entering the node
//! (re)initializes each declared variable from the entering event, and guards
//! later read the variable's current value.

use crate::backend::KernelBackend;
use crate::error::CoreError;
use crate::event::{EntityId, Timestamp, TraceEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of variable kinds, keyed by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Time elapsed since initialization.
    Deadline,
    /// CPU time consumed by the entity since initialization.
    #[serde(rename = "cputime")]
    CpuTime,
    /// Preemptions of the entity since initialization.
    Preempt,
    /// System calls of the entity since initialization.
    Syscalls,
    /// Numeric event field captured on entry.
    Field,
}

impl VariableKind {
    pub const ALL: [VariableKind; 5] = [
        VariableKind::Deadline,
        VariableKind::CpuTime,
        VariableKind::Preempt,
        VariableKind::Syscalls,
        VariableKind::Field,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            VariableKind::Deadline => "deadline",
            VariableKind::CpuTime => "cputime",
            VariableKind::Preempt => "preempt",
            VariableKind::Syscalls => "syscalls",
            VariableKind::Field => "field",
        }
    }

    /// Kind implied by a variable name such as `deadline/t`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (tag, _) = name.split_once('/')?;
        Self::from_tag(tag)
    }

    /// Counter variables take integer values.
    pub fn is_counter(&self) -> bool {
        matches!(self, VariableKind::Preempt | VariableKind::Syscalls)
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Value a variable was initialized with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarValue {
    /// Interval start for time and counter kinds.
    Timestamp(Timestamp),
    /// Captured number for field kinds.
    Number(f64),
    /// The entering event did not carry the value.
    Unset,
}

/// Failure to read a variable's current value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariableError {
    #[error("kernel backend cannot answer for '{kind}' variables")]
    BackendUnavailable { kind: VariableKind },

    #[error("variable needs an entity but the instance has none")]
    NoEntity,

    #[error("variable was never set")]
    Unset,
}

/// Variable declaration on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub kind: VariableKind,
}

impl VariableDecl {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Builds a declaration whose kind comes from the name prefix.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        let kind = VariableKind::from_name(name).ok_or_else(|| {
            CoreError::UnknownVariableKind {
                variable: name.to_string(),
                kind: name.split_once('/').map(|(t, _)| t).unwrap_or("").to_string(),
            }
        })?;
        Ok(Self::new(name, kind))
    }

    /// Event field read by `field` variables.
    pub fn field_name(&self) -> &str {
        self.name
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.name)
    }

    pub fn initial_value(&self, event: &TraceEvent) -> VarValue {
        match self.kind {
            VariableKind::Field => event
                .numeric_field(self.field_name())
                .map(VarValue::Number)
                .unwrap_or(VarValue::Unset),
            _ => VarValue::Timestamp(event.timestamp),
        }
    }

    /// Fresh variable initialized from `event`.
    pub fn instantiate(&self, event: &TraceEvent) -> Variable {
        Variable {
            decl: self.clone(),
            value: self.initial_value(event),
        }
    }
}

/// Live variable inside an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    decl: VariableDecl,
    value: VarValue,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn kind(&self) -> VariableKind {
        self.decl.kind
    }

    pub fn value(&self) -> VarValue {
        self.value
    }

    pub fn reset(&mut self, event: &TraceEvent) {
        self.value = self.decl.initial_value(event);
    }

    /// Current numeric value of the variable at `event`.
    pub fn current(
        &self,
        event: &TraceEvent,
        entity: Option<EntityId>,
        backend: &dyn KernelBackend,
    ) -> Result<f64, VariableError> {
        let kind = self.decl.kind;
        match (kind, self.value) {
            (_, VarValue::Unset) => Err(VariableError::Unset),
            (VariableKind::Field, VarValue::Number(n)) => Ok(n),
            (VariableKind::Field, VarValue::Timestamp(ts)) => Ok(ts as f64),
            (_, VarValue::Number(n)) => Ok(n),
            (VariableKind::Deadline, VarValue::Timestamp(init)) => {
                Ok(event.timestamp.saturating_sub(init) as f64)
            }
            (VariableKind::CpuTime, VarValue::Timestamp(init)) => {
                let entity = entity.ok_or(VariableError::NoEntity)?;
                backend
                    .cpu_time(entity, init, event.timestamp)
                    .map(|ns| ns as f64)
                    .ok_or(VariableError::BackendUnavailable { kind })
            }
            (VariableKind::Preempt | VariableKind::Syscalls, VarValue::Timestamp(init)) => {
                let entity = entity.ok_or(VariableError::NoEntity)?;
                backend
                    .counter(entity, init, event.timestamp, kind.tag())
                    .map(|n| n as f64)
                    .ok_or(VariableError::BackendUnavailable { kind })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CounterSample, KernelLog, KernelRecord, NoBackend, ThreadRun};

    #[test]
    fn test_kind_tags() {
        for kind in VariableKind::ALL {
            assert_eq!(VariableKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(VariableKind::from_name("deadline/t"), Some(VariableKind::Deadline));
        assert_eq!(VariableKind::from_name("latency"), None);
        assert_eq!(VariableKind::from_name("bogus/x"), None);
        assert!(VariableKind::Syscalls.is_counter());
        assert!(!VariableKind::CpuTime.is_counter());
    }

    #[test]
    fn test_decl_from_name() {
        let decl = VariableDecl::from_name("field/prio").unwrap();
        assert_eq!(decl.kind, VariableKind::Field);
        assert_eq!(decl.field_name(), "prio");

        let err = VariableDecl::from_name("nope/x").unwrap_err();
        assert!(matches!(err, CoreError::UnknownVariableKind { ref kind, .. } if kind == "nope"));
    }

    #[test]
    fn test_deadline_current() {
        let decl = VariableDecl::from_name("deadline/t").unwrap();
        let var = decl.instantiate(&TraceEvent::new("enter", 100));
        let now = TraceEvent::new("exit", 350);
        assert_eq!(var.current(&now, None, &NoBackend), Ok(250.0));
    }

    #[test]
    fn test_field_current_and_reset() {
        let decl = VariableDecl::from_name("field/prio").unwrap();
        let mut var = decl.instantiate(&TraceEvent::new("enter", 1).with_field("prio", 5));
        let later = TraceEvent::new("exit", 2);
        assert_eq!(var.current(&later, None, &NoBackend), Ok(5.0));

        var.reset(&TraceEvent::new("enter", 3));
        assert_eq!(var.value(), VarValue::Unset);
        assert_eq!(var.current(&later, None, &NoBackend), Err(VariableError::Unset));
    }

    #[test]
    fn test_backend_variables() {
        let log = KernelLog::from_records(vec![
            KernelRecord::Run(ThreadRun {
                cpu: 0,
                entity: EntityId(1),
                start: 0,
                end: 60,
            }),
            KernelRecord::Counter(CounterSample {
                entity: EntityId(1),
                timestamp: 30,
                attribute: "syscalls".to_string(),
            }),
        ]);
        let start = TraceEvent::new("enter", 10);
        let end = TraceEvent::new("exit", 100);

        let cpu = VariableDecl::from_name("cputime/c").unwrap().instantiate(&start);
        assert_eq!(cpu.current(&end, Some(EntityId(1)), &log), Ok(50.0));
        assert_eq!(cpu.current(&end, None, &log), Err(VariableError::NoEntity));
        assert_eq!(
            cpu.current(&end, Some(EntityId(1)), &NoBackend),
            Err(VariableError::BackendUnavailable {
                kind: VariableKind::CpuTime
            })
        );

        let calls = VariableDecl::from_name("syscalls/n").unwrap().instantiate(&start);
        assert_eq!(calls.current(&end, Some(EntityId(1)), &log), Ok(1.0));
    }
}
