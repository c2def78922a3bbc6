//! Serializable snapshots of instances for diagnostic dumps.

use crate::constraint::{StatusValue, Verdict};
use crate::event::{format_value, EntityId, Timestamp};
use crate::instance::{Instance, Step};
use crate::variable::VarValue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One verdict as rendered in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictReport {
    pub constraint: String,
    pub status: StatusValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    pub adaptive: bool,
}

impl From<&Verdict> for VerdictReport {
    fn from(verdict: &Verdict) -> Self {
        Self {
            constraint: verdict.label(),
            status: verdict.status(),
            actual: verdict.actual(),
            adaptive: verdict.is_deferred(),
        }
    }
}

/// One step as rendered in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub event: String,
    pub timestamp: Timestamp,
    pub fields: BTreeMap<String, String>,
    pub state: String,
    pub status: StatusValue,
    pub verdicts: Vec<VerdictReport>,
}

impl StepReport {
    fn new(instance: &Instance, step: &Step) -> Self {
        let event = step.event();
        Self {
            event: event.name.clone(),
            timestamp: event.timestamp,
            fields: event
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), format_value(v)))
                .collect(),
            state: instance.model().node(step.node()).name().to_string(),
            status: step.status(),
            verdicts: step.verdicts().iter().map(VerdictReport::from).collect(),
        }
    }
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceReport {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
    pub state: String,
    pub closed: bool,
    pub status: StatusValue,
    pub variables: BTreeMap<String, VarValue>,
    pub steps: Vec<StepReport>,
}

impl From<&Instance> for InstanceReport {
    fn from(instance: &Instance) -> Self {
        Self {
            model: instance.model().name().to_string(),
            entity: instance.entity(),
            state: instance.current_node().name().to_string(),
            closed: !instance.has_next_node(),
            status: instance.status(),
            variables: instance
                .variables()
                .map(|v| (v.name().to_string(), v.value()))
                .collect(),
            steps: instance
                .steps()
                .iter()
                .map(|s| StepReport::new(instance, s))
                .collect(),
        }
    }
}

struct VarValueDisplay<'a>(&'a VarValue);

impl fmt::Display for VarValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            VarValue::Timestamp(ts) => write!(f, "since {}", ts),
            VarValue::Number(n) => write!(f, "{}", n),
            VarValue::Unset => f.write_str("unset"),
        }
    }
}

impl fmt::Display for InstanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity {
            Some(entity) => writeln!(f, "Instance TID: {}", entity)?,
            None => writeln!(f, "Instance TID: -")?,
        }
        writeln!(
            f,
            "  Model: {}  State: {}  Status: {}{}",
            self.model,
            self.state,
            self.status,
            if self.closed { "  (closed)" } else { "" }
        )?;

        for step in &self.steps {
            let fields: Vec<String> = step
                .fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            writeln!(
                f,
                "  Received {}[{}] at {}",
                step.event,
                fields.join(", "),
                step.timestamp
            )?;
            writeln!(f, "    Entering state: {}", step.state)?;
            if !step.verdicts.is_empty() {
                writeln!(f, "    Constraints:")?;
                for verdict in &step.verdicts {
                    match verdict.actual {
                        Some(actual) => writeln!(
                            f,
                            "      {} -> {} (actual {})",
                            verdict.constraint, verdict.status, actual
                        )?,
                        None => writeln!(
                            f,
                            "      {} -> {}",
                            verdict.constraint, verdict.status
                        )?,
                    }
                }
            }
        }

        if !self.variables.is_empty() {
            writeln!(f, "  Variables:")?;
            for (name, value) in &self.variables {
                writeln!(f, "    {} = {}", name, VarValueDisplay(value))?;
            }
        }
        Ok(())
    }
}
