//! Trace events and entity resolution.
//!
//! Events arrive from an external source in non-decreasing timestamp order.
//! Each event carries a type name, a nanosecond timestamp, an optional CPU and
//! a map of payload fields. Which entity (thread) an event belongs to is
//! decided by an injected [`EntityResolver`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Nanosecond timestamp.
pub type Timestamp = u64;

/// Field carrying the thread id in LTTng-style userspace traces.
pub const DEFAULT_ENTITY_FIELD: &str = "context._vtid";

/// Identifier of the entity (thread) an instance tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single trace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Event type name.
    pub name: String,

    /// Timestamp in nanoseconds.
    pub timestamp: Timestamp,

    /// CPU the event was recorded on, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    /// Payload and context fields.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl TraceEvent {
    /// Creates an event without fields.
    pub fn new(name: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            name: name.into(),
            timestamp,
            cpu: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the CPU of the event.
    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Adds a field to the event.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns the raw value of a field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a field formatted as a string, the way context matching
    /// compares it. Strings are returned without quotes.
    pub fn formatted_field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(format_value)
    }

    /// Returns a field as a number, parsing numeric strings.
    pub fn numeric_field(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Returns true if every `(key, value)` pair equals the formatted field.
    pub fn matches_context<'a, I>(&self, context: I) -> bool
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        context
            .into_iter()
            .all(|(key, expected)| self.formatted_field(key).as_deref() == Some(expected.as_str()))
    }
}

pub(crate) fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves the entity an event belongs to.
pub trait EntityResolver {
    fn resolve(&self, event: &TraceEvent) -> Option<EntityId>;
}

impl<F> EntityResolver for F
where
    F: Fn(&TraceEvent) -> Option<EntityId>,
{
    fn resolve(&self, event: &TraceEvent) -> Option<EntityId> {
        self(event)
    }
}

type CpuOracle = Box<dyn Fn(u32, Timestamp) -> Option<EntityId>>;

/// Resolves entities from an embedded event field, optionally falling back
/// to a `(cpu, timestamp) -> entity` scheduling oracle.
pub struct FieldResolver {
    field: String,
    oracle: Option<CpuOracle>,
}

impl FieldResolver {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            oracle: None,
        }
    }

    /// Sets the fallback used when the event has no entity field.
    pub fn with_oracle<F>(mut self, oracle: F) -> Self
    where
        F: Fn(u32, Timestamp) -> Option<EntityId> + 'static,
    {
        self.oracle = Some(Box::new(oracle));
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Default for FieldResolver {
    fn default() -> Self {
        Self::new(DEFAULT_ENTITY_FIELD)
    }
}

impl fmt::Debug for FieldResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldResolver")
            .field("field", &self.field)
            .field("oracle", &self.oracle.is_some())
            .finish()
    }
}

impl EntityResolver for FieldResolver {
    fn resolve(&self, event: &TraceEvent) -> Option<EntityId> {
        let embedded = match event.field(&self.field) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        if let Some(id) = embedded {
            return Some(EntityId(id));
        }

        match (&self.oracle, event.cpu) {
            (Some(oracle), Some(cpu)) => oracle(cpu, event.timestamp),
            _ => None,
        }
    }
}
