//! State machine model.
//!
//! Models use a JSON DSL:
//!
//! ```json
//! {
//!   "name": "latency",
//!   "nodes": [
//!     {"name": "idle"},
//!     {"name": "busy", "variables": [{"name": "deadline/t"}]}
//!   ],
//!   "initial": [{"event": "enter", "to": "busy", "guards": ["x > 10"]}],
//!   "transitions": [
//!     {"from": ["busy"], "event": "exit", "to": "idle",
//!      "context": {"cpu": "0"}, "guards": ["deadline/t < 10ms"]}
//!   ]
//! }
//! ```
//!
//! Among the transitions leaving a node on the same event, the first one
//! (in declaration order) whose context matches the event wins.

use crate::constraint::{Constraint, ConstraintId};
use crate::error::CoreError;
use crate::event::{format_value, TraceEvent};
use crate::variable::{VariableDecl, VariableKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Index of a node in its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

/// Variable declaration as written in the DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRaw {
    pub name: String,

    /// Defaults to the tag before `/` in the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<VariableKind>,
}

/// Node as written in the DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRaw {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableRaw>,
}

/// Initial transition as written in the DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialRaw {
    pub event: String,

    pub to: String,

    #[serde(
        default,
        deserialize_with = "deserialize_context",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub context: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<String>,
}

/// Transition as written in the DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRaw {
    /// Source node(s). Can be a single node or multiple.
    #[serde(deserialize_with = "deserialize_from_nodes")]
    pub from: Vec<String>,

    pub event: String,

    pub to: String,

    #[serde(
        default,
        deserialize_with = "deserialize_context",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub context: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<String>,
}

fn deserialize_from_nodes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct FromNodesVisitor;

    impl<'de> Visitor<'de> for FromNodesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a node name or array of node names")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut nodes = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                nodes.push(s);
            }
            Ok(nodes)
        }
    }

    deserializer.deserialize_any(FromNodesVisitor)
}

/// Context values may be written as any JSON scalar; they are compared in
/// their formatted form.
fn deserialize_context<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(map
        .into_iter()
        .map(|(key, value)| (key, format_value(&value)))
        .collect())
}

/// Raw model definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRaw {
    pub name: String,

    pub nodes: Vec<NodeRaw>,

    #[serde(default)]
    pub initial: Vec<InitialRaw>,

    #[serde(default)]
    pub transitions: Vec<TransitionRaw>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A guarded transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Index of the declaration this transition was built from.
    origin: usize,
    target: NodeId,
    event: String,
    context: BTreeMap<String, String>,
    constraints: Vec<Arc<Constraint>>,
}

impl Transition {
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn constraints(&self) -> &[Arc<Constraint>] {
        &self.constraints
    }

    /// Event type matches and every context pair equals the event's field.
    pub fn matches(&self, event: &TraceEvent) -> bool {
        event.name == self.event && event.matches_context(&self.context)
    }

    /// Whether this transition is selected whenever `later` would be.
    fn shadows(&self, later: &Transition) -> bool {
        self.event == later.event
            && self
                .context
                .iter()
                .all(|(key, value)| later.context.get(key) == Some(value))
    }
}

/// A node of the model.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    variables: Vec<VariableDecl>,
    transitions: Vec<Transition>,
    by_event: HashMap<String, Vec<usize>>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variables(&self) -> &[VariableDecl] {
        &self.variables
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// A node without outgoing transitions ends its instance.
    pub fn is_terminal(&self) -> bool {
        self.transitions.is_empty()
    }

    /// First outgoing transition matching `event`.
    pub fn transition_for(&self, event: &TraceEvent) -> Option<&Transition> {
        first_match(&self.transitions, &self.by_event, event)
    }
}

fn checksum(raw: &ModelRaw) -> Result<String, CoreError> {
    let json_bytes = serde_json::to_vec(raw)?;
    Ok(format!("{:08x}", crc32c::crc32c(&json_bytes)))
}

fn first_match<'a>(
    transitions: &'a [Transition],
    by_event: &HashMap<String, Vec<usize>>,
    event: &TraceEvent,
) -> Option<&'a Transition> {
    by_event
        .get(&event.name)?
        .iter()
        .map(|&i| &transitions[i])
        .find(|t| t.matches(event))
}

fn index_by_event(transitions: &[Transition]) -> HashMap<String, Vec<usize>> {
    let mut by_event: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, t) in transitions.iter().enumerate() {
        by_event.entry(t.event.clone()).or_default().push(i);
    }
    by_event
}

/// Validated and indexed model.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    nodes: Vec<Node>,
    initial: Vec<Transition>,
    initial_by_event: HashMap<String, Vec<usize>>,
    reachable: HashSet<String>,
    raw: ModelRaw,
    checksum: String,
}

impl Model {
    /// Parses and validates a model from JSON.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let raw: ModelRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses and validates a model from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        let raw: ModelRaw = serde_json::from_str(s)?;
        Self::from_raw(raw)
    }

    /// Builds a model from its raw definition.
    pub fn from_raw(raw: ModelRaw) -> Result<Self, CoreError> {
        let mut node_ids: HashMap<&str, NodeId> = HashMap::new();
        for (i, node) in raw.nodes.iter().enumerate() {
            if node_ids.insert(node.name.as_str(), NodeId(i)).is_some() {
                return Err(CoreError::InvalidModel {
                    reason: format!("duplicate node '{}'", node.name),
                });
            }
        }
        let lookup = |name: &str, role: &str| {
            node_ids
                .get(name)
                .copied()
                .ok_or_else(|| CoreError::InvalidModel {
                    reason: format!("transition {} '{}' not in nodes list", role, name),
                })
        };

        let mut next_id = 0u64;
        let mut build_constraints = |guards: &[String]| -> Result<Vec<Arc<Constraint>>, CoreError> {
            let mut constraints = Vec::new();
            for guard in guards {
                for constraint in Constraint::parse_guard(guard)? {
                    next_id += 1;
                    constraints.push(Arc::new(constraint.with_id(ConstraintId(next_id))));
                }
            }
            Ok(constraints)
        };

        let mut nodes = Vec::with_capacity(raw.nodes.len());
        for node in &raw.nodes {
            let mut variables: Vec<VariableDecl> = Vec::with_capacity(node.variables.len());
            for var in &node.variables {
                let decl = match var.kind {
                    Some(kind) => VariableDecl::new(var.name.clone(), kind),
                    None => VariableDecl::from_name(&var.name)?,
                };
                if variables.iter().any(|v| v.name == decl.name) {
                    return Err(CoreError::InvalidModel {
                        reason: format!(
                            "variable '{}' declared twice on node '{}'",
                            decl.name, node.name
                        ),
                    });
                }
                variables.push(decl);
            }
            nodes.push(Node {
                name: node.name.clone(),
                variables,
                transitions: Vec::new(),
                by_event: HashMap::new(),
            });
        }

        let mut initial = Vec::with_capacity(raw.initial.len());
        for (origin, t) in raw.initial.iter().enumerate() {
            initial.push(Transition {
                origin,
                target: lookup(&t.to, "target")?,
                event: t.event.clone(),
                context: t.context.clone(),
                constraints: build_constraints(&t.guards)?,
            });
        }

        for (origin, t) in raw.transitions.iter().enumerate() {
            let target = lookup(&t.to, "target")?;
            if t.from.is_empty() {
                return Err(CoreError::InvalidModel {
                    reason: format!("transition on '{}' has no source node", t.event),
                });
            }
            // Every source shares the same constraints
            let constraints = build_constraints(&t.guards)?;
            for from in &t.from {
                let source = lookup(from, "source")?;
                nodes[source.0].transitions.push(Transition {
                    origin,
                    target,
                    event: t.event.clone(),
                    context: t.context.clone(),
                    constraints: constraints.clone(),
                });
            }
        }

        for node in &mut nodes {
            node.by_event = index_by_event(&node.transitions);
        }
        let initial_by_event = index_by_event(&initial);

        let mut model = Self {
            name: raw.name.clone(),
            nodes,
            initial,
            initial_by_event,
            reachable: HashSet::new(),
            raw,
            checksum: String::new(),
        };
        model.reachable = model.compute_reachable_events();
        model.checksum = checksum(&model.to_raw())?;

        for (node, index) in model.shadowed_transitions() {
            let (source, t) = match node {
                Some(id) => (
                    model.nodes[id.0].name.as_str(),
                    &model.nodes[id.0].transitions[index],
                ),
                None => ("<initial>", &model.initial[index]),
            };
            warn!(
                model = %model.name,
                node = source,
                event = %t.event,
                "transition can never be selected: an earlier transition on the same event matches a subset of its context"
            );
        }

        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn initial_transitions(&self) -> &[Transition] {
        &self.initial
    }

    /// First initial transition matching `event`.
    pub fn initial_transition_for(&self, event: &TraceEvent) -> Option<&Transition> {
        first_match(&self.initial, &self.initial_by_event, event)
    }

    /// Event names that can drive some instance of the model.
    pub fn reachable_events(&self) -> &HashSet<String> {
        &self.reachable
    }

    pub fn is_reachable_event(&self, name: &str) -> bool {
        self.reachable.contains(name)
    }

    /// Every constraint of the model, initial transitions first.
    pub fn constraints(&self) -> impl Iterator<Item = &Arc<Constraint>> {
        self.initial
            .iter()
            .chain(self.nodes.iter().flat_map(|n| n.transitions.iter()))
            .flat_map(|t| t.constraints.iter())
    }

    /// Definition the model was built from.
    pub fn raw(&self) -> &ModelRaw {
        &self.raw
    }

    /// Checksum of the canonical definition (see [`Model::to_raw`]), stable
    /// across export and re-import.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Transitions that can never be selected, as `(node, index)`; `None`
    /// designates the initial transitions.
    pub fn shadowed_transitions(&self) -> Vec<(Option<NodeId>, usize)> {
        let lists = std::iter::once((None, &self.initial)).chain(
            self.nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (Some(NodeId(i)), &n.transitions)),
        );

        let mut shadowed = Vec::new();
        for (node, transitions) in lists {
            for (j, later) in transitions.iter().enumerate() {
                if transitions[..j].iter().any(|earlier| earlier.shadows(later)) {
                    shadowed.push((node, j));
                }
            }
        }
        shadowed
    }

    /// Rebuilds the DSL from the model structure.
    pub fn to_raw(&self) -> ModelRaw {
        let export_guards = |t: &Transition| -> Vec<String> {
            t.constraints.iter().map(|c| c.to_string()).collect()
        };

        let nodes = self
            .nodes
            .iter()
            .map(|n| NodeRaw {
                name: n.name.clone(),
                variables: n
                    .variables
                    .iter()
                    .map(|v| VariableRaw {
                        name: v.name.clone(),
                        kind: (VariableKind::from_name(&v.name) != Some(v.kind)).then_some(v.kind),
                    })
                    .collect(),
            })
            .collect();

        let initial = self
            .initial
            .iter()
            .map(|t| InitialRaw {
                event: t.event.clone(),
                to: self.node(t.target).name.clone(),
                context: t.context.clone(),
                guards: export_guards(t),
            })
            .collect();

        // Sources sharing a declaration are exported together so that they
        // keep sharing their constraints on re-import.
        let mut declared: BTreeMap<usize, TransitionRaw> = BTreeMap::new();
        for n in &self.nodes {
            for t in &n.transitions {
                declared
                    .entry(t.origin)
                    .or_insert_with(|| TransitionRaw {
                        from: Vec::new(),
                        event: t.event.clone(),
                        to: self.node(t.target).name.clone(),
                        context: t.context.clone(),
                        guards: export_guards(t),
                    })
                    .from
                    .push(n.name.clone());
            }
        }
        let transitions = declared.into_values().collect();

        ModelRaw {
            name: self.name.clone(),
            nodes,
            initial,
            transitions,
            meta: self.raw.meta.clone(),
        }
    }

    /// Exports the model structure as JSON.
    pub fn to_json(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self.to_raw())?)
    }

    /// Breadth-first walk from the initial transitions collecting every
    /// event name that can be consumed.
    fn compute_reachable_events(&self) -> HashSet<String> {
        let mut events = HashSet::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::new();

        for t in &self.initial {
            events.insert(t.event.clone());
            queue.push_back(t.target);
        }

        while let Some(id) = queue.pop_front() {
            if std::mem::replace(&mut visited[id.0], true) {
                continue;
            }
            for t in &self.nodes[id.0].transitions {
                events.insert(t.event.clone());
                if !visited[t.target.0] {
                    queue.push_back(t.target);
                }
            }
        }

        events
    }
}
