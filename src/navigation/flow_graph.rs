use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::routine::{Location, Routine, StepInfo};
use super::{lookup_path, Navigator};
use crate::core::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task,
    ExclusiveGateway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: NodeKind,

    #[serde(default)]
    pub name: Option<String>,

    /// Strategy-matching tag for tasks
    #[serde(default)]
    pub step_type: Option<String>,

    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,

    pub to: String,

    #[serde(default)]
    pub condition: Option<EdgeCondition>,

    /// Taken out of a gateway when no conditional sibling matches
    #[serde(default)]
    pub default: bool,
}

/// `{"key": "review.approved", "op": "equals", "value": true}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCondition {
    pub key: String,

    #[serde(flatten)]
    pub op: ConditionOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionOp {
    Equals { value: Value },
    NotEquals { value: Value },
    Exists,
    Truthy,
}

impl EdgeCondition {
    pub fn evaluate(&self, context: &Value) -> bool {
        let found = lookup_path(context, &self.key);
        match &self.op {
            ConditionOp::Equals { value } => found == Some(value),
            ConditionOp::NotEquals { value } => found != Some(value),
            ConditionOp::Exists => found.is_some(),
            ConditionOp::Truthy => found.map(is_truthy).unwrap_or(false),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphDefinition {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraphDefinition {
    fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn outgoing(&self, id: &str) -> impl Iterator<Item = &FlowEdge> {
        let id = id.to_string();
        self.edges.iter().filter(move |e| e.from == id)
    }

    fn start_nodes(&self) -> Vec<&FlowNode> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .collect()
    }
}

/// Routines whose graph is a BPMN-like node/edge set with start and end
/// events, tasks and exclusive gateways. Only tasks are executable; gateways
/// are resolved while computing next locations and never become a location.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowGraphNavigator;

impl FlowGraphNavigator {
    pub fn parse(routine: &Routine) -> EngineResult<FlowGraphDefinition> {
        serde_json::from_value(routine.graph.clone()).map_err(|e| {
            EngineError::Configuration(format!(
                "routine '{}' is not a flow graph: {}",
                routine.id, e
            ))
        })
    }

    /// Structural checks: one start event, at least one end event, unique
    /// node ids, no dangling edges, no cycles reachable from the start.
    pub fn validate(routine: &Routine) -> EngineResult<()> {
        let graph = Self::parse(routine)?;
        let invalid = |msg: String| {
            Err(EngineError::Configuration(format!(
                "routine '{}': {}",
                routine.id, msg
            )))
        };

        let starts = graph.start_nodes();
        if starts.len() != 1 {
            return invalid(format!("expected one start event, found {}", starts.len()));
        }
        if !graph.nodes.iter().any(|n| n.kind == NodeKind::End) {
            return invalid("no end event".to_string());
        }

        let mut ids = HashSet::new();
        for node in &graph.nodes {
            if !ids.insert(node.id.as_str()) {
                return invalid(format!("duplicate node id '{}'", node.id));
            }
        }
        for edge in &graph.edges {
            if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
                return invalid(format!("dangling edge {} -> {}", edge.from, edge.to));
            }
        }

        if Self::has_cycle(&graph, &starts[0].id) {
            return invalid("circular reference between nodes".to_string());
        }
        Ok(())
    }

    fn has_cycle(graph: &FlowGraphDefinition, start: &str) -> bool {
        fn visit<'a>(
            current: &'a str,
            graph: &'a FlowGraphDefinition,
            visited: &mut HashMap<&'a str, bool>,
            on_stack: &mut HashMap<&'a str, bool>,
        ) -> bool {
            visited.insert(current, true);
            on_stack.insert(current, true);

            for edge in graph.edges.iter().filter(|e| e.from == current) {
                let target = edge.to.as_str();
                if !visited.get(target).copied().unwrap_or(false) {
                    if visit(target, graph, visited, on_stack) {
                        return true;
                    }
                } else if on_stack.get(target).copied().unwrap_or(false) {
                    return true;
                }
            }

            on_stack.insert(current, false);
            false
        }

        visit(start, graph, &mut HashMap::new(), &mut HashMap::new())
    }

    fn node_for<'a>(
        graph: &'a FlowGraphDefinition,
        location: &Location,
    ) -> EngineResult<&'a FlowNode> {
        graph
            .node(&location.node_id)
            .ok_or_else(|| EngineError::NotFound(format!("node {}", location)))
    }

    /// Edges worth following out of a node. Without context every edge is a
    /// candidate; with context failing conditions are dropped, and default
    /// edges survive only when no conditional sibling matched.
    fn candidate_edges<'a>(
        graph: &'a FlowGraphDefinition,
        node_id: &str,
        context: Option<&Value>,
    ) -> Vec<&'a FlowEdge> {
        let outgoing: Vec<&FlowEdge> = graph.outgoing(node_id).collect();
        let Some(context) = context else {
            return outgoing;
        };

        let matched: Vec<&FlowEdge> = outgoing
            .iter()
            .copied()
            .filter(|e| e.condition.as_ref().map(|c| c.evaluate(context)).unwrap_or(false))
            .collect();

        let mut selected: Vec<&FlowEdge> = outgoing
            .iter()
            .copied()
            .filter(|e| e.condition.is_none() && !e.default)
            .collect();
        if matched.is_empty() {
            selected.extend(outgoing.iter().copied().filter(|e| e.default));
        }
        selected.extend(matched);
        selected
    }

    fn expand(
        graph: &FlowGraphDefinition,
        node_id: &str,
        context: Option<&Value>,
        through: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        for edge in Self::candidate_edges(graph, node_id, context) {
            match graph.node(&edge.to).map(|n| n.kind) {
                Some(NodeKind::ExclusiveGateway) => {
                    if through.insert(edge.to.clone()) {
                        Self::expand(graph, &edge.to, context, through, out);
                    }
                }
                Some(_) => {
                    if !out.contains(&edge.to) {
                        out.push(edge.to.clone());
                    }
                }
                None => {}
            }
        }
    }
}

impl Navigator for FlowGraphNavigator {
    fn name(&self) -> &'static str {
        "flow_graph"
    }

    fn validate(&self, routine: &Routine) -> EngineResult<()> {
        FlowGraphNavigator::validate(routine)
    }

    fn can_navigate(&self, routine: &Routine) -> bool {
        let has_arrays = ["nodes", "edges"]
            .iter()
            .all(|k| routine.graph.get(*k).map(|v| v.is_array()).unwrap_or(false));
        has_arrays
            && Self::parse(routine)
                .map(|g| g.start_nodes().len() == 1)
                .unwrap_or(false)
    }

    fn start_location(&self, routine: &Routine, run_id: &str) -> EngineResult<Location> {
        let graph = Self::parse(routine)?;
        let starts = graph.start_nodes();
        match starts.as_slice() {
            [start] => Ok(Location::new(run_id, &routine.id, &start.id)),
            _ => Err(EngineError::Configuration(format!(
                "routine '{}' needs exactly one start event",
                routine.id
            ))),
        }
    }

    fn next_locations(
        &self,
        routine: &Routine,
        current: &Location,
        context: Option<&Value>,
    ) -> EngineResult<Vec<Location>> {
        let graph = Self::parse(routine)?;
        let node = Self::node_for(&graph, current)?;
        if node.kind == NodeKind::End {
            return Ok(Vec::new());
        }

        let mut through = HashSet::new();
        let mut targets = Vec::new();
        Self::expand(&graph, &node.id, context, &mut through, &mut targets);
        Ok(targets.into_iter().map(|id| current.at(id)).collect())
    }

    fn is_end_location(&self, routine: &Routine, location: &Location) -> EngineResult<bool> {
        let graph = Self::parse(routine)?;
        Ok(Self::node_for(&graph, location)?.kind == NodeKind::End)
    }

    fn step_info(&self, routine: &Routine, location: &Location) -> EngineResult<StepInfo> {
        let graph = Self::parse(routine)?;
        let node = Self::node_for(&graph, location)?;
        let step_type = match node.kind {
            NodeKind::Task => node
                .step_type
                .clone()
                .unwrap_or_else(|| "reasoning".to_string()),
            NodeKind::Start => "start".to_string(),
            NodeKind::End => "end".to_string(),
            NodeKind::ExclusiveGateway => "gateway".to_string(),
        };
        Ok(StepInfo {
            node_id: node.id.clone(),
            name: node.name.clone().unwrap_or_else(|| node.id.clone()),
            step_type,
            config: node.config.clone(),
            executable: node.kind == NodeKind::Task,
        })
    }
}
