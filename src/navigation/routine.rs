use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Node id of the virtual location past the last step of a routine
pub const END_NODE_ID: &str = "__end__";

/// A routine as stored by the data layer. The graph is kept raw so that
/// navigators can detect its shape structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Default inputs merged into the run's variables at start
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,

    /// Step graph: `{"steps": [...]}` or `{"nodes": [...], "edges": [...]}`
    pub graph: Value,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Routine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, graph: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: String::new(),
            inputs: serde_json::Map::new(),
            graph,
        }
    }
}

/// Where a run currently is
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub run_id: String,
    pub routine_id: String,
    pub node_id: String,
}

impl Location {
    pub fn new(
        run_id: impl Into<String>,
        routine_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            routine_id: routine_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Same run and routine, different node
    pub fn at(&self, node_id: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            routine_id: self.routine_id.clone(),
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.routine_id, self.node_id, self.run_id)
    }
}

/// Everything the orchestrator needs to execute one location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub node_id: String,

    pub name: String,

    /// Strategy-matching tag, e.g. `action`, `reasoning`, `conversation`, `routing`
    pub step_type: String,

    #[serde(default)]
    pub config: Value,

    /// Start events and gateways are traversed without executing anything
    pub executable: bool,
}
