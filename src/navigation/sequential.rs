use serde::Deserialize;
use serde_json::Value;

use super::routine::{Location, Routine, StepInfo, END_NODE_ID};
use super::Navigator;
use crate::core::error::{EngineError, EngineResult};

#[derive(Debug, Deserialize)]
struct SequentialGraph {
    steps: Vec<SequentialStep>,
}

#[derive(Debug, Deserialize)]
struct SequentialStep {
    id: String,

    #[serde(default)]
    name: Option<String>,

    #[serde(rename = "type", default = "default_step_type")]
    step_type: String,

    #[serde(default)]
    config: Value,
}

fn default_step_type() -> String {
    "reasoning".to_string()
}

/// Routines whose graph is a plain ordered list of steps:
///
/// ```json
/// {"steps": [{"id": "fetch", "type": "action", "config": {...}}, ...]}
/// ```
///
/// The end location is the virtual node [`END_NODE_ID`] after the last step.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialNavigator;

impl SequentialNavigator {
    fn parse(routine: &Routine) -> EngineResult<SequentialGraph> {
        serde_json::from_value(routine.graph.clone()).map_err(|e| {
            EngineError::Configuration(format!(
                "routine '{}' is not a sequential step list: {}",
                routine.id, e
            ))
        })
    }

    fn index_of(graph: &SequentialGraph, location: &Location) -> EngineResult<usize> {
        graph
            .steps
            .iter()
            .position(|s| s.id == location.node_id)
            .ok_or_else(|| EngineError::NotFound(format!("step {}", location)))
    }
}

impl Navigator for SequentialNavigator {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn can_navigate(&self, routine: &Routine) -> bool {
        routine
            .graph
            .get("steps")
            .map(|steps| steps.is_array())
            .unwrap_or(false)
            && Self::parse(routine).is_ok()
    }

    fn start_location(&self, routine: &Routine, run_id: &str) -> EngineResult<Location> {
        let graph = Self::parse(routine)?;
        let node = graph
            .steps
            .first()
            .map(|s| s.id.as_str())
            .unwrap_or(END_NODE_ID);
        Ok(Location::new(run_id, &routine.id, node))
    }

    fn next_locations(
        &self,
        routine: &Routine,
        current: &Location,
        _context: Option<&Value>,
    ) -> EngineResult<Vec<Location>> {
        if current.node_id == END_NODE_ID {
            return Ok(Vec::new());
        }
        let graph = Self::parse(routine)?;
        let index = Self::index_of(&graph, current)?;
        let next = graph
            .steps
            .get(index + 1)
            .map(|s| s.id.as_str())
            .unwrap_or(END_NODE_ID);
        Ok(vec![current.at(next)])
    }

    fn is_end_location(&self, _routine: &Routine, location: &Location) -> EngineResult<bool> {
        Ok(location.node_id == END_NODE_ID)
    }

    fn step_info(&self, routine: &Routine, location: &Location) -> EngineResult<StepInfo> {
        let graph = Self::parse(routine)?;
        let step = &graph.steps[Self::index_of(&graph, location)?];
        Ok(StepInfo {
            node_id: step.id.clone(),
            name: step.name.clone().unwrap_or_else(|| step.id.clone()),
            step_type: step.step_type.clone(),
            config: step.config.clone(),
            executable: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn routine(ids: &[&str]) -> Routine {
        let steps: Vec<Value> = ids
            .iter()
            .map(|id| json!({"id": id, "type": "action"}))
            .collect();
        Routine::new("r", "R", json!({ "steps": steps }))
    }

    #[test]
    fn test_walks_steps_in_order_then_ends() {
        let nav = SequentialNavigator;
        let r = routine(&["a", "b"]);
        let start = nav.start_location(&r, "run").unwrap();
        assert_eq!(start.node_id, "a");
        assert!(!nav.is_end_location(&r, &start).unwrap());

        let next = nav.next_locations(&r, &start, None).unwrap();
        assert_eq!(next, vec![start.at("b")]);

        let end = nav.next_locations(&r, &next[0], None).unwrap();
        assert!(nav.is_end_location(&r, &end[0]).unwrap());
        assert!(nav.next_locations(&r, &end[0], None).unwrap().is_empty());
    }

    #[test]
    fn test_empty_routine_starts_at_end() {
        let nav = SequentialNavigator;
        let r = routine(&[]);
        let start = nav.start_location(&r, "run").unwrap();
        assert!(nav.is_end_location(&r, &start).unwrap());
    }

    #[test]
    fn test_step_info_defaults_name_to_id() {
        let nav = SequentialNavigator;
        let r = Routine::new("r", "R", json!({"steps": [{"id": "think"}]}));
        let info = nav
            .step_info(&r, &Location::new("run", "r", "think"))
            .unwrap();
        assert_eq!(info.name, "think");
        assert_eq!(info.step_type, "reasoning");
        assert!(info.executable);
    }

    #[test]
    fn test_unknown_location_is_not_found() {
        let nav = SequentialNavigator;
        let r = routine(&["a"]);
        let err = nav
            .next_locations(&r, &Location::new("run", "r", "zzz"), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_rejects_flow_graphs() {
        let r = Routine::new("r", "R", json!({"nodes": [], "edges": []}));
        assert!(!SequentialNavigator.can_navigate(&r));
    }

    proptest! {
        #[test]
        fn prop_linear_sequences_terminate(len in 0usize..40) {
            let ids: Vec<String> = (0..len).map(|i| format!("s{}", i)).collect();
            let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
            let r = routine(&refs);
            let nav = SequentialNavigator;

            let mut loc = nav.start_location(&r, "run").unwrap();
            let mut visited = 0;
            while !nav.is_end_location(&r, &loc).unwrap() {
                visited += 1;
                prop_assert!(visited <= len);
                loc = nav.next_locations(&r, &loc, None).unwrap().remove(0);
            }
            prop_assert_eq!(visited, len);
        }
    }
}
