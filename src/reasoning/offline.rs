use async_trait::async_trait;
use serde_json::Value;

use super::{Decision, Orientation, ReasoningRequest, ReasoningResponse, ReasoningService};
use crate::core::error::EngineResult;

/// Deterministic planner that needs no model backend.
///
/// Reads `routines` (list of `{id, name}`) and `completed_routines` (list of
/// ids) from the context and runs each outstanding routine once.
#[derive(Debug, Default, Clone)]
pub struct OfflineReasoningService;

impl OfflineReasoningService {
    pub fn new() -> Self {
        Self
    }

    fn routine_ids(context: &Value, key: &str) -> Vec<String> {
        context
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.as_str()
                            .or_else(|| item.get("id").and_then(|id| id.as_str()))
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningService for OfflineReasoningService {
    async fn reason(&self, request: ReasoningRequest) -> EngineResult<ReasoningResponse> {
        let first_line = request.prompt.lines().next().unwrap_or_default();
        Ok(ReasoningResponse {
            text: format!("offline: {}", first_line),
            confidence: Some(0.5),
            tokens_used: 0,
        })
    }

    async fn analyze_situation(&self, goal: &str, context: &Value) -> EngineResult<Orientation> {
        let routines = Self::routine_ids(context, "routines");
        let threats = if routines.is_empty() {
            vec!["no routines available".to_string()]
        } else {
            Vec::new()
        };
        Ok(Orientation {
            situation: format!("working towards: {}", goal),
            opportunities: routines,
            threats,
        })
    }

    async fn generate_decisions(
        &self,
        _goal: &str,
        orientation: &Orientation,
        context: &Value,
    ) -> EngineResult<Vec<Decision>> {
        let completed = Self::routine_ids(context, "completed_routines");
        let outstanding: Vec<Decision> = orientation
            .opportunities
            .iter()
            .filter(|id| !completed.contains(id))
            .map(|id| Decision::RunRoutine {
                routine_id: id.clone(),
                inputs: serde_json::Map::new(),
                rationale: "not yet run".to_string(),
            })
            .collect();

        if outstanding.is_empty() {
            Ok(vec![Decision::Complete {
                summary: format!("{} routine(s) completed", completed.len()),
            }])
        } else {
            Ok(outstanding)
        }
    }
}
