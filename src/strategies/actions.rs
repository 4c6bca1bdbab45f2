//! Named deterministic actions available to steps and tool calls

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::context::SwarmContext;
use crate::core::error::{EngineError, EngineResult};
use crate::navigation::lookup_path;

#[async_trait]
pub trait StepAction: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, inputs: &Map<String, Value>, context: &SwarmContext) -> EngineResult<Value>;
}

/// Actions by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn StepAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo`, `template` and `set_context`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EchoAction);
        registry.register(TemplateAction);
        registry.register(SetContextAction);
        registry
    }

    pub fn register<A: StepAction + 'static>(&mut self, action: A) {
        self.actions.insert(action.name().to_string(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepAction>> {
        self.actions.get(name).cloned()
    }

    /// `(name, description)` pairs, sorted by name
    pub fn describe(&self) -> Vec<(String, String)> {
        self.actions
            .values()
            .map(|a| (a.name().to_string(), a.description().to_string()))
            .collect()
    }

    pub async fn run(
        &self,
        name: &str,
        inputs: &Map<String, Value>,
        context: &SwarmContext,
    ) -> EngineResult<Value> {
        let action = self
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("action '{}'", name)))?;
        action.run(inputs, context).await
    }
}

/// Replace `{{path}}` placeholders with values from `vars`. Strings are
/// inserted verbatim, other values as JSON. Unknown placeholders are errors.
pub fn render_template(template: &str, vars: &Value) -> EngineResult<String> {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("static regex"));

    let mut missing = Vec::new();
    let rendered = re.replace_all(template, |caps: &regex::Captures| {
        let path = &caps[1];
        match lookup_path(vars, path) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.push(path.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(EngineError::StrategyExecution(format!(
            "template placeholders without value: {}",
            missing.join(", ")
        )))
    }
}

fn required_str<'a>(inputs: &'a Map<String, Value>, key: &str, action: &str) -> EngineResult<&'a str> {
    inputs
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::StrategyExecution(format!("{} needs a string '{}'", action, key)))
}

struct EchoAction;

#[async_trait]
impl StepAction for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the inputs unchanged"
    }

    async fn run(&self, inputs: &Map<String, Value>, _context: &SwarmContext) -> EngineResult<Value> {
        Ok(Value::Object(inputs.clone()))
    }
}

struct TemplateAction;

#[async_trait]
impl StepAction for TemplateAction {
    fn name(&self) -> &str {
        "template"
    }

    fn description(&self) -> &str {
        "Render inputs.template, substituting {{name}} with other inputs"
    }

    async fn run(&self, inputs: &Map<String, Value>, _context: &SwarmContext) -> EngineResult<Value> {
        let template = required_str(inputs, "template", "template")?;
        let text = render_template(template, &Value::Object(inputs.clone()))?;
        Ok(json!({ "text": text }))
    }
}

struct SetContextAction;

#[async_trait]
impl StepAction for SetContextAction {
    fn name(&self) -> &str {
        "set_context"
    }

    fn description(&self) -> &str {
        "Write inputs.value to the blackboard under inputs.key"
    }

    async fn run(&self, inputs: &Map<String, Value>, context: &SwarmContext) -> EngineResult<Value> {
        let key = required_str(inputs, "key", "set_context")?;
        let value = inputs.get("value").cloned().unwrap_or(Value::Null);
        context.set(key, value.clone()).await?;
        Ok(json!({ "key": key, "value": value }))
    }
}
