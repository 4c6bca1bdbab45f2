//! Pure interpreters of routine graphs.
//!
//! A [`Navigator`] answers "where does this run start, what comes next, is
//! this the end" for one graph shape. Navigators hold no state, cache nothing
//! and perform no I/O, so re-asking the same question after a failure always
//! yields the same answer.

pub mod flow_graph;
pub mod routine;
pub mod sequential;

pub use flow_graph::FlowGraphNavigator;
pub use routine::{Location, Routine, StepInfo, END_NODE_ID};
pub use sequential::SequentialNavigator;

use serde_json::Value;

use crate::core::error::{EngineError, EngineResult};

/// One graph representation a routine may use
pub trait Navigator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Structural detection of the routine's graph shape
    fn can_navigate(&self, routine: &Routine) -> bool;

    fn start_location(&self, routine: &Routine, run_id: &str) -> EngineResult<Location>;

    /// Candidate next locations. `context` may only narrow the candidates.
    fn next_locations(
        &self,
        routine: &Routine,
        current: &Location,
        context: Option<&Value>,
    ) -> EngineResult<Vec<Location>>;

    fn is_end_location(&self, routine: &Routine, location: &Location) -> EngineResult<bool>;

    fn step_info(&self, routine: &Routine, location: &Location) -> EngineResult<StepInfo>;

    /// Reject routines this navigator would accept but cannot run safely
    fn validate(&self, _routine: &Routine) -> EngineResult<()> {
        Ok(())
    }
}

/// Ordered set of navigators; the first that accepts a routine wins
pub struct NavigatorRegistry {
    navigators: Vec<Box<dyn Navigator>>,
}

impl NavigatorRegistry {
    pub fn new() -> Self {
        Self {
            navigators: Vec::new(),
        }
    }

    pub fn register<N: Navigator + 'static>(&mut self, navigator: N) {
        self.navigators.push(Box::new(navigator));
    }

    /// Navigator for a routine. No match is a configuration error.
    pub fn select(&self, routine: &Routine) -> EngineResult<&dyn Navigator> {
        self.navigators
            .iter()
            .find(|n| n.can_navigate(routine))
            .map(|n| n.as_ref())
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "no navigator understands the graph of routine '{}' (version {})",
                    routine.id, routine.version
                ))
            })
    }

    /// Select the navigator for `routine` and have it check the graph
    pub fn validate(&self, routine: &Routine) -> EngineResult<&dyn Navigator> {
        let navigator = self.select(routine)?;
        navigator.validate(routine)?;
        Ok(navigator)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.navigators.iter().map(|n| n.name()).collect()
    }
}

impl Default for NavigatorRegistry {
    /// Sequential lists first, then flow graphs
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(SequentialNavigator);
        registry.register(FlowGraphNavigator);
        registry
    }
}

/// Look up a dotted path (`a.b.c`) in a JSON object
pub fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(context, |value, segment| value.get(segment))
}
