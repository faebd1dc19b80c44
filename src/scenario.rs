//! Scenario state machines.
//!
//! A scenario is a named piece of conversation state. Mappings bound to a
//! scenario are only eligible while the scenario is in their `when_state_is`
//! state, and a winning mapping may move the scenario to another state.
//! Every scenario has its own lock so transitions on different scenarios never
//! contend.

use crate::mapping::{Mapping, MappingBuilder, MappingError, ScenarioBinding};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Current state of one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioState {
    pub name: String,
    pub current_state: Option<String>,
    pub started: bool,
    pub finished: bool,
    /// Number of times a mapping of this scenario has won.
    pub counter: u64,
}

impl ScenarioState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_state: None,
            started: false,
            finished: false,
            counter: 0,
        }
    }

    /// Whether a mapping gated on `when_state_is` may match in this state.
    /// `None` gates on "not started yet".
    pub fn accepts(&self, when_state_is: Option<&str>) -> bool {
        match when_state_is {
            None => !self.started,
            Some(state) => self.current_state.as_deref() == Some(state),
        }
    }
}

/// Outcome of applying a winning mapping to its scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(ScenarioState),
    /// The scenario moved on after the mapping was selected.
    Stale,
}

/// Shared scenario states, one lock per scenario.
#[derive(Debug, Default)]
pub struct ScenarioStore {
    scenarios: RwLock<HashMap<String, Arc<Mutex<ScenarioState>>>>,
}

impl ScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the scenario, creating it in its initial state if unknown.
    fn entry(&self, name: &str) -> Arc<Mutex<ScenarioState>> {
        if let Some(existing) = self.scenarios.read().get(name) {
            return Arc::clone(existing);
        }
        let mut scenarios = self.scenarios.write();
        Arc::clone(
            scenarios
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ScenarioState::new(name)))),
        )
    }

    /// Make sure a scenario exists.
    pub fn ensure(&self, name: &str) {
        self.entry(name);
    }

    pub fn get(&self, name: &str) -> Option<ScenarioState> {
        self.scenarios.read().get(name).map(|s| s.lock().clone())
    }

    /// Copy of every scenario state.
    pub fn snapshot(&self) -> HashMap<String, ScenarioState> {
        self.scenarios
            .read()
            .iter()
            .map(|(name, state)| (name.clone(), state.lock().clone()))
            .collect()
    }

    /// Every scenario state, ordered by name.
    pub fn all(&self) -> Vec<ScenarioState> {
        let mut states: Vec<_> = self.snapshot().into_values().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Put a scenario back into its initial state. Returns false if unknown.
    pub fn reset(&self, name: &str) -> bool {
        match self.scenarios.read().get(name) {
            Some(state) => {
                *state.lock() = ScenarioState::new(name);
                debug!(scenario = %name, "Scenario reset");
                true
            }
            None => false,
        }
    }

    /// Drop every scenario.
    pub fn clear(&self) {
        self.scenarios.write().clear();
    }

    /// Apply `binding` if the scenario is still in the state it gates on.
    ///
    /// The check and the update happen under the scenario's lock. `is_terminal`
    /// decides whether the resulting state ends the scenario.
    pub fn transition<F>(&self, binding: &ScenarioBinding, is_terminal: F) -> Transition
    where
        F: FnOnce(Option<&str>) -> bool,
    {
        let entry = self.entry(&binding.name);
        let mut state = entry.lock();

        if !state.accepts(binding.when_state_is.as_deref()) {
            return Transition::Stale;
        }

        state.counter += 1;
        state.started = true;
        if let Some(next) = &binding.set_state_to {
            state.current_state = Some(next.clone());
        }
        state.finished = is_terminal(state.current_state.as_deref());

        debug!(
            scenario = %state.name,
            state = ?state.current_state,
            counter = state.counter,
            finished = state.finished,
            "Scenario advanced"
        );

        Transition::Applied(state.clone())
    }
}

/// Builds a chain of mappings that walk a scenario through declared states in order.
///
/// The first step matches while the scenario has not started; each later step
/// matches in the state the previous step moved to. The last declared state is terminal.
#[derive(Debug)]
pub struct LinearScenario {
    name: String,
    steps: Vec<(String, MappingBuilder)>,
}

impl LinearScenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Add a step whose mapping moves the scenario to `state`.
    pub fn step(mut self, state: impl Into<String>, mapping: MappingBuilder) -> Self {
        self.steps.push((state.into(), mapping));
        self
    }

    pub fn build(self) -> Result<Vec<Mapping>, MappingError> {
        let mut previous: Option<String> = None;
        let mut mappings = Vec::with_capacity(self.steps.len());
        for (state, builder) in self.steps {
            let binding = ScenarioBinding {
                name: self.name.clone(),
                when_state_is: previous.take(),
                set_state_to: Some(state.clone()),
            };
            mappings.push(builder.scenario(Some(binding)).build()?);
            previous = Some(state);
        }
        Ok(mappings)
    }
}
