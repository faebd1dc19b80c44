//! The mock engine: resolves requests against the registered mappings.
//!
//! Resolution takes a snapshot of the registry and of the scenario states,
//! scores every eligible mapping, selects a winner and only then applies the
//! winner's scenario transition. If the scenario moved on between selection and
//! transition, the whole resolution is retried against fresh state.

use crate::config::{EngineConfig, EngineSettings};
use crate::mapping::{Mapping, ResponseMessage};
use crate::match_result::RequestMatchResult;
use crate::matcher::MatcherFactories;
use crate::registry::{MappingRegistry, RegisteredMapping, RegistryError, RegistryEvent};
use crate::request::RequestMessage;
use crate::scenario::{ScenarioState, ScenarioStore, Transition};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on resolutions restarted because a scenario moved concurrently.
const MAX_RESOLVE_ATTEMPTS: usize = 16;

/// A scored mapping.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub mapping: Arc<Mapping>,
    pub match_result: RequestMatchResult,
}

impl Candidate {
    pub fn score(&self) -> f64 {
        self.match_result.average_total_score()
    }
}

impl Serialize for Candidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Candidate", 5)?;
        state.serialize_field("guid", &self.mapping.guid())?;
        state.serialize_field("title", &self.mapping.title())?;
        state.serialize_field("priority", &self.mapping.priority())?;
        state.serialize_field("score", &self.score())?;
        state.serialize_field("match_result", &self.match_result)?;
        state.end()
    }
}

/// Outcome of resolving one request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolution {
    /// The selected mapping, if any.
    pub winner: Option<Candidate>,
    /// Best candidate below the perfect-match threshold.
    pub partial: Option<Candidate>,
    /// State of the winner's scenario: after its transition when resolving,
    /// as found when diagnosing.
    pub scenario: Option<ScenarioState>,
}

impl Resolution {
    pub fn is_match(&self) -> bool {
        self.winner.is_some()
    }

    pub fn mapping(&self) -> Option<&Arc<Mapping>> {
        self.winner.as_ref().map(|c| &c.mapping)
    }

    /// Ask the winning mapping's provider for the response.
    pub fn response(&self, request: &RequestMessage) -> Option<anyhow::Result<ResponseMessage>> {
        self.mapping()
            .map(|mapping| mapping.response().provide_response(request))
    }
}

struct Selection {
    winner: Option<Candidate>,
    partial: Option<Candidate>,
}

struct Scored<'a> {
    entry: &'a RegisteredMapping,
    match_result: RequestMatchResult,
    score: f64,
}

impl Scored<'_> {
    fn priority(&self) -> i32 {
        self.entry.mapping.priority()
    }

    fn into_candidate(self) -> Candidate {
        Candidate {
            mapping: Arc::clone(&self.entry.mapping),
            match_result: self.match_result,
        }
    }
}

/// Request matching engine.
///
/// Owns the mapping registry and the scenario states. All methods take `&self`
/// and are safe to call from many tasks at once.
#[derive(Debug)]
pub struct MockEngine {
    settings: EngineSettings,
    registry: MappingRegistry,
    scenarios: ScenarioStore,
    rng: Mutex<StdRng>,
    /// Total requests resolved.
    requests_total: AtomicU64,
    /// Total requests with a winning mapping.
    requests_matched: AtomicU64,
    /// Total requests without a winning mapping.
    requests_unmatched: AtomicU64,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl MockEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            registry: MappingRegistry::new(),
            scenarios: ScenarioStore::new(),
            rng: Mutex::new(StdRng::from_entropy()),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Seed the generator used for probability-weighted selection.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Build an engine and register every mapping of `config`.
    pub fn from_config(config: &EngineConfig, factories: &MatcherFactories) -> anyhow::Result<Self> {
        config.settings.validate()?;
        let engine = Self::new(config.settings.clone());
        for mapping in config.to_mappings(factories)? {
            engine.add_mapping(mapping)?;
        }
        engine.warn_unreachable_scenario_states();

        info!(
            mappings = engine.registry.len(),
            allow_partial_mapping = engine.settings.allow_partial_mapping,
            "Mock engine initialized"
        );
        Ok(engine)
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Self::from_config(&EngineConfig::from_yaml(yaml)?, &MatcherFactories::default())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    /// Get total requests resolved.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(AtomicOrdering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(AtomicOrdering::Relaxed)
    }

    /// Get total requests unmatched.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(AtomicOrdering::Relaxed)
    }

    /// Register a mapping. Fails if its guid is already registered.
    pub fn add_mapping(&self, mapping: Mapping) -> Result<Arc<Mapping>, RegistryError> {
        let mapping = self.registry.add(mapping)?;
        self.on_registered(&mapping);
        Ok(mapping)
    }

    /// Register a mapping, replacing any mapping with the same guid.
    pub fn add_or_replace_mapping(&self, mapping: Mapping) -> Arc<Mapping> {
        let mapping = self.registry.add_or_replace(mapping);
        self.on_registered(&mapping);
        mapping
    }

    pub fn remove_mapping(&self, guid: Uuid) -> Result<Arc<Mapping>, RegistryError> {
        self.registry.remove(guid)
    }

    /// Remove every mapping. Scenario states are kept.
    pub fn reset_mappings(&self) {
        self.registry.reset();
    }

    pub fn mappings(&self) -> Vec<Arc<Mapping>> {
        self.registry.get_all()
    }

    pub fn mapping(&self, guid: Uuid) -> Option<Arc<Mapping>> {
        self.registry.get(guid)
    }

    /// Put one scenario back into its initial state.
    pub fn reset_scenario(&self, name: &str) -> bool {
        let reset = self.scenarios.reset(name);
        if reset {
            self.registry
                .publish(RegistryEvent::ScenarioReset(name.to_string()));
        }
        reset
    }

    /// Put every scenario back into its initial state.
    pub fn reset_scenarios(&self) {
        for state in self.scenarios.all() {
            self.scenarios.reset(&state.name);
        }
        self.registry.publish(RegistryEvent::ScenariosReset);
    }

    pub fn scenario_state(&self, name: &str) -> Option<ScenarioState> {
        self.scenarios.get(name)
    }

    /// Every scenario state, ordered by name.
    pub fn scenario_states(&self) -> Vec<ScenarioState> {
        self.scenarios.all()
    }

    /// Remove every mapping and every scenario.
    pub fn reset(&self) {
        self.registry.reset();
        self.scenarios.clear();
        self.registry.publish(RegistryEvent::ScenariosReset);
    }

    /// Receive every registry and scenario change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    fn on_registered(&self, mapping: &Mapping) {
        if let Some(binding) = mapping.scenario() {
            self.scenarios.ensure(&binding.name);
        }
    }

    /// Scenario states some mapping waits for but no registered mapping moves to,
    /// as `(scenario, state)` pairs.
    pub fn unreachable_scenario_states(&self) -> Vec<(String, String)> {
        let mappings = self.registry.snapshot();
        let mut unreachable: Vec<(String, String)> = mappings
            .iter()
            .filter_map(|entry| {
                let binding = entry.mapping.scenario()?;
                let state = binding.when_state_is.as_ref()?;
                let reachable = mappings.iter().any(|other| {
                    other.mapping.scenario().is_some_and(|b| {
                        b.name == binding.name && b.set_state_to.as_ref() == Some(state)
                    })
                });
                (!reachable).then(|| (binding.name.clone(), state.clone()))
            })
            .collect();
        unreachable.sort();
        unreachable.dedup();
        unreachable
    }

    fn warn_unreachable_scenario_states(&self) {
        for (scenario, state) in self.unreachable_scenario_states() {
            warn!(
                scenario = %scenario,
                state = %state,
                "Mappings wait for a scenario state that no mapping sets"
            );
        }
    }

    /// Find the mapping for `request` and apply its scenario transition.
    pub fn resolve(&self, request: &RequestMessage) -> Resolution {
        self.requests_total.fetch_add(1, AtomicOrdering::Relaxed);

        for attempt in 0..MAX_RESOLVE_ATTEMPTS {
            let mappings = self.registry.snapshot();
            let states = self.scenarios.snapshot();
            let selection = self.select(&mappings, &states, request, Utc::now());

            let Some(winner) = selection.winner else {
                self.record_unmatched(request, selection.partial.as_ref());
                return Resolution {
                    winner: None,
                    partial: selection.partial,
                    scenario: None,
                };
            };

            let scenario = match winner.mapping.scenario() {
                None => None,
                Some(binding) => {
                    let transition = self.scenarios.transition(binding, |state| {
                        is_terminal(&mappings, &binding.name, state)
                    });
                    match transition {
                        Transition::Applied(state) => Some(state),
                        Transition::Stale => {
                            debug!(
                                mapping = %winner.mapping.guid(),
                                scenario = %binding.name,
                                attempt,
                                "Scenario moved during resolution, retrying"
                            );
                            continue;
                        }
                    }
                }
            };

            self.record_matched(request, &winner);
            return Resolution {
                winner: Some(winner),
                partial: selection.partial,
                scenario,
            };
        }

        warn!(
            method = %request.method(),
            path = %request.path(),
            attempts = MAX_RESOLVE_ATTEMPTS,
            "Scenario kept moving, giving up on request"
        );
        self.record_unmatched(request, None);
        Resolution::default()
    }

    /// Resolve `request` without touching scenario state or counters.
    pub fn diagnose(&self, request: &RequestMessage) -> Resolution {
        let mappings = self.registry.snapshot();
        let states = self.scenarios.snapshot();
        let selection = self.select(&mappings, &states, request, Utc::now());
        let scenario = selection
            .winner
            .as_ref()
            .and_then(|c| c.mapping.scenario())
            .map(|binding| {
                states
                    .get(&binding.name)
                    .cloned()
                    .unwrap_or_else(|| ScenarioState::new(binding.name.as_str()))
            });
        Resolution {
            winner: selection.winner,
            partial: selection.partial,
            scenario,
        }
    }

    fn is_eligible(
        &self,
        mapping: &Mapping,
        states: &HashMap<String, ScenarioState>,
        now: DateTime<Utc>,
    ) -> bool {
        if !mapping.is_active_at(now) {
            return false;
        }
        match mapping.scenario() {
            None => true,
            Some(binding) => {
                let when = binding.when_state_is.as_deref();
                match states.get(&binding.name) {
                    Some(state) => state.accepts(when),
                    None => when.is_none(),
                }
            }
        }
    }

    fn select(
        &self,
        mappings: &[RegisteredMapping],
        states: &HashMap<String, ScenarioState>,
        request: &RequestMessage,
        now: DateTime<Utc>,
    ) -> Selection {
        let threshold = self.settings.perfect_match_threshold;
        let mut perfect: Vec<Scored<'_>> = Vec::new();
        let mut partial: Option<Scored<'_>> = None;

        for entry in mappings {
            if !self.is_eligible(&entry.mapping, states, now) {
                continue;
            }
            let match_result = entry.mapping.get_request_match_result(request, threshold);
            let scored = Scored {
                entry,
                score: match_result.average_total_score(),
                match_result,
            };

            if scored.match_result.is_perfect_match() {
                perfect.push(scored);
            } else if scored.score > 0.0
                && partial
                    .as_ref()
                    .map_or(true, |best| outranks_partial(&scored, best))
            {
                partial = Some(scored);
            }
        }

        perfect.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.entry.sequence.cmp(&b.entry.sequence))
        });

        let partial = partial.map(Scored::into_candidate);

        if perfect.is_empty() {
            let winner = if self.settings.allow_partial_mapping {
                partial.clone()
            } else {
                None
            };
            return Selection { winner, partial };
        }

        let index = self.pick_among_ties(&perfect);
        let winner = perfect.swap_remove(index).into_candidate();
        Selection {
            winner: Some(winner),
            partial,
        }
    }

    /// Index of the winner in the ranked perfect candidates.
    fn pick_among_ties(&self, ranked: &[Scored<'_>]) -> usize {
        let top = &ranked[0];
        let tied = ranked
            .iter()
            .take_while(|c| c.priority() == top.priority() && c.score == top.score)
            .count();
        if tied < 2
            || !ranked[..tied]
                .iter()
                .any(|c| c.entry.mapping.probability().is_some())
        {
            return 0;
        }

        let weights: Vec<f64> = ranked[..tied]
            .iter()
            .map(|c| c.entry.mapping.probability().unwrap_or(1.0))
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(distribution) => distribution.sample(&mut *self.rng.lock()),
            // All weights zero.
            Err(_) => 0,
        }
    }

    fn record_matched(&self, request: &RequestMessage, winner: &Candidate) {
        self.requests_matched.fetch_add(1, AtomicOrdering::Relaxed);
        if self.settings.log_matches {
            info!(
                mapping = %winner.mapping.label(),
                method = %request.method(),
                path = %request.path(),
                score = winner.score(),
                "Request matched mapping"
            );
        }
    }

    fn record_unmatched(&self, request: &RequestMessage, partial: Option<&Candidate>) {
        self.requests_unmatched.fetch_add(1, AtomicOrdering::Relaxed);
        if self.settings.log_unmatched {
            warn!(
                method = %request.method(),
                path = %request.path(),
                closest = ?partial.map(|c| c.mapping.guid()),
                closest_score = partial.map(Candidate::score),
                "No matching mapping found"
            );
        }
    }
}

/// Higher score wins, then lower priority. Earlier registration wins full ties.
fn outranks_partial(candidate: &Scored<'_>, best: &Scored<'_>) -> bool {
    match candidate.score.total_cmp(&best.score) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.priority() < best.priority(),
    }
}

/// A state ends its scenario when no mapping of that scenario waits for it.
fn is_terminal(mappings: &[RegisteredMapping], scenario: &str, state: Option<&str>) -> bool {
    let Some(state) = state else {
        return true;
    };
    !mappings.iter().any(|entry| {
        entry.mapping.scenario().is_some_and(|binding| {
            binding.name == scenario && binding.when_state_is.as_deref() == Some(state)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseDefinition;
    use crate::matcher::Matcher;
    use crate::request_matcher::RequestPredicate;
    use crate::scenario::LinearScenario;

    fn ok() -> Arc<ResponseDefinition> {
        Arc::new(ResponseDefinition::text(200, "ok"))
    }

    fn get_path(path: &str) -> RequestPredicate {
        RequestPredicate::new()
            .using_method("GET")
            .with_path(Matcher::exact([path], false).unwrap())
    }

    fn engine() -> MockEngine {
        MockEngine::default().with_seed(7)
    }

    #[test]
    fn test_no_mappings_no_match() {
        let engine = engine();
        let resolution = engine.resolve(&RequestMessage::new("GET", "/"));
        assert!(!resolution.is_match());
        assert!(resolution.partial.is_none());
        assert_eq!(engine.total_unmatched(), 1);
    }

    #[test]
    fn test_lower_priority_wins() {
        let engine = engine();
        let high = engine
            .add_mapping(
                Mapping::builder()
                    .priority(5)
                    .given(get_path("/a"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let low = engine
            .add_mapping(
                Mapping::builder()
                    .priority(1)
                    .given(get_path("/a"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let resolution = engine.resolve(&RequestMessage::new("GET", "/a"));
        assert_eq!(resolution.mapping().unwrap().guid(), low.guid());
        assert_ne!(low.guid(), high.guid());
        assert_eq!(engine.total_matched(), 1);
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let engine = engine();
        let first = engine
            .add_mapping(Mapping::builder().given(get_path("/a")).respond_with(ok()).build().unwrap())
            .unwrap();
        engine
            .add_mapping(Mapping::builder().given(get_path("/a")).respond_with(ok()).build().unwrap())
            .unwrap();

        for _ in 0..5 {
            let resolution = engine.resolve(&RequestMessage::new("GET", "/a"));
            assert_eq!(resolution.mapping().unwrap().guid(), first.guid());
        }
    }

    #[test]
    fn test_partial_candidate_is_reported() {
        let engine = engine();
        let mapping = engine
            .add_mapping(Mapping::builder().given(get_path("/a")).respond_with(ok()).build().unwrap())
            .unwrap();

        let resolution = engine.resolve(&RequestMessage::new("GET", "/b"));
        assert!(!resolution.is_match());
        let partial = resolution.partial.unwrap();
        assert_eq!(partial.mapping.guid(), mapping.guid());
        assert_eq!(partial.score(), 0.5);
    }

    #[test]
    fn test_allow_partial_mapping_accepts_best_partial() {
        let settings = EngineSettings {
            allow_partial_mapping: true,
            ..EngineSettings::default()
        };
        let engine = MockEngine::new(settings);
        let mapping = engine
            .add_mapping(Mapping::builder().given(get_path("/a")).respond_with(ok()).build().unwrap())
            .unwrap();

        let resolution = engine.resolve(&RequestMessage::new("GET", "/b"));
        assert_eq!(resolution.mapping().unwrap().guid(), mapping.guid());
        assert!(!resolution.winner.unwrap().match_result.is_perfect_match());
    }

    #[test]
    fn test_expired_mapping_is_skipped() {
        let engine = engine();
        engine
            .add_mapping(
                Mapping::builder()
                    .time_settings(crate::mapping::TimeSettings {
                        start: None,
                        end: Some(Utc::now() - chrono::TimeDelta::seconds(1)),
                        ttl: None,
                    })
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(!engine.resolve(&RequestMessage::new("GET", "/")).is_match());
    }

    #[test]
    fn test_probability_selects_among_equal_candidates() {
        let engine = engine();
        let never = engine
            .add_mapping(
                Mapping::builder()
                    .probability(0.0)
                    .given(get_path("/a"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let always = engine
            .add_mapping(
                Mapping::builder()
                    .probability(1.0)
                    .given(get_path("/a"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        for _ in 0..20 {
            let resolution = engine.resolve(&RequestMessage::new("GET", "/a"));
            assert_eq!(resolution.mapping().unwrap().guid(), always.guid());
        }
        assert!(engine.mapping(never.guid()).is_some());
    }

    #[test]
    fn test_probability_does_not_override_priority() {
        let engine = engine();
        let preferred = engine
            .add_mapping(
                Mapping::builder()
                    .priority(0)
                    .probability(0.01)
                    .given(get_path("/a"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        engine
            .add_mapping(
                Mapping::builder()
                    .priority(1)
                    .probability(1.0)
                    .given(get_path("/a"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        for _ in 0..20 {
            let resolution = engine.resolve(&RequestMessage::new("GET", "/a"));
            assert_eq!(resolution.mapping().unwrap().guid(), preferred.guid());
        }
    }

    #[test]
    fn test_diagnose_does_not_advance_scenario() {
        let engine = engine();
        let mappings = LinearScenario::new("flow")
            .step("one", Mapping::builder().given(get_path("/step")).respond_with(ok()))
            .step("two", Mapping::builder().given(get_path("/step")).respond_with(ok()))
            .build()
            .unwrap();
        for mapping in mappings {
            engine.add_mapping(mapping).unwrap();
        }

        let request = RequestMessage::new("GET", "/step");
        let diagnosis = engine.diagnose(&request);
        assert!(diagnosis.is_match());
        assert!(!diagnosis.scenario.unwrap().started);
        assert_eq!(engine.scenario_state("flow").unwrap().counter, 0);
        assert_eq!(engine.total_requests(), 0);

        let resolution = engine.resolve(&request);
        assert_eq!(resolution.scenario.unwrap().current_state.as_deref(), Some("one"));
    }

    #[test]
    fn test_linear_scenario_finishes_on_last_state() {
        let engine = engine();
        let mappings = LinearScenario::new("flow")
            .step("one", Mapping::builder().given(get_path("/step")).respond_with(ok()))
            .step("two", Mapping::builder().given(get_path("/step")).respond_with(ok()))
            .build()
            .unwrap();
        for mapping in mappings {
            engine.add_mapping(mapping).unwrap();
        }

        let request = RequestMessage::new("GET", "/step");
        assert!(!engine.resolve(&request).scenario.unwrap().finished);
        let last = engine.resolve(&request).scenario.unwrap();
        assert!(last.finished);
        assert_eq!(last.counter, 2);

        // Nothing waits for "two".
        assert!(!engine.resolve(&request).is_match());
    }

    #[test]
    fn test_reset_scenario_restarts_flow() {
        let engine = engine();
        let mut events = engine.subscribe();
        engine
            .add_mapping(
                Mapping::builder()
                    .in_scenario("flow")
                    .will_set_state_to("done")
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let request = RequestMessage::new("GET", "/");
        assert!(engine.resolve(&request).is_match());
        assert!(!engine.resolve(&request).is_match());

        assert!(engine.reset_scenario("flow"));
        assert!(!engine.reset_scenario("unknown"));
        assert!(engine.resolve(&request).is_match());

        assert!(matches!(
            tokio_test::block_on(events.recv()).unwrap(),
            RegistryEvent::MappingAdded(_)
        ));
        assert_eq!(
            tokio_test::block_on(events.recv()).unwrap(),
            RegistryEvent::ScenarioReset("flow".to_string())
        );
    }

    #[test]
    fn test_registration_creates_scenario() {
        let engine = engine();
        engine
            .add_mapping(
                Mapping::builder()
                    .in_scenario("flow")
                    .when_state_is("never-set")
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let states = engine.scenario_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0], ScenarioState::new("flow"));
        assert_eq!(
            engine.unreachable_scenario_states(),
            vec![("flow".to_string(), "never-set".to_string())]
        );
    }

    #[test]
    fn test_unreachable_states_ignore_registration_order() {
        let engine = engine();
        let waiting = Mapping::builder()
            .in_scenario("login")
            .when_state_is("S1")
            .respond_with(ok())
            .build()
            .unwrap();
        let advancing = Mapping::builder()
            .in_scenario("login")
            .will_set_state_to("S1")
            .respond_with(ok())
            .build()
            .unwrap();

        engine.add_mapping(waiting).unwrap();
        assert_eq!(
            engine.unreachable_scenario_states(),
            vec![("login".to_string(), "S1".to_string())]
        );

        engine.add_mapping(advancing).unwrap();
        assert!(engine.unreachable_scenario_states().is_empty());
    }

    #[test]
    fn test_from_yaml_accepts_mappings_in_any_order() {
        let yaml = r#"
mappings:
  - scenario:
      name: login
      when_state_is: S1
    response:
      status: 200
  - scenario:
      name: login
      set_state_to: S1
    response:
      status: 200
"#;
        let engine = MockEngine::from_yaml(yaml).unwrap();
        assert!(engine.unreachable_scenario_states().is_empty());
        assert_eq!(engine.scenario_states().len(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let engine = engine();
        engine
            .add_mapping(
                Mapping::builder()
                    .in_scenario("flow")
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        engine.reset();
        assert!(engine.mappings().is_empty());
        assert!(engine.scenario_states().is_empty());
    }

    #[test]
    fn test_from_yaml_and_response() {
        let yaml = r#"
mappings:
  - request:
      methods: [GET]
      path:
        - type: wildcard
          patterns: ["/api/*"]
    response:
      status: 200
      body:
        type: json
        content:
          status: ok
"#;
        let engine = MockEngine::from_yaml(yaml).unwrap();
        let request = RequestMessage::new("GET", "/api/users");
        let resolution = engine.resolve(&request);
        let response = resolution.response(&request).unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, br#"{"status":"ok"}"#);
    }

    #[test]
    fn test_resolution_serializes() {
        let engine = engine();
        engine
            .add_mapping(
                Mapping::builder()
                    .title("root")
                    .given(get_path("/"))
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let resolution = engine.diagnose(&RequestMessage::new("GET", "/"));
        let json = serde_json::to_value(&resolution).unwrap();
        assert_eq!(json["winner"]["title"], "root");
        assert_eq!(json["winner"]["score"], 1.0);
        assert!(json["partial"].is_null());
    }

    #[test]
    fn test_is_terminal() {
        let engine = engine();
        engine
            .add_mapping(
                Mapping::builder()
                    .in_scenario("flow")
                    .when_state_is("a")
                    .respond_with(ok())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let mappings = engine.registry().snapshot();
        assert!(!is_terminal(&mappings, "flow", Some("a")));
        assert!(is_terminal(&mappings, "flow", Some("b")));
        assert!(is_terminal(&mappings, "other", Some("a")));
        assert!(is_terminal(&mappings, "flow", None));
    }
}
