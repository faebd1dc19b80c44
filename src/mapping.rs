//! Mappings: a request predicate bound to a response provider.

use crate::match_result::RequestMatchResult;
use crate::request::RequestMessage;
use crate::request_matcher::RequestPredicate;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Priority reserved for admin-interface mappings; always ranked first.
pub const ADMIN_PRIORITY: i32 = i32::MIN;

/// Priority reserved for proxy mappings.
pub const PROXY_PRIORITY: i32 = -2_000_000;

/// Response produced for a matched request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMessage {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Produces the response for a winning mapping. Implemented by the
/// response-generation layer; the engine only hands it back.
pub trait ResponseProvider: Send + Sync + fmt::Debug {
    fn provide_response(&self, request: &RequestMessage) -> anyhow::Result<ResponseMessage>;
}

/// Ties a mapping to a scenario state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioBinding {
    /// Scenario name
    pub name: String,
    /// Required current state; `None` means "scenario not started yet"
    #[serde(default)]
    pub when_state_is: Option<String>,
    /// State to move to when this mapping wins; `None` keeps the current state
    #[serde(default)]
    pub set_state_to: Option<String>,
}

/// Validity window of a mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSettings {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Lifetime in seconds, counted from `start` (or registration when unset).
    /// Ignored when `end` is set.
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl TimeSettings {
    pub fn is_valid(&self, now: DateTime<Utc>, registered_at: DateTime<Utc>) -> bool {
        if let Some(start) = self.start {
            if now < start {
                return false;
            }
        }

        let end = self.end.or_else(|| {
            let ttl = TimeDelta::try_seconds(i64::try_from(self.ttl?).ok()?)?;
            self.start.unwrap_or(registered_at).checked_add_signed(ttl)
        });

        end.map_or(true, |end| now <= end)
    }
}

/// Error raised when building an inconsistent mapping.
#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("mapping {0} has no response provider")]
    MissingResponse(Uuid),

    #[error("mapping {0} sets scenario states but names no scenario")]
    StateWithoutScenario(Uuid),

    #[error("mapping {guid} has probability {probability}, expected a value in [0, 1]")]
    InvalidProbability { guid: Uuid, probability: f64 },
}

/// A registered stub. Immutable once built.
#[derive(Debug, Clone)]
pub struct Mapping {
    guid: Uuid,
    title: Option<String>,
    description: Option<String>,
    priority: i32,
    scenario: Option<ScenarioBinding>,
    time_settings: Option<TimeSettings>,
    probability: Option<f64>,
    predicate: RequestPredicate,
    response: Arc<dyn ResponseProvider>,
    updated_at: DateTime<Utc>,
}

impl Mapping {
    pub fn builder() -> MappingBuilder {
        MappingBuilder::default()
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn scenario(&self) -> Option<&ScenarioBinding> {
        self.scenario.as_ref()
    }

    pub fn time_settings(&self) -> Option<&TimeSettings> {
        self.time_settings.as_ref()
    }

    pub fn probability(&self) -> Option<f64> {
        self.probability
    }

    pub fn predicate(&self) -> &RequestPredicate {
        &self.predicate
    }

    pub fn response(&self) -> &Arc<dyn ResponseProvider> {
        &self.response
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the mapping's time window contains `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.time_settings
            .as_ref()
            .map_or(true, |ts| ts.is_valid(now, self.updated_at))
    }

    /// Score `request` against this mapping's predicate.
    pub fn get_request_match_result(
        &self,
        request: &RequestMessage,
        threshold: f64,
    ) -> RequestMatchResult {
        self.predicate.get_matching_result(request, threshold)
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match &self.title {
            Some(title) => format!("{} ({})", title, self.guid),
            None => self.guid.to_string(),
        }
    }
}

/// Fluent builder for [`Mapping`].
#[derive(Debug, Default)]
pub struct MappingBuilder {
    guid: Option<Uuid>,
    title: Option<String>,
    description: Option<String>,
    priority: i32,
    scenario: Option<String>,
    when_state_is: Option<String>,
    set_state_to: Option<String>,
    time_settings: Option<TimeSettings>,
    probability: Option<f64>,
    predicate: RequestPredicate,
    response: Option<Arc<dyn ResponseProvider>>,
    updated_at: Option<DateTime<Utc>>,
}

impl MappingBuilder {
    pub fn guid(mut self, guid: Uuid) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_scenario(mut self, name: impl Into<String>) -> Self {
        self.scenario = Some(name.into());
        self
    }

    pub fn when_state_is(mut self, state: impl Into<String>) -> Self {
        self.when_state_is = Some(state.into());
        self
    }

    pub fn will_set_state_to(mut self, state: impl Into<String>) -> Self {
        self.set_state_to = Some(state.into());
        self
    }

    /// Replace the whole scenario binding at once.
    pub fn scenario(mut self, binding: Option<ScenarioBinding>) -> Self {
        match binding {
            Some(binding) => {
                self.scenario = Some(binding.name);
                self.when_state_is = binding.when_state_is;
                self.set_state_to = binding.set_state_to;
            }
            None => {
                self.scenario = None;
                self.when_state_is = None;
                self.set_state_to = None;
            }
        }
        self
    }

    pub fn time_settings(mut self, time_settings: TimeSettings) -> Self {
        self.time_settings = Some(time_settings);
        self
    }

    pub fn probability(mut self, probability: f64) -> Self {
        self.probability = Some(probability);
        self
    }

    pub fn given(mut self, predicate: RequestPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn respond_with(mut self, response: Arc<dyn ResponseProvider>) -> Self {
        self.response = Some(response);
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn build(self) -> Result<Mapping, MappingError> {
        let guid = self.guid.unwrap_or_else(Uuid::new_v4);

        let response = self.response.ok_or(MappingError::MissingResponse(guid))?;

        if let Some(probability) = self.probability {
            if !(0.0..=1.0).contains(&probability) {
                return Err(MappingError::InvalidProbability { guid, probability });
            }
        }

        let scenario = match self.scenario {
            Some(name) => Some(ScenarioBinding {
                name,
                when_state_is: self.when_state_is,
                set_state_to: self.set_state_to,
            }),
            None if self.when_state_is.is_some() || self.set_state_to.is_some() => {
                return Err(MappingError::StateWithoutScenario(guid));
            }
            None => None,
        };

        Ok(Mapping {
            guid,
            title: self.title,
            description: self.description,
            priority: self.priority,
            scenario,
            time_settings: self.time_settings,
            probability: self.probability,
            predicate: self.predicate,
            response,
            updated_at: self.updated_at.unwrap_or_else(Utc::now),
        })
    }
}
