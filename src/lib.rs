//! Zentinel Mock Engine
//!
//! The request matching core of a mock server: scores incoming requests
//! against registered mappings, picks the winner by priority, score and
//! probability, and drives scenario state machines.
//!
//! # Features
//!
//! - **Scored Matching**: Every facet (method, path, url, headers, cookies,
//!   query params, body) scores in `[0, 1]`; partial matches are reported
//! - **Matchers**: Exact, contains, wildcard, regex (time bounded), JSON,
//!   partial JSON, JSON path, raw bytes and injected custom matchers
//! - **Priorities & Probability**: Lower priority wins; equally good mappings
//!   can be picked at random by weight
//! - **Scenarios**: Mappings gated on and advancing named scenario states,
//!   atomically per scenario
//! - **Live Registry**: Mappings added, replaced and removed while requests
//!   are resolved, with change notifications
//!
//! # Example Configuration
//!
//! ```yaml
//! mappings:
//!   - title: hello-world
//!     request:
//!       methods: [GET]
//!       path:
//!         - type: exact
//!           patterns: [/hello]
//!     response:
//!       status: 200
//!       body:
//!         type: json
//!         content:
//!           message: "Hello, World!"
//! ```

pub mod config;
pub mod engine;
pub mod mapping;
pub mod match_result;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod request_matcher;
pub mod scenario;

pub use config::{EngineConfig, EngineSettings, ResponseDefinition};
pub use engine::{Candidate, MockEngine, Resolution};
pub use mapping::{Mapping, MappingBuilder, ResponseMessage, ResponseProvider};
pub use match_result::{MatchScores, RequestMatchResult};
pub use matcher::{MatchBehaviour, MatchOperator, Matcher, MatcherFactories};
pub use registry::{MappingRegistry, RegistryError, RegistryEvent};
pub use request::RequestMessage;
pub use request_matcher::RequestPredicate;
pub use scenario::{LinearScenario, ScenarioState};
