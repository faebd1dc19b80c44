//! Configuration for the mock engine.
//!
//! Defines engine settings and declarative mappings that compile into
//! [`Mapping`]s.

use crate::mapping::{
    Mapping, ResponseMessage, ResponseProvider, ScenarioBinding, TimeSettings,
};
use crate::match_result::MatchScores;
use crate::matcher::{
    MatchBehaviour, MatchOperator, Matcher, MatcherFactories, DEFAULT_REGEX_TIMEOUT,
};
use crate::request::RequestMessage;
use crate::request_matcher::{
    BodyMatcher, MethodMatcher, NamedValueMatcher, RequestMatcher, RequestPredicate, ValueMatcher,
};
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Main configuration for the mock engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Mappings registered at startup
    #[serde(default)]
    pub mappings: Vec<MappingDefinition>,

    /// Engine settings
    #[serde(default)]
    pub settings: EngineSettings,
}

impl EngineConfig {
    /// Load configuration from a YAML file (no custom matchers).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Self::from_file_with(path, &MatcherFactories::default())
    }

    /// Load configuration from a YAML file, resolving custom matchers with `factories`.
    pub fn from_file_with(path: &Path, factories: &MatcherFactories) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_with(&content, factories)
    }

    /// Parse and validate configuration from YAML (no custom matchers).
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Self::from_yaml_with(yaml, &MatcherFactories::default())
    }

    /// Parse and validate configuration from YAML, resolving custom matchers with `factories`.
    pub fn from_yaml_with(yaml: &str, factories: &MatcherFactories) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate(factories)?;
        Ok(config)
    }

    /// Validate the configuration by compiling every mapping.
    pub fn validate(&self, factories: &MatcherFactories) -> anyhow::Result<()> {
        self.settings.validate()?;
        self.to_mappings(factories).map(|_| ())
    }

    /// Compile every mapping definition.
    pub fn to_mappings(&self, factories: &MatcherFactories) -> anyhow::Result<Vec<Mapping>> {
        let ctx = CompileContext {
            regex_timeout: self.settings.regex_timeout(),
            factories,
        };
        self.mappings
            .iter()
            .enumerate()
            .map(|(i, definition)| {
                definition
                    .compile(&ctx)
                    .map_err(|e| anyhow!("Mapping {}: {:#}", i, e))
            })
            .collect()
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Accept the best partial match when nothing matches perfectly
    #[serde(default)]
    pub allow_partial_mapping: bool,

    /// Average score at or above which a match counts as perfect
    #[serde(default = "default_threshold")]
    pub perfect_match_threshold: f64,

    /// Budget for a single regex evaluation
    #[serde(default = "default_regex_timeout_ms")]
    pub regex_timeout_ms: u64,

    /// Log matched requests
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            allow_partial_mapping: false,
            perfect_match_threshold: default_threshold(),
            regex_timeout_ms: default_regex_timeout_ms(),
            log_matches: true,
            log_unmatched: true,
        }
    }
}

impl EngineSettings {
    pub fn regex_timeout(&self) -> Duration {
        Duration::from_millis(self.regex_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.perfect_match_threshold > 0.0 && self.perfect_match_threshold <= 1.0) {
            bail!(
                "perfect_match_threshold must be in (0, 1], got {}",
                self.perfect_match_threshold
            );
        }
        if self.regex_timeout_ms == 0 {
            bail!("regex_timeout_ms must be positive");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    MatchScores::ALMOST_PERFECT
}

fn default_regex_timeout_ms() -> u64 {
    DEFAULT_REGEX_TIMEOUT.as_millis() as u64
}

struct CompileContext<'a> {
    regex_timeout: Duration,
    factories: &'a MatcherFactories,
}

/// A declarative mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDefinition {
    /// Identity; generated when omitted
    #[serde(default)]
    pub guid: Option<Uuid>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Priority (lower = matched first)
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub scenario: Option<ScenarioBinding>,

    #[serde(default)]
    pub time_settings: Option<TimeSettings>,

    /// Selection weight among equally good matches, in [0, 1]
    #[serde(default)]
    pub probability: Option<f64>,

    /// Request predicate
    #[serde(default)]
    pub request: RequestDefinition,

    /// Response to return
    pub response: ResponseDefinition,
}

impl MappingDefinition {
    fn compile(&self, ctx: &CompileContext<'_>) -> anyhow::Result<Mapping> {
        self.response.validate()?;

        let mut builder = Mapping::builder()
            .priority(self.priority)
            .scenario(self.scenario.clone())
            .given(self.request.compile(ctx)?)
            .respond_with(Arc::new(self.response.clone()));

        if let Some(guid) = self.guid {
            builder = builder.guid(guid);
        }
        if let Some(title) = &self.title {
            builder = builder.title(title);
        }
        if let Some(description) = &self.description {
            builder = builder.description(description);
        }
        if let Some(time_settings) = &self.time_settings {
            builder = builder.time_settings(time_settings.clone());
        }
        if let Some(probability) = self.probability {
            builder = builder.probability(probability);
        }

        Ok(builder.build()?)
    }
}

/// Request matching configuration. Omitted facets match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDefinition {
    /// HTTP method(s) to match (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub path: Vec<MatcherDefinition>,

    #[serde(default)]
    pub url: Vec<MatcherDefinition>,

    #[serde(default)]
    pub headers: Vec<NamedMatcherDefinition>,

    #[serde(default)]
    pub cookies: Vec<NamedMatcherDefinition>,

    #[serde(default)]
    pub params: Vec<NamedMatcherDefinition>,

    #[serde(default)]
    pub body: Option<BodyDefinition>,
}

impl RequestDefinition {
    fn compile(&self, ctx: &CompileContext<'_>) -> anyhow::Result<RequestPredicate> {
        let mut predicate = RequestPredicate::new();

        if !self.methods.is_empty() {
            predicate = predicate.with(RequestMatcher::Method(MethodMatcher::new(
                self.methods.iter().cloned(),
            )));
        }
        if !self.path.is_empty() {
            predicate = predicate.with(RequestMatcher::Path(ValueMatcher::new(
                compile_all(&self.path, ctx).context("path")?,
                MatchOperator::Or,
            )));
        }
        if !self.url.is_empty() {
            predicate = predicate.with(RequestMatcher::Url(ValueMatcher::new(
                compile_all(&self.url, ctx).context("url")?,
                MatchOperator::Or,
            )));
        }
        for header in &self.headers {
            predicate = predicate.with(RequestMatcher::Header(
                header.compile(ctx).with_context(|| format!("header {}", header.name))?,
            ));
        }
        for cookie in &self.cookies {
            predicate = predicate.with(RequestMatcher::Cookie(
                cookie.compile(ctx).with_context(|| format!("cookie {}", cookie.name))?,
            ));
        }
        for param in &self.params {
            predicate = predicate.with(RequestMatcher::Param(
                param.compile(ctx).with_context(|| format!("param {}", param.name))?,
            ));
        }
        if let Some(body) = &self.body {
            predicate = predicate.with(RequestMatcher::Body(BodyMatcher::new(
                compile_all(&body.matchers, ctx).context("body")?,
                body.operator,
            )));
        }

        Ok(predicate)
    }
}

/// Matchers for a named facet (header, cookie, query parameter).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamedMatcherDefinition {
    pub name: String,

    /// Case-insensitive name lookup (query parameters)
    #[serde(default)]
    pub ignore_case: bool,

    /// Empty = must be present
    #[serde(default)]
    pub matchers: Vec<MatcherDefinition>,

    #[serde(default)]
    pub operator: MatchOperator,
}

impl NamedMatcherDefinition {
    fn compile(&self, ctx: &CompileContext<'_>) -> anyhow::Result<NamedValueMatcher> {
        Ok(NamedValueMatcher::new(
            self.name.clone(),
            compile_all(&self.matchers, ctx)?,
            self.operator,
        )
        .ignore_case(self.ignore_case))
    }
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BodyDefinition {
    /// Empty = body must be present
    #[serde(default)]
    pub matchers: Vec<MatcherDefinition>,

    #[serde(default)]
    pub operator: MatchOperator,
}

/// Matcher kinds available in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherType {
    Exact,
    Contains,
    Wildcard,
    Regex,
    NotNullOrEmpty,
    Json,
    JsonPartial,
    JsonPath,
    /// Patterns are base64 encoded
    ExactBytes,
    /// Built by a registered factory
    Custom,
}

/// A single primitive matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatcherDefinition {
    #[serde(rename = "type")]
    pub kind: MatcherType,

    /// Factory name for `custom` matchers
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub patterns: Vec<Value>,

    #[serde(default)]
    pub ignore_case: bool,

    #[serde(default)]
    pub behaviour: MatchBehaviour,

    #[serde(default)]
    pub operator: MatchOperator,
}

impl MatcherDefinition {
    fn string_patterns(&self) -> anyhow::Result<Vec<&str>> {
        self.patterns
            .iter()
            .map(|p| {
                p.as_str()
                    .ok_or_else(|| anyhow!("{:?} patterns must be strings, got {}", self.kind, p))
            })
            .collect()
    }

    fn compile(&self, ctx: &CompileContext<'_>) -> anyhow::Result<Matcher> {
        let matcher = match self.kind {
            MatcherType::Exact => Matcher::exact(self.string_patterns()?, self.ignore_case)?,
            MatcherType::Contains => Matcher::contains(self.string_patterns()?, self.ignore_case)?,
            MatcherType::Wildcard => Matcher::wildcard(self.string_patterns()?, self.ignore_case)?,
            MatcherType::Regex => {
                Matcher::regex(self.string_patterns()?, self.ignore_case, ctx.regex_timeout)?
            }
            MatcherType::NotNullOrEmpty => Matcher::not_null_or_empty(),
            MatcherType::Json => Matcher::json(self.patterns.clone(), self.ignore_case)?,
            MatcherType::JsonPartial => {
                Matcher::json_partial(self.patterns.clone(), self.ignore_case)?
            }
            MatcherType::JsonPath => Matcher::json_path(self.string_patterns()?)?,
            MatcherType::ExactBytes => {
                use base64::Engine;
                let patterns = self
                    .string_patterns()?
                    .into_iter()
                    .map(|p| {
                        base64::engine::general_purpose::STANDARD
                            .decode(p)
                            .map_err(|e| anyhow!("Invalid base64: {}", e))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Matcher::exact_bytes(patterns)?
            }
            MatcherType::Custom => {
                let name = self
                    .name
                    .as_deref()
                    .ok_or_else(|| anyhow!("custom matcher needs a name"))?;
                let factory = ctx
                    .factories
                    .get(name)
                    .ok_or_else(|| anyhow!("no matcher factory registered for '{}'", name))?;
                Matcher::custom(factory.create(&self.patterns, self.ignore_case)?)
            }
        };
        Ok(matcher
            .with_behaviour(self.behaviour)
            .with_operator(self.operator))
    }
}

fn compile_all(
    definitions: &[MatcherDefinition],
    ctx: &CompileContext<'_>,
) -> anyhow::Result<Vec<Matcher>> {
    definitions.iter().map(|d| d.compile(ctx)).collect()
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// Plain text response.
    pub fn text(status: u16, content: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Some(ResponseBody::Text {
                content: content.into(),
            }),
        }
    }

    /// JSON response.
    pub fn json(status: u16, content: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Some(ResponseBody::Json { content }),
        }
    }

    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            bail!("Invalid status code: {}", self.status);
        }
        if let Some(body) = &self.body {
            body.to_bytes()?;
        }
        Ok(())
    }
}

impl ResponseProvider for ResponseDefinition {
    fn provide_response(&self, _request: &RequestMessage) -> anyhow::Result<ResponseMessage> {
        let mut headers = self.headers.clone();
        if let Some(body) = &self.body {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("Content-Type".to_string(), body.content_type().to_string());
            }
        }
        let body = match &self.body {
            Some(body) => body.to_bytes()?,
            None => Vec::new(),
        };
        Ok(ResponseMessage {
            status: self.status,
            headers,
            body,
        })
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: Value },
    /// Base64 encoded binary
    Base64 { content: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_vec(content)?),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow!("Invalid base64: {}", e))
            }
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
        }
    }
}
