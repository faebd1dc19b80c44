//! Primitive value matchers.
//!
//! A [`Matcher`] compares one value (text, JSON, or raw bytes) against one or
//! more patterns and produces a score in `[0.0, 1.0]`. Faults such as a regex
//! overrunning its deadline or a malformed JSON input never escape: they are
//! reported in the [`MatcherResult`] and score as a mismatch.

use crate::match_result::MatchScores;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default wall-clock budget for a single regex evaluation.
pub const DEFAULT_REGEX_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the compiled size of a regex program.
const REGEX_SIZE_LIMIT: usize = 10 * (1 << 20);

/// Whether a match is accepted or inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBehaviour {
    #[default]
    AcceptOnMatch,
    RejectOnMatch,
}

impl MatchBehaviour {
    /// Apply the behaviour to an already combined score.
    pub fn apply(self, score: f64) -> f64 {
        match self {
            MatchBehaviour::AcceptOnMatch => score,
            MatchBehaviour::RejectOnMatch => MatchScores::PERFECT - score,
        }
    }
}

/// How several scores are folded into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    /// Best score wins
    #[default]
    Or,
    /// Worst score wins
    And,
    /// Arithmetic mean
    Average,
}

impl MatchOperator {
    /// Combine scores. An empty set is a mismatch.
    pub fn combine(self, scores: impl IntoIterator<Item = f64>) -> f64 {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut max = MatchScores::MISMATCH;
        let mut min = MatchScores::PERFECT;
        for score in scores {
            let score = MatchScores::clamp(score);
            count += 1;
            sum += score;
            max = max.max(score);
            min = min.min(score);
        }
        if count == 0 {
            return MatchScores::MISMATCH;
        }
        match self {
            MatchOperator::Or => max,
            MatchOperator::And => min,
            MatchOperator::Average => sum / count as f64,
        }
    }
}

/// Fault captured while evaluating a matcher.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchError {
    #[error("regex `{pattern}` exceeded its {timeout_ms} ms budget")]
    RegexTimeout { pattern: String, timeout_ms: u64 },

    #[error("input is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("matcher `{matcher}` failed: {message}")]
    Custom { matcher: String, message: String },
}

/// Error raised while building a matcher.
#[derive(Debug, Error)]
pub enum MatcherBuildError {
    #[error("{matcher} matcher needs at least one pattern")]
    NoPatterns { matcher: &'static str },

    #[error("invalid regex `{pattern}`: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid wildcard `{pattern}`: {source}")]
    InvalidWildcard {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("invalid JSON path `{path}`: {message}")]
    InvalidJsonPath { path: String, message: String },
}

/// Value handed to a matcher.
#[derive(Debug, Clone, Copy)]
pub enum MatchInput<'a> {
    Text(&'a str),
    Json(&'a Value),
    Bytes(&'a [u8]),
}

/// The view of a value a matcher kind works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Text,
    Json,
    Bytes,
}

/// Outcome of a single matcher evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct MatcherResult {
    pub score: f64,
    pub error: Option<MatchError>,
}

impl MatcherResult {
    pub fn score(score: f64) -> Self {
        Self {
            score: MatchScores::clamp(score),
            error: None,
        }
    }

    pub fn mismatch() -> Self {
        Self::score(MatchScores::MISMATCH)
    }

    /// A fault always scores as a mismatch.
    pub fn fault(error: MatchError) -> Self {
        Self {
            score: MatchScores::MISMATCH,
            error: Some(error),
        }
    }

    pub fn is_perfect(&self) -> bool {
        self.score >= MatchScores::ALMOST_PERFECT
    }
}

/// Matcher supplied from outside the crate (e.g. a GraphQL or ProtoBuf body matcher).
pub trait CustomMatcher: Send + Sync + fmt::Debug {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Which view of the value this matcher wants.
    fn input_kind(&self) -> InputKind {
        InputKind::Text
    }

    /// Raw score before behaviour is applied.
    fn is_match(&self, input: &MatchInput<'_>) -> MatcherResult;
}

/// Builds custom matchers from declarative patterns.
pub trait CustomMatcherFactory: Send + Sync {
    fn create(&self, patterns: &[Value], ignore_case: bool)
        -> anyhow::Result<Arc<dyn CustomMatcher>>;
}

/// Custom matcher factories, keyed by name.
///
/// Factories are registered explicitly by the embedding application.
#[derive(Clone, Default)]
pub struct MatcherFactories {
    factories: HashMap<String, Arc<dyn CustomMatcherFactory>>,
}

impl MatcherFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(
        mut self,
        name: impl Into<String>,
        factory: Arc<dyn CustomMatcherFactory>,
    ) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomMatcherFactory>> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for MatcherFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

#[derive(Debug, Clone)]
enum MatcherKind {
    Exact { patterns: Vec<String>, ignore_case: bool },
    Contains { patterns: Vec<String>, ignore_case: bool },
    Wildcard(Vec<globset::GlobMatcher>),
    Regex { patterns: Vec<Regex>, timeout: Duration },
    NotNullOrEmpty,
    Json { patterns: Vec<Value>, ignore_case: bool, partial: bool },
    JsonPath(Vec<jsonpath_rust::JsonPath>),
    ExactBytes(Vec<Vec<u8>>),
    Custom(Arc<dyn CustomMatcher>),
}

/// A compiled primitive matcher.
#[derive(Debug, Clone)]
pub struct Matcher {
    kind: MatcherKind,
    behaviour: MatchBehaviour,
    operator: MatchOperator,
}

fn require_patterns<T>(matcher: &'static str, patterns: &[T]) -> Result<(), MatcherBuildError> {
    if patterns.is_empty() {
        Err(MatcherBuildError::NoPatterns { matcher })
    } else {
        Ok(())
    }
}

fn fold_case(value: &str, ignore_case: bool) -> Cow<'_, str> {
    if ignore_case {
        Cow::Owned(value.to_lowercase())
    } else {
        Cow::Borrowed(value)
    }
}

impl Matcher {
    fn from_kind(kind: MatcherKind) -> Self {
        Self {
            kind,
            behaviour: MatchBehaviour::default(),
            operator: MatchOperator::default(),
        }
    }

    /// String equality.
    pub fn exact<I, S>(patterns: I, ignore_case: bool) -> Result<Self, MatcherBuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| {
                let p: String = p.into();
                fold_case(&p, ignore_case).into_owned()
            })
            .collect();
        require_patterns("exact", &patterns)?;
        Ok(Self::from_kind(MatcherKind::Exact {
            patterns,
            ignore_case,
        }))
    }

    /// Substring containment.
    pub fn contains<I, S>(patterns: I, ignore_case: bool) -> Result<Self, MatcherBuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| {
                let p: String = p.into();
                fold_case(&p, ignore_case).into_owned()
            })
            .collect();
        require_patterns("contains", &patterns)?;
        Ok(Self::from_kind(MatcherKind::Contains {
            patterns,
            ignore_case,
        }))
    }

    /// `*` / `?` wildcard, anchored at both ends.
    pub fn wildcard<I, S>(patterns: I, ignore_case: bool) -> Result<Self, MatcherBuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let globs = patterns
            .into_iter()
            .map(|p| {
                let pattern = p.as_ref();
                globset::GlobBuilder::new(pattern)
                    .case_insensitive(ignore_case)
                    .literal_separator(false)
                    .build()
                    .map(|g| g.compile_matcher())
                    .map_err(|source| MatcherBuildError::InvalidWildcard {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        require_patterns("wildcard", &globs)?;
        Ok(Self::from_kind(MatcherKind::Wildcard(globs)))
    }

    /// Regular expression with a per-evaluation time budget.
    pub fn regex<I, S>(
        patterns: I,
        ignore_case: bool,
        timeout: Duration,
    ) -> Result<Self, MatcherBuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let regexes = patterns
            .into_iter()
            .map(|p| {
                let pattern = p.as_ref();
                RegexBuilder::new(pattern)
                    .case_insensitive(ignore_case)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|source| MatcherBuildError::InvalidRegex {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        require_patterns("regex", &regexes)?;
        Ok(Self::from_kind(MatcherKind::Regex {
            patterns: regexes,
            timeout,
        }))
    }

    /// Value must be present and non-empty.
    pub fn not_null_or_empty() -> Self {
        Self::from_kind(MatcherKind::NotNullOrEmpty)
    }

    /// JSON deep equality.
    pub fn json(patterns: Vec<Value>, ignore_case: bool) -> Result<Self, MatcherBuildError> {
        require_patterns("json", &patterns)?;
        Ok(Self::from_kind(MatcherKind::Json {
            patterns,
            ignore_case,
            partial: false,
        }))
    }

    /// JSON subset containment: every member of the pattern must be present in the input.
    pub fn json_partial(
        patterns: Vec<Value>,
        ignore_case: bool,
    ) -> Result<Self, MatcherBuildError> {
        require_patterns("json_partial", &patterns)?;
        Ok(Self::from_kind(MatcherKind::Json {
            patterns,
            ignore_case,
            partial: true,
        }))
    }

    /// JSON path expression that must select at least one node.
    pub fn json_path<I, S>(patterns: I) -> Result<Self, MatcherBuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = patterns
            .into_iter()
            .map(|p| {
                let path: String = p.into();
                compile_json_path(&path)
                    .map_err(|message| MatcherBuildError::InvalidJsonPath { path, message })
            })
            .collect::<Result<Vec<_>, _>>()?;
        require_patterns("json_path", &paths)?;
        Ok(Self::from_kind(MatcherKind::JsonPath(paths)))
    }

    /// Raw byte equality.
    pub fn exact_bytes(patterns: Vec<Vec<u8>>) -> Result<Self, MatcherBuildError> {
        require_patterns("exact_bytes", &patterns)?;
        Ok(Self::from_kind(MatcherKind::ExactBytes(patterns)))
    }

    /// Wrap an injected matcher.
    pub fn custom(matcher: Arc<dyn CustomMatcher>) -> Self {
        Self::from_kind(MatcherKind::Custom(matcher))
    }

    pub fn with_behaviour(mut self, behaviour: MatchBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn with_operator(mut self, operator: MatchOperator) -> Self {
        self.operator = operator;
        self
    }

    /// Shorthand for `with_behaviour(MatchBehaviour::RejectOnMatch)`.
    pub fn reject_on_match(self) -> Self {
        self.with_behaviour(MatchBehaviour::RejectOnMatch)
    }

    pub fn behaviour(&self) -> MatchBehaviour {
        self.behaviour
    }

    pub fn operator(&self) -> MatchOperator {
        self.operator
    }

    /// Kind name used in diagnostics.
    pub fn name(&self) -> &str {
        match &self.kind {
            MatcherKind::Exact { .. } => "ExactMatcher",
            MatcherKind::Contains { .. } => "ContainsMatcher",
            MatcherKind::Wildcard(_) => "WildcardMatcher",
            MatcherKind::Regex { .. } => "RegexMatcher",
            MatcherKind::NotNullOrEmpty => "NotNullOrEmptyMatcher",
            MatcherKind::Json { partial: false, .. } => "JsonMatcher",
            MatcherKind::Json { partial: true, .. } => "JsonPartialMatcher",
            MatcherKind::JsonPath(_) => "JsonPathMatcher",
            MatcherKind::ExactBytes(_) => "ExactBytesMatcher",
            MatcherKind::Custom(custom) => custom.name(),
        }
    }

    /// The view of a value this matcher works on.
    pub fn input_kind(&self) -> InputKind {
        match &self.kind {
            MatcherKind::Json { .. } | MatcherKind::JsonPath(_) => InputKind::Json,
            MatcherKind::ExactBytes(_) => InputKind::Bytes,
            MatcherKind::Custom(custom) => custom.input_kind(),
            _ => InputKind::Text,
        }
    }

    /// Score `input` against every pattern, combine, then apply the behaviour.
    pub fn is_match(&self, input: &MatchInput<'_>) -> MatcherResult {
        let raw = match self.pattern_scores(input) {
            Ok(scores) => self.operator.combine(scores),
            Err(error) => return MatcherResult::fault(error),
        };
        MatcherResult::score(self.behaviour.apply(raw))
    }

    /// Convenience for text values.
    pub fn is_match_str(&self, value: &str) -> MatcherResult {
        self.is_match(&MatchInput::Text(value))
    }

    fn pattern_scores(&self, input: &MatchInput<'_>) -> Result<Vec<f64>, MatchError> {
        match &self.kind {
            MatcherKind::Exact {
                patterns,
                ignore_case,
            } => Ok(match text_of(input) {
                Some(value) => {
                    let value = fold_case(&value, *ignore_case).into_owned();
                    patterns
                        .iter()
                        .map(|p| MatchScores::to_score(*p == value))
                        .collect()
                }
                None => vec![MatchScores::MISMATCH],
            }),
            MatcherKind::Contains {
                patterns,
                ignore_case,
            } => Ok(match text_of(input) {
                Some(value) => {
                    let value = fold_case(&value, *ignore_case).into_owned();
                    patterns
                        .iter()
                        .map(|p| MatchScores::to_score(value.contains(p.as_str())))
                        .collect()
                }
                None => vec![MatchScores::MISMATCH],
            }),
            MatcherKind::Wildcard(globs) => Ok(match text_of(input) {
                Some(value) => globs
                    .iter()
                    .map(|g| MatchScores::to_score(g.is_match(&*value)))
                    .collect(),
                None => vec![MatchScores::MISMATCH],
            }),
            MatcherKind::Regex { patterns, timeout } => match text_of(input) {
                Some(value) => patterns
                    .iter()
                    .map(|regex| timed_regex_match(regex, &value, *timeout))
                    .collect(),
                None => Ok(vec![MatchScores::MISMATCH]),
            },
            MatcherKind::NotNullOrEmpty => {
                let present = match input {
                    MatchInput::Text(s) => !s.is_empty(),
                    MatchInput::Json(Value::Null) => false,
                    MatchInput::Json(Value::String(s)) => !s.is_empty(),
                    MatchInput::Json(_) => true,
                    MatchInput::Bytes(b) => !b.is_empty(),
                };
                Ok(vec![MatchScores::to_score(present)])
            }
            MatcherKind::Json {
                patterns,
                ignore_case,
                partial,
            } => {
                let actual = json_of(input)?;
                Ok(patterns
                    .iter()
                    .map(|expected| {
                        MatchScores::to_score(json_matches(
                            expected,
                            &actual,
                            *partial,
                            *ignore_case,
                        ))
                    })
                    .collect())
            }
            MatcherKind::JsonPath(paths) => {
                let actual = json_of(input)?;
                Ok(paths
                    .iter()
                    .map(|path| {
                        let found = match path.find(&actual) {
                            Value::Null => false,
                            Value::Array(items) => !items.is_empty(),
                            _ => true,
                        };
                        MatchScores::to_score(found)
                    })
                    .collect())
            }
            MatcherKind::ExactBytes(patterns) => {
                let actual = bytes_of(input);
                Ok(patterns
                    .iter()
                    .map(|p| MatchScores::to_score(p.as_slice() == actual.as_ref()))
                    .collect())
            }
            MatcherKind::Custom(custom) => {
                let result = custom.is_match(input);
                match result.error {
                    Some(error) => Err(error),
                    None => Ok(vec![result.score]),
                }
            }
        }
    }
}

/// The `regex` crate matches in linear time and cannot be interrupted, so the
/// budget is checked once the match returns rather than cutting it short.
fn timed_regex_match(regex: &Regex, value: &str, timeout: Duration) -> Result<f64, MatchError> {
    let started = Instant::now();
    let matched = regex.is_match(value);
    if started.elapsed() >= timeout {
        return Err(MatchError::RegexTimeout {
            pattern: regex.as_str().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        });
    }
    Ok(MatchScores::to_score(matched))
}

fn compile_json_path(expr: &str) -> Result<jsonpath_rust::JsonPath, String> {
    jsonpath_rust::JsonPath::try_from(expr).map_err(|e| e.to_string())
}

fn text_of<'a>(input: &MatchInput<'a>) -> Option<Cow<'a, str>> {
    match *input {
        MatchInput::Text(s) => Some(Cow::Borrowed(s)),
        MatchInput::Json(Value::String(s)) => Some(Cow::Borrowed(s.as_str())),
        MatchInput::Json(value) => Some(Cow::Owned(value.to_string())),
        MatchInput::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
    }
}

fn json_of<'a>(input: &MatchInput<'a>) -> Result<Cow<'a, Value>, MatchError> {
    let parse = |text: &str| {
        serde_json::from_str::<Value>(text)
            .map(Cow::Owned)
            .map_err(|e| MatchError::InvalidJson {
                message: e.to_string(),
            })
    };
    match *input {
        MatchInput::Json(value) => Ok(Cow::Borrowed(value)),
        MatchInput::Text(s) => parse(s),
        MatchInput::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => parse(s),
            Err(e) => Err(MatchError::InvalidJson {
                message: e.to_string(),
            }),
        },
    }
}

fn bytes_of<'a>(input: &MatchInput<'a>) -> Cow<'a, [u8]> {
    match *input {
        MatchInput::Bytes(b) => Cow::Borrowed(b),
        MatchInput::Text(s) => Cow::Borrowed(s.as_bytes()),
        MatchInput::Json(value) => Cow::Owned(value.to_string().into_bytes()),
    }
}

/// Structural comparison. With `partial`, objects may carry extra members and
/// every expected array element must appear somewhere in the actual array.
fn json_matches(expected: &Value, actual: &Value, partial: bool, ignore_case: bool) -> bool {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            if !partial && exp.len() != act.len() {
                return false;
            }
            exp.iter().all(|(key, ev)| {
                act.get(key)
                    .is_some_and(|av| json_matches(ev, av, partial, ignore_case))
            })
        }
        (Value::Array(exp), Value::Array(act)) => {
            if partial {
                exp.iter().all(|ev| {
                    act.iter()
                        .any(|av| json_matches(ev, av, partial, ignore_case))
                })
            } else {
                exp.len() == act.len()
                    && exp
                        .iter()
                        .zip(act)
                        .all(|(ev, av)| json_matches(ev, av, partial, ignore_case))
            }
        }
        (Value::String(e), Value::String(a)) => {
            if ignore_case {
                e.to_lowercase() == a.to_lowercase()
            } else {
                e == a
            }
        }
        (Value::Number(e), Value::Number(a)) => e.as_f64() == a.as_f64(),
        _ => expected == actual,
    }
}
