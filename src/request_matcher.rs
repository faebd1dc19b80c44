//! Facet matchers and the request predicate.
//!
//! Each facet matcher applies primitive [`Matcher`]s to one part of a request
//! and records a single [`MatchDetail`](crate::match_result::MatchDetail).
//! A facet without a constraint is simply not present in the predicate, so it
//! never lowers the score. A constraint whose facet is missing from the
//! request (no such header, no body, ...) scores a mismatch.

use crate::match_result::{MatchScores, RequestMatchResult};
use crate::matcher::{InputKind, MatchError, MatchInput, MatchOperator, Matcher, MatcherResult};
use crate::request::{BodyData, DetectedBodyType, RequestMessage};

/// Request methods (case-insensitive). Any listed method matches.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<String>,
}

impl MethodMatcher {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    fn evaluate(&self, request: &RequestMessage) -> MatcherResult {
        let matched = self
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(request.method()));
        MatcherResult::score(MatchScores::to_score(matched))
    }
}

/// Matchers applied to a single-valued request facet (path or absolute URL).
///
/// Path and URL are always present, so no matchers means any value.
#[derive(Debug, Clone)]
pub struct ValueMatcher {
    matchers: Vec<Matcher>,
    operator: MatchOperator,
}

impl ValueMatcher {
    pub fn new(matchers: Vec<Matcher>, operator: MatchOperator) -> Self {
        Self { matchers, operator }
    }

    fn evaluate(&self, value: &str) -> MatcherResult {
        if self.matchers.is_empty() {
            return MatcherResult::score(MatchScores::PERFECT);
        }
        score_matchers(&self.matchers, self.operator, |matcher| {
            matcher.is_match_str(value)
        })
    }
}

/// Matchers applied to a named, possibly multi-valued facet (header, cookie, query parameter).
///
/// With no matchers the facet only has to be present.
#[derive(Debug, Clone)]
pub struct NamedValueMatcher {
    name: String,
    ignore_case: bool,
    matchers: Vec<Matcher>,
    operator: MatchOperator,
}

impl NamedValueMatcher {
    pub fn new(name: impl Into<String>, matchers: Vec<Matcher>, operator: MatchOperator) -> Self {
        Self {
            name: name.into(),
            ignore_case: false,
            matchers,
            operator,
        }
    }

    /// Look the name up case-insensitively (query parameters only; headers always are).
    pub fn ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn evaluate<'a, I>(&self, values: Option<I>) -> MatcherResult
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Some(values) = values else {
            return MatcherResult::mismatch();
        };
        if self.matchers.is_empty() {
            return MatcherResult::score(MatchScores::PERFECT);
        }
        let values: Vec<&str> = values.into_iter().collect();
        score_matchers(&self.matchers, self.operator, |matcher| {
            best_of(values.iter().map(|v| matcher.is_match(&MatchInput::Text(*v))))
        })
    }
}

/// Matchers applied to the request body according to its detected type.
///
/// With no matchers the body only has to be non-empty.
#[derive(Debug, Clone)]
pub struct BodyMatcher {
    matchers: Vec<Matcher>,
    operator: MatchOperator,
}

impl BodyMatcher {
    pub fn new(matchers: Vec<Matcher>, operator: MatchOperator) -> Self {
        Self { matchers, operator }
    }

    fn evaluate(&self, body: &BodyData) -> MatcherResult {
        if body.is_empty() {
            return MatcherResult::mismatch();
        }
        if self.matchers.is_empty() {
            return MatcherResult::score(MatchScores::PERFECT);
        }
        score_matchers(&self.matchers, self.operator, |matcher| {
            match body_input(matcher.input_kind(), body) {
                Some(input) => matcher.is_match(&input),
                None => MatcherResult::mismatch(),
            }
        })
    }
}

/// Pick the view of the body a matcher kind can use, if any.
fn body_input(kind: InputKind, body: &BodyData) -> Option<MatchInput<'_>> {
    match kind {
        InputKind::Bytes => Some(MatchInput::Bytes(body.as_bytes())),
        InputKind::Text => match body.detected_type() {
            DetectedBodyType::Bytes | DetectedBodyType::None => None,
            _ => body.as_text().map(MatchInput::Text),
        },
        InputKind::Json => match body.detected_type() {
            DetectedBodyType::Json | DetectedBodyType::FormUrlEncoded => {
                body.as_json().map(MatchInput::Json)
            }
            DetectedBodyType::String => body.as_text().map(MatchInput::Text),
            _ => None,
        },
    }
}

/// Nested facet matchers folded with one operator.
#[derive(Debug, Clone)]
pub struct CompositeMatcher {
    matchers: Vec<RequestMatcher>,
    operator: MatchOperator,
}

impl CompositeMatcher {
    pub fn new(matchers: Vec<RequestMatcher>, operator: MatchOperator) -> Self {
        Self { matchers, operator }
    }

    fn evaluate(&self, request: &RequestMessage) -> MatcherResult {
        if self.matchers.is_empty() {
            return MatcherResult::score(MatchScores::PERFECT);
        }
        score_matchers(&self.matchers, self.operator, |matcher| {
            matcher.evaluate(request)
        })
    }
}

/// One facet constraint of a request predicate.
#[derive(Debug, Clone)]
pub enum RequestMatcher {
    Method(MethodMatcher),
    Path(ValueMatcher),
    Url(ValueMatcher),
    Header(NamedValueMatcher),
    Cookie(NamedValueMatcher),
    Param(NamedValueMatcher),
    Body(BodyMatcher),
    Composite(CompositeMatcher),
}

impl RequestMatcher {
    /// Name recorded in match details.
    pub fn name(&self) -> &'static str {
        match self {
            RequestMatcher::Method(_) => "MethodMatcher",
            RequestMatcher::Path(_) => "PathMatcher",
            RequestMatcher::Url(_) => "UrlMatcher",
            RequestMatcher::Header(_) => "HeaderMatcher",
            RequestMatcher::Cookie(_) => "CookieMatcher",
            RequestMatcher::Param(_) => "ParamMatcher",
            RequestMatcher::Body(_) => "BodyMatcher",
            RequestMatcher::Composite(_) => "CompositeMatcher",
        }
    }

    /// Score this facet and append the detail to `result`.
    pub fn get_matching_score(
        &self,
        request: &RequestMessage,
        result: &mut RequestMatchResult,
    ) -> f64 {
        let outcome = self.evaluate(request);
        result.add_score(self.name(), outcome.score, outcome.error)
    }

    fn evaluate(&self, request: &RequestMessage) -> MatcherResult {
        match self {
            RequestMatcher::Method(m) => m.evaluate(request),
            RequestMatcher::Path(m) => m.evaluate(request.path()),
            RequestMatcher::Url(m) => m.evaluate(request.url()),
            RequestMatcher::Header(m) => m.evaluate(
                request
                    .headers()
                    .get_all(&m.name)
                    .map(|values| values.iter().map(String::as_str)),
            ),
            RequestMatcher::Cookie(m) => m.evaluate(
                request
                    .cookies()
                    .get(&m.name)
                    .map(|value| std::iter::once(value.as_str())),
            ),
            RequestMatcher::Param(m) => {
                let values = if m.ignore_case {
                    request
                        .query()
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(&m.name))
                        .map(|(_, values)| values)
                } else {
                    request.query().get(&m.name)
                };
                m.evaluate(values.map(|values| values.iter().map(String::as_str)))
            }
            RequestMatcher::Body(m) => m.evaluate(request.body()),
            RequestMatcher::Composite(m) => m.evaluate(request),
        }
    }
}

/// Evaluate every matcher and fold the scores with `operator`.
///
/// The first fault is only kept when the folded score is a mismatch.
fn score_matchers<T, F>(matchers: &[T], operator: MatchOperator, mut eval: F) -> MatcherResult
where
    F: FnMut(&T) -> MatcherResult,
{
    let mut error: Option<MatchError> = None;
    let mut scores = Vec::with_capacity(matchers.len());
    for matcher in matchers {
        let result = eval(matcher);
        if error.is_none() {
            error = result.error;
        }
        scores.push(result.score);
    }
    let score = operator.combine(scores);
    MatcherResult {
        score,
        error: error.filter(|_| score <= MatchScores::MISMATCH),
    }
}

/// Best result over several values of the same facet. Faults of values that
/// lost are only reported when nothing matched.
fn best_of(results: impl Iterator<Item = MatcherResult>) -> MatcherResult {
    let mut best = MatcherResult::mismatch();
    let mut error = None;
    for result in results {
        if error.is_none() {
            error = result.error.clone();
        }
        if result.score > best.score {
            best = result;
        }
    }
    if best.score <= MatchScores::MISMATCH && best.error.is_none() {
        best.error = error;
    }
    best
}

/// The full request constraint of a mapping: every facet must match.
#[derive(Debug, Clone, Default)]
pub struct RequestPredicate {
    matchers: Vec<RequestMatcher>,
}

impl RequestPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matchers(&self) -> &[RequestMatcher] {
        &self.matchers
    }

    /// Add any facet matcher.
    pub fn with(mut self, matcher: RequestMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn using_method(self, method: impl Into<String>) -> Self {
        self.using_methods([method.into()])
    }

    pub fn using_methods<I, S>(self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(RequestMatcher::Method(MethodMatcher::new(methods)))
    }

    pub fn with_path(self, matcher: Matcher) -> Self {
        self.with_path_matchers(vec![matcher], MatchOperator::Or)
    }

    pub fn with_path_matchers(self, matchers: Vec<Matcher>, operator: MatchOperator) -> Self {
        self.with(RequestMatcher::Path(ValueMatcher::new(matchers, operator)))
    }

    pub fn with_url(self, matcher: Matcher) -> Self {
        self.with(RequestMatcher::Url(ValueMatcher::new(
            vec![matcher],
            MatchOperator::Or,
        )))
    }

    pub fn with_header(self, name: impl Into<String>, matcher: Matcher) -> Self {
        self.with_header_matchers(name, vec![matcher], MatchOperator::Or)
    }

    /// Header must be present, any value.
    pub fn with_header_present(self, name: impl Into<String>) -> Self {
        self.with_header_matchers(name, Vec::new(), MatchOperator::Or)
    }

    pub fn with_header_matchers(
        self,
        name: impl Into<String>,
        matchers: Vec<Matcher>,
        operator: MatchOperator,
    ) -> Self {
        self.with(RequestMatcher::Header(NamedValueMatcher::new(
            name, matchers, operator,
        )))
    }

    pub fn with_cookie(self, name: impl Into<String>, matcher: Matcher) -> Self {
        self.with(RequestMatcher::Cookie(NamedValueMatcher::new(
            name,
            vec![matcher],
            MatchOperator::Or,
        )))
    }

    pub fn with_param(self, key: impl Into<String>, matcher: Matcher) -> Self {
        self.with(RequestMatcher::Param(NamedValueMatcher::new(
            key,
            vec![matcher],
            MatchOperator::Or,
        )))
    }

    /// Query parameter must be present, any value.
    pub fn with_param_present(self, key: impl Into<String>) -> Self {
        self.with(RequestMatcher::Param(NamedValueMatcher::new(
            key,
            Vec::new(),
            MatchOperator::Or,
        )))
    }

    pub fn with_body(self, matcher: Matcher) -> Self {
        self.with_body_matchers(vec![matcher], MatchOperator::Or)
    }

    pub fn with_body_matchers(self, matchers: Vec<Matcher>, operator: MatchOperator) -> Self {
        self.with(RequestMatcher::Body(BodyMatcher::new(matchers, operator)))
    }

    /// Score `request`. A predicate without any facet accepts every request.
    pub fn get_matching_result(
        &self,
        request: &RequestMessage,
        threshold: f64,
    ) -> RequestMatchResult {
        let mut result = RequestMatchResult::with_threshold(threshold);
        if self.matchers.is_empty() {
            result.add_score("AnyRequest", MatchScores::PERFECT, None);
            return result;
        }
        for matcher in &self.matchers {
            matcher.get_matching_score(request, &mut result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::DEFAULT_REGEX_TIMEOUT;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn score(predicate: &RequestPredicate, request: &RequestMessage) -> RequestMatchResult {
        predicate.get_matching_result(request, MatchScores::ALMOST_PERFECT)
    }

    #[test]
    fn test_empty_predicate_accepts_everything() {
        let result = score(&RequestPredicate::new(), &RequestMessage::new("PATCH", "/x"));
        assert!(result.is_perfect_match());
        assert_eq!(result.match_details[0].matcher_type, "AnyRequest");
    }

    #[test]
    fn test_method_and_path() {
        let predicate = RequestPredicate::new()
            .using_methods(["GET", "HEAD"])
            .with_path(Matcher::exact(["/foo"], false).unwrap());

        assert!(score(&predicate, &RequestMessage::new("get", "/foo")).is_perfect_match());

        let result = score(&predicate, &RequestMessage::new("POST", "/foo"));
        assert_eq!(result.average_total_score(), 0.5);
        assert_eq!(result.match_details.len(), 2);
    }

    #[test]
    fn test_url_matcher_sees_absolute_url() {
        let predicate = RequestPredicate::new()
            .with_url(Matcher::wildcard(["http://localhost/api/*"], false).unwrap());
        assert!(score(&predicate, &RequestMessage::new("GET", "/api/x?y=1")).is_perfect_match());
    }

    #[test]
    fn test_missing_header_is_mismatch() {
        let predicate = RequestPredicate::new().with_header(
            "Authorization",
            Matcher::regex(["^Bearer .+$"], false, DEFAULT_REGEX_TIMEOUT).unwrap(),
        );
        let result = score(&predicate, &RequestMessage::new("GET", "/"));
        assert_eq!(result.average_total_score(), 0.0);

        let result = score(
            &predicate,
            &RequestMessage::new("GET", "/").with_header("authorization", "Bearer t"),
        );
        assert!(result.is_perfect_match());
    }

    #[test]
    fn test_missing_header_with_reject_matcher_is_still_mismatch() {
        let predicate = RequestPredicate::new().with_header(
            "X-Debug",
            Matcher::exact(["1"], false).unwrap().reject_on_match(),
        );
        assert_eq!(
            score(&predicate, &RequestMessage::new("GET", "/")).average_total_score(),
            0.0
        );
        assert!(score(
            &predicate,
            &RequestMessage::new("GET", "/").with_header("X-Debug", "0")
        )
        .is_perfect_match());
    }

    #[test]
    fn test_multi_valued_header_uses_best_value() {
        let predicate = RequestPredicate::new()
            .with_header("Accept", Matcher::exact(["application/json"], false).unwrap());
        let request = RequestMessage::new("GET", "/")
            .with_header("Accept", "text/html")
            .with_header("Accept", "application/json");
        assert!(score(&predicate, &request).is_perfect_match());
    }

    #[test]
    fn test_header_operator_across_matchers() {
        let predicate = RequestPredicate::new().with_header_matchers(
            "User-Agent",
            vec![
                Matcher::contains(["curl"], false).unwrap(),
                Matcher::contains(["linux"], true).unwrap(),
            ],
            MatchOperator::Average,
        );
        let request = RequestMessage::new("GET", "/").with_header("User-Agent", "curl/8.0");
        assert_eq!(score(&predicate, &request).average_total_score(), 0.5);
    }

    #[test]
    fn test_header_presence() {
        let predicate = RequestPredicate::new().with_header_present("X-Request-Id");
        assert!(!score(&predicate, &RequestMessage::new("GET", "/")).is_perfect_match());
        assert!(score(
            &predicate,
            &RequestMessage::new("GET", "/").with_header("x-request-id", "")
        )
        .is_perfect_match());
    }

    #[test]
    fn test_cookie_matching() {
        let predicate =
            RequestPredicate::new().with_cookie("session", Matcher::exact(["abc"], false).unwrap());
        let request = RequestMessage::new("GET", "/").with_header("Cookie", "session=abc");
        assert!(score(&predicate, &request).is_perfect_match());
        assert!(!score(&predicate, &RequestMessage::new("GET", "/")).is_perfect_match());
    }

    #[test]
    fn test_param_matching() {
        let predicate =
            RequestPredicate::new().with_param("page", Matcher::exact(["1"], false).unwrap());
        assert!(score(&predicate, &RequestMessage::new("GET", "/?page=2&page=1")).is_perfect_match());
        assert!(!score(&predicate, &RequestMessage::new("GET", "/?page=2")).is_perfect_match());

        let present = RequestPredicate::new().with_param_present("debug");
        assert!(score(&present, &RequestMessage::new("GET", "/?debug")).is_perfect_match());
    }

    #[test]
    fn test_param_ignore_case_key() {
        let predicate = RequestPredicate::new().with(RequestMatcher::Param(
            NamedValueMatcher::new("Page", vec![], MatchOperator::Or).ignore_case(true),
        ));
        assert!(score(&predicate, &RequestMessage::new("GET", "/?page=1")).is_perfect_match());
    }

    #[test]
    fn test_body_constraint_without_body_is_mismatch() {
        let predicate = RequestPredicate::new()
            .with_body(Matcher::json_partial(vec![json!({"a": 1})], false).unwrap());
        let result = score(&predicate, &RequestMessage::new("POST", "/"));
        assert_eq!(result.average_total_score(), 0.0);
    }

    #[test]
    fn test_body_without_constraint_is_neutral() {
        let predicate = RequestPredicate::new().using_method("POST");
        let request = RequestMessage::new("POST", "/").with_body(r#"{"a": 1}"#);
        assert!(score(&predicate, &request).is_perfect_match());
    }

    #[test]
    fn test_body_json_and_text_views() {
        let request = RequestMessage::new("POST", "/").with_body(r#"{"a": 1, "b": "x"}"#);

        let json = RequestPredicate::new()
            .with_body(Matcher::json_partial(vec![json!({"b": "x"})], false).unwrap());
        assert!(score(&json, &request).is_perfect_match());

        let text = RequestPredicate::new().with_body(Matcher::contains([r#""b""#], false).unwrap());
        assert!(score(&text, &request).is_perfect_match());
    }

    #[test]
    fn test_body_form_fields_as_json() {
        let request = RequestMessage::new("POST", "/")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("user=john&role=admin");
        let predicate = RequestPredicate::new()
            .with_body(Matcher::json_partial(vec![json!({"role": "admin"})], false).unwrap());
        assert!(score(&predicate, &request).is_perfect_match());
    }

    #[test]
    fn test_body_inapplicable_matcher_is_mismatch() {
        let request = RequestMessage::new("POST", "/").with_body(vec![0xff, 0xfe, 0x00]);
        let predicate =
            RequestPredicate::new().with_body(Matcher::json(vec![json!({})], false).unwrap());
        let result = score(&predicate, &request);
        assert_eq!(result.average_total_score(), 0.0);
        assert!(!result.has_errors());

        let bytes = RequestPredicate::new()
            .with_body(Matcher::exact_bytes(vec![vec![0xff, 0xfe, 0x00]]).unwrap());
        assert!(score(&bytes, &request).is_perfect_match());
    }

    #[test]
    fn test_body_malformed_json_records_fault() {
        let request = RequestMessage::new("POST", "/")
            .with_header("Content-Type", "application/json")
            .with_body("{broken");
        let predicate =
            RequestPredicate::new().with_body(Matcher::json(vec![json!({"a": 1})], false).unwrap());
        let result = score(&predicate, &request);
        assert_eq!(result.average_total_score(), 0.0);
        assert!(result.has_errors());
    }

    #[test]
    fn test_fault_in_one_facet_does_not_stop_others() {
        let predicate = RequestPredicate::new()
            .with_header("X-Token", Matcher::regex(["t+"], false, Duration::ZERO).unwrap())
            .with_path(Matcher::exact(["/ok"], false).unwrap());
        let request = RequestMessage::new("GET", "/ok").with_header("X-Token", "ttt");
        let result = score(&predicate, &request);
        assert_eq!(result.match_details.len(), 2);
        assert!(matches!(
            result.match_details[0].error,
            Some(MatchError::RegexTimeout { .. })
        ));
        assert_eq!(result.match_details[1].score, 1.0);
        assert_eq!(result.average_total_score(), 0.5);
    }

    #[test]
    fn test_fault_of_losing_matcher_is_not_reported() {
        let predicate = RequestPredicate::new().with_header_matchers(
            "X-Token",
            vec![
                Matcher::regex(["t+"], false, Duration::ZERO).unwrap(),
                Matcher::exact(["ttt"], false).unwrap(),
            ],
            MatchOperator::Or,
        );
        let request = RequestMessage::new("GET", "/").with_header("X-Token", "ttt");
        let result = score(&predicate, &request);
        assert!(result.is_perfect_match());
        assert!(!result.has_errors());

        // Nothing matched: the fault explains why.
        let request = RequestMessage::new("GET", "/").with_header("X-Token", "other");
        let result = score(&predicate, &request);
        assert_eq!(result.average_total_score(), 0.0);
        assert!(result.has_errors());
    }

    #[test]
    fn test_empty_body_matchers_require_a_body() {
        let predicate = RequestPredicate::new().with_body_matchers(vec![], MatchOperator::Or);
        let with_body = RequestMessage::new("POST", "/").with_body("anything");
        assert!(score(&predicate, &with_body).is_perfect_match());
        assert_eq!(
            score(&predicate, &RequestMessage::new("POST", "/")).average_total_score(),
            0.0
        );
    }

    #[test]
    fn test_empty_path_matchers_accept_any_path() {
        let predicate = RequestPredicate::new().with_path_matchers(vec![], MatchOperator::Or);
        assert!(score(&predicate, &RequestMessage::new("GET", "/any/path")).is_perfect_match());
    }

    #[test]
    fn test_composite_any_of() {
        let predicate = RequestPredicate::new().with(RequestMatcher::Composite(CompositeMatcher::new(
            vec![
                RequestMatcher::Path(ValueMatcher::new(
                    vec![Matcher::exact(["/a"], false).unwrap()],
                    MatchOperator::Or,
                )),
                RequestMatcher::Method(MethodMatcher::new(["DELETE"])),
            ],
            MatchOperator::Or,
        )));
        assert!(score(&predicate, &RequestMessage::new("DELETE", "/b")).is_perfect_match());
        assert!(score(&predicate, &RequestMessage::new("GET", "/a")).is_perfect_match());
        assert!(!score(&predicate, &RequestMessage::new("GET", "/b")).is_perfect_match());
        assert_eq!(
            score(&predicate, &RequestMessage::new("GET", "/b")).match_details[0].matcher_type,
            "CompositeMatcher"
        );
    }

    proptest! {
        #[test]
        fn prop_omitted_facets_are_neutral(path in "/[a-z]{0,10}", header in "[a-z]{0,8}", body in ".{0,20}") {
            let predicate = RequestPredicate::new().using_method("GET");
            let request = RequestMessage::new("GET", &path)
                .with_header("X-Any", header)
                .with_body(body);
            let result = predicate.get_matching_result(&request, MatchScores::ALMOST_PERFECT);
            prop_assert_eq!(result.average_total_score(), 1.0);
            prop_assert_eq!(result.total_number, 1);
        }
    }
}
