//! Parsed request model handed to the matching engine.
//!
//! The HTTP transport owns parsing; this module only holds the result and
//! classifies the body so matchers know which view to use.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Classification of a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBodyType {
    #[default]
    None,
    String,
    Json,
    Bytes,
    FormUrlEncoded,
    MultiPart,
}

/// A request body with its raw and parsed views.
#[derive(Debug, Clone, Default)]
pub struct BodyData {
    detected: DetectedBodyType,
    bytes: Vec<u8>,
    text: Option<String>,
    json: Option<Value>,
}

impl BodyData {
    /// Classify `bytes` using the request content type, if any.
    pub fn detect(bytes: Vec<u8>, content_type: Option<&str>) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }

        let content_type = content_type.map(str::to_ascii_lowercase).unwrap_or_default();
        let text = String::from_utf8(bytes.clone()).ok();

        let (detected, json) = match &text {
            None => (DetectedBodyType::Bytes, None),
            Some(_) if content_type.starts_with("multipart/") => {
                (DetectedBodyType::MultiPart, None)
            }
            Some(text) if content_type.starts_with("application/x-www-form-urlencoded") => {
                (DetectedBodyType::FormUrlEncoded, Some(form_to_json(text)))
            }
            Some(text) => {
                let looks_like_json = content_type.contains("json")
                    || matches!(text.trim_start().chars().next(), Some('{') | Some('['));
                match looks_like_json
                    .then(|| serde_json::from_str::<Value>(text).ok())
                    .flatten()
                {
                    Some(value) => (DetectedBodyType::Json, Some(value)),
                    None => (DetectedBodyType::String, None),
                }
            }
        };

        Self {
            detected,
            bytes,
            text,
            json,
        }
    }

    pub fn detected_type(&self) -> DetectedBodyType {
        self.detected
    }

    pub fn is_empty(&self) -> bool {
        self.detected == DetectedBodyType::None
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Body as text when it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Parsed JSON for JSON bodies, or the fields of a form body as a JSON object.
    pub fn as_json(&self) -> Option<&Value> {
        self.json.as_ref()
    }
}

fn form_to_json(text: &str) -> Value {
    let mut object = Map::new();
    for (key, values) in parse_query_string(text) {
        let value = match values.as_slice() {
            [single] => Value::String(single.clone()),
            many => Value::Array(many.iter().cloned().map(Value::String).collect()),
        };
        object.insert(key, value);
    }
    Value::Object(object)
}

/// Multi-valued headers with case-insensitive names.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, Vec<String>>,
}

impl Headers {
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A structured inbound request.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    method: String,
    url: String,
    path: String,
    query: HashMap<String, Vec<String>>,
    headers: Headers,
    cookies: HashMap<String, String>,
    body: BodyData,
}

impl RequestMessage {
    /// Build a request from a method and an absolute URL (or a bare path, which
    /// is resolved against `http://localhost`).
    pub fn new(method: impl Into<String>, url: &str) -> Self {
        let url = if url.starts_with('/') {
            format!("http://localhost{url}")
        } else {
            url.to_string()
        };

        let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
        let path_and_query = url[after_scheme..]
            .find('/')
            .map(|i| &url[after_scheme + i..])
            .unwrap_or("/");
        let path_and_query = path_and_query.split('#').next().unwrap_or_default();
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };

        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.to_string(),
            query: parse_query_string(query),
            url,
            headers: Headers::default(),
            cookies: HashMap::new(),
            body: BodyData::default(),
        }
    }

    /// Add a header value. `Cookie` headers also populate the cookie map.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if name.eq_ignore_ascii_case("cookie") {
            self.cookies.extend(parse_cookie_header(&value));
        }
        self.headers.append(name, value);
        self
    }

    /// Attach a body, classified with the `Content-Type` header set so far.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let content_type = self.headers.get("content-type").map(str::to_string);
        self.body = BodyData::detect(body.into(), content_type.as_deref());
        self
    }

    /// Attach an already classified body.
    pub fn with_body_data(mut self, body: BodyData) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, Vec<String>> {
        &self.query
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn body(&self) -> &BodyData {
        &self.body
    }
}

/// Parse a query string into multi-valued pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        params
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }

    params
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    match urlencoding::decode(&s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s,
    }
}

fn parse_cookie_header(header: &str) -> impl Iterator<Item = (String, String)> + '_ {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
    })
}
