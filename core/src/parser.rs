//! Structured-output extraction and validation.
//!
//! Models wrap JSON in prose and code fences, or omit it entirely. The parser
//! finds the first JSON object in a response, checks it for required keys, and
//! reports every failure as a [`CallResult`] instead of an error.

use serde_json::{Map, Value};

use envoy_types::{NonEmptyStaticStr, NonEmptyString};

const EMPTY_RESPONSE: NonEmptyStaticStr = NonEmptyStaticStr::new("Empty response from model");
const NO_JSON_OBJECT: NonEmptyStaticStr =
    NonEmptyStaticStr::new("No JSON object found in model response");

/// How a structured call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    EmptyResponse,
    ParseFailed,
    ValidationFailed,
}

impl CallOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::EmptyResponse => "empty response",
            CallOutcome::ParseFailed => "parse failure",
            CallOutcome::ValidationFailed => "validation failure",
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of parsing one raw model response.
///
/// An unsuccessful result always carries a non-empty error message.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    raw_response: String,
    parsed: Option<Map<String, Value>>,
    outcome: CallOutcome,
    error: Option<NonEmptyString>,
}

impl CallResult {
    fn success(raw_response: String, parsed: Map<String, Value>) -> Self {
        Self {
            raw_response,
            parsed: Some(parsed),
            outcome: CallOutcome::Success,
            error: None,
        }
    }

    fn failure(
        raw_response: String,
        parsed: Option<Map<String, Value>>,
        outcome: CallOutcome,
        error: NonEmptyString,
    ) -> Self {
        Self {
            raw_response,
            parsed,
            outcome,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == CallOutcome::Success
    }

    #[must_use]
    pub fn outcome(&self) -> CallOutcome {
        self.outcome
    }

    #[must_use]
    pub fn raw_response(&self) -> &str {
        &self.raw_response
    }

    /// Parsed object. Present on success and after a validation failure.
    #[must_use]
    pub fn parsed(&self) -> Option<&Map<String, Value>> {
        self.parsed.as_ref()
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(NonEmptyString::as_str)
    }

    /// The parsed object on success, or the failure message.
    pub fn into_result(self) -> Result<Map<String, Value>, (CallOutcome, NonEmptyString, String)> {
        match (self.outcome, self.parsed, self.error) {
            (CallOutcome::Success, parsed, _) => Ok(parsed.unwrap_or_default()),
            (outcome, _, Some(error)) => Err((outcome, error, self.raw_response)),
            (outcome, _, None) => Err((outcome, NO_JSON_OBJECT.into(), self.raw_response)),
        }
    }
}

/// Parse `raw_text` and check it for `expected_fields`. Never panics.
#[must_use]
pub fn parse_and_validate(raw_text: &str, expected_fields: Option<&[String]>) -> CallResult {
    if raw_text.trim().is_empty() {
        return CallResult::failure(
            raw_text.to_string(),
            None,
            CallOutcome::EmptyResponse,
            EMPTY_RESPONSE.into(),
        );
    }

    let Some(parsed) = extract_json_object(raw_text) else {
        return CallResult::failure(
            raw_text.to_string(),
            None,
            CallOutcome::ParseFailed,
            NO_JSON_OBJECT.into(),
        );
    };

    if let Some(expected) = expected_fields {
        let missing = missing_fields(&parsed, expected);
        if !missing.is_empty() {
            let message = format!("Missing required fields: {}", missing.join(", "));
            // `missing` is non-empty, so the message is too.
            if let Ok(message) = NonEmptyString::new(message) {
                return CallResult::failure(
                    raw_text.to_string(),
                    Some(parsed),
                    CallOutcome::ValidationFailed,
                    message,
                );
            }
        }
    }

    CallResult::success(raw_text.to_string(), parsed)
}

/// Expected keys absent from `map`, in the order they were asked for.
#[must_use]
pub fn missing_fields(map: &Map<String, Value>, expected: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|field| !map.contains_key(field.as_str()))
        .cloned()
        .collect()
}

/// Find the first JSON object in `text`.
///
/// Tries the whole text, then each fenced code block, then every `{` in turn
/// until one starts a complete object. Arrays and scalars do not count.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if let Some(map) = parse_object(trimmed) {
        return Some(map);
    }

    if let Some(map) = fenced_blocks(text).find_map(|block| parse_object(block.trim())) {
        return Some(map);
    }

    for (start, _) in text.match_indices('{') {
        match leading_object(&text[start..]) {
            LeadingObject::Found(map) => return Some(map),
            // Every later brace sits inside this unterminated object.
            LeadingObject::Truncated => return None,
            LeadingObject::Invalid => {}
        }
    }
    None
}

enum LeadingObject {
    Found(Map<String, Value>),
    Truncated,
    Invalid,
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// The object at the start of `text`, ignoring whatever follows it.
fn leading_object(text: &str) -> LeadingObject {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(map))) => LeadingObject::Found(map),
        Some(Err(e)) if e.is_eof() => LeadingObject::Truncated,
        _ => LeadingObject::Invalid,
    }
}

/// Bodies of ``` fenced blocks, with the info string (`json`, etc.) removed.
fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        let open = rest.find("```")?;
        let after_open = &rest[open + 3..];
        // Info string runs to the end of the opening line.
        let body_start = after_open.find('\n').map_or(after_open.len(), |n| n + 1);
        let body = &after_open[body_start..];
        let Some(close) = body.find("```") else {
            rest = "";
            return None;
        };
        rest = &body[close + 3..];
        Some(&body[..close])
    })
}
