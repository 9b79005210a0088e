//! Turning raw model output into a [`Decision`].
//!
//! Model output is rarely clean JSON. [`normalize`] recovers an object from
//! common wrappings (code fences, leading prose, raw newlines inside
//! strings) and [`parse`] maps it onto the decision variants. Anything that
//! cannot be recovered is a [`ParseError`]; nothing here guesses at intent.

use history::{CallRecord, PlanStep};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::operator::InteractionRequest;

/// Discriminator field every model response must carry.
pub const RESPONSE_TYPE_FIELD: &str = "llm_response_type";

/// What the model wants to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Plan(Vec<PlanStep>),
    FunctionCall(CallRecord),
    UserInteraction(InteractionRequest),
    FinalAnswer {
        result: String,
        summary: Option<String>,
    },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Plan(_) => "plan",
            Decision::FunctionCall(_) => "function_call",
            Decision::UserInteraction(_) => "user_interaction",
            Decision::FinalAnswer { .. } => "final_answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,

    #[error("no JSON object in response")]
    NoObject,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing llm_response_type")]
    MissingType,

    #[error("unknown llm_response_type: {0}")]
    UnknownType(String),

    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Recover a JSON object from raw model text.
pub fn normalize(raw: &str) -> Result<Map<String, Value>, ParseError> {
    // Well-formed objects are taken as is; backticks inside string values
    // must not be mistaken for fences.
    if let Ok(Value::Object(object)) = serde_json::from_str(raw.trim()) {
        return Ok(object);
    }

    let text = strip_fences(raw).trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    match recover_object(text) {
        Ok(object) => Ok(object),
        // Backticks inside a value can cut a fenced object short.
        Err(err) if text != raw.trim() => recover_object(raw).map_err(|_| err),
        Err(err) => Err(err),
    }
}

fn recover_object(text: &str) -> Result<Map<String, Value>, ParseError> {
    if let Ok(Value::Object(object)) = serde_json::from_str(text) {
        return Ok(object);
    }

    let candidate = extract_object(text).ok_or(ParseError::NoObject)?;
    let first_error = match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => return Ok(object),
        Ok(_) => return Err(ParseError::NoObject),
        Err(err) => err,
    };

    match serde_json::from_str::<Value>(&escape_control_chars(candidate)) {
        Ok(Value::Object(object)) => Ok(object),
        _ => Err(ParseError::InvalidJson(first_error.to_string())),
    }
}

/// Parse raw model text into a decision.
pub fn parse(raw: &str) -> Result<Decision, ParseError> {
    let mut object = normalize(raw)?;
    let kind = match object.remove(RESPONSE_TYPE_FIELD) {
        Some(Value::String(kind)) => kind,
        Some(other) => return Err(ParseError::UnknownType(other.to_string())),
        None => return Err(ParseError::MissingType),
    };

    match kind.as_str() {
        "plan" => {
            let steps = object.remove("steps").ok_or_else(|| malformed("plan", "missing steps"))?;
            let steps: Vec<PlanStep> =
                serde_json::from_value(steps).map_err(|e| malformed("plan", e))?;
            Ok(Decision::Plan(steps))
        }
        "function_call" => {
            let function = function_section("function_call", &mut object)?;
            Ok(Decision::FunctionCall(CallRecord {
                name: function.name,
                parameters: function.parameters,
                reasoning_tag: function.reasoning_tag,
                reasoning: function.reasoning,
            }))
        }
        "user_interaction" => {
            let function = function_section("user_interaction", &mut object)?;
            Ok(Decision::UserInteraction(InteractionRequest {
                function: function.name,
                parameters: function.parameters,
                reasoning_tag: function.reasoning_tag,
                reasoning: function.reasoning,
                confidence: function.confidence.map(|c| match c {
                    Value::String(s) => s,
                    other => other.to_string(),
                }),
            }))
        }
        "final_answer" => {
            let result = match object.remove("result") {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => {
                    return Err(malformed("final_answer", "missing result"));
                }
                Some(other) => other.to_string(),
            };
            let summary = match object.remove("summary") {
                Some(Value::String(s)) => Some(s),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            };
            Ok(Decision::FinalAnswer { result, summary })
        }
        _ => Err(ParseError::UnknownType(kind)),
    }
}

#[derive(Deserialize)]
struct FunctionSection {
    name: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    reasoning_tag: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<Value>,
}

fn function_section(
    kind: &'static str,
    object: &mut Map<String, Value>,
) -> Result<FunctionSection, ParseError> {
    let function = object
        .remove("function")
        .ok_or_else(|| malformed(kind, "missing function object"))?;
    let mut section: FunctionSection =
        serde_json::from_value(function).map_err(|e| malformed(kind, e))?;
    if section.name.trim().is_empty() {
        return Err(malformed(kind, "empty function name"));
    }
    match section.parameters {
        Value::Null => section.parameters = Value::Object(Map::new()),
        Value::Object(_) => {}
        _ => return Err(malformed(kind, "parameters must be an object")),
    }
    Ok(section)
}

fn malformed(kind: &'static str, reason: impl ToString) -> ParseError {
    ParseError::Malformed {
        kind,
        reason: reason.to_string(),
    }
}

/// Contents of the first fenced block, or the input unchanged.
fn strip_fences(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after = &raw[open + 3..];
    // Skip a language tag such as `json`.
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Slice from the first `{` to its matching `}`, respecting strings.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    // Unbalanced: fall back to the last closing brace.
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Escape raw control characters that appear inside string literals.
fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            } else if ch.is_control() {
                match ch {
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    other => out.push_str(&format!("\\u{:04x}", other as u32)),
                }
                continue;
            }
        } else if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_final_answer_with_numeric_result() {
        let decision = parse(
            r#"{"llm_response_type":"final_answer","result":3,"summary":"1+2=3"}"#,
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::FinalAnswer {
                result: "3".into(),
                summary: Some("1+2=3".into()),
            }
        );
    }

    #[test]
    fn parses_function_call() {
        let decision = parse(
            r#"{"llm_response_type":"function_call","function":{"name":"add","parameters":{"a":1,"b":2},"reasoning_tag":"ARITHMETIC","reasoning":"sum"}}"#,
        )
        .unwrap();
        let Decision::FunctionCall(call) = decision else {
            panic!("expected function call");
        };
        assert_eq!(call.name, "add");
        assert_eq!(call.parameters, json!({"a": 1, "b": 2}));
        assert_eq!(call.reasoning_tag.as_deref(), Some("ARITHMETIC"));
    }

    #[test]
    fn missing_parameters_become_empty_object() {
        let decision =
            parse(r#"{"llm_response_type":"function_call","function":{"name":"now"}}"#).unwrap();
        assert!(matches!(decision, Decision::FunctionCall(call) if call.parameters == json!({})));
    }

    #[test]
    fn strips_code_fences() {
        let raw = "```json\n{\"llm_response_type\":\"final_answer\",\"result\":\"ok\"}\n```";
        assert!(matches!(parse(raw).unwrap(), Decision::FinalAnswer { result, .. } if result == "ok"));
    }

    #[test]
    fn backticks_inside_values_survive() {
        let raw = r#"{"llm_response_type":"final_answer","result":"use ```x``` here","summary":"done"}"#;
        assert!(matches!(
            parse(raw).unwrap(),
            Decision::FinalAnswer { result, .. } if result == "use ```x``` here"
        ));

        let prose = "Answer: {\"llm_response_type\":\"final_answer\",\"result\":\"run ```ls```\"}";
        assert!(matches!(
            parse(prose).unwrap(),
            Decision::FinalAnswer { result, .. } if result == "run ```ls```"
        ));
    }

    #[test]
    fn extracts_object_from_surrounding_prose() {
        let raw = "Sure! Here is my answer: {\"llm_response_type\":\"final_answer\",\"result\":\"{x}\"} Hope that helps.";
        assert!(matches!(parse(raw).unwrap(), Decision::FinalAnswer { result, .. } if result == "{x}"));
    }

    #[test]
    fn escapes_raw_newlines_inside_strings() {
        let raw = "{\"llm_response_type\":\"final_answer\",\"result\":\"line one\nline two\"}";
        assert!(matches!(
            parse(raw).unwrap(),
            Decision::FinalAnswer { result, .. } if result == "line one\nline two"
        ));
    }

    #[test]
    fn parses_plan() {
        let raw = r#"{"llm_response_type":"plan","steps":[
            {"step_number":1,"description":"Add 1 and 2","reasoning":"sum first","expected_tool":"add"},
            {"step_number":2,"description":"Report"}
        ]}"#;
        let Decision::Plan(steps) = parse(raw).unwrap() else {
            panic!("expected plan");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].expected_tool.as_deref(), Some("add"));
        assert!(steps[1].expected_tool.is_none());
    }

    #[test]
    fn parses_user_interaction() {
        let raw = r#"{"llm_response_type":"user_interaction","function":{"name":"escalate","parameters":{"question":"Which base?"},"confidence":0.4}}"#;
        let Decision::UserInteraction(request) = parse(raw).unwrap() else {
            panic!("expected user interaction");
        };
        assert_eq!(request.function, "escalate");
        assert_eq!(request.confidence.as_deref(), Some("0.4"));
    }

    #[test]
    fn rejects_flat_function_call() {
        let err = parse(r#"{"llm_response_type":"function_call","name":"add","parameters":{}}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed { kind: "function_call", .. }));
    }

    #[test]
    fn rejects_unknown_and_missing_types() {
        assert_eq!(
            parse(r#"{"llm_response_type":"add"}"#).unwrap_err(),
            ParseError::UnknownType("add".into())
        );
        assert_eq!(parse(r#"{"result":"3"}"#).unwrap_err(), ParseError::MissingType);
    }

    #[test]
    fn rejects_text_without_object() {
        assert_eq!(parse("   ").unwrap_err(), ParseError::Empty);
        assert_eq!(parse("I think the answer is 3").unwrap_err(), ParseError::NoObject);
        assert!(matches!(
            parse("{\"llm_response_type\": final_answer}").unwrap_err(),
            ParseError::InvalidJson(_)
        ));
    }

    #[test]
    fn rejects_final_answer_without_result() {
        let err = parse(r#"{"llm_response_type":"final_answer","summary":"done"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed { kind: "final_answer", .. }));
    }
}
