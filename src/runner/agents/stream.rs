//! Decoding of agent replies.
//!
//! Accepted shapes, tried in order:
//! - a JSON object with an `events` array, or with a `text`/`content`/`message` string
//! - a JSON array of events
//! - line-oriented output, where each line is an NDJSON event, a data-stream
//!   frame (`0:` text, `9:` tool call, `a:` tool result, `f:` step start,
//!   `e:` step finish, `3:` error) or plain text

use serde_json::Value;

use super::{AgentEvent, AgentReply};

/// Decodes a complete reply body.
pub fn parse_reply(body: &str) -> AgentReply {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return AgentReply::default();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match &value {
            Value::Object(map) if !map.contains_key("type") => {
                if let Some(Value::Array(items)) = map.get("events") {
                    return AgentReply::new(items.iter().map(event_from_value).collect());
                }
                for key in ["text", "content", "message"] {
                    if let Some(Value::String(text)) = map.get(key) {
                        return AgentReply::new(vec![AgentEvent::Text { text: text.clone() }]);
                    }
                }
            }
            Value::Array(items) => {
                return AgentReply::new(items.iter().map(event_from_value).collect());
            }
            _ => {}
        }
    }

    AgentReply::new(parse_stream(body))
}

/// Decodes line-oriented output.
pub fn parse_stream(output: &str) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let event = parse_line(line);
        // Adjacent plain-text lines collapse into one event.
        if let (Some(AgentEvent::Text { text: previous }), AgentEvent::Text { text }) =
            (events.last_mut(), &event)
        {
            previous.push_str(text);
            continue;
        }
        events.push(event);
    }
    events
}

fn parse_line(line: &str) -> AgentEvent {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if value.get("type").is_some() {
                if let Ok(event) = serde_json::from_value::<AgentEvent>(value) {
                    return event;
                }
            }
        }
    }

    if let Some((prefix, rest)) = trimmed.split_once(':') {
        if let Some(event) = parse_frame(prefix, rest) {
            return event;
        }
    }

    AgentEvent::Text {
        text: format!("{}\n", line),
    }
}

fn parse_frame(prefix: &str, rest: &str) -> Option<AgentEvent> {
    if prefix.len() != 1 {
        return None;
    }
    let value: Value = serde_json::from_str(rest).ok()?;
    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    };

    match prefix {
        "0" => Some(AgentEvent::Text {
            text: value.as_str()?.to_string(),
        }),
        "9" => Some(AgentEvent::ToolCall {
            id: str_field(&["toolCallId", "id"]),
            name: str_field(&["toolName", "name"])?,
            input: value
                .get("args")
                .or_else(|| value.get("input"))
                .cloned()
                .unwrap_or(Value::Null),
        }),
        "a" => Some(AgentEvent::ToolResult {
            id: str_field(&["toolCallId", "id"]),
            name: str_field(&["toolName", "name"]),
            output: value
                .get("result")
                .or_else(|| value.get("output"))
                .cloned()
                .unwrap_or(Value::Null),
            is_error: value
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        "f" => Some(AgentEvent::StepStart {
            step: value
                .get("step")
                .and_then(Value::as_u64)
                .and_then(|s| u32::try_from(s).ok()),
        }),
        "e" => Some(AgentEvent::StepFinish {
            reason: str_field(&["finishReason", "reason"]),
        }),
        "3" => Some(AgentEvent::Error {
            message: value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        }),
        _ => None,
    }
}

fn event_from_value(value: &Value) -> AgentEvent {
    match serde_json::from_value::<AgentEvent>(value.clone()) {
        Ok(event) => event,
        Err(_) => AgentEvent::Text {
            text: value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        },
    }
}
