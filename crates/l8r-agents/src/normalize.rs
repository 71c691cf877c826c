//! Canonicalizes client-supplied conversation histories.
//!
//! The input shape is detected by trying each [`SHAPES`] parser in order.
//! The resulting messages are then repaired so every tool result answers a
//! tool call of the assistant message right before it, and no assistant
//! tool call is left without an answer.

use l8r_common::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::message::{ChatMessage, Role, parse_tool_calls};

/// Outcome of a shape parser that recognized its input.
enum Shape<'a> {
    /// A list of message-like elements still to be converted and repaired.
    Elements(Vec<&'a Value>),
    /// Input that nests another history to normalize.
    Nested(&'a Value),
    /// A single message built directly from the input.
    Single(ChatMessage),
}

type ShapeParser = fn(&Value) -> Option<Shape<'_>>;

const SHAPES: &[(&str, ShapeParser)] = &[
    ("messages", messages_field),
    ("array", bare_array),
    ("indexed", indexed_object),
    ("string", plain_string),
    ("input", input_field),
    ("role_content", role_and_content),
];

/// Convert any accepted input shape into a well-formed message list.
pub fn normalize(input: &Value) -> Result<Vec<ChatMessage>> {
    if input.is_null() {
        return Err(Error::InvalidInput(
            "input cannot be undefined or null".to_string(),
        ));
    }

    for (label, parse) in SHAPES {
        if let Some(shape) = parse(input) {
            debug!(shape = label, "normalizing message input");
            return match shape {
                Shape::Elements(elements) => {
                    Ok(repair(elements.into_iter().map(message_from_element)))
                }
                Shape::Nested(inner) => normalize(inner),
                Shape::Single(message) => Ok(vec![message]),
            };
        }
    }

    Ok(vec![ChatMessage::user(input.to_string())])
}

fn messages_field(input: &Value) -> Option<Shape<'_>> {
    let messages = input.get("messages")?.as_array()?;
    Some(Shape::Elements(messages.iter().collect()))
}

fn bare_array(input: &Value) -> Option<Shape<'_>> {
    Some(Shape::Elements(input.as_array()?.iter().collect()))
}

/// `{"0": .., "1": ..}`. Non-numeric keys are ignored.
fn indexed_object(input: &Value) -> Option<Shape<'_>> {
    let object = input.as_object()?;
    object.get("0")?;
    let mut indexed: Vec<(u64, &Value)> = object
        .iter()
        .filter_map(|(key, value)| key.parse::<u64>().ok().map(|idx| (idx, value)))
        .collect();
    indexed.sort_by_key(|(idx, _)| *idx);
    Some(Shape::Elements(indexed.into_iter().map(|(_, v)| v).collect()))
}

fn plain_string(input: &Value) -> Option<Shape<'_>> {
    input
        .as_str()
        .map(|text| Shape::Single(ChatMessage::user(text)))
}

fn input_field(input: &Value) -> Option<Shape<'_>> {
    let inner = input.as_object()?.get("input").filter(|v| truthy(v))?;
    if inner.is_array() {
        Some(Shape::Nested(inner))
    } else {
        Some(Shape::Single(ChatMessage::user(content_text(Some(inner)))))
    }
}

fn role_and_content(input: &Value) -> Option<Shape<'_>> {
    let object = input.as_object()?;
    let content = object.get("content").filter(|v| truthy(v))?;
    let text = content_text(Some(content));
    // A lone tool result has nothing to answer, so it degrades to user text.
    Some(Shape::Single(
        match Role::from_loose(object.get("role").and_then(Value::as_str)) {
            Role::Assistant => ChatMessage::assistant(text),
            Role::System => ChatMessage::system(text),
            Role::User | Role::Tool => ChatMessage::user(text),
        },
    ))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn content_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn message_from_element(element: &Value) -> ChatMessage {
    match element {
        Value::String(text) => ChatMessage::user(text.as_str()),
        Value::Object(object) => message_from_object(object),
        other => ChatMessage::user(other.to_string()),
    }
}

fn message_from_object(object: &Map<String, Value>) -> ChatMessage {
    let role = Role::from_loose(object.get("role").and_then(Value::as_str));
    let content = content_text(object.get("content"));
    match role {
        Role::Tool => ChatMessage {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: object
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        Role::Assistant => {
            let tool_calls = object
                .get("tool_calls")
                .map(parse_tool_calls)
                .unwrap_or_default();
            ChatMessage::assistant_with_tool_calls(content, tool_calls)
        }
        Role::System => ChatMessage::system(content),
        Role::User => ChatMessage::user(content),
    }
}

/// Tool-call pairing state carried across the scan.
#[derive(Default)]
struct Pairing {
    pending: HashSet<String>,
    /// Output index of the assistant message that issued `pending`.
    anchor: Option<usize>,
}

impl Pairing {
    /// Remove the last tool-calling assistant message, and any partial
    /// answers after it, if its calls were not all answered.
    fn drop_unanswered(&mut self, out: &mut Vec<ChatMessage>) {
        if let Some(anchor) = self.anchor.take() {
            if !self.pending.is_empty() {
                warn!(
                    unanswered = self.pending.len(),
                    removed = out.len() - anchor,
                    "dropping assistant tool calls without results"
                );
                out.truncate(anchor);
            }
        }
        self.pending.clear();
    }
}

/// Enforce tool-call pairing on an already-typed history.
pub fn repair(messages: impl IntoIterator<Item = ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::new();
    let mut pairing = Pairing::default();

    for message in messages {
        match message.role {
            Role::Tool => {
                let answered = message
                    .tool_call_id
                    .as_ref()
                    .is_some_and(|id| pairing.pending.remove(id));
                if answered {
                    out.push(message);
                } else {
                    warn!(
                        tool_call_id = message.tool_call_id.as_deref().unwrap_or("<none>"),
                        "dropping tool message with no matching pending call"
                    );
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                pairing.drop_unanswered(&mut out);
                pairing.pending = message.tool_calls.iter().map(|c| c.id.clone()).collect();
                pairing.anchor = Some(out.len());
                out.push(message);
            }
            _ => {
                pairing.drop_unanswered(&mut out);
                out.push(message);
            }
        }
    }

    pairing.drop_unanswered(&mut out);
    out
}
