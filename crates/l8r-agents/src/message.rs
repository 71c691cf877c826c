use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Unrecognized or missing roles are treated as user input.
    pub fn from_loose(raw: Option<&str>) -> Self {
        match raw {
            Some("system") => Self::System,
            Some("assistant") => Self::Assistant,
            Some("tool") => Self::Tool,
            _ => Self::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation proposed by the model. `arguments` is the raw JSON text
/// exactly as the model produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ToolCallWire", from = "ToolCallInput")]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Serialize)]
struct ToolCallWire {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionWire,
}

#[derive(Serialize)]
struct FunctionWire {
    name: String,
    arguments: String,
}

impl From<ToolCallRequest> for ToolCallWire {
    fn from(call: ToolCallRequest) -> Self {
        Self {
            id: call.id,
            kind: "function",
            function: FunctionWire {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

/// Accepts both the chat-completions shape (`{id, function: {name,
/// arguments}}`) and the flat `{id, name, arguments}` shape clients echo back.
#[derive(Deserialize)]
#[serde(untagged)]
enum ToolCallInput {
    Nested {
        id: String,
        function: FunctionInput,
    },
    Flat {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

#[derive(Deserialize)]
struct FunctionInput {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl From<ToolCallInput> for ToolCallRequest {
    fn from(input: ToolCallInput) -> Self {
        let (id, name, arguments) = match input {
            ToolCallInput::Nested { id, function } => (id, function.name, function.arguments),
            ToolCallInput::Flat {
                id,
                name,
                arguments,
            } => (id, name, arguments),
        };
        Self {
            id,
            name,
            arguments: arguments_text(arguments),
        }
    }
}

fn arguments_text(arguments: Value) -> String {
    match arguments {
        Value::String(text) => text,
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// One entry of a conversation in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// Parse tool calls leniently, skipping entries that match neither shape.
pub(crate) fn parse_tool_calls(raw: &Value) -> Vec<ToolCallRequest> {
    raw.as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| serde_json::from_value::<ToolCallRequest>(call.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
