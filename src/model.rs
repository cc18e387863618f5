//! Canonical data models shared by every provider adapter.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::tool::ToolSchema;

/// Role of the message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => f.write_str("system"),
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
            Role::Tool => f.write_str("tool"),
        }
    }
}

/// A single message in a conversation.
///
/// `thinking` and `tool_call` are only populated on assistant messages;
/// `tool_call_id` only on tool-result messages, where it echoes the id of
/// the call it answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            thinking: String::new(),
            tool_call: None,
            tool_call_id: String::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            thinking: String::new(),
            tool_call: None,
            tool_call_id: String::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            thinking: String::new(),
            tool_call: None,
            tool_call_id: String::new(),
        }
    }

    /// A tool-result message answering the call with the given id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            thinking: String::new(),
            tool_call: None,
            tool_call_id: tool_call_id.into(),
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = thinking.into();
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_call = Some(call);
        self
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is the raw JSON argument object exactly as assembled from the
/// provider stream; it is guaranteed to parse as JSON by the time it reaches
/// the tool catalog. `thought_signature` is an opaque provider token
/// (Gemini) that must be replayed verbatim when the call is re-sent; it is
/// never decoded or inspected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            thought_signature: None,
        }
    }
}

/// Extended thinking level, mapped per provider to a concrete budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Thinking {
    #[serde(rename = "none")]
    Off,
    Low,
    Medium,
    High,
}

impl Default for Thinking {
    fn default() -> Self {
        Thinking::Medium
    }
}

impl Thinking {
    /// Token budget used by Anthropic and Gemini.
    pub fn budget_tokens(self) -> u32 {
        match self {
            Thinking::Off => 0,
            Thinking::Low => 4_000,
            Thinking::Medium => 10_000,
            Thinking::High => 32_000,
        }
    }

    /// Effort level used by OpenAI's `reasoning.effort`.
    pub fn effort(self) -> Option<&'static str> {
        match self {
            Thinking::Off => None,
            Thinking::Low => Some("low"),
            Thinking::Medium => Some("medium"),
            Thinking::High => Some("high"),
        }
    }
}

impl std::fmt::Display for Thinking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Thinking::Off => f.write_str("none"),
            Thinking::Low => f.write_str("low"),
            Thinking::Medium => f.write_str("medium"),
            Thinking::High => f.write_str("high"),
        }
    }
}

/// A request to a provider's chat endpoint.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub thinking: Thinking,
    pub tools: Vec<ToolSchema>,
    pub messages: Vec<Message>,
}

/// A single canonical streaming delta from a provider.
///
/// Per event, at most one of `content`, `thinking` or `tool_call` is
/// populated. `usage` may accompany any event; `done = true` marks the end
/// of a successful stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub role: Option<Role>,
    pub content: String,
    pub thinking: String,
    pub tool_call: Option<ToolCall>,
    pub usage: Option<Usage>,
    pub done: bool,
}

impl ChatResponse {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Assistant),
            content: text.into(),
            ..Self::default()
        }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Assistant),
            thinking: text.into(),
            ..Self::default()
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            role: Some(Role::Assistant),
            tool_call: Some(call),
            ..Self::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            role: Some(Role::Assistant),
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            role: Some(Role::Assistant),
            done: true,
            ..Self::default()
        }
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// An available model, optionally annotated with curated metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub provider: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ModelMeta>,
}

/// Curated metadata about a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMeta {
    pub display_name: String,
    pub knowledge_cutoff: Option<NaiveDate>,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub has_reasoning: bool,
}

impl ModelMeta {
    pub fn new(
        display_name: impl Into<String>,
        knowledge_cutoff: Option<NaiveDate>,
        context_window: u32,
        max_output_tokens: u32,
        has_reasoning: bool,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            knowledge_cutoff,
            context_window,
            max_output_tokens,
            has_reasoning,
        }
    }
}
