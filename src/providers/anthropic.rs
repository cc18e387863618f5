//! Anthropic provider: Messages API with SSE streaming.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::cache::ModelCache;
use crate::client::Error;
use crate::http::build_client;
use crate::model::{ChatRequest, ChatResponse, Message, Model, ModelMeta, Role, ToolCall, Usage};
use crate::provider::{ChatStream, Provider};
use crate::providers::normalize_arguments;
use crate::tool::ToolSchema;
use crate::wire::WireDecoder;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic client.
pub struct Anthropic {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    models: ModelCache,
}

impl Anthropic {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: build_client(),
            models: ModelCache::new(),
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>, Error> {
        let response = self
            .http
            .get(format!("{}/v1/models?limit=100", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_response(status, &body));
        }

        let page: ModelsPage = response.json().await?;
        Ok(page
            .data
            .into_iter()
            .map(|m| Model {
                provider: "anthropic".to_string(),
                id: m.id.clone(),
                meta: meta(&m.id),
            })
            .collect())
    }
}

#[async_trait]
impl Provider for Anthropic {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn models(&self) -> Result<Vec<Model>, Error> {
        self.models.get_or_list(|| self.list_models()).await
    }

    fn chat(&self, req: ChatRequest) -> ChatStream<'_> {
        Box::pin(try_stream! {
            if req.model.is_empty() {
                Err(Error::Config("anthropic: required model is empty".to_string()))?;
            }

            let body = MessagesRequest::from_chat(&req);
            let response = self
                .http
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let mut events = WireDecoder::sse("anthropic", response);
                let mut assembler = Assembler::default();
                while let Some(event) = events.event::<StreamEvent>().await? {
                    for response in assembler.handle(event)? {
                        yield response;
                    }
                }
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(error_response(status, &body))?;
            }
        })
    }
}

fn error_response(status: reqwest::StatusCode, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        Error::Provider(format!(
            "anthropic: {} ({})",
            envelope.error.message, envelope.error.kind
        ))
    } else {
        Error::Provider(format!("anthropic: HTTP {status}: {body}"))
    }
}

// --- Stream assembly ---

/// Translates wire events into canonical deltas, buffering tool-use
/// argument fragments until the block completes.
#[derive(Default)]
struct Assembler {
    tool: Option<(String, String)>,
    tool_input: String,
    input_tokens: u32,
    done: bool,
}

impl Assembler {
    fn handle(&mut self, event: StreamEvent) -> Result<Vec<ChatResponse>, Error> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                Ok(vec![ChatResponse::usage(Usage::new(
                    message.usage.input_tokens,
                    message.usage.output_tokens,
                ))])
            }
            StreamEvent::ContentBlockStart { content_block, .. } => {
                if let ContentBlock::ToolUse { id, name } = content_block {
                    self.tool = Some((id, name));
                    self.tool_input.clear();
                }
                Ok(vec![])
            }
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                Delta::TextDelta { text } => Ok(vec![ChatResponse::content(text)]),
                Delta::ThinkingDelta { thinking } => Ok(vec![ChatResponse::thinking(thinking)]),
                Delta::InputJsonDelta { partial_json } => {
                    self.tool_input.push_str(&partial_json);
                    Ok(vec![])
                }
                Delta::SignatureDelta { .. } | Delta::Other => Ok(vec![]),
            },
            StreamEvent::ContentBlockStop { .. } => {
                if let Some((id, name)) = self.tool.take() {
                    let arguments = normalize_arguments(&self.tool_input);
                    self.tool_input.clear();
                    Ok(vec![ChatResponse::tool_call(ToolCall::new(id, name, arguments))])
                } else {
                    Ok(vec![])
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                let mut out = Vec::new();
                if let Some(usage) = usage {
                    out.push(ChatResponse::usage(Usage::new(
                        self.input_tokens,
                        usage.output_tokens,
                    )));
                }
                if delta.stop_reason.is_some() {
                    self.done = true;
                    out.push(ChatResponse::done());
                }
                Ok(out)
            }
            StreamEvent::MessageStop => {
                if self.done {
                    Ok(vec![])
                } else {
                    self.done = true;
                    Ok(vec![ChatResponse::done()])
                }
            }
            StreamEvent::Ping | StreamEvent::Other => Ok(vec![]),
            StreamEvent::Error { error } => Err(Error::Provider(format!(
                "anthropic: stream error ({}): {}",
                error.kind, error.message
            ))),
        }
    }
}

// --- Request types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SystemBlock {
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
}

impl MessagesRequest {
    fn from_chat(req: &ChatRequest) -> Self {
        let (system, messages) = encode_messages(&req.messages);

        let mut max_tokens = DEFAULT_MAX_TOKENS;
        let budget = req.thinking.budget_tokens();
        let thinking = if budget > 0 {
            if max_tokens < budget + 1000 {
                max_tokens = budget + 1000;
            }
            Some(ThinkingConfig::Enabled {
                budget_tokens: budget,
            })
        } else {
            None
        };

        Self {
            model: req.model.clone(),
            max_tokens,
            messages,
            system: if system.is_empty() { None } else { Some(system) },
            tools: req.tools.iter().map(encode_tool).collect(),
            stream: true,
            thinking,
        }
    }
}

fn encode_tool(schema: &ToolSchema) -> WireTool {
    WireTool {
        name: schema.function.name.clone(),
        description: schema.function.description.clone(),
        input_schema: serde_json::to_value(&schema.function.parameters)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
    }
}

/// Convert canonical messages to wire messages, extracting system text and
/// merging consecutive same-role messages so parallel tool calls and their
/// results land in single user/assistant turns.
fn encode_messages(messages: &[Message]) -> (Vec<SystemBlock>, Vec<WireMessage>) {
    let mut system = Vec::new();
    let mut wire: Vec<WireMessage> = Vec::new();

    let mut push = |role: &'static str, blocks: Vec<WireBlock>| {
        if blocks.is_empty() {
            return;
        }
        if let Some(last) = wire.last_mut() {
            if last.role == role {
                last.content.extend(blocks);
                return;
            }
        }
        wire.push(WireMessage { role, content: blocks });
    };

    for message in messages {
        match message.role {
            Role::System => system.push(SystemBlock::Text {
                text: message.content.clone(),
            }),
            Role::User => push(
                "user",
                vec![WireBlock::Text {
                    text: message.content.clone(),
                }],
            ),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(WireBlock::Text {
                        text: message.content.clone(),
                    });
                }
                if let Some(call) = &message.tool_call {
                    blocks.push(WireBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: serde_json::from_str(&call.arguments)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    });
                }
                push("assistant", blocks);
            }
            Role::Tool => push(
                "user",
                vec![WireBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone(),
                    content: message.content.clone(),
                }],
            ),
        }
    }

    (system, wire)
}

// --- Response types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        #[allow(dead_code)]
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[allow(dead_code)]
        index: u32,
        delta: Delta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        delta: MessageDelta,
        usage: Option<UsageDelta>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct UsageDelta {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[allow(dead_code)]
        text: String,
    },
    Thinking,
    RedactedThinking,
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    SignatureDelta {
        #[allow(dead_code)]
        signature: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsPage {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// --- Model metadata ---

// https://platform.claude.com/docs/en/about-claude/models/overview
fn meta(id: &str) -> Option<ModelMeta> {
    let entry = |name: &str, cutoff: Option<NaiveDate>, window: u32, output: u32, reasoning: bool| {
        Some(ModelMeta::new(name, cutoff, window, output, reasoning))
    };
    match id {
        "claude-opus-4-6" => entry("Claude Opus 4.6", date(2025, 5, 31), 200_000, 128_000, true),
        "claude-sonnet-4-6" => entry("Claude Sonnet 4.6", date(2025, 8, 31), 200_000, 64_000, true),
        "claude-haiku-4-5" | "claude-haiku-4-5-20251001" => {
            entry("Claude Haiku 4.5", date(2025, 2, 28), 200_000, 64_000, true)
        }
        "claude-sonnet-4-5" | "claude-sonnet-4-5-20250929" => {
            entry("Claude Sonnet 4.5", date(2025, 1, 31), 200_000, 64_000, true)
        }
        "claude-opus-4-5" | "claude-opus-4-5-20251101" => {
            entry("Claude Opus 4.5", date(2025, 5, 31), 200_000, 64_000, true)
        }
        "claude-opus-4-1" | "claude-opus-4-1-20250805" => {
            entry("Claude Opus 4.1", date(2025, 1, 31), 200_000, 32_000, true)
        }
        "claude-sonnet-4-0" | "claude-sonnet-4-20250514" => {
            entry("Claude Sonnet 4", date(2025, 1, 31), 200_000, 64_000, true)
        }
        "claude-3-7-sonnet-latest" | "claude-3-7-sonnet-20250219" => {
            entry("Claude Sonnet 3.7", date(2024, 10, 31), 200_000, 64_000, true)
        }
        "claude-3-haiku-20240307" => {
            entry("Claude Haiku 3", date(2023, 8, 31), 200_000, 4_000, false)
        }
        _ => None,
    }
}

fn date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}
