//! OpenAI provider: Responses API with SSE streaming.

use std::collections::HashMap;

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI client.
pub struct OpenAi {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    models: ModelCache,
}

impl OpenAi {
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
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
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
                provider: "openai".to_string(),
                id: m.id.clone(),
                meta: meta(&m.id),
            })
            .collect())
    }
}

#[async_trait]
impl Provider for OpenAi {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn models(&self) -> Result<Vec<Model>, Error> {
        self.models.get_or_list(|| self.list_models()).await
    }

    fn chat(&self, req: ChatRequest) -> ChatStream<'_> {
        Box::pin(try_stream! {
            if req.model.is_empty() {
                Err(Error::Config("openai: required model is empty".to_string()))?;
            }

            let body = ResponsesRequest::from_chat(&req);
            let response = self
                .http
                .post(format!("{}/responses", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let mut events = WireDecoder::sse("openai", response);
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
        Error::Provider(format!("openai: {}", envelope.error.message))
    } else {
        Error::Provider(format!("openai: HTTP {status}: {body}"))
    }
}

// --- Stream assembly ---

/// Translates Responses API events into canonical deltas. Function-call
/// argument fragments are buffered per output item until the item
/// completes.
#[derive(Default)]
struct Assembler {
    calls: HashMap<String, PendingCall>,
}

struct PendingCall {
    call_id: String,
    name: String,
    arguments: String,
}

impl Assembler {
    fn handle(&mut self, event: StreamEvent) -> Result<Vec<ChatResponse>, Error> {
        match event {
            StreamEvent::OutputTextDelta { delta } => Ok(vec![ChatResponse::content(delta)]),
            StreamEvent::ReasoningSummaryTextDelta { delta } => {
                Ok(vec![ChatResponse::thinking(delta)])
            }
            StreamEvent::OutputItemAdded { item } => {
                if item.kind == "function_call" {
                    self.calls.insert(
                        item.id.clone(),
                        PendingCall {
                            call_id: item.call_id,
                            name: item.name,
                            arguments: item.arguments.unwrap_or_default(),
                        },
                    );
                }
                Ok(vec![])
            }
            StreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                if let Some(pending) = self.calls.get_mut(&item_id) {
                    pending.arguments.push_str(&delta);
                }
                Ok(vec![])
            }
            StreamEvent::OutputItemDone { item } => {
                if item.kind != "function_call" {
                    return Ok(vec![]);
                }
                let pending = self.calls.remove(&item.id);
                let (call_id, name, buffered) = match pending {
                    Some(p) => (p.call_id, p.name, p.arguments),
                    None => (item.call_id, item.name, String::new()),
                };
                // The done item carries the full argument string; fall back
                // to whatever was buffered from deltas.
                let raw = item.arguments.filter(|a| !a.is_empty()).unwrap_or(buffered);
                let arguments = normalize_arguments(&raw);
                Ok(vec![ChatResponse::tool_call(ToolCall::new(
                    call_id, name, arguments,
                ))])
            }
            StreamEvent::Completed { response } => {
                let mut out = Vec::new();
                if let Some(usage) = response.usage {
                    out.push(ChatResponse::usage(Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.total_tokens,
                    }));
                }
                out.push(ChatResponse::done());
                Ok(out)
            }
            StreamEvent::Failed { response } => {
                let message = response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "response failed".to_string());
                Err(Error::Provider(format!("openai: {message}")))
            }
            StreamEvent::ErrorEvent { message } => {
                Err(Error::Provider(format!("openai: stream error: {message}")))
            }
            StreamEvent::Other => Ok(vec![]),
        }
    }
}

// --- Request types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputItem>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    reasoning: Option<ReasoningConfig>,
}

#[derive(Debug, Serialize)]
struct ReasoningConfig {
    effort: &'static str,
    summary: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: &'static str,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl ResponsesRequest {
    fn from_chat(req: &ChatRequest) -> Self {
        Self {
            model: req.model.clone(),
            input: encode_messages(&req.messages),
            stream: true,
            tools: req.tools.iter().map(encode_tool).collect(),
            reasoning: req.thinking.effort().map(|effort| ReasoningConfig {
                effort,
                summary: "auto",
            }),
        }
    }
}

fn encode_tool(schema: &ToolSchema) -> WireTool {
    WireTool {
        kind: "function",
        name: schema.function.name.clone(),
        description: schema.function.description.clone(),
        parameters: serde_json::to_value(&schema.function.parameters)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
    }
}

fn encode_messages(messages: &[Message]) -> Vec<InputItem> {
    let mut input = Vec::new();
    for message in messages {
        match message.role {
            Role::System => input.push(InputItem::Message {
                role: "system",
                content: message.content.clone(),
            }),
            Role::User => input.push(InputItem::Message {
                role: "user",
                content: message.content.clone(),
            }),
            Role::Assistant => {
                if !message.content.is_empty() {
                    input.push(InputItem::Message {
                        role: "assistant",
                        content: message.content.clone(),
                    });
                }
                if let Some(call) = &message.tool_call {
                    input.push(InputItem::FunctionCall {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
            }
            Role::Tool => input.push(InputItem::FunctionCallOutput {
                call_id: message.tool_call_id.clone(),
                output: message.content.clone(),
            }),
        }
    }
    input
}

// --- Response types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta { delta: String },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { item_id: String, delta: String },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: OutputItem },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseEnvelope },
    #[serde(rename = "response.failed")]
    Failed { response: FailedEnvelope },
    #[serde(rename = "error")]
    ErrorEvent {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct FailedEnvelope {
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
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

// https://developers.openai.com/api/docs/models
fn meta(id: &str) -> Option<ModelMeta> {
    let entry = |name: &str, cutoff: Option<NaiveDate>, window: u32, output: u32, reasoning: bool| {
        Some(ModelMeta::new(name, cutoff, window, output, reasoning))
    };
    match id {
        "gpt-5.2" | "gpt-5.2-2025-12-11" => {
            entry("GPT-5.2", date(2025, 8, 31), 400_000, 128_000, true)
        }
        "gpt-5.2-pro" | "gpt-5.2-pro-2025-12-11" => {
            entry("GPT-5.2 pro", date(2025, 8, 31), 400_000, 128_000, true)
        }
        "gpt-5" | "gpt-5-2025-08-07" => entry("GPT-5", date(2024, 9, 30), 400_000, 128_000, true),
        "gpt-5-mini" | "gpt-5-mini-2025-08-07" => {
            entry("GPT-5 mini", date(2024, 5, 31), 400_000, 128_000, true)
        }
        "gpt-5-nano" | "gpt-5-nano-2025-08-07" => {
            entry("GPT-5 nano", date(2024, 5, 31), 400_000, 128_000, true)
        }
        "gpt-4.1" | "gpt-4.1-2025-04-14" => {
            entry("GPT-4.1", date(2024, 6, 1), 1_047_576, 32_768, false)
        }
        _ => None,
    }
}

fn date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}
