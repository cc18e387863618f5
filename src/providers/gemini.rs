//! Gemini provider: `streamGenerateContent` with SSE streaming.

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
use crate::tool::ToolSchema;
use crate::wire::WireDecoder;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini client.
pub struct Gemini {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    models: ModelCache,
}

impl Gemini {
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
            .get(format!("{}/models?pageSize=200", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_response(status, &body));
        }

        let page: ModelsPage = response.json().await?;
        Ok(page
            .models
            .into_iter()
            .map(|m| {
                let id = m
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&m.name)
                    .to_string();
                let meta = meta(&id);
                Model {
                    provider: "gemini".to_string(),
                    id,
                    meta,
                }
            })
            .collect())
    }
}

#[async_trait]
impl Provider for Gemini {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn models(&self) -> Result<Vec<Model>, Error> {
        self.models.get_or_list(|| self.list_models()).await
    }

    fn chat(&self, req: ChatRequest) -> ChatStream<'_> {
        Box::pin(try_stream! {
            if req.model.is_empty() {
                Err(Error::Config("gemini: required model is empty".to_string()))?;
            }

            let body = GenerateRequest::from_chat(&req);
            let response = self
                .http
                .post(format!(
                    "{}/models/{}:streamGenerateContent?alt=sse",
                    self.base_url, req.model
                ))
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let mut chunks = WireDecoder::sse("gemini", response);
                while let Some(chunk) = chunks.event::<GenerateChunk>().await? {
                    for response in translate_chunk(chunk)? {
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
        Error::Provider(format!("gemini: {}", envelope.error.message))
    } else {
        Error::Provider(format!("gemini: HTTP {status}: {body}"))
    }
}

/// Translate one streamed chunk into canonical deltas.
fn translate_chunk(chunk: GenerateChunk) -> Result<Vec<ChatResponse>, Error> {
    let mut out = Vec::new();

    for candidate in &chunk.candidates {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    if !text.is_empty() {
                        if part.thought.unwrap_or(false) {
                            out.push(ChatResponse::thinking(text.clone()));
                        } else {
                            out.push(ChatResponse::content(text.clone()));
                        }
                    }
                }
                if let Some(call) = &part.function_call {
                    let arguments = match &call.args {
                        Some(args) => serde_json::to_string(args)
                            .map_err(|err| Error::Provider(format!("gemini: marshaling args: {err}")))?,
                        None => "{}".to_string(),
                    };
                    let mut tool_call = ToolCall::new(
                        call.id.clone().unwrap_or_default(),
                        call.name.clone().unwrap_or_default(),
                        arguments,
                    );
                    tool_call.thought_signature = part.thought_signature.clone();
                    out.push(ChatResponse::tool_call(tool_call));
                }
            }
        }
        if candidate.finish_reason.is_some() {
            out.push(ChatResponse::done());
        }
    }

    if let Some(usage) = &chunk.usage_metadata {
        let input = usage.prompt_token_count.unwrap_or(0);
        let output = usage.candidates_token_count.unwrap_or(0);
        let total = usage.total_token_count.unwrap_or(input + output);
        // Keep the usage event ahead of any done event in this chunk.
        out.insert(
            0,
            ChatResponse::usage(Usage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: total,
            }),
        );
    }

    Ok(out)
}

// --- Request types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    thought: Option<bool>,
    thought_signature: Option<String>,
    function_call: Option<FunctionCall>,
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            thought: None,
            thought_signature: None,
            function_call: None,
            function_response: None,
        }
    }

    fn empty() -> Self {
        Self {
            text: None,
            thought: None,
            thought_signature: None,
            function_call: None,
            function_response: None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionCall {
    id: Option<String>,
    name: Option<String>,
    args: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
    include_thoughts: bool,
}

impl GenerateRequest {
    fn from_chat(req: &ChatRequest) -> Self {
        let (system_instruction, contents) = encode_messages(&req.messages);

        let tools = if req.tools.is_empty() {
            Vec::new()
        } else {
            vec![WireTool {
                function_declarations: req
                    .tools
                    .iter()
                    .map(|schema| FunctionDeclaration {
                        name: schema.function.name.clone(),
                        description: schema.function.description.clone(),
                        parameters: encode_parameters(schema),
                    })
                    .collect(),
            }]
        };

        let budget = req.thinking.budget_tokens();
        let generation_config = (budget > 0).then(|| GenerationConfig {
            thinking_config: Some(ThinkingConfig {
                thinking_budget: budget,
                include_thoughts: true,
            }),
        });

        Self {
            contents,
            system_instruction,
            tools,
            generation_config,
        }
    }
}

fn encode_parameters(schema: &ToolSchema) -> serde_json::Value {
    serde_json::to_value(&schema.function.parameters)
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Convert canonical messages to Gemini contents.
///
/// Assistant tool calls become `functionCall` parts replaying any captured
/// thought signature verbatim; tool results become `functionResponse` parts
/// whose function name is recovered from the paired call.
fn encode_messages(messages: &[Message]) -> (Option<SystemInstruction>, Vec<Content>) {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut unmatched_calls: Vec<String> = Vec::new();

    let mut push = |role: &str, parts: Vec<Part>| {
        if parts.is_empty() {
            return;
        }
        if let Some(last) = contents.last_mut() {
            if last.role == role {
                last.parts.extend(parts);
                return;
            }
        }
        contents.push(Content {
            role: role.to_string(),
            parts,
        });
    };

    for message in messages {
        match message.role {
            Role::System => system_parts.push(Part::text(message.content.clone())),
            Role::User => push("user", vec![Part::text(message.content.clone())]),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(Part::text(message.content.clone()));
                }
                if let Some(call) = &message.tool_call {
                    if call.id.is_empty() {
                        unmatched_calls.push(call.name.clone());
                    } else {
                        call_names.insert(call.id.clone(), call.name.clone());
                    }
                    let mut part = Part::empty();
                    part.thought_signature = call.thought_signature.clone();
                    part.function_call = Some(FunctionCall {
                        id: (!call.id.is_empty()).then(|| call.id.clone()),
                        name: Some(call.name.clone()),
                        args: Some(
                            serde_json::from_str(&call.arguments)
                                .unwrap_or_else(|_| serde_json::json!({})),
                        ),
                    });
                    parts.push(part);
                }
                push("model", parts);
            }
            Role::Tool => {
                let name = call_names
                    .get(&message.tool_call_id)
                    .cloned()
                    .or_else(|| {
                        if unmatched_calls.is_empty() {
                            None
                        } else {
                            Some(unmatched_calls.remove(0))
                        }
                    })
                    .unwrap_or_default();
                let value: serde_json::Value = serde_json::from_str(&message.content)
                    .unwrap_or_else(|_| serde_json::Value::String(message.content.clone()));
                let mut part = Part::empty();
                part.function_response = Some(FunctionResponse {
                    name,
                    response: serde_json::json!({ "result": value }),
                });
                push("user", vec![part]);
            }
        }
    }

    let system_instruction = (!system_parts.is_empty()).then(|| SystemInstruction {
        parts: system_parts,
    });
    (system_instruction, contents)
}

// --- Response types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsPage {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

// --- Model metadata ---

// https://ai.google.dev/gemini-api/docs/models
fn meta(id: &str) -> Option<ModelMeta> {
    let entry = |name: &str, cutoff: Option<NaiveDate>, window: u32, output: u32, reasoning: bool| {
        Some(ModelMeta::new(name, cutoff, window, output, reasoning))
    };
    match id {
        "gemini-3-pro-preview" => {
            entry("Gemini 3 Pro Preview", date(2025, 1, 31), 1_048_576, 65_536, true)
        }
        "gemini-3-flash-preview" => {
            entry("Gemini 3 Flash Preview", date(2025, 1, 31), 1_048_576, 65_536, true)
        }
        "gemini-2.5-pro" => entry("Gemini 2.5 Pro", date(2025, 1, 31), 1_048_576, 65_536, true),
        "gemini-2.5-flash" => entry("Gemini 2.5 Flash", date(2025, 1, 31), 1_048_576, 65_536, true),
        "gemini-2.5-flash-lite" => {
            entry("Gemini 2.5 Flash-Lite", date(2025, 1, 31), 1_048_576, 65_536, true)
        }
        "gemini-2.0-flash" | "gemini-2.0-flash-001" => {
            entry("Gemini 2.0 Flash", date(2024, 8, 31), 1_048_576, 8_192, true)
        }
        "gemini-2.0-flash-lite" | "gemini-2.0-flash-lite-001" => {
            entry("Gemini 2.0 Flash-Lite", date(2024, 8, 31), 1_048_576, 8_192, false)
        }
        _ => None,
    }
}

fn date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}
