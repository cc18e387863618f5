//! Ollama provider: native chat API streaming JSON lines.

use async_stream::try_stream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::cache::ModelCache;
use crate::client::Error;
use crate::env::DEFAULT_OLLAMA_HOST;
use crate::http::build_client;
use crate::model::{ChatRequest, ChatResponse, Message, Model, ModelMeta, Thinking, ToolCall, Usage};
use crate::provider::{ChatStream, Provider};
use crate::tool::ToolSchema;
use crate::wire::WireDecoder;

/// Ollama client.
#[derive(Debug)]
pub struct Ollama {
    host: String,
    http: reqwest::Client,
    models: ModelCache,
}

impl Ollama {
    /// Create a client for the given host URL, e.g.
    /// `http://localhost:11434`.
    pub fn new(host: impl Into<String>) -> Result<Self, Error> {
        let host = host.into();
        reqwest::Url::parse(&host)
            .map_err(|err| Error::Config(format!("ollama: unable to parse host {host:?}: {err}")))?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            http: build_client(),
            models: ModelCache::new(),
        })
    }

    /// Create a client for the default local instance.
    pub fn local() -> Self {
        Self {
            host: DEFAULT_OLLAMA_HOST.to_string(),
            http: build_client(),
            models: ModelCache::new(),
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>, Error> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.host))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("ollama: HTTP {status}: {body}")));
        }

        let page: TagsResponse = response.json().await?;
        Ok(page
            .models
            .into_iter()
            .map(|m| {
                let meta = meta(&m.name);
                Model {
                    provider: "ollama".to_string(),
                    id: m.name,
                    meta,
                }
            })
            .collect())
    }
}

#[async_trait]
impl Provider for Ollama {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn models(&self) -> Result<Vec<Model>, Error> {
        self.models.get_or_list(|| self.list_models()).await
    }

    fn chat(&self, req: ChatRequest) -> ChatStream<'_> {
        Box::pin(try_stream! {
            if req.model.is_empty() {
                Err(Error::Config("ollama: required model is empty".to_string()))?;
            }

            let body = WireChatRequest::from_chat(&req);
            let response = self
                .http
                .post(format!("{}/api/chat", self.host))
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let mut chunks = WireDecoder::json_lines("ollama", response);
                while let Some(chunk) = chunks.event::<ChatChunk>().await? {
                    for response in translate_chunk(chunk)? {
                        yield response;
                    }
                }
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Provider(format!("ollama: HTTP {status}: {body}")))?;
            }
        })
    }
}

/// Translate one streamed JSON document into canonical deltas.
fn translate_chunk(chunk: ChatChunk) -> Result<Vec<ChatResponse>, Error> {
    let mut out = Vec::new();

    if let Some(message) = &chunk.message {
        if !message.thinking.is_empty() {
            out.push(ChatResponse::thinking(message.thinking.clone()));
        }
        if !message.content.is_empty() {
            out.push(ChatResponse::content(message.content.clone()));
        }
        for call in &message.tool_calls {
            let arguments = if call.function.arguments.is_null() {
                "{}".to_string()
            } else {
                serde_json::to_string(&call.function.arguments)
                    .map_err(|err| Error::Provider(format!("ollama: marshaling args: {err}")))?
            };
            out.push(ChatResponse::tool_call(ToolCall::new(
                "",
                call.function.name.clone(),
                arguments,
            )));
        }
    }

    if chunk.done {
        // Eval counts are cumulative; the final document has the totals.
        let input = chunk.prompt_eval_count.unwrap_or(0);
        let output = chunk.eval_count.unwrap_or(0);
        if input > 0 || output > 0 {
            out.push(ChatResponse::usage(Usage::new(input, output)));
        }
        out.push(ChatResponse::done());
    }

    Ok(out)
}

// --- Request types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct WireChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
    think: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl WireChatRequest {
    fn from_chat(req: &ChatRequest) -> Self {
        Self {
            model: req.model.clone(),
            messages: req
                .messages
                .iter()
                .map(|m: &Message| WireMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            tools: req.tools.iter().map(encode_tool).collect(),
            stream: true,
            think: (req.thinking != Thinking::Off).then_some(true),
        }
    }
}

fn encode_tool(schema: &ToolSchema) -> WireTool {
    WireTool {
        kind: schema.kind.clone(),
        function: WireFunctionDef {
            name: schema.function.name.clone(),
            description: schema.function.description.clone(),
            parameters: serde_json::to_value(&schema.function.parameters)
                .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
        },
    }
}

// --- Response types ---

#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<WireResponseMessage>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

// --- Model metadata ---

// Context windows vary per pull/quantization; only curated tags are listed.
fn meta(id: &str) -> Option<ModelMeta> {
    match id {
        "glm-4.7-flash:latest" => Some(ModelMeta::new("GLM-4.7-Flash", None, 128_000, 0, true)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    fn parse(line: &str) -> ChatChunk {
        serde_json::from_str(line).expect("parses")
    }

    #[test]
    fn content_and_thinking_deltas() {
        let out = translate_chunk(parse(
            r#"{"message":{"role":"assistant","content":"4","thinking":"sums"},"done":false}"#,
        ))
        .expect("ok");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].thinking, "sums");
        assert_eq!(out[1].content, "4");
    }

    #[test]
    fn tool_calls_serialize_arguments() {
        let out = translate_chunk(parse(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"add","arguments":{"a":17,"b":25}}}]},"done":false}"#,
        ))
        .expect("ok");
        let call = out[0].tool_call.as_ref().expect("call");
        assert_eq!(call.name, "add");
        let args: serde_json::Value = serde_json::from_str(&call.arguments).expect("json");
        assert_eq!(args["b"], 25);
    }

    #[test]
    fn missing_arguments_become_empty_object() {
        let out = translate_chunk(parse(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"noargs"}}]},"done":false}"#,
        ))
        .expect("ok");
        assert_eq!(out[0].tool_call.as_ref().expect("call").arguments, "{}");
    }

    #[test]
    fn done_reports_cumulative_usage() {
        let out = translate_chunk(parse(
            r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":20,"eval_count":9}"#,
        ))
        .expect("ok");
        assert_eq!(out.len(), 2);
        let usage = out[0].usage.expect("usage");
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.total_tokens, 29);
        assert!(out[1].done);
    }

    #[test]
    fn request_carries_think_flag() {
        let req = ChatRequest {
            model: "qwen3".to_string(),
            thinking: Thinking::Medium,
            tools: vec![],
            messages: vec![Message::system("sys"), Message::user("hi")],
        };
        let wire = WireChatRequest::from_chat(&req);
        assert_eq!(wire.think, Some(true));
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[1].role, "user");

        let off = WireChatRequest::from_chat(&ChatRequest {
            thinking: Thinking::Off,
            ..req
        });
        assert_eq!(off.think, None);
    }

    #[test]
    fn invalid_host_is_a_config_error() {
        let err = Ollama::new("not a url").expect_err("fails");
        assert!(matches!(err, Error::Config(_)));
    }
}
