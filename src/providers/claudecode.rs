//! Claude Code provider: drives the `claude` CLI as a subprocess and
//! parses its line-delimited JSON output.

use async_stream::try_stream;
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::client::Error;
use crate::model::{ChatRequest, ChatResponse, Message, Model, Role, ToolCall, Usage};
use crate::provider::{ChatStream, Provider};
use crate::providers::normalize_arguments;

/// Large enough for any single JSON event line; long tool-argument
/// payloads can push lines into the hundreds of kilobytes.
const LINE_BUFFER: usize = 1024 * 1024;

/// Extra CLI flags accepted through the `CLAUDE_CODE` environment
/// variable.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "claudecode", no_binary_name = true)]
struct Flags {
    #[arg(long)]
    permission_mode: Option<String>,
    #[arg(long)]
    add_dir: Vec<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    dangerously_skip_permissions: bool,
    #[arg(long)]
    max_turns: Option<u32>,
}

/// Claude CLI client.
pub struct ClaudeCode {
    flags: Flags,
}

impl ClaudeCode {
    pub fn new() -> Self {
        Self {
            flags: Flags::default(),
        }
    }

    /// Parse extra CLI flags, e.g. `"--permission-mode plan --add-dir /tmp"`.
    /// Unrecognized input is ignored.
    pub fn with_flags(flags: &str) -> Self {
        let flags = match Flags::try_parse_from(flags.split_whitespace()) {
            Ok(flags) => flags,
            Err(err) => {
                warn!(%err, "claudecode: ignoring unparseable flags");
                Flags::default()
            }
        };
        Self { flags }
    }

    fn build_args(&self, req: &ChatRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--include-partial-messages".to_string(),
            "--strict-mcp-config".to_string(),
        ];

        if !req.model.is_empty() {
            args.push("--model".to_string());
            args.push(req.model.clone());
        }

        if let Some(mode) = &self.flags.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        for dir in &self.flags.add_dir {
            args.push("--add-dir".to_string());
            args.push(dir.clone());
        }
        if let Some(session) = &self.flags.session_id {
            args.push("--session-id".to_string());
            args.push(session.clone());
        }
        if self.flags.dangerously_skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(max_turns) = self.flags.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }

        args
    }
}

impl Default for ClaudeCode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ClaudeCode {
    fn name(&self) -> &'static str {
        "claudecode"
    }

    async fn models(&self) -> Result<Vec<Model>, Error> {
        // The CLI brings its own models; static list.
        Ok(["sonnet", "opus", "haiku"]
            .into_iter()
            .map(|id| Model {
                provider: "claudecode".to_string(),
                id: id.to_string(),
                meta: None,
            })
            .collect())
    }

    fn chat(&self, req: ChatRequest) -> ChatStream<'_> {
        Box::pin(try_stream! {
            let mut args = self.build_args(&req);
            args.push(build_prompt(&req.messages));

            let mut child = Command::new("claude")
                .args(&args)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| Error::Provider(format!("claudecode: starting command: {err}")))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Provider("claudecode: missing stdout pipe".to_string()))?;
            let mut stderr = child
                .stderr
                .take()
                .ok_or_else(|| Error::Provider("claudecode: missing stderr pipe".to_string()))?;

            let stderr_task = tokio::spawn(async move {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer).await;
                buffer
            });

            let mut lines = BufReader::with_capacity(LINE_BUFFER, stdout).lines();
            let mut assembler = Assembler::default();

            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|err| Error::Provider(format!("claudecode: reading output: {err}")))?
            {
                if line.is_empty() {
                    continue;
                }
                for response in assembler.handle_line(&line) {
                    yield response;
                }
            }

            let status = child
                .wait()
                .await
                .map_err(|err| Error::Provider(format!("claudecode: waiting: {err}")))?;
            if !status.success() {
                let stderr = stderr_task.await.unwrap_or_default();
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Err(Error::Provider(format!("claudecode: command failed: {status}")))?;
                } else {
                    Err(Error::Provider(format!("claudecode: command failed: {stderr}")))?;
                }
            }
        })
    }
}

/// Concatenate the conversation into a single prompt string.
fn build_prompt(messages: &[Message]) -> String {
    let mut parts = Vec::new();
    for message in messages {
        let prefix = match message.role {
            Role::System => "[System]",
            Role::User => "[User]",
            Role::Assistant => "[Assistant]",
            Role::Tool => "[Tool Result]",
        };
        parts.push(format!("{prefix}: {}", message.content));
    }
    parts.join("\n\n")
}

// --- Line-event assembly ---

/// Translates CLI event lines into canonical deltas.
///
/// With `--include-partial-messages` the CLI emits both partial
/// `stream_event`s and complete `assistant` messages for the same content;
/// once partial deltas have been seen, assistant events are dropped to
/// avoid duplication.
#[derive(Default)]
struct Assembler {
    tool: Option<(String, String)>,
    tool_input: String,
    streamed: bool,
}

impl Assembler {
    fn handle_line(&mut self, line: &str) -> Vec<ChatResponse> {
        let base: BaseEvent = match serde_json::from_str(line) {
            Ok(base) => base,
            Err(err) => {
                debug!(%err, "claudecode: failed to parse event line");
                return Vec::new();
            }
        };

        match base.kind.as_str() {
            "stream_event" => match serde_json::from_str::<StreamEventLine>(line) {
                Ok(event) => self.handle_stream_event(event.event),
                Err(_) => Vec::new(),
            },
            "assistant" => {
                if self.streamed {
                    return Vec::new();
                }
                match serde_json::from_str::<MessageEventLine>(line) {
                    Ok(event) => handle_message_event(event),
                    Err(_) => Vec::new(),
                }
            }
            "result" => match serde_json::from_str::<ResultEventLine>(line) {
                Ok(event) => {
                    let mut out = Vec::new();
                    if let Some(usage) = event.usage {
                        out.push(ChatResponse::usage(Usage::new(
                            usage.input_tokens,
                            usage.output_tokens,
                        )));
                    }
                    out.push(ChatResponse::done());
                    out
                }
                Err(_) => vec![ChatResponse::done()],
            },
            _ => Vec::new(),
        }
    }

    fn handle_stream_event(&mut self, inner: InnerEvent) -> Vec<ChatResponse> {
        match inner.kind.as_str() {
            "content_block_start" => {
                if let Some(block) = inner.content_block {
                    if block.kind == "tool_use" {
                        self.tool = Some((block.id, block.name));
                        self.tool_input.clear();
                    }
                }
                Vec::new()
            }
            "content_block_delta" => {
                let Some(delta) = inner.delta else {
                    return Vec::new();
                };
                match delta.kind.as_str() {
                    "text_delta" if !delta.text.is_empty() => {
                        self.streamed = true;
                        vec![ChatResponse::content(delta.text)]
                    }
                    "thinking_delta" if !delta.thinking.is_empty() => {
                        self.streamed = true;
                        vec![ChatResponse::thinking(delta.thinking)]
                    }
                    "input_json_delta" => {
                        self.tool_input.push_str(&delta.partial_json);
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                if let Some((id, name)) = self.tool.take() {
                    self.streamed = true;
                    let arguments = normalize_arguments(&self.tool_input);
                    self.tool_input.clear();
                    vec![ChatResponse::tool_call(ToolCall::new(id, name, arguments))]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }
}

fn handle_message_event(event: MessageEventLine) -> Vec<ChatResponse> {
    let mut out = Vec::new();
    for item in event.message.content {
        match item.kind.as_str() {
            "text" if !item.text.is_empty() => out.push(ChatResponse::content(item.text)),
            "thinking" if !item.thinking.is_empty() => {
                out.push(ChatResponse::thinking(item.thinking))
            }
            "tool_use" => {
                let arguments = item
                    .input
                    .map(|input| input.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                out.push(ChatResponse::tool_call(ToolCall::new(
                    item.id,
                    item.name,
                    normalize_arguments(&arguments),
                )));
            }
            _ => {}
        }
    }
    out
}

// --- Event line types ---

#[derive(Debug, Deserialize)]
struct BaseEvent {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct StreamEventLine {
    event: InnerEvent,
}

#[derive(Debug, Deserialize)]
struct InnerEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<Delta>,
    content_block: Option<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    thinking: String,
    #[serde(default)]
    partial_json: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct MessageEventLine {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    thinking: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ResultEventLine {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_from_env_string() {
        let provider = ClaudeCode::with_flags(
            "--permission-mode=plan --add-dir /tmp --add-dir /var --dangerously-skip-permissions --max-turns 3",
        );
        assert_eq!(provider.flags.permission_mode.as_deref(), Some("plan"));
        assert_eq!(provider.flags.add_dir, vec!["/tmp", "/var"]);
        assert!(provider.flags.dangerously_skip_permissions);
        assert_eq!(provider.flags.max_turns, Some(3));
    }

    #[test]
    fn bad_flags_fall_back_to_defaults() {
        let provider = ClaudeCode::with_flags("--no-such-flag");
        assert!(provider.flags.permission_mode.is_none());
    }

    #[test]
    fn args_include_model_and_flags() {
        let provider = ClaudeCode::with_flags("--max-turns 2");
        let req = ChatRequest {
            model: "haiku".to_string(),
            ..ChatRequest::default()
        };
        let args = provider.build_args(&req);
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--include-partial-messages".to_string()));
        let model_at = args.iter().position(|a| a == "--model").expect("model flag");
        assert_eq!(args[model_at + 1], "haiku");
        assert!(args.contains(&"--max-turns".to_string()));
    }

    #[test]
    fn prompt_concatenates_roles() {
        let prompt = build_prompt(&[
            Message::system("be terse"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::tool("t1", "42"),
        ]);
        assert_eq!(
            prompt,
            "[System]: be terse\n\n[User]: hi\n\n[Assistant]: hello\n\n[Tool Result]: 42"
        );
    }

    #[test]
    fn stream_events_translate_to_deltas() {
        let mut assembler = Assembler::default();
        let out = assembler.handle_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"4"}}}"#,
        );
        assert_eq!(out[0].content, "4");

        let out = assembler.handle_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"math"}}}"#,
        );
        assert_eq!(out[0].thinking, "math");
    }

    #[test]
    fn tool_use_assembles_across_lines() {
        let mut assembler = Assembler::default();
        assert!(assembler
            .handle_line(
                r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_9","name":"add"}}}"#,
            )
            .is_empty());
        assert!(assembler
            .handle_line(
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"a\":17,"}}}"#,
            )
            .is_empty());
        assert!(assembler
            .handle_line(
                r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"b\":25}"}}}"#,
            )
            .is_empty());
        let out = assembler.handle_line(
            r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#,
        );
        let call = out[0].tool_call.as_ref().expect("call");
        assert_eq!(call.id, "toolu_9");
        assert_eq!(call.arguments, r#"{"a":17,"b":25}"#);
    }

    #[test]
    fn assistant_events_are_skipped_after_partials() {
        let mut assembler = Assembler::default();
        assembler.handle_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"4"}}}"#,
        );
        let out = assembler.handle_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"4"}]}}"#,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn assistant_events_used_without_partials() {
        let mut assembler = Assembler::default();
        let out = assembler.handle_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"4"},{"type":"tool_use","id":"t","name":"add","input":{"a":1}}]}}"#,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "4");
        assert_eq!(out[1].tool_call.as_ref().expect("call").name, "add");
    }

    #[test]
    fn result_yields_usage_and_done() {
        let mut assembler = Assembler::default();
        let out = assembler.handle_line(
            r#"{"type":"result","subtype":"success","usage":{"input_tokens":11,"output_tokens":4}}"#,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].usage.expect("usage").input_tokens, 11);
        assert!(out[1].done);
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let mut assembler = Assembler::default();
        assert!(assembler.handle_line("not json").is_empty());
        assert!(assembler.handle_line(r#"{"type":"system","subtype":"init"}"#).is_empty());
    }
}
