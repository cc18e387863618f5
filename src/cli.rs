//! The `llm` command line interface: one-shot prompts, a small REPL, and
//! model listing.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;

use crate::agent::Agent;
use crate::client::{Client, Error};
use crate::env::{lookup_path, Env};
use crate::model::{Message, Thinking, Usage};
use crate::provider::Provider;
use crate::providers::anthropic::Anthropic;
use crate::providers::claudecode::ClaudeCode;
use crate::providers::gemini::Gemini;
use crate::providers::ollama::Ollama;
use crate::providers::openai::OpenAi;

#[derive(Parser, Debug)]
#[command(
    name = "llm",
    version,
    about = "chat with large language models",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// model to use
    #[arg(short, long, env = "LLM_MODEL")]
    model: Option<String>,

    /// provider to use
    #[arg(short, long, env = "LLM_PROVIDER")]
    provider: Option<String>,

    /// thinking level
    #[arg(short, long, value_enum, default_value_t = ThinkingLevel::Medium)]
    thinking: ThinkingLevel,

    /// output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Option<Command>,

    /// prompt to send to the model
    prompt: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// list available models
    Models,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ThinkingLevel {
    None,
    Low,
    Medium,
    High,
}

impl From<ThinkingLevel> for Thinking {
    fn from(level: ThinkingLevel) -> Self {
        match level {
            ThinkingLevel::None => Thinking::Off,
            ThinkingLevel::Low => Thinking::Low,
            ThinkingLevel::Medium => Thinking::Medium,
            ThinkingLevel::High => Thinking::High,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

/// Parse arguments and run the CLI.
pub async fn run<I, T>(args: I) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let env = Env::load();
    let client = Arc::new(build_client(&env)?);

    match cli.command {
        Some(Command::Models) => models(&client).await,
        None => chat(cli, client).await,
    }
}

/// Register a provider for every configured credential.
fn build_client(env: &Env) -> Result<Client, Error> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(key) = &env.anthropic_key {
        providers.push(Arc::new(Anthropic::new(key)));
    }
    if let Some(key) = &env.openai_key {
        providers.push(Arc::new(OpenAi::new(key)));
    }
    if let Some(key) = &env.gemini_key {
        providers.push(Arc::new(Gemini::new(key)));
    }
    providers.push(Arc::new(Ollama::new(&env.ollama_host)?));
    if lookup_path("claude").is_some() {
        let provider = match &env.claude_code {
            Some(flags) => ClaudeCode::with_flags(flags),
            None => ClaudeCode::new(),
        };
        providers.push(Arc::new(provider));
    }

    Ok(Client::new(providers))
}

async fn models(client: &Client) -> Result<(), Error> {
    for model in client.models().await? {
        println!("{}", model.id);
    }
    Ok(())
}

async fn chat(cli: Cli, client: Arc<Client>) -> Result<(), Error> {
    let mut builder = Agent::builder(client).thinking(cli.thinking.into());
    if let Some(model) = &cli.model {
        builder = builder.model(model);
    }
    if let Some(provider) = &cli.provider {
        builder = builder.provider(provider);
    }
    let agent = builder.build();

    if !cli.prompt.is_empty() {
        return send(&agent, &cli.prompt.join(" "), cli.format).await;
    }

    repl(&agent, cli.format).await
}

/// Send one prompt and render the event stream.
async fn send(agent: &Agent, prompt: &str, format: Format) -> Result<(), Error> {
    match format {
        Format::Text => {
            let stream = agent.chat(prompt);
            futures::pin_mut!(stream);
            let mut stdout = std::io::stdout();
            while let Some(event) = stream.next().await {
                let event = event?;
                if event.done {
                    continue;
                }
                if !event.thinking.is_empty() {
                    let _ = write!(stdout, "\x1b[2m{}\x1b[0m", event.thinking);
                }
                if !event.content.is_empty() {
                    let _ = write!(stdout, "{}", event.content);
                }
                let _ = stdout.flush();
            }
            println!();
        }
        Format::Json => {
            let stream = agent.chat(prompt);
            futures::pin_mut!(stream);
            let mut last = None;
            while let Some(event) = stream.next().await {
                let event = event?;
                if event.done {
                    last = Some(event);
                }
            }
            if let Some(event) = last {
                let out = serde_json::json!({
                    "content": event.content,
                    "thinking": event.thinking,
                    "usage": agent.usage(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
    }
    Ok(())
}

/// Interactive loop. Chat errors print and return to the prompt;
/// `/context` inspects the conversation.
async fn repl(agent: &Agent, format: Format) -> Result<(), Error> {
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        if let Some(command) = input.strip_prefix('/') {
            match command {
                "context" => print!("{}", render_context(agent.usage(), &agent.messages())),
                unknown => eprintln!("llm: unknown command: /{unknown}"),
            }
            continue;
        }

        if let Err(err) = send(agent, input, format).await {
            eprintln!("llm: {err}");
        }
    }
    Ok(())
}

/// Render the `/context` report: a usage summary and one row per message.
fn render_context(usage: Option<Usage>, messages: &[Message]) -> String {
    let mut out = String::new();

    match usage {
        Some(usage) => {
            let _ = writeln!(
                out,
                "tokens: {} in, {} out, {} total",
                usage.input_tokens, usage.output_tokens, usage.total_tokens
            );
        }
        None => {
            let _ = writeln!(out, "tokens: no usage reported yet");
        }
    }

    if messages.is_empty() {
        let _ = writeln!(out, "no messages");
        return out;
    }

    let total_chars: usize = messages.iter().map(message_chars).sum();
    let _ = writeln!(out, "{:>6}  {:>8}  {:<9}  message", "share", "chars", "role");
    for message in messages {
        let chars = message_chars(message);
        let share = if total_chars == 0 {
            0.0
        } else {
            100.0 * chars as f64 / total_chars as f64
        };
        let _ = writeln!(
            out,
            "{share:>5.1}%  {chars:>8}  {:<9}  {}",
            message.role.to_string(),
            snippet(message)
        );
    }

    out
}

fn message_chars(message: &Message) -> usize {
    message.content.chars().count() + message.thinking.chars().count()
}

/// First line of a message, clipped for the table.
fn snippet(message: &Message) -> String {
    const MAX: usize = 60;

    let text = if !message.content.is_empty() {
        message.content.clone()
    } else if let Some(call) = &message.tool_call {
        format!("[tool call: {}]", call.name)
    } else if !message.thinking.is_empty() {
        message.thinking.clone()
    } else {
        String::new()
    };

    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(MAX)
        .collect();
    if text.chars().count() > MAX {
        format!("{flattened}…")
    } else {
        flattened
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCall;

    #[test]
    fn context_without_usage() {
        let report = render_context(None, &[]);
        assert!(report.contains("no usage reported yet"));
        assert!(report.contains("no messages"));
    }

    #[test]
    fn context_table_lists_messages() {
        let messages = vec![
            Message::user("What is 2+2?"),
            Message::assistant("4"),
            Message::assistant("").with_tool_call(ToolCall::new("c1", "add", "{}")),
            Message::tool("c1", "42"),
        ];
        let report = render_context(Some(Usage::new(100, 20)), &messages);
        assert!(report.contains("tokens: 100 in, 20 out, 120 total"));
        assert!(report.contains("user"));
        assert!(report.contains("What is 2+2?"));
        assert!(report.contains("[tool call: add]"));
        assert!(report.contains("tool"));
    }

    #[test]
    fn snippets_are_clipped_and_flattened() {
        let long = "line one\nline two ".repeat(10);
        let message = Message::user(long);
        let clipped = snippet(&message);
        assert!(clipped.chars().count() <= 61);
        assert!(!clipped.contains('\n'));
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn thinking_levels_map() {
        assert_eq!(Thinking::from(ThinkingLevel::None), Thinking::Off);
        assert_eq!(Thinking::from(ThinkingLevel::High), Thinking::High);
    }
}
