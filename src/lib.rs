//! # llmkit - Streaming Agent Harness
//!
//! A small, pragmatic Rust library (plus `llm` CLI) that drives large
//! language models through a recursive tool-use loop across multiple
//! provider back-ends.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Provider-agnostic trait-based design
//! - Streaming everywhere: every provider yields one canonical delta type
//! - Typed tools with builder-generated JSON schemas
//! - Parallel tool dispatch with stable result ordering
//! - Sandboxed command execution (local, container, ssh)
//!
//! ## Architecture
//!
//! A [`client::Client`] holds a registry of [`provider::Provider`]s. Each
//! provider translates its wire protocol into a stream of canonical
//! [`model::ChatResponse`] deltas. The [`agent::Agent`] consumes that
//! stream, dispatches tool calls through the [`tool`] catalog (running
//! independent calls in parallel on a [`batch::Batch`]), feeds results back
//! into the conversation, and yields [`agent::Event`]s until the model
//! finishes a turn without calling a tool.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use llmkit::agent::Agent;
//! use llmkit::client::Client;
//! use llmkit::provider::Provider;
//! use llmkit::providers::anthropic::Anthropic;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(Client::new(vec![
//!         Arc::new(Anthropic::new("sk-ant-...")) as Arc<dyn Provider>,
//!     ]));
//!     let agent = Agent::builder(client)
//!         .model("claude-haiku-4-5")
//!         .build();
//!
//!     let stream = agent.chat("What is the capital of France?");
//!     futures::pin_mut!(stream);
//!     while let Some(event) = stream.next().await {
//!         print!("{}", event?.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod client;
pub mod env;
pub mod http;
pub mod model;
pub mod provider;
pub mod providers;
pub mod sandbox;
pub mod tool;
pub mod tools;
mod wire;

// Re-exports for convenience
pub use agent::{Agent, Event};
pub use client::{Client, Error};
pub use model::{ChatRequest, ChatResponse, Message, Model, Role, Thinking, ToolCall, Usage};
pub use provider::{ChatStream, Provider};
pub use tool::{func, Parameters, Property, Tool, ToolSchema};
