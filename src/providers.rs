//! Provider adapters.
//!
//! Each adapter translates one wire protocol into the canonical
//! [`crate::model::ChatResponse`] stream:
//!
//! - [`openai`]: Responses API event stream
//! - [`anthropic`]: Messages SSE stream
//! - [`gemini`]: `streamGenerateContent` SSE stream
//! - [`ollama`]: native JSON-lines over HTTP
//! - [`claudecode`]: `claude` CLI subprocess emitting JSON lines

pub mod anthropic;
pub mod claudecode;
pub mod gemini;
pub mod ollama;
pub mod openai;

/// Validate assembled tool-call arguments, substituting `{}` for anything
/// that does not parse as JSON. Providers stream arguments in fragments;
/// whatever they add up to must be valid JSON before the call is surfaced.
pub(crate) fn normalize_arguments(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        trimmed.to_string()
    } else {
        tracing::warn!(raw = %trimmed, "discarding malformed tool arguments");
        "{}".to_string()
    }
}
