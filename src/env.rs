//! Environment configuration for provider credentials.

use std::path::PathBuf;

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Snapshot of the environment variables the harness reads at startup.
#[derive(Debug, Clone)]
pub struct Env {
    pub anthropic_key: Option<String>,
    pub openai_key: Option<String>,
    pub gemini_key: Option<String>,
    pub ollama_host: String,
    /// Extra CLI flags for the claudecode subprocess provider,
    /// e.g. `--permission-mode plan --add-dir /tmp`.
    pub claude_code: Option<String>,
}

impl Env {
    pub fn load() -> Self {
        Self {
            anthropic_key: var("ANTHROPIC_API_KEY"),
            openai_key: var("OPENAI_API_KEY"),
            gemini_key: var("GEMINI_API_KEY"),
            ollama_host: var("OLLAMA_HOST").unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string()),
            claude_code: var("CLAUDE_CODE"),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Find an executable on PATH, like `exec.LookPath`.
pub(crate) fn lookup_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
