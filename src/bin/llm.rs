use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = llmkit::cli::run(std::env::args()).await {
        eprintln!("llm: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
