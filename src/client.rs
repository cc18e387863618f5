//! Provider registry and crate-wide error type.

use std::sync::Arc;

use async_stream::try_stream;
use futures::future::try_join_all;
use thiserror::Error;

use crate::model::{ChatRequest, Model};
use crate::provider::{ChatStream, Provider};

/// Errors that can occur anywhere in the harness.
#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unknown tool {0:?}")]
    UnknownTool(String),

    #[error("tool {tool}: invalid arguments: {message}")]
    ToolArguments { tool: String, message: String },

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("command exited with code {code}")]
    CommandExit { code: i32, stderr: String },

    #[error("cancelled")]
    Cancelled,
}

/// Registry of providers keyed by name.
///
/// The provider list is read-only after construction; model lists are
/// memoized inside each provider.
pub struct Client {
    providers: Vec<Arc<dyn Provider>>,
}

impl Client {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// All available models from all providers, sorted by provider then id.
    ///
    /// Listings run in parallel; the first failure aborts the whole call.
    pub async fn models(&self) -> Result<Vec<Model>, Error> {
        let listings = try_join_all(self.providers.iter().map(|p| p.models())).await?;
        let mut models: Vec<Model> = listings.into_iter().flatten().collect();
        models.sort_by(|a, b| (&a.provider, &a.id).cmp(&(&b.provider, &b.id)));
        Ok(models)
    }

    /// Dispatch a chat request.
    ///
    /// With a provider name the request goes straight to that provider.
    /// Without one, the model id is resolved against the union of all model
    /// lists (falling back to the first available model when the id is
    /// unknown or empty) and the request is routed to the owning provider.
    pub fn chat<'a>(&'a self, provider: Option<&str>, mut req: ChatRequest) -> ChatStream<'a> {
        let provider = provider.map(str::to_owned);
        Box::pin(try_stream! {
            let provider = match provider {
                Some(name) => self
                    .provider(&name)
                    .ok_or_else(|| Error::Config(format!("provider {name:?} not found")))?,
                None => {
                    let models = self.models().await.map_err(|err| {
                        Error::Config(format!("unable to list models: {err}"))
                    })?;
                    let model = find_model(&models, &req.model)
                        .ok_or_else(|| Error::Config(format!("model {:?} not found", req.model)))?;
                    req.model = model.id.clone();
                    self.provider(&model.provider).ok_or_else(|| {
                        Error::Config(format!("provider {:?} not found", model.provider))
                    })?
                }
            };

            let stream = provider.chat(req);
            futures::pin_mut!(stream);
            use futures::StreamExt;
            while let Some(response) = stream.next().await {
                yield response?;
            }
        })
    }
}

/// Find a model by id, falling back to the first available one.
fn find_model<'a>(models: &'a [Model], id: &str) -> Option<&'a Model> {
    models.iter().find(|m| m.id == id).or_else(|| models.first())
}
