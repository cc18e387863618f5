//! The provider adapter contract.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::client::Error;
use crate::model::{ChatRequest, ChatResponse, Model};

/// A lazy, finite, non-restartable stream of canonical chat deltas.
///
/// The stream performs no work until polled. An `Err` item terminates it;
/// otherwise the last item satisfies `done = true`. Dropping the stream
/// cancels the underlying request (HTTP connection aborted, subprocess
/// killed). A stream is single-consumer; it must not be polled from two
/// places.
pub type ChatStream<'a> = Pin<Box<dyn Stream<Item = Result<ChatResponse, Error>> + Send + 'a>>;

/// A chat model back-end.
///
/// Implementations translate their provider-specific wire protocol into
/// canonical [`ChatResponse`] deltas:
///
/// - text output becomes content deltas,
/// - reasoning output becomes thinking deltas,
/// - tool-use blocks are buffered until complete and emitted as a single
///   tool-call event whose arguments are valid JSON (malformed argument
///   fragments are replaced with `{}` and logged),
/// - token counts become usage events (latest values win),
/// - normal termination emits `done = true`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable short identifier, e.g. `"anthropic"`.
    fn name(&self) -> &'static str;

    /// List available models. Memoized on first success; failures are not
    /// cached.
    async fn models(&self) -> Result<Vec<Model>, Error>;

    /// Open a chat stream. An empty model id yields an immediate error
    /// event for providers that require one.
    fn chat(&self, req: ChatRequest) -> ChatStream<'_>;
}
