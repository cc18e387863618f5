//! Decoding of streamed provider responses.
//!
//! Provider endpoints stream either server-sent events (`data: {json}`
//! records) or newline-delimited JSON documents. [`WireDecoder`] buffers
//! the response body, applies the frame rule, and deserializes each
//! payload directly into the adapter's wire event type, so the adapters
//! never see raw bytes.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::client::Error;

type Body = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// How payloads are framed within the byte stream.
enum Framing {
    /// Server-sent events: payloads arrive on `data:` lines, a `[DONE]`
    /// marker ends the stream, all other fields (`event:`, `id:`,
    /// comments) are skipped.
    Sse,
    /// Every non-empty line is one JSON document.
    JsonLines,
}

/// Pull-based decoder over a streaming response body.
pub(crate) struct WireDecoder {
    provider: &'static str,
    framing: Framing,
    body: Body,
    buffer: Vec<u8>,
    eof: bool,
    finished: bool,
}

impl WireDecoder {
    pub(crate) fn sse(provider: &'static str, response: reqwest::Response) -> Self {
        Self::with_body(provider, Framing::Sse, Box::pin(response.bytes_stream()))
    }

    pub(crate) fn json_lines(provider: &'static str, response: reqwest::Response) -> Self {
        Self::with_body(provider, Framing::JsonLines, Box::pin(response.bytes_stream()))
    }

    fn with_body(provider: &'static str, framing: Framing, body: Body) -> Self {
        Self {
            provider,
            framing,
            body,
            buffer: Vec::new(),
            eof: false,
            finished: false,
        }
    }

    /// The next deserialized event, or `None` once the stream is over.
    pub(crate) async fn event<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Error> {
        match self.payload().await? {
            Some(payload) => serde_json::from_str(&payload).map(Some).map_err(|err| {
                Error::Provider(format!("{}: parsing event: {err}", self.provider))
            }),
            None => Ok(None),
        }
    }

    /// The next framed payload.
    async fn payload(&mut self) -> Result<Option<String>, Error> {
        loop {
            if self.finished {
                return Ok(None);
            }

            // Drain whole lines already buffered.
            while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                if let Some(payload) = self.accept(&line) {
                    return Ok(Some(payload));
                }
                if self.finished {
                    return Ok(None);
                }
            }

            if self.eof {
                // Salvage a final line that arrived without a newline.
                let rest = std::mem::take(&mut self.buffer);
                return Ok(self.accept(&rest));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Err(err.into()),
                None => self.eof = true,
            }
        }
    }

    /// Apply the frame rule to one line, updating termination state.
    fn accept(&mut self, line: &[u8]) -> Option<String> {
        let line = std::str::from_utf8(line).ok()?.trim();
        if line.is_empty() {
            return None;
        }
        match self.framing {
            Framing::Sse => {
                let data = line.strip_prefix("data:")?.trim();
                if data == "[DONE]" {
                    self.finished = true;
                    return None;
                }
                Some(data.to_string())
            }
            Framing::JsonLines => Some(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn decoder(framing: Framing, chunks: &[&'static str]) -> WireDecoder {
        let body: Body = Box::pin(futures::stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        ));
        WireDecoder::with_body("test", framing, body)
    }

    async fn all_events(mut decoder: WireDecoder) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = decoder.event::<Value>().await.expect("decodes") {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn sse_reassembles_records_split_across_chunks() {
        let decoder = decoder(
            Framing::Sse,
            &["data: {\"a\":", "1}\n\ndata:", " {\"a\":2}\n"],
        );
        let events = all_events(decoder).await;
        assert_eq!(events, vec![serde_json::json!({"a":1}), serde_json::json!({"a":2})]);
    }

    #[tokio::test]
    async fn sse_skips_other_fields_and_comments() {
        let decoder = decoder(
            Framing::Sse,
            &["event: message_start\nid: 7\n: keepalive\ndata: {\"a\":1}\n"],
        );
        let events = all_events(decoder).await;
        assert_eq!(events, vec![serde_json::json!({"a":1})]);
    }

    #[tokio::test]
    async fn sse_stops_at_done_marker() {
        let decoder = decoder(
            Framing::Sse,
            &["data: {\"a\":1}\ndata: [DONE]\ndata: {\"a\":2}\n"],
        );
        let events = all_events(decoder).await;
        assert_eq!(events, vec![serde_json::json!({"a":1})]);
    }

    #[tokio::test]
    async fn sse_salvages_final_line_without_newline() {
        let decoder = decoder(Framing::Sse, &["data: {\"a\":1}"]);
        let events = all_events(decoder).await;
        assert_eq!(events, vec![serde_json::json!({"a":1})]);
    }

    #[tokio::test]
    async fn json_lines_split_multiple_documents_per_chunk() {
        let decoder = decoder(Framing::JsonLines, &["{\"a\":1}\n{\"a\":2}\n", "{\"a\":3}"]);
        let events = all_events(decoder).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], serde_json::json!({"a":3}));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_provider_error() {
        let mut decoder = decoder(Framing::Sse, &["data: not json\n"]);
        let err = decoder.event::<Value>().await.expect_err("fails");
        assert!(err.to_string().contains("parsing event"));
    }

    #[tokio::test]
    async fn exhausted_decoder_keeps_returning_none() {
        let mut decoder = decoder(Framing::JsonLines, &["{\"a\":1}\n"]);
        assert!(decoder.event::<Value>().await.expect("decodes").is_some());
        assert!(decoder.event::<Value>().await.expect("decodes").is_none());
        assert!(decoder.event::<Value>().await.expect("decodes").is_none());
    }
}
