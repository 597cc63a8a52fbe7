//! Chat-completion SSE stream → text fragments.

use futures::future;
use futures::stream::{Stream, StreamExt};

use super::errors::InferenceError;
use super::types::ChatCompletionChunk;
use crate::sse::event_stream;

/// Turn a streaming chat-completion response into its content fragments.
///
/// Ends at `[DONE]` or when the body ends. Chunks that carry no content
/// (role headers, reasoning tokens, keep-alives) are dropped; a chunk that
/// is not valid JSON is logged and skipped.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, InferenceError>> {
    content_stream(event_stream(response.bytes_stream()))
}

pub(crate) fn content_stream<S>(events: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<crate::sse::SseEvent, String>>,
{
    events
        .take_while(|item| {
            let done = matches!(item, Ok(event) if event.data.trim() == "[DONE]");
            future::ready(!done)
        })
        .filter_map(|item| {
            future::ready(match item {
                Ok(event) => content_of(&event.data).map(Ok),
                Err(reason) => Some(Err(InferenceError::StreamError { reason })),
            })
        })
}

/// Text content of one `data:` payload, if any.
fn content_of(data: &str) -> Option<String> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            tracing::warn!(error = %e, chunk = data, "skipping malformed completion chunk");
            None
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::SseEvent;
    use futures::stream;

    fn data(payload: &str) -> Result<SseEvent, String> {
        Ok(SseEvent {
            event: None,
            data: payload.to_string(),
        })
    }

    #[tokio::test]
    async fn test_content_fragments_until_done() {
        let events = stream::iter(vec![
            data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            data("not json"),
            data(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#),
            data("[DONE]"),
            data(r#"{"choices":[{"delta":{"content":"ignored"}}]}"#),
        ]);

        let fragments: Vec<String> = content_stream(events)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_read_error_surfaces() {
        let events = stream::iter(vec![
            data(r#"{"choices":[{"delta":{"content":"partial"}}]}"#),
            Err("connection reset".to_string()),
        ]);
        let items: Vec<_> = content_stream(events).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(InferenceError::StreamError { .. })));
    }
}
