//! SSE (Server-Sent Events) streaming for chat completions.
//!
//! Converts the engine's partial-result stream into OpenAI chunk events,
//! followed by the literal `[DONE]` sentinel whether the generation
//! succeeded or ended with an in-band error.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio_stream::StreamExt;

use crate::inference::engine::{PartialStream, Usage};
use crate::metrics::Metrics;
use crate::server::format::format_chunk;

/// Decrements the open-stream gauge when the SSE body is dropped, including
/// on client disconnect.
struct StreamGuard(Arc<Metrics>);

impl StreamGuard {
    fn open(metrics: Arc<Metrics>) -> Self {
        metrics.stream_opened();
        Self(metrics)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.stream_closed();
    }
}

/// Convert a partial-result stream into an SSE stream.
pub fn partials_to_sse_stream(
    partials: PartialStream,
    model: String,
    metrics: Arc<Metrics>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let guard = StreamGuard::open(metrics);
    let mut reported = Usage::default();

    partials
        .map(move |partial| {
            let usage = partial.usage();
            guard.0.record_tokens(
                usage.prompt_tokens().saturating_sub(reported.prompt_tokens()),
                usage
                    .completion_tokens()
                    .saturating_sub(reported.completion_tokens()),
            );
            reported = usage;
            if partial.is_failure() {
                guard.0.record_backend_failure();
            }

            let chunk = format_chunk(&partial, &model);
            let data = serde_json::to_string(&chunk).unwrap_or_default();
            Ok(Event::default().data(data))
        })
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::PartialResult;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test]
    async fn test_done_follows_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(PartialResult::Error {
            message: "API request failed: refused".into(),
            usage: Usage::new(5, 0),
        })
        .await
        .unwrap();
        drop(tx);

        let metrics = Arc::new(Metrics::new().unwrap());
        let events: Vec<_> =
            partials_to_sse_stream(ReceiverStream::new(rx), "llama3".into(), metrics.clone())
                .collect()
                .await;
        assert_eq!(events.len(), 2);

        let text = metrics.render().unwrap();
        assert!(text.contains("gateway_backend_failures_total 1"));
        assert!(text.contains("gateway_active_streams 0"));
    }
}
