//! Bridge between a worker thread running a session and the async handler.
//!
//! The worker pushes [`SessionEvent`]s into a bounded tokio channel with
//! `blocking_send`. When the receiving side is dropped (the client went
//! away) the next send fails, the sink reports it, and generation stops
//! within one decode step.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use slotserve_core::backend::{InferenceBackend, TokenId};
use slotserve_core::request::CancelToken;
use slotserve_core::worker::{SessionError, SessionOutcome, SessionSink};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::ApiError;
use super::types::CompletionChunk;

/// Capacity of the per-request event channel.
pub(crate) const EVENT_BUFFER: usize = 64;

#[derive(Debug)]
pub enum SessionEvent {
    Token { token: TokenId, piece: String },
    Finished(Result<SessionOutcome, SessionError>),
}

/// Forwards session output from a worker thread into a channel.
pub struct ChannelSink<B: InferenceBackend> {
    backend: Arc<B>,
    tx: mpsc::Sender<SessionEvent>,
}

impl<B: InferenceBackend> ChannelSink<B> {
    pub fn new(backend: Arc<B>, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { backend, tx }
    }
}

impl<B: InferenceBackend> SessionSink for ChannelSink<B> {
    fn on_token(&mut self, token: TokenId) -> bool {
        let piece = self.backend.detokenize(token).unwrap_or_else(|e| {
            tracing::warn!(token, error = %e, "failed to detokenize");
            String::new()
        });
        self.tx
            .blocking_send(SessionEvent::Token { token, piece })
            .is_ok()
    }

    fn on_finish(&mut self, result: Result<SessionOutcome, SessionError>) {
        if self.tx.blocking_send(SessionEvent::Finished(result)).is_err() {
            tracing::debug!("client gone before session finished");
        }
    }
}

/// Cancels the session when dropped. Held by the response so that a
/// disconnect stops generation even before the next token is sent.
pub(crate) struct CancelOnDrop(pub(crate) CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn token_chunk(token: TokenId, piece: String) -> CompletionChunk {
    CompletionChunk {
        content: piece,
        token: Some(token),
        stop: false,
        stop_reason: None,
        slot_id: None,
        tokens_evaluated: None,
        tokens_cached: None,
        tokens_predicted: None,
    }
}

fn final_chunk(outcome: &SessionOutcome) -> CompletionChunk {
    CompletionChunk {
        content: String::new(),
        token: None,
        stop: true,
        stop_reason: Some(outcome.finish_reason.as_str()),
        slot_id: Some(outcome.slot_id),
        tokens_evaluated: Some(outcome.prompt_tokens),
        tokens_cached: Some(outcome.reused_tokens),
        tokens_predicted: Some(outcome.generated.len()),
    }
}

fn to_sse_event(event: SessionEvent) -> Event {
    let data = match event {
        SessionEvent::Token { token, piece } => serde_json::to_string(&token_chunk(token, piece)),
        SessionEvent::Finished(Ok(outcome)) => serde_json::to_string(&final_chunk(&outcome)),
        SessionEvent::Finished(Err(e)) => {
            tracing::warn!(error = %e, "streamed session failed");
            let body = ApiError::from(e).body();
            return Event::default()
                .event("error")
                .data(serde_json::to_string(&body).unwrap_or_default());
        }
    };
    Event::default().data(data.unwrap_or_default())
}

/// SSE stream of a running session. `first` is the event already taken off
/// `rx` by the caller; `guard` cancels the session once the stream drops.
pub(crate) fn completion_sse_stream(
    first: SessionEvent,
    rx: mpsc::Receiver<SessionEvent>,
    guard: CancelOnDrop,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::once(async move { first })
        .chain(ReceiverStream::new(rx))
        .map(move |event| {
            let _ = &guard;
            Ok(to_sse_event(event))
        });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotserve_core::request::FinishReason;
    use slotserve_core::testing::MockBackend;

    #[test]
    fn sink_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(Arc::new(MockBackend::new()), tx);
        assert!(sink.on_token(104));
        drop(rx);
        assert!(!sink.on_token(105));
        // Finishing after disconnect is not an error.
        sink.on_finish(Err(SessionError::ShuttingDown));
    }

    #[test]
    fn sink_sends_detokenized_pieces() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink::new(Arc::new(MockBackend::new()), tx);
        sink.on_token(104);
        match rx.try_recv().unwrap() {
            SessionEvent::Token { token, piece } => {
                assert_eq!(token, 104);
                assert_eq!(piece, "h");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn dropping_guard_cancels() {
        let cancel = CancelToken::new();
        drop(CancelOnDrop(cancel.clone()));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn final_chunk_carries_stats() {
        let outcome = SessionOutcome {
            slot_id: 1,
            prompt_tokens: 10,
            reused_tokens: 6,
            generated: vec![1, 2, 3],
            finish_reason: FinishReason::Length,
        };
        let json = serde_json::to_value(final_chunk(&outcome)).unwrap();
        assert_eq!(json["stop"], true);
        assert_eq!(json["stop_reason"], "length");
        assert_eq!(json["tokens_cached"], 6);
        assert_eq!(json["tokens_predicted"], 3);
    }
}
