// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-producer / single-consumer event stream with terminal closure.
//!
//! The producer half pushes events and finishes exactly once with a final
//! result; the consumer half pulls events lazily and extracts the result
//! after the stream completes.  The buffer is unbounded — producers never
//! block, consumers are expected to drain promptly.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    /// The caller's cancel signal fired.
    #[error("aborted: {0}")]
    Aborted(String),
    /// The stream terminated with an error event.
    #[error("{0}")]
    Failed(String),
    /// The producer went away without calling `end`.
    #[error("stream ended without a result")]
    NoResult,
}

/// Producer half.  Dropping the sink without calling [`EventSink::end`]
/// resolves the consumer's `result()` with [`StreamError::NoResult`].
pub struct EventSink<E, R> {
    tx: Option<mpsc::UnboundedSender<E>>,
    result_tx: Option<oneshot::Sender<Result<R, StreamError>>>,
}

impl<E, R> EventSink<E, R> {
    /// Push one event.  Silently discarded once the stream has ended or the
    /// consumer is gone.
    pub fn push(&self, event: E) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Close the stream with its final result.  The first call wins;
    /// subsequent calls (and subsequent pushes) are discarded.
    pub fn end(&mut self, result: Result<R, StreamError>) {
        if let Some(result_tx) = self.result_tx.take() {
            let _ = result_tx.send(result);
        }
        // Dropping the sender closes the event channel so the consumer's
        // `next()` returns `None` after the buffered events drain.
        self.tx = None;
    }

    pub fn is_ended(&self) -> bool {
        self.result_tx.is_none()
    }
}

/// Consumer half.
pub struct EventStream<E, R> {
    rx: mpsc::UnboundedReceiver<E>,
    result_rx: Option<oneshot::Receiver<Result<R, StreamError>>>,
    resolved: Option<Result<R, StreamError>>,
}

impl<E, R: Clone> EventStream<E, R> {
    /// Create a connected sink/stream pair.
    pub fn channel() -> (EventSink<E, R>, EventStream<E, R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        (
            EventSink {
                tx: Some(tx),
                result_tx: Some(result_tx),
            },
            EventStream {
                rx,
                result_rx: Some(result_rx),
                resolved: None,
            },
        )
    }

    /// Next event, or `None` once the stream has ended and the buffer is
    /// drained.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Drain any remaining events and return the final result.  Idempotent:
    /// the first resolution is cached and repeated calls return it again.
    pub async fn result(&mut self) -> Result<R, StreamError> {
        if let Some(resolved) = &self.resolved {
            return resolved.clone();
        }
        while self.rx.recv().await.is_some() {}
        let outcome = match self.result_rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(StreamError::NoResult)),
            None => Err(StreamError::NoResult),
        };
        self.resolved = Some(outcome.clone());
        outcome
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
