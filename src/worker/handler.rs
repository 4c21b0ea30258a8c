// src/worker/handler.rs
//! Query handler seam
//!
//! The worker runtime owns the transport; a [`QueryHandler`] only sees the
//! query input, an [`EventSink`] for incremental output and a cancellation
//! token.

use crate::protocol::{Frame, RequestId};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Application-level failure, sent to the pool as an `error` frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Acknowledges a `cancel` frame
    pub fn cancelled() -> Self {
        Self::new("cancelled", "query cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == "cancelled"
    }
}

/// Sends `message` frames for one query
#[derive(Debug, Clone)]
pub struct EventSink {
    request_id: RequestId,
    frames: mpsc::UnboundedSender<Frame>,
}

impl EventSink {
    pub(crate) fn new(request_id: RequestId, frames: mpsc::UnboundedSender<Frame>) -> Self {
        Self { request_id, frames }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Queue one incremental event. Returns false once the transport is gone.
    pub fn emit(&self, payload: Value) -> bool {
        self.frames
            .send(Frame::message(self.request_id.clone(), payload))
            .is_ok()
    }
}

/// Work performed by a worker for one query
pub trait QueryHandler: Send + Sync + 'static {
    /// Run one query to completion.
    ///
    /// `cancel` fires when the pool sends `cancel`; a cooperative handler
    /// returns promptly (conventionally [`HandlerError::cancelled`]).
    fn handle(
        &self,
        input: Value,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sink_wraps_message_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(RequestId::from("r1"), tx);
        assert!(sink.emit(json!({"n": 1})));

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, Frame::message(RequestId::from("r1"), json!({"n": 1})));

        drop(rx);
        assert!(!sink.emit(json!({"n": 2})));
    }

    #[test]
    fn test_cancelled_error() {
        let err = HandlerError::cancelled();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "[cancelled] query cancelled");
        assert!(!HandlerError::new("boom", "x").is_cancelled());
    }
}
