// src/runtime/session.rs
//! Query sessions
//!
//! A [`QuerySession`] is the caller's end of one dispatched query: zero or
//! more `Message` events followed by exactly one terminal event
//! (`Complete` or `Failed`). After [`QuerySession::cancel`] the caller sees no
//! further events; [`QuerySession::cancel_outcome`] reports whether the worker
//! acknowledged or had to be killed.

use crate::protocol::RequestId;
use crate::runtime::supervisor::{CancelOutcome, LinkEvent, WorkerLink};
use crate::runtime::worker_handle::{HandleId, WorkspaceKey};
use crate::utils::errors::{PoolError, QueryFailure};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// A query to run on a workspace's worker
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Request body forwarded verbatim to the worker
    pub input: Value,

    /// Overrides the pool's default query timeout
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One event observed by the session owner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Message(Value),
    Complete(Value),
    Failed(
        #[serde(serialize_with = "serialize_failure")] QueryFailure,
    ),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Message(_))
    }
}

fn serialize_failure<S: serde::Serializer>(
    failure: &QueryFailure,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(2))?;
    map.serialize_entry("kind", failure.kind())?;
    map.serialize_entry("message", &failure.to_string())?;
    map.end()
}

/// Where the session's cancellation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    NotRequested,
    /// Cancel sent, waiting for the worker
    Requested,
    Acked,
    ForceKilled,
}

impl From<CancelOutcome> for CancelState {
    fn from(outcome: CancelOutcome) -> Self {
        match outcome {
            CancelOutcome::Acked => CancelState::Acked,
            CancelOutcome::ForceKilled => CancelState::ForceKilled,
        }
    }
}

/// Caller's end of a dispatched query
#[derive(Debug)]
pub struct QuerySession {
    request_id: RequestId,
    handle_id: HandleId,
    workspace: WorkspaceKey,
    link: WorkerLink,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    finished: bool,
    cancel: CancelState,
}

impl QuerySession {
    pub(crate) fn new(
        request_id: RequestId,
        workspace: WorkspaceKey,
        link: WorkerLink,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            request_id,
            handle_id: link.handle_id(),
            workspace,
            link,
            events,
            finished: false,
            cancel: CancelState::NotRequested,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn workspace(&self) -> &WorkspaceKey {
        &self.workspace
    }

    pub fn cancel_state(&self) -> CancelState {
        self.cancel
    }

    /// A terminal event has been observed (or the session was cancelled and resolved)
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event, or `None` once the session has ended or was cancelled
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.finished || self.cancel != CancelState::NotRequested {
            return None;
        }

        match self.events.recv().await {
            Some(LinkEvent::Message(payload)) => Some(SessionEvent::Message(payload)),
            Some(LinkEvent::Finished { result, cancel }) => {
                self.finished = true;
                if let Some(outcome) = cancel {
                    self.cancel = outcome.into();
                }
                Some(match result {
                    Ok(value) => SessionEvent::Complete(value),
                    Err(failure) => SessionEvent::Failed(failure),
                })
            }
            None => {
                self.finished = true;
                Some(SessionEvent::Failed(QueryFailure::WorkerCrashed {
                    reason: "supervisor stopped without a result".to_string(),
                }))
            }
        }
    }

    /// Ask the worker to stop. No further events are delivered.
    pub fn cancel(&mut self) {
        if self.finished || self.cancel != CancelState::NotRequested {
            return;
        }
        self.cancel = CancelState::Requested;
        self.link.cancel(&self.request_id);
    }

    /// Wait until a requested cancel is resolved.
    ///
    /// Returns [`CancelState::NotRequested`] if `cancel` was never called.
    pub async fn cancel_outcome(&mut self) -> CancelState {
        if self.cancel != CancelState::Requested {
            return self.cancel;
        }

        loop {
            match self.events.recv().await {
                Some(LinkEvent::Message(_)) => continue,
                Some(LinkEvent::Finished { cancel, .. }) => {
                    self.finished = true;
                    // Finished before the cancel reached the worker
                    self.cancel = cancel.map_or(CancelState::Acked, CancelState::from);
                    return self.cancel;
                }
                None => {
                    self.finished = true;
                    self.cancel = CancelState::ForceKilled;
                    return self.cancel;
                }
            }
        }
    }

    /// Consume the session as a stream of events
    pub fn events(self) -> impl Stream<Item = SessionEvent> {
        futures::stream::unfold(self, |mut session| async move {
            session.next_event().await.map(|event| (event, session))
        })
    }

    /// Drain the session, collecting messages and the terminal result
    pub async fn collect(mut self) -> (Vec<Value>, Result<Value, QueryFailure>) {
        let mut messages = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                SessionEvent::Message(payload) => messages.push(payload),
                SessionEvent::Complete(value) => return (messages, Ok(value)),
                SessionEvent::Failed(failure) => return (messages, Err(failure)),
            }
        }
        (messages, Err(QueryFailure::Cancelled))
    }

    /// Drain the session and keep only its outcome, failures as [`PoolError`]
    pub async fn result(self) -> std::result::Result<Value, PoolError> {
        let handle_id = self.handle_id().to_string();
        let (_, result) = self.collect().await;
        result.map_err(|failure| failure.into_error(&handle_id))
    }
}

impl Drop for QuerySession {
    fn drop(&mut self) {
        // An abandoned session must not pin its worker
        if !self.finished && self.cancel == CancelState::NotRequested {
            self.link.cancel(&self.request_id);
        }
    }
}
