// src/protocol/frame.rs
//! Wire frames exchanged between the pool and a worker
//!
//! Every frame is one JSON object with a `type` discriminant, an optional
//! `requestId` (query-scoped frames only) and a type-specific `payload`.
//! Unknown fields are ignored; unknown `type` values decode to
//! [`Frame::Unknown`] so a newer worker cannot break an older pool.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use ulid::Ulid;

/// Correlates a `query` with its `message`/`complete`/`error` frames
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh, unique request id
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity a worker declares in its `ready` frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    #[serde(default)]
    pub pid: u32,

    #[serde(default)]
    pub uid: u32,

    #[serde(default)]
    pub gid: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Worker build version, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Body of a `query` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    /// Caller-supplied request body, opaque to the pool
    #[serde(default)]
    pub input: Value,

    /// Time budget the pool grants this query
    #[serde(default, rename = "deadlineMs", skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// Body of a `complete` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    #[serde(default)]
    pub result: Value,
}

/// Body of an `error` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default = "default_error_code")]
    pub code: String,

    #[serde(default)]
    pub message: String,
}

fn default_error_code() -> String {
    "error".to_string()
}

/// Body of a `healthcheck` probe or reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckPayload {
    #[serde(default)]
    pub seq: u64,
}

/// One protocol message, either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Worker finished bootstrapping and accepts queries
    Ready {
        #[serde(default)]
        payload: ReadyPayload,
    },

    /// Pool asks the worker to run one query
    Query {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        payload: QueryPayload,
    },

    /// Incremental event for a running query
    Message {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        payload: Value,
    },

    /// Pool asks the worker to stop a query
    Cancel {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },

    /// Query finished successfully
    Complete {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        payload: CompletePayload,
    },

    /// Query (or, without `requestId`, the worker) failed
    Error {
        #[serde(
            rename = "requestId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        request_id: Option<RequestId>,
        payload: ErrorPayload,
    },

    /// Liveness probe; the worker echoes it back
    Healthcheck {
        #[serde(default)]
        payload: HealthcheckPayload,
    },

    /// Pool asks the worker to exit
    Shutdown,

    /// Any `type` this build does not know
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn ready(payload: ReadyPayload) -> Self {
        Frame::Ready { payload }
    }

    pub fn query(request_id: RequestId, input: Value, deadline_ms: Option<u64>) -> Self {
        Frame::Query {
            request_id,
            payload: QueryPayload { input, deadline_ms },
        }
    }

    pub fn message(request_id: RequestId, payload: Value) -> Self {
        Frame::Message {
            request_id,
            payload,
        }
    }

    pub fn cancel(request_id: RequestId) -> Self {
        Frame::Cancel { request_id }
    }

    pub fn complete(request_id: RequestId, result: Value) -> Self {
        Frame::Complete {
            request_id,
            payload: CompletePayload { result },
        }
    }

    pub fn error(
        request_id: Option<RequestId>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Frame::Error {
            request_id,
            payload: ErrorPayload {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn healthcheck(seq: u64) -> Self {
        Frame::Healthcheck {
            payload: HealthcheckPayload { seq },
        }
    }

    /// Request id for query-scoped frames
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Frame::Query { request_id, .. }
            | Frame::Message { request_id, .. }
            | Frame::Cancel { request_id }
            | Frame::Complete { request_id, .. } => Some(request_id),
            Frame::Error { request_id, .. } => request_id.as_ref(),
            Frame::Ready { .. } | Frame::Healthcheck { .. } | Frame::Shutdown | Frame::Unknown => {
                None
            }
        }
    }

    /// `complete` and `error` end a query's event stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Complete { .. } | Frame::Error { .. })
    }

    /// Wire name of the frame type
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Ready { .. } => "ready",
            Frame::Query { .. } => "query",
            Frame::Message { .. } => "message",
            Frame::Cancel { .. } => "cancel",
            Frame::Complete { .. } => "complete",
            Frame::Error { .. } => "error",
            Frame::Healthcheck { .. } => "healthcheck",
            Frame::Shutdown => "shutdown",
            Frame::Unknown => "unknown",
        }
    }
}
