// src/worker/scripted.rs
//! Deterministic demo handler
//!
//! The query input is either a plain string (the prompt) or an object of
//! directives:
//!
//! ```json
//! {"prompt": "hello", "chunks": 3, "delay_ms": 20, "fail": "reason",
//!  "crash_after": 1, "ignore_cancel": false, "hang": false}
//! ```
//!
//! - `chunks`: number of `message` events to stream (default 1)
//! - `delay_ms`: pause before each chunk
//! - `fail`: finish with a `scripted_failure` error instead of completing
//! - `crash_after`: exit the process after that many chunks
//! - `hang`: never finish on its own
//! - `ignore_cancel`: keep going after a cancel request

use crate::worker::handler::{EventSink, HandlerError, QueryHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code used for `crash_after`
pub const CRASH_EXIT_CODE: i32 = 101;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Script {
    pub prompt: String,
    pub chunks: u32,
    pub delay_ms: u64,
    pub fail: Option<String>,
    pub crash_after: Option<u32>,
    pub ignore_cancel: bool,
    pub hang: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            chunks: 1,
            delay_ms: 0,
            fail: None,
            crash_after: None,
            ignore_cancel: false,
            hang: false,
        }
    }
}

impl Script {
    pub fn from_input(input: &Value) -> Result<Self, HandlerError> {
        match input {
            Value::String(prompt) => Ok(Self {
                prompt: prompt.clone(),
                ..Default::default()
            }),
            Value::Null => Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(input.clone())
                .map_err(|e| HandlerError::new("invalid_input", e.to_string())),
            other => Err(HandlerError::new(
                "invalid_input",
                format!("expected a string or object, got {}", other),
            )),
        }
    }

    fn chunk_text(&self, index: u32) -> String {
        let words: Vec<&str> = self.prompt.split_whitespace().collect();
        if words.is_empty() {
            format!("chunk {}", index)
        } else {
            words[index as usize % words.len()].to_string()
        }
    }
}

/// Streams scripted chunks; see the module docs for directives
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedHandler;

impl ScriptedHandler {
    pub fn new() -> Self {
        Self
    }

    /// Sleep `delay`, returning early (true) on cancel unless it is ignored
    async fn pause(script: &Script, delay: Duration, cancel: &CancellationToken) -> bool {
        if script.ignore_cancel {
            tokio::time::sleep(delay).await;
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => true,
        }
    }

    fn crash(&self, after: u32) -> ! {
        warn!("Scripted crash after {} chunks", after);
        std::process::exit(CRASH_EXIT_CODE)
    }
}

impl QueryHandler for ScriptedHandler {
    async fn handle(
        &self,
        input: Value,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<Value, HandlerError> {
        let script = Script::from_input(&input)?;
        debug!(
            "Running scripted query {} ({} chunks)",
            sink.request_id(),
            script.chunks
        );

        let delay = Duration::from_millis(script.delay_ms);
        let mut text = Vec::with_capacity(script.chunks as usize);

        for index in 0..script.chunks {
            if script.crash_after == Some(index) {
                self.crash(index);
            }
            if Self::pause(&script, delay, &cancel).await {
                return Err(HandlerError::cancelled());
            }
            let chunk = script.chunk_text(index);
            sink.emit(json!({"index": index, "text": chunk}));
            text.push(chunk);
        }

        if script.crash_after.map_or(false, |n| n >= script.chunks) {
            self.crash(script.chunks);
        }

        if script.hang {
            if script.ignore_cancel {
                std::future::pending::<()>().await;
            }
            cancel.cancelled().await;
            return Err(HandlerError::cancelled());
        }

        if !script.ignore_cancel && cancel.is_cancelled() {
            return Err(HandlerError::cancelled());
        }

        if let Some(reason) = script.fail {
            return Err(HandlerError::new("scripted_failure", reason));
        }

        Ok(json!({
            "chunks": script.chunks,
            "text": text.join(" "),
        }))
    }
}
