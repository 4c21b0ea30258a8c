// src/protocol/mod.rs
//! Pool ⇄ worker wire protocol
//!
//! - **Frame**: typed sum of all messages (`ready`, `query`, `message`,
//!   `cancel`, `complete`, `error`, `healthcheck`, `shutdown`)
//! - **Codec**: newline-delimited JSON framing with cross-read buffering
//!
//! # Wire Format
//!
//! ```text
//! {"type":"query","requestId":"01HV…","payload":{"input":{…},"deadlineMs":60000}}\n
//! {"type":"message","requestId":"01HV…","payload":{…}}\n
//! {"type":"complete","requestId":"01HV…","payload":{"result":{…}}}\n
//! ```

pub mod codec;
pub mod frame;

pub use codec::{Decoded, FrameCodec, FrameError, DEFAULT_MAX_FRAME_BYTES};
pub use frame::{
    CompletePayload, ErrorPayload, Frame, HealthcheckPayload, QueryPayload, ReadyPayload,
    RequestId,
};
