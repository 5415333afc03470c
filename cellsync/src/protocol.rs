//! Cell-to-cell wire protocol.
//!
//! Both cells exchange a stream of [`Signal`]s. Every request-class signal
//! is answered by exactly one `SUCCESS(key)` or `FAILURE(key, report)`
//! carrying the key of the request it completes.
//!
//! # Wire Format
//!
//! Each signal is one frame with an 8-byte little-endian header followed by
//! a JSON payload:
//!
//! ```text
//! ┌──────────┬────────────┬─────────┬──────────────────┬─────────────────┐
//! │ Magic(1) │ Version(1) │ Key(2)  │ Payload len (4)  │ JSON payload    │
//! └──────────┴────────────┴─────────┴──────────────────┴─────────────────┘
//! ```
//!
//! Kinds without data (`START`, `RESTART`, ...) carry an empty payload.

pub mod codec;
pub mod failure;
pub mod signal;

pub use codec::{CodecError, FrameDecoder, decode_signal, encode_signal};
pub use failure::{ErrorCategory, FailureReport, codes};
pub use signal::{Completion, MeasureMode, MeasurementId, Outcome, PlanRef, Signal, SignalKey};
