//! Top-level error taxonomy.
//!
//! Operator cancellation is [`CellError::Cancelled`], never a fault. Every
//! other terminal error can be reduced to a numeric code plus message via
//! [`CellError::code`] and [`CellError::report`], which is also what crosses
//! the link in a `FAILURE` signal.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::link::LinkError;
use crate::protocol::{CodecError, ErrorCategory, FailureReport, codes};
use crate::wait::WaitError;

/// Violations of the cell protocol. Fatal to the pairing session only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Unmatched(#[from] LedgerError),
    #[error("peer did not complete the handshake")]
    HandshakeTimeout,
    #[error("peer did not answer the alive probe within {0:?}")]
    AliveTimeout(Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ProtocolError {
    pub const fn code(&self) -> u32 {
        match self {
            ProtocolError::Unmatched(_) | ProtocolError::Codec(_) => codes::PROTOCOL_DESYNC,
            ProtocolError::HandshakeTimeout => codes::HANDSHAKE_TIMEOUT,
            ProtocolError::AliveTimeout(_) => codes::ALIVE_TIMEOUT,
        }
    }
}

/// A failure with a code meaningful to downstream automation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: u32,
    pub message: String,
}

impl Fault {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub const fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(self.code)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<FailureReport> for Fault {
    fn from(report: FailureReport) -> Self {
        Self {
            code: report.code,
            message: report.text,
        }
    }
}

impl From<Fault> for FailureReport {
    fn from(fault: Fault) -> Self {
        FailureReport::new(fault.code, fault.message)
    }
}

#[derive(Debug, Error)]
pub enum CellError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] LinkError),
    #[error("{0}")]
    Fault(#[from] Fault),
    #[error("cancelled by operator")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CellError {
    pub fn fault(code: u32, message: impl Into<String>) -> Self {
        CellError::Fault(Fault::new(code, message))
    }

    pub fn code(&self) -> u32 {
        match self {
            CellError::Protocol(e) => e.code(),
            CellError::Transport(_) => codes::LINK_LOST,
            CellError::Fault(f) => f.code,
            CellError::Cancelled => codes::OPERATOR_CANCELLED,
            CellError::Config(_) => codes::UNSPECIFIED,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(self.code())
    }

    /// Code and message as sent to the peer.
    pub fn report(&self) -> FailureReport {
        match self {
            CellError::Fault(f) => f.clone().into(),
            other => FailureReport::new(other.code(), other.to_string()),
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, CellError::Cancelled)
    }
}

impl From<WaitError> for CellError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Cancelled => CellError::Cancelled,
            WaitError::TimedOut(_) => CellError::fault(codes::PHASE_TIMEOUT, e.to_string()),
        }
    }
}

impl From<LedgerError> for CellError {
    fn from(e: LedgerError) -> Self {
        CellError::Protocol(e.into())
    }
}
