//! Signal catalogue: a closed set of message kinds with one payload type each.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use super::failure::FailureReport;

/// Symbolic op-code carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum SignalKey {
    Handshake = 0x0001,
    ServerAlive = 0x0002,
    Unpair = 0x0010,
    Open = 0x0011,
    OpenInit = 0x0012,
    CloseTemplate = 0x0013,
    Start = 0x0014,
    SingleSide = 0x0015,
    Measure = 0x0016,
    Save = 0x0017,
    AlignmentIter = 0x0018,
    RefXml = 0x0019,
    Restart = 0x001A,
    ExportedFile = 0x001B,
    Success = 0x0020,
    Failure = 0x0021,
}

impl SignalKey {
    /// Raw value for the frame header.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether a signal of this kind expects a correlated `SUCCESS`/`FAILURE`.
    ///
    /// `HANDSHAKE` is a symmetric exchange and completions never expect a
    /// reply themselves.
    #[inline]
    pub const fn is_request(self) -> bool {
        !matches!(self, Self::Handshake | Self::Success | Self::Failure)
    }

    /// Upper-case protocol name, used in logs and diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::ServerAlive => "SERVER_ALIVE",
            Self::Unpair => "UNPAIR",
            Self::Open => "OPEN",
            Self::OpenInit => "OPEN_INIT",
            Self::CloseTemplate => "CLOSE_TEMPLATE",
            Self::Start => "START",
            Self::SingleSide => "SINGLE_SIDE",
            Self::Measure => "MEASURE",
            Self::Save => "SAVE",
            Self::AlignmentIter => "ALIGNMENT_ITER",
            Self::RefXml => "REFXML",
            Self::Restart => "RESTART",
            Self::ExportedFile => "EXPORTEDFILE",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl TryFrom<u16> for SignalKey {
    type Error = CodecError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            0x0001 => Self::Handshake,
            0x0002 => Self::ServerAlive,
            0x0010 => Self::Unpair,
            0x0011 => Self::Open,
            0x0012 => Self::OpenInit,
            0x0013 => Self::CloseTemplate,
            0x0014 => Self::Start,
            0x0015 => Self::SingleSide,
            0x0016 => Self::Measure,
            0x0017 => Self::Save,
            0x0018 => Self::AlignmentIter,
            0x0019 => Self::RefXml,
            0x001A => Self::Restart,
            0x001B => Self::ExportedFile,
            0x0020 => Self::Success,
            0x0021 => Self::Failure,
            other => return Err(CodecError::UnknownKey(other)),
        })
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to an inspection plan known to both cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanRef(String);

impl PlanRef {
    /// Creates a plan reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one measurement within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementId(pub u32);

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// What a `MEASURE` request asks the peer to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    Digitize,
    Photogrammetry,
    Calibration,
}

/// A single message exchanged over the link. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Link handshake carrying the sender's process id.
    Handshake { pid: u32 },
    /// Liveness probe.
    ServerAlive,
    /// Requests the peer to adopt the given pairing.
    Unpair { unpaired: bool },
    Open(PlanRef),
    OpenInit(PlanRef),
    CloseTemplate,
    Start,
    /// Hands a plan to the peer to run on its own.
    SingleSide(PlanRef),
    Measure(MeasureMode),
    Save(Vec<MeasurementId>),
    AlignmentIter(Option<String>),
    RefXml(Option<String>),
    Restart,
    ExportedFile(String),
    /// Completes the oldest outstanding request with `key`.
    Success { key: SignalKey },
    /// Fails the oldest outstanding request with `key`, or aborts the
    /// shared plan when `key` is `None`.
    Failure {
        key: Option<SignalKey>,
        report: FailureReport,
    },
}

impl Signal {
    /// The op-code of this signal.
    pub const fn key(&self) -> SignalKey {
        match self {
            Self::Handshake { .. } => SignalKey::Handshake,
            Self::ServerAlive => SignalKey::ServerAlive,
            Self::Unpair { .. } => SignalKey::Unpair,
            Self::Open(_) => SignalKey::Open,
            Self::OpenInit(_) => SignalKey::OpenInit,
            Self::CloseTemplate => SignalKey::CloseTemplate,
            Self::Start => SignalKey::Start,
            Self::SingleSide(_) => SignalKey::SingleSide,
            Self::Measure(_) => SignalKey::Measure,
            Self::Save(_) => SignalKey::Save,
            Self::AlignmentIter(_) => SignalKey::AlignmentIter,
            Self::RefXml(_) => SignalKey::RefXml,
            Self::Restart => SignalKey::Restart,
            Self::ExportedFile(_) => SignalKey::ExportedFile,
            Self::Success { .. } => SignalKey::Success,
            Self::Failure { .. } => SignalKey::Failure,
        }
    }

    /// Whether this signal expects a correlated completion.
    #[inline]
    pub const fn is_request(&self) -> bool {
        self.key().is_request()
    }

    /// Builds the failure reply for a request.
    #[must_use]
    pub fn failure_for(key: SignalKey, report: FailureReport) -> Self {
        Self::Failure {
            key: Some(key),
            report,
        }
    }

    /// Interprets this signal as a completion of an earlier request.
    ///
    /// Returns `None` for requests, handshakes and uncorrelated failures.
    #[must_use]
    pub fn completion(&self) -> Option<Completion> {
        match self {
            Self::Success { key } => Some(Completion {
                key: *key,
                outcome: Outcome::Success,
            }),
            Self::Failure {
                key: Some(key),
                report,
            } => Some(Completion {
                key: *key,
                outcome: Outcome::Failure(report.clone()),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake { pid } => write!(f, "HANDSHAKE({pid})"),
            Self::Unpair { unpaired } => write!(f, "UNPAIR({unpaired})"),
            Self::Open(plan) | Self::OpenInit(plan) | Self::SingleSide(plan) => {
                write!(f, "{}({plan})", self.key())
            }
            Self::Measure(mode) => write!(f, "MEASURE({mode:?})"),
            Self::Save(list) => write!(f, "SAVE({} measurements)", list.len()),
            Self::AlignmentIter(r) | Self::RefXml(r) => {
                write!(f, "{}({})", self.key(), r.as_deref().unwrap_or(""))
            }
            Self::ExportedFile(name) => write!(f, "EXPORTEDFILE({name})"),
            Self::Success { key } => write!(f, "SUCCESS({key})"),
            Self::Failure { key: Some(key), report } => write!(f, "FAILURE({key}: {report})"),
            Self::Failure { key: None, report } => write!(f, "FAILURE({report})"),
            other => f.write_str(other.key().name()),
        }
    }
}

/// Result carried by a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureReport),
}

/// A `SUCCESS` or `FAILURE` reduced to the request key it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Key of the request being completed.
    pub key: SignalKey,
    pub outcome: Outcome,
}

impl Completion {
    #[must_use]
    pub fn success(key: SignalKey) -> Self {
        Self {
            key,
            outcome: Outcome::Success,
        }
    }

    #[must_use]
    pub fn failure(key: SignalKey, report: FailureReport) -> Self {
        Self {
            key,
            outcome: Outcome::Failure(report),
        }
    }

    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }
}
