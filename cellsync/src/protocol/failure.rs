//! Failure reports carried by `FAILURE` signals.
//!
//! A report is a numeric code plus free text. On the wire and in logs it is
//! rendered as `"<code> - <text>"`; the hundreds digit of the code selects an
//! [`ErrorCategory`] that downstream automation can act on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known failure codes produced by this crate.
pub mod codes {
    /// No numeric code could be recovered.
    pub const UNSPECIFIED: u32 = 0;
    /// A completion arrived that matched no outstanding request.
    pub const PROTOCOL_DESYNC: u32 = 101;
    /// The peer never answered the alive probe.
    pub const ALIVE_TIMEOUT: u32 = 102;
    /// A remote phase did not complete in time.
    pub const PHASE_TIMEOUT: u32 = 103;
    /// The link dropped while a request was outstanding.
    pub const LINK_LOST: u32 = 104;
    /// The handshake did not complete in time.
    pub const HANDSHAKE_TIMEOUT: u32 = 105;
    /// Neither cell has content for the plan.
    pub const NO_COMPATIBLE_CONTENT: u32 = 201;
    /// The receiving cell has no handler for the request.
    pub const UNSUPPORTED_REQUEST: u32 = 202;
    /// The measurement list could not be stored.
    pub const MEASUREMENT_LIST: u32 = 301;
    /// A measurement ended in a terminal verification state.
    pub const MEASUREMENT_TERMINAL: u32 = 401;
    /// A measurement ran out of retries.
    pub const RETRIES_EXHAUSTED: u32 = 402;
    /// Calibration could not fix the cause it was run for.
    pub const CALIBRATION_REPEATED: u32 = 501;
    /// The calibration routine itself failed.
    pub const CALIBRATION_FAILED: u32 = 502;
    /// Operator cancelled the run.
    pub const OPERATOR_CANCELLED: u32 = 901;
}

/// Coarse bucket of a failure code, selected by its hundreds digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Unspecified,
    /// 1xx: link, handshake and protocol.
    Link,
    /// 2xx: plan and template handling.
    Plan,
    /// 3xx: measurement list storage and exchange.
    MeasurementList,
    /// 4xx: measurement execution.
    Measurement,
    /// 5xx: calibration.
    Calibration,
    /// 6xx: photogrammetry export and import.
    ExportImport,
    /// 9xx: operator decisions.
    Operator,
}

impl ErrorCategory {
    pub const fn from_code(code: u32) -> Self {
        match code / 100 {
            1 => Self::Link,
            2 => Self::Plan,
            3 => Self::MeasurementList,
            4 => Self::Measurement,
            5 => Self::Calibration,
            6 => Self::ExportImport,
            9 => Self::Operator,
            _ => Self::Unspecified,
        }
    }
}

/// Numeric code and human-readable text describing a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureReport {
    pub code: u32,
    pub text: String,
}

impl FailureReport {
    #[must_use]
    pub fn new(code: u32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Parses `"<code> - <text>"`.
    ///
    /// Text without a leading number yields [`codes::UNSPECIFIED`] and keeps
    /// the whole input as text.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let digits = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());

        match trimmed[..digits].parse::<u32>() {
            Ok(code) => {
                let text = trimmed[digits..]
                    .trim_start()
                    .trim_start_matches(['-', ':'])
                    .trim_start();
                Self::new(code, text)
            }
            Err(_) => Self::new(codes::UNSPECIFIED, trimmed),
        }
    }

    #[inline]
    pub const fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(self.code)
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code, self.text)
    }
}
