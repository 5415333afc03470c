//! Classification of errors raised while executing a measurement.
//!
//! Unlike the telemetry checks this is a fixed table over the error code.
//! Safety stops are the exception: they are resolved by asking the operator
//! whether to continue, abort, or drive back home.

use std::fmt;
use std::time::Duration;

use crate::protocol::MeasurementId;
use crate::trace::{info, warn};
use crate::wait::{ModalSurface, Timeout, WaitError, await_completion};

use super::diagnostics::ErrorLog;
use super::state::{Verdict, VerificationState};

/// Two-field error code reported by the measurement hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    pub group: u16,
    pub number: u16,
}

impl ErrorCode {
    pub const fn new(group: u16, number: u16) -> Self {
        Self { group, number }
    }

    /// Both fields packed as `group << 16 | number`.
    pub const fn raw(self) -> u32 {
        ((self.group as u32) << 16) | self.number as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.number)
    }
}

/// Error codes the classifier recognizes.
pub mod known {
    use super::ErrorCode;

    pub const NOT_INITIALIZED: ErrorCode = ErrorCode::new(1, 1);
    pub const DECALIBRATED: ErrorCode = ErrorCode::new(1, 10);
    pub const ACQUISITION_TIMEOUT: ErrorCode = ErrorCode::new(1, 20);
    pub const FRAME_DROPPED: ErrorCode = ErrorCode::new(1, 21);
    pub const EMERGENCY_STOP: ErrorCode = ErrorCode::new(2, 1);
    pub const FENCE_OPEN: ErrorCode = ErrorCode::new(2, 2);
    pub const RESET_STATE: ErrorCode = ErrorCode::new(2, 3);
    pub const COLLISION: ErrorCode = ErrorCode::new(2, 10);
    pub const TEMPERATURE_CONSISTENCY: ErrorCode = ErrorCode::new(3, 1);
    pub const USER_ABORT: ErrorCode = ErrorCode::new(9, 1);
}

/// Which temperature reading took part in a consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemperatureSource {
    Calibration,
    Acquisition,
    Current,
}

/// An error caught while executing a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementError {
    pub code: ErrorCode,
    pub message: String,
    /// Measurements whose data the error invalidates.
    pub measurements: Vec<MeasurementId>,
    /// For temperature consistency errors, the two readings that disagreed.
    pub temperatures: Option<(TemperatureSource, TemperatureSource)>,
}

impl MeasurementError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            measurements: Vec::new(),
            temperatures: None,
        }
    }

    pub fn with_measurements(mut self, ids: Vec<MeasurementId>) -> Self {
        self.measurements = ids;
        self
    }

    pub fn with_temperatures(mut self, a: TemperatureSource, b: TemperatureSource) -> Self {
        self.temperatures = Some((a, b));
        self
    }
}

impl fmt::Display for MeasurementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for MeasurementError {}

/// Row of the classification table an error code falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Decalibration,
    SafetyStop,
    TemperatureConsistency,
    NotInitialized,
    Transient,
    /// Lost data not caused by the measurement itself.
    Dropout,
    Collision,
    UserAbort,
    Unknown,
}

impl ErrorClass {
    pub fn of(code: ErrorCode) -> Self {
        use known::*;
        match code {
            DECALIBRATED => Self::Decalibration,
            EMERGENCY_STOP | FENCE_OPEN | RESET_STATE => Self::SafetyStop,
            TEMPERATURE_CONSISTENCY => Self::TemperatureConsistency,
            NOT_INITIALIZED => Self::NotInitialized,
            ACQUISITION_TIMEOUT => Self::Transient,
            FRAME_DROPPED => Self::Dropout,
            COLLISION => Self::Collision,
            USER_ABORT => Self::UserAbort,
            _ => Self::Unknown,
        }
    }
}

/// How the operator resolved a safety stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorDecision {
    Continue,
    Abort,
    ReverseHome,
}

/// Surface that asks the operator to resolve a safety stop.
pub trait OperatorPrompt {
    /// Shows the question. Called once per stop.
    fn present(&mut self, message: &str);

    /// Returns the decision if one has been made, waiting at most `wait`.
    fn poll_decision(&mut self, wait: Duration) -> Option<OperatorDecision>;
}

const PROMPT_POLL: Duration = Duration::from_millis(50);

/// Classifies a caught measurement error.
///
/// Safety stops block on `prompt` until the operator decides, `ui` cancels,
/// or `timeout` passes; the latter two count as an operator abort.
pub fn analyze_error<U: ModalSurface + ?Sized>(
    error: &MeasurementError,
    prompt: &mut dyn OperatorPrompt,
    ui: &mut U,
    timeout: Timeout,
    log: &mut ErrorLog,
) -> Verdict {
    use VerificationState::*;

    match ErrorClass::of(error.code) {
        ErrorClass::Decalibration => {
            log.push(format!("sensor decalibrated: {}", error.message));
            Verdict::with_purge(NeedsCalibration, error.measurements.clone())
        }
        ErrorClass::SafetyStop => {
            log.push(format!("safety stop: {}", error.message));
            let decision = ask_operator(&error.message, prompt, ui, timeout);
            info!(code = %error.code, ?decision, "operator resolved safety stop");
            match decision {
                Ok(OperatorDecision::Continue) => Verdict::new(Retry),
                Ok(OperatorDecision::ReverseHome) => Verdict::new(MoveReverseHome),
                Ok(OperatorDecision::Abort) | Err(_) => {
                    log.set_code(error.code.raw());
                    Verdict::new(UserAbort)
                }
            }
        }
        ErrorClass::TemperatureConsistency => {
            use TemperatureSource::{Acquisition, Current};
            log.set_code(error.code.raw());
            match error.temperatures {
                Some((Acquisition, Current) | (Current, Acquisition)) => {
                    log.push(format!(
                        "temperature changed during acquisition: {}",
                        error.message
                    ));
                    Verdict::new(Failure)
                }
                _ => {
                    log.push(format!(
                        "temperature differs from calibration: {}",
                        error.message
                    ));
                    Verdict::new(TemperatureForcesCalibration)
                }
            }
        }
        ErrorClass::NotInitialized => {
            log.push(format!("sensor not initialized: {}", error.message));
            Verdict::new(OnlyInitSensor)
        }
        ErrorClass::Transient => {
            log.push(error.message.clone());
            Verdict::new(Retry)
        }
        ErrorClass::Dropout => {
            log.push(error.message.clone());
            Verdict::new(RetryWithoutCounting)
        }
        ErrorClass::Collision => {
            log.set_code(error.code.raw());
            log.push(format!("collision: {}", error.message));
            Verdict::new(MoveReverseHome)
        }
        ErrorClass::UserAbort => {
            log.push(error.message.clone());
            Verdict::new(UserAbort)
        }
        ErrorClass::Unknown => {
            warn!(code = %error.code, message = %error.message, "unrecognized measurement error");
            log.set_code(error.code.raw());
            log.push(format!("unrecognized error {}: {}", error.code, error.message));
            Verdict::new(ReInitSensor)
        }
    }
}

fn ask_operator<U: ModalSurface + ?Sized>(
    message: &str,
    prompt: &mut dyn OperatorPrompt,
    ui: &mut U,
    timeout: Timeout,
) -> Result<OperatorDecision, WaitError> {
    prompt.present(message);
    await_completion(timeout, ui, || Ok(prompt.poll_decision(PROMPT_POLL)))
}
