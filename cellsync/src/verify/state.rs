use std::fmt;

use crate::protocol::MeasurementId;

/// Outcome class of one measurement execution.
///
/// Produced per execution and consumed immediately by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationState {
    ErrorFree,
    /// Geometry is off; recalibrate and measure again.
    NeedsCalibration,
    /// Sensor temperature drifted since calibration.
    TemperatureForcesCalibration,
    Failure,
    /// Reinitialize the sensor fully before the next attempt.
    ReInitSensor,
    /// Run only the init step, no full restart.
    OnlyInitSensor,
    Abort,
    UserAbort,
    Retry,
    /// Retry without consuming the attempt budget.
    RetryWithoutCounting,
    /// Drive the robot back home along its path, then retry.
    MoveReverseHome,
}

impl VerificationState {
    /// `Failure`, `Abort` and `UserAbort` end the retry loop immediately.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failure | Self::Abort | Self::UserAbort)
    }

    /// Cause to charge a calibration against, for calibration states.
    pub const fn calibration_cause(self) -> Option<CalibrationCause> {
        match self {
            Self::NeedsCalibration => Some(CalibrationCause::Intersection),
            Self::TemperatureForcesCalibration => Some(CalibrationCause::Temperature),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::ErrorFree => "error-free",
            Self::NeedsCalibration => "needs-calibration",
            Self::TemperatureForcesCalibration => "temperature-forces-calibration",
            Self::Failure => "failure",
            Self::ReInitSensor => "reinit-sensor",
            Self::OnlyInitSensor => "only-init-sensor",
            Self::Abort => "abort",
            Self::UserAbort => "user-abort",
            Self::Retry => "retry",
            Self::RetryWithoutCounting => "retry-without-counting",
            Self::MoveReverseHome => "move-reverse-home",
        }
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a calibration was requested. Each cause may trigger at most one
/// calibration per measurement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationCause {
    Intersection,
    Temperature,
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub state: VerificationState,
    /// Measurements whose collected data must be discarded.
    pub purge: Vec<MeasurementId>,
}

impl Verdict {
    pub const fn new(state: VerificationState) -> Self {
        Self {
            state,
            purge: Vec::new(),
        }
    }

    pub fn with_purge(state: VerificationState, purge: Vec<MeasurementId>) -> Self {
        Self { state, purge }
    }
}

impl From<VerificationState> for Verdict {
    fn from(state: VerificationState) -> Self {
        Self::new(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        use VerificationState::*;
        let terminal: Vec<_> = [
            ErrorFree,
            NeedsCalibration,
            TemperatureForcesCalibration,
            Failure,
            ReInitSensor,
            OnlyInitSensor,
            Abort,
            UserAbort,
            Retry,
            RetryWithoutCounting,
            MoveReverseHome,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(terminal, vec![Failure, Abort, UserAbort]);
    }

    #[test]
    fn calibration_causes() {
        assert_eq!(
            VerificationState::NeedsCalibration.calibration_cause(),
            Some(CalibrationCause::Intersection)
        );
        assert_eq!(
            VerificationState::TemperatureForcesCalibration.calibration_cause(),
            Some(CalibrationCause::Temperature)
        );
        assert_eq!(VerificationState::Retry.calibration_cause(), None);
    }
}
