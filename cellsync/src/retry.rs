//! Measurement retry loop.
//!
//! Runs one measurement until it verifies clean or reaches a terminal
//! state. Each iteration starts with a fresh [`ErrorLog`], executes the
//! measurement (reinitializing the sensor first when requested), classifies
//! the outcome and acts on the resulting [`VerificationState`]:
//!
//! - `Retry`, `ReInitSensor`, `OnlyInitSensor`, `MoveReverseHome` consume one
//!   counted attempt.
//! - `RetryWithoutCounting` and calibrations do not.
//! - A calibration may run once per cause. A second request for the same
//!   cause is a hard failure.
//! - `Failure`, `Abort` and `UserAbort` end the loop at once and are
//!   reported to the optional [`FailurePropagation`] sink.

use std::fmt;
use std::time::SystemTime;

use crate::config::{CellConfig, RetryConfig, VerificationConfig};
use crate::error::{CellError, Fault};
use crate::protocol::{FailureReport, MeasurementId, codes};
use crate::trace::{debug, error, info, warn};
use crate::verify::{
    CalibrationCause, DigitizingRun, ErrorLog, MeasurementError, OperatorPrompt,
    PhotogrammetryReport, Verdict, VerificationState, WarningStack, analyze_error,
    check_digitizing, check_photogrammetry,
};
use crate::wait::{Headless, ModalSurface};

/// Uncounted retries allowed in a row before the loop gives up.
const MAX_UNCOUNTED_RETRIES: u32 = 16;

/// Raw result of executing a measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Digitizing(DigitizingRun),
    Photogrammetry(PhotogrammetryReport),
}

/// The measurement hardware as seen by the retry loop.
pub trait MeasurementSurface {
    fn perform_measurement(&mut self) -> Result<Telemetry, MeasurementError>;

    /// Initializes the sensor; `only_init` skips the full restart.
    fn initialize(&mut self, only_init: bool) -> Result<(), MeasurementError>;

    /// True when the hardware itself asks for reinitialization.
    fn check_for_reinitialize(&mut self) -> bool;

    fn calibrate(&mut self, cause: CalibrationCause) -> Result<(), MeasurementError>;

    fn move_reverse_home(&mut self) -> Result<(), MeasurementError>;

    /// Discards the collected data of `ids` so they are measured again.
    fn purge(&mut self, ids: &[MeasurementId]);
}

/// Persistence of the last successful calibration.
pub trait CalibrationClock {
    fn record_calibration(&mut self, at: SystemTime);
    fn last_calibration(&self) -> Option<SystemTime>;
}

/// Clock that only remembers the timestamp in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryClock {
    last: Option<SystemTime>,
}

impl CalibrationClock for MemoryClock {
    fn record_calibration(&mut self, at: SystemTime) {
        self.last = Some(at);
    }

    fn last_calibration(&self) -> Option<SystemTime> {
        self.last
    }
}

/// Receives terminal failures that must cross to the peer cell.
pub trait FailurePropagation {
    fn propagate_failure(&mut self, report: &FailureReport);
}

/// Attempt budget and per-cause calibration flags for one measurement.
#[derive(Debug, Clone)]
pub struct MeasurementAttempt {
    attempt: u32,
    max: u32,
    calibrated_intersection: bool,
    calibrated_temperature: bool,
}

impl MeasurementAttempt {
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 1,
            max: if max_attempts == 0 { 1 } else { max_attempts },
            calibrated_intersection: false,
            calibrated_temperature: false,
        }
    }

    /// 1-based number of the current counted attempt.
    pub const fn current(&self) -> u32 {
        self.attempt
    }

    pub const fn retries_remaining(&self) -> bool {
        self.attempt < self.max
    }

    /// Moves to the next counted attempt; `false` once the budget is spent.
    pub fn advance(&mut self) -> bool {
        if self.retries_remaining() {
            self.attempt += 1;
            true
        } else {
            false
        }
    }

    /// Marks a calibration for `cause`; `false` if one already ran.
    pub fn mark_calibration(&mut self, cause: CalibrationCause) -> bool {
        let flag = match cause {
            CalibrationCause::Intersection => &mut self.calibrated_intersection,
            CalibrationCause::Temperature => &mut self.calibrated_temperature,
        };
        !std::mem::replace(flag, true)
    }
}

/// A measurement that verified clean.
#[derive(Debug, Clone, PartialEq)]
pub struct Measured {
    pub telemetry: Telemetry,
    /// Counted attempts used, including the successful one.
    pub attempts: u32,
    pub calibrations: u32,
}

/// A measurement that ended in a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub state: VerificationState,
    pub fault: Fault,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.state, self.fault)
    }
}

impl std::error::Error for Terminal {}

impl From<Terminal> for CellError {
    fn from(t: Terminal) -> Self {
        match t.state {
            VerificationState::UserAbort => CellError::Cancelled,
            _ => CellError::Fault(t.fault),
        }
    }
}

pub struct MeasurementRetryLoop<'a> {
    retry: RetryConfig,
    verification: VerificationConfig,
    surface: &'a mut dyn MeasurementSurface,
    clock: &'a mut dyn CalibrationClock,
    prompt: &'a mut dyn OperatorPrompt,
    ui: Option<&'a mut dyn ModalSurface>,
    propagation: Option<&'a mut dyn FailurePropagation>,
    log: ErrorLog,
    warnings: WarningStack,
}

impl<'a> MeasurementRetryLoop<'a> {
    pub fn new(
        config: &CellConfig,
        surface: &'a mut dyn MeasurementSurface,
        clock: &'a mut dyn CalibrationClock,
        prompt: &'a mut dyn OperatorPrompt,
    ) -> Self {
        Self {
            retry: config.retry,
            verification: config.verification,
            surface,
            clock,
            prompt,
            ui: None,
            propagation: None,
            log: ErrorLog::new(),
            warnings: WarningStack::default(),
        }
    }

    /// Surface ticked while waiting on an operator decision.
    pub fn with_ui(mut self, ui: &'a mut dyn ModalSurface) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn propagate_to(mut self, sink: &'a mut dyn FailurePropagation) -> Self {
        self.propagation = Some(sink);
        self
    }

    /// Error log of the last iteration.
    pub fn log(&self) -> &ErrorLog {
        &self.log
    }

    /// Failures tolerated within the margin.
    pub fn warnings(&mut self) -> &mut WarningStack {
        &mut self.warnings
    }

    pub fn run(&mut self) -> Result<Measured, Terminal> {
        use VerificationState::*;

        let mut attempt = MeasurementAttempt::new(self.retry.max_attempts);
        let mut calibrations = 0;
        let mut uncounted = 0;
        let mut init: Option<bool> = None;

        loop {
            self.log.reset();
            if init.is_none() && self.surface.check_for_reinitialize() {
                init = Some(false);
            }

            let (verdict, telemetry) = match init.take() {
                Some(only_init) => match self.surface.initialize(only_init) {
                    Ok(()) => self.measure(&attempt),
                    Err(e) => (self.analyze(&e), None),
                },
                None => self.measure(&attempt),
            };
            debug!(
                attempt = attempt.current(),
                state = %verdict.state,
                purge = verdict.purge.len(),
                "measurement classified"
            );
            if !verdict.purge.is_empty() {
                self.surface.purge(&verdict.purge);
            }

            if verdict.state.is_terminal() {
                return Err(self.finish_terminal(verdict.state));
            }
            if let Some(cause) = verdict.state.calibration_cause() {
                self.calibrate(&mut attempt, cause)?;
                calibrations += 1;
                continue;
            }

            let counted = match verdict.state {
                ErrorFree => {
                    if let Some(telemetry) = telemetry {
                        info!(attempts = attempt.current(), calibrations, "measurement verified");
                        return Ok(Measured {
                            telemetry,
                            attempts: attempt.current(),
                            calibrations,
                        });
                    }
                    // clean verdict without telemetry cannot happen; measure again
                    false
                }
                ReInitSensor => {
                    init = Some(false);
                    true
                }
                OnlyInitSensor => {
                    init = Some(true);
                    true
                }
                Retry => true,
                RetryWithoutCounting => {
                    uncounted += 1;
                    if uncounted > MAX_UNCOUNTED_RETRIES {
                        let message = format!(
                            "{uncounted} uncounted retries in a row: {}",
                            self.log.summary()
                        );
                        return Err(self.terminate(Failure, codes::RETRIES_EXHAUSTED, message));
                    }
                    false
                }
                MoveReverseHome => {
                    if let Err(e) = self.surface.move_reverse_home() {
                        return Err(self.terminate(
                            Failure,
                            codes::MEASUREMENT_TERMINAL,
                            format!("reverse homing failed: {e}"),
                        ));
                    }
                    true
                }
                // handled above
                NeedsCalibration | TemperatureForcesCalibration | Failure | Abort | UserAbort => {
                    false
                }
            };

            if counted {
                uncounted = 0;
                if !attempt.advance() {
                    let message = format!(
                        "no attempts left after {}: {}",
                        attempt.current(),
                        self.log.summary()
                    );
                    return Err(self.terminate(Failure, codes::RETRIES_EXHAUSTED, message));
                }
                warn!(attempt = attempt.current(), state = %verdict.state, "retrying measurement");
            }
        }
    }

    fn measure(&mut self, attempt: &MeasurementAttempt) -> (Verdict, Option<Telemetry>) {
        match self.surface.perform_measurement() {
            Ok(telemetry) => {
                let verdict = match &telemetry {
                    Telemetry::Digitizing(run) => check_digitizing(
                        run,
                        &self.verification,
                        attempt.retries_remaining(),
                        &mut self.log,
                        &mut self.warnings,
                    ),
                    Telemetry::Photogrammetry(report) => {
                        check_photogrammetry(report, &self.verification, &mut self.log)
                    }
                };
                (verdict, Some(telemetry))
            }
            Err(e) => (self.analyze(&e), None),
        }
    }

    fn analyze(&mut self, e: &MeasurementError) -> Verdict {
        let timeout = self.retry.operator_timeout();
        match self.ui.as_deref_mut() {
            Some(ui) => analyze_error(e, &mut *self.prompt, ui, timeout, &mut self.log),
            None => analyze_error(e, &mut *self.prompt, &mut Headless, timeout, &mut self.log),
        }
    }

    /// Runs the calibration for `cause`, at most once per measurement.
    fn calibrate(
        &mut self,
        attempt: &mut MeasurementAttempt,
        cause: CalibrationCause,
    ) -> Result<(), Terminal> {
        use VerificationState::Failure;

        if !attempt.mark_calibration(cause) {
            let message = format!(
                "{cause:?} calibration already ran for this measurement: {}",
                self.log.summary()
            );
            return Err(self.terminate(Failure, codes::CALIBRATION_REPEATED, message));
        }
        info!(?cause, "calibrating");
        if let Err(e) = self.surface.calibrate(cause) {
            return Err(self.terminate(
                Failure,
                codes::CALIBRATION_FAILED,
                format!("calibration failed: {e}"),
            ));
        }
        self.clock.record_calibration(SystemTime::now());
        Ok(())
    }

    fn finish_terminal(&mut self, state: VerificationState) -> Terminal {
        let summary = self.log.summary();
        match state {
            VerificationState::UserAbort => {
                let message = if summary.is_empty() {
                    "cancelled by operator".to_owned()
                } else {
                    summary
                };
                self.terminate(state, codes::OPERATOR_CANCELLED, message)
            }
            _ => self.terminate(state, codes::MEASUREMENT_TERMINAL, summary),
        }
    }

    fn terminate(&mut self, state: VerificationState, code: u32, message: String) -> Terminal {
        let fault = Fault::new(code, message);
        error!(%state, code, message = %fault.message, "measurement terminated");
        if let Some(sink) = self.propagation.as_deref_mut() {
            sink.propagate_failure(&fault.clone().into());
        }
        Terminal { state, fault }
    }
}
