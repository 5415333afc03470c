//! Measurement verification and recovery classification.
//!
//! Each classifier reduces one measurement execution to a [`Verdict`]:
//! exactly one [`VerificationState`] plus the ids of measurements whose data
//! must be purged before re-acquisition. Human-readable detail goes to the
//! caller's [`ErrorLog`]; tolerated failures go to a [`WarningStack`].
//!
//! - `photogrammetry`: image point and scale bar telemetry.
//! - `digitizing`: per-measurement predicates compared against a margin.
//! - `errors`: fixed table over caught execution errors, including the
//!   operator decision for safety stops.

pub mod diagnostics;
pub mod digitizing;
pub mod errors;
pub mod photogrammetry;
pub mod state;

pub use diagnostics::{ErrorLog, WarningStack};
pub use digitizing::{
    DigitizingRun, MeasurementKind, MeasurementTelemetry, Resolution, check_digitizing,
};
pub use errors::{
    ErrorClass, ErrorCode, MeasurementError, OperatorDecision, OperatorPrompt,
    TemperatureSource, analyze_error,
};
pub use photogrammetry::{PhotogrammetryReport, check_photogrammetry, scale_bar_limit};
pub use state::{CalibrationCause, Verdict, VerificationState};
