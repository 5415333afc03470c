//! Digitizing telemetry verification.
//!
//! Six per-measurement predicates are evaluated over the real measurements
//! of a run. For each category the number of failing measurements is
//! compared against `ceil(active * margin)`; a category is over the limit
//! only when its count is strictly greater.
//!
//! | category                     | over limit         | within limit |
//! |------------------------------|--------------------|--------------|
//! | transformation, temperature  | `Abort`            | warning      |
//! | intersection, projector      | `NeedsCalibration` + purge | `NeedsCalibration` |
//! | movement, lighting           | `Retry` while budget remains, else `Failure` | `Retry` while budget remains, else warning |

use crate::config::VerificationConfig;
use crate::protocol::MeasurementId;
use crate::trace::debug;

use super::diagnostics::{ErrorLog, WarningStack};
use super::state::{Verdict, VerificationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    Real,
    /// Robot home position, carries no data.
    Home,
    /// Via point between real measurements.
    Intermediate,
}

/// Sensor resolution a measurement was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Full,
    Half,
    Quarter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementTelemetry {
    pub id: MeasurementId,
    pub kind: MeasurementKind,
    pub resolution: Resolution,
    /// Ray intersection deviation in mm.
    pub intersection_deviation: f64,
    /// Deviation of the transformation into the part frame, in mm.
    pub transformation_deviation: f64,
    pub projector_residual: f64,
    /// Projector residual threshold established at the last calibration.
    pub projector_limit: f64,
    /// Sensor temperature change since calibration, in kelvin.
    pub temperature_drift: f64,
    pub movement_fault: bool,
    pub lighting_fault: bool,
}

impl MeasurementTelemetry {
    /// A real full-resolution measurement with every value nominal.
    pub fn nominal(id: MeasurementId) -> Self {
        Self {
            id,
            kind: MeasurementKind::Real,
            resolution: Resolution::Full,
            intersection_deviation: 0.0,
            transformation_deviation: 0.0,
            projector_residual: 0.0,
            projector_limit: 1.0,
            temperature_drift: 0.0,
            movement_fault: false,
            lighting_fault: false,
        }
    }
}

/// Telemetry of one digitizing run.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitizingRun {
    pub measurements: Vec<MeasurementTelemetry>,
    /// Diagonal of the measuring volume in mm.
    pub volume_diagonal: f64,
    /// Residual of the part alignment in mm; 0 if unknown.
    pub alignment_residual: f64,
}

impl DigitizingRun {
    /// Volume-derived transformation limit, capped by the alignment residual.
    pub fn transformation_limit(&self, config: &VerificationConfig) -> f64 {
        let volume =
            self.volume_diagonal / config.transformation_divisor + config.transformation_offset;
        if self.alignment_residual > 0.0 {
            volume.min(self.alignment_residual * config.alignment_residual_factor)
        } else {
            volume
        }
    }
}

fn intersection_limit(resolution: Resolution, config: &VerificationConfig) -> f64 {
    match resolution {
        Resolution::Full => config.intersection_limit_full,
        Resolution::Half => config.intersection_limit_half,
        Resolution::Quarter => config.intersection_limit_quarter,
    }
}

#[derive(Debug, Default)]
struct Failing {
    intersection: Vec<MeasurementId>,
    transformation: Vec<MeasurementId>,
    projector: Vec<MeasurementId>,
    temperature: Vec<MeasurementId>,
    movement: Vec<MeasurementId>,
    lighting: Vec<MeasurementId>,
}

impl Failing {
    fn collect<'a>(
        active: impl Iterator<Item = &'a MeasurementTelemetry>,
        transformation_limit: f64,
        config: &VerificationConfig,
    ) -> Self {
        let mut f = Self::default();
        for m in active {
            // `!(x <= limit)` so NaN telemetry counts as failing
            if !(m.intersection_deviation <= intersection_limit(m.resolution, config)) {
                f.intersection.push(m.id);
            }
            if !(m.transformation_deviation <= transformation_limit) {
                f.transformation.push(m.id);
            }
            if !(m.projector_residual <= m.projector_limit) {
                f.projector.push(m.id);
            }
            if !(m.temperature_drift.abs() <= config.temperature_drift_limit) {
                f.temperature.push(m.id);
            }
            if m.movement_fault {
                f.movement.push(m.id);
            }
            if m.lighting_fault {
                f.lighting.push(m.id);
            }
        }
        f
    }
}

fn describe(ids: &[MeasurementId]) -> String {
    let list: Vec<String> = ids.iter().map(|id| id.0.to_string()).collect();
    list.join(", ")
}

/// Classifies a digitizing run.
///
/// `retries_remaining` tells whether the caller's attempt budget allows
/// another counted retry. Failures tolerated within the margin are pushed
/// onto `warnings`.
pub fn check_digitizing(
    run: &DigitizingRun,
    config: &VerificationConfig,
    retries_remaining: bool,
    log: &mut ErrorLog,
    warnings: &mut WarningStack,
) -> Verdict {
    let active: Vec<&MeasurementTelemetry> = run
        .measurements
        .iter()
        .filter(|m| m.kind == MeasurementKind::Real)
        .collect();
    if active.is_empty() {
        return Verdict::new(VerificationState::ErrorFree);
    }

    let limit = (active.len() as f64 * config.margin).ceil() as usize;
    let failing = Failing::collect(
        active.iter().copied(),
        run.transformation_limit(config),
        config,
    );
    let over = |count: usize| count > limit;
    debug!(
        active = active.len(),
        limit,
        intersection = failing.intersection.len(),
        transformation = failing.transformation.len(),
        projector = failing.projector.len(),
        temperature = failing.temperature.len(),
        movement = failing.movement.len(),
        lighting = failing.lighting.len(),
        "digitizing verification"
    );

    let mut abort = false;
    for (name, ids) in [
        ("transformation", &failing.transformation),
        ("temperature", &failing.temperature),
    ] {
        if ids.is_empty() {
            continue;
        }
        if over(ids.len()) {
            log.push(format!(
                "{} of {} measurements exceed the {name} limit (allowed {limit}): {}",
                ids.len(),
                active.len(),
                describe(ids)
            ));
            abort = true;
        } else {
            warnings.push(format!("{name} limit exceeded by measurements {}", describe(ids)));
        }
    }
    if abort {
        return Verdict::new(VerificationState::Abort);
    }

    if !failing.intersection.is_empty() || !failing.projector.is_empty() {
        let mut purge = Vec::new();
        for (name, ids) in [
            ("intersection", &failing.intersection),
            ("projector residual", &failing.projector),
        ] {
            if ids.is_empty() {
                continue;
            }
            log.push(format!(
                "{} of {} measurements exceed the {name} limit: {}",
                ids.len(),
                active.len(),
                describe(ids)
            ));
            if over(ids.len()) {
                for id in ids.iter() {
                    if !purge.contains(id) {
                        purge.push(*id);
                    }
                }
            }
        }
        return Verdict::with_purge(VerificationState::NeedsCalibration, purge);
    }

    let motion = [("movement", &failing.movement), ("lighting", &failing.lighting)];
    if motion.iter().any(|(_, ids)| !ids.is_empty()) {
        if retries_remaining {
            for (name, ids) in motion.iter().filter(|(_, ids)| !ids.is_empty()) {
                log.push(format!("{name} fault at measurements {}", describe(ids)));
            }
            return Verdict::new(VerificationState::Retry);
        }
        let mut fail = false;
        for (name, ids) in motion.iter().filter(|(_, ids)| !ids.is_empty()) {
            if over(ids.len()) {
                log.push(format!(
                    "{} {name} faults exceed the allowed {limit} with no retries left",
                    ids.len()
                ));
                fail = true;
            } else {
                warnings.push(format!("{name} fault tolerated at measurements {}", describe(ids)));
            }
        }
        if fail {
            return Verdict::new(VerificationState::Failure);
        }
    }

    Verdict::new(VerificationState::ErrorFree)
}
