//! Photogrammetry bundle verification.

use crate::config::VerificationConfig;

use super::diagnostics::ErrorLog;
use super::state::{Verdict, VerificationState};

/// Telemetry of one photogrammetry bundle adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotogrammetryReport {
    /// Mean image point deviation in mm.
    pub image_point_deviation: f64,
    /// Mean scale bar length deviation in mm.
    pub scale_bar_deviation: f64,
    /// Nominal lengths of the scale bars in the scene, in mm.
    pub scale_bar_lengths: Vec<f64>,
    /// Diagonal of the measuring volume in mm.
    pub volume_diagonal: f64,
}

/// Allowed scale bar deviation: the per-bar limit
/// `nominal / 50000 + 0.005` averaged over all bars.
pub fn scale_bar_limit(lengths: &[f64]) -> Option<f64> {
    if lengths.is_empty() {
        return None;
    }
    let sum: f64 = lengths.iter().map(|l| l / 50_000.0 + 0.005).sum();
    Some(sum / lengths.len() as f64)
}

/// Allowed image point deviation for a volume.
pub fn image_point_limit(volume_diagonal: f64, config: &VerificationConfig) -> f64 {
    config.image_point_base + volume_diagonal / config.image_point_divisor
}

/// `ErrorFree` only if both deviations are strictly below their limits.
pub fn check_photogrammetry(
    report: &PhotogrammetryReport,
    config: &VerificationConfig,
    log: &mut ErrorLog,
) -> Verdict {
    let mut ok = true;

    let ip_limit = image_point_limit(report.volume_diagonal, config);
    let ip_ok = report.image_point_deviation < ip_limit;
    if !ip_ok {
        log.push(format!(
            "image point deviation {:.4} mm exceeds limit {:.4} mm",
            report.image_point_deviation, ip_limit
        ));
        ok = false;
    }

    match scale_bar_limit(&report.scale_bar_lengths) {
        Some(limit) if report.scale_bar_deviation < limit => {}
        Some(limit) => {
            log.push(format!(
                "scale bar deviation {:.4} mm exceeds limit {:.4} mm",
                report.scale_bar_deviation, limit
            ));
            ok = false;
        }
        None => {
            log.push("no scale bar in the bundle, scale cannot be verified");
            ok = false;
        }
    }

    if ok {
        Verdict::new(VerificationState::ErrorFree)
    } else {
        Verdict::new(VerificationState::Failure)
    }
}
