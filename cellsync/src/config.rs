//! Cell configuration.
//!
//! Every section carries defaults so a deployment only lists what differs:
//!
//! ```toml
//! [link]
//! peer_host = "cell-b.local"
//! peer_port = 7410
//! role = "primary"
//!
//! [verification]
//! margin = 0.15
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::Endpoint;
use crate::wait::Timeout;

/// Longest interval or timeout any setting may hold.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which end of the link this cell is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellRole {
    /// Drives the shared plan and dials the peer.
    #[default]
    Primary,
    /// Listens and services requests.
    Secondary,
}

impl CellRole {
    /// Role of the other cell.
    pub const fn peer(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    pub link: LinkConfig,
    pub retry: RetryConfig,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub peer_host: String,
    pub peer_port: u16,
    pub role: CellRole,
    /// Upper bound on one transport poll.
    pub poll_interval_ms: u64,
    pub alive_timeout_secs: u64,
    /// Bound on every remote phase wait; 0 waits forever.
    pub phase_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Delay between reconnect attempts after link loss.
    pub reconnect_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            peer_host: "127.0.0.1".to_owned(),
            peer_port: 7410,
            role: CellRole::Primary,
            poll_interval_ms: 10,
            alive_timeout_secs: 60,
            phase_timeout_secs: 600,
            handshake_timeout_secs: 10,
            reconnect_interval_ms: 1_000,
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms).min(MAX_DURATION)
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s).min(MAX_DURATION)
}

// Accessors clamp to `MAX_DURATION`; every value ends up as an `Instant` offset.
impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms)
    }

    pub fn alive_timeout(&self) -> Duration {
        secs(self.alive_timeout_secs)
    }

    pub fn phase_timeout(&self) -> Timeout {
        Timeout::from_secs_or_infinite(self.phase_timeout_secs.min(MAX_DURATION.as_secs()))
    }

    pub fn handshake_timeout(&self) -> Duration {
        secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        millis(self.reconnect_interval_ms)
    }

    /// Resolves `peer_host:peer_port`.
    pub fn peer_endpoint(&self) -> io::Result<Endpoint> {
        Endpoint::resolve(&self.peer_host, self.peer_port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Counted attempts per measurement before giving up.
    pub max_attempts: u32,
    /// How long an operator decision may take; 0 waits forever.
    pub operator_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            operator_timeout_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn operator_timeout(&self) -> Timeout {
        Timeout::from_secs_or_infinite(self.operator_timeout_secs.min(MAX_DURATION.as_secs()))
    }
}

/// Thresholds used by the telemetry classifiers. Lengths are millimetres.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Fraction of real measurements allowed to fail per category.
    pub margin: f64,
    /// Intersection deviation limit at full sensor resolution.
    pub intersection_limit_full: f64,
    pub intersection_limit_half: f64,
    pub intersection_limit_quarter: f64,
    /// Transformation limit is `diagonal / divisor + offset`.
    pub transformation_divisor: f64,
    pub transformation_offset: f64,
    /// Cap on the transformation limit as a multiple of the alignment residual.
    pub alignment_residual_factor: f64,
    /// Allowed sensor temperature drift since calibration, in kelvin.
    pub temperature_drift_limit: f64,
    /// Image point limit is `base + diagonal / divisor`.
    pub image_point_base: f64,
    pub image_point_divisor: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            margin: 0.1,
            intersection_limit_full: 0.02,
            intersection_limit_half: 0.03,
            intersection_limit_quarter: 0.05,
            transformation_divisor: 10_000.0,
            transformation_offset: 0.02,
            alignment_residual_factor: 3.0,
            temperature_drift_limit: 2.0,
            image_point_base: 0.05,
            image_point_divisor: 100_000.0,
        }
    }
}

impl CellConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let margin = self.verification.margin;
        if !(0.0..=1.0).contains(&margin) {
            return Err(ConfigError::Invalid(format!(
                "verification.margin must be within [0, 1], got {margin}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.link.peer_port == 0 {
            return Err(ConfigError::Invalid("link.peer_port must not be 0".to_owned()));
        }
        if self.link.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "link.poll_interval_ms must not be 0".to_owned(),
            ));
        }
        let link = &self.link;
        let durations = [
            ("link.poll_interval_ms", Duration::from_millis(link.poll_interval_ms)),
            ("link.alive_timeout_secs", Duration::from_secs(link.alive_timeout_secs)),
            ("link.phase_timeout_secs", Duration::from_secs(link.phase_timeout_secs)),
            ("link.handshake_timeout_secs", Duration::from_secs(link.handshake_timeout_secs)),
            ("link.reconnect_interval_ms", Duration::from_millis(link.reconnect_interval_ms)),
            ("retry.operator_timeout_secs", Duration::from_secs(self.retry.operator_timeout_secs)),
        ];
        for (name, value) in durations {
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{name} exceeds {}s",
                    MAX_DURATION.as_secs()
                )));
            }
        }
        let v = &self.verification;
        if v.transformation_divisor <= 0.0 || v.image_point_divisor <= 0.0 {
            return Err(ConfigError::Invalid(
                "verification divisors must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = CellConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.link.alive_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.link.phase_timeout(), Timeout::Duration(Duration::from_secs(600)));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.verification.margin, 0.1);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let cfg = CellConfig::from_toml_str(
            r#"
            [link]
            peer_host = "cell-b"
            role = "secondary"
            phase_timeout_secs = 0

            [verification]
            margin = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.link.peer_host, "cell-b");
        assert_eq!(cfg.link.peer_port, 7410);
        assert_eq!(cfg.link.role, CellRole::Secondary);
        assert_eq!(cfg.link.phase_timeout(), Timeout::Infinite);
        assert_eq!(cfg.verification.margin, 0.25);
        assert_eq!(cfg.verification.intersection_limit_full, 0.02);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for doc in [
            "[verification]\nmargin = 1.5",
            "[verification]\nmargin = -0.1",
            "[retry]\nmax_attempts = 0",
            "[link]\npeer_port = 0",
            "[link]\nreconnect_interval_ms = 18446744073709551615",
            "[link]\nphase_timeout_secs = 86401",
            "[link]\nalive_timeout_secs = 18446744073709551615",
            "[retry]\noperator_timeout_secs = 604800",
        ] {
            assert!(
                matches!(CellConfig::from_toml_str(doc), Err(ConfigError::Invalid(_))),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn unvalidated_durations_are_clamped() {
        let mut cfg = CellConfig::default();
        cfg.link.reconnect_interval_ms = u64::MAX;
        cfg.link.phase_timeout_secs = u64::MAX;
        cfg.retry.operator_timeout_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        assert_eq!(cfg.link.reconnect_interval(), MAX_DURATION);
        assert_eq!(cfg.link.phase_timeout(), Timeout::Duration(MAX_DURATION));
        assert_eq!(cfg.retry.operator_timeout(), Timeout::Duration(MAX_DURATION));
        assert_eq!(CellConfig::default().link.alive_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_role_is_parse_error() {
        let err = CellConfig::from_toml_str("[link]\nrole = \"tertiary\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 5").unwrap();
        let cfg = CellConfig::load(file.path()).unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);

        let missing = CellConfig::load(file.path().with_extension("absent"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
