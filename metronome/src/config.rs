/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Scheduler configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! scheduler:
//!   u_lub_percent: 95          # utilisation ceiling, integer percent < 100
//!   min_period_us: 1000        # smallest accepted reservation period
//!   spare_percent: 0           # bandwidth withheld from guaranteed minima
//!   instant_setparams: false   # grant budget increases mid-instance
//!   expand: false              # proportionally expand requests up to the cap
//!   dispatch_priority: 50      # advisory host priority for dispatched tasks
//! ```
//!
//! Every field is optional; partial files are accepted gracefully and the
//! missing values fall back to their defaults. Embedders that do not ship a
//! file use [`SchedConfig::default`].

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::bandwidth::Bw;
use crate::error::{QosError, QosResult};
use crate::time::Duration;

// ── Private YAML deserialization types ────────────────────────────────────────

/// Top-level wrapper that maps directly onto the YAML file layout.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scheduler: ConfigEntry,
}

/// Raw fields as they appear in the file; defaults mirror [`SchedConfig`].
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfigEntry {
    u_lub_percent: u32,
    min_period_us: i64,
    spare_percent: u32,
    instant_setparams: bool,
    expand: bool,
    dispatch_priority: i32,
}

impl Default for ConfigEntry {
    fn default() -> Self {
        ConfigEntry {
            u_lub_percent: 95,
            min_period_us: 1_000,
            spare_percent: 0,
            instant_setparams: false,
            expand: false,
            dispatch_priority: 50,
        }
    }
}

// ── SchedConfig ───────────────────────────────────────────────────────────────

/// Validated scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Utilisation ceiling enforced by admission, as an integer percentage.
    /// Kept below 100 to absorb scheduling overhead.
    pub u_lub_percent: u32,

    /// Smallest accepted reservation period.
    pub min_period: Duration,

    /// Bandwidth withheld from the guaranteed-minimum admission test, as an
    /// integer percentage.
    pub spare_percent: u32,

    /// Grant a budget increase to the running instance immediately instead
    /// of at the next recharge.
    pub instant_setparams: bool,

    /// Proportionally expand per-user requests up to the per-user cap when
    /// total demand is below it.
    pub expand: bool,

    /// Advisory real-time priority a host should give dispatched tasks.
    pub dispatch_priority: i32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig::from_entry(ConfigEntry::default())
    }
}

impl SchedConfig {
    fn from_entry(e: ConfigEntry) -> Self {
        SchedConfig {
            u_lub_percent: e.u_lub_percent,
            min_period: Duration::from_usec(e.min_period_us),
            spare_percent: e.spare_percent,
            instant_setparams: e.instant_setparams,
            expand: e.expand,
            dispatch_priority: e.dispatch_priority,
        }
    }

    /// Parse `path` into a validated configuration.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, the YAML is
    /// structurally invalid, or a value fails [`validate`](Self::validate).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading scheduler configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        let cfg = SchedConfig::from_entry(file.scheduler);
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("invalid scheduler configuration: {e}"))?;

        info!(
            u_lub_percent = cfg.u_lub_percent,
            min_period_us = cfg.min_period.as_usec(),
            spare_percent = cfg.spare_percent,
            instant_setparams = cfg.instant_setparams,
            expand = cfg.expand,
            "Scheduler configuration loaded"
        );
        Ok(cfg)
    }

    /// Structural validation shared by the file loader and embedded use.
    pub fn validate(&self) -> QosResult<()> {
        if self.u_lub_percent == 0 || self.u_lub_percent >= 100 {
            warn!(
                u_lub_percent = self.u_lub_percent,
                "utilisation ceiling must be within (0, 100)"
            );
            return Err(QosError::InvalidParam);
        }
        if !self.min_period.is_positive() {
            warn!(
                min_period_us = self.min_period.as_usec(),
                "minimum period must be positive"
            );
            return Err(QosError::InvalidParam);
        }
        if self.spare_percent >= self.u_lub_percent {
            warn!(
                spare_percent = self.spare_percent,
                u_lub_percent = self.u_lub_percent,
                "spare reservation must stay below the utilisation ceiling"
            );
            return Err(QosError::InvalidParam);
        }
        Ok(())
    }

    /// The utilisation ceiling as a bandwidth.
    pub fn u_lub(&self) -> Bw {
        Bw::from_percent(self.u_lub_percent)
    }

    /// Ceiling plus one percentage point of tolerance, used by the scheduler
    /// admission test to absorb cumulative fixed-point rounding between the
    /// supervisor and the scheduler.
    pub fn u_lub2(&self) -> Bw {
        self.u_lub().saturating_add(Bw::from_percent(1))
    }

    /// The configured spare as a bandwidth.
    pub fn spare(&self) -> Bw {
        Bw::from_percent(self.spare_percent)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_config_has_expected_values() {
        let cfg = SchedConfig::default();
        assert_eq!(cfg.u_lub_percent, 95);
        assert_eq!(cfg.min_period, Duration::from_usec(1_000));
        assert_eq!(cfg.spare_percent, 0);
        assert!(!cfg.instant_setparams);
        assert!(!cfg.expand);
        assert_eq!(cfg.dispatch_priority, 50);
        cfg.validate().unwrap();
    }

    #[test]
    fn u_lub2_adds_one_percent_tolerance() {
        let cfg = SchedConfig::default();
        assert_eq!(
            cfg.u_lub2(),
            Bw::from_percent(95).saturating_add(Bw::from_percent(1))
        );
    }

    // ── load_from_file ────────────────────────────────────────────────────────

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
scheduler:
  u_lub_percent: 80
  min_period_us: 2000
  spare_percent: 10
  instant_setparams: true
  expand: true
  dispatch_priority: 40
"#;
        let f = yaml_tempfile(yaml);
        let cfg = SchedConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.u_lub_percent, 80);
        assert_eq!(cfg.min_period, Duration::from_usec(2_000));
        assert_eq!(cfg.spare_percent, 10);
        assert!(cfg.instant_setparams);
        assert!(cfg.expand);
        assert_eq!(cfg.dispatch_priority, 40);
    }

    #[test]
    fn optional_fields_use_defaults_when_absent() {
        let yaml = "scheduler:\n  u_lub_percent: 90\n";
        let f = yaml_tempfile(yaml);
        let cfg = SchedConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.u_lub_percent, 90);
        assert_eq!(cfg.min_period, Duration::from_usec(1_000));
        assert!(!cfg.expand);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let f = yaml_tempfile("{}\n");
        let cfg = SchedConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.u_lub_percent, 95);
    }

    #[test]
    fn missing_file_returns_error() {
        let result = SchedConfig::load_from_file(Path::new("/nonexistent/path/sched.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("this is: not: valid: yaml: content:::");
        assert!(SchedConfig::load_from_file(f.path()).is_err());
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn ceiling_of_100_percent_is_rejected() {
        let f = yaml_tempfile("scheduler:\n  u_lub_percent: 100\n");
        assert!(SchedConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn zero_min_period_is_rejected() {
        let mut cfg = SchedConfig::default();
        cfg.min_period = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(QosError::InvalidParam));
    }

    #[test]
    fn spare_at_or_above_ceiling_is_rejected() {
        let mut cfg = SchedConfig::default();
        cfg.spare_percent = 95;
        assert_eq!(cfg.validate(), Err(QosError::InvalidParam));
    }
}
