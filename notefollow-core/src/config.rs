//! # Configuration Module
//!
//! Every tunable of the engine in one serialisable tree. Each component keeps
//! its own `*Config` with tuned defaults; [`EngineConfig`] aggregates them and
//! persists to JSON.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{ensure_range, FollowError, Result};
use crate::follower::FollowerConfig;
use crate::lite::LiteConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::remote::ProConfig;
use crate::timing::TimingConfig;

/// Gate thresholds produced by calibration and consumed by the Lite path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    /// Silence gate for the pitch detector.
    pub min_rms: f32,
    /// Highest CMND dip still accepted as a pitch.
    pub max_cmnd: f32,
    /// RMS ratio that counts as a re-strike.
    pub onset_ratio: f32,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_rms: 0.005,
            max_cmnd: 0.5,
            onset_ratio: 1.3,
        }
    }
}

impl GateThresholds {
    pub fn validate(&self) -> Result<()> {
        ensure_range("thresholds.min_rms", self.min_rms, 0.0, 1.0)?;
        ensure_range("thresholds.max_cmnd", self.max_cmnd, 0.0, 1.0)?;
        if !(self.onset_ratio.is_finite() && self.onset_ratio > 1.0) {
            return Err(FollowError::config("thresholds.onset_ratio", "must be > 1"));
        }
        Ok(())
    }

    /// Writes these thresholds into the pitch detector and gate settings.
    pub fn apply_to(&self, config: &mut EngineConfig) {
        config.lite.pitch.min_rms = self.min_rms;
        config.lite.pitch.min_confidence = 1.0 - self.max_cmnd;
        config.lite.emitter.gate.onset_ratio = self.onset_ratio;
        config.thresholds = *self;
    }
}

/// The whole engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lite: LiteConfig,
    pub pro: ProConfig,
    pub follower: FollowerConfig,
    pub timing: TimingConfig,
    pub orchestrator: OrchestratorConfig,
    /// Last thresholds applied (informational; `apply_to` already copied
    /// them into `lite`).
    pub thresholds: GateThresholds,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.lite.validate()?;
        self.pro.validate()?;
        self.follower.validate()?;
        self.timing.validate()?;
        self.orchestrator.validate()?;
        self.thresholds.validate()
    }

    /// Default configuration with calibrated thresholds applied.
    pub fn calibrated(thresholds: GateThresholds) -> Result<Self> {
        thresholds.validate()?;
        let mut config = EngineConfig::default();
        thresholds.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON config file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        Self::from_json_str(&data)
    }

    /// Saves the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
