//! Configuration surface consumed by the Session Supervisor (§6.3). The
//! engine itself never reads or writes a config file from disk; that is
//! the ConfigStore collaborator's job. `ScopeConfig` is the in-memory
//! value ConfigStore hands to `SessionSupervisor::start`, plus `load_from_file`
//! / `save_to_file` for callers (tests, demos) that want TOML persistence
//! without depending on a real ConfigStore.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScopeError};
use crate::types::PatternFamily;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub pattern_family: PatternFamily,
    pub pattern_count: u32,
    pub exposure_time_s: f32,
    /// 1..5; affects JPEG quality and stabilisation multipliers.
    pub quality: u8,
    pub frame_store_capacity: usize,
    /// `None` means "hardware parallelism - 1, minimum 1" at construction.
    pub worker_count: Option<usize>,
    pub memory_budget_mb: u64,
    pub clipping_cube_mm: f32,
    pub outlier_knn: usize,
    pub outlier_sigma: f32,
    pub voxel_size_mm: f32,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            pattern_family: PatternFamily::Progressive,
            pattern_count: 24,
            exposure_time_s: 0.5,
            quality: 3,
            frame_store_capacity: 100,
            worker_count: None,
            memory_budget_mb: 2048,
            clipping_cube_mm: 500.0,
            outlier_knn: 20,
            outlier_sigma: 2.0,
            voxel_size_mm: 0.5,
        }
    }
}

impl ScopeConfig {
    /// Checks the bounds declared in §6.3. Does not touch `worker_count`,
    /// `frame_store_capacity` or `memory_budget_mb` floors since those are
    /// clamped rather than rejected by their owning components.
    pub fn validate(&self) -> Result<()> {
        if self.pattern_family == PatternFamily::PhaseShift {
            return Err(ScopeError::Config(
                "phase_shift pattern family is not implemented".to_string(),
            ));
        }
        if !(4..=64).contains(&self.pattern_count) {
            return Err(ScopeError::Config(format!(
                "pattern_count must be in 4..=64, got {}",
                self.pattern_count
            )));
        }
        if !(0.1..=2.0).contains(&self.exposure_time_s) {
            return Err(ScopeError::Config(format!(
                "exposure_time_s must be in 0.1..=2.0, got {}",
                self.exposure_time_s
            )));
        }
        if !(1..=5).contains(&self.quality) {
            return Err(ScopeError::Config(format!(
                "quality must be in 1..=5, got {}",
                self.quality
            )));
        }
        if self.clipping_cube_mm <= 0.0 {
            return Err(ScopeError::Config(
                "clipping_cube_mm must be positive".to_string(),
            ));
        }
        if self.outlier_knn == 0 {
            return Err(ScopeError::Config(
                "outlier_knn must be at least 1".to_string(),
            ));
        }
        if self.voxel_size_mm <= 0.0 {
            return Err(ScopeError::Config(
                "voxel_size_mm must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScopeConfig = toml::from_str(&content)
            .map_err(|e| ScopeError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ScopeError::Config(format!("failed to serialise config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolves `worker_count`, falling back to hardware parallelism minus
    /// one (floor 1) when unset.
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ScopeConfig::default().validate().is_ok());
    }

    #[test]
    fn phase_shift_family_is_rejected() {
        let mut cfg = ScopeConfig::default();
        cfg.pattern_family = PatternFamily::PhaseShift;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pattern_count_out_of_range_is_rejected() {
        let mut cfg = ScopeConfig::default();
        cfg.pattern_count = 2;
        assert!(cfg.validate().is_err());
        cfg.pattern_count = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.toml");
        let cfg = ScopeConfig::default();
        cfg.save_to_file(&path).unwrap();
        let back = ScopeConfig::load_from_file(&path).unwrap();
        assert_eq!(cfg.pattern_count, back.pattern_count);
    }
}
