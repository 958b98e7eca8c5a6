//! Runtime settings, loaded from JSON and overridden by environment variables

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collect::global_variables::TEMP_PATH;
use crate::error::{Result, TerrainError};

pub const ENV_PDAL: &str = "LIDARSURF_PDAL";
pub const ENV_TIMEOUT_SECS: &str = "LIDARSURF_TIMEOUT_SECS";
pub const ENV_CACHE_DIR: &str = "LIDARSURF_CACHE_DIR";
pub const ENV_OUTPUT_DIR: &str = "LIDARSURF_OUTPUT_DIR";

/// Settings structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub cache: CacheSettings,
    /// Where [`crate::geometric::lidar::Lidar::write_products`] writes by default
    pub output_dir: PathBuf,
    /// Raster resolution in map units
    pub resolution: f64,
    pub fill: FillOptions,
    pub align: AlignOptions,
    pub quality: QualityThresholds,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            engine: EngineSettings::default(),
            cache: CacheSettings::default(),
            output_dir: PathBuf::from(TEMP_PATH),
            resolution: 1.0,
            fill: FillOptions::default(),
            align: AlignOptions::default(),
            quality: QualityThresholds::default(),
        }
    }
}

/// External point-cloud engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Program invoked as `<program> pipeline <file>`
    pub program: PathBuf,
    /// Wall-clock limit for one run
    pub timeout_secs: u64,
}

impl EngineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            program: PathBuf::from("pdal"),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Holds the cached rasters and `index.json`
    pub dir: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            dir: PathBuf::from(TEMP_PATH).join("cache"),
        }
    }
}

/// Nodata repair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillOptions {
    /// Search radius in pixels
    pub max_distance: usize,
    /// 3x3 averaging passes over filled pixels
    pub smoothing_iterations: usize,
}

impl Default for FillOptions {
    fn default() -> Self {
        FillOptions {
            max_distance: 10,
            smoothing_iterations: 2,
        }
    }
}

/// Tolerances used to compare two raster geometries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignOptions {
    /// Relative tolerance on pixel sizes
    pub pixel_size_tolerance: f64,
    /// Tolerance on edges and origins, in pixels
    pub edge_tolerance: f64,
    /// Treat a grid without CRS as matching any CRS
    pub allow_unknown_crs: bool,
}

impl Default for AlignOptions {
    fn default() -> Self {
        AlignOptions {
            pixel_size_tolerance: 1e-6,
            edge_tolerance: 1e-3,
            allow_unknown_crs: false,
        }
    }
}

/// Limits above which a height raster is flagged implausible
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Share of valid pixels allowed below zero
    pub max_negative_fraction: f64,
    /// Share of all pixels that must be valid
    pub min_valid_fraction: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        QualityThresholds {
            max_negative_fraction: 0.10,
            min_valid_fraction: 0.5,
        }
    }
}

impl Settings {
    /// Load settings from a JSON document; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        debug!("loaded settings from {path:?}");
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `LIDARSURF_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(program) = lookup(ENV_PDAL) {
            self.engine.program = PathBuf::from(program);
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT_SECS) {
            self.engine.timeout_secs =
                timeout
                    .trim()
                    .parse()
                    .map_err(|e| TerrainError::InvalidConfig {
                        variant: "settings",
                        keys: vec![ENV_TIMEOUT_SECS.to_string()],
                        reason: format!("{timeout:?} is not a number of seconds: {e}"),
                    })?;
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(dir);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        let mut keys = Vec::new();
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            keys.push("resolution".to_string());
        }
        if self.engine.timeout_secs == 0 {
            keys.push("engine.timeout_secs".to_string());
        }
        if !(self.align.pixel_size_tolerance >= 0.0) {
            keys.push("align.pixel_size_tolerance".to_string());
        }
        if !(self.align.edge_tolerance >= 0.0) {
            keys.push("align.edge_tolerance".to_string());
        }
        for (key, value) in [
            ("quality.max_negative_fraction", self.quality.max_negative_fraction),
            ("quality.min_valid_fraction", self.quality.min_valid_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                keys.push(key.to_string());
            }
        }
        if !keys.is_empty() {
            return Err(TerrainError::InvalidConfig {
                variant: "settings",
                keys,
                reason: "value out of range".to_string(),
            });
        }
        if self.fill.max_distance == 0 {
            warn!("fill.max_distance is 0, gaps will be filled by nearest neighbour only");
        }
        Ok(())
    }
}
