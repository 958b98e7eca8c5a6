//! Ground classification algorithms and their parameters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use crate::error::{Result, TerrainError};

/// Cloth simulation filter (Zhang et al. 2016), PDAL `filters.csf`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClothSimulationParams {
    /// Height above the cloth below which a point is ground
    pub threshold: f64,
    /// Cloth resolution in map units
    pub resolution: f64,
    /// 1 (steep) to 3 (flat)
    pub rigidness: u32,
    pub iterations: u32,
    pub time_step: f64,
}

impl Default for ClothSimulationParams {
    fn default() -> Self {
        ClothSimulationParams {
            threshold: 0.5,
            resolution: 1.0,
            rigidness: 3,
            iterations: 500,
            time_step: 0.65,
        }
    }
}

/// Progressive morphological filter (Zhang et al. 2003), PDAL `filters.pmf`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressiveMorphologicalParams {
    pub max_window_size: f64,
    pub slope: f64,
    pub initial_distance: f64,
    pub max_distance: f64,
    pub cell_size: f64,
}

impl Default for ProgressiveMorphologicalParams {
    fn default() -> Self {
        ProgressiveMorphologicalParams {
            max_window_size: 33.0,
            slope: 1.0,
            initial_distance: 0.15,
            max_distance: 2.5,
            cell_size: 1.0,
        }
    }
}

/// Simple morphological filter (Pingel et al. 2013), PDAL `filters.smrf`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimpleMorphologicalParams {
    pub slope: f64,
    pub window: f64,
    pub threshold: f64,
    pub scalar: f64,
    pub cell: f64,
}

impl Default for SimpleMorphologicalParams {
    fn default() -> Self {
        SimpleMorphologicalParams {
            slope: 0.15,
            window: 18.0,
            threshold: 0.5,
            scalar: 1.25,
            cell: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum GroundFilter {
    ClothSimulation(ClothSimulationParams),
    ProgressiveMorphological(ProgressiveMorphologicalParams),
    SimpleMorphological(SimpleMorphologicalParams),
}

impl GroundFilter {
    pub fn name(&self) -> &'static str {
        match self {
            GroundFilter::ClothSimulation(_) => "cloth_simulation",
            GroundFilter::ProgressiveMorphological(_) => "progressive_morphological",
            GroundFilter::SimpleMorphological(_) => "simple_morphological",
        }
    }
}

/// Noise removal run before classification; flagged points get class 7
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OutlierConfig {
    /// Mean distance to `mean_k` neighbours beyond `multiplier` standard deviations
    Statistical { mean_k: u32, multiplier: f64 },
    /// Fewer than `min_k` neighbours within `radius`
    Radius { radius: f64, min_k: u32 },
}

impl Default for OutlierConfig {
    fn default() -> Self {
        OutlierConfig::Statistical {
            mean_k: 8,
            multiplier: 2.0,
        }
    }
}

/// Ground classification request: one algorithm with its parameters, plus
/// the outlier removal run before it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub filter: GroundFilter,
    pub outlier: OutlierConfig,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        ClassificationConfig::new(GroundFilter::ClothSimulation(ClothSimulationParams::default()))
    }
}

const CSF_KEYS: &[&str] = &["threshold", "resolution", "rigidness", "iterations", "time_step"];
const PMF_KEYS: &[&str] = &[
    "max_window_size",
    "slope",
    "initial_distance",
    "max_distance",
    "cell_size",
];
const SMRF_KEYS: &[&str] = &["slope", "window", "threshold", "scalar", "cell"];
const STATISTICAL_KEYS: &[&str] = &["outlier_mean_k", "outlier_multiplier"];
const RADIUS_KEYS: &[&str] = &["outlier_radius", "outlier_min_k"];

impl ClassificationConfig {
    /// Config with the default outlier removal
    pub fn new(filter: GroundFilter) -> Self {
        ClassificationConfig {
            filter,
            outlier: OutlierConfig::default(),
        }
    }

    pub fn with_outlier(mut self, outlier: OutlierConfig) -> Self {
        self.outlier = outlier;
        self
    }

    /// Build a config from named parameters, as received from a web form
    ///
    /// `variant` is `csf`, `pmf` or `smrf` (or the long snake_case names).
    /// Parameters not given take their defaults. Outlier removal is set with
    /// `outlier_mean_k`/`outlier_multiplier` (statistical) or
    /// `outlier_radius`/`outlier_min_k` (radius). Every unknown key is
    /// reported in one `InvalidConfig` error, then every out-of-range value.
    pub fn from_params(variant: &str, params: &BTreeMap<String, f64>) -> Result<Self> {
        let (variant, allowed): (&'static str, &[&str]) = match variant.to_ascii_lowercase().as_str() {
            "csf" | "cloth_simulation" => ("cloth_simulation", CSF_KEYS),
            "pmf" | "progressive_morphological" => ("progressive_morphological", PMF_KEYS),
            "smrf" | "simple_morphological" => ("simple_morphological", SMRF_KEYS),
            _ => {
                return Err(TerrainError::InvalidConfig {
                    variant: "classification",
                    keys: vec![variant.to_string()],
                    reason: "unknown classification algorithm, expected csf, pmf or smrf"
                        .to_string(),
                })
            }
        };

        let unknown: Vec<String> = params
            .keys()
            .filter(|k| {
                let k = k.as_str();
                !allowed.contains(&k) && !STATISTICAL_KEYS.contains(&k) && !RADIUS_KEYS.contains(&k)
            })
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(TerrainError::InvalidConfig {
                variant,
                keys: unknown,
                reason: format!("unknown parameters, allowed: {}", allowed.join(", ")),
            });
        }

        let get = |key: &str, default: f64| params.get(key).copied().unwrap_or(default);
        let filter = match variant {
            "cloth_simulation" => {
                let d = ClothSimulationParams::default();
                GroundFilter::ClothSimulation(ClothSimulationParams {
                    threshold: get("threshold", d.threshold),
                    resolution: get("resolution", d.resolution),
                    rigidness: integer(variant, "rigidness", get("rigidness", d.rigidness as f64))?,
                    iterations: integer(variant, "iterations", get("iterations", d.iterations as f64))?,
                    time_step: get("time_step", d.time_step),
                })
            }
            "progressive_morphological" => {
                let d = ProgressiveMorphologicalParams::default();
                GroundFilter::ProgressiveMorphological(ProgressiveMorphologicalParams {
                    max_window_size: get("max_window_size", d.max_window_size),
                    slope: get("slope", d.slope),
                    initial_distance: get("initial_distance", d.initial_distance),
                    max_distance: get("max_distance", d.max_distance),
                    cell_size: get("cell_size", d.cell_size),
                })
            }
            _ => {
                let d = SimpleMorphologicalParams::default();
                GroundFilter::SimpleMorphological(SimpleMorphologicalParams {
                    slope: get("slope", d.slope),
                    window: get("window", d.window),
                    threshold: get("threshold", d.threshold),
                    scalar: get("scalar", d.scalar),
                    cell: get("cell", d.cell),
                })
            }
        };

        let has = |keys: &[&str]| keys.iter().any(|k| params.contains_key(*k));
        let outlier = match (has(STATISTICAL_KEYS), has(RADIUS_KEYS)) {
            (true, true) => {
                return Err(TerrainError::InvalidConfig {
                    variant: "outlier",
                    keys: params
                        .keys()
                        .filter(|k| k.starts_with("outlier_"))
                        .cloned()
                        .collect(),
                    reason: "statistical and radius outlier parameters are exclusive".to_string(),
                })
            }
            (false, true) => OutlierConfig::Radius {
                radius: get("outlier_radius", 1.0),
                min_k: integer("outlier", "outlier_min_k", get("outlier_min_k", 2.0))?,
            },
            _ => OutlierConfig::Statistical {
                mean_k: integer("outlier", "outlier_mean_k", get("outlier_mean_k", 8.0))?,
                multiplier: get("outlier_multiplier", 2.0),
            },
        };

        let config = ClassificationConfig { filter, outlier };
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter against its allowed range
    pub fn validate(&self) -> Result<()> {
        let mut offending = Vec::new();
        let mut check = |key: &str, value: f64, range: RangeInclusive<f64>| {
            if !value.is_finite() || !range.contains(&value) {
                offending.push(format!("{key}={value} (allowed {}..={})", range.start(), range.end()));
            }
        };

        match &self.filter {
            GroundFilter::ClothSimulation(p) => {
                check("threshold", p.threshold, 0.01..=10.0);
                check("resolution", p.resolution, 0.05..=20.0);
                check("rigidness", p.rigidness as f64, 1.0..=3.0);
                check("iterations", p.iterations as f64, 1.0..=10000.0);
                check("time_step", p.time_step, 0.01..=1.0);
            }
            GroundFilter::ProgressiveMorphological(p) => {
                check("max_window_size", p.max_window_size, 1.0..=500.0);
                check("slope", p.slope, 0.0..=10.0);
                check("initial_distance", p.initial_distance, 0.0..=100.0);
                check("max_distance", p.max_distance, 0.0..=500.0);
                check("cell_size", p.cell_size, 0.05..=20.0);
            }
            GroundFilter::SimpleMorphological(p) => {
                check("slope", p.slope, 0.0..=10.0);
                check("window", p.window, 1.0..=500.0);
                check("threshold", p.threshold, 0.0..=100.0);
                check("scalar", p.scalar, 0.0..=100.0);
                check("cell", p.cell, 0.05..=20.0);
            }
        }
        match self.outlier {
            OutlierConfig::Statistical { mean_k, multiplier } => {
                check("outlier_mean_k", mean_k as f64, 1.0..=1000.0);
                check("outlier_multiplier", multiplier, 0.01..=100.0);
            }
            OutlierConfig::Radius { radius, min_k } => {
                check("outlier_radius", radius, 0.01..=100.0);
                check("outlier_min_k", min_k as f64, 1.0..=1000.0);
            }
        }

        if offending.is_empty() {
            Ok(())
        } else {
            Err(TerrainError::InvalidConfig {
                variant: self.filter.name(),
                keys: offending,
                reason: "parameter out of range".to_string(),
            })
        }
    }
}

/// Integer parameter received as a float
fn integer(variant: &'static str, key: &str, value: f64) -> Result<u32> {
    if value.fract() != 0.0 || !(0.0..=u32::MAX as f64).contains(&value) {
        return Err(TerrainError::InvalidConfig {
            variant,
            keys: vec![format!("{key}={value}")],
            reason: "expected a non-negative integer".to_string(),
        });
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_csf_from_params() {
        let config = ClassificationConfig::from_params(
            "csf",
            &params(&[
                ("threshold", 0.35),
                ("resolution", 1.0),
                ("rigidness", 1.0),
                ("iterations", 500.0),
            ]),
        )
        .unwrap();
        assert_eq!(
            config.filter,
            GroundFilter::ClothSimulation(ClothSimulationParams {
                threshold: 0.35,
                resolution: 1.0,
                rigidness: 1,
                iterations: 500,
                time_step: 0.65,
            })
        );
        assert_eq!(config.outlier, OutlierConfig::default());
    }

    #[test]
    fn test_unknown_keys_all_listed() {
        let err = ClassificationConfig::from_params(
            "smrf",
            &params(&[("slope", 0.2), ("rigidness", 2.0), ("bogus", 1.0)]),
        )
        .unwrap_err();
        match err {
            TerrainError::InvalidConfig { variant, keys, .. } => {
                assert_eq!(variant, "simple_morphological");
                assert_eq!(keys, vec!["bogus", "rigidness"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range() {
        let err = ClassificationConfig::from_params(
            "pmf",
            &params(&[("slope", 12.0), ("cell_size", 0.0)]),
        )
        .unwrap_err();
        match err {
            TerrainError::InvalidConfig { keys, .. } => {
                assert_eq!(keys.len(), 2);
                assert!(keys[0].starts_with("slope=12"));
                assert!(keys[1].starts_with("cell_size=0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fractional_integer_rejected() {
        assert!(ClassificationConfig::from_params("csf", &params(&[("rigidness", 1.5)])).is_err());
    }

    #[test]
    fn test_unknown_variant() {
        assert!(ClassificationConfig::from_params("kriging", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_outlier_selection() {
        let radius = ClassificationConfig::from_params(
            "smrf",
            &params(&[("outlier_radius", 2.0)]),
        )
        .unwrap();
        assert_eq!(radius.outlier, OutlierConfig::Radius { radius: 2.0, min_k: 2 });

        let mixed = ClassificationConfig::from_params(
            "smrf",
            &params(&[("outlier_radius", 2.0), ("outlier_mean_k", 12.0)]),
        );
        assert!(mixed.is_err());
    }

    #[test]
    fn test_defaults_validate() {
        for filter in [
            GroundFilter::ClothSimulation(Default::default()),
            GroundFilter::ProgressiveMorphological(Default::default()),
            GroundFilter::SimpleMorphological(Default::default()),
        ] {
            ClassificationConfig::new(filter).validate().unwrap();
        }
    }

    #[test]
    fn test_serde_tagged() {
        let config = ClassificationConfig::default();
        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["filter"]["algorithm"], "cloth_simulation");
        assert_eq!(json["outlier"]["method"], "statistical");
    }
}
