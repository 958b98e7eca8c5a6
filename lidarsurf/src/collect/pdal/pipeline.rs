//! PDAL pipeline descriptions for ground and top-surface rasters

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::collect::global_variables::{CLASS_GROUND, CLASS_NEVER_CLASSIFIED, CLASS_NOISE, NODATA};
use crate::collect::pdal::classification::{ClassificationConfig, GroundFilter, OutlierConfig};
use crate::collect::source::PointCloudSource;
use crate::error::{Result, TerrainError};

/// Cell statistic of a top-surface raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopStatistic {
    /// Highest return of the cell
    Max,
    /// Inverse distance weighted elevation
    Idw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceMode {
    /// Ground points only, lowest elevation per cell (DTM)
    Ground,
    /// Every non-noise point (DSM)
    TopSurface(TopStatistic),
}

impl SurfaceMode {
    /// Short product name, used in cache keys and file names
    pub fn key(&self) -> &'static str {
        match self {
            SurfaceMode::Ground => "ground",
            SurfaceMode::TopSurface(TopStatistic::Max) => "top-max",
            SurfaceMode::TopSurface(TopStatistic::Idw) => "top-idw",
        }
    }

    fn output_type(&self) -> &'static str {
        match self {
            SurfaceMode::Ground => "min",
            SurfaceMode::TopSurface(TopStatistic::Max) => "max",
            SurfaceMode::TopSurface(TopStatistic::Idw) => "idw",
        }
    }

    fn range_limits(&self) -> String {
        match self {
            SurfaceMode::Ground => format!("Classification[{CLASS_GROUND}:{CLASS_GROUND}]"),
            SurfaceMode::TopSurface(_) => format!("Classification![{CLASS_NOISE}:{CLASS_NOISE}]"),
        }
    }
}

/// Raster to produce from a point cloud
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRequest {
    pub mode: SurfaceMode,
    /// Output pixel size in map units
    pub resolution: f64,
    pub classification: ClassificationConfig,
}

impl SurfaceRequest {
    pub fn ground(resolution: f64, classification: ClassificationConfig) -> Self {
        SurfaceRequest {
            mode: SurfaceMode::Ground,
            resolution,
            classification,
        }
    }

    pub fn top_surface(resolution: f64, statistic: TopStatistic, classification: ClassificationConfig) -> Self {
        SurfaceRequest {
            mode: SurfaceMode::TopSurface(statistic),
            resolution,
            classification,
        }
    }
}

/// One PDAL stage: its `type` and options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl Stage {
    fn new(kind: &str, options: Value) -> Self {
        let options = match options {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Stage {
            kind: kind.to_string(),
            options,
        }
    }
}

/// Ordered PDAL stages, reader first and `writers.gdal` last
///
/// The writer has no `filename` nor `gdaldriver`: both are bound by the
/// executor, so a description depends only on its source and request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDescription {
    source: PointCloudSource,
    mode: SurfaceMode,
    stages: Vec<Stage>,
}

impl PipelineDescription {
    pub fn source(&self) -> &PointCloudSource {
        &self.source
    }

    pub fn input(&self) -> &Path {
        &self.source.path
    }

    pub fn mode(&self) -> SurfaceMode {
        self.mode
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stage types in order, e.g. `readers.las`
    pub fn stage_kinds(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.kind.as_str()).collect()
    }

    /// Pipeline JSON with the writer left unbound, the form that is fingerprinted
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&json!({ "pipeline": self.stages }))?)
    }

    /// Pipeline JSON ready for the engine, writing `output` with GDAL `driver`
    pub fn bind(&self, driver: &str, output: &Path) -> Result<String> {
        let mut stages = self.stages.clone();
        if let Some(writer) = stages.last_mut() {
            writer
                .options
                .insert("filename".to_string(), json!(output.to_string_lossy()));
            writer.options.insert("gdaldriver".to_string(), json!(driver));
        }
        Ok(serde_json::to_string_pretty(&json!({ "pipeline": stages }))?)
    }
}

/// Build the pipeline producing `request` from `source`
///
/// Stages: reader, outlier flagging, classification reset (noise kept),
/// ground filter ignoring noise, class range, GDAL writer.
pub fn build(source: &PointCloudSource, request: &SurfaceRequest) -> Result<PipelineDescription> {
    source.validate()?;
    request.classification.validate()?;
    if !(request.resolution.is_finite() && request.resolution > 0.0) {
        return Err(TerrainError::InvalidConfig {
            variant: "surface_request",
            keys: vec![format!("resolution={}", request.resolution)],
            reason: "resolution must be a positive number".to_string(),
        });
    }

    let mut reader = Stage::new(
        "readers.las",
        json!({ "filename": source.path.to_string_lossy() }),
    );
    if let Some(crs) = &source.crs {
        reader
            .options
            .insert("spatialreference".to_string(), json!(crs.to_definition()));
    }

    let stages = vec![
        reader,
        outlier_stage(&request.classification.outlier),
        Stage::new(
            "filters.assign",
            json!({
                "value": format!(
                    "Classification = {CLASS_NEVER_CLASSIFIED} WHERE Classification != {CLASS_NOISE}"
                )
            }),
        ),
        ground_stage(&request.classification.filter),
        Stage::new("filters.range", json!({ "limits": request.mode.range_limits() })),
        Stage::new(
            "writers.gdal",
            json!({
                "resolution": request.resolution,
                "output_type": request.mode.output_type(),
                "nodata": NODATA,
                "data_type": "float64",
            }),
        ),
    ];

    let description = PipelineDescription {
        source: source.clone(),
        mode: request.mode,
        stages,
    };
    debug!(
        "pipeline for {:?} ({}, {} m): {}",
        source.path,
        request.mode.key(),
        request.resolution,
        description.stage_kinds().join(" -> ")
    );
    Ok(description)
}

fn outlier_stage(outlier: &OutlierConfig) -> Stage {
    match *outlier {
        OutlierConfig::Statistical { mean_k, multiplier } => Stage::new(
            "filters.outlier",
            json!({ "method": "statistical", "mean_k": mean_k, "multiplier": multiplier }),
        ),
        OutlierConfig::Radius { radius, min_k } => Stage::new(
            "filters.outlier",
            json!({ "method": "radius", "radius": radius, "min_k": min_k }),
        ),
    }
}

fn ground_stage(filter: &GroundFilter) -> Stage {
    let ignore = format!("Classification[{CLASS_NOISE}:{CLASS_NOISE}]");
    match filter {
        GroundFilter::ClothSimulation(p) => Stage::new(
            "filters.csf",
            json!({
                "resolution": p.resolution,
                "threshold": p.threshold,
                "rigidness": p.rigidness,
                "iterations": p.iterations,
                "step": p.time_step,
                "ignore": ignore,
            }),
        ),
        GroundFilter::ProgressiveMorphological(p) => Stage::new(
            "filters.pmf",
            json!({
                "max_window_size": p.max_window_size,
                "slope": p.slope,
                "initial_distance": p.initial_distance,
                "max_distance": p.max_distance,
                "cell_size": p.cell_size,
                "ignore": ignore,
            }),
        ),
        GroundFilter::SimpleMorphological(p) => Stage::new(
            "filters.smrf",
            json!({
                "slope": p.slope,
                "window": p.window,
                "threshold": p.threshold,
                "scalar": p.scalar,
                "cell": p.cell,
                "ignore": ignore,
            }),
        ),
    }
}

/// Stage of `kinds` named in engine diagnostics, latest mention first
///
/// PDAL prefixes its errors with the stage type (`filters.csf: ...`), so the
/// last stage type mentioned is taken as the failing one. When a type occurs
/// more than once in the pipeline the first occurrence is reported.
pub fn failing_stage(kinds: &[&str], diagnostics: &str) -> Option<(usize, String)> {
    kinds
        .iter()
        .enumerate()
        .filter_map(|(index, kind)| diagnostics.rfind(kind).map(|pos| (pos, index, *kind)))
        .max_by_key(|(pos, index, _)| (*pos, std::cmp::Reverse(*index)))
        .map(|(_, index, kind)| (index, kind.to_string()))
}

/// Path bound as the writer output inside `dir`
pub fn output_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    dir.join(format!("{stem}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::pdal::classification::{
        ClothSimulationParams, ProgressiveMorphologicalParams, SimpleMorphologicalParams,
    };
    use crate::geo_core::Crs;

    fn source(dir: &Path, crs: Option<Crs>) -> PointCloudSource {
        let path = dir.join("tile.laz");
        std::fs::write(&path, b"LASF").unwrap();
        PointCloudSource::with_crs(&path, crs).unwrap()
    }

    fn csf() -> ClassificationConfig {
        ClassificationConfig::new(GroundFilter::ClothSimulation(ClothSimulationParams {
            threshold: 0.35,
            resolution: 1.0,
            rigidness: 1,
            iterations: 500,
            time_step: 0.65,
        }))
    }

    #[test]
    fn test_ground_pipeline_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), Some(Crs::from_epsg(2154)));
        let description = build(&src, &SurfaceRequest::ground(1.0, csf())).unwrap();
        assert_eq!(
            description.stage_kinds(),
            vec![
                "readers.las",
                "filters.outlier",
                "filters.assign",
                "filters.csf",
                "filters.range",
                "writers.gdal"
            ]
        );
        let stages = description.stages();
        assert_eq!(stages[0].options["spatialreference"], "EPSG:2154");
        assert_eq!(stages[2].options["value"], "Classification = 0 WHERE Classification != 7");
        assert_eq!(stages[3].options["threshold"], 0.35);
        assert_eq!(stages[3].options["step"], 0.65);
        assert_eq!(stages[3].options["ignore"], "Classification[7:7]");
        assert_eq!(stages[4].options["limits"], "Classification[2:2]");
        assert_eq!(stages[5].options["output_type"], "min");
        assert_eq!(stages[5].options["nodata"], -9999.0);
        assert_eq!(stages[5].options["resolution"], 1.0);
        assert!(!stages[5].options.contains_key("filename"));
    }

    #[test]
    fn test_morphological_filters_use_pdal_names() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), None);

        let pmf = ClassificationConfig::new(GroundFilter::ProgressiveMorphological(
            ProgressiveMorphologicalParams {
                max_window_size: 20.0,
                slope: 0.8,
                initial_distance: 0.3,
                max_distance: 3.0,
                cell_size: 0.5,
            },
        ));
        let description = build(&src, &SurfaceRequest::ground(1.0, pmf)).unwrap();
        let stage = &description.stages()[3];
        assert_eq!(stage.kind, "filters.pmf");
        let expected: BTreeMap<String, Value> = serde_json::from_value(json!({
            "max_window_size": 20.0,
            "slope": 0.8,
            "initial_distance": 0.3,
            "max_distance": 3.0,
            "cell_size": 0.5,
            "ignore": "Classification[7:7]",
        }))
        .unwrap();
        assert_eq!(stage.options, expected);

        let smrf = ClassificationConfig::new(GroundFilter::SimpleMorphological(SimpleMorphologicalParams {
            slope: 0.2,
            window: 16.0,
            threshold: 0.45,
            scalar: 1.2,
            cell: 1.0,
        }));
        let description = build(&src, &SurfaceRequest::ground(1.0, smrf)).unwrap();
        let stage = &description.stages()[3];
        assert_eq!(stage.kind, "filters.smrf");
        let expected: BTreeMap<String, Value> = serde_json::from_value(json!({
            "slope": 0.2,
            "window": 16.0,
            "threshold": 0.45,
            "scalar": 1.2,
            "cell": 1.0,
            "ignore": "Classification[7:7]",
        }))
        .unwrap();
        assert_eq!(stage.options, expected);
    }

    #[test]
    fn test_radius_outlier_stage() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), None);
        let classification = csf().with_outlier(OutlierConfig::Radius { radius: 1.5, min_k: 4 });
        let description = build(&src, &SurfaceRequest::ground(1.0, classification)).unwrap();
        let stage = &description.stages()[1];
        assert_eq!(stage.kind, "filters.outlier");
        assert_eq!(stage.options["method"], "radius");
        assert_eq!(stage.options["radius"], 1.5);
        assert_eq!(stage.options["min_k"], 4);
        assert!(!stage.options.contains_key("mean_k"));
    }

    #[test]
    fn test_top_surface_keeps_all_but_noise() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), None);
        let request = SurfaceRequest::top_surface(0.5, TopStatistic::Idw, csf());
        let description = build(&src, &request).unwrap();
        let stages = description.stages();
        assert!(!stages[0].options.contains_key("spatialreference"));
        assert_eq!(stages[4].options["limits"], "Classification![7:7]");
        assert_eq!(stages[5].options["output_type"], "idw");
    }

    #[test]
    fn test_build_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), Some(Crs::from_epsg(2154)));
        let request = SurfaceRequest::ground(1.0, csf());
        let a = build(&src, &request).unwrap();
        let b = build(&src, &request).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
    }

    #[test]
    fn test_bind_sets_writer_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), None);
        let description = build(&src, &SurfaceRequest::ground(2.0, csf())).unwrap();
        let bound = description.bind("GTiff", Path::new("/tmp/out.tif")).unwrap();
        let value: Value = serde_json::from_str(&bound).unwrap();
        assert_eq!(value["pipeline"][5]["filename"], "/tmp/out.tif");
        assert_eq!(value["pipeline"][5]["gdaldriver"], "GTiff");
        assert!(value["pipeline"][0].get("gdaldriver").is_none());
    }

    #[test]
    fn test_build_rejects_missing_input_and_bad_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), None);
        assert!(matches!(
            build(&src, &SurfaceRequest::ground(0.0, csf())),
            Err(TerrainError::InvalidConfig { .. })
        ));

        std::fs::remove_file(&src.path).unwrap();
        assert!(matches!(
            build(&src, &SurfaceRequest::ground(1.0, csf())),
            Err(TerrainError::InputNotFound { .. })
        ));
    }

    #[test]
    fn test_failing_stage() {
        let kinds = ["readers.las", "filters.outlier", "filters.csf", "writers.gdal"];
        let diagnostics = "PDAL: filters.csf: Option 'rigidness' must be between 1 and 3.";
        assert_eq!(failing_stage(&kinds, diagnostics), Some((2, "filters.csf".to_string())));
        assert_eq!(failing_stage(&kinds, "Segmentation fault"), None);
    }
}
