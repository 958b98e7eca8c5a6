use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::collect::pdal::classification::ClassificationConfig;
use crate::collect::pdal::executor::{CachePolicy, Executor};
use crate::collect::pdal::pipeline::{self, SurfaceRequest, TopStatistic};
use crate::collect::source::PointCloudSource;
use crate::config::Settings;
use crate::error::Result;
use crate::geometric::align::{align, AlignmentPlan};
use crate::geometric::chm::{difference, HeightGrid, QualityReport};
use crate::geometric::fill::{fill, FillMethod, FilledGrid};

/// Lidar structure
/// Produces DTM, DSM and CHM rasters from one point cloud file
pub struct Lidar {
    settings: Settings,
    executor: Executor,
    policy: CachePolicy,
}

/// DTM, DSM and the height grid derived from them
#[derive(Debug, Clone)]
pub struct ChmProduct {
    pub dtm: FilledGrid,
    pub dsm: FilledGrid,
    pub plan: AlignmentPlan,
    pub height: HeightGrid,
}

/// Files written by [`Lidar::write_products`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductPaths {
    pub dtm: PathBuf,
    pub dsm: PathBuf,
    pub chm: PathBuf,
    pub report: PathBuf,
}

#[derive(Serialize)]
struct ProductReport<'a> {
    source: &'a Path,
    resolution: f64,
    plan: &'a AlignmentPlan,
    dtm_fill: FillSummary,
    dsm_fill: FillSummary,
    quality: &'a QualityReport,
}

#[derive(Serialize)]
struct FillSummary {
    method: FillMethod,
    filled: usize,
    remaining: usize,
}

impl From<&FilledGrid> for FillSummary {
    fn from(f: &FilledGrid) -> Self {
        FillSummary {
            method: f.method,
            filled: f.filled,
            remaining: f.remaining,
        }
    }
}

impl Lidar {
    /// Create a new Lidar instance running PDAL as configured in `settings`
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let executor = Executor::from_settings(&settings)?;
        Ok(Lidar::with_executor(settings, executor))
    }

    /// Create a Lidar instance around an existing executor
    pub fn with_executor(settings: Settings, executor: Executor) -> Self {
        Lidar {
            settings,
            executor,
            policy: CachePolicy::Use,
        }
    }

    /// Set how engine runs use the cache
    pub fn set_policy(&mut self, policy: CachePolicy) {
        self.policy = policy;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Build, run and gap-fill one surface raster
    pub fn surface(&self, source: &PointCloudSource, request: &SurfaceRequest) -> Result<FilledGrid> {
        let description = pipeline::build(source, request)?;
        let raw = self.executor.execute(&description, self.policy)?;
        fill(&raw, &self.settings.fill)
    }

    /// Ground elevation (DTM)
    pub fn dtm(&self, source: &PointCloudSource, classification: &ClassificationConfig) -> Result<FilledGrid> {
        self.surface(
            source,
            &SurfaceRequest::ground(self.settings.resolution, *classification),
        )
    }

    /// Top-surface elevation (DSM)
    pub fn dsm(
        &self,
        source: &PointCloudSource,
        classification: &ClassificationConfig,
        statistic: TopStatistic,
    ) -> Result<FilledGrid> {
        self.surface(
            source,
            &SurfaceRequest::top_surface(self.settings.resolution, statistic, *classification),
        )
    }

    /// Canopy height model: DSM (highest return) minus DTM
    pub fn chm(&self, source: &PointCloudSource, classification: &ClassificationConfig) -> Result<ChmProduct> {
        let dtm = self.dtm(source, classification)?;
        let dsm = self.dsm(source, classification, TopStatistic::Max)?;
        let (plan, top, ground) = align(&dsm.grid, &dtm.grid, &self.settings.align)?;
        let height = difference(&top, &ground, &self.settings.quality)?;
        info!(
            "CHM for {:?}: {:?}, {}x{}, implausible: {}",
            source.path,
            plan.relation(),
            height.grid.width(),
            height.grid.height(),
            height.report.implausible
        );
        Ok(ChmProduct {
            dtm,
            dsm,
            plan,
            height,
        })
    }

    /// Write DTM, DSM, CHM and a JSON quality report
    ///
    /// Files go to `dir`, or to the configured output directory.
    pub fn write_products(
        &self,
        source: &PointCloudSource,
        product: &ChmProduct,
        dir: Option<&Path>,
    ) -> Result<ProductPaths> {
        let dir = dir.unwrap_or(self.settings.output_dir.as_path());
        std::fs::create_dir_all(dir)?;
        let store = self.executor.raster_store();
        let stem = source
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("lidar");
        let stem = stem.strip_suffix(".copc").unwrap_or(stem);

        let paths = ProductPaths {
            dtm: dir.join(format!("{stem}_dtm.{}", store.extension())),
            dsm: dir.join(format!("{stem}_dsm.{}", store.extension())),
            chm: dir.join(format!("{stem}_chm.{}", store.extension())),
            report: dir.join(format!("{stem}_chm.json")),
        };
        store.write(&product.dtm.grid, &paths.dtm)?;
        store.write(&product.dsm.grid, &paths.dsm)?;
        store.write(&product.height.grid, &paths.chm)?;

        let report = ProductReport {
            source: &source.path,
            resolution: self.settings.resolution,
            plan: &product.plan,
            dtm_fill: (&product.dtm).into(),
            dsm_fill: (&product.dsm).into(),
            quality: &product.height.report,
        };
        std::fs::write(&paths.report, serde_json::to_string_pretty(&report)?)?;
        info!("products written to {dir:?}");
        Ok(paths)
    }

    /// Forget every cached raster of `source`
    pub fn clear_cache(&self, source: &PointCloudSource) -> Result<usize> {
        self.executor.clear_cache(&source.path)
    }
}
