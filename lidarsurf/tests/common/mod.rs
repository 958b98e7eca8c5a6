#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lidarsurf::collect::global_variables::NODATA;
use lidarsurf::collect::pdal::engine::{writer_filename, Engine, EngineOutcome};
use lidarsurf::raster::ascii::AsciiGridStore;
use lidarsurf::{Crs, Grid, GridGeometry, RasterStore, Result};

/// What the fake engine does when run
#[derive(Clone)]
pub enum Behaviour {
    /// Write the raster produced by the surface function
    Succeed,
    /// Exit with `code`, printing `stderr`
    Fail { code: i32, stderr: String },
    /// Exit 0 without writing anything
    NoOutput,
    /// Write the raster, then exit with `code`
    WriteThenFail { code: i32 },
    /// Report a timeout
    Hang,
}

type SurfaceFn = dyn Fn(&str, f64) -> Grid + Send + Sync;

/// Engine that rasterises nothing: it writes a synthetic grid as an ASCII
/// grid at the writer's filename, shaped by the writer's resolution and
/// `output_type`
pub struct FakeEngine {
    pub behaviour: Behaviour,
    pub runs: AtomicUsize,
    pub delay: Duration,
    pub pipelines: std::sync::Mutex<Vec<serde_json::Value>>,
    surface: Box<SurfaceFn>,
}

impl FakeEngine {
    pub fn new(behaviour: Behaviour) -> Self {
        FakeEngine::with_surface(behaviour, |output_type, resolution| {
            // 10 m square tile, ground at 100 m, canopy 15 m above it
            let value = if output_type == "min" { 100.0 } else { 115.0 };
            let size = (10.0 / resolution).round() as usize;
            Grid::filled(
                GridGeometry::north_up(650_000.0, 6_860_010.0, resolution, size, size, None),
                value,
            )
            .unwrap()
        })
    }

    pub fn with_surface(
        behaviour: Behaviour,
        surface: impl Fn(&str, f64) -> Grid + Send + Sync + 'static,
    ) -> Self {
        FakeEngine {
            behaviour,
            runs: AtomicUsize::new(0),
            delay: Duration::ZERO,
            pipelines: std::sync::Mutex::new(Vec::new()),
            surface: Box::new(surface),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_pipeline(&self) -> Option<serde_json::Value> {
        self.pipelines.lock().unwrap().last().cloned()
    }
}

impl FakeEngine {
    fn write_surface(&self, text: &str, value: &serde_json::Value) -> Result<()> {
        let writer = value["pipeline"].as_array().unwrap().last().unwrap();
        let output = writer_filename(text).unwrap();
        let grid = (self.surface)(
            writer["output_type"].as_str().unwrap(),
            writer["resolution"].as_f64().unwrap(),
        );
        AsciiGridStore.write(&grid, &output)
    }
}

impl Engine for FakeEngine {
    fn name(&self) -> &str {
        "fake-pdal"
    }

    fn run(&self, pipeline_file: &Path, _timeout: Duration) -> Result<EngineOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let text = std::fs::read_to_string(pipeline_file)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        self.pipelines.lock().unwrap().push(value.clone());

        match &self.behaviour {
            Behaviour::Succeed => {
                self.write_surface(&text, &value)?;
                Ok(EngineOutcome::Exited {
                    code: Some(0),
                    diagnostics: String::new(),
                })
            }
            Behaviour::WriteThenFail { code } => {
                self.write_surface(&text, &value)?;
                Ok(EngineOutcome::Exited {
                    code: Some(*code),
                    diagnostics: "PDAL: writers.gdal: unable to close dataset".to_string(),
                })
            }
            Behaviour::Fail { code, stderr } => Ok(EngineOutcome::Exited {
                code: Some(*code),
                diagnostics: stderr.clone(),
            }),
            Behaviour::NoOutput => Ok(EngineOutcome::Exited {
                code: Some(0),
                diagnostics: "nothing written".to_string(),
            }),
            Behaviour::Hang => Ok(EngineOutcome::TimedOut {
                diagnostics: "still reading".to_string(),
            }),
        }
    }
}

pub fn ascii_store() -> Arc<dyn RasterStore> {
    Arc::new(AsciiGridStore)
}

/// A file with a point-cloud extension; its content is never parsed by the fake engine
pub fn laz_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn lambert93() -> Option<Crs> {
    Some(Crs::from_epsg(2154))
}

/// Deterministic pseudo-random samples, a share of them nodata
pub fn noisy_grid(width: usize, height: usize, seed: u64, nodata_share: f64) -> Grid {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    let data = (0..width * height)
        .map(|_| {
            if next() < nodata_share {
                NODATA
            } else {
                50.0 + 30.0 * next()
            }
        })
        .collect();
    Grid::new(
        GridGeometry::north_up(0.0, height as f64, 1.0, width, height, lambert93()),
        data,
        NODATA,
    )
    .unwrap()
}
