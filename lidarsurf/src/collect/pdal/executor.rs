//! Runs pipeline descriptions through the engine, with caching

use dashmap::DashMap;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::fingerprint::Fingerprint;
use crate::cache::store::{CacheEntry, CacheStore, FsCacheStore, MemoryCacheStore, ProductKey};
use crate::collect::pdal::engine::{Engine, EngineOutcome, PdalEngine};
use crate::collect::pdal::pipeline::{failing_stage, output_path, PipelineDescription};
use crate::collect::source::InputStamp;
use crate::config::Settings;
use crate::error::{Result, StageRef, TerrainError};
use crate::raster::store::default_store;
use crate::raster::{Grid, RasterStore};

/// How an execution uses the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Serve from the cache when possible, record fresh results
    #[default]
    Use,
    /// Always run the engine, replace the cached result
    Refresh,
    /// Always run the engine, neither read nor write the cache
    Bypass,
}

struct CacheLayer {
    store: Arc<dyn CacheStore>,
    dir: PathBuf,
}

/// Pipeline executor
///
/// At most one engine run per fingerprint is in flight: concurrent callers
/// with the same fingerprint wait for the first run and are then served
/// from the cache.
pub struct Executor {
    engine: Arc<dyn Engine>,
    rasters: Arc<dyn RasterStore>,
    cache: Option<CacheLayer>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    in_flight: DashMap<Fingerprint, Arc<Mutex<()>>>,
}

impl Executor {
    /// Executor without cache: every call runs the engine
    pub fn new(engine: Arc<dyn Engine>, rasters: Arc<dyn RasterStore>, timeout: Duration) -> Self {
        Executor {
            engine,
            rasters,
            cache: None,
            clock: Arc::new(SystemClock),
            timeout,
            in_flight: DashMap::new(),
        }
    }

    /// Keep outputs in `dir`, indexed by `store`
    pub fn with_cache(mut self, store: Arc<dyn CacheStore>, dir: impl Into<PathBuf>) -> Self {
        self.cache = Some(CacheLayer {
            store,
            dir: dir.into(),
        });
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// PDAL engine, default raster store, filesystem cache when enabled
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let executor = Executor::new(
            Arc::new(PdalEngine::new(settings.engine.program.clone())),
            default_store(),
            settings.engine.timeout(),
        );
        if settings.cache.enabled {
            let store = FsCacheStore::open(&settings.cache.dir)?;
            Ok(executor.with_cache(Arc::new(store), settings.cache.dir.clone()))
        } else {
            Ok(executor)
        }
    }

    /// Executor caching in memory, outputs kept in `dir`
    pub fn with_memory_cache(self, dir: impl Into<PathBuf>) -> Self {
        self.with_cache(Arc::new(MemoryCacheStore::new()), dir)
    }

    pub fn raster_store(&self) -> &Arc<dyn RasterStore> {
        &self.rasters
    }

    pub fn cache_store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref().map(|c| &c.store)
    }

    /// Fingerprint of `description` against the current version of its input
    pub fn fingerprint(&self, description: &PipelineDescription) -> Result<Fingerprint> {
        Ok(self.identify(description)?.0)
    }

    fn identify(&self, description: &PipelineDescription) -> Result<(Fingerprint, InputStamp)> {
        let stamp = description.source().stamp()?;
        let fingerprint = Fingerprint::compute(
            description.input(),
            &stamp,
            &self.fingerprinted_json(description)?,
        );
        Ok((fingerprint, stamp))
    }

    fn fingerprinted_json(&self, description: &PipelineDescription) -> Result<String> {
        Ok(format!(
            "{}\n{}",
            description.canonical_json()?,
            self.rasters.driver()
        ))
    }

    /// Produce the raster described by `description`
    pub fn execute(&self, description: &PipelineDescription, policy: CachePolicy) -> Result<Grid> {
        description.source().validate()?;
        let (fingerprint, stamp) = self.identify(description)?;

        let cache = match (&self.cache, policy) {
            (Some(cache), CachePolicy::Use | CachePolicy::Refresh) => cache,
            _ => return self.run(description, &fingerprint, &stamp, None),
        };

        let lock = self
            .in_flight
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            // The mutex guards no data, a poisoned one is still a valid lock
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            match policy {
                CachePolicy::Use => match self.lookup(cache, description, &fingerprint) {
                    Ok(Some(grid)) => Ok(grid),
                    Ok(None) => self.run(description, &fingerprint, &stamp, Some(cache)),
                    Err(e) => Err(e),
                },
                _ => self.run(description, &fingerprint, &stamp, Some(cache)),
            }
        };
        // Map entry and this clone: nobody else is waiting
        self.in_flight
            .remove_if(&fingerprint, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    fn lookup(
        &self,
        cache: &CacheLayer,
        description: &PipelineDescription,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Grid>> {
        let entry = match cache.store.get(fingerprint)? {
            Some(entry) => entry,
            None => {
                debug!("cache miss for {fingerprint}");
                return Ok(None);
            }
        };
        if !entry.output.is_file() {
            warn!(
                "cached output {:?} for {fingerprint} disappeared, dropping the entry",
                entry.output
            );
            cache.store.remove(fingerprint)?;
            return Ok(None);
        }
        match self.rasters.read(&entry.output) {
            Ok(grid) => {
                info!(
                    "cache hit for {:?} ({fingerprint}, created {})",
                    entry.input, entry.created
                );
                Ok(Some(with_source_crs(grid, description)))
            }
            Err(e) => {
                warn!("cached output {:?} unreadable ({e}), dropping the entry", entry.output);
                cache.store.remove(fingerprint)?;
                remove_output(&entry.output);
                Ok(None)
            }
        }
    }

    fn run(
        &self,
        description: &PipelineDescription,
        fingerprint: &Fingerprint,
        stamp: &InputStamp,
        cache: Option<&CacheLayer>,
    ) -> Result<Grid> {
        let workdir = tempfile::Builder::new().prefix("lidarsurf-").tempdir()?;
        let output = match cache {
            Some(cache) => {
                std::fs::create_dir_all(&cache.dir)?;
                output_path(&cache.dir, fingerprint.as_str(), self.rasters.extension())
            }
            None => output_path(workdir.path(), "output", self.rasters.extension()),
        };
        if output.exists() {
            std::fs::remove_file(&output)?;
        }

        let result = self.run_engine(description, fingerprint, workdir.path(), &output);
        let grid = match result {
            Ok(grid) => grid,
            Err(e) => {
                if cache.is_some() && output.exists() {
                    remove_output(&output);
                }
                return Err(e);
            }
        };

        if let Some(cache) = cache {
            self.record(cache, description, fingerprint, *stamp, output)?;
        }
        Ok(grid)
    }

    fn run_engine(
        &self,
        description: &PipelineDescription,
        fingerprint: &Fingerprint,
        workdir: &Path,
        output: &Path,
    ) -> Result<Grid> {
        let input = description.input().to_path_buf();
        let pipeline_file = workdir.join("pipeline.json");
        std::fs::write(&pipeline_file, description.bind(self.rasters.driver(), output)?)?;

        info!(
            "running {} on {:?} ({}, fingerprint {fingerprint})",
            self.engine.name(),
            input,
            description.mode().key()
        );
        let outcome = self
            .engine
            .run(&pipeline_file, self.timeout)
            .map_err(|e| TerrainError::EngineExitNonZero {
                input: input.clone(),
                fingerprint: fingerprint.clone(),
                code: None,
                stage: None,
                diagnostics: format!("could not start {}: {e}", self.engine.name()),
            })?;

        match outcome {
            EngineOutcome::TimedOut { diagnostics } => {
                warn!("{} timed out on {:?} after {:?}", self.engine.name(), input, self.timeout);
                return Err(TerrainError::EngineTimeout {
                    input,
                    fingerprint: fingerprint.clone(),
                    timeout: self.timeout,
                    diagnostics,
                });
            }
            EngineOutcome::Exited { code, diagnostics } if code != Some(0) => {
                let stage = failing_stage(&description.stage_kinds(), &diagnostics)
                    .map(|(index, kind)| StageRef { index, kind });
                warn!(
                    "{} failed on {:?} with {:?} at stage {:?}",
                    self.engine.name(),
                    input,
                    code,
                    stage
                );
                return Err(TerrainError::EngineExitNonZero {
                    input,
                    fingerprint: fingerprint.clone(),
                    code,
                    stage,
                    diagnostics,
                });
            }
            EngineOutcome::Exited { diagnostics, .. } => {
                if !diagnostics.trim().is_empty() {
                    debug!("{} diagnostics: {}", self.engine.name(), diagnostics.trim());
                }
            }
        }

        if !output.is_file() {
            return Err(TerrainError::OutputMissing {
                input,
                fingerprint: fingerprint.clone(),
                output: output.to_path_buf(),
            });
        }

        let grid = self.rasters.read(output)?;
        let grid = with_source_crs(grid, description);
        info!(
            "{} produced {}x{} grid for {:?}",
            self.engine.name(),
            grid.width(),
            grid.height(),
            input
        );
        Ok(grid)
    }

    fn record(
        &self,
        cache: &CacheLayer,
        description: &PipelineDescription,
        fingerprint: &Fingerprint,
        input_stamp: InputStamp,
        output: PathBuf,
    ) -> Result<()> {
        let params = self.fingerprinted_json(description)?;
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            input: description.input().to_path_buf(),
            input_stamp,
            product: ProductKey {
                mode: description.mode().key().to_string(),
                params: Fingerprint::digest(params.as_bytes()),
            },
            output,
            created: self.clock.now(),
        };
        cache.store.put(entry.clone())?;
        for stale in cache.store.remove_stale(&entry)? {
            debug!("dropping stale cache entry {} for {:?}", stale.fingerprint, stale.input);
            remove_output(&stale.output);
        }
        Ok(())
    }

    /// Forget every cached product of `input`, deleting their rasters
    ///
    /// Returns the number of entries removed.
    pub fn clear_cache(&self, input: &Path) -> Result<usize> {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return Ok(0),
        };
        let removed = cache.store.remove_input(input)?;
        for entry in &removed {
            remove_output(&entry.output);
        }
        info!("cleared {} cache entries for {:?}", removed.len(), input);
        Ok(removed.len())
    }
}

/// The engine may not carry the reader's CRS through to the raster
fn with_source_crs(grid: Grid, description: &PipelineDescription) -> Grid {
    match (grid.crs().is_none(), &description.source().crs) {
        (true, Some(crs)) => grid.with_crs(Some(crs.clone())),
        _ => grid,
    }
}

fn remove_output(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove cached raster {path:?}: {e}");
        }
    }
}
