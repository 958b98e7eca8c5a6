//! Terrain surface rasters from aerial LiDAR point clouds.
//!
//! Ground (DTM) and top-surface (DSM) elevation rasters are produced by PDAL
//! pipelines built in [`collect::pdal`], repaired by [`geometric::fill`],
//! reconciled by [`geometric::align`] and combined into a canopy height model
//! by [`geometric::chm`]. [`geometric::lidar::Lidar`] runs the whole chain.

pub mod cache;
pub mod collect;
pub mod commons;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod geometric;
pub mod raster;

pub use collect::pdal::classification::{ClassificationConfig, GroundFilter, OutlierConfig};
pub use collect::pdal::executor::{CachePolicy, Executor};
pub use collect::pdal::pipeline::{PipelineDescription, SurfaceMode, SurfaceRequest, TopStatistic};
pub use collect::source::PointCloudSource;
pub use config::Settings;
pub use error::{Result, TerrainError};
pub use geo_core::{BoundingBox, Crs};
pub use geometric::lidar::{ChmProduct, Lidar};
pub use raster::{Grid, GridGeometry, RasterStore};
