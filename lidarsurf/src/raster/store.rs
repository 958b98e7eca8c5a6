use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::raster::Grid;

/// Georeferenced raster file format
///
/// The engine writes rasters with the GDAL driver named by [`driver`], and
/// the executor reads them back through [`read`]. Both must agree on the
/// nodata sentinel, CRS, pixel size and origin.
///
/// [`driver`]: RasterStore::driver
/// [`read`]: RasterStore::read
pub trait RasterStore: Send + Sync {
    /// GDAL driver name for the engine's writer stage
    fn driver(&self) -> &'static str;

    /// File extension, without the dot
    fn extension(&self) -> &'static str;

    fn read(&self, path: &Path) -> Result<Grid>;

    fn write(&self, grid: &Grid, path: &Path) -> Result<()>;
}

/// GeoTIFF through GDAL when the `gdal` feature is on, ASCII grids otherwise
pub fn default_store() -> Arc<dyn RasterStore> {
    #[cfg(feature = "gdal")]
    {
        Arc::new(crate::raster::gdal_io::GdalStore::default())
    }

    #[cfg(not(feature = "gdal"))]
    {
        Arc::new(crate::raster::ascii::AsciiGridStore)
    }
}
