//! GeoTIFF reading and writing using GDAL

use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use std::path::Path;

use crate::collect::global_variables::NODATA;
use crate::error::{Result, TerrainError};
use crate::geo_core::Crs;
use crate::raster::{Grid, GridGeometry, RasterStore};

/// GeoTIFF store, single float64 band
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalStore;

fn gdal_err(path: &Path, e: gdal::errors::GdalError) -> TerrainError {
    TerrainError::Raster {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

impl RasterStore for GdalStore {
    fn driver(&self) -> &'static str {
        "GTiff"
    }

    fn extension(&self) -> &'static str {
        "tif"
    }

    fn read(&self, path: &Path) -> Result<Grid> {
        let dataset = Dataset::open(path).map_err(|e| gdal_err(path, e))?;
        let (cols, rows) = dataset.raster_size();
        let band = dataset.rasterband(1).map_err(|e| gdal_err(path, e))?;

        let buffer = band
            .read_as::<f64>((0, 0), (cols, rows), (cols, rows), None)
            .map_err(|e| gdal_err(path, e))?;
        let transform = dataset.geo_transform().map_err(|e| gdal_err(path, e))?;
        if transform[2] != 0.0 || transform[4] != 0.0 {
            return Err(TerrainError::Raster {
                path: path.to_path_buf(),
                reason: "rotated rasters are not supported".to_string(),
            });
        }

        // EPSG when the authority is known, WKT otherwise
        let crs = dataset.spatial_ref().ok().and_then(|srs| match srs.auth_code() {
            Ok(code) if code > 0 => Some(Crs::from_epsg(code as u32)),
            _ => srs.to_wkt().ok().map(Crs::from_wkt),
        });

        let file_nodata = band.no_data_value();
        let data: Vec<f64> = buffer
            .data()
            .iter()
            .map(|&v| match file_nodata {
                Some(nd) if v == nd => NODATA,
                _ => v,
            })
            .collect();

        let geometry = GridGeometry {
            origin_x: transform[0],
            origin_y: transform[3],
            pixel_width: transform[1],
            pixel_height: transform[5],
            width: cols,
            height: rows,
            crs,
        };
        Grid::new(geometry, data, NODATA)
    }

    fn write(&self, grid: &Grid, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let driver = DriverManager::get_driver_by_name("GTiff").map_err(|e| gdal_err(path, e))?;
        let mut dataset = driver
            .create_with_band_type::<f64, _>(path, grid.width(), grid.height(), 1)
            .map_err(|e| gdal_err(path, e))?;

        dataset
            .set_geo_transform(&grid.geometry().to_gdal())
            .map_err(|e| gdal_err(path, e))?;

        let srs = match grid.crs() {
            Some(Crs {
                epsg: Some(code), ..
            }) => Some(SpatialRef::from_epsg(*code)),
            Some(Crs {
                wkt: Some(wkt), ..
            }) => Some(SpatialRef::from_wkt(wkt)),
            _ => None,
        };
        if let Some(srs) = srs {
            let srs = srs.map_err(|e| gdal_err(path, e))?;
            dataset.set_spatial_ref(&srs).map_err(|e| gdal_err(path, e))?;
        }

        let mut band = dataset.rasterband(1).map_err(|e| gdal_err(path, e))?;
        let mut buffer = Buffer::new((grid.width(), grid.height()), grid.data().to_vec());
        band.write((0, 0), (grid.width(), grid.height()), &mut buffer)
            .map_err(|e| gdal_err(path, e))?;
        band.set_no_data_value(Some(grid.nodata()))
            .map_err(|e| gdal_err(path, e))?;

        Ok(())
    }
}
