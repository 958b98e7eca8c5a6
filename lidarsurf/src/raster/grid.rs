//! Georeferenced elevation grid

use serde::{Deserialize, Serialize};

use crate::collect::global_variables::NODATA;
use crate::error::{Result, TerrainError};
use crate::geo_core::{BoundingBox, Crs};

/// Placement of a raster on the ground
///
/// `origin` is the outer corner of pixel (0, 0). With a north-up layout
/// `pixel_height` is negative and the origin is the upper-left corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
    pub crs: Option<Crs>,
}

impl GridGeometry {
    /// North-up geometry with square pixels of `pixel_size`
    pub fn north_up(
        origin_x: f64,
        origin_y: f64,
        pixel_size: f64,
        width: usize,
        height: usize,
        crs: Option<Crs>,
    ) -> Self {
        GridGeometry {
            origin_x,
            origin_y,
            pixel_width: pixel_size,
            pixel_height: -pixel_size,
            width,
            height,
            crs,
        }
    }

    /// GDAL-style transform
    /// [x_origin, pixel_width, 0, y_origin, 0, pixel_height]
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            self.pixel_height,
        ]
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ground footprint: `origin + (width·sx, height·sy)`
    pub fn bounds(&self) -> BoundingBox {
        let x0 = self.origin_x;
        let x1 = self.origin_x + self.width as f64 * self.pixel_width;
        let y0 = self.origin_y;
        let y1 = self.origin_y + self.height as f64 * self.pixel_height;
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Pixel area in map units, used to rank resolutions
    pub fn pixel_area(&self) -> f64 {
        (self.pixel_width * self.pixel_height).abs()
    }

    /// Ground coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional (col, row) of a ground coordinate, pixel corners on integers
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Same pixel size, relative tolerance
    pub fn same_pixel_size(&self, other: &GridGeometry, tolerance: f64) -> bool {
        rel_eq(self.pixel_width, other.pixel_width, tolerance)
            && rel_eq(self.pixel_height, other.pixel_height, tolerance)
    }

    /// Same lattice and extent: dimensions, pixel size, origin
    ///
    /// `edge_tolerance` is expressed in pixels. CRS is not compared.
    pub fn same_lattice(&self, other: &GridGeometry, size_tolerance: f64, edge_tolerance: f64) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.same_pixel_size(other, size_tolerance)
            && (self.origin_x - other.origin_x).abs() <= edge_tolerance * self.pixel_width.abs()
            && (self.origin_y - other.origin_y).abs() <= edge_tolerance * self.pixel_height.abs()
    }

    /// Geometry of a sub-window of this grid
    pub fn window(&self, window: &CropWindow) -> GridGeometry {
        GridGeometry {
            origin_x: self.origin_x + window.col_off as f64 * self.pixel_width,
            origin_y: self.origin_y + window.row_off as f64 * self.pixel_height,
            pixel_width: self.pixel_width,
            pixel_height: self.pixel_height,
            width: window.width,
            height: window.height,
            crs: self.crs.clone(),
        }
    }
}

fn rel_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance * a.abs().max(b.abs())
}

/// Pixel window inside a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// Single band elevation grid with a nodata sentinel
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    geometry: GridGeometry,
    nodata: f64,
    /// Row-major samples, `width * height` long
    data: Vec<f64>,
}

impl Grid {
    /// Build a grid, normalising non-finite samples to `nodata`
    pub fn new(geometry: GridGeometry, data: Vec<f64>, nodata: f64) -> Result<Self> {
        if data.len() != geometry.len() {
            return Err(TerrainError::InvalidGrid(format!(
                "{}x{} grid needs {} samples, got {}",
                geometry.width,
                geometry.height,
                geometry.len(),
                data.len()
            )));
        }
        if !nodata.is_finite() {
            return Err(TerrainError::InvalidGrid(format!(
                "nodata sentinel must be finite, got {nodata}"
            )));
        }
        if geometry.pixel_width == 0.0
            || geometry.pixel_height == 0.0
            || !geometry.pixel_width.is_finite()
            || !geometry.pixel_height.is_finite()
        {
            return Err(TerrainError::InvalidGrid(format!(
                "degenerate pixel size {}x{}",
                geometry.pixel_width, geometry.pixel_height
            )));
        }
        let data = data
            .into_iter()
            .map(|v| if v.is_finite() { v } else { nodata })
            .collect();
        Ok(Grid {
            geometry,
            nodata,
            data,
        })
    }

    /// Grid where every pixel holds `value`, using the standard sentinel
    pub fn filled(geometry: GridGeometry, value: f64) -> Result<Self> {
        let len = geometry.len();
        Grid::new(geometry, vec![value; len], NODATA)
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn width(&self) -> usize {
        self.geometry.width
    }

    pub fn height(&self) -> usize {
        self.geometry.height
    }

    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    pub fn crs(&self) -> Option<&Crs> {
        self.geometry.crs.as_ref()
    }

    pub fn bounds(&self) -> BoundingBox {
        self.geometry.bounds()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw sample at (row, col), sentinel included
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.height() && col < self.width() {
            Some(self.data[row * self.width() + col])
        } else {
            None
        }
    }

    /// Valid sample at (row, col); `None` for nodata or outside the grid
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        self.get(row, col).filter(|v| self.is_valid(*v))
    }

    /// Overwrite a sample; non-finite values become nodata
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        if row >= self.height() || col >= self.width() {
            return Err(TerrainError::InvalidGrid(format!(
                "({row}, {col}) outside {}x{} grid",
                self.width(),
                self.height()
            )));
        }
        let width = self.width();
        self.data[row * width + col] = if value.is_finite() { value } else { self.nodata };
        Ok(())
    }

    pub fn is_valid(&self, value: f64) -> bool {
        value != self.nodata
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| self.is_valid(**v)).count()
    }

    pub fn nodata_count(&self) -> usize {
        self.len() - self.valid_count()
    }

    /// Same grid with `data` replacing the samples
    pub fn with_data(&self, data: Vec<f64>) -> Result<Grid> {
        Grid::new(self.geometry.clone(), data, self.nodata)
    }

    /// Copy the pixels of `window` into a new grid
    pub fn crop(&self, window: &CropWindow) -> Result<Grid> {
        if window.col_off + window.width > self.width()
            || window.row_off + window.height > self.height()
        {
            return Err(TerrainError::InvalidGrid(format!(
                "crop window {window:?} exceeds {}x{} grid",
                self.width(),
                self.height()
            )));
        }
        let mut data = Vec::with_capacity(window.width * window.height);
        for row in window.row_off..window.row_off + window.height {
            let start = row * self.width() + window.col_off;
            data.extend_from_slice(&self.data[start..start + window.width]);
        }
        Ok(Grid {
            geometry: self.geometry.window(window),
            nodata: self.nodata,
            data,
        })
    }

    /// Move the samples onto `geometry`, which must have the same shape
    pub fn with_geometry(mut self, geometry: GridGeometry) -> Result<Grid> {
        if (geometry.width, geometry.height) != (self.width(), self.height()) {
            return Err(TerrainError::InvalidGrid(format!(
                "cannot move a {}x{} grid onto a {}x{} geometry",
                self.width(),
                self.height(),
                geometry.width,
                geometry.height
            )));
        }
        self.geometry = geometry;
        Ok(self)
    }

    /// Replace the CRS, keeping every sample
    pub fn with_crs(mut self, crs: Option<Crs>) -> Grid {
        self.geometry.crs = crs;
        self
    }
}
