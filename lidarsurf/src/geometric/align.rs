//! Bring a top-surface grid and a ground grid onto one pixel lattice

use log::{debug, info};
use serde::Serialize;

use crate::commons::basic_functions::{map_rows, snap};
use crate::config::AlignOptions;
use crate::error::{Result, TerrainError};
use crate::geo_core::{crs_compatible, Crs};
use crate::raster::grid::CropWindow;
use crate::raster::{Grid, GridGeometry};

/// Offsets closer than this to a whole pixel are sampled as exact hits
const SAMPLE_SNAP: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Top,
    Ground,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlignmentRelation {
    Identical,
    SubsetCrop,
    RequiresResample,
    IncompatibleCrs,
}

/// How two grids are reconciled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "relation")]
pub enum AlignmentPlan {
    /// Same CRS, pixel size and bounds
    Identical,
    /// `cropped` covers the other grid on the same lattice; `window` cuts it down
    SubsetCrop { cropped: Surface, window: CropWindow },
    /// `resampled` is bilinearly sampled onto `target`, which is `window`
    /// of the other (finer) grid
    RequiresResample {
        resampled: Surface,
        window: CropWindow,
        target: GridGeometry,
    },
    /// No transform between the two systems is attempted
    IncompatibleCrs {
        top: Option<Crs>,
        ground: Option<Crs>,
    },
}

impl AlignmentPlan {
    pub fn relation(&self) -> AlignmentRelation {
        match self {
            AlignmentPlan::Identical => AlignmentRelation::Identical,
            AlignmentPlan::SubsetCrop { .. } => AlignmentRelation::SubsetCrop,
            AlignmentPlan::RequiresResample { .. } => AlignmentRelation::RequiresResample,
            AlignmentPlan::IncompatibleCrs { .. } => AlignmentRelation::IncompatibleCrs,
        }
    }
}

/// Classify the geometric relation between `top` and `ground`
///
/// Fails with [`TerrainError::UnsupportedAlignment`] when the grids do not
/// overlap or are not north-up.
pub fn plan(top: &Grid, ground: &Grid, options: &AlignOptions) -> Result<AlignmentPlan> {
    let (t, g) = (top.geometry(), ground.geometry());
    if !crs_compatible(t.crs.as_ref(), g.crs.as_ref(), options.allow_unknown_crs) {
        return Ok(AlignmentPlan::IncompatibleCrs {
            top: t.crs.clone(),
            ground: g.crs.clone(),
        });
    }

    if t.same_lattice(g, options.pixel_size_tolerance, options.edge_tolerance) {
        return Ok(AlignmentPlan::Identical);
    }

    for geo in [t, g] {
        if geo.pixel_width <= 0.0 || geo.pixel_height >= 0.0 {
            return Err(TerrainError::UnsupportedAlignment(format!(
                "only north-up grids can be aligned, got pixel size {}x{}",
                geo.pixel_width, geo.pixel_height
            )));
        }
    }

    let intersection = t.bounds().intersection(&g.bounds()).ok_or_else(|| {
        TerrainError::UnsupportedAlignment(format!(
            "grids do not overlap: top {:?}, ground {:?}",
            t.bounds(),
            g.bounds()
        ))
    })?;

    if t.same_pixel_size(g, options.pixel_size_tolerance) {
        for (cropped, large, small) in [(Surface::Top, t, g), (Surface::Ground, g, t)] {
            if let Some(window) = subset_window(large, small, options.edge_tolerance) {
                return Ok(AlignmentPlan::SubsetCrop { cropped, window });
            }
        }
    }

    // Finer grid drives the lattice, top wins a tie
    let top_is_finer = t.pixel_area() <= g.pixel_area() * (1.0 + options.pixel_size_tolerance);
    let (resampled, fine) = if top_is_finer {
        (Surface::Ground, t)
    } else {
        (Surface::Top, g)
    };

    let e = options.edge_tolerance;
    let dx = fine.pixel_width;
    let dy = -fine.pixel_height;
    let col_start = snap((intersection.min_x - fine.origin_x) / dx, e).ceil();
    let col_end = snap((intersection.max_x - fine.origin_x) / dx, e).floor();
    let row_start = snap((fine.origin_y - intersection.max_y) / dy, e).ceil();
    let row_end = snap((fine.origin_y - intersection.min_y) / dy, e).floor();
    if col_end <= col_start || row_end <= row_start {
        return Err(TerrainError::UnsupportedAlignment(format!(
            "overlap {intersection:?} is smaller than one pixel"
        )));
    }
    let window = CropWindow {
        col_off: col_start.max(0.0) as usize,
        row_off: row_start.max(0.0) as usize,
        width: (col_end - col_start) as usize,
        height: (row_end - row_start) as usize,
    };
    let target = fine.window(&window);

    Ok(AlignmentPlan::RequiresResample {
        resampled,
        window,
        target,
    })
}

/// Window of `large` covering `small`, when `small` lies inside `large` on
/// the same lattice
fn subset_window(large: &GridGeometry, small: &GridGeometry, edge_tolerance: f64) -> Option<CropWindow> {
    let tolerance = edge_tolerance * large.pixel_width.abs().min(large.pixel_height.abs());
    if !large.bounds().contains(&small.bounds(), tolerance) {
        return None;
    }
    let col = (small.origin_x - large.origin_x) / large.pixel_width;
    let row = (small.origin_y - large.origin_y) / large.pixel_height;
    if (col - col.round()).abs() > edge_tolerance || (row - row.round()).abs() > edge_tolerance {
        return None;
    }
    let window = CropWindow {
        col_off: col.round().max(0.0) as usize,
        row_off: row.round().max(0.0) as usize,
        width: small.width,
        height: small.height,
    };
    (window.col_off + window.width <= large.width && window.row_off + window.height <= large.height)
        .then_some(window)
}

/// Align `top` and `ground`; both returned grids share width, height,
/// pixel size, origin and CRS
pub fn align(top: &Grid, ground: &Grid, options: &AlignOptions) -> Result<(AlignmentPlan, Grid, Grid)> {
    let plan = plan(top, ground, options)?;
    info!("aligning grids: {:?}", plan.relation());
    let crs = top.crs().or(ground.crs()).cloned();

    let (top_out, ground_out) = match &plan {
        AlignmentPlan::IncompatibleCrs { top, ground } => {
            return Err(TerrainError::UnsupportedAlignment(format!(
                "coordinate systems differ: top {}, ground {}",
                describe(top.as_ref()),
                describe(ground.as_ref())
            )))
        }
        AlignmentPlan::Identical => (top.clone(), ground.clone()),
        AlignmentPlan::SubsetCrop { cropped, window } => {
            debug!("cropping {cropped:?} to {window:?}");
            match cropped {
                Surface::Top => (top.crop(window)?, ground.clone()),
                Surface::Ground => (top.clone(), ground.crop(window)?),
            }
        }
        AlignmentPlan::RequiresResample {
            resampled,
            window,
            target,
        } => {
            debug!(
                "resampling {resampled:?} onto {}x{} at {}",
                target.width, target.height, target.pixel_width
            );
            match resampled {
                Surface::Ground => (top.crop(window)?, resample(ground, target)?),
                Surface::Top => (resample(top, target)?, ground.crop(window)?),
            }
        }
    };

    // Tolerant matches leave sub-tolerance offsets; ground takes top's lattice
    let top_out = with_crs(top_out, &crs);
    let ground_out = ground_out.with_geometry(top_out.geometry().clone())?;
    Ok((plan, top_out, ground_out))
}

fn with_crs(grid: Grid, crs: &Option<Crs>) -> Grid {
    if grid.crs() == crs.as_ref() {
        grid
    } else {
        grid.with_crs(crs.clone())
    }
}

fn describe(crs: Option<&Crs>) -> String {
    crs.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

/// Bilinear sample of `source` at every pixel centre of `target`
///
/// Edge pixels are clamped; nodata neighbours are dropped and the remaining
/// weights renormalised.
pub fn resample(source: &Grid, target: &GridGeometry) -> Result<Grid> {
    let geometry = source.geometry();
    let rows = map_rows(target.height, |row| {
        (0..target.width)
            .map(|col| {
                let (x, y) = target.pixel_center(row, col);
                let (c, r) = geometry.geo_to_pixel(x, y);
                bilinear(source, snap(c - 0.5, SAMPLE_SNAP), snap(r - 0.5, SAMPLE_SNAP))
            })
            .collect::<Vec<f64>>()
    });
    let mut target = target.clone();
    target.crs = geometry.crs.clone();
    Grid::new(target, rows.concat(), source.nodata())
}

/// `col`/`row` are centre-based: pixel (0, 0) is sampled exactly at (0.0, 0.0)
fn bilinear(source: &Grid, col: f64, row: f64) -> f64 {
    let (c0, r0) = (col.floor(), row.floor());
    let (tc, tr) = (col - c0, row - r0);
    let clamp = |i: f64, n: usize| i.max(0.0).min((n - 1) as f64) as usize;

    let mut weight_sum = 0.0;
    let mut value_sum = 0.0;
    for (dr, dc, w) in [
        (0.0, 0.0, (1.0 - tr) * (1.0 - tc)),
        (0.0, 1.0, (1.0 - tr) * tc),
        (1.0, 0.0, tr * (1.0 - tc)),
        (1.0, 1.0, tr * tc),
    ] {
        if w <= 0.0 {
            continue;
        }
        let r = clamp(r0 + dr, source.height());
        let c = clamp(c0 + dc, source.width());
        if let Some(v) = source.value(r, c) {
            weight_sum += w;
            value_sum += w * v;
        }
    }
    if weight_sum > 0.0 {
        value_sum / weight_sum
    } else {
        source.nodata()
    }
}
