//! Nodata gap repair
//!
//! The enhanced fill searches along 8 rays from every gap pixel and blends
//! the first valid sample of each ray with inverse-distance-squared weights,
//! then smooths the filled pixels. When it cannot run, every gap takes the
//! value of its nearest valid pixel.

use log::{debug, info, warn};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::{Deserialize, Serialize};

use crate::commons::basic_functions::map_rows;
use crate::config::FillOptions;
use crate::error::{Result, TerrainError};
use crate::raster::Grid;

const DIRECTIONS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    /// The grid had no gap
    Untouched,
    /// Ray search with smoothing
    Enhanced,
    /// Nearest valid pixel
    Nearest,
}

/// Result of [`fill`]
#[derive(Debug, Clone)]
pub struct FilledGrid {
    pub grid: Grid,
    pub method: FillMethod,
    /// Gap pixels that received a value
    pub filled: usize,
    /// Gap pixels still nodata
    pub remaining: usize,
}

/// Fill the nodata pixels of `grid`
///
/// Valid pixels keep their value, geometry and sentinel are unchanged.
/// Fails with [`TerrainError::FillFailed`] only when the grid has no valid
/// pixel at all.
pub fn fill(grid: &Grid, options: &FillOptions) -> Result<FilledGrid> {
    let gaps = grid.nodata_count();
    if grid.valid_count() == 0 {
        return Err(TerrainError::FillFailed(format!(
            "{}x{} grid has no valid pixel",
            grid.width(),
            grid.height()
        )));
    }
    if gaps == 0 {
        return Ok(FilledGrid {
            grid: grid.clone(),
            method: FillMethod::Untouched,
            filled: 0,
            remaining: 0,
        });
    }

    let (data, method) = match enhanced_fill(grid, options) {
        Ok(data) => (data, FillMethod::Enhanced),
        Err(e) => {
            warn!("enhanced fill failed ({e}), falling back to nearest neighbour");
            (nearest_fill(grid), FillMethod::Nearest)
        }
    };
    let filled_grid = grid.with_data(data)?;
    let remaining = filled_grid.nodata_count();
    let filled = gaps - remaining;
    info!(
        "{method:?} fill: {filled} of {gaps} gaps filled, {remaining} left ({}x{})",
        grid.width(),
        grid.height()
    );
    Ok(FilledGrid {
        grid: filled_grid,
        method,
        filled,
        remaining,
    })
}

fn enhanced_fill(grid: &Grid, options: &FillOptions) -> Result<Vec<f64>> {
    if options.max_distance == 0 {
        return Err(TerrainError::FillFailed("search radius is 0".to_string()));
    }
    let (width, height) = (grid.width(), grid.height());
    let dx = grid.geometry().pixel_width.abs();
    let dy = grid.geometry().pixel_height.abs();
    let step_lengths: Vec<f64> = DIRECTIONS
        .iter()
        .map(|(dr, dc)| ((*dc as f64 * dx).powi(2) + (*dr as f64 * dy).powi(2)).sqrt())
        .collect();
    if step_lengths.iter().any(|l| !l.is_finite() || *l <= 0.0) {
        return Err(TerrainError::FillFailed(format!(
            "degenerate pixel size {dx}x{dy}"
        )));
    }

    let src = grid.data();
    let nodata = grid.nodata();
    let rows: Vec<Result<Vec<f64>>> = map_rows(height, |row| {
        let mut out = src[row * width..(row + 1) * width].to_vec();
        for col in 0..width {
            if grid.is_valid(out[col]) {
                continue;
            }
            let mut weight_sum = 0.0;
            let mut value_sum = 0.0;
            for ((dr, dc), step) in DIRECTIONS.iter().zip(&step_lengths) {
                for k in 1..=options.max_distance {
                    let r = row as isize + dr * k as isize;
                    let c = col as isize + dc * k as isize;
                    if r < 0 || c < 0 || r >= height as isize || c >= width as isize {
                        break;
                    }
                    let v = src[r as usize * width + c as usize];
                    if grid.is_valid(v) {
                        let distance = step * k as f64;
                        let w = 1.0 / (distance * distance);
                        weight_sum += w;
                        value_sum += w * v;
                        break;
                    }
                }
            }
            if weight_sum > 0.0 {
                let value = value_sum / weight_sum;
                if !value.is_finite() {
                    return Err(TerrainError::FillFailed(format!(
                        "non-finite interpolation at ({row}, {col})"
                    )));
                }
                out[col] = value;
            }
        }
        Ok(out)
    });
    let mut data = Vec::with_capacity(src.len());
    for row in rows {
        data.extend(row?);
    }

    // Pixels the ray search gave a value to
    let filled: Vec<bool> = src
        .iter()
        .zip(&data)
        .map(|(before, after)| *before == nodata && *after != nodata)
        .collect();
    for _ in 0..options.smoothing_iterations {
        data = smooth(&data, &filled, width, height, nodata);
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(TerrainError::FillFailed("non-finite smoothing result".to_string()));
    }
    debug!(
        "ray search filled {} pixels, {} smoothing passes",
        filled.iter().filter(|f| **f).count(),
        options.smoothing_iterations
    );
    Ok(data)
}

/// One 3x3 mean pass, applied to `mask`ed pixels only
fn smooth(data: &[f64], mask: &[bool], width: usize, height: usize, nodata: f64) -> Vec<f64> {
    let rows = map_rows(height, |row| {
        let mut out = data[row * width..(row + 1) * width].to_vec();
        for col in 0..width {
            if !mask[row * width + col] {
                continue;
            }
            let mut sum = 0.0;
            let mut count = 0usize;
            for r in row.saturating_sub(1)..=(row + 1).min(height - 1) {
                for c in col.saturating_sub(1)..=(col + 1).min(width - 1) {
                    let v = data[r * width + c];
                    if v != nodata {
                        sum += v;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                out[col] = sum / count as f64;
            }
        }
        out
    });
    rows.concat()
}

/// Every gap takes the value of its nearest valid pixel
fn nearest_fill(grid: &Grid) -> Vec<f64> {
    let geometry = grid.geometry();
    let width = grid.width();
    let points: Vec<GeomWithData<[f64; 2], f64>> = grid
        .data()
        .iter()
        .enumerate()
        .filter(|(_, v)| grid.is_valid(**v))
        .map(|(i, v)| {
            let (x, y) = geometry.pixel_center(i / width, i % width);
            GeomWithData::new([x, y], *v)
        })
        .collect();
    let tree = RTree::bulk_load(points);

    let rows = map_rows(grid.height(), |row| {
        (0..width)
            .map(|col| {
                let v = grid.data()[row * width + col];
                if grid.is_valid(v) {
                    return v;
                }
                let (x, y) = geometry.pixel_center(row, col);
                tree.nearest_neighbor(&[x, y])
                    .map_or(grid.nodata(), |p| p.data)
            })
            .collect::<Vec<f64>>()
    });
    rows.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::global_variables::NODATA;
    use crate::raster::GridGeometry;
    use approx::assert_relative_eq;

    fn grid(width: usize, height: usize, data: Vec<f64>) -> Grid {
        Grid::new(
            GridGeometry::north_up(0.0, height as f64, 1.0, width, height, None),
            data,
            NODATA,
        )
        .unwrap()
    }

    #[test]
    fn test_single_gap_is_weighted_mean() {
        let mut data = vec![10.0; 9];
        data[4] = NODATA;
        let result = fill(&grid(3, 3, data), &FillOptions::default()).unwrap();
        assert_eq!(result.method, FillMethod::Enhanced);
        assert_eq!(result.filled, 1);
        assert_eq!(result.remaining, 0);
        assert_relative_eq!(result.grid.get(1, 1).unwrap(), 10.0);
    }

    #[test]
    fn test_valid_pixels_untouched() {
        let data: Vec<f64> = (0..25)
            .map(|i| if i % 3 == 0 { NODATA } else { i as f64 * 1.5 })
            .collect();
        let input = grid(5, 5, data.clone());
        let result = fill(&input, &FillOptions::default()).unwrap();
        for (before, after) in data.iter().zip(result.grid.data()) {
            if *before != NODATA {
                assert_eq!(before, after);
            }
        }
        assert_eq!(result.grid.geometry(), input.geometry());
        assert_eq!(result.grid.nodata(), NODATA);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_out_of_reach_stays_nodata() {
        let mut data = vec![NODATA; 10];
        data[0] = 5.0;
        let options = FillOptions {
            max_distance: 3,
            smoothing_iterations: 0,
        };
        let result = fill(&grid(10, 1, data), &options).unwrap();
        assert_eq!(result.filled, 3);
        assert_eq!(result.remaining, 6);
        assert_eq!(result.grid.value(0, 3), Some(5.0));
        assert_eq!(result.grid.value(0, 4), None);
    }

    #[test]
    fn test_zero_radius_falls_back_to_nearest() {
        let mut data = vec![NODATA; 10];
        data[0] = 5.0;
        data[9] = 7.0;
        let options = FillOptions {
            max_distance: 0,
            smoothing_iterations: 2,
        };
        let result = fill(&grid(10, 1, data), &options).unwrap();
        assert_eq!(result.method, FillMethod::Nearest);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.grid.value(0, 2), Some(5.0));
        assert_eq!(result.grid.value(0, 8), Some(7.0));
    }

    #[test]
    fn test_all_nodata_fails_and_input_kept() {
        let input = grid(3, 2, vec![NODATA; 6]);
        let before = input.clone();
        let err = fill(&input, &FillOptions::default()).unwrap_err();
        assert!(matches!(err, TerrainError::FillFailed(_)));
        assert_eq!(input, before);
    }

    #[test]
    fn test_no_gap_untouched() {
        let input = grid(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let result = fill(&input, &FillOptions::default()).unwrap();
        assert_eq!(result.method, FillMethod::Untouched);
        assert_eq!(result.grid, input);
    }
}
