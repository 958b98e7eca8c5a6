//! Canopy height: top surface minus ground

use log::{info, warn};
use serde::Serialize;

use crate::commons::basic_functions::{fraction, map_rows, summarize};
use crate::config::QualityThresholds;
use crate::error::{Result, TerrainError};
use crate::raster::Grid;

/// Statistics of a height grid, over valid pixels unless stated otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    /// Share of valid pixels below zero
    pub negative_fraction: f64,
    /// Share of all pixels that are nodata
    pub nodata_fraction: f64,
    pub valid_count: usize,
    /// Valid heights equal to the nodata sentinel; counted above but
    /// stored as nodata in the grid
    pub sentinel_collisions: usize,
    pub implausible: bool,
    /// Why the result is implausible
    pub issues: Vec<String>,
}

/// Height grid with its quality report
#[derive(Debug, Clone)]
pub struct HeightGrid {
    pub grid: Grid,
    pub report: QualityReport,
}

impl HeightGrid {
    /// Turn the advisory flag into an error
    pub fn ensure_plausible(self) -> Result<HeightGrid> {
        if self.report.implausible {
            Err(TerrainError::ImplausibleResult(self.report.issues))
        } else {
            Ok(self)
        }
    }

    /// Copy with negative heights set to 0; the report still describes the raw difference
    pub fn clamp_negative(&self) -> Result<HeightGrid> {
        let nodata = self.grid.nodata();
        let data = self
            .grid
            .data()
            .iter()
            .map(|v| if *v != nodata && *v < 0.0 { 0.0 } else { *v })
            .collect();
        Ok(HeightGrid {
            grid: self.grid.with_data(data)?,
            report: self.report.clone(),
        })
    }
}

/// `top - ground`, pixel by pixel, on two aligned grids
///
/// A pixel is nodata when either input is. The result carries the nodata
/// sentinel of `top`; the report is computed from the input pairs, so a
/// height that happens to equal the sentinel still counts as valid.
pub fn difference(top: &Grid, ground: &Grid, thresholds: &QualityThresholds) -> Result<HeightGrid> {
    if top.geometry() != ground.geometry() {
        return Err(TerrainError::GeometryMismatch(format!(
            "top {:?} vs ground {:?}, align the grids first",
            top.geometry(),
            ground.geometry()
        )));
    }

    let width = top.width();
    let rows = map_rows(top.height(), |row| {
        (0..width)
            .map(|col| match (top.value(row, col), ground.value(row, col)) {
                (Some(t), Some(g)) => Some(t - g),
                _ => None,
            })
            .collect::<Vec<Option<f64>>>()
    });
    let heights = rows.concat();
    let report = quality(&heights, top.nodata(), thresholds);
    if report.sentinel_collisions > 0 {
        warn!(
            "{} heights equal the nodata value {} and are stored as nodata",
            report.sentinel_collisions,
            top.nodata()
        );
    }
    let grid = top.with_data(heights.iter().map(|h| h.unwrap_or(top.nodata())).collect())?;

    if report.implausible {
        warn!("implausible height grid: {}", report.issues.join("; "));
    } else {
        info!(
            "height grid: mean {:.2}, std {:.2}, {:.1}% nodata",
            report.mean.unwrap_or(f64::NAN),
            report.std.unwrap_or(f64::NAN),
            report.nodata_fraction * 100.0
        );
    }
    Ok(HeightGrid { grid, report })
}

fn quality(heights: &[Option<f64>], nodata: f64, thresholds: &QualityThresholds) -> QualityReport {
    let valid: Vec<f64> = heights.iter().flatten().copied().collect();
    let summary = summarize(valid.iter().copied());
    let negative = valid.iter().filter(|v| **v < 0.0).count();
    let negative_fraction = fraction(negative, valid.len());
    let nodata_fraction = fraction(heights.len() - valid.len(), heights.len());
    let valid_fraction = fraction(valid.len(), heights.len());

    let mut issues = Vec::new();
    if negative_fraction > thresholds.max_negative_fraction {
        issues.push(format!(
            "{:.1}% of heights are negative (limit {:.1}%), ground above top surface",
            negative_fraction * 100.0,
            thresholds.max_negative_fraction * 100.0
        ));
    }
    if valid_fraction < thresholds.min_valid_fraction {
        issues.push(format!(
            "only {:.1}% of pixels are valid (minimum {:.1}%)",
            valid_fraction * 100.0,
            thresholds.min_valid_fraction * 100.0
        ));
    }

    QualityReport {
        min: summary.map(|s| s.min),
        max: summary.map(|s| s.max),
        mean: summary.map(|s| s.mean),
        std: summary.map(|s| s.std),
        negative_fraction,
        nodata_fraction,
        valid_count: valid.len(),
        sentinel_collisions: valid.iter().filter(|v| **v == nodata).count(),
        implausible: !issues.is_empty(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::global_variables::NODATA;
    use crate::geo_core::Crs;
    use crate::raster::GridGeometry;

    fn geometry() -> GridGeometry {
        GridGeometry::north_up(0.0, 4.0, 1.0, 4, 4, Some(Crs::from_epsg(2154)))
    }

    #[test]
    fn test_constant_difference() {
        let top = Grid::filled(geometry(), 50.0).unwrap();
        let ground = Grid::filled(geometry(), 10.0).unwrap();
        let height = difference(&top, &ground, &QualityThresholds::default()).unwrap();
        assert!(height.grid.data().iter().all(|v| *v == 40.0));
        assert_eq!(height.report.mean, Some(40.0));
        assert_eq!(height.report.std, Some(0.0));
        assert!(!height.report.implausible);
        assert!(height.ensure_plausible().is_ok());
    }

    #[test]
    fn test_nodata_propagates() {
        let mut top = Grid::filled(geometry(), 20.0).unwrap();
        let mut ground = Grid::filled(geometry(), 5.0).unwrap();
        top.set(0, 0, NODATA).unwrap();
        ground.set(3, 3, NODATA).unwrap();
        let height = difference(&top, &ground, &QualityThresholds::default()).unwrap();
        assert_eq!(height.grid.value(0, 0), None);
        assert_eq!(height.grid.value(3, 3), None);
        assert_eq!(height.grid.value(1, 1), Some(15.0));
        assert_eq!(height.report.valid_count, 14);
        assert_eq!(height.report.nodata_fraction, 2.0 / 16.0);
    }

    #[test]
    fn test_inverted_inputs_flagged() {
        let top = Grid::filled(geometry(), 10.0).unwrap();
        let ground = Grid::filled(geometry(), 50.0).unwrap();
        let height = difference(&top, &ground, &QualityThresholds::default()).unwrap();
        assert_eq!(height.report.negative_fraction, 1.0);
        assert!(height.report.implausible);
        assert_eq!(height.report.issues.len(), 1);

        let clamped = height.clamp_negative().unwrap();
        assert!(clamped.grid.data().iter().all(|v| *v == 0.0));
        assert!(matches!(
            height.ensure_plausible(),
            Err(TerrainError::ImplausibleResult(_))
        ));
    }

    #[test]
    fn test_height_equal_to_nodata_counts_as_valid() {
        let top = Grid::filled(geometry(), 1.0).unwrap();
        let mut ground = Grid::filled(geometry(), 0.5).unwrap();
        ground.set(2, 1, 1.0 - NODATA).unwrap();
        let height = difference(&top, &ground, &QualityThresholds::default()).unwrap();
        assert_eq!(height.report.valid_count, 16);
        assert_eq!(height.report.sentinel_collisions, 1);
        assert_eq!(height.report.nodata_fraction, 0.0);
        assert_eq!(height.report.min, Some(NODATA));
        assert_eq!(height.grid.value(2, 1), None);
        assert_eq!(height.grid.value(0, 0), Some(0.5));
    }

    #[test]
    fn test_sparse_result_flagged() {
        let top = Grid::filled(geometry(), 10.0).unwrap();
        let mut ground = Grid::filled(geometry(), NODATA).unwrap();
        ground.set(0, 0, 1.0).unwrap();
        let height = difference(&top, &ground, &QualityThresholds::default()).unwrap();
        assert!(height.report.implausible);
        assert_eq!(height.report.valid_count, 1);
    }

    #[test]
    fn test_geometry_mismatch() {
        let top = Grid::filled(geometry(), 10.0).unwrap();
        let other = GridGeometry::north_up(1.0, 4.0, 1.0, 4, 4, Some(Crs::from_epsg(2154)));
        let ground = Grid::filled(other, 1.0).unwrap();
        assert!(matches!(
            difference(&top, &ground, &QualityThresholds::default()),
            Err(TerrainError::GeometryMismatch(_))
        ));
    }
}
