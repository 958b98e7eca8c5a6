//! ESRI ASCII grid storage (`AAIGrid` in GDAL), with the CRS in a `.prj` sidecar

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::collect::global_variables::NODATA;
use crate::error::{Result, TerrainError};
use crate::geo_core::Crs;
use crate::raster::{Grid, GridGeometry, RasterStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiGridStore;

impl RasterStore for AsciiGridStore {
    fn driver(&self) -> &'static str {
        "AAIGrid"
    }

    fn extension(&self) -> &'static str {
        "asc"
    }

    fn read(&self, path: &Path) -> Result<Grid> {
        let text = fs::read_to_string(path)?;
        let mut grid = parse(&text).map_err(|reason| TerrainError::Raster {
            path: path.to_path_buf(),
            reason,
        })?;

        let prj = prj_path(path);
        if prj.exists() {
            let definition = fs::read_to_string(&prj)?;
            if !definition.trim().is_empty() {
                grid = grid.with_crs(Some(Crs::parse(&definition)));
            }
        }
        Ok(grid)
    }

    fn write(&self, grid: &Grid, path: &Path) -> Result<()> {
        let text = render(grid).map_err(|reason| TerrainError::Raster {
            path: path.to_path_buf(),
            reason,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        if let Some(crs) = grid.crs() {
            fs::write(prj_path(path), crs.to_definition())?;
        }
        Ok(())
    }
}

fn prj_path(path: &Path) -> PathBuf {
    path.with_extension("prj")
}

#[derive(Default)]
struct Header {
    ncols: Option<usize>,
    nrows: Option<usize>,
    xll: Option<(f64, bool)>,
    yll: Option<(f64, bool)>,
    cellsize: Option<f64>,
    dx: Option<f64>,
    dy: Option<f64>,
    nodata: Option<f64>,
}

fn parse(text: &str) -> std::result::Result<Grid, String> {
    let mut header = Header::default();
    let mut lines = text.lines().peekable();

    while let Some(&line) = lines.peek() {
        let mut tokens = line.split_whitespace();
        let key = match tokens.next() {
            Some(key) => key.to_ascii_lowercase(),
            None => {
                lines.next();
                continue;
            }
        };
        if key.parse::<f64>().is_ok() {
            break;
        }
        let value = tokens
            .next()
            .ok_or_else(|| format!("header key {key} without value"))?;
        let number = |v: &str| v.parse::<f64>().map_err(|e| format!("{key}: {e}"));
        match key.as_str() {
            "ncols" => header.ncols = Some(value.parse().map_err(|e| format!("ncols: {e}"))?),
            "nrows" => header.nrows = Some(value.parse().map_err(|e| format!("nrows: {e}"))?),
            "xllcorner" => header.xll = Some((number(value)?, false)),
            "xllcenter" => header.xll = Some((number(value)?, true)),
            "yllcorner" => header.yll = Some((number(value)?, false)),
            "yllcenter" => header.yll = Some((number(value)?, true)),
            "cellsize" => header.cellsize = Some(number(value)?),
            "dx" => header.dx = Some(number(value)?),
            "dy" => header.dy = Some(number(value)?),
            "nodata_value" => header.nodata = Some(number(value)?),
            other => return Err(format!("unknown header key {other}")),
        }
        lines.next();
    }

    let ncols = header.ncols.ok_or("missing ncols")?;
    let nrows = header.nrows.ok_or("missing nrows")?;
    let dx = header.dx.or(header.cellsize).ok_or("missing cellsize")?;
    let dy = header.dy.or(header.cellsize).ok_or("missing cellsize")?;
    let (xll, x_center) = header.xll.ok_or("missing xllcorner")?;
    let (yll, y_center) = header.yll.ok_or("missing yllcorner")?;
    let file_nodata = header.nodata;

    let origin_x = if x_center { xll - dx / 2.0 } else { xll };
    let bottom = if y_center { yll - dy / 2.0 } else { yll };
    let origin_y = bottom + nrows as f64 * dy;

    let mut data = Vec::with_capacity(ncols * nrows);
    for line in lines {
        for token in line.split_whitespace() {
            let v: f64 = token
                .parse()
                .map_err(|e| format!("sample {}: {e}", data.len()))?;
            // Samples are stored with the crate-wide sentinel whatever the file used
            data.push(match file_nodata {
                Some(nd) if v == nd => NODATA,
                _ => v,
            });
        }
    }
    if data.len() != ncols * nrows {
        return Err(format!(
            "expected {} samples for {ncols}x{nrows}, found {}",
            ncols * nrows,
            data.len()
        ));
    }

    let geometry = GridGeometry {
        origin_x,
        origin_y,
        pixel_width: dx,
        pixel_height: -dy,
        width: ncols,
        height: nrows,
        crs: None,
    };
    Grid::new(geometry, data, NODATA).map_err(|e| e.to_string())
}

fn render(grid: &Grid) -> std::result::Result<String, String> {
    let geo = grid.geometry();
    if geo.pixel_width <= 0.0 || geo.pixel_height >= 0.0 {
        return Err("ASCII grids must be north-up".to_string());
    }
    let dy = -geo.pixel_height;
    let bounds = geo.bounds();

    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(out, "ncols {}", geo.width);
    let _ = writeln!(out, "nrows {}", geo.height);
    let _ = writeln!(out, "xllcorner {}", bounds.min_x);
    let _ = writeln!(out, "yllcorner {}", bounds.min_y);
    if geo.pixel_width == dy {
        let _ = writeln!(out, "cellsize {}", geo.pixel_width);
    } else {
        let _ = writeln!(out, "dx {}", geo.pixel_width);
        let _ = writeln!(out, "dy {dy}");
    }
    let _ = writeln!(out, "NODATA_value {}", grid.nodata());

    for row in grid.data().chunks(geo.width.max(1)) {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        let _ = writeln!(out, "{}", line.join(" "));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_and_samples() {
        let text = "ncols 3\nnrows 2\nxllcorner 100\nyllcorner 200\ncellsize 0.5\nNODATA_value -1\n1 2 -1\n4 5 6\n";
        let grid = parse(text).unwrap();
        assert_eq!(grid.width(), 3);
        assert_eq!(grid.height(), 2);
        assert_eq!(grid.geometry().origin_y, 201.0);
        assert_eq!(grid.value(0, 2), None);
        assert_eq!(grid.get(0, 2), Some(NODATA));
        assert_eq!(grid.value(1, 0), Some(4.0));
    }

    #[test]
    fn test_parse_rejects_short_body() {
        let text = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_write_then_read_keeps_crs_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dtm.asc");
        let geometry =
            GridGeometry::north_up(650000.0, 6860000.0, 1.0, 2, 2, Some(Crs::from_epsg(2154)));
        let grid = Grid::new(geometry, vec![10.25, NODATA, 11.0, 12.5], NODATA).unwrap();

        AsciiGridStore.write(&grid, &path).unwrap();
        let back = AsciiGridStore.read(&path).unwrap();
        assert_eq!(back, grid);
    }
}
