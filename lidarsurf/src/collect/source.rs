use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::collect::global_variables::SUPPORTED_EXTENSIONS;
use crate::error::{Result, TerrainError};
use crate::geo_core::Crs;

/// Point cloud file handed to the engine
///
/// Read-only. `crs` and `point_count` come from the LAS header when it can
/// be read; otherwise they stay `None` and the engine resolves them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudSource {
    /// Path of the LAS/LAZ file
    pub path: PathBuf,
    /// Coordinate reference system declared by the file
    pub crs: Option<Crs>,
    /// Number of points announced by the header
    pub point_count: Option<u64>,
    /// File size in bytes
    pub file_size: u64,
}

/// Version of an input file on disk: changes whenever the file is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputStamp {
    pub modified_nanos: u128,
    pub size: u64,
}

impl PointCloudSource {
    /// Open a point cloud file and inspect its header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        check_supported(path)?;
        let metadata = std::fs::metadata(path).map_err(|e| TerrainError::InputNotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let (crs, point_count) = inspect_header(path);
        debug!(
            "opened {path:?}: {} bytes, {:?} points, crs {}",
            metadata.len(),
            point_count,
            crs.as_ref().map_or_else(|| "unknown".to_string(), |c| c.to_string())
        );

        Ok(PointCloudSource {
            path: path.to_path_buf(),
            crs,
            point_count,
            file_size: metadata.len(),
        })
    }

    /// Describe a file without reading its header
    pub fn with_crs(path: impl AsRef<Path>, crs: Option<Crs>) -> Result<Self> {
        let path = path.as_ref();
        check_supported(path)?;
        let metadata = std::fs::metadata(path).map_err(|e| TerrainError::InputNotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(PointCloudSource {
            path: path.to_path_buf(),
            crs,
            point_count: None,
            file_size: metadata.len(),
        })
    }

    /// Re-check that the file is still there and readable
    pub fn validate(&self) -> Result<()> {
        check_supported(&self.path)?;
        if !self.path.is_file() {
            return Err(TerrainError::InputNotFound {
                path: self.path.clone(),
                reason: "file does not exist".to_string(),
            });
        }
        Ok(())
    }

    /// Current on-disk version of the file
    pub fn stamp(&self) -> Result<InputStamp> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| TerrainError::InputNotFound {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let modified_nanos = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        Ok(InputStamp {
            modified_nanos,
            size: metadata.len(),
        })
    }
}

fn check_supported(path: &Path) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension {
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        other => Err(TerrainError::InputNotFound {
            path: path.to_path_buf(),
            reason: format!(
                "unsupported point cloud format {:?}, expected one of {:?}",
                other.unwrap_or_default(),
                SUPPORTED_EXTENSIONS
            ),
        }),
    }
}

#[cfg(feature = "las")]
fn inspect_header(path: &Path) -> (Option<Crs>, Option<u64>) {
    match las::Reader::from_path(path) {
        Ok(reader) => {
            let header = reader.header();
            let crs = header
                .all_vlrs()
                .find_map(|vlr| crs_from_vlr(&vlr.user_id, vlr.record_id, &vlr.data));
            (crs, Some(header.number_of_points()))
        }
        Err(e) => {
            debug!("could not read LAS header of {path:?}: {e}");
            (None, None)
        }
    }
}

#[cfg(not(feature = "las"))]
fn inspect_header(_path: &Path) -> (Option<Crs>, Option<u64>) {
    (None, None)
}

const PROJECTION_USER_ID: &str = "LASF_Projection";
const GEO_KEY_DIRECTORY_RECORD: u16 = 34735;
const OGC_WKT_RECORD: u16 = 2112;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
/// GeoKey values above this are "user defined" rather than EPSG codes
const USER_DEFINED_KEY_VALUE: u16 = 32767;

/// CRS declared by a projection VLR, if this VLR is one
pub(crate) fn crs_from_vlr(user_id: &str, record_id: u16, data: &[u8]) -> Option<Crs> {
    if user_id.trim_end_matches('\0') != PROJECTION_USER_ID {
        return None;
    }
    match record_id {
        GEO_KEY_DIRECTORY_RECORD => epsg_from_geokeys(data).map(Crs::from_epsg),
        OGC_WKT_RECORD => {
            let wkt = String::from_utf8_lossy(data);
            let wkt = wkt.trim_end_matches('\0').trim();
            (!wkt.is_empty()).then(|| Crs::from_wkt(wkt))
        }
        _ => None,
    }
}

/// EPSG code from a GeoTIFF GeoKeyDirectory
///
/// The directory is a list of little-endian u16: a 4-entry header whose last
/// entry is the key count, then 4 entries per key (id, location, count,
/// value). Only keys stored inline (location 0) are considered; a projected
/// code wins over a geographic one.
fn epsg_from_geokeys(data: &[u8]) -> Option<u32> {
    let words: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let count = *words.get(3)? as usize;
    let mut projected = None;
    let mut geographic = None;
    for key in words.get(4..4 + 4 * count)?.chunks_exact(4) {
        let (id, location, value) = (key[0], key[1], key[3]);
        if location != 0 || value == 0 || value >= USER_DEFINED_KEY_VALUE {
            continue;
        }
        match id {
            PROJECTED_CS_TYPE_KEY => projected = Some(u32::from(value)),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(u32::from(value)),
            _ => {}
        }
    }
    projected.or(geographic)
}
