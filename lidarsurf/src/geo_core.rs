use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate reference system of a point cloud or raster
///
/// Either an EPSG code, a WKT definition, or both. Two systems are the same
/// when their EPSG codes match, or, lacking codes on either side, when their
/// WKT texts match after whitespace normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crs {
    /// EPSG code, if known
    pub epsg: Option<u32>,
    /// WKT definition, if known
    pub wkt: Option<String>,
}

impl Crs {
    pub fn from_epsg(code: u32) -> Self {
        Crs {
            epsg: Some(code),
            wkt: None,
        }
    }

    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Crs {
            epsg: None,
            wkt: Some(wkt.into()),
        }
    }

    /// Parse a user supplied definition: `EPSG:2154`, `epsg:2154`, a bare
    /// code, or anything else taken as WKT
    pub fn parse(definition: &str) -> Self {
        let trimmed = definition.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        match code.parse::<u32>() {
            Ok(epsg) => Crs::from_epsg(epsg),
            Err(_) => Crs::from_wkt(trimmed),
        }
    }

    /// Whether both definitions designate the same system
    pub fn same_as(&self, other: &Crs) -> bool {
        match (self.epsg, other.epsg) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.wkt, &other.wkt) {
                (Some(a), Some(b)) => normalize_wkt(a) == normalize_wkt(b),
                _ => false,
            },
        }
    }

    /// Definition in the form the engine and GDAL accept
    pub fn to_definition(&self) -> String {
        match (self.epsg, &self.wkt) {
            (Some(code), _) => format!("EPSG:{code}"),
            (None, Some(wkt)) => wkt.clone(),
            (None, None) => String::new(),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.epsg, &self.wkt) {
            (Some(code), _) => write!(f, "EPSG:{code}"),
            (None, Some(wkt)) => {
                let head: String = wkt.chars().take(48).collect();
                write!(f, "WKT[{head}...]")
            }
            (None, None) => write!(f, "unknown"),
        }
    }
}

fn normalize_wkt(wkt: &str) -> String {
    wkt.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether two optional systems are compatible for pixel comparison
///
/// Unknown on both sides counts as compatible; unknown on one side only is
/// compatible only when `allow_unknown` is set.
pub fn crs_compatible(a: Option<&Crs>, b: Option<&Crs>, allow_unknown: bool) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_as(b),
        (None, None) => true,
        _ => allow_unknown,
    }
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Whether `other` lies inside `self`, allowing `tolerance` map units of slack
    pub fn contains(&self, other: &BoundingBox, tolerance: f64) -> bool {
        other.min_x >= self.min_x - tolerance
            && other.max_x <= self.max_x + tolerance
            && other.min_y >= self.min_y - tolerance
            && other.max_y <= self.max_y + tolerance
    }

    /// Overlapping area of both boxes, if it is not empty
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_x = self.min_x.max(other.min_x);
        let min_y = self.min_y.max(other.min_y);
        let max_x = self.max_x.min(other.max_x);
        let max_y = self.max_y.min(other.max_y);
        if min_x < max_x && min_y < max_y {
            Some(BoundingBox::new(min_x, min_y, max_x, max_y))
        } else {
            None
        }
    }
}
