use serde::{Deserialize, Serialize};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Apply `f` to every row index, in parallel when the `rayon` feature is on
pub fn map_rows<T, F>(height: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    #[cfg(feature = "rayon")]
    {
        (0..height).into_par_iter().map(f).collect()
    }

    #[cfg(not(feature = "rayon"))]
    {
        (0..height).map(f).collect()
    }
}

/// Summary statistics of a set of samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
}

/// Single pass mean and variance (Welford), `None` for an empty input
pub fn summarize(values: impl IntoIterator<Item = f64>) -> Option<Summary> {
    let mut count = 0usize;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        count += 1;
        let delta = v - mean;
        mean += delta / count as f64;
        m2 += delta * (v - mean);
        min = min.min(v);
        max = max.max(v);
    }
    (count > 0).then(|| Summary {
        count,
        min,
        max,
        mean,
        std: (m2 / count as f64).max(0.0).sqrt(),
    })
}

/// `part / total`, 0 when `total` is 0
pub fn fraction(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Snap `value` to the nearest integer when closer than `tolerance`
pub fn snap(value: f64, tolerance: f64) -> f64 {
    let rounded = value.round();
    if (value - rounded).abs() <= tolerance {
        rounded
    } else {
        value
    }
}
