use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cache::fingerprint::Fingerprint;

/// Error type for terrain surface processing
#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("point cloud {path:?} not usable: {reason}")]
    InputNotFound { path: PathBuf, reason: String },

    #[error("invalid {variant} configuration: {reason} ({})", .keys.join(", "))]
    InvalidConfig {
        variant: &'static str,
        keys: Vec<String>,
        reason: String,
    },

    #[error("engine timed out after {timeout:?} on {input:?} (fingerprint {fingerprint})")]
    EngineTimeout {
        input: PathBuf,
        fingerprint: Fingerprint,
        timeout: Duration,
        diagnostics: String,
    },

    #[error(
        "engine exited with {} on {input:?} (fingerprint {fingerprint}, stage {}): {diagnostics}",
        .code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")),
        .stage.as_ref().map_or_else(|| "unknown".to_string(), |s| s.to_string())
    )]
    EngineExitNonZero {
        input: PathBuf,
        fingerprint: Fingerprint,
        code: Option<i32>,
        stage: Option<StageRef>,
        diagnostics: String,
    },

    #[error("engine reported success on {input:?} (fingerprint {fingerprint}) but {output:?} is missing")]
    OutputMissing {
        input: PathBuf,
        fingerprint: Fingerprint,
        output: PathBuf,
    },

    #[error("gap filling failed: {0}")]
    FillFailed(String),

    #[error("unsupported alignment: {0}")]
    UnsupportedAlignment(String),

    #[error("implausible height result: {}", .0.join("; "))]
    ImplausibleResult(Vec<String>),

    #[error("grid geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("raster {path:?}: {reason}")]
    Raster { path: PathBuf, reason: String },

    #[error("cache: {0}")]
    Cache(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

/// Position and type of a pipeline stage, used to point at the failing one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    pub index: usize,
    pub kind: String,
}

impl std::fmt::Display for StageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.index, self.kind)
    }
}

pub type Result<T> = std::result::Result<T, TerrainError>;
