pub const TEMP_PATH: &str = "./temp";

/// Sentinel written to every nodata pixel, by the engine and by this crate
pub const NODATA: f64 = -9999.0;

/// LAS classification codes used by the pipelines
pub const CLASS_NEVER_CLASSIFIED: u8 = 0;
pub const CLASS_GROUND: u8 = 2;
pub const CLASS_NOISE: u8 = 7;

/// Point-cloud file extensions the reader stage accepts
pub const SUPPORTED_EXTENSIONS: &[&str] = &["las", "laz"];
