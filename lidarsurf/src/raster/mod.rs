pub mod ascii;
#[cfg(feature = "gdal")]
pub mod gdal_io;
pub mod grid;
pub mod store;

pub use grid::{Grid, GridGeometry};
pub use store::RasterStore;
