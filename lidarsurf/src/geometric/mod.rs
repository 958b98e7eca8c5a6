pub mod align;
pub mod chm;
pub mod fill;
pub mod lidar;
