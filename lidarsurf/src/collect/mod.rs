pub mod global_variables;
pub mod pdal;
pub mod source;
