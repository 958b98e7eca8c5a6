pub mod classification;
pub mod engine;
pub mod executor;
pub mod pipeline;
