//! Input/output helpers.
//!
//! - dataset manifest + tab-delimited data ingest (`dataset`)
//! - residual CSV export (`export`)
//! - comparison report JSON (`json`)

pub mod dataset;
pub mod export;
pub mod json;

pub use dataset::*;
pub use export::*;
pub use json::*;
