//! Domain types used throughout the harness.
//!
//! This module defines:
//!
//! - configuration inputs (`Tag`, `Interval`, `Prior`, `ModelToggles`, `Configuration`)
//! - the observational record (`Dataset`, `ObservedPoint`)
//! - run outputs (`RetrievalResult`, `PosteriorSample`, `Checkpoint`)

pub mod dataset;
pub mod result;
pub mod types;

pub use dataset::*;
pub use result::*;
pub use types::*;
