//! Numerical utilities: wavelength grids, quadrature and sample statistics.

pub mod grid;
pub mod stats;

pub use grid::*;
pub use stats::*;
