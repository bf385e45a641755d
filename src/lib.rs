//! `retrieval-harness` library crate.
//!
//! The binary (`retrieve`) is a thin wrapper around this library so that:
//!
//! - the passes are testable without spawning processes
//! - the engine seams (`Sampler`, `ForwardModel`, `Renderer`) can be swapped
//!   from other front-ends
//!
//! Layout, leaf-first: `registry` -> `runner` (writes into `store`) ->
//! `derive` -> `report`.

pub mod app;
pub mod cli;
pub mod config;
pub mod derive;
pub mod domain;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod math;
pub mod plot;
pub mod registry;
pub mod report;
pub mod runner;
pub mod store;

#[cfg(test)]
mod test_support;
