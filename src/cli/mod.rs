//! Command line interface
//!
//! Argument parsing and the runner that turns arguments into a push operation.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
