//! Command-line front end of the Nextflow spawner
//!
//! Each invocation performs one hub operation for one user. Process state is kept in
//! per-user JSON files between invocations and re-validated on every load.

pub mod commands;
pub mod config;
pub mod error;
pub mod state_store;


pub use error::{Error, Result};

pub use nextflow_spawner_core as core;
