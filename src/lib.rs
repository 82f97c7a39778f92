// src/lib.rs — Library root for sciloop

pub mod agents;
pub mod cli;
pub mod core;
pub mod infra;
pub mod memory;
pub mod runner;
