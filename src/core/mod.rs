// src/core/mod.rs — Cycle engine: data model, dispatcher, Pareto engine,
// execution coordinator and the state machine that ties them together.

pub mod bus;
pub mod checkpoint;
pub mod coordinator;
pub mod engine;
pub mod pareto;
pub mod retry;
pub mod types;
