//! Shared types and collaborator interfaces for the ember runtime.
//!
//! The pool and cache crates are deliberately engine-agnostic: everything a
//! real scripting engine or database layer would provide crosses one of the
//! traits defined here (`ScriptEngine`, `ScriptLoader`, `DatabaseRegistry`).

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod script;
pub mod testing;

pub use config::PoolConfig;
pub use database::{DatabasePin, DatabaseRegistry, InMemoryDatabaseRegistry};
pub use engine::{GcOutcome, HeapStats, InterruptHandle, Isolate, ScriptEngine};
pub use error::PoolError;
pub use script::{ScriptError, ScriptId, ScriptLoader};
