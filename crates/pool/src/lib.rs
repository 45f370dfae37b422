//! Execution-context pool for the ember runtime.
//!
//! A bounded collection of heavyweight interpreter contexts shared by many
//! request threads: LIFO reuse for cache warmth, blocking admission with a
//! hard timeout, a background collector with retirement heuristics, and
//! administrative broadcast into every live context.

pub mod context;
pub mod metrics;
pub mod pool;

mod collector;
mod cpu_time;

pub use context::{ContextId, ContextSnapshot, DeferredHook, ExecutionContext};
pub use metrics::PoolMetrics;
pub use pool::{ContextLease, ContextPool, SecurityProfile};
