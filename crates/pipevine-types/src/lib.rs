//! Shared pipevine domain model.
//!
//! Pure data types used across the state, engine, and CLI crates: the
//! validated pipeline declaration ([`Pipeline`], [`Task`], [`Trigger`]) and
//! the mutable run records the executor produces ([`PipelineRun`],
//! [`TaskExecution`]). Kept in its own crate so storage backends and the
//! engine can share them without circular dependencies.

pub mod pipeline;
pub mod run;

pub use pipeline::{Pipeline, RetryPolicy, Task, Trigger};
pub use run::{PipelineRun, PluginResult, RunStatus, TaskExecution, TaskStatus};
