//! A continuation-based work-stealing task runtime.
//!
//! A [`Procedure`] is built once from an ordered sequence of continuations
//! (see [`ProcedureBuilder`]) and then `invoke`d, possibly many times and
//! concurrently, against a [`Context`]'s pool of work-stealing executors.
//! Continuations may [`StepCtx::fork`] more work and read/write a
//! long-lived per-invocation frame; an invocation's result is observed
//! through the [`Handle`] it was invoked under, via [`Context::await_promise`]
//! or [`Context::add_promise_callback`].

mod builder;
mod config;
mod context;
mod deque;
mod errors;
mod executor;
mod handle;
mod hash_table;
mod job;
mod procedure;
mod promise;
mod spinlock;

pub use crate::builder::ProcedureBuilder;
pub use crate::config::num_executors_from_env;
pub use crate::context::{AwaitOutcome, Context};
pub use crate::errors::{Result, RuntimeError};
pub use crate::handle::Handle;
pub use crate::procedure::{Procedure, StepCtx, StepResult};
