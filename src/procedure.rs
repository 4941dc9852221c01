use std::any::Any;
use std::sync::Arc;

use crate::context::ContextInner;
use crate::job::{AnyJob, JobImpl};

/// The three-way outcome of running one continuation.
///
/// `Repeat` re-enters the *same* continuation on the next step (used by the
/// `sequential_for`/`parallel_for` builders to drive their internal index);
/// `Ended` advances to the next continuation; `Error` advances too, but
/// leaves a pending error behind for the next continuation's error trap (or,
/// absent a trap, forces the job itself into the error state). Mirrors
/// `ARMD_ContinuationResult` in `original_source/lib/src/procedure.h`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StepResult {
    Ended,
    Repeat,
    Error,
}

/// Mutable per-step context handed to a continuation and its error trap.
///
/// This is the Rust-idiomatic replacement for the C ABI's bare `ARMD_Job *`
/// parameter: rather than exposing the job itself, it exposes exactly the
/// two capabilities a continuation body needs -- forking more work, and
/// asking where it's currently running -- through methods on this struct
/// (see [`crate::context::Context::invoke`] for the outer, context-level
/// operations a continuation cannot call from inside a step).
pub struct StepCtx<'a, A, Fr> {
    pub(crate) context: &'a ContextInner,
    pub(crate) job: &'a Arc<JobImpl<A, Fr>>,
    pub(crate) executor_id: usize,
}

impl<'a, A, Fr> StepCtx<'a, A, Fr>
where
    A: Send + Sync + 'static,
    Fr: Send + 'static,
{
    /// The total number of executors in the owning context.
    pub fn num_executors(&self) -> usize {
        self.context.num_executors()
    }

    /// The executor id this step is currently running on.
    pub fn executor_id(&self) -> usize {
        self.executor_id
    }

    /// Forks a child job onto the same executor this step is running on,
    /// joined back into this job's continuation sequence once it (and any
    /// siblings) finish. Equivalent to `armd_fork`.
    pub fn fork<A2, Fr2>(&self, procedure: Arc<Procedure<A2, Fr2>>, args: A2) -> crate::errors::Result<()>
    where
        A2: Send + Sync + 'static,
        Fr2: Default + Send + 'static,
    {
        self.fork_with_id(self.executor_id, procedure, args)
    }

    /// Forks a child job onto a specific executor. Equivalent to
    /// `armd_fork_with_id`.
    pub fn fork_with_id<A2, Fr2>(
        &self,
        executor_id: usize,
        procedure: Arc<Procedure<A2, Fr2>>,
        args: A2,
    ) -> crate::errors::Result<()>
    where
        A2: Send + Sync + 'static,
        Fr2: Default + Send + 'static,
    {
        self.context
            .fork(executor_id, self.job.clone() as Arc<dyn AnyJob>, procedure, args)
    }
}

type StepFn<A, Fr> = dyn Fn(&StepCtx<A, Fr>, &A, &mut Fr, &mut dyn Any) -> StepResult + Send + Sync;
type ScratchAlloc = dyn Fn() -> Box<dyn Any + Send> + Send + Sync;
type UnwindFn<A> = dyn Fn(&A) + Send + Sync;

/// One step of a procedure: its body, an optional error trap, and the
/// scratch-frame allocator used while it runs.
///
/// Grounded in `ARMD__Continuation` (`original_source/lib/src/procedure.h`):
/// the C struct's separate `continuation_constants` pointer and
/// `continuation_frame_destroyer` function pointer both disappear here --
/// captured state lives in the closures' own environments, and scratch
/// release is just `Drop`.
pub(crate) struct Continuation<A, Fr> {
    pub(crate) step: Arc<StepFn<A, Fr>>,
    pub(crate) error_trap: Option<Arc<StepFn<A, Fr>>>,
    pub(crate) scratch_alloc: Arc<ScratchAlloc>,
}

/// An ordered sequence of continuations, built once via
/// [`crate::builder::ProcedureBuilder`] and invoked (possibly many times,
/// concurrently, with different arguments) via
/// [`crate::context::Context::invoke`].
pub struct Procedure<A, Fr> {
    pub(crate) continuations: Vec<Continuation<A, Fr>>,
    pub(crate) unwind: Option<Arc<UnwindFn<A>>>,
}

impl<A, Fr> Procedure<A, Fr> {
    pub(crate) fn num_continuations(&self) -> usize {
        self.continuations.len()
    }
}
