use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;

use crate::context::ContextInner;
use crate::handle::Handle;
use crate::procedure::{Procedure, StepCtx, StepResult};
use crate::spinlock::Spinlock;

/// Who gets notified once a job finishes: the promise it was directly
/// invoked under, or the parent job that forked it.
///
/// `parent`'s concrete type is necessarily erased (a parent and its forked
/// child are, in general, instantiations of `Procedure` over different `A`
/// and `Fr`), the same way `ARMD__JobAwaiter`'s tagged union lets a C `Job`
/// reference either case without caring about the pointee's shape.
pub(crate) enum Awaiter {
    ParentJob(Arc<dyn AnyJob>),
    Promise(Handle),
}

/// Outcome of one `AnyJob::step` call, matching `ARMD__JobExecuteStepStatus`.
pub(crate) enum JobExecuteStepStatus {
    WaitingForOtherJobs,
    CanContinue,
    Finished,
}

/// The join-counter bookkeeping shared between a job's own step-completion
/// and its children's completions; the only part of a job genuinely touched
/// from more than one thread, hence the only part behind a lock. Mirrors the
/// `num_all_waiting_jobs`/`num_ended_waiting_jobs`/`parent_finished`/
/// `has_error` quartet in `ARMD_Job`.
///
/// `has_error` is scoped to one round (one continuation's step plus whatever
/// children it forked), not cumulative across the whole job: it is cleared
/// at the start of every round, carrying forward only as `pending_error`
/// (which a subsequent error trap can see and downgrade). The one round
/// whose `has_error` is never cleared is the job's last -- the terminal
/// check at the top of `step` returns before the reset runs -- so
/// `finished_has_error` reading it directly is exactly "did the last round,
/// including any of its children, end in error".
struct JobSync {
    num_all_waiting: usize,
    num_ended_waiting: usize,
    parent_finished: bool,
    has_error: bool,
}

/// A live job: a procedure, a particular invocation's arguments, the
/// long-lived frame threaded through every continuation, and whichever
/// continuation-local scratch frame is currently live.
///
/// `frame`, `scratch`, `continuation_index`, and `pending_error` are plain
/// `UnsafeCell`s rather than being lock-protected: exactly one thread ever
/// owns a job at a time (the executor that currently holds it, by
/// construction of the deque/steal protocol), so these fields need no
/// synchronization of their own -- matching the original's unlocked
/// `job->frame`/`job->continuation_frame`/`job->continuation_index` fields,
/// and the same "single owner, `UnsafeCell`" idiom the teacher's own
/// `multitask::task::StackTask` uses for its func/result cells. Locking them
/// anyway would also deadlock: a continuation that forks a child locks this
/// same job (to bump `num_all_waiting`) from the very thread that is running
/// the continuation.
pub(crate) struct JobImpl<A, Fr> {
    procedure: Arc<Procedure<A, Fr>>,
    args: Arc<A>,
    awaiter: Awaiter,
    frame: UnsafeCell<Fr>,
    scratch: UnsafeCell<Option<Box<dyn Any + Send>>>,
    continuation_index: UnsafeCell<usize>,
    pending_error: UnsafeCell<bool>,
    sync: Spinlock<JobSync>,
    current_executor: AtomicUsize,
}

unsafe impl<A: Send + Sync, Fr: Send> Send for JobImpl<A, Fr> {}
unsafe impl<A: Send + Sync, Fr: Send> Sync for JobImpl<A, Fr> {}

impl<A, Fr> JobImpl<A, Fr>
where
    A: Send + Sync + 'static,
    Fr: Default + Send + 'static,
{
    pub(crate) fn new(
        procedure: Arc<Procedure<A, Fr>>,
        args: Arc<A>,
        awaiter: Awaiter,
        executor_id: usize,
        dependency_has_error: bool,
    ) -> Arc<Self> {
        Arc::new(JobImpl {
            procedure,
            args,
            awaiter,
            frame: UnsafeCell::new(Fr::default()),
            scratch: UnsafeCell::new(None),
            continuation_index: UnsafeCell::new(0),
            pending_error: UnsafeCell::new(dependency_has_error),
            sync: Spinlock::new(JobSync {
                num_all_waiting: 1,
                num_ended_waiting: 0,
                parent_finished: false,
                has_error: dependency_has_error,
            }),
            current_executor: AtomicUsize::new(executor_id),
        })
    }
}

/// The type-erased face every job presents to the executor pool and to the
/// promise/join machinery, regardless of its own `Procedure<A, Fr>`
/// instantiation. The Rust-idiomatic counterpart of the C runtime's bare
/// `void *`-based `ARMD_Job`.
pub(crate) trait AnyJob: Send + Sync {
    fn step(self: Arc<Self>, executor_id: usize, context: &ContextInner) -> JobExecuteStepStatus;
    fn awaiter(&self) -> &Awaiter;
    fn finished_has_error(&self) -> bool;
    fn current_executor(&self) -> usize;
    fn set_current_executor(&self, id: usize);
    fn add_waiting_child(&self);
    fn record_child_ended(&self, child_has_error: bool, executor_id: usize) -> bool;
    /// Marks a job, before it has run its first continuation, as starting
    /// out in the error state -- used when a promise-gated job's
    /// dependencies included one that ended in error, so the job's very
    /// first continuation sees a pending error and runs its trap (or faults
    /// immediately, absent one) rather than the ordinary step body. Safe to
    /// call here because nothing else can be touching this job yet: it is
    /// called exactly once, between taking the job out of the promise
    /// table and handing it to an executor's deque.
    fn set_dependency_error(&self, has_error: bool);
}

impl<A, Fr> AnyJob for JobImpl<A, Fr>
where
    A: Send + Sync + 'static,
    Fr: Send + 'static,
{
    fn step(self: Arc<Self>, executor_id: usize, context: &ContextInner) -> JobExecuteStepStatus {
        let num_continuations = self.procedure.num_continuations();
        let continuation_index = unsafe { *self.continuation_index.get() };
        if continuation_index == num_continuations {
            if let Some(unwind) = &self.procedure.unwind {
                let args = self.args.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| unwind(&args)));
                if let Err(payload) = outcome {
                    log::warn!("unwind hook panicked: {}", panic_message(&payload));
                }
            }
            return JobExecuteStepStatus::Finished;
        }

        // No child of *this* step exists yet -- forking only happens once
        // the continuation below actually runs -- so resetting the join
        // counters needs no coordination with anything but ourselves. Any
        // error a prior round's children reported after this job's own step
        // had already closed its accounting (the steal-resume path) is
        // sitting in `sync.has_error`; fold it into `pending_error` before
        // clearing it, so this round's continuation (or its error trap) can
        // see and react to it rather than it vanishing silently.
        let inherited_child_error = {
            let mut sync = self.sync.lock();
            let inherited = sync.has_error;
            sync.num_all_waiting = 1;
            sync.num_ended_waiting = 0;
            sync.parent_finished = false;
            sync.has_error = false;
            inherited
        };
        if inherited_child_error {
            unsafe {
                *self.pending_error.get() = true;
            }
        }

        let continuation = &self.procedure.continuations[continuation_index];

        let scratch_slot = unsafe { &mut *self.scratch.get() };
        if scratch_slot.is_none() {
            *scratch_slot = Some((continuation.scratch_alloc)());
        }
        let mut scratch = scratch_slot.take().expect("scratch frame was just allocated");

        let pending_error = unsafe { *self.pending_error.get() };
        let frame = unsafe { &mut *self.frame.get() };
        let step_ctx = StepCtx {
            context,
            job: &self,
            executor_id,
        };

        let step_fn = if pending_error {
            continuation.error_trap.clone()
        } else {
            Some(continuation.step.clone())
        };

        let result = match step_fn {
            None => StepResult::Error,
            Some(f) => {
                let args = self.args.clone();
                let scratch_ref = scratch.as_mut();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    (f)(&step_ctx, &args, frame, scratch_ref)
                }));
                match outcome {
                    Ok(r) => r,
                    Err(payload) => {
                        let message = panic_message(&payload);
                        log::warn!("continuation panicked: {}", message);
                        StepResult::Error
                    }
                }
            }
        };

        unsafe {
            *self.scratch.get() = Some(scratch);
        }

        match result {
            StepResult::Ended => unsafe {
                *self.continuation_index.get() += 1;
                *self.pending_error.get() = false;
                *self.scratch.get() = None;
            },
            StepResult::Repeat => unsafe {
                *self.pending_error.get() = false;
            },
            StepResult::Error => unsafe {
                *self.continuation_index.get() += 1;
                *self.pending_error.get() = true;
                *self.scratch.get() = None;
            },
        }

        let can_continue = {
            let mut sync = self.sync.lock();
            if matches!(result, StepResult::Error) {
                sync.has_error = true;
            }
            sync.parent_finished = true;
            sync.num_ended_waiting += 1;
            assert!(sync.num_ended_waiting <= sync.num_all_waiting);
            sync.num_ended_waiting >= sync.num_all_waiting
        };

        if can_continue {
            trace!(
                "job step on executor {} can continue immediately",
                executor_id
            );
            JobExecuteStepStatus::CanContinue
        } else {
            JobExecuteStepStatus::WaitingForOtherJobs
        }
    }

    fn awaiter(&self) -> &Awaiter {
        &self.awaiter
    }

    fn finished_has_error(&self) -> bool {
        self.sync.lock().has_error
    }

    fn current_executor(&self) -> usize {
        self.current_executor.load(Ordering::Relaxed)
    }

    fn set_current_executor(&self, id: usize) {
        self.current_executor.store(id, Ordering::Relaxed);
    }

    fn add_waiting_child(&self) {
        self.sync.lock().num_all_waiting += 1;
    }

    fn record_child_ended(&self, child_has_error: bool, executor_id: usize) -> bool {
        let mut sync = self.sync.lock();
        sync.num_ended_waiting += 1;
        assert!(sync.num_ended_waiting <= sync.num_all_waiting);
        if child_has_error {
            sync.has_error = true;
        }
        let enabled = sync.parent_finished && sync.num_ended_waiting >= sync.num_all_waiting;
        if enabled {
            self.current_executor.store(executor_id, Ordering::Relaxed);
        }
        enabled
    }

    fn set_dependency_error(&self, has_error: bool) {
        if has_error {
            unsafe {
                *self.pending_error.get() = true;
            }
            self.sync.lock().has_error = true;
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
