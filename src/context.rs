use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::trace;

use crate::errors::{Result, RuntimeError};
use crate::executor::Executor;
use crate::handle::Handle;
use crate::job::{AnyJob, Awaiter, JobImpl};
use crate::procedure::Procedure;
use crate::promise::{PromiseManager, PromiseStatus};

const INITIAL_DEQUE_SIZE: usize = 128;

/// Used by [`Context::from_env`] when `LOOMRT_NUM_EXECUTORS` is unset.
const DEFAULT_NUM_EXECUTORS: usize = 4;

/// Outcome of [`Context::await_promise`]. The C ABI's `armd_await` only ever
/// reports whether the handle was valid, discarding the completed promise's
/// own error flag the moment it returns -- `loomrt` keeps a completed
/// promise's record alive for exactly this purpose (see
/// `crate::promise::PromiseManager`'s reference counting) and surfaces the
/// flag here instead.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AwaitOutcome {
    Success,
    Failed,
    Invalid,
}

/// Scheduler-wide bookkeeping guarded by a single mutex/condvar pair,
/// matching `ARMD_Context`'s `executor_mutex`/`executor_condvar` and its
/// `free_job_count` field.
struct SchedState {
    free_job_count: usize,
    shutting_down: bool,
}

/// The shared, `Arc`'d half of a [`Context`]. Worker threads and
/// [`crate::procedure::StepCtx`] only ever need this half -- splitting it out
/// keeps the thread-lifecycle bookkeeping in `Context` off every fork/step
/// hot path.
pub(crate) struct ContextInner {
    executors: Vec<Executor>,
    sched: Mutex<SchedState>,
    sched_condvar: Condvar,
    promise_manager: Mutex<PromiseManager>,
    promise_condvar: Condvar,
}

impl ContextInner {
    pub(crate) fn num_executors(&self) -> usize {
        self.executors.len()
    }

    pub(crate) fn executor(&self, id: usize) -> &Executor {
        &self.executors[id]
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sched.lock().unwrap().shutting_down
    }

    /// Blocks until either some executor has runnable work, or the context
    /// is shutting down; returns `true` in the latter case. Grounded in the
    /// "Waiting for job" section of `executor_thread_main`.
    pub(crate) fn wait_until_work_or_shutdown(&self) -> bool {
        let mut sched = self.sched.lock().unwrap();
        while sched.free_job_count == 0 && !sched.shutting_down {
            sched = self.sched_condvar.wait(sched).unwrap();
        }
        sched.shutting_down
    }

    pub(crate) fn decrement_free_job_count(&self) {
        self.sched.lock().unwrap().free_job_count -= 1;
    }

    fn bump_free_job_count(&self) {
        self.sched.lock().unwrap().free_job_count += 1;
        self.sched_condvar.notify_all();
    }

    /// Forks a child job of `parent` onto executor `executor_id`. Equivalent
    /// to `fork_with_executor` in `original_source/lib/src/context.c`; unlike
    /// that version, enqueueing itself cannot fail (the deque grows rather
    /// than running out of room), so there is no rollback path to mirror.
    pub(crate) fn fork<A2, Fr2>(
        &self,
        executor_id: usize,
        parent: Arc<dyn AnyJob>,
        procedure: Arc<Procedure<A2, Fr2>>,
        args: A2,
    ) -> Result<()>
    where
        A2: Send + Sync + 'static,
        Fr2: Default + Send + 'static,
    {
        if executor_id >= self.executors.len() {
            return Err(RuntimeError::ExecutorOutOfRange {
                requested: executor_id,
                num_executors: self.executors.len(),
            }
            .into());
        }

        parent.add_waiting_child();
        let job = JobImpl::new(
            procedure,
            Arc::new(args),
            Awaiter::ParentJob(parent),
            executor_id,
            false,
        );
        self.executors[executor_id].push_front(job as Arc<dyn AnyJob>);
        self.bump_free_job_count();
        Ok(())
    }

    /// Fires a completed promise's callbacks and wakes every dependent
    /// promise that was waiting on it, enqueueing any dependent whose last
    /// outstanding dependency this was. Equivalent to
    /// `armd__context_complete_promise`, except the promise's own record
    /// outlives this call (released only once every interested party --
    /// caller and dependents alike -- has consumed it).
    pub(crate) fn complete_promise(&self, handle: Handle, has_error: bool) {
        let (callbacks, dependents) = {
            let mut pm = self.promise_manager.lock().unwrap();
            // Drain callbacks and dependents *before* `mark_completed`: if
            // this promise was detached while still pending, marking it
            // completed releases (and may remove) its record, and a
            // callback queued on it would otherwise be silently lost.
            let callbacks = pm.take_callbacks(handle);
            let dependents = pm.continuation_promises_of(handle);
            pm.mark_completed(handle, has_error);
            (callbacks, dependents)
        };

        // Invoked outside the lock: a callback that calls back into this
        // context would otherwise deadlock, matching the original's own
        // warning on `armd_add_promise_callback`.
        for cb in callbacks {
            cb(has_error);
        }

        let mut ready_jobs = Vec::new();
        {
            let mut pm = self.promise_manager.lock().unwrap();
            for dependent in dependents {
                if dependent.is_nil() {
                    continue;
                }
                if let Some((job, dependency_error)) = pm.record_dependency_ended(dependent, has_error) {
                    job.set_dependency_error(dependency_error);
                    ready_jobs.push(job);
                }
                pm.release(handle);
            }
        }
        self.promise_condvar.notify_all();

        for job in ready_jobs {
            trace!("dependency chain unblocked a pending job");
            self.executors[0].push_back(job);
            self.bump_free_job_count();
        }
    }
}

/// The execution engine: a fixed pool of work-stealing executors plus the
/// promise table that `invoke`d procedures complete into. Equivalent to
/// `ARMD_Context`.
pub struct Context {
    inner: Arc<ContextInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Context {
    /// Creates a context with exactly `num_executors` worker threads,
    /// blocking until they have all started. Equivalent to
    /// `armd_context_create`.
    pub fn new(num_executors: usize) -> Result<Context> {
        assert!(num_executors >= 1, "a context needs at least one executor");

        let executors = (0..num_executors)
            .map(|id| Executor::new(id, INITIAL_DEQUE_SIZE))
            .collect();

        let inner = Arc::new(ContextInner {
            executors,
            sched: Mutex::new(SchedState {
                free_job_count: 0,
                shutting_down: false,
            }),
            sched_condvar: Condvar::new(),
            promise_manager: Mutex::new(PromiseManager::new()),
            promise_condvar: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(num_executors);
        for id in 0..num_executors {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("loomrt-executor-{}", id))
                .spawn(move || crate::executor::run(inner, id))
                .map_err(|e| failure::format_err!("failed to spawn executor thread {}: {}", id, e))?;
            threads.push(handle);
        }

        Ok(Context {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// Creates a context sized from the `LOOMRT_NUM_EXECUTORS` environment
    /// variable, falling back to [`DEFAULT_NUM_EXECUTORS`] if it is unset.
    pub fn from_env() -> Result<Context> {
        let num_executors = crate::config::num_executors_from_env().unwrap_or(DEFAULT_NUM_EXECUTORS);
        Context::new(num_executors)
    }

    pub fn num_executors(&self) -> usize {
        self.inner.num_executors()
    }

    /// Invokes `procedure` with `args`, gated on `dependencies` all having
    /// completed first. Returns `Handle::NIL` if any dependency names a
    /// handle that was never issued. Equivalent to `armd_invoke`.
    pub fn invoke<A, Fr>(
        &self,
        procedure: Arc<Procedure<A, Fr>>,
        args: A,
        dependencies: &[Handle],
    ) -> Handle
    where
        A: Send + Sync + 'static,
        Fr: Default + Send + 'static,
    {
        let executor_id = 0;

        let mut pm = self.inner.promise_manager.lock().unwrap();
        let new_handle = pm.peek_handle();

        let (num_waiting, initial_has_error) = match pm.build_dependency_graph(dependencies, new_handle) {
            Some(n) => n,
            None => return Handle::NIL,
        };
        pm.commit_handle(new_handle);

        let job = JobImpl::new(
            procedure,
            Arc::new(args),
            Awaiter::Promise(new_handle),
            executor_id,
            num_waiting == 0 && initial_has_error,
        );

        let record = if num_waiting == 0 {
            PromiseManager::new_record(0, None, false)
        } else {
            PromiseManager::new_record(num_waiting, Some(job.clone() as Arc<dyn AnyJob>), initial_has_error)
        };
        pm.insert(new_handle, record);
        drop(pm);

        if num_waiting == 0 {
            self.inner.executors[executor_id].push_back(job as Arc<dyn AnyJob>);
            self.inner.bump_free_job_count();
        }

        trace!(
            "invoked job under handle {:?} ({} pending dependencies)",
            new_handle,
            num_waiting
        );
        new_handle
    }

    /// Blocks the calling thread until `handle` completes. Equivalent to
    /// `armd_await`, enriched to report whether the procedure errored (see
    /// [`AwaitOutcome`]). A detached handle is never valid to await, even if
    /// its promise is still present in the table pending some other party's
    /// release.
    pub fn await_promise(&self, handle: Handle) -> AwaitOutcome {
        let mut pm = self.inner.promise_manager.lock().unwrap();
        if pm.is_detached(handle) {
            return AwaitOutcome::Invalid;
        }
        loop {
            match pm.status(handle) {
                None => return AwaitOutcome::Invalid,
                Some(PromiseStatus::Pending) => {
                    pm = self.inner.promise_condvar.wait(pm).unwrap();
                }
                Some(PromiseStatus::Completed { has_error }) => {
                    pm.release_after_await(handle);
                    return if has_error {
                        AwaitOutcome::Failed
                    } else {
                        AwaitOutcome::Success
                    };
                }
            }
        }
    }

    /// Detaches `handle`: the caller no longer intends to `await_promise` it,
    /// and its record is cleaned up on its own once it completes. Equivalent
    /// to `armd_detach`. Fails if `handle` is unknown or was already
    /// detached.
    pub fn detach(&self, handle: Handle) -> Result<()> {
        let mut pm = self.inner.promise_manager.lock().unwrap();
        if !pm.exists(handle) {
            return Err(RuntimeError::HandleNotFound(handle).into());
        }
        pm.detach(handle)
            .ok_or_else(|| RuntimeError::Detached(handle).into())
    }

    /// Blocks until no promise in this context is still pending. Equivalent
    /// to `armd_await_all`.
    pub fn await_all(&self) {
        let mut pm = self.inner.promise_manager.lock().unwrap();
        while pm.any_pending() {
            pm = self.inner.promise_condvar.wait(pm).unwrap();
        }
    }

    /// Registers `callback` to run once `handle` completes, with its
    /// argument set to whether the procedure errored. If `handle` has
    /// already completed, `callback` runs immediately, on the calling
    /// thread, before this call returns. Equivalent to
    /// `armd_add_promise_callback`.
    pub fn add_promise_callback<F>(&self, handle: Handle, callback: F) -> Result<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let mut pm = self.inner.promise_manager.lock().unwrap();
        let status = pm
            .status(handle)
            .ok_or_else(|| RuntimeError::HandleNotFound(handle))?;
        match status {
            PromiseStatus::Completed { has_error } => {
                drop(pm);
                callback(has_error);
            }
            PromiseStatus::Pending => {
                pm.queue_callback(handle, Box::new(callback));
            }
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        {
            let mut sched = self.inner.sched.lock().unwrap();
            sched.shutting_down = true;
        }
        self.inner.sched_condvar.notify_all();

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}
