use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

use log::trace;

use crate::context::ContextInner;
use crate::deque::Deque;
use crate::job::{AnyJob, Awaiter, JobExecuteStepStatus};
use crate::spinlock::Spinlock;

/// One worker's own double-ended queue of runnable jobs. The owner pushes and
/// pops its front; every other executor may only steal from the back. The
/// deque itself is plain (not thread-safe on its own, see
/// [`crate::deque::Deque`]'s own docs); the spinlock is what the original's
/// per-executor `pthread_spinlock_t` protects, matching `ARMD__Executor`.
pub(crate) struct Executor {
    id: usize,
    deque: Spinlock<Deque<Arc<dyn AnyJob>>>,
}

impl Executor {
    pub(crate) fn new(id: usize, initial_capacity: usize) -> Self {
        Executor {
            id,
            deque: Spinlock::new(Deque::new(initial_capacity)),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn push_front(&self, job: Arc<dyn AnyJob>) {
        self.deque.lock().push_front(job);
    }

    pub(crate) fn push_back(&self, job: Arc<dyn AnyJob>) {
        self.deque.lock().push_back(job);
    }

    fn pop_front(&self) -> Option<Arc<dyn AnyJob>> {
        self.deque.lock().pop_front()
    }

    fn pop_back(&self) -> Option<Arc<dyn AnyJob>> {
        self.deque.lock().pop_back()
    }
}

/// A worker thread's entry point, grounded in `executor_thread_main`
/// (`original_source/lib/src/executor.c`): take local work if there is any,
/// otherwise steal from a random victim, otherwise sleep until signalled.
/// Once a job is in hand, step it to completion, handing off to whichever of
/// its parent or its promise is waiting on it.
pub(crate) fn run(context: Arc<ContextInner>, id: usize) {
    let rng = XorShift64Star::new(id);

    loop {
        let mut job = match acquire_job(&context, id, &rng) {
            Some(job) => job,
            None => return,
        };

        loop {
            if context.is_shutting_down() {
                return;
            }

            let status = job.clone().step(id, &context);
            match status {
                JobExecuteStepStatus::CanContinue => continue,
                JobExecuteStepStatus::WaitingForOtherJobs => break,
                JobExecuteStepStatus::Finished => {
                    let has_error = job.finished_has_error();
                    match job.awaiter() {
                        Awaiter::ParentJob(parent) => {
                            let parent = parent.clone();
                            if parent.record_child_ended(has_error, id) {
                                trace!("executor {} steals its finished child's parent", id);
                                job = parent;
                                continue;
                            }
                            break;
                        }
                        Awaiter::Promise(handle) => {
                            context.complete_promise(*handle, has_error);
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Finds the next job this executor should run: its own front, a random
/// victim's back, or nothing (in which case the worker should shut down).
fn acquire_job(context: &Arc<ContextInner>, id: usize, rng: &XorShift64Star) -> Option<Arc<dyn AnyJob>> {
    loop {
        if let Some(job) = context.executor(id).pop_front() {
            context.decrement_free_job_count();
            return Some(job);
        }

        if context.wait_until_work_or_shutdown() {
            return None;
        }

        let num_executors = context.num_executors();
        if num_executors > 1 {
            let victim = rng.next_usize(num_executors);
            if victim != id {
                if let Some(job) = context.executor(victim).pop_back() {
                    trace!("executor {} steals a job from executor {}", id, victim);
                    job.set_current_executor(id);
                    context.decrement_free_job_count();
                    return Some(job);
                }
            }
        }
    }
}

/// A fast pseudorandom generator used only to pick a steal victim; tolerates
/// weak seeding as long as it is never zero. Seeded by executor id, per
/// spec's work-stealing victim policy, rather than by a shared global
/// counter.
struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    fn new(executor_id: usize) -> Self {
        let mut hasher = DefaultHasher::new();
        hasher.write_usize(executor_id);
        let mut seed = hasher.finish();
        if seed == 0 {
            seed = 0x9E37_79B9_7F4A_7C15;
        }
        XorShift64Star {
            state: Cell::new(seed),
        }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_usize(&self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}
