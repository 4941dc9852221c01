use crate::handle::{Handle, HandleAllocator};
use crate::hash_table::HashTable;
use crate::job::AnyJob;
use std::sync::Arc;

/// A promise's terminal state, once known. `loomrt` keeps a completed
/// promise's record around (rather than freeing it immediately, as
/// `armd__context_complete_promise` does in the original) until every
/// interested party -- the invoking caller, and every promise that listed
/// this one as a dependency -- has read it; see `reference_count` below.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum PromiseStatus {
    Pending,
    Completed { has_error: bool },
}

/// One entry in the [`PromiseManager`]'s table.
///
/// Grounded in `ARMD__Promise` (`original_source/lib/src/promise.h`,
/// built up by `promise.c`). `continuation_promises` keeps the
/// tombstone-by-zero removal scheme from `armd__promise_remove_continuation_promise`
/// (a `Handle::NIL` entry marks a removed edge) since the list is walked
/// positionally when a dependency is cleaned up after a failed `invoke`.
pub(crate) struct PromiseRecord {
    pub(crate) status: PromiseStatus,
    pub(crate) reference_count: usize,
    pub(crate) detached: bool,
    pub(crate) num_all_waiting: usize,
    pub(crate) num_ended_waiting: usize,
    pub(crate) error_in_waiting: bool,
    pub(crate) pending_job: Option<Arc<dyn AnyJob>>,
    pub(crate) continuation_promises: Vec<Handle>,
    pub(crate) callbacks: Vec<Box<dyn FnOnce(bool) + Send>>,
}

impl PromiseRecord {
    fn new(num_all_waiting: usize, pending_job: Option<Arc<dyn AnyJob>>, initial_has_error: bool) -> Self {
        PromiseRecord {
            status: PromiseStatus::Pending,
            reference_count: 1,
            detached: false,
            num_all_waiting,
            num_ended_waiting: 0,
            error_in_waiting: initial_has_error,
            pending_job,
            continuation_promises: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    fn add_continuation_promise(&mut self, handle: Handle) {
        self.continuation_promises.push(handle);
    }

    fn remove_continuation_promise(&mut self, handle: Handle) -> usize {
        let mut removed = 0;
        for slot in self.continuation_promises.iter_mut() {
            if *slot == handle {
                *slot = Handle::NIL;
                removed += 1;
            }
        }
        removed
    }
}

/// Owns the promise table and the monotonic handle counter. Reached only
/// through a single mutex (see [`crate::context::ContextInner`]) and a
/// condvar signalled on every completion, matching
/// `ARMD__PromiseManager`'s `mutex`/`condvar` pair.
pub(crate) struct PromiseManager {
    pub(crate) promises: HashTable<PromiseRecord>,
    handles: HandleAllocator,
    /// Number of records in `promises` still `Pending`, tracked separately
    /// so [`crate::context::Context::await_all`] doesn't need an iterator
    /// over the hash table.
    pending_count: usize,
}

impl PromiseManager {
    pub(crate) fn new() -> Self {
        PromiseManager {
            promises: HashTable::new(16, 0.5),
            handles: HandleAllocator::new(),
            pending_count: 0,
        }
    }

    /// Previews the handle a fresh invocation would get, without committing
    /// the counter. Call `commit_handle` once the invocation is known to
    /// succeed; an invocation that fails validation can simply drop the
    /// preview, leaving the issued-handle sequence dense.
    pub(crate) fn peek_handle(&self) -> Handle {
        self.handles.peek()
    }

    /// Commits a handle previously returned by `peek_handle`, advancing the
    /// counter past it.
    pub(crate) fn commit_handle(&mut self, handle: Handle) {
        self.handles.commit(handle);
    }

    /// Builds the dependency graph for a fresh invocation: every dependency
    /// still `Pending` gets `target` appended to its `continuation_promises`
    /// and counts toward the returned pending count; a dependency that has
    /// already completed (whether still present in the table under its own
    /// lingering reference count, or already removed entirely) contributes
    /// its `has_error` (if known) to the returned aggregate instead, without
    /// adding an edge -- it will never see a `complete_promise` call to
    /// notify this new target through. A dependency that is not strictly
    /// older than `target` itself (including a self-reference) is a
    /// programmer error and aborts the whole graph, unwinding any edges
    /// already added. Handles are allocated monotonically, so any dependency
    /// honestly issued before this invocation must compare less than
    /// `target`. A dependency handle of `Handle::NIL` is always treated as
    /// already-satisfied (this resolves spec's open question on
    /// `dependencies == null, n_deps == 0`: the nil handle behaves exactly
    /// like "no dependency" rather than an error). Returns the number of
    /// dependencies still pending and whether any already-completed
    /// dependency had errored.
    pub(crate) fn build_dependency_graph(
        &mut self,
        dependencies: &[Handle],
        target: Handle,
    ) -> Option<(usize, bool)> {
        let mut num_waiting = 0;
        let mut initial_has_error = false;
        for (i, &dep) in dependencies.iter().enumerate() {
            if dep.is_nil() {
                continue;
            }
            if dep.as_u64() >= target.as_u64() {
                self.cleanup_dependency_graph(&dependencies[..i], target);
                return None;
            }
            match self.promises.get_mut(dep.as_u64()) {
                Some(promise) => match promise.status {
                    PromiseStatus::Pending => {
                        promise.add_continuation_promise(target);
                        promise.reference_count += 1;
                        num_waiting += 1;
                    }
                    PromiseStatus::Completed { has_error } => {
                        initial_has_error |= has_error;
                    }
                },
                // Already completed and removed from the table: treated as
                // already satisfied with no error, exactly as
                // `check_and_build_dependency_graph` silently skips a
                // missing handle (`res != 0 -> continue`).
                None => {}
            }
        }
        Some((num_waiting, initial_has_error))
    }

    pub(crate) fn cleanup_dependency_graph(&mut self, dependencies: &[Handle], target: Handle) {
        for &dep in dependencies {
            if dep.is_nil() {
                continue;
            }
            if let Some(promise) = self.promises.get_mut(dep.as_u64()) {
                if promise.remove_continuation_promise(target) > 0 {
                    promise.reference_count -= 1;
                }
            }
        }
    }

    pub(crate) fn insert(&mut self, handle: Handle, record: PromiseRecord) {
        self.promises
            .insert(handle.as_u64(), record)
            .unwrap_or_else(|_| panic!("duplicate promise handle {:?}", handle));
        self.pending_count += 1;
    }

    pub(crate) fn new_record(
        num_all_waiting: usize,
        pending_job: Option<Arc<dyn AnyJob>>,
        initial_has_error: bool,
    ) -> PromiseRecord {
        PromiseRecord::new(num_all_waiting, pending_job, initial_has_error)
    }

    /// Releases one party's interest in a completed promise, removing it
    /// from the table once nobody else is still waiting on it. A no-op
    /// (beyond the decrement) while the promise is still `Pending`: a
    /// pending promise is never removed, no matter how its interest count
    /// moves, since it still has to run and notify its dependents.
    pub(crate) fn release(&mut self, handle: Handle) {
        let should_remove = match self.promises.get_mut(handle.as_u64()) {
            Some(promise) => {
                promise.reference_count -= 1;
                matches!(promise.status, PromiseStatus::Completed { .. }) && promise.reference_count == 0
            }
            None => false,
        };
        if should_remove {
            self.promises.remove(handle.as_u64());
        }
    }

    /// Marks a promise detached. The caller's own interest in it is
    /// released right away if it has already completed; otherwise release
    /// is deferred to `mark_completed`, which checks `detached` once the
    /// outcome is known. Either way the interest is released exactly once.
    pub(crate) fn detach(&mut self, handle: Handle) -> Option<()> {
        let already_completed = {
            let promise = self.promises.get_mut(handle.as_u64())?;
            if promise.detached {
                return None;
            }
            promise.detached = true;
            matches!(promise.status, PromiseStatus::Completed { .. })
        };
        if already_completed {
            self.release(handle);
        }
        Some(())
    }

    /// Whether `handle` has been `detach`ed. A detached promise is no
    /// longer a valid target for `await_promise`, matching spec's "detach(h)
    /// followed by await(h) returns -1" contract; a handle absent from the
    /// table entirely (already released) reports `false` here too, since
    /// `status` already reports `None` for it regardless.
    pub(crate) fn is_detached(&self, handle: Handle) -> bool {
        self.promises
            .get(handle.as_u64())
            .map(|p| p.detached)
            .unwrap_or(false)
    }

    /// Called once a promise's status is known. Consumes the invoking
    /// caller's own interest here only if the promise was already detached
    /// (nobody else is ever going to call `release_after_await` for it);
    /// otherwise the caller's interest survives until that call.
    pub(crate) fn mark_completed(&mut self, handle: Handle, has_error: bool) {
        if let Some(promise) = self.promises.get_mut(handle.as_u64()) {
            promise.status = PromiseStatus::Completed { has_error };
            self.pending_count -= 1;
            if promise.detached {
                self.release(handle);
            }
        }
    }

    pub(crate) fn status(&self, handle: Handle) -> Option<PromiseStatus> {
        self.promises.get(handle.as_u64()).map(|p| p.status)
    }

    pub(crate) fn release_after_await(&mut self, handle: Handle) {
        self.release(handle);
    }

    pub(crate) fn exists(&self, handle: Handle) -> bool {
        self.promises.exists(handle.as_u64())
    }

    pub(crate) fn any_pending(&self) -> bool {
        self.pending_count > 0
    }

    pub(crate) fn queue_callback(&mut self, handle: Handle, cb: Box<dyn FnOnce(bool) + Send>) {
        if let Some(promise) = self.promises.get_mut(handle.as_u64()) {
            promise.callbacks.push(cb);
        }
    }

    pub(crate) fn take_callbacks(&mut self, handle: Handle) -> Vec<Box<dyn FnOnce(bool) + Send>> {
        self.promises
            .get_mut(handle.as_u64())
            .map(|p| std::mem::replace(&mut p.callbacks, Vec::new()))
            .unwrap_or_default()
    }

    pub(crate) fn continuation_promises_of(&self, handle: Handle) -> Vec<Handle> {
        self.promises
            .get(handle.as_u64())
            .map(|p| p.continuation_promises.clone())
            .unwrap_or_default()
    }

    /// Records that `dependent` has seen one more of its dependencies end;
    /// returns its pending job, along with whether any dependency it waited
    /// on ended in error, once every dependency has. Equivalent to the
    /// `++continuation_promise->num_ended_waiting_promises` step in
    /// `armd__context_complete_promise`.
    pub(crate) fn record_dependency_ended(
        &mut self,
        dependent: Handle,
        dependency_has_error: bool,
    ) -> Option<(Arc<dyn AnyJob>, bool)> {
        let promise = self.promises.get_mut(dependent.as_u64())?;
        promise.num_ended_waiting += 1;
        assert!(promise.num_ended_waiting <= promise.num_all_waiting);
        if dependency_has_error {
            promise.error_in_waiting = true;
        }
        if promise.num_ended_waiting >= promise.num_all_waiting {
            promise.pending_job.take().map(|job| (job, promise.error_in_waiting))
        } else {
            None
        }
    }
}
