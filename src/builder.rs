use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::procedure::{Continuation, Procedure, StepCtx, StepResult};

/// Builds a [`Procedure`] one continuation at a time.
///
/// Grounded in `original_source/lib/src/procedure_builder.c`. The C version
/// grows its continuation buffer by doubling starting from a capacity of 8;
/// a plain `Vec` already gives the same amortized growth, so there is no
/// separate `expand_buffer`/`ensure_buffer_space` step to hand-roll here.
pub struct ProcedureBuilder<A, Fr> {
    continuations: Vec<Continuation<A, Fr>>,
    unwind: Option<Arc<dyn Fn(&A) + Send + Sync>>,
}

impl<A, Fr> ProcedureBuilder<A, Fr>
where
    A: Send + Sync + 'static,
    Fr: Default + Send + 'static,
{
    pub fn new() -> Self {
        ProcedureBuilder {
            continuations: Vec::with_capacity(8),
            unwind: None,
        }
    }

    /// Appends a raw continuation: a step function, an optional error trap,
    /// and a scratch-frame allocator. This is the general form that
    /// `then_single`/`then_sequential_for`/`then_parallel_for` are built on
    /// top of -- mirrors `armd_then`.
    pub fn then<S>(&mut self, step: S) -> &mut Self
    where
        S: Fn(&StepCtx<A, Fr>, &A, &mut Fr, &mut dyn Any) -> StepResult + Send + Sync + 'static,
    {
        self.continuations.push(Continuation {
            step: Arc::new(step),
            error_trap: None,
            scratch_alloc: Arc::new(|| Box::new(()) as Box<dyn Any + Send>),
        });
        self
    }

    /// Attaches an error trap to the continuation most recently added via
    /// `then`. The trap receives the same arguments as the step and may
    /// downgrade a pending error by returning `Ended` or `Repeat`, or
    /// propagate it by returning `Error` -- per spec, "the trap receives the
    /// same arguments and may downgrade the error".
    pub fn with_error_trap<T>(&mut self, trap: T) -> &mut Self
    where
        T: Fn(&StepCtx<A, Fr>, &A, &mut Fr, &mut dyn Any) -> StepResult + Send + Sync + 'static,
    {
        if let Some(last) = self.continuations.last_mut() {
            last.error_trap = Some(Arc::new(trap));
        }
        self
    }

    /// A single, non-repeating continuation: `Ok(())` ends it, `Err(())`
    /// faults it. Equivalent to `armd_then_single`.
    pub fn then_single<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&StepCtx<A, Fr>, &A, &mut Fr) -> Result<(), ()> + Send + Sync + 'static,
    {
        self.then(move |ctx, args, frame, _scratch| match f(ctx, args, frame) {
            Ok(()) => StepResult::Ended,
            Err(()) => StepResult::Error,
        })
    }

    /// A continuation that calls `body` once per index in `0..count_fn(args,
    /// frame)`, sequentially, on the owning job's own executor -- no forking.
    /// Equivalent to `armd_then_sequential_for`.
    pub fn then_sequential_for<C, F>(&mut self, count_fn: C, body: F) -> &mut Self
    where
        C: Fn(&A, &Fr) -> usize + Send + Sync + 'static,
        F: Fn(&StepCtx<A, Fr>, &A, &mut Fr, usize) + Send + Sync + 'static,
    {
        struct SequentialForFrame {
            is_first_time: bool,
            count: usize,
            index: usize,
        }

        self.continuations.push(Continuation {
            step: Arc::new(move |ctx, args, frame, scratch| {
                let state = scratch
                    .downcast_mut::<SequentialForFrame>()
                    .expect("sequential_for scratch frame type mismatch");

                if state.is_first_time {
                    state.count = count_fn(args, frame);
                    state.is_first_time = false;
                }

                let index = state.index;
                state.index += 1;
                if index >= state.count {
                    return StepResult::Ended;
                }

                body(ctx, args, frame, index);

                if index + 1 == state.count {
                    StepResult::Ended
                } else {
                    StepResult::Repeat
                }
            }),
            error_trap: None,
            scratch_alloc: Arc::new(|| {
                Box::new(SequentialForFrame {
                    is_first_time: true,
                    count: 0,
                    index: 0,
                }) as Box<dyn Any + Send>
            }),
        });
        self
    }

    /// A continuation that, on its first step, forks one child job per
    /// executor; each child races the others for the next index via a
    /// shared atomic counter and calls `body(args, frame, index)` until the
    /// range `0..count_fn(args, frame)` is exhausted. The parent
    /// continuation itself returns immediately after forking and only
    /// resumes (via the parent-join steal-resume path) once every child has
    /// finished. Equivalent to `armd_then_parallel_for`.
    ///
    /// `body` only ever sees `&Fr` (not `&mut Fr`), since children run
    /// concurrently across executors; `Fr: Sync` is required so that shared
    /// access is actually sound. A body that needs to record per-index
    /// output should do so through `Fr`'s own interior mutability (an
    /// atomic slot, a `Mutex`-guarded field, and so on).
    pub fn then_parallel_for<C, F>(&mut self, count_fn: C, body: F) -> &mut Self
    where
        C: Fn(&A, &Fr) -> usize + Send + Sync + 'static,
        F: Fn(&A, &Fr, usize) -> Result<(), ()> + Send + Sync + 'static,
        Fr: Sync,
    {
        struct ParallelForFrame {
            is_first_time: bool,
        }

        struct Shared<A, Fr> {
            index: AtomicUsize,
            count: usize,
            args: *const A,
            frame: *const Fr,
            body: Arc<dyn Fn(&A, &Fr, usize) -> Result<(), ()> + Send + Sync>,
        }
        unsafe impl<A, Fr> Send for Shared<A, Fr> {}
        unsafe impl<A, Fr> Sync for Shared<A, Fr> {}

        let body = Arc::new(body);
        let count_fn = Arc::new(count_fn);

        let child_procedure: Arc<Procedure<Arc<Shared<A, Fr>>, ()>> = {
            let mut child_builder = ProcedureBuilder::<Arc<Shared<A, Fr>>, ()>::new();
            child_builder.then(move |_ctx, shared, _frame, _scratch| {
                let index = shared.index.fetch_add(1, Ordering::Relaxed);
                if index >= shared.count {
                    return StepResult::Ended;
                }
                // SAFETY: `args`/`frame` outlive every forked child: the
                // parent job cannot resume (and so cannot drop its own
                // frame) until every child created from this `Shared` has
                // ended, by construction of the join counters below.
                let args = unsafe { &*shared.args };
                let frame = unsafe { &*shared.frame };
                match (shared.body)(args, frame, index) {
                    Ok(()) => StepResult::Repeat,
                    Err(()) => StepResult::Error,
                }
            });
            child_builder.build()
        };

        self.continuations.push(Continuation {
            step: Arc::new(move |ctx, args, frame, scratch| {
                let state = scratch
                    .downcast_mut::<ParallelForFrame>()
                    .expect("parallel_for scratch frame type mismatch");

                if state.is_first_time {
                    let count = count_fn(args, frame);
                    let shared = Arc::new(Shared {
                        index: AtomicUsize::new(0),
                        count,
                        args: args as *const A,
                        frame: frame as *const Fr,
                        body: body.clone(),
                    });

                    for executor_id in 0..ctx.num_executors() {
                        // Best-effort, matching `armd_fork_with_id`'s own
                        // call sites in parallel_for.c, which do not inspect
                        // the return code either.
                        let _ = ctx.fork_with_id(executor_id, child_procedure.clone(), shared.clone());
                    }

                    state.is_first_time = false;
                }

                StepResult::Ended
            }),
            error_trap: None,
            scratch_alloc: Arc::new(|| Box::new(ParallelForFrame { is_first_time: true }) as Box<dyn Any + Send>),
        });
        self
    }

    /// Registers an unwind hook, run once if the procedure's job is ever
    /// dropped before completion. Fails (returns `false`) if one is already
    /// set. Equivalent to `armd_unwind`.
    pub fn unwind<U>(&mut self, unwind_func: U) -> bool
    where
        U: Fn(&A) + Send + Sync + 'static,
    {
        if self.unwind.is_some() {
            return false;
        }
        self.unwind = Some(Arc::new(unwind_func));
        true
    }

    /// Freezes the builder into an immutable, shareable [`Procedure`].
    /// Equivalent to `armd_procedure_builder_build_and_destroy`.
    pub fn build(self) -> Arc<Procedure<A, Fr>> {
        Arc::new(Procedure {
            continuations: self.continuations,
            unwind: self.unwind,
        })
    }
}

impl<A, Fr> Default for ProcedureBuilder<A, Fr>
where
    A: Send + Sync + 'static,
    Fr: Default + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
