use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use loomrt::{Context, ProcedureBuilder, StepResult};

/// Fibonacci via two continuations: the first forks two children computing
/// `F(n-1)` and `F(n-2)` into shared output slots, the second sums them into
/// its own. `F(0) = F(1) = 1`, matching the sequence spec.md's end-to-end
/// scenario calls out (`F(20) == 10946`).
struct FibArgs {
    n: u64,
    out: Arc<AtomicU64>,
}

#[derive(Default)]
struct FibFrame {
    left: Option<Arc<AtomicU64>>,
    right: Option<Arc<AtomicU64>>,
}

fn build_fib() -> Arc<loomrt::Procedure<FibArgs, FibFrame>> {
    let cell: Arc<Mutex<Option<Arc<loomrt::Procedure<FibArgs, FibFrame>>>>> = Arc::new(Mutex::new(None));

    let mut builder = ProcedureBuilder::<FibArgs, FibFrame>::new();

    let recurse = cell.clone();
    builder.then(move |ctx, args, frame, _scratch| {
        if args.n < 2 {
            args.out.store(1, Ordering::SeqCst);
            return StepResult::Ended;
        }

        let left = Arc::new(AtomicU64::new(0));
        let right = Arc::new(AtomicU64::new(0));
        frame.left = Some(left.clone());
        frame.right = Some(right.clone());

        let procedure = recurse.lock().unwrap().clone().expect("self-reference installed before invoke");
        ctx.fork(
            procedure.clone(),
            FibArgs {
                n: args.n - 1,
                out: left,
            },
        )
        .expect("fork left child");
        ctx.fork(
            procedure,
            FibArgs {
                n: args.n - 2,
                out: right,
            },
        )
        .expect("fork right child");

        StepResult::Ended
    });

    builder.then(|_ctx, args, frame, _scratch| {
        if let (Some(left), Some(right)) = (&frame.left, &frame.right) {
            let sum = left.load(Ordering::SeqCst) + right.load(Ordering::SeqCst);
            args.out.store(sum, Ordering::SeqCst);
        }
        StepResult::Ended
    });

    let procedure = builder.build();
    *cell.lock().unwrap() = Some(procedure.clone());
    procedure
}

#[test]
fn fibonacci_fork_join() {
    let ctx = Context::new(4).unwrap();
    let procedure = build_fib();
    let out = Arc::new(AtomicU64::new(0));

    let handle = ctx.invoke(
        procedure,
        FibArgs {
            n: 20,
            out: out.clone(),
        },
        &[],
    );
    assert!(!handle.is_nil());
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
    assert_eq!(out.load(Ordering::SeqCst), 10946);
}

#[test]
fn sequential_for_collects_in_order() {
    let ctx = Context::new(2).unwrap();
    let visited = Arc::new(Mutex::new(Vec::new()));

    let mut builder = ProcedureBuilder::<Arc<Mutex<Vec<usize>>>, ()>::new();
    builder.then_sequential_for(
        |_args, _frame| 10,
        |_ctx, args, _frame, index| args.lock().unwrap().push(index),
    );
    let procedure = builder.build();

    let handle = ctx.invoke(procedure, visited.clone(), &[]);
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
    assert_eq!(*visited.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn sequential_for_zero_count_runs_body_zero_times() {
    let ctx = Context::new(2).unwrap();
    let visits = Arc::new(AtomicUsize::new(0));
    let visits_in_body = visits.clone();

    let mut builder = ProcedureBuilder::<(), ()>::new();
    builder.then_sequential_for(
        |_args, _frame| 0,
        move |_ctx, _args, _frame, _index| {
            visits_in_body.fetch_add(1, Ordering::SeqCst);
        },
    );
    let procedure = builder.build();

    let handle = ctx.invoke(procedure, (), &[]);
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
    assert_eq!(visits.load(Ordering::SeqCst), 0);
}

#[test]
fn parallel_for_visits_every_index_once() {
    let ctx = Context::new(4).unwrap();
    let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..8).map(|_| AtomicUsize::new(0)).collect());

    let mut builder = ProcedureBuilder::<Arc<Vec<AtomicUsize>>, ()>::new();
    builder.then_parallel_for(
        |_args, _frame| 8,
        |args, _frame, index| {
            args[index].fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    let procedure = builder.build();

    let handle = ctx.invoke(procedure, seen.clone(), &[]);
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
    for counter in seen.iter() {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn parallel_for_zero_count_never_invokes_body() {
    let ctx = Context::new(4).unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_in_body = invocations.clone();

    let mut builder = ProcedureBuilder::<(), ()>::new();
    builder.then_parallel_for(
        |_args, _frame| 0,
        move |_args, _frame, _index| {
            invocations_in_body.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    let procedure = builder.build();

    let handle = ctx.invoke(procedure, (), &[]);
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_procedure_completes_with_no_continuations_run() {
    let ctx = Context::new(2).unwrap();
    let procedure = ProcedureBuilder::<(), ()>::new().build();
    let handle = ctx.invoke(procedure, (), &[]);
    assert!(!handle.is_nil());
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
}

#[test]
fn fork_with_id_out_of_range_fails_without_side_effects() {
    let ctx = Context::new(2).unwrap();

    let mut builder = ProcedureBuilder::<(), ()>::new();
    builder.then(|ctx, _args, _frame, _scratch| {
        let child = ProcedureBuilder::<(), ()>::new().build();
        let result = ctx.fork_with_id(99, child, ());
        assert!(result.is_err());
        StepResult::Ended
    });
    let procedure = builder.build();

    let handle = ctx.invoke(procedure, (), &[]);
    assert_eq!(ctx.await_promise(handle), loomrt::AwaitOutcome::Success);
}
