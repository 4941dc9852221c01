use failure::Fail;

pub type Result<T> = ::std::result::Result<T, ::failure::Error>;

/// Recoverable conditions a caller of [`Context`](crate::Context) can run
/// into. Programmer-error conditions (zero executors, a poisoned internal
/// lock) are not represented here; they panic the offending thread instead.
/// A continuation returning its error tag, or panicking, is not here either
/// -- like `DependencyError`, it never escapes as a public error; it is
/// folded into the job's own error-trap chain and, if uncaught, surfaces
/// only as `AwaitOutcome::Failed` from `await_promise`.
#[derive(Debug, Fail)]
pub enum RuntimeError {
    #[fail(display = "no promise is registered under handle {:?}", _0)]
    HandleNotFound(crate::handle::Handle),

    #[fail(display = "promise {:?} has already been detached", _0)]
    Detached(crate::handle::Handle),

    #[fail(display = "fork could not be enqueued: executor {} has no room", _0)]
    ForkFailed(usize),

    #[fail(display = "executor id {} is out of range (0..{})", requested, num_executors)]
    ExecutorOutOfRange { requested: usize, num_executors: usize },
}
