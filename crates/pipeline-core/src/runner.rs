//! # Task Runner
//!
//! Runs [`Action`]s as background tasks, each inside its own unit of work.
//! Three wrappers decide what happens on failure:
//!
//! * [`Runner::run`] propagates the error.
//! * [`Runner::run_shielded`] lets the attempt finish even if the runner is
//!   cancelled, and turns a failure into a warning plus [`Error::Cancelled`].
//! * [`Runner::run_with_retry`] repeats failed attempts with exponential
//!   backoff until one succeeds or the runner is cancelled.
//!
//! A panic inside an action is caught and treated as a failure that retrying
//! can't fix.

use crate::backoff::Backoff;
use crate::domain::short_type_name;
use crate::error::{catch_panic, Error, Result};
use crate::uow::{Ctx, CtxFactory};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// A unit of application logic taking `A` and producing `R`.
#[async_trait]
pub trait Action<A, R>: Send + Sync + 'static {
    async fn call(&self, ctx: &Ctx, args: A) -> Result<R>;

    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Pause after the first failed attempt of a retried task.
    pub first_retry: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            first_retry: Duration::from_secs(30),
        }
    }
}

/// Result of a task started by a [`Runner`].
#[must_use = "a task handle does nothing unless joined"]
pub struct TaskHandle<R> {
    handle: JoinHandle<Result<R>>,
}

impl<R> TaskHandle<R> {
    /// Waits for the task. A panic inside the task is reported as an error.
    pub async fn join(self) -> Result<R> {
        self.handle.await?
    }
}

/// Spawns actions and owns their lifetime.
pub struct Runner {
    factory: CtxFactory,
    options: RunnerOptions,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(factory: CtxFactory, options: RunnerOptions) -> Self {
        Self {
            factory,
            options,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Runs the action once; cancellation of the runner aborts the attempt.
    pub fn run<A, R, F>(&self, action: F, args: A) -> TaskHandle<R>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: Action<A, R>,
    {
        let factory = self.factory.clone();
        let cancel = self.cancel.clone();

        self.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = attempt(&factory, &action, args) => result,
            }
        })
    }

    /// Runs the action once to completion regardless of cancellation.
    ///
    /// A failure is reported as a warning and surfaces as [`Error::Cancelled`].
    pub fn run_shielded<A, R, F>(&self, action: F, args: A) -> TaskHandle<R>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: Action<A, R>,
    {
        let factory = self.factory.clone();

        self.spawn(async move {
            attempt(&factory, &action, args).await.map_err(|err| {
                factory.warn(action.name(), format!("failed - {err}"));
                Error::Cancelled
            })
        })
    }

    /// Repeats the action with exponential backoff until it succeeds.
    ///
    /// Attempts in progress are never interrupted. When cancellation arrives
    /// during a pause, one final attempt is made; if it fails as well, the
    /// task ends with [`Error::Cancelled`]. Failures that can't be fixed by
    /// retrying end the task immediately.
    pub fn run_with_retry<A, R, F>(&self, action: F, args: A) -> TaskHandle<R>
    where
        A: Clone + Send + 'static,
        R: Send + 'static,
        F: Action<A, R>,
    {
        let factory = self.factory.clone();
        let cancel = self.cancel.clone();
        let mut backoff = Backoff::new(self.options.first_retry);

        self.spawn(async move {
            let mut last_call = false;

            loop {
                let err = match attempt(&factory, &action, args.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                factory.warn(action.name(), format!("failed - {err}"));

                if !err.is_recoverable() {
                    return Err(err);
                }
                if last_call || cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let delay = backoff.next_delay();
                factory.info(action.name(), format!("waiting {delay:?} before next attempt"));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => last_call = true,
                }
            }
        })
    }

    /// Signals cancellation to every task without waiting for them.
    ///
    /// Simple tasks are aborted, retried tasks make their final attempt and
    /// shielded tasks run on.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels running tasks and waits for all of them to end.
    pub async fn shutdown(&self) {
        info!(tasks = self.tracker.len(), "Stopping task runner");
        self.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn<R, F>(&self, task: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        TaskHandle {
            handle: self.tracker.spawn(task),
        }
    }
}

async fn attempt<A, R, F>(factory: &CtxFactory, action: &F, args: A) -> Result<R>
where
    F: Action<A, R>,
{
    let ctx = factory.create(action.name());
    let result = catch_panic(action.call(&ctx, args)).await;
    let result = ctx.finish(result).await;
    if result.is_ok() {
        factory.info(action.name(), "finished");
    }
    result
}
