use std::future::Future;
use std::pin::Pin;

use error_stack::{Context, Report, Result, ResultExt};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

type BoxedTask<T> =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = T> + Send>> + Send>;

/// A long-running piece of work that stops once its token is cancelled.
pub struct CancellableTask<T> {
    inner: BoxedTask<T>,
}

impl<T> CancellableTask<T> {
    pub fn create<Fut>(task: impl FnOnce(CancellationToken) -> Fut + Send + 'static) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            inner: Box::new(move |token| Box::pin(task(token))),
        }
    }

    pub async fn run(self, token: CancellationToken) -> T {
        (self.inner)(token).await
    }
}

#[derive(Error, Debug)]
#[error("task failed")]
pub struct TaskError;

/// Runs a set of named tasks as a unit: when one of them ends, for whatever reason, all the
/// others are cancelled. The errors of every task are collected into one report.
pub struct TaskGroup<E>
where
    E: From<TaskError> + Context,
{
    name: String,
    tasks: Vec<(String, CancellableTask<Result<(), E>>)>,
}

impl<E> TaskGroup<E>
where
    E: From<TaskError> + Context,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: vec![],
        }
    }

    /// Tasks don't start until [TaskGroup::run] is called.
    pub fn add_task(
        mut self,
        name: impl Into<String>,
        task: CancellableTask<Result<(), E>>,
    ) -> Self {
        self.tasks.push((name.into(), task));
        self
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), E> {
        let total = self.tasks.len();
        let mut running = JoinSet::new();

        for (name, task) in self.tasks {
            let child = token.child_token();
            running.spawn(async move { (name, task.run(child).await) });
        }

        let mut final_result: Result<(), E> = Ok(());
        while let Some(joined) = running.join_next().await {
            token.cancel();

            let result = match joined.change_context(E::from(TaskError)) {
                Ok((name, result)) => {
                    info!(
                        group = %self.name,
                        task = %name,
                        "task stopped, shutting down group ({}/{})",
                        total.saturating_sub(running.len()),
                        total
                    );
                    result.attach_printable_lazy(|| format!("task {name} failed"))
                }
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                final_result = Err(extend(final_result, err));
            }
        }

        final_result
    }
}

fn extend<E>(result: Result<(), E>, err: Report<E>) -> Report<E> {
    match result {
        Ok(()) => err,
        Err(mut report) => {
            report.extend_one(err);
            report
        }
    }
}
