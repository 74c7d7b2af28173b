//! # Task Runner
//!
//! Runs an ordered list of [`Task`]s over one mutable model.
//!
//! ## Contract
//!
//! - Tasks run strictly in sequence; task `k+1` starts only after task `k`
//!   completed.
//! - The first failure stops the run. Later tasks are never invoked, the
//!   failure handler is called exactly once with the error and the partially
//!   mutated model, and the failure is returned to the caller.
//! - Each task's `execute` is invoked at most once per run.
//! - The runner never retries. [`TaskRunner::run_from`] lets a caller resume
//!   at the failed task's index so completed tasks are not repeated.
//! - The runner holds no lock. Callers serialize runs over the same entity.

use thiserror::Error;

use crate::task::{task_fn, Task};

type FailureHandler<M, E> = Box<dyn Fn(&E, &mut M) + Send + Sync>;

/// A named, ordered pipeline of tasks.
pub struct TaskRunner<M: Send, E: Send> {
    name: String,
    tasks: Vec<Box<dyn Task<M, E>>>,
    on_failure: Option<FailureHandler<M, E>>,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Pipeline name.
    pub pipeline: String,
    /// Index the run started from.
    pub started_at: usize,
    /// Names of the tasks that completed during this run, in order.
    pub completed: Vec<String>,
}

/// The task that stopped a run, and why.
#[derive(Error, Debug)]
#[error("task '{task}' (step {index}) of pipeline '{pipeline}' failed: {error}")]
pub struct TaskFailure<E> {
    /// Pipeline name.
    pub pipeline: String,
    /// Name of the failing task.
    pub task: String,
    /// Index of the failing task. Resuming from here repeats only this task.
    pub index: usize,
    /// The task's error.
    pub error: E,
}

impl<E> TaskFailure<E> {
    pub fn into_error(self) -> E {
        self.error
    }
}

impl<M, E> TaskRunner<M, E>
where
    M: Send + 'static,
    E: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            on_failure: None,
        }
    }

    /// Append a task.
    pub fn with_task(mut self, task: impl Task<M, E> + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    /// Append a synchronous closure as a task.
    pub fn with_fn<F>(self, name: &'static str, f: F) -> Self
    where
        F: Fn(&mut M) -> Result<(), E> + Send + Sync + 'static,
    {
        self.with_task(task_fn(name, f))
    }

    /// Install the single failure handler.
    ///
    /// Replaces any handler installed earlier.
    pub fn on_failure(mut self, handler: impl Fn(&E, &mut M) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run every task from the first.
    pub async fn run(&self, model: &mut M) -> Result<RunReport, TaskFailure<E>> {
        self.run_from(model, 0).await
    }

    /// Run tasks starting at `start`.
    ///
    /// A `start` at or beyond the end completes immediately with an empty
    /// report.
    pub async fn run_from(
        &self,
        model: &mut M,
        start: usize,
    ) -> Result<RunReport, TaskFailure<E>> {
        let mut completed = Vec::with_capacity(self.tasks.len().saturating_sub(start));

        for (index, task) in self.tasks.iter().enumerate().skip(start) {
            tracing::debug!(pipeline = %self.name, task = task.name(), index, "running task");

            if let Err(error) = task.execute(model).await {
                tracing::warn!(
                    pipeline = %self.name,
                    task = task.name(),
                    index,
                    "task failed, stopping pipeline"
                );
                if let Some(handler) = &self.on_failure {
                    handler(&error, model);
                }
                return Err(TaskFailure {
                    pipeline: self.name.clone(),
                    task: task.name().to_string(),
                    index,
                    error,
                });
            }
            completed.push(task.name().to_string());
        }

        tracing::debug!(pipeline = %self.name, completed = completed.len(), "pipeline complete");
        Ok(RunReport {
            pipeline: self.name.clone(),
            started_at: start,
            completed,
        })
    }
}

impl<M: Send, E: Send> std::fmt::Debug for TaskRunner<M, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.name)
            .field("tasks", &self.tasks.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("has_failure_handler", &self.on_failure.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct Model {
        trace: Vec<&'static str>,
        failures_seen: Vec<String>,
    }

    struct Step {
        name: &'static str,
        fail: bool,
        calls: Arc<AtomicU32>,
    }

    impl Step {
        fn ok(name: &'static str) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    name,
                    fail: false,
                    calls: calls.clone(),
                },
                calls,
            )
        }

        fn failing(name: &'static str) -> (Self, Arc<AtomicU32>) {
            let (mut step, calls) = Self::ok(name);
            step.fail = true;
            (step, calls)
        }
    }

    #[async_trait]
    impl Task<Model, String> for Step {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, model: &mut Model) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            model.trace.push(self.name);
            if self.fail {
                Err(format!("{} failed", self.name))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn runs_tasks_in_order() {
        let runner = TaskRunner::<Model, String>::new("ordered")
            .with_fn("a", |m: &mut Model| {
                m.trace.push("a");
                Ok(())
            })
            .with_fn("b", |m: &mut Model| {
                m.trace.push("b");
                Ok(())
            })
            .with_fn("c", |m: &mut Model| {
                m.trace.push("c");
                Ok(())
            });

        let mut model = Model::default();
        let report = runner.run(&mut model).await.unwrap();
        assert_eq!(model.trace, vec!["a", "b", "c"]);
        assert_eq!(report.completed, vec!["a", "b", "c"]);
        assert_eq!(report.started_at, 0);
        assert_eq!(runner.task_names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failure_short_circuits_and_calls_handler_once() {
        let (first, first_calls) = Step::ok("first");
        let (second, second_calls) = Step::failing("second");
        let (third, third_calls) = Step::ok("third");
        let handler_calls = Arc::new(AtomicU32::new(0));
        let hc = handler_calls.clone();

        let runner = TaskRunner::<Model, String>::new("short-circuit")
            .with_task(first)
            .with_task(second)
            .with_task(third)
            .on_failure(move |err: &String, model: &mut Model| {
                hc.fetch_add(1, Ordering::SeqCst);
                model.failures_seen.push(err.clone());
            });

        let mut model = Model::default();
        let failure = runner.run(&mut model).await.unwrap_err();

        assert_eq!(failure.index, 1);
        assert_eq!(failure.task, "second");
        assert_eq!(failure.error, "second failed");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
        // The handler sees the model as the failing task left it.
        assert_eq!(model.trace, vec!["first", "second"]);
        assert_eq!(model.failures_seen, vec!["second failed".to_string()]);
    }

    #[tokio::test]
    async fn run_from_skips_completed_tasks() {
        let (first, first_calls) = Step::ok("first");
        let (second, second_calls) = Step::ok("second");
        let runner = TaskRunner::<Model, String>::new("resume").with_task(first).with_task(second);

        let mut model = Model::default();
        let report = runner.run_from(&mut model, 1).await.unwrap();
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.completed, vec!["second"]);

        let past_end = runner.run_from(&mut model, 9).await.unwrap();
        assert!(past_end.completed.is_empty());
    }

    #[tokio::test]
    async fn failure_without_handler_still_reports() {
        let (only, _) = Step::failing("only");
        let runner = TaskRunner::<Model, String>::new("bare").with_task(only);
        let failure = runner.run(&mut Model::default()).await.unwrap_err();
        assert_eq!(
            failure.to_string(),
            "task 'only' (step 0) of pipeline 'bare' failed: only failed"
        );
        assert_eq!(failure.into_error(), "only failed");
    }

    #[tokio::test]
    async fn empty_pipeline_completes() {
        let runner = TaskRunner::<Model, String>::new("empty");
        assert!(runner.is_empty());
        let report = runner.run(&mut Model::default()).await.unwrap();
        assert!(report.completed.is_empty());
    }
}
