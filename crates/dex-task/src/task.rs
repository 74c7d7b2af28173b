//! # Task Capability
//!
//! A task is one protocol step: it reads and mutates the pipeline's model and
//! either completes or fails. Steps that talk to a wallet or peer are small
//! structs holding their collaborators; pure checks are closures wrapped with
//! [`task_fn`].

use async_trait::async_trait;

/// One step of a pipeline over model `M`, failing with `E`.
#[async_trait]
pub trait Task<M: Send, E: Send>: Send + Sync {
    /// Stable name used in logs, run reports, and checkpoints.
    fn name(&self) -> &str;

    /// Execute the step. Returning `Err` stops the pipeline.
    async fn execute(&self, model: &mut M) -> Result<(), E>;
}

/// A synchronous closure adapted to [`Task`].
pub struct FnTask<F> {
    name: &'static str,
    f: F,
}

/// Wrap a closure as a named task.
pub fn task_fn<M, E, F>(name: &'static str, f: F) -> FnTask<F>
where
    F: Fn(&mut M) -> Result<(), E> + Send + Sync,
{
    FnTask { name, f }
}

#[async_trait]
impl<M, E, F> Task<M, E> for FnTask<F>
where
    M: Send,
    E: Send,
    F: Fn(&mut M) -> Result<(), E> + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, model: &mut M) -> Result<(), E> {
        (self.f)(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_task_mutates_model() {
        let task = task_fn("double", |n: &mut u32| -> Result<(), String> {
            *n *= 2;
            Ok(())
        });
        let mut n = 21;
        task.execute(&mut n).await.unwrap();
        assert_eq!(n, 42);
        assert_eq!(Task::<u32, String>::name(&task), "double");
    }

    #[tokio::test]
    async fn closure_task_reports_error() {
        let task = task_fn("reject", |_: &mut u32| Err::<(), _>("no".to_string()));
        let mut n = 0u32;
        assert_eq!(task.execute(&mut n).await, Err("no".to_string()));
    }
}
