//! # dex-task — Protocol Step Pipelines
//!
//! Every multi-step protocol action (offer co-signing, deposit publication,
//! payout, dispute resolution) runs as a [`TaskRunner`] over one mutable
//! model. The runner executes tasks in order, stops on the first failure,
//! and hands that failure to exactly one handler.
//!
//! Retrying is the caller's decision: [`RetryPolicy`] resumes a failed run
//! at the failing task when the caller classifies the error as transient.

pub mod retry;
pub mod runner;
pub mod task;

// Re-export primary types.
pub use retry::RetryPolicy;
pub use runner::{RunReport, TaskFailure, TaskRunner};
pub use task::{task_fn, FnTask, Task};
