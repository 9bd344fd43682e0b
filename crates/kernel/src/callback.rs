//! Kernel ↔ scheduler callback contracts.
//!
//! The kernels never touch task records directly: step progress flows out
//! through [`StepCallback`], non-device side effects (memory, todos, the
//! ask-user rendezvous) through [`ExecutionCallback`]. The scheduler
//! provides the implementations; kernels hold trait objects.

use serde_json::Value;

use fg_domain::TokenUsage;

/// Data announced at the start of a step, before the action executes.
#[derive(Debug, Clone)]
pub struct StepStart {
    pub thinking: String,
    /// The decided action, serialized for the audit trail.
    pub action: Value,
    pub tokens: Option<TokenUsage>,
}

/// Per-step progress sink. For each step the kernel calls, in order,
/// `on_step_start` then `on_step_complete`.
#[async_trait::async_trait]
pub trait StepCallback: Send + Sync {
    async fn on_step_start(&self, step: u32, start: StepStart);

    async fn on_step_complete(&self, step: u32, success: bool, thinking: &str, observation: &str);
}

/// Execution-side effects that need the scheduler.
#[async_trait::async_trait]
pub trait ExecutionCallback: Send + Sync {
    /// Append to the task's long-term memory notes.
    async fn record_content(&self, content: &str, category: Option<&str>);

    /// Replace the task's markdown todo list.
    async fn update_todos(&self, todos: &str);

    /// Suspend until the user answers (or the rendezvous times out /
    /// the task is cancelled, both yielding `None`).
    async fn ask_user(&self, question: &str, options: Option<&[String]>) -> Option<String>;
}

/// No-op implementation for tests and direct kernel runs.
pub struct NoopCallback;

#[async_trait::async_trait]
impl StepCallback for NoopCallback {
    async fn on_step_start(&self, _step: u32, _start: StepStart) {}
    async fn on_step_complete(
        &self,
        _step: u32,
        _success: bool,
        _thinking: &str,
        _observation: &str,
    ) {
    }
}

#[async_trait::async_trait]
impl ExecutionCallback for NoopCallback {
    async fn record_content(&self, _content: &str, _category: Option<&str>) {}
    async fn update_todos(&self, _todos: &str) {}
    async fn ask_user(&self, _question: &str, _options: Option<&[String]>) -> Option<String> {
        None
    }
}
