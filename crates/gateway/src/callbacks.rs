//! The scheduler-side implementation of the kernel callback contracts.
//!
//! Holds only the task id and handles to the shared services — the task
//! record itself is owned by the store, and kernels never mutate it
//! directly. Screenshot capture is spawned asynchronously so the kernel
//! loop stays at roughly one LLM round trip per step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use fg_devices::channel::DeviceChannel;
use fg_domain::TokenUsage;
use fg_kernel::{CancelToken, ExecutionCallback, StepCallback, StepStart};
use fg_screenshots::{ScreenshotStore, StepScreenshotMeta};

use crate::audit::AuditLog;
use crate::events::{Event, EventBus};
use crate::rendezvous::AnswerWaiters;
use crate::store::TaskStore;
use crate::tasks::{Step, StepKind, TaskStatus};

pub struct TaskCallback {
    task_id: Uuid,
    device_id: String,
    kernel_mode: String,
    model: Option<String>,
    store: Arc<TaskStore>,
    screenshots: Arc<ScreenshotStore>,
    channel: Arc<dyn DeviceChannel>,
    waiters: Arc<AnswerWaiters>,
    events: Arc<EventBus>,
    audit: Arc<AuditLog>,
    cancel: CancelToken,
    ask_user_timeout: Duration,
    /// Start info per in-flight step, for durations.
    in_flight: Mutex<HashMap<u32, Instant>>,
}

impl TaskCallback {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: Uuid,
        device_id: String,
        kernel_mode: String,
        model: Option<String>,
        store: Arc<TaskStore>,
        screenshots: Arc<ScreenshotStore>,
        channel: Arc<dyn DeviceChannel>,
        waiters: Arc<AnswerWaiters>,
        events: Arc<EventBus>,
        audit: Arc<AuditLog>,
        cancel: CancelToken,
        ask_user_timeout: Duration,
    ) -> Self {
        Self {
            task_id,
            device_id,
            kernel_mode,
            model,
            store,
            screenshots,
            channel,
            waiters,
            events,
            audit,
            cancel,
            ask_user_timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn persist_snapshot(&self) {
        if let Some(task) = self.store.get(&self.task_id) {
            if let Err(e) = self.store.persist(&task) {
                tracing::warn!(task_id = %self.task_id, error = %e, "persist failed");
            }
        }
    }

    /// Capture and store the step's screenshot off the kernel loop, then
    /// patch the paths into the step record if the task is still live.
    fn spawn_screenshot_capture(
        &self,
        step: u32,
        thinking: String,
        observation: String,
        success: bool,
        action: Value,
        tokens: Option<TokenUsage>,
    ) {
        let channel = self.channel.clone();
        let screenshots = self.screenshots.clone();
        let store = self.store.clone();
        let task_id = self.task_id;
        let device_id = self.device_id.clone();
        let kernel_mode = self.kernel_mode.clone();

        tokio::spawn(async move {
            let (png, _screen) = match channel.screenshot().await {
                Ok(capture) => capture,
                Err(e) => {
                    tracing::debug!(task_id = %task_id, step, error = %e, "step screenshot skipped");
                    return;
                }
            };
            let meta = StepScreenshotMeta {
                action,
                thinking,
                observation,
                success,
                kernel_mode,
                tokens,
            };
            match screenshots
                .save_step(&task_id.to_string(), &device_id, step, png, meta)
                .await
            {
                Ok(record) => {
                    store.with_running_mut(&task_id, |task| {
                        if let Some(entry) =
                            task.steps.iter_mut().find(|s| s.index == step)
                        {
                            entry.screenshot = Some(record.paths.clone());
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, step, error = %e, "screenshot store failed");
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl StepCallback for TaskCallback {
    async fn on_step_start(&self, step: u32, start: StepStart) {
        self.in_flight.lock().insert(step, Instant::now());

        self.store.with_running_mut(&self.task_id, |task| {
            task.steps.push(Step {
                index: step,
                kind: StepKind::Llm,
                timestamp: chrono::Utc::now(),
                thinking: start.thinking.clone(),
                action: start.action.clone(),
                observation: String::new(),
                success: false,
                screenshot: None,
                tokens: start.tokens,
                duration_ms: 0,
            });
            if let Some(tokens) = start.tokens {
                task.usage.add(tokens);
            }
        });

        if let Some(tokens) = start.tokens {
            self.store
                .record_model_call(&self.task_id, step, self.model.as_deref(), tokens);
        }

        self.audit.append(serde_json::json!({
            "event": "step_start",
            "step": step,
            "thinking": start.thinking,
            "action": start.action,
        }));
    }

    async fn on_step_complete(&self, step: u32, success: bool, thinking: &str, observation: &str) {
        let duration_ms = self
            .in_flight
            .lock()
            .remove(&step)
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let mut action = Value::Null;
        let mut tokens = None;
        self.store.with_running_mut(&self.task_id, |task| {
            if let Some(entry) = task.steps.iter_mut().find(|s| s.index == step) {
                entry.success = success;
                entry.observation = observation.to_owned();
                entry.duration_ms = duration_ms;
                action = entry.action.clone();
                tokens = entry.tokens;
            }
        });

        self.audit.append(serde_json::json!({
            "event": "step_complete",
            "step": step,
            "success": success,
            "observation": observation,
            "duration_ms": duration_ms,
        }));

        self.spawn_screenshot_capture(
            step,
            thinking.to_owned(),
            observation.to_owned(),
            success,
            action,
            tokens,
        );
    }
}

#[async_trait::async_trait]
impl ExecutionCallback for TaskCallback {
    async fn record_content(&self, content: &str, category: Option<&str>) {
        let note = match category {
            Some(category) => format!("[{category}] {content}"),
            None => content.to_owned(),
        };
        self.store.with_running_mut(&self.task_id, |task| {
            task.memory_notes.push(note.clone());
        });
        self.audit.append(serde_json::json!({
            "event": "record_content",
            "content": content,
            "category": category,
        }));
    }

    async fn update_todos(&self, todos: &str) {
        self.store.with_running_mut(&self.task_id, |task| {
            task.todos = Some(todos.to_owned());
        });
        self.audit.append(serde_json::json!({
            "event": "update_todos",
        }));
    }

    async fn ask_user(&self, question: &str, options: Option<&[String]>) -> Option<String> {
        let pending = serde_json::json!({
            "question": question,
            "options": options,
        });

        // 1. Suspend the task and tell the world.
        self.store.with_running_mut(&self.task_id, |task| {
            task.status = TaskStatus::WaitingForUser;
            task.pending_question = Some(pending.clone());
        });
        self.persist_snapshot();
        self.events.publish(Event::TaskStatusChange {
            task_id: self.task_id,
            status: TaskStatus::WaitingForUser.as_str().into(),
            pending_question: Some(pending),
        });
        tracing::info!(task_id = %self.task_id, question, "task waiting for user");

        // 2. Rendezvous.
        let answer = self.waiters.wait(self.task_id, self.ask_user_timeout).await;

        match answer {
            Some(answer) => {
                // 3. Resume.
                self.store.with_running_mut(&self.task_id, |task| {
                    task.pending_question = None;
                    task.status = TaskStatus::Running;
                });
                self.persist_snapshot();
                self.events.publish(Event::TaskStatusChange {
                    task_id: self.task_id,
                    status: TaskStatus::Running.as_str().into(),
                    pending_question: None,
                });
                Some(answer)
            }
            None if self.cancel.is_cancelled() => {
                tracing::info!(task_id = %self.task_id, "ask_user unblocked by cancellation");
                None
            }
            None => {
                // Timeout: the task fails here and now.
                tracing::warn!(task_id = %self.task_id, "ask_user timed out");
                self.store.with_running_mut(&self.task_id, |task| {
                    task.finish(
                        TaskStatus::Failed,
                        None,
                        Some("等待用户回答超时".into()),
                    );
                });
                self.persist_snapshot();
                self.events.publish(Event::TaskStatusChange {
                    task_id: self.task_id,
                    status: TaskStatus::Failed.as_str().into(),
                    pending_question: None,
                });
                None
            }
        }
    }
}
