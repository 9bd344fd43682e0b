//! Task scheduler: lifecycle, asynchronous execution, cancellation, and the
//! ask-user rendezvous.
//!
//! State machine:
//!
//! ```text
//! pending ──execute()──► running ──(kernel ok)──────► completed
//!    │                     │  ├──(kernel failed)────► failed
//!    │                     │  ├──(cancel())─────────► cancelled
//!    │                     │  └──(ask_user)──► waiting_for_user ──(answer)──► running
//!    └──(cancel())───────► cancelled
//! ```
//!
//! Terminal transitions persist the record, release the device, evict the
//! task from the running set (a bounded snapshot cache keeps it readable),
//! and drop the run handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use fg_devices::adb::AdbChannel;
use fg_devices::channel::DeviceChannel;
use fg_devices::pc::PcChannel;
use fg_devices::registry::{Device, DeviceRegistry, DeviceUpdate};
use fg_domain::config::Config;
use fg_domain::{Error, Result};
use fg_kernel::{Bailout, CancelToken, HybridConfig, HybridKernel, KernelMode, KernelReport};
use fg_protocol::DeviceKind;
use fg_providers::{LlmProvider, OpenAiCompatProvider};
use fg_screenshots::{ScreenshotStore, TaskSummary};

use crate::audit::AuditLog;
use crate::callbacks::TaskCallback;
use crate::cancel::CancelMap;
use crate::events::{Event, EventBus};
use crate::preprocess;
use crate::rendezvous::AnswerWaiters;
use crate::store::TaskStore;
use crate::tasks::{Step, StepKind, Task, TaskSpec, TaskStatus};

/// Grace period before a cancelled run is hard-aborted. Lets the step in
/// flight finish and be recorded.
const CANCEL_ABORT_GRACE: Duration = Duration::from_secs(10);

/// How long a compound preprocessing launch gets to settle before the
/// kernel starts.
const PREPROCESS_SETTLE: Duration = Duration::from_secs(2);

type ChannelFactory = dyn Fn(DeviceKind, u16) -> Arc<dyn DeviceChannel> + Send + Sync;

pub struct Scheduler {
    config: Arc<Config>,
    store: Arc<TaskStore>,
    registry: Arc<DeviceRegistry>,
    screenshots: Arc<ScreenshotStore>,
    provider: Arc<dyn LlmProvider>,
    waiters: Arc<AnswerWaiters>,
    events: Arc<EventBus>,
    cancels: Arc<CancelMap>,
    channel_factory: Box<ChannelFactory>,
    /// Raw specs held until execution (per-task API key and overrides
    /// never land on the task record).
    pending_specs: Mutex<HashMap<Uuid, TaskSpec>>,
    handles: Mutex<HashMap<Uuid, AbortHandle>>,
}

fn default_channel_factory(kind: DeviceKind, frp_port: u16) -> Arc<dyn DeviceChannel> {
    match kind {
        DeviceKind::Phone => Arc::new(AdbChannel::new(frp_port)),
        DeviceKind::Pc => Arc::new(PcChannel::new(frp_port)),
    }
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        store: Arc<TaskStore>,
        registry: Arc<DeviceRegistry>,
        screenshots: Arc<ScreenshotStore>,
        provider: Arc<dyn LlmProvider>,
        waiters: Arc<AnswerWaiters>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Self::with_channel_factory(
            config,
            store,
            registry,
            screenshots,
            provider,
            waiters,
            events,
            Box::new(default_channel_factory),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_channel_factory(
        config: Arc<Config>,
        store: Arc<TaskStore>,
        registry: Arc<DeviceRegistry>,
        screenshots: Arc<ScreenshotStore>,
        provider: Arc<dyn LlmProvider>,
        waiters: Arc<AnswerWaiters>,
        events: Arc<EventBus>,
        channel_factory: Box<ChannelFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            registry,
            screenshots,
            provider,
            waiters,
            events,
            cancels: Arc::new(CancelMap::new()),
            channel_factory,
            pending_specs: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }

    // ── Creation ─────────────────────────────────────────────────────

    pub fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        if spec.instruction.trim().is_empty() {
            return Err(Error::Task("instruction must not be empty".into()));
        }
        if spec.kernel_mode().is_none() {
            return Err(Error::Task(format!(
                "unknown kernel mode: {}",
                spec.kernel_mode.as_deref().unwrap_or("")
            )));
        }

        let task = Task::new(&spec);
        if let Err(e) = self.screenshots.init_task(
            &task.id.to_string(),
            spec.device_id.as_deref().unwrap_or("auto"),
            &task.instruction,
            &task.kernel_mode,
        ) {
            tracing::warn!(task_id = %task.id, error = %e, "screenshot init failed");
        }
        self.store.insert_running(task.clone());
        self.store.persist(&task)?;
        self.pending_specs.lock().insert(task.id, spec);
        tracing::info!(task_id = %task.id, "task created");
        Ok(task)
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Validate, pick a device, and launch the run. Fails without touching
    /// the task when no device is available (the task stays pending).
    pub fn execute(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        let task = self
            .store
            .get(&task_id)
            .ok_or_else(|| Error::Task(format!("task {task_id} not found")))?;
        if task.status != TaskStatus::Pending {
            return Err(Error::Task(format!(
                "task {task_id} cannot be executed (status: {})",
                task.status.as_str()
            )));
        }

        // Device selection: explicit id, or best available by success rate.
        let device = match &task.device_id {
            Some(device_id) => {
                let device = self
                    .registry
                    .get(device_id)
                    .ok_or_else(|| Error::Device(format!("device {device_id} not found")))?;
                if !device.is_available() {
                    return Err(Error::Device(format!("device {device_id} is not available")));
                }
                device
            }
            None => self
                .registry
                .get_available()
                .ok_or_else(|| Error::Device("no available device".into()))?,
        };

        if !self.registry.assign_task(&device.id, &task_id.to_string()) {
            return Err(Error::Device(format!("device {} is not available", device.id)));
        }

        self.store.with_running_mut(&task_id, |task| {
            task.device_id = Some(device.id.clone());
            task.mark_running();
        });
        if let Some(task) = self.store.get(&task_id) {
            let _ = self.store.persist(&task);
        }
        if let Some(device) = self.registry.get(&device.id) {
            self.store.upsert_device(&device);
        }
        self.events.publish(Event::TaskStatusChange {
            task_id,
            status: TaskStatus::Running.as_str().into(),
            pending_question: None,
        });

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_task(task_id, device).await;
        });
        self.handles.lock().insert(task_id, handle.abort_handle());
        Ok(())
    }

    async fn run_task(self: Arc<Self>, task_id: Uuid, device: Device) {
        let spec = self.pending_specs.lock().remove(&task_id);
        let cancel = self.cancels.register(task_id);
        let channel = (self.channel_factory)(device.kind, device.frp_port);
        let audit = Arc::new(AuditLog::for_task(&self.config.storage.data_dir, &task_id));

        let Some(task) = self.store.get(&task_id) else {
            return;
        };
        let instruction = task.instruction.clone();

        // Phase 1: preprocessing fast path.
        let plan = preprocess::analyze(&instruction);
        if plan.is_direct() || plan.is_compound() {
            let (success, observation) = self
                .run_preprocessing(&task_id, &plan, channel.as_ref(), audit.as_ref())
                .await;
            if plan.is_direct() && success {
                let report = KernelReport {
                    success: true,
                    steps: 0,
                    message: observation,
                    usage: Default::default(),
                    mode: "rule_engine".into(),
                    bailout: None,
                    data: None,
                    cancelled: false,
                };
                self.finalize(task_id, &device.id, report).await;
                return;
            }
            if plan.is_compound() && success {
                tokio::time::sleep(PREPROCESS_SETTLE).await;
            }
        }

        if self.task_is_terminal(&task_id) {
            // Cancelled before the kernel started.
            self.finalize_cleanup(task_id, &device.id).await;
            return;
        }

        // Phase 2: the kernel.
        let provider = self.provider_for(spec.as_ref());
        let mode = spec
            .as_ref()
            .and_then(|s| s.kernel_mode())
            .unwrap_or(KernelMode::Auto);
        let callback = Arc::new(TaskCallback::new(
            task_id,
            device.id.clone(),
            task.kernel_mode.clone(),
            task.model.clone(),
            self.store.clone(),
            self.screenshots.clone(),
            channel.clone(),
            self.waiters.clone(),
            self.events.clone(),
            audit.clone(),
            cancel.clone(),
            Duration::from_secs(self.config.tasks.ask_user_timeout_secs),
        ));

        let kernel = HybridKernel::new(
            provider,
            channel,
            HybridConfig {
                mode,
                structured_model: task
                    .model
                    .clone()
                    .unwrap_or_else(|| self.config.llm.structured_model.clone()),
                vision_model: self.config.llm.vision_model.clone(),
                max_steps: spec
                    .as_ref()
                    .and_then(|s| s.max_steps)
                    .unwrap_or(self.config.tasks.max_steps),
                step_delay: Duration::from_millis(self.config.tasks.step_delay_ms),
                context_exchanges: 5,
                first_step: 1,
            },
            callback.clone(),
            callback,
            cancel,
        );

        let report = kernel.run(&instruction).await;
        self.finalize(task_id, &device.id, report).await;
    }

    /// Execute the rule-engine launch and record it as step 0 (kind
    /// `preprocessing`, no screenshot).
    async fn run_preprocessing(
        &self,
        task_id: &Uuid,
        plan: &preprocess::ExecutionPlan,
        channel: &dyn DeviceChannel,
        audit: &AuditLog,
    ) -> (bool, String) {
        let Some(fg_domain::action::Action::LaunchApp { app_name, .. }) = plan.action.clone()
        else {
            return (false, "no direct action".into());
        };

        let started = std::time::Instant::now();
        let result = channel.launch_app(&app_name).await;
        let (success, observation) = match result {
            Ok(()) => (true, format!("launched {app_name}")),
            Err(e) => (false, e.to_string()),
        };
        tracing::info!(task_id = %task_id, app = %app_name, success, "preprocessing launch");

        self.store.with_running_mut(task_id, |task| {
            task.steps.push(Step {
                index: 0,
                kind: StepKind::Preprocessing,
                timestamp: chrono::Utc::now(),
                thinking: "rule engine matched a launch command".into(),
                action: serde_json::json!({"action": "launch_app", "app_name": app_name}),
                observation: observation.clone(),
                success,
                screenshot: None,
                tokens: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        });
        audit.append(serde_json::json!({
            "event": "preprocessing",
            "app": app_name,
            "success": success,
        }));
        (success, observation)
    }

    fn provider_for(&self, spec: Option<&TaskSpec>) -> Arc<dyn LlmProvider> {
        if let Some(api_key) = spec.and_then(|s| s.api_key.clone()) {
            let mut llm = self.config.llm.clone();
            llm.api_key = api_key;
            match OpenAiCompatProvider::from_config(&llm) {
                Ok(provider) => return Arc::new(provider),
                Err(e) => {
                    tracing::warn!(error = %e, "per-task provider failed, using default");
                }
            }
        }
        self.provider.clone()
    }

    fn task_is_terminal(&self, task_id: &Uuid) -> bool {
        self.store
            .get(task_id)
            .map(|t| t.status.is_terminal())
            .unwrap_or(true)
    }

    // ── Terminal transitions ─────────────────────────────────────────

    async fn finalize(&self, task_id: Uuid, device_id: &str, report: KernelReport) {
        let already_terminal = self.task_is_terminal(&task_id);

        // A channel that stayed dead through the kernel's reconnect takes
        // the device out of rotation until a sweep or reconnect revives it.
        if report.bailout == Some(Bailout::DeviceUnavailable) {
            tracing::warn!(task_id = %task_id, device_id, "device unreachable, marking offline");
            self.registry.update(
                device_id,
                DeviceUpdate {
                    tunnel_up: Some(false),
                    ws_up: Some(false),
                    ..Default::default()
                },
            );
        }

        if !already_terminal {
            self.store.with_running_mut(&task_id, |task| {
                task.usage = report.usage;
                task.result_data = report.data.clone();
                if report.cancelled {
                    task.finish(
                        TaskStatus::Cancelled,
                        None,
                        Some("Task cancelled by user".into()),
                    );
                } else if report.success {
                    task.finish(TaskStatus::Completed, Some(report.message.clone()), None);
                } else {
                    task.finish(TaskStatus::Failed, None, Some(report.message.clone()));
                }
            });
        }

        if let Some(task) = self.store.get(&task_id) {
            tracing::info!(
                task_id = %task_id,
                status = task.status.as_str(),
                steps = task.steps.len(),
                tokens = task.usage.total_tokens,
                mode = %report.mode,
                "task finished"
            );
            let summary = TaskSummary {
                task_id: task_id.to_string(),
                device_id: device_id.to_owned(),
                instruction: task.instruction.clone(),
                status: task.status.as_str().to_owned(),
                total_steps: task.steps.len() as u32,
                tokens: task.usage,
                completed_at: task.completed_at.unwrap_or_else(chrono::Utc::now),
            };
            if let Err(e) = self.screenshots.write_summary(&summary) {
                tracing::debug!(task_id = %task_id, error = %e, "summary not written");
            }
            let _ = self.store.persist(&task);
            self.events.publish(Event::TaskStatusChange {
                task_id,
                status: task.status.as_str().into(),
                pending_question: None,
            });
        }

        self.finalize_cleanup(task_id, device_id).await;
    }

    /// Release the device, evict the task from memory, and drop the run
    /// bookkeeping. Safe to call more than once.
    async fn finalize_cleanup(&self, task_id: Uuid, device_id: &str) {
        let success = self
            .store
            .get(&task_id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false);

        // Only release if this task still owns the device (reconnects may
        // have cleared it already).
        if let Some(device) = self.registry.get(device_id) {
            if device.current_task.as_deref() == Some(&task_id.to_string()) {
                self.registry.complete_task(device_id, success);
            }
        }
        if let Some(device) = self.registry.get(device_id) {
            self.store.upsert_device(&device);
        }

        self.store.evict(&task_id);
        self.cancels.remove(&task_id);
        self.waiters.forget(&task_id);
        self.handles.lock().remove(&task_id);
        self.pending_specs.lock().remove(&task_id);
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Cooperative cancel. Idempotent; valid in pending, running and
    /// waiting_for_user. The kernel exits at the next step boundary; a
    /// delayed hard abort is the backstop for a wedged LLM call.
    pub fn cancel(self: &Arc<Self>, task_id: Uuid) -> Result<bool> {
        let task = self
            .store
            .get(&task_id)
            .ok_or_else(|| Error::Task(format!("task {task_id} not found")))?;
        if task.status.is_terminal() {
            return Ok(true);
        }

        self.store.with_running_mut(&task_id, |task| {
            task.finish(
                TaskStatus::Cancelled,
                None,
                Some("Task cancelled by user".into()),
            );
        });
        if let Some(task) = self.store.get(&task_id) {
            let _ = self.store.persist(&task);
        }
        self.cancels.cancel(&task_id);
        self.waiters.abort(&task_id);
        self.events.publish(Event::TaskStatusChange {
            task_id,
            status: TaskStatus::Cancelled.as_str().into(),
            pending_question: None,
        });
        tracing::info!(task_id = %task_id, "task cancelled");

        // Pending tasks have no run to wait for: clean up immediately.
        let device_id = task.device_id.clone();
        if task.status == TaskStatus::Pending {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler
                    .finalize_cleanup(task_id, device_id.as_deref().unwrap_or(""))
                    .await;
            });
            return Ok(true);
        }

        // Backstop: if the kernel does not come back within the grace
        // period (e.g. a wedged LLM call), abort the run and clean up.
        let abort = self.handles.lock().get(&task_id).cloned();
        if let Some(abort) = abort {
            let scheduler = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CANCEL_ABORT_GRACE).await;
                if scheduler.handles.lock().contains_key(&task_id) {
                    tracing::warn!(task_id = %task_id, "run did not exit after cancel, aborting");
                    abort.abort();
                    scheduler
                        .finalize_cleanup(task_id, device_id.as_deref().unwrap_or(""))
                        .await;
                }
            });
        }
        Ok(true)
    }

    // ── Ask-user answers ─────────────────────────────────────────────

    /// Deliver a user answer. Accepted while the task is alive; an answer
    /// landing just before the kernel starts waiting is cached.
    pub fn answer(&self, task_id: Uuid, answer: String) -> Result<()> {
        let task = self
            .store
            .get(&task_id)
            .ok_or_else(|| Error::Task(format!("task {task_id} not found")))?;
        if task.status.is_terminal() {
            return Err(Error::Task(format!(
                "task {task_id} is {} and cannot take an answer",
                task.status.as_str()
            )));
        }
        tracing::info!(task_id = %task_id, "user answer received");
        self.waiters.deliver(task_id, answer);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get(&self, task_id: &Uuid) -> Option<Task> {
        self.store.get(task_id)
    }

    pub fn list(
        &self,
        status: Option<TaskStatus>,
        device_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<Task> {
        self.store.list(status, device_id, limit, offset)
    }
}
