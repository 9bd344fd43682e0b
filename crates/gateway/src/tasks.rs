//! Task records and the typed creation spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use fg_domain::config::mask_secret;
use fg_domain::TokenUsage;
use fg_kernel::KernelMode;
use fg_screenshots::StepPaths;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingForUser,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForUser => "waiting_for_user",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting_for_user" => Some(Self::WaitingForUser),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Rule-engine step recorded before the kernel starts (index 0).
    Preprocessing,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub kind: StepKind,
    pub timestamp: DateTime<Utc>,
    pub thinking: String,
    pub action: Value,
    pub observation: String,
    pub success: bool,
    /// Relative paths into the screenshot store. Preprocessing steps carry
    /// none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<StepPaths>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task spec (API boundary)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed task-creation request. Unknown fields are rejected at the API
/// boundary; the API key never lands in the task record.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub instruction: String,
    #[serde(default)]
    pub device_id: Option<String>,
    /// `structured` / `vision` / `auto` (default).
    #[serde(default)]
    pub kernel_mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Per-task override; falls back to the configured key. Masked in all
    /// output, never logged.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
}

impl TaskSpec {
    pub fn kernel_mode(&self) -> Option<KernelMode> {
        match &self.kernel_mode {
            Some(raw) => KernelMode::parse(raw),
            None => Some(KernelMode::Auto),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub instruction: String,
    pub device_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<Step>,
    pub usage: TokenUsage,
    pub kernel_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Masked per-task API key (`prefix8…suffix4`), display only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_masked: Option<String>,
    /// Long-term memory: free-form notes recorded by the kernel.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub memory_notes: Vec<String>,
    /// Markdown todo list maintained by the kernel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos: Option<String>,
    /// Present exactly while the task is `waiting_for_user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<Value>,
    /// Data payload of a terminal `done`/`answer`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
}

impl Task {
    pub fn new(spec: &TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            instruction: spec.instruction.clone(),
            device_id: spec.device_id.clone(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            steps: Vec::new(),
            usage: TokenUsage::default(),
            kernel_mode: spec
                .kernel_mode
                .clone()
                .unwrap_or_else(|| "auto".to_owned()),
            model: spec.model.clone(),
            api_key_masked: spec.api_key.as_deref().map(mask_secret),
            memory_notes: Vec::new(),
            todos: None,
            pending_question: None,
            result_data: None,
        }
    }

    /// Apply a terminal transition. No-op if the task is already terminal
    /// (terminal statuses are absorbing).
    pub fn finish(&mut self, status: TaskStatus, result: Option<String>, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.pending_question = None;
        if result.is_some() {
            self.result = result;
        }
        if error.is_some() {
            self.error = error;
        }
    }

    pub fn mark_running(&mut self) {
        if self.status == TaskStatus::Pending {
            self.started_at = Some(Utc::now());
        }
        self.status = TaskStatus::Running;
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(instruction: &str) -> TaskSpec {
        TaskSpec {
            instruction: instruction.into(),
            device_id: None,
            kernel_mode: None,
            model: None,
            api_key: None,
            max_steps: None,
        }
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        let mut task = Task::new(&spec("goal"));
        task.mark_running();
        task.finish(TaskStatus::Completed, Some("done".into()), None);
        let completed_at = task.completed_at;

        // A later transition must not stick.
        task.finish(TaskStatus::Failed, None, Some("late error".into()));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, completed_at);
        assert!(task.error.is_none());
    }

    #[test]
    fn timestamps_follow_the_state_machine() {
        let mut task = Task::new(&spec("goal"));
        assert!(task.started_at.is_none());
        task.mark_running();
        assert!(task.started_at.is_some());
        task.finish(TaskStatus::Failed, None, Some("boom".into()));
        assert!(task.completed_at.is_some());
        assert!(task.completed_at.unwrap() >= task.started_at.unwrap());
    }

    #[test]
    fn finish_clears_pending_question() {
        let mut task = Task::new(&spec("goal"));
        task.mark_running();
        task.status = TaskStatus::WaitingForUser;
        task.pending_question = Some(serde_json::json!({"question": "code?"}));
        task.finish(TaskStatus::Cancelled, None, Some("Task cancelled by user".into()));
        assert!(task.pending_question.is_none());
    }

    #[test]
    fn api_key_is_masked_on_the_record() {
        let mut s = spec("goal");
        s.api_key = Some("sk-abcdefghijklmnopqrstuvwx".into());
        let task = Task::new(&s);
        assert_eq!(task.api_key_masked.as_deref(), Some("sk-abcde…uvwx"));
        // The raw key never appears in the serialized task.
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("abcdefghijklmnop"));
    }

    #[test]
    fn spec_rejects_unknown_fields() {
        let raw = r#"{"instruction": "x", "surprise": true}"#;
        assert!(serde_json::from_str::<TaskSpec>(raw).is_err());
    }

    #[test]
    fn kernel_mode_defaults_to_auto() {
        assert_eq!(spec("x").kernel_mode(), Some(KernelMode::Auto));
        let mut s = spec("x");
        s.kernel_mode = Some("xml".into());
        assert_eq!(s.kernel_mode(), Some(KernelMode::Structured));
        s.kernel_mode = Some("bogus".into());
        assert_eq!(s.kernel_mode(), None);
    }
}
