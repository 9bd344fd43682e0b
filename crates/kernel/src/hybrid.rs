//! Hybrid kernel: structured first, vision as the one-way fallback.
//!
//! In `auto` mode the structured kernel runs until it either finishes or
//! signals a fallback-eligible bailout. The vision kernel is then seeded
//! with a short summary of the structured attempt and continues from the
//! current screen, with step numbering picking up where structured left
//! off. Fallback happens at most once per task.

use std::sync::Arc;
use std::time::Duration;

use fg_devices::channel::DeviceChannel;
use fg_providers::LlmProvider;

use crate::callback::{ExecutionCallback, StepCallback};
use crate::cancel::CancelToken;
use crate::report::KernelReport;
use crate::structured::{StructuredConfig, StructuredKernel};
use crate::vision::{VisionConfig, VisionKernel};

/// Kernel selection for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelMode {
    Structured,
    Vision,
    #[default]
    Auto,
}

impl KernelMode {
    /// Accepts the wire spellings used by task specs.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "structured" | "xml" => Some(Self::Structured),
            "vision" => Some(Self::Vision),
            "auto" | "hybrid" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Vision => "vision",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub mode: KernelMode,
    pub structured_model: String,
    pub vision_model: String,
    pub max_steps: u32,
    pub step_delay: Duration,
    pub context_exchanges: usize,
    /// First step index (after any preprocessing step).
    pub first_step: u32,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            mode: KernelMode::Auto,
            structured_model: String::new(),
            vision_model: String::new(),
            max_steps: 50,
            step_delay: Duration::from_millis(400),
            context_exchanges: 5,
            first_step: 1,
        }
    }
}

pub struct HybridKernel {
    provider: Arc<dyn LlmProvider>,
    channel: Arc<dyn DeviceChannel>,
    config: HybridConfig,
    step_cb: Arc<dyn StepCallback>,
    exec_cb: Arc<dyn ExecutionCallback>,
    cancel: CancelToken,
}

impl HybridKernel {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        channel: Arc<dyn DeviceChannel>,
        config: HybridConfig,
        step_cb: Arc<dyn StepCallback>,
        exec_cb: Arc<dyn ExecutionCallback>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            channel,
            config,
            step_cb,
            exec_cb,
            cancel,
        }
    }

    pub async fn run(&self, instruction: &str) -> KernelReport {
        match self.config.mode {
            KernelMode::Structured => self.run_structured(instruction, self.config.first_step).await,
            KernelMode::Vision => self.run_vision(instruction, self.config.first_step, None).await,
            KernelMode::Auto => self.run_auto(instruction).await,
        }
    }

    async fn run_auto(&self, instruction: &str) -> KernelReport {
        let structured = self
            .run_structured(instruction, self.config.first_step)
            .await;
        if !structured.should_fallback() {
            let mut report = structured;
            report.mode = "hybrid:auto(structured)".into();
            return report;
        }

        tracing::info!(
            reason = structured.bailout.map(|b| b.as_str()).unwrap_or("unknown"),
            structured_steps = structured.steps,
            "structured kernel bailed out, falling back to vision"
        );

        let summary = format!(
            "A structured-UI attempt already ran {} step(s) on this device and stopped ({}). \
             Continue the task from the screen as it is now.",
            structured.steps, structured.message
        );
        let vision_first_step = self.config.first_step + structured.steps;
        let mut report = self
            .run_vision(instruction, vision_first_step, Some(summary))
            .await;

        report.steps += structured.steps;
        report.usage.add(structured.usage);
        report.mode = "hybrid:auto(structured→vision)".into();
        report
    }

    async fn run_structured(&self, instruction: &str, first_step: u32) -> KernelReport {
        let mut kernel = StructuredKernel::new(
            self.provider.clone(),
            self.channel.clone(),
            StructuredConfig {
                model: self.config.structured_model.clone(),
                max_steps: self.config.max_steps,
                step_delay: self.config.step_delay,
                context_exchanges: self.config.context_exchanges,
                first_step,
            },
            self.step_cb.clone(),
            self.exec_cb.clone(),
            self.cancel.clone(),
        );
        kernel.run(instruction).await
    }

    async fn run_vision(
        &self,
        instruction: &str,
        first_step: u32,
        seed: Option<String>,
    ) -> KernelReport {
        let mut kernel = VisionKernel::new(
            self.provider.clone(),
            self.channel.clone(),
            VisionConfig {
                model: self.config.vision_model.clone(),
                max_steps: self.config.max_steps,
                step_delay: self.config.step_delay,
                first_step,
            },
            self.step_cb.clone(),
            self.exec_cb.clone(),
            self.cancel.clone(),
        );
        if let Some(seed) = seed {
            kernel.seed_summary(seed);
        }
        kernel.run(instruction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Bailout;
    use crate::testutil::{MockChannel, RecordingCallback, ScriptedProvider};
    use fg_devices::channel::UiDump;

    fn config(mode: KernelMode) -> HybridConfig {
        HybridConfig {
            mode,
            structured_model: "glm-4-flash".into(),
            vision_model: "glm-4v".into(),
            max_steps: 10,
            step_delay: Duration::from_millis(1),
            context_exchanges: 5,
            first_step: 1,
        }
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(KernelMode::parse("xml"), Some(KernelMode::Structured));
        assert_eq!(KernelMode::parse("structured"), Some(KernelMode::Structured));
        assert_eq!(KernelMode::parse("VISION"), Some(KernelMode::Vision));
        assert_eq!(KernelMode::parse("auto"), Some(KernelMode::Auto));
        assert_eq!(KernelMode::parse("quantum"), None);
    }

    #[tokio::test]
    async fn auto_without_bailout_stays_structured() {
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "done", "success": true, "message": "ok"}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let kernel = HybridKernel::new(
            provider,
            channel,
            config(KernelMode::Auto),
            cb.clone(),
            cb,
            CancelToken::new(),
        );

        let report = kernel.run("goal").await;
        assert!(report.success);
        assert_eq!(report.mode, "hybrid:auto(structured)");
    }

    #[tokio::test]
    async fn auto_falls_back_to_vision_on_empty_ui() {
        // Structured sees two empty dumps and bails; vision then finishes.
        let provider = ScriptedProvider::new(vec![
            "<thinking>screen shows search box</thinking><tool_call>{\"action\":\"tap\",\"coordinates\":[500,100]}</tool_call>",
            "<thinking>done</thinking><tool_call>{\"action\":\"done\",\"message\":\"searched\"}</tool_call>",
        ]);
        let channel = Arc::new(MockChannel::new());
        channel.push_ui_dump(UiDump::Empty);
        channel.push_ui_dump(UiDump::Empty);
        let cb = RecordingCallback::new();
        let kernel = HybridKernel::new(
            provider.clone(),
            channel.clone(),
            config(KernelMode::Auto),
            cb.clone(),
            cb.clone(),
            CancelToken::new(),
        );

        let report = kernel.run("在应用里搜索X").await;
        assert!(report.success);
        assert_eq!(report.mode, "hybrid:auto(structured→vision)");
        assert_eq!(report.steps, 2); // 0 structured + 2 vision
        assert!(report.bailout.is_none());

        // Vision was seeded with the structured summary.
        let requests = provider.requests.lock();
        let seeded = requests[0]
            .messages
            .iter()
            .any(|m| m.text_content().contains("structured-UI attempt"));
        assert!(seeded);

        // Step numbering continued from the structured attempt (0 steps).
        assert_eq!(cb.starts.lock()[0].0, 1);
    }

    #[tokio::test]
    async fn fallback_merges_usage_and_offsets_steps() {
        // Structured executes 3 failing actions (bailout), vision finishes
        // in one step.
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "key_event", "key": "enter"}"#,
            r#"{"action": "key_event", "key": "enter"}"#,
            r#"{"action": "key_event", "key": "enter"}"#,
            "<thinking>v</thinking><tool_call>{\"action\":\"done\",\"message\":\"ok\"}</tool_call>",
        ]);
        let channel = Arc::new(MockChannel::new());
        for _ in 0..3 {
            channel.fail_next(fg_domain::ChannelErrorKind::CommandFailed);
        }
        let cb = RecordingCallback::new();
        let kernel = HybridKernel::new(
            provider,
            channel,
            config(KernelMode::Auto),
            cb.clone(),
            cb.clone(),
            CancelToken::new(),
        );

        let report = kernel.run("goal").await;
        assert!(report.success);
        assert_eq!(report.steps, 4);
        // 4 LLM calls × 120 tokens.
        assert_eq!(report.usage.total_tokens, 480);
        // Vision's step picked up after structured's three.
        let starts = cb.starts.lock();
        assert_eq!(starts.last().unwrap().0, 4);
    }

    #[tokio::test]
    async fn vision_mode_runs_vision_directly() {
        let provider = ScriptedProvider::new(vec![
            "<thinking>ok</thinking><tool_call>{\"action\":\"done\",\"message\":\"ok\"}</tool_call>",
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let kernel = HybridKernel::new(
            provider,
            channel,
            config(KernelMode::Vision),
            cb.clone(),
            cb,
            CancelToken::new(),
        );
        let report = kernel.run("goal").await;
        assert_eq!(report.mode, "vision");
    }

    #[tokio::test]
    async fn cancelled_structured_run_does_not_fall_back() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let provider = ScriptedProvider::new(vec![]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let kernel = HybridKernel::new(
            provider,
            channel,
            config(KernelMode::Auto),
            cb.clone(),
            cb,
            cancel,
        );
        let report = kernel.run("goal").await;
        assert!(report.cancelled);
        assert_eq!(report.mode, "hybrid:auto(structured)");
    }

    #[tokio::test]
    async fn fallback_happens_at_most_once() {
        // Vision also fails (script exhausted → repeated LLM errors), but
        // the hybrid kernel returns rather than cascading again.
        let provider = ScriptedProvider::new(vec![]);
        let channel = Arc::new(MockChannel::new());
        channel.push_ui_dump(UiDump::Empty);
        channel.push_ui_dump(UiDump::Empty);
        let cb = RecordingCallback::new();
        let kernel = HybridKernel::new(
            provider,
            channel,
            config(KernelMode::Auto),
            cb.clone(),
            cb,
            CancelToken::new(),
        );
        let report = kernel.run("goal").await;
        assert!(!report.success);
        assert_eq!(report.mode, "hybrid:auto(structured→vision)");
        assert_eq!(report.bailout, Some(Bailout::TooManyExceptions));
    }
}
