//! Structured kernel — the cheap path.
//!
//! Perceives through the UI hierarchy, decides with a text model forced
//! into JSON mode, and executes through the shared executor. Gives up
//! early (`should_fallback`) when the UI stays empty twice in a row, when
//! three consecutive actions fail, or on repeated parse failures, so the
//! hybrid kernel can hand the task to the vision path.

use std::sync::Arc;
use std::time::Duration;

use fg_domain::action::Action;
use fg_domain::TokenUsage;
use fg_devices::channel::{DeviceChannel, DumpStrategy, Screen, UiDump};
use fg_providers::{ChatMessage, ChatRequest, LlmProvider, Role};

use crate::callback::{ExecutionCallback, StepCallback, StepStart};
use crate::cancel::CancelToken;
use crate::exec::Executor;
use crate::flow::{apply_effect, channel_lost, EffectFlow};
use crate::parser::ResponseParser;
use crate::perception::{self, UiElement};
use crate::prompts::STRUCTURED_SYSTEM_PROMPT;
use crate::report::{Bailout, KernelReport};

const EMPTY_UI_LIMIT: u32 = 2;
const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;
const PARSE_FAILURE_LIMIT: u32 = 2;
const EXCEPTION_LIMIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct StructuredConfig {
    pub model: String,
    pub max_steps: u32,
    pub step_delay: Duration,
    /// Context window: system + first exchange + last N−1 exchanges.
    pub context_exchanges: usize,
    /// Step index of the first step this kernel records (1 unless a
    /// preprocessing step or a prior kernel came before).
    pub first_step: u32,
}

impl Default for StructuredConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_steps: 50,
            step_delay: Duration::from_millis(400),
            context_exchanges: 5,
            first_step: 1,
        }
    }
}

pub struct StructuredKernel {
    provider: Arc<dyn LlmProvider>,
    channel: Arc<dyn DeviceChannel>,
    config: StructuredConfig,
    step_cb: Arc<dyn StepCallback>,
    exec_cb: Arc<dyn ExecutionCallback>,
    cancel: CancelToken,

    context: Vec<ChatMessage>,
    strategy: DumpStrategy,
    usage: TokenUsage,
}

impl StructuredKernel {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        channel: Arc<dyn DeviceChannel>,
        config: StructuredConfig,
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
            context: Vec::new(),
            strategy: DumpStrategy::default(),
            usage: TokenUsage::default(),
        }
    }

    pub fn reset(&mut self) {
        self.context.clear();
        self.usage = TokenUsage::default();
        self.strategy = DumpStrategy::default();
    }

    pub async fn run(&mut self, instruction: &str) -> KernelReport {
        self.reset();
        self.context
            .push(ChatMessage::text(Role::System, STRUCTURED_SYSTEM_PROMPT));

        let mut empty_ui = 0u32;
        let mut consecutive_failures = 0u32;
        let mut parse_failures = 0u32;
        let mut exceptions = 0u32;
        let mut steps_done = 0u32;
        let mut feedback: Option<String> = None;

        for _ in 0..self.config.max_steps {
            if self.cancel.is_cancelled() {
                return KernelReport::cancelled(steps_done, self.usage, "structured");
            }
            let step = self.config.first_step + steps_done;

            // 1. Perceive.
            let screen = match self.channel.screen_size().await {
                Ok(screen) => screen,
                Err(e) => {
                    tracing::warn!(error = %e, "screen size unavailable");
                    exceptions += 1;
                    if exceptions >= EXCEPTION_LIMIT {
                        return self.bailout_report(
                            steps_done,
                            Bailout::TooManyExceptions,
                            "repeated device exceptions",
                        );
                    }
                    tokio::time::sleep(self.config.step_delay).await;
                    continue;
                }
            };
            let elements = self.acquire_elements(screen).await;
            if elements.is_empty() {
                empty_ui += 1;
                tracing::warn!(step, empty_ui, "no UI elements");
                if empty_ui >= EMPTY_UI_LIMIT {
                    return self.bailout_report(
                        steps_done,
                        Bailout::UiConsistentlyEmpty,
                        "no UI elements available",
                    );
                }
                tokio::time::sleep(self.config.step_delay.max(Duration::from_millis(100)) * 2)
                    .await;
                continue;
            }
            empty_ui = 0;

            // 2. Decide.
            let user_text = build_user_message(instruction, &elements, feedback.take());
            self.context.push(ChatMessage::text(Role::User, user_text));
            let request = ChatRequest {
                messages: self.windowed_context(),
                model: self.config.model.clone(),
                json_mode: true,
                ..Default::default()
            };
            let response = match self.provider.chat(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "LLM call failed");
                    exceptions += 1;
                    if exceptions >= EXCEPTION_LIMIT {
                        return self.bailout_report(
                            steps_done,
                            Bailout::TooManyExceptions,
                            "repeated LLM errors",
                        );
                    }
                    continue;
                }
            };
            if let Some(usage) = response.usage {
                self.usage.add(usage);
            }
            let step_tokens = response.usage;
            self.context
                .push(ChatMessage::text(Role::Assistant, &response.content));

            let parsed = ResponseParser::parse(&response.content);
            let action = parsed
                .is_executable()
                .then(|| match &parsed.action {
                    crate::parser::ParsedAction::Json(value) => Action::from_value(value).ok(),
                    _ => None,
                })
                .flatten();
            let Some(action) = action else {
                parse_failures += 1;
                tracing::warn!(step, parse_failures, "unusable model action");
                if parse_failures >= PARSE_FAILURE_LIMIT {
                    return self.bailout_report(
                        steps_done,
                        Bailout::TooManyExceptions,
                        "repeated parse failures",
                    );
                }
                // Parse-error policy: record one failed wait step, move on.
                self.emit_wait_step(step, &parsed.thinking).await;
                steps_done += 1;
                continue;
            };
            parse_failures = 0;

            // 3. Execute.
            self.step_cb
                .on_step_start(
                    step,
                    StepStart {
                        thinking: parsed.thinking.clone(),
                        action: serde_json::to_value(&action).unwrap_or_default(),
                        tokens: step_tokens,
                    },
                )
                .await;

            let outcome = Executor::execute(&action, self.channel.as_ref(), screen, &elements).await;
            let flow = apply_effect(&outcome, self.exec_cb.as_ref()).await;

            match flow {
                EffectFlow::Terminal {
                    success,
                    message,
                    data,
                } => {
                    self.step_cb
                        .on_step_complete(step, success, &parsed.thinking, &message)
                        .await;
                    steps_done += 1;
                    return KernelReport {
                        success,
                        steps: steps_done,
                        message,
                        usage: self.usage,
                        mode: "structured".into(),
                        bailout: None,
                        data,
                        cancelled: false,
                    };
                }
                EffectFlow::Unanswered => {
                    self.step_cb
                        .on_step_complete(step, false, &parsed.thinking, "no user answer")
                        .await;
                    steps_done += 1;
                    if self.cancel.is_cancelled() {
                        return KernelReport::cancelled(steps_done, self.usage, "structured");
                    }
                    return KernelReport {
                        success: false,
                        steps: steps_done,
                        message: "等待用户回答超时".into(),
                        usage: self.usage,
                        mode: "structured".into(),
                        bailout: None,
                        data: None,
                        cancelled: false,
                    };
                }
                EffectFlow::Feedback {
                    observation,
                    message,
                } => {
                    self.step_cb
                        .on_step_complete(step, outcome.success, &parsed.thinking, &observation)
                        .await;
                    feedback = Some(message);
                }
                EffectFlow::Continue { observation } => {
                    self.step_cb
                        .on_step_complete(step, outcome.success, &parsed.thinking, &observation)
                        .await;
                }
            }
            steps_done += 1;

            if outcome.success {
                consecutive_failures = 0;
            } else {
                if channel_lost(outcome.error_kind, self.channel.as_ref()).await {
                    return self.bailout_report(
                        steps_done,
                        Bailout::DeviceUnavailable,
                        "device_unavailable",
                    );
                }
                consecutive_failures += 1;
                if consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                    return self.bailout_report(
                        steps_done,
                        Bailout::ActionConsistentlyFailing,
                        "consecutive action failures",
                    );
                }
            }

            tokio::time::sleep(self.config.step_delay).await;
        }

        self.bailout_report(
            self.config.max_steps,
            Bailout::MaxStepsReached,
            "max_steps_reached",
        )
    }

    /// Acquire UI elements with the cached dump strategy, flipping to the
    /// alternate strategy once on failure and remembering the winner.
    async fn acquire_elements(&mut self, screen: Screen) -> Vec<UiElement> {
        let dump = match self.channel.ui_snapshot(self.strategy).await {
            Ok(dump) => dump,
            Err(e) => {
                tracing::debug!(error = %e, strategy = ?self.strategy, "ui snapshot failed, flipping strategy");
                let alternate = match self.strategy {
                    DumpStrategy::Standard => DumpStrategy::Nohup,
                    DumpStrategy::Nohup => DumpStrategy::Standard,
                };
                match self.channel.ui_snapshot(alternate).await {
                    Ok(dump) => {
                        self.strategy = alternate;
                        dump
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "both dump strategies failed");
                        return Vec::new();
                    }
                }
            }
        };
        match dump {
            UiDump::Xml(xml) => perception::parse_hierarchy(&xml, screen),
            UiDump::Elements(elements) => perception::from_remote_elements(&elements, screen),
            UiDump::Empty => Vec::new(),
        }
    }

    /// Record the failed `wait` step emitted on a parse error.
    async fn emit_wait_step(&self, step: u32, thinking: &str) {
        self.step_cb
            .on_step_start(
                step,
                StepStart {
                    thinking: thinking.to_owned(),
                    action: serde_json::json!({"action": "wait", "seconds": 1.0}),
                    tokens: None,
                },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.step_cb
            .on_step_complete(step, false, thinking, "unparseable model response")
            .await;
    }

    fn bailout_report(&self, steps: u32, bailout: Bailout, message: &str) -> KernelReport {
        KernelReport {
            success: false,
            steps,
            message: message.to_owned(),
            usage: self.usage,
            mode: "structured".into(),
            bailout: Some(bailout),
            data: None,
            cancelled: false,
        }
    }

    /// System prompt + the first exchange + the trailing window.
    fn windowed_context(&self) -> Vec<ChatMessage> {
        let system = self.context.first().cloned();
        let rest = &self.context[1..];
        let keep_tail = (self.config.context_exchanges.saturating_sub(1)) * 2 + 1;

        let mut messages: Vec<ChatMessage> = Vec::new();
        messages.extend(system);
        if rest.len() <= 2 + keep_tail {
            messages.extend(rest.iter().cloned());
            return messages;
        }
        messages.extend(rest.iter().take(2).cloned());
        messages.extend(rest.iter().skip(rest.len() - keep_tail).cloned());
        messages
    }
}

fn build_user_message(
    instruction: &str,
    elements: &[UiElement],
    feedback: Option<String>,
) -> String {
    let mut text = format!("Goal: {instruction}\n");
    if let Some(feedback) = feedback {
        text.push_str(&format!("\n{feedback}\n"));
    }
    text.push_str("\nScreen elements:\n");
    text.push_str(&perception::format_elements_for_llm(elements));
    text.push_str("\n\nReply with one JSON action.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockChannel, RecordingCallback, ScriptedProvider};

    fn config() -> StructuredConfig {
        StructuredConfig {
            model: "glm-4-flash".into(),
            max_steps: 10,
            step_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn kernel(
        provider: Arc<ScriptedProvider>,
        channel: Arc<MockChannel>,
        cb: Arc<RecordingCallback>,
        cancel: CancelToken,
    ) -> StructuredKernel {
        StructuredKernel::new(provider, channel, config(), cb.clone(), cb, cancel)
    }

    #[tokio::test]
    async fn happy_path_tap_then_done() {
        let provider = ScriptedProvider::new(vec![
            r#"{"reason": "tap the button", "action": "tap", "index": 1}"#,
            r#"{"reason": "all done", "action": "done", "success": true, "message": "Settings opened"}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut kernel = kernel(provider.clone(), channel.clone(), cb.clone(), CancelToken::new());

        let report = kernel.run("Open Settings").await;
        assert!(report.success);
        assert_eq!(report.steps, 2);
        assert_eq!(report.message, "Settings opened");
        assert_eq!(report.mode, "structured");
        assert_eq!(report.usage.total_tokens, 240); // two scripted calls

        // The tap went to the default element's pixel center.
        assert_eq!(channel.calls(), vec!["tap(540,1200)"]);

        // Callback ordering: start/complete per step, indices contiguous.
        let starts = cb.starts.lock();
        let completes = cb.completes.lock();
        assert_eq!(starts.len(), 2);
        assert_eq!(completes.len(), 2);
        assert_eq!(starts[0].0, 1);
        assert_eq!(starts[1].0, 2);
        assert!(completes.iter().all(|(_, success, _)| *success));

        // JSON mode was requested from the model.
        assert!(provider.requests.lock().iter().all(|r| r.json_mode));
    }

    #[tokio::test]
    async fn empty_ui_twice_requests_fallback() {
        let provider = ScriptedProvider::new(vec![]);
        let channel = Arc::new(MockChannel::new());
        channel.push_ui_dump(fg_devices::channel::UiDump::Empty);
        channel.push_ui_dump(fg_devices::channel::UiDump::Empty);
        let cb = RecordingCallback::new();
        let mut kernel = kernel(provider, channel, cb, CancelToken::new());

        let report = kernel.run("在应用里搜索X").await;
        assert!(!report.success);
        assert_eq!(report.bailout, Some(Bailout::UiConsistentlyEmpty));
        assert!(report.should_fallback());
        assert_eq!(report.steps, 0);
    }

    #[tokio::test]
    async fn three_consecutive_action_failures_bail_out() {
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "key_event", "key": "enter"}"#,
            r#"{"action": "key_event", "key": "enter"}"#,
            r#"{"action": "key_event", "key": "enter"}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel.clone(), cb, CancelToken::new());

        // Each device call fails.
        for _ in 0..3 {
            channel.fail_next(fg_domain::ChannelErrorKind::CommandFailed);
        }
        let report = k.run("goal").await;
        assert_eq!(report.bailout, Some(Bailout::ActionConsistentlyFailing));
        assert!(report.should_fallback());
        assert_eq!(report.steps, 3);
    }

    #[tokio::test]
    async fn parse_garbage_emits_wait_then_bails() {
        let provider = ScriptedProvider::new(vec![
            "The weather is nice today.",
            "Still not an action.",
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel.clone(), cb.clone(), CancelToken::new());

        let report = k.run("goal").await;
        assert_eq!(report.bailout, Some(Bailout::TooManyExceptions));
        // First garbage produced a recorded (failed) wait step.
        let completes = cb.completes.lock();
        assert_eq!(completes.len(), 1);
        assert!(!completes[0].1);
        assert!(completes[0].2.contains("unparseable"));
        // No device call was made.
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_between_steps_stops_cleanly() {
        let cancel = CancelToken::new();
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "tap", "index": 1}"#,
            r#"{"action": "tap", "index": 1}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel.clone(), cb, cancel.clone());

        // Cancel once the first step has been dispatched.
        cancel.cancel();
        let report = k.run("goal").await;
        assert!(report.cancelled);
        assert!(!report.success);
        assert_eq!(report.steps, 0);
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn ask_user_answer_feeds_next_prompt() {
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "ask_user", "question": "输入短信验证码"}"#,
            r#"{"action": "input_text", "text": "123456"}"#,
            r#"{"action": "done", "success": true, "message": "sent"}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::with_answer("123456");
        let mut k = kernel(provider.clone(), channel.clone(), cb, CancelToken::new());

        let report = k.run("发送验证码").await;
        assert!(report.success);
        assert_eq!(report.steps, 3);
        assert!(channel.calls().iter().any(|c| c == "input_text(123456)"));

        // The answer was surfaced to the model in the following prompt.
        let requests = provider.requests.lock();
        let second_prompt = requests[1]
            .messages
            .last()
            .map(|m| m.text_content())
            .unwrap_or_default();
        assert!(second_prompt.contains("The user answered: 123456"));
    }

    #[tokio::test]
    async fn record_content_routes_to_callback() {
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "record_important_content", "content": "订单号 42", "category": "order"}"#,
            r#"{"action": "done", "message": "ok"}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel, cb.clone(), CancelToken::new());

        let report = k.run("goal").await;
        assert!(report.success);
        let recorded = cb.recorded.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "订单号 42");
        assert_eq!(recorded[0].1.as_deref(), Some("order"));
    }

    #[tokio::test]
    async fn context_window_keeps_first_and_recent_exchanges() {
        // Enough steps to overflow the window.
        let mut responses: Vec<String> = (0..8)
            .map(|_| r#"{"action": "press_key", "key": "back"}"#.to_owned())
            .collect();
        responses.push(r#"{"action": "done", "message": "ok"}"#.to_owned());
        let provider = ScriptedProvider::new(responses.iter().map(String::as_str).collect());
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut k = kernel(provider.clone(), channel, cb, CancelToken::new());

        let report = k.run("goal").await;
        assert!(report.success);

        let requests = provider.requests.lock();
        let last = requests.last().unwrap();
        // system + first pair + (N-1)*2 + current user = 1 + 2 + 9.
        assert!(last.messages.len() <= 12);
        assert_eq!(last.messages[0].text_content().is_empty(), false);
        // The very first user prompt survives windowing.
        assert!(last.messages[1].text_content().contains("Goal: goal"));
    }

    #[tokio::test]
    async fn unreachable_channel_fails_as_device_unavailable() {
        let provider = ScriptedProvider::new(vec![r#"{"action": "tap", "index": 1}"#]);
        let channel = Arc::new(MockChannel::new());
        // The tap fails unreachable, then the targeted reconnect fails too.
        channel.fail_next(fg_domain::ChannelErrorKind::Unreachable);
        channel.fail_next(fg_domain::ChannelErrorKind::Unreachable);
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel, cb, CancelToken::new());

        let report = k.run("goal").await;
        assert!(!report.success);
        assert_eq!(report.bailout, Some(Bailout::DeviceUnavailable));
        assert_eq!(report.message, "device_unavailable");
        assert!(!report.should_fallback());
        // The failed step itself was still recorded.
        assert_eq!(report.steps, 1);
    }

    #[tokio::test]
    async fn reconnect_recovers_a_transient_unreachable() {
        let provider = ScriptedProvider::new(vec![
            r#"{"action": "tap", "index": 1}"#,
            r#"{"action": "done", "success": true, "message": "ok"}"#,
        ]);
        let channel = Arc::new(MockChannel::new());
        // Only the tap fails; the reconnect goes through.
        channel.fail_next(fg_domain::ChannelErrorKind::Unreachable);
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel.clone(), cb, CancelToken::new());

        let report = k.run("goal").await;
        assert!(report.success);
        assert!(report.bailout.is_none());
        assert!(channel.calls().iter().any(|c| c == "connect"));
    }

    #[tokio::test]
    async fn max_steps_reached_reports_bailout() {
        let responses: Vec<String> = (0..10)
            .map(|_| r#"{"action": "press_key", "key": "back"}"#.to_owned())
            .collect();
        let provider = ScriptedProvider::new(responses.iter().map(String::as_str).collect());
        let channel = Arc::new(MockChannel::new());
        let cb = RecordingCallback::new();
        let mut k = kernel(provider, channel, cb, CancelToken::new());

        let report = k.run("goal").await;
        assert!(!report.success);
        assert_eq!(report.bailout, Some(Bailout::MaxStepsReached));
        assert_eq!(report.message, "max_steps_reached");
        assert!(report.should_fallback());
    }
}
