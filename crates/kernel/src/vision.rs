//! Vision kernel — the expensive path.
//!
//! Perceives through screenshots sent to a multimodal model. Only the most
//! recent user message keeps its image; older ones are stripped down to
//! their text to cap context growth. A step-count watchdog logs past 30
//! steps and warns past 80, but never truncates the conversation — context
//! integrity beats token savings here.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;

use fg_domain::action::Action;
use fg_domain::TokenUsage;
use fg_devices::channel::DeviceChannel;
use fg_providers::{ChatMessage, ChatRequest, LlmProvider, Role};

use crate::callback::{ExecutionCallback, StepCallback, StepStart};
use crate::cancel::CancelToken;
use crate::exec::Executor;
use crate::flow::{apply_effect, channel_lost, EffectFlow};
use crate::parser::ResponseParser;
use crate::prompts::VISION_SYSTEM_PROMPT;
use crate::report::{Bailout, KernelReport};

const PARSE_FAILURE_LIMIT: u32 = 2;
const EXCEPTION_LIMIT: u32 = 5;
const CONTEXT_NOTICE_STEPS: u32 = 30;
const CONTEXT_WARN_STEPS: u32 = 80;

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub model: String,
    pub max_steps: u32,
    pub step_delay: Duration,
    pub first_step: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_steps: 50,
            step_delay: Duration::from_millis(400),
            first_step: 1,
        }
    }
}

pub struct VisionKernel {
    provider: Arc<dyn LlmProvider>,
    channel: Arc<dyn DeviceChannel>,
    config: VisionConfig,
    step_cb: Arc<dyn StepCallback>,
    exec_cb: Arc<dyn ExecutionCallback>,
    cancel: CancelToken,

    context: Vec<ChatMessage>,
    usage: TokenUsage,
    /// Optional summary of a prior structured attempt (hybrid fallback).
    seed: Option<String>,
}

impl VisionKernel {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        channel: Arc<dyn DeviceChannel>,
        config: VisionConfig,
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
            usage: TokenUsage::default(),
            seed: None,
        }
    }

    /// Seed the conversation with a summary of the structured attempt that
    /// preceded this run (hybrid fallback hand-off).
    pub fn seed_summary(&mut self, summary: impl Into<String>) {
        self.seed = Some(summary.into());
    }

    pub fn reset(&mut self) {
        self.context.clear();
        self.usage = TokenUsage::default();
    }

    pub async fn run(&mut self, instruction: &str) -> KernelReport {
        self.reset();
        self.context
            .push(ChatMessage::text(Role::System, VISION_SYSTEM_PROMPT));
        if let Some(seed) = self.seed.take() {
            self.context.push(ChatMessage::text(Role::User, seed));
        }

        let mut parse_failures = 0u32;
        let mut exceptions = 0u32;
        let mut steps_done = 0u32;
        let mut observation: Option<String> = None;

        for _ in 0..self.config.max_steps {
            if self.cancel.is_cancelled() {
                return KernelReport::cancelled(steps_done, self.usage, "vision");
            }
            let step = self.config.first_step + steps_done;
            self.context_watchdog(steps_done);

            // 1. Perceive: capture the screen.
            let (png, screen) = match self.channel.screenshot().await {
                Ok(capture) => capture,
                Err(e) => {
                    tracing::warn!(error = %e, "screenshot failed");
                    if channel_lost(e.channel_kind(), self.channel.as_ref()).await {
                        return self.bailout_report(
                            steps_done,
                            Bailout::DeviceUnavailable,
                            "device_unavailable",
                        );
                    }
                    exceptions += 1;
                    if exceptions >= EXCEPTION_LIMIT {
                        return self.bailout_report(
                            steps_done,
                            Bailout::TooManyExceptions,
                            "repeated screenshot failures",
                        );
                    }
                    tokio::time::sleep(self.config.step_delay).await;
                    continue;
                }
            };
            let image_b64 = base64::engine::general_purpose::STANDARD.encode(&png);

            // 2. Decide. Older images are dropped before the new one goes in.
            for message in self.context.iter_mut() {
                if message.role == Role::User {
                    message.strip_images();
                }
            }
            let text = match (&observation, steps_done) {
                (_, 0) => format!("Task: {instruction}\nHere is the current screen."),
                (Some(obs), _) => {
                    format!("Previous action result: {obs}\nHere is the current screen.")
                }
                (None, _) => "Here is the current screen.".to_owned(),
            };
            self.context
                .push(ChatMessage::user_with_image(text, image_b64));

            let request = ChatRequest {
                messages: self.context.clone(),
                model: self.config.model.clone(),
                json_mode: false,
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
            let action = match &parsed.action {
                crate::parser::ParsedAction::Json(value) => Action::from_value(value).ok(),
                _ => None,
            };
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
                self.emit_wait_step(step, &parsed.thinking).await;
                steps_done += 1;
                observation = Some("the last response could not be parsed".into());
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

            let outcome = Executor::execute(&action, self.channel.as_ref(), screen, &[]).await;
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
                        mode: "vision".into(),
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
                        return KernelReport::cancelled(steps_done, self.usage, "vision");
                    }
                    return KernelReport {
                        success: false,
                        steps: steps_done,
                        message: "等待用户回答超时".into(),
                        usage: self.usage,
                        mode: "vision".into(),
                        bailout: None,
                        data: None,
                        cancelled: false,
                    };
                }
                EffectFlow::Feedback {
                    observation: obs,
                    message,
                } => {
                    self.step_cb
                        .on_step_complete(step, outcome.success, &parsed.thinking, &obs)
                        .await;
                    observation = Some(message);
                }
                EffectFlow::Continue { observation: obs } => {
                    self.step_cb
                        .on_step_complete(step, outcome.success, &parsed.thinking, &obs)
                        .await;
                    observation = Some(obs);
                }
            }
            steps_done += 1;

            if !outcome.success
                && channel_lost(outcome.error_kind, self.channel.as_ref()).await
            {
                return self.bailout_report(
                    steps_done,
                    Bailout::DeviceUnavailable,
                    "device_unavailable",
                );
            }

            tokio::time::sleep(self.config.step_delay).await;
        }

        self.bailout_report(
            self.config.max_steps,
            Bailout::MaxStepsReached,
            "max_steps_reached",
        )
    }

    fn context_watchdog(&self, steps_done: u32) {
        if steps_done > CONTEXT_WARN_STEPS {
            tracing::warn!(steps_done, "vision context is very long");
        } else if steps_done > CONTEXT_NOTICE_STEPS {
            tracing::info!(steps_done, "vision context growing");
        }
    }

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
            mode: "vision".into(),
            bailout: Some(bailout),
            data: None,
            cancelled: false,
        }
    }
}
