//! Effect routing and channel-loss handling shared by the kernel loops.

use serde_json::Value;

use fg_devices::channel::DeviceChannel;
use fg_domain::ChannelErrorKind;

use crate::callback::ExecutionCallback;
use crate::exec::{ExecEffect, ExecOutcome};

/// Channel-loss policy: after an `unreachable`/`offline` failure, attempt
/// one targeted reconnect. Returns true when the device is genuinely gone —
/// the kernel then stops with `device_unavailable` instead of grinding
/// through its failure counters.
pub(crate) async fn channel_lost(
    error_kind: Option<ChannelErrorKind>,
    channel: &dyn DeviceChannel,
) -> bool {
    if !matches!(
        error_kind,
        Some(ChannelErrorKind::Unreachable | ChannelErrorKind::Offline)
    ) {
        return false;
    }
    match channel.connect().await {
        Ok(()) => {
            tracing::info!(device_id = channel.device_id(), "channel reconnected");
            false
        }
        Err(e) => {
            tracing::warn!(
                device_id = channel.device_id(),
                error = %e,
                "reconnect failed, device unavailable"
            );
            true
        }
    }
}

/// What the loop should do after an action's side effects are applied.
pub(crate) enum EffectFlow {
    /// Record the step and keep looping.
    Continue { observation: String },
    /// Keep looping, and feed `message` back to the model as a user turn.
    Feedback { observation: String, message: String },
    /// `done`/`answer`: record the step and return.
    Terminal {
        success: bool,
        message: String,
        data: Option<Value>,
    },
    /// `ask_user` got no answer (rendezvous cancelled or timed out).
    Unanswered,
}

pub(crate) async fn apply_effect(
    outcome: &ExecOutcome,
    exec_cb: &dyn ExecutionCallback,
) -> EffectFlow {
    match &outcome.effect {
        ExecEffect::None => EffectFlow::Continue {
            observation: outcome.message.clone(),
        },
        ExecEffect::Clipboard(content) => EffectFlow::Feedback {
            observation: outcome.message.clone(),
            message: format!("Clipboard content: {content}"),
        },
        ExecEffect::RecordContent { content, category } => {
            exec_cb.record_content(content, category.as_deref()).await;
            EffectFlow::Continue {
                observation: format!("recorded: {content}"),
            }
        }
        ExecEffect::UpdateTodos(todos) => {
            exec_cb.update_todos(todos).await;
            EffectFlow::Continue {
                observation: "todo list updated".into(),
            }
        }
        ExecEffect::AskUser { question, options } => {
            match exec_cb.ask_user(question, options.as_deref()).await {
                Some(answer) => EffectFlow::Feedback {
                    observation: format!("user answered: {answer}"),
                    message: format!("The user answered: {answer}"),
                },
                None => EffectFlow::Unanswered,
            }
        }
        ExecEffect::Terminal {
            success,
            message,
            data,
        } => EffectFlow::Terminal {
            success: *success,
            message: message.clone(),
            data: data.clone(),
        },
    }
}
