use serde::{Deserialize, Serialize};
use serde_json::Value;

use fg_domain::TokenUsage;

/// Why a kernel gave up before finishing.
///
/// All reasons except `CriticalError` and `DeviceUnavailable` invite the
/// hybrid kernel to fall back to the vision path — a dead device channel is
/// not something a different kernel can work around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bailout {
    UiConsistentlyEmpty,
    ActionConsistentlyFailing,
    TooManyExceptions,
    MaxStepsReached,
    CriticalError,
    /// The device channel stayed unreachable after a targeted reconnect.
    /// The scheduler marks the device offline and fails the task.
    DeviceUnavailable,
}

impl Bailout {
    pub fn should_fallback(self) -> bool {
        !matches!(self, Self::CriticalError | Self::DeviceUnavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UiConsistentlyEmpty => "ui_consistently_empty",
            Self::ActionConsistentlyFailing => "action_consistently_failing",
            Self::TooManyExceptions => "too_many_exceptions",
            Self::MaxStepsReached => "max_steps_reached",
            Self::CriticalError => "critical_error",
            Self::DeviceUnavailable => "device_unavailable",
        }
    }
}

/// What a kernel run produced.
#[derive(Debug, Clone)]
pub struct KernelReport {
    pub success: bool,
    /// Number of steps executed (highest step index reached).
    pub steps: u32,
    pub message: String,
    pub usage: TokenUsage,
    /// Which path produced the result, e.g. `"structured"` or
    /// `"hybrid:auto(structured→vision)"`.
    pub mode: String,
    pub bailout: Option<Bailout>,
    /// Structured payload from a terminal `done`/`answer`.
    pub data: Option<Value>,
    /// Set when the run ended because the cancel token flipped.
    pub cancelled: bool,
}

impl KernelReport {
    pub fn cancelled(steps: u32, usage: TokenUsage, mode: impl Into<String>) -> Self {
        Self {
            success: false,
            steps,
            message: "Task cancelled by user".into(),
            usage,
            mode: mode.into(),
            bailout: None,
            data: None,
            cancelled: true,
        }
    }

    pub fn should_fallback(&self) -> bool {
        self.bailout.map(Bailout::should_fallback).unwrap_or(false) && !self.cancelled
    }
}
