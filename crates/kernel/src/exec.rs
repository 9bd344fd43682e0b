//! The action executor: one stateless dispatcher from a typed [`Action`] to
//! device-channel calls.
//!
//! The executor holds no state of its own. Channel errors are classified
//! and folded into the outcome; nothing raised here ever escapes the
//! kernel loop. The loop reacts to the classification: an
//! `unreachable`/`offline` outcome triggers one targeted reconnect
//! ([`crate::flow::channel_lost`]) before the kernel declares the device
//! unavailable.

use std::time::Duration;

use serde_json::Value;

use fg_domain::action::{Action, Direction, Point};
use fg_domain::{ChannelErrorKind, Error, Result};
use fg_devices::channel::{DeviceChannel, Screen};

use crate::perception::UiElement;

/// Side effects an action produces beyond the device call itself. The
/// kernel routes these to the scheduler through the execution callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEffect {
    None,
    /// Content read from the device clipboard.
    Clipboard(String),
    RecordContent {
        content: String,
        category: Option<String>,
    },
    UpdateTodos(String),
    /// Suspend the task and wait for a user answer.
    AskUser {
        question: String,
        options: Option<Vec<String>>,
    },
    /// `done` / `answer`: terminate the kernel loop.
    Terminal {
        success: bool,
        message: String,
        data: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub message: String,
    pub error_kind: Option<ChannelErrorKind>,
    pub effect: ExecEffect,
}

impl ExecOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
            effect: ExecEffect::None,
        }
    }

    fn ok_with(message: impl Into<String>, effect: ExecEffect) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
            effect,
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error_kind: error.channel_kind(),
            effect: ExecEffect::None,
        }
    }
}

/// Map a normalized coordinate to pixels by truncation, clamped to the
/// screen so `(1000,1000)` lands on `(W-1, H-1)`.
pub fn resolve_normalized(point: Point, screen: Screen) -> (i64, i64) {
    let width = screen.width.max(1) as i64;
    let height = screen.height.max(1) as i64;
    let x = (point[0].clamp(0, 1000) * width / 1000).min(width - 1);
    let y = (point[1].clamp(0, 1000) * height / 1000).min(height - 1);
    (x, y)
}

/// Resolve coordinates-or-index addressing against the perception snapshot
/// that produced the action.
fn resolve_target(
    coordinates: Option<Point>,
    index: Option<usize>,
    screen: Screen,
    elements: &[UiElement],
) -> Result<(i64, i64)> {
    if let Some(point) = coordinates {
        return Ok(resolve_normalized(point, screen));
    }
    let index = index.ok_or_else(|| Error::Parse("no coordinates and no index".into()))?;
    elements
        .iter()
        .find(|e| e.index == index)
        .map(|e| e.center_px)
        .ok_or_else(|| Error::Parse(format!("element index {index} not in current perception")))
}

/// Direction swipes cover 80% of the screen, centered on the midline.
fn direction_to_coords(direction: Direction, screen: Screen) -> (i64, i64, i64, i64) {
    let w = screen.width as i64;
    let h = screen.height as i64;
    match direction {
        Direction::Up => (w / 2, h * 8 / 10, w / 2, h * 2 / 10),
        Direction::Down => (w / 2, h * 2 / 10, w / 2, h * 8 / 10),
        Direction::Left => (w * 8 / 10, h / 2, w * 2 / 10, h / 2),
        Direction::Right => (w * 2 / 10, h / 2, w * 8 / 10, h / 2),
    }
}

pub struct Executor;

impl Executor {
    /// Execute one action against a device. Pure dispatch: the result folds
    /// every failure into `success=false` with a classified `error_kind`.
    pub async fn execute(
        action: &Action,
        channel: &dyn DeviceChannel,
        screen: Screen,
        elements: &[UiElement],
    ) -> ExecOutcome {
        match Self::dispatch(action, channel, screen, elements).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(action = action.name(), error = %e, "action failed");
                ExecOutcome::failed(&e)
            }
        }
    }

    async fn dispatch(
        action: &Action,
        channel: &dyn DeviceChannel,
        screen: Screen,
        elements: &[UiElement],
    ) -> Result<ExecOutcome> {
        match action {
            Action::Tap {
                coordinates,
                index,
                button,
                clicks,
                ..
            } => {
                let (x, y) = resolve_target(*coordinates, *index, screen, elements)?;
                channel.tap(x, y, *button, *clicks).await?;
                Ok(ExecOutcome::ok(format!("tapped ({x}, {y})")))
            }

            Action::LongPress {
                coordinates,
                index,
                duration,
                ..
            } => {
                // Down-hold-up as a zero-distance swipe.
                let (x, y) = resolve_target(*coordinates, *index, screen, elements)?;
                channel.swipe(x, y, x, y, *duration).await?;
                Ok(ExecOutcome::ok(format!("long-pressed ({x}, {y})")))
            }

            Action::DoubleTap {
                coordinates, index, ..
            } => {
                let (x, y) = resolve_target(*coordinates, *index, screen, elements)?;
                channel.tap(x, y, Default::default(), 1).await?;
                tokio::time::sleep(Duration::from_millis(120)).await;
                channel.tap(x, y, Default::default(), 1).await?;
                Ok(ExecOutcome::ok(format!("double-tapped ({x}, {y})")))
            }

            Action::InputText { text, index, .. } => {
                if let Some(index) = index {
                    let (x, y) = resolve_target(None, Some(*index), screen, elements)?;
                    channel.tap(x, y, Default::default(), 1).await?;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                channel.input_text(text).await?;
                Ok(ExecOutcome::ok(format!("typed {} chars", text.chars().count())))
            }

            Action::Swipe {
                direction,
                start,
                end,
                duration,
                ..
            } => {
                let (x1, y1, x2, y2) = match (direction, start, end) {
                    (Some(direction), _, _) => direction_to_coords(*direction, screen),
                    (None, Some(start), Some(end)) => {
                        let (x1, y1) = resolve_normalized(*start, screen);
                        let (x2, y2) = resolve_normalized(*end, screen);
                        (x1, y1, x2, y2)
                    }
                    _ => return Err(Error::Parse("swipe without direction or points".into())),
                };
                channel.swipe(x1, y1, x2, y2, *duration).await?;
                Ok(ExecOutcome::ok(format!("swiped ({x1},{y1})→({x2},{y2})")))
            }

            Action::Drag {
                start,
                end,
                start_index,
                end_index,
                duration,
                ..
            } => {
                let (x1, y1) = resolve_target(*start, *start_index, screen, elements)?;
                let (x2, y2) = resolve_target(*end, *end_index, screen, elements)?;
                channel.swipe(x1, y1, x2, y2, *duration).await?;
                Ok(ExecOutcome::ok(format!("dragged ({x1},{y1})→({x2},{y2})")))
            }

            Action::Scroll {
                coordinates, value, ..
            } => {
                let (x, y) = resolve_normalized(*coordinates, screen);
                // |value| px in the sign direction; positive moves content up.
                let y2 = (y - value).clamp(0, screen.height.max(1) as i64 - 1);
                channel.swipe(x, y, x, y2, 300).await?;
                Ok(ExecOutcome::ok(format!("scrolled {value} px at ({x},{y})")))
            }

            Action::KeyEvent { key, .. } => {
                channel.key_event(key).await?;
                Ok(ExecOutcome::ok(format!("key {key}")))
            }

            Action::PressKey { key, .. } => {
                channel.press_nav(*key).await?;
                Ok(ExecOutcome::ok(format!("pressed {key:?}")))
            }

            Action::LaunchApp { app_name, .. } => {
                channel.launch_app(app_name).await?;
                Ok(ExecOutcome::ok(format!("launched {app_name}")))
            }

            Action::Wait { seconds, .. } => {
                let clamped = seconds.clamp(0.0, 60.0);
                tokio::time::sleep(Duration::from_secs_f64(clamped)).await;
                Ok(ExecOutcome::ok(format!("waited {clamped}s")))
            }

            Action::ReadClipboard { .. } => {
                let content = channel.read_clipboard().await?;
                Ok(ExecOutcome::ok_with(
                    format!("clipboard: {} chars", content.chars().count()),
                    ExecEffect::Clipboard(content),
                ))
            }

            Action::WriteClipboard { text, .. } => {
                channel.write_clipboard(text).await?;
                Ok(ExecOutcome::ok("clipboard written"))
            }

            Action::AskUser {
                question, options, ..
            } => Ok(ExecOutcome::ok_with(
                format!("asking user: {question}"),
                ExecEffect::AskUser {
                    question: question.clone(),
                    options: options.clone(),
                },
            )),

            Action::RecordImportantContent {
                content, category, ..
            } => Ok(ExecOutcome::ok_with(
                "content recorded",
                ExecEffect::RecordContent {
                    content: content.clone(),
                    category: category.clone(),
                },
            )),

            Action::GenerateOrUpdateTodos { todos, .. } => Ok(ExecOutcome::ok_with(
                "todos updated",
                ExecEffect::UpdateTodos(todos.clone()),
            )),

            Action::Answer {
                answer,
                success,
                data,
                ..
            } => Ok(ExecOutcome::ok_with(
                answer.clone(),
                ExecEffect::Terminal {
                    success: *success,
                    message: answer.clone(),
                    data: data.clone(),
                },
            )),

            Action::Done {
                success,
                message,
                data,
            } => Ok(ExecOutcome::ok_with(
                message.clone(),
                ExecEffect::Terminal {
                    success: *success,
                    message: message.clone(),
                    data: data.clone(),
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockChannel;
    use fg_domain::action::MouseButton;

    const SCREEN: Screen = Screen {
        width: 1080,
        height: 2400,
    };

    fn element(index: usize, center_px: (i64, i64)) -> UiElement {
        UiElement {
            index,
            role: "Button".into(),
            text: format!("el{index}"),
            center_px,
            center: [0, 0],
            clickable: true,
            focusable: false,
            long_clickable: false,
            bounds: [0, 0, 1, 1],
        }
    }

    #[test]
    fn origin_maps_to_origin() {
        assert_eq!(resolve_normalized([0, 0], SCREEN), (0, 0));
    }

    #[test]
    fn far_corner_truncates_inside_screen() {
        // 1000 maps to W (resp. H) by pure scaling; the clamp keeps the
        // point on-screen at (W-1, H-1).
        assert_eq!(resolve_normalized([1000, 1000], SCREEN), (1079, 2399));
    }

    #[test]
    fn midpoint_truncation() {
        assert_eq!(resolve_normalized([500, 500], SCREEN), (540, 1200));
        // 333/1000 × 1080 = 359.64 → truncates to 359.
        assert_eq!(resolve_normalized([333, 0], SCREEN).0, 359);
    }

    #[test]
    fn out_of_range_points_are_clamped() {
        assert_eq!(resolve_normalized([-5, 2000], SCREEN), (0, 2399));
    }

    #[tokio::test]
    async fn tap_by_coordinates() {
        let channel = MockChannel::new();
        let action = Action::Tap {
            coordinates: Some([500, 500]),
            index: None,
            button: MouseButton::Left,
            clicks: 1,
            reason: None,
        };
        let outcome = Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert!(outcome.success);
        assert_eq!(channel.calls(), vec!["tap(540,1200)"]);
    }

    #[tokio::test]
    async fn tap_by_index_uses_perception_center() {
        let channel = MockChannel::new();
        let elements = vec![element(1, (111, 222)), element(2, (333, 444))];
        let action = Action::Tap {
            coordinates: None,
            index: Some(2),
            button: MouseButton::Left,
            clicks: 1,
            reason: None,
        };
        let outcome = Executor::execute(&action, &channel, SCREEN, &elements).await;
        assert!(outcome.success);
        assert_eq!(channel.calls(), vec!["tap(333,444)"]);
    }

    #[tokio::test]
    async fn unknown_index_fails_without_device_call() {
        let channel = MockChannel::new();
        let action = Action::Tap {
            coordinates: None,
            index: Some(9),
            button: MouseButton::Left,
            clicks: 1,
            reason: None,
        };
        let outcome = Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert!(!outcome.success);
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn long_press_is_zero_distance_swipe() {
        let channel = MockChannel::new();
        let action = Action::LongPress {
            coordinates: Some([0, 0]),
            index: None,
            duration: 1200,
            reason: None,
        };
        Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert_eq!(channel.calls(), vec!["swipe(0,0,0,0,1200)"]);
    }

    #[tokio::test]
    async fn direction_swipe_covers_80_percent() {
        let channel = MockChannel::new();
        let action = Action::Swipe {
            direction: Some(Direction::Up),
            start: None,
            end: None,
            duration: 300,
            reason: None,
        };
        Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert_eq!(channel.calls(), vec!["swipe(540,1920,540,480,300)"]);
    }

    #[tokio::test]
    async fn scroll_moves_opposite_the_value_sign() {
        let channel = MockChannel::new();
        let action = Action::Scroll {
            coordinates: [500, 500],
            value: 400,
            reason: None,
        };
        Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert_eq!(channel.calls(), vec!["swipe(540,1200,540,800,300)"]);
    }

    #[tokio::test]
    async fn input_text_with_target_taps_first() {
        let channel = MockChannel::new();
        let elements = vec![element(1, (50, 60))];
        let action = Action::InputText {
            text: "hello".into(),
            index: Some(1),
            clear: true,
            reason: None,
        };
        Executor::execute(&action, &channel, SCREEN, &elements).await;
        assert_eq!(channel.calls(), vec!["tap(50,60)", "input_text(hello)"]);
    }

    #[tokio::test]
    async fn channel_error_is_classified_not_raised() {
        let channel = MockChannel::new();
        channel.fail_next(ChannelErrorKind::Timeout);
        let action = Action::KeyEvent {
            key: "enter".into(),
            reason: None,
        };
        let outcome = Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ChannelErrorKind::Timeout));
    }

    #[tokio::test]
    async fn done_yields_terminal_effect() {
        let channel = MockChannel::new();
        let action = Action::Done {
            success: true,
            message: "Settings opened".into(),
            data: None,
        };
        let outcome = Executor::execute(&action, &channel, SCREEN, &[]).await;
        match outcome.effect {
            ExecEffect::Terminal {
                success, message, ..
            } => {
                assert!(success);
                assert_eq!(message, "Settings opened");
            }
            other => panic!("unexpected effect {other:?}"),
        }
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn ask_user_produces_effect_without_device_call() {
        let channel = MockChannel::new();
        let action = Action::AskUser {
            question: "输入短信验证码".into(),
            options: None,
            reason: None,
        };
        let outcome = Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert!(matches!(outcome.effect, ExecEffect::AskUser { .. }));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn read_clipboard_surfaces_content() {
        let channel = MockChannel::new();
        channel.set_clipboard("123456");
        let action = Action::ReadClipboard { reason: None };
        let outcome = Executor::execute(&action, &channel, SCREEN, &[]).await;
        assert_eq!(outcome.effect, ExecEffect::Clipboard("123456".into()));
    }
}
