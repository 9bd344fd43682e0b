//! The device action algebra.
//!
//! Actions are the normalized output of the LLM decision step. Every kernel
//! produces values of this one enum and a single executor turns them into
//! device-channel calls. The wire shape is a JSON object tagged by an
//! `"action"` field, e.g. `{"action":"tap","coordinates":[500,500]}`.
//!
//! Coordinates are normalized integers in `[0, 1000]²`; the executor scales
//! them against the most recent screenshot dimensions. Element indices refer
//! to the perception snapshot that produced the action.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A normalized coordinate pair `[x, y]` in `[0, 1000]²`.
pub type Point = [i64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// High-level navigation keys shared by both device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavKey {
    Back,
    Home,
    Recent,
}

fn default_true() -> bool {
    true
}
fn default_clicks() -> u32 {
    1
}
fn default_long_press_ms() -> u64 {
    1000
}
fn default_swipe_ms() -> u64 {
    300
}
fn default_drag_ms() -> u64 {
    500
}
fn default_wait_secs() -> f64 {
    3.0
}

/// One device action, as decided by a kernel.
///
/// All variants carry an optional human-readable `reason` used only for
/// logging and the step audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Tap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "default_clicks")]
        clicks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    LongPress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        #[serde(default = "default_long_press_ms")]
        duration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DoubleTap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    InputText {
        text: String,
        /// Optional target element to tap before typing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        #[serde(default = "default_true")]
        clear: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Swipe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<Point>,
        #[serde(default = "default_swipe_ms")]
        duration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Drag {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<Point>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_index: Option<usize>,
        #[serde(default = "default_drag_ms")]
        duration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Scroll {
        coordinates: Point,
        /// Signed scroll distance in pixels; positive scrolls content up.
        value: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    KeyEvent {
        /// Friendly key name (`enter`, `volume_up`, …) or a raw platform
        /// keycode.
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    PressKey {
        key: NavKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    LaunchApp {
        app_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Wait {
        #[serde(default = "default_wait_secs")]
        seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ReadClipboard {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    WriteClipboard {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AskUser {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RecordImportantContent {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    GenerateOrUpdateTodos {
        /// Markdown checklist replacing the task's todo list.
        todos: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Answer {
        answer: String,
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Done {
        #[serde(default = "default_true")]
        success: bool,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl Action {
    /// Wire name of the variant, matching the `"action"` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tap { .. } => "tap",
            Self::LongPress { .. } => "long_press",
            Self::DoubleTap { .. } => "double_tap",
            Self::InputText { .. } => "input_text",
            Self::Swipe { .. } => "swipe",
            Self::Drag { .. } => "drag",
            Self::Scroll { .. } => "scroll",
            Self::KeyEvent { .. } => "key_event",
            Self::PressKey { .. } => "press_key",
            Self::LaunchApp { .. } => "launch_app",
            Self::Wait { .. } => "wait",
            Self::ReadClipboard { .. } => "read_clipboard",
            Self::WriteClipboard { .. } => "write_clipboard",
            Self::AskUser { .. } => "ask_user",
            Self::RecordImportantContent { .. } => "record_important_content",
            Self::GenerateOrUpdateTodos { .. } => "generate_or_update_todos",
            Self::Answer { .. } => "answer",
            Self::Done { .. } => "done",
        }
    }

    /// `done` and `answer` both terminate the kernel loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Answer { .. })
    }

    /// Parse a tolerant JSON object into a typed action.
    ///
    /// Accepts the canonical wire shape plus the legacy aliases models still
    /// emit: `type`→`input_text`, `launch`→`launch_app` (with `app` for
    /// `app_name`), bare `back`/`home` as action names, `finish`→`done`,
    /// `element`→`coordinates`, and string-valued `wait` durations.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Parse(format!("action is not an object: {value}")))?;
        let raw_name = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse("missing action field".into()))?
            .to_lowercase();

        let mut fields = obj.clone();
        let name = match raw_name.as_str() {
            "type" => "input_text",
            "launch" => "launch_app",
            "longpress" => "long_press",
            "doubletap" => "double_tap",
            "keyevent" => "key_event",
            "askuser" => "ask_user",
            "record" => "record_important_content",
            "todos" => "generate_or_update_todos",
            "finish" => "done",
            "back" | "home" | "recent" => {
                fields.insert("key".into(), Value::String(raw_name.clone()));
                "press_key"
            }
            other => other,
        };

        // Legacy field fixups.
        if let Some(element) = fields.remove("element") {
            fields.entry("coordinates").or_insert(element);
        }
        if name == "launch_app" {
            if let Some(app) = fields.remove("app") {
                fields.entry("app_name").or_insert(app);
            }
        }
        if name == "wait" {
            let duration = fields.remove("duration");
            if !fields.contains_key("seconds") {
                let seconds = match duration {
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(default_wait_secs()),
                    Some(Value::String(s)) => s
                        .split_whitespace()
                        .next()
                        .and_then(|tok| tok.parse::<f64>().ok())
                        .unwrap_or(default_wait_secs()),
                    _ => default_wait_secs(),
                };
                fields.insert("seconds".into(), serde_json::json!(seconds));
            }
        }
        if name == "done" && !fields.contains_key("message") {
            let message = fields
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("Task complete")
                .to_owned();
            fields.insert("message".into(), Value::String(message));
        }

        fields.insert("action".into(), Value::String(name.to_owned()));
        let action: Action = serde_json::from_value(Value::Object(fields))
            .map_err(|e| Error::Parse(format!("invalid {name} action: {e}")))?;
        action.validate()?;
        Ok(action)
    }

    /// Structural validation of a single action.
    ///
    /// Tap-like variants must carry exactly one of coordinates/index; swipe
    /// needs a direction or a full start/end pair; drag needs one complete
    /// addressing mode.
    pub fn validate(&self) -> Result<()> {
        let one_of = |coordinates: &Option<Point>, index: &Option<usize>, what: &str| {
            match (coordinates, index) {
                (Some(_), None) | (None, Some(_)) => Ok(()),
                (Some(_), Some(_)) => Err(Error::Parse(format!(
                    "{what} carries both coordinates and index"
                ))),
                (None, None) => Err(Error::Parse(format!(
                    "{what} needs coordinates or an element index"
                ))),
            }
        };

        match self {
            Self::Tap {
                coordinates, index, ..
            } => one_of(coordinates, index, "tap"),
            Self::LongPress {
                coordinates, index, ..
            } => one_of(coordinates, index, "long_press"),
            Self::DoubleTap {
                coordinates, index, ..
            } => one_of(coordinates, index, "double_tap"),
            Self::Swipe {
                direction,
                start,
                end,
                ..
            } => {
                if direction.is_some() || (start.is_some() && end.is_some()) {
                    Ok(())
                } else {
                    Err(Error::Parse(
                        "swipe needs a direction or both start and end".into(),
                    ))
                }
            }
            Self::Drag {
                start,
                end,
                start_index,
                end_index,
                ..
            } => {
                let by_coords = start.is_some() && end.is_some();
                let by_index = start_index.is_some() && end_index.is_some();
                if by_coords || by_index {
                    Ok(())
                } else {
                    Err(Error::Parse(
                        "drag needs start/end coordinates or start_index/end_index".into(),
                    ))
                }
            }
            Self::InputText { text, .. } if text.is_empty() => {
                Err(Error::Parse("input_text with empty text".into()))
            }
            Self::LaunchApp { app_name, .. } if app_name.is_empty() => {
                Err(Error::Parse("launch_app with empty app name".into()))
            }
            Self::AskUser { question, .. } if question.is_empty() => {
                Err(Error::Parse("ask_user with empty question".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Validate an action batch: `done` must be the only action of its batch.
pub fn validate_batch(actions: &[Action]) -> Result<()> {
    if actions.is_empty() {
        return Err(Error::Parse("empty action batch".into()));
    }
    let has_done = actions.iter().any(|a| matches!(a, Action::Done { .. }));
    if has_done && actions.len() > 1 {
        return Err(Error::Parse(
            "done must be the sole action in a batch".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(action: Action) {
        let wire = serde_json::to_value(&action).unwrap();
        let parsed = Action::from_value(&wire).unwrap();
        assert_eq!(parsed, action, "wire was {wire}");
    }

    #[test]
    fn all_variants_roundtrip() {
        let actions = vec![
            Action::Tap {
                coordinates: Some([500, 500]),
                index: None,
                button: MouseButton::Left,
                clicks: 1,
                reason: Some("open settings".into()),
            },
            Action::Tap {
                coordinates: None,
                index: Some(3),
                button: MouseButton::Right,
                clicks: 2,
                reason: None,
            },
            Action::LongPress {
                coordinates: Some([100, 900]),
                index: None,
                duration: 1500,
                reason: None,
            },
            Action::DoubleTap {
                coordinates: None,
                index: Some(7),
                reason: None,
            },
            Action::InputText {
                text: "hello".into(),
                index: Some(2),
                clear: true,
                reason: None,
            },
            Action::Swipe {
                direction: Some(Direction::Up),
                start: None,
                end: None,
                duration: 300,
                reason: None,
            },
            Action::Swipe {
                direction: None,
                start: Some([200, 800]),
                end: Some([200, 200]),
                duration: 250,
                reason: None,
            },
            Action::Drag {
                start: Some([100, 100]),
                end: Some([500, 500]),
                start_index: None,
                end_index: None,
                duration: 500,
                reason: None,
            },
            Action::Scroll {
                coordinates: [500, 500],
                value: -300,
                reason: None,
            },
            Action::KeyEvent {
                key: "enter".into(),
                reason: None,
            },
            Action::PressKey {
                key: NavKey::Back,
                reason: None,
            },
            Action::LaunchApp {
                app_name: "Settings".into(),
                reason: None,
            },
            Action::Wait {
                seconds: 2.0,
                reason: None,
            },
            Action::ReadClipboard { reason: None },
            Action::WriteClipboard {
                text: "copied".into(),
                reason: None,
            },
            Action::AskUser {
                question: "输入短信验证码".into(),
                options: None,
                reason: None,
            },
            Action::RecordImportantContent {
                content: "order number 42".into(),
                category: Some("order".into()),
                reason: None,
            },
            Action::GenerateOrUpdateTodos {
                todos: "- [ ] step one".into(),
                reason: None,
            },
            Action::Answer {
                answer: "42".into(),
                success: true,
                data: None,
                reason: None,
            },
            Action::Done {
                success: true,
                message: "Settings opened".into(),
                data: None,
            },
        ];
        for action in actions {
            roundtrip(action);
        }
    }

    #[test]
    fn legacy_aliases() {
        let typed = Action::from_value(&json!({"action": "type", "text": "hi"})).unwrap();
        assert!(matches!(typed, Action::InputText { ref text, .. } if text == "hi"));

        let launch = Action::from_value(&json!({"action": "launch", "app": "微信"})).unwrap();
        assert!(matches!(launch, Action::LaunchApp { ref app_name, .. } if app_name == "微信"));

        let back = Action::from_value(&json!({"action": "back"})).unwrap();
        assert!(matches!(
            back,
            Action::PressKey {
                key: NavKey::Back,
                ..
            }
        ));

        let finished =
            Action::from_value(&json!({"action": "finish", "message": "done"})).unwrap();
        assert!(matches!(finished, Action::Done { .. }));
    }

    #[test]
    fn element_maps_to_coordinates() {
        let action =
            Action::from_value(&json!({"action": "tap", "element": [250, 750]})).unwrap();
        assert!(matches!(
            action,
            Action::Tap {
                coordinates: Some([250, 750]),
                ..
            }
        ));
    }

    #[test]
    fn wait_duration_tolerance() {
        let from_string =
            Action::from_value(&json!({"action": "wait", "duration": "2 seconds"})).unwrap();
        assert!(matches!(from_string, Action::Wait { seconds, .. } if seconds == 2.0));

        let from_number = Action::from_value(&json!({"action": "wait", "duration": 1.5})).unwrap();
        assert!(matches!(from_number, Action::Wait { seconds, .. } if seconds == 1.5));

        let garbage = Action::from_value(&json!({"action": "wait", "duration": "soon"})).unwrap();
        assert!(matches!(garbage, Action::Wait { seconds, .. } if seconds == 3.0));
    }

    #[test]
    fn done_message_falls_back_to_reason() {
        let action =
            Action::from_value(&json!({"action": "done", "reason": "all set"})).unwrap();
        assert!(matches!(action, Action::Done { ref message, .. } if message == "all set"));
    }

    #[test]
    fn tap_requires_exactly_one_target() {
        assert!(Action::from_value(&json!({"action": "tap"})).is_err());
        assert!(Action::from_value(
            &json!({"action": "tap", "coordinates": [1, 2], "index": 3})
        )
        .is_err());
    }

    #[test]
    fn swipe_needs_direction_or_pair() {
        assert!(Action::from_value(&json!({"action": "swipe"})).is_err());
        assert!(Action::from_value(&json!({"action": "swipe", "start": [0, 0]})).is_err());
        assert!(Action::from_value(&json!({"action": "swipe", "direction": "down"})).is_ok());
    }

    #[test]
    fn done_must_be_sole_action() {
        let done = Action::Done {
            success: true,
            message: "m".into(),
            data: None,
        };
        let wait = Action::Wait {
            seconds: 1.0,
            reason: None,
        };
        assert!(validate_batch(&[done.clone()]).is_ok());
        assert!(validate_batch(&[wait.clone(), done]).is_err());
        assert!(validate_batch(&[wait]).is_ok());
        assert!(validate_batch(&[]).is_err());
    }

    #[test]
    fn terminal_variants() {
        assert!(Action::Done {
            success: false,
            message: "m".into(),
            data: None
        }
        .is_terminal());
        assert!(Action::Answer {
            answer: "a".into(),
            success: true,
            data: None,
            reason: None
        }
        .is_terminal());
        assert!(!Action::ReadClipboard { reason: None }.is_terminal());
    }
}
