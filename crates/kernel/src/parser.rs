//! Tolerant LLM response parser.
//!
//! Models drift between output formats; this parser recovers a
//! `(thinking, action)` pair from every shape we have seen in the wild.
//! Formats are attempted in a fixed order and the first match wins:
//!
//! 1. `<thinking>…</thinking><tool_call>{json}</tool_call>` (preferred)
//! 2. tolerant variants of (1): missing close tags, missing `<tool_call>`,
//!    truncated JSON completed with a single closing brace
//! 3. `<think>…</think><answer>…</answer>` (legacy, string action)
//! 4. pure JSON `{"think": …, "action": …}`
//! 5. brace-delimited `{think}…{action}…` and `<|begin_of_box|>` variants
//! 6. last-resort regex for a trailing `do(…)` / `finish(…)` call
//!
//! Typed JSON actions come back as [`ParsedAction::Json`]; legacy string
//! forms come back as [`ParsedAction::Raw`] and are treated as parse
//! failures by the kernels (they only execute typed actions). Complete
//! failure yields an empty thinking and [`ParsedAction::Empty`].

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAction {
    /// A typed action object, ready for `Action::from_value`.
    Json(Value),
    /// A legacy string action (`do(…)` and friends). Diagnostic only.
    Raw(String),
    /// Nothing recoverable.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub thinking: String,
    pub action: ParsedAction,
}

impl ParsedResponse {
    fn raw(thinking: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            action: ParsedAction::Raw(action.into()),
        }
    }

    /// Only typed JSON actions are executable.
    pub fn is_executable(&self) -> bool {
        matches!(self.action, ParsedAction::Json(_))
    }
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

static THINKING_RE: OnceLock<Regex> = OnceLock::new();
static TOOL_CALL_RE: OnceLock<Regex> = OnceLock::new();
static BRACE_THINK_RE: OnceLock<Regex> = OnceLock::new();
static BOX_RE: OnceLock<Regex> = OnceLock::new();
static BOX_THINK_RE: OnceLock<Regex> = OnceLock::new();
static DO_CALL_RE: OnceLock<Regex> = OnceLock::new();
static JSON_THINK_RE: OnceLock<Regex> = OnceLock::new();
static JSON_ACTION_RE: OnceLock<Regex> = OnceLock::new();
static LINE_COMMENT_RE: OnceLock<Regex> = OnceLock::new();

pub struct ResponseParser;

impl ResponseParser {
    /// Parse one model response. Never fails; worst case is an empty result.
    pub fn parse(content: &str) -> ParsedResponse {
        if let Some(parsed) = Self::parse_xml_json(content) {
            return parsed;
        }
        if let Some(parsed) = Self::parse_think_answer(content) {
            return parsed;
        }
        if let Some(parsed) = Self::parse_pure_json(content) {
            return parsed;
        }
        if let Some(parsed) = Self::parse_brace_thinking(content) {
            return parsed;
        }
        if let Some(parsed) = Self::parse_boxed(content) {
            return parsed;
        }
        if let Some(parsed) = Self::parse_fallback(content) {
            return parsed;
        }

        tracing::warn!(
            head = %content.chars().take(200).collect::<String>(),
            "unparseable model response"
        );
        // Salvage stray thinking text for the audit trail; the action stays
        // empty and the kernel treats this as a terminal parse error.
        let thinking = re(&THINKING_RE, r"(?s)<thinking>(.*?)</thinking>")
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_owned())
            .unwrap_or_default();
        ParsedResponse {
            thinking,
            action: ParsedAction::Empty,
        }
    }

    // ── Format 1/2: <thinking> + <tool_call> with tolerances ─────────

    fn parse_xml_json(content: &str) -> Option<ParsedResponse> {
        if !content.contains("<thinking>") {
            return None;
        }
        let has_tool_call = content.contains("<tool_call>");

        let thinking = match re(&THINKING_RE, r"(?s)<thinking>(.*?)</thinking>")
            .captures(content)
        {
            Some(caps) => caps.get(1).map(|m| m.as_str().trim().to_owned())?,
            None => {
                // Missing </thinking>: take everything up to the tool call
                // (or the first brace).
                let start = content.find("<thinking>")? + "<thinking>".len();
                let end = if has_tool_call {
                    content.find("<tool_call>")?
                } else {
                    content[start..].find('{').map(|i| start + i)?
                };
                if end <= start {
                    return None;
                }
                content[start..end].trim().to_owned()
            }
        };

        let tool_content = if has_tool_call {
            match re(&TOOL_CALL_RE, r"(?s)<tool_call>(.*?)</tool_call>").captures(content) {
                Some(caps) => caps.get(1)?.as_str().trim().to_owned(),
                // Missing </tool_call>: everything after the open tag.
                None => {
                    let start = content.find("<tool_call>")? + "<tool_call>".len();
                    content[start..].trim().to_owned()
                }
            }
        } else if let Some(end_tag) = content.find("</thinking>") {
            content[end_tag + "</thinking>".len()..].trim().to_owned()
        } else {
            let start = content.find('{')?;
            content[start..].trim().to_owned()
        };

        Self::finish_json_action(&thinking, &tool_content)
    }

    /// Decode the tool-call payload, completing a truncated object when the
    /// closing brace is missing.
    fn finish_json_action(thinking: &str, tool_content: &str) -> Option<ParsedResponse> {
        match serde_json::from_str::<Value>(tool_content) {
            Ok(value) => Self::accept_action_object(thinking, value, tool_content),
            Err(_) => {
                let trimmed = tool_content.trim();
                if trimmed.starts_with('{') && !trimmed.ends_with('}') {
                    let completed = format!("{trimmed}\n}}");
                    if let Ok(value) = serde_json::from_str::<Value>(&completed) {
                        tracing::debug!("completed truncated tool-call JSON");
                        return Self::accept_action_object(thinking, value, trimmed);
                    }
                }
                if trimmed.starts_with("do(") {
                    return Some(ParsedResponse::raw(thinking, trimmed));
                }
                None
            }
        }
    }

    fn accept_action_object(
        thinking: &str,
        mut value: Value,
        original: &str,
    ) -> Option<ParsedResponse> {
        let name = value.get("action")?.as_str()?.to_owned();
        // `tap(500, 500)`-style contamination inside the name: surface the
        // raw text rather than a broken object.
        if name.contains('(') || name.contains(')') {
            tracing::warn!(action = %name, "action name carries arguments");
            return Some(ParsedResponse::raw(thinking, original));
        }
        if name.eq_ignore_ascii_case("finish") {
            value["action"] = Value::String("done".into());
        }
        Some(ParsedResponse {
            thinking: thinking.to_owned(),
            action: ParsedAction::Json(value),
        })
    }

    // ── Format 3: <think>…</think><answer>…</answer> ─────────────────

    fn parse_think_answer(content: &str) -> Option<ParsedResponse> {
        let (head, tail) = content.split_once("<answer>")?;
        let thinking = head
            .replace("<think>", "")
            .replace("</think>", "")
            .trim()
            .to_owned();
        let action = tail.replace("</answer>", "").trim().to_owned();
        Some(ParsedResponse::raw(thinking, action))
    }

    // ── Format 4: pure JSON {"think": …, "action": …} ────────────────

    fn parse_pure_json(content: &str) -> Option<ParsedResponse> {
        let trimmed = content.trim();
        if !(trimmed.starts_with('{')
            && trimmed.contains("\"think\"")
            && trimmed.contains("\"action\""))
        {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                let thinking = value.get("think")?.to_string_lossy();
                match value.get("action")? {
                    dict @ Value::Object(_) => Some(ParsedResponse {
                        thinking,
                        action: ParsedAction::Json(dict.clone()),
                    }),
                    other => Some(ParsedResponse::raw(thinking, other.to_string_lossy())),
                }
            }
            Err(_) => {
                // Broken JSON: regex out the pieces.
                let think = re(
                    &JSON_THINK_RE,
                    r#"(?s)"think"\s*:\s*"(.*?)"\s*,\s*"action""#,
                )
                .captures(trimmed)?
                .get(1)?
                .as_str()
                .trim()
                .to_owned();
                let action = re(&JSON_ACTION_RE, r#""action"\s*:\s*"(do\([^)]+\))""#)
                    .captures(trimmed)?
                    .get(1)?
                    .as_str()
                    .trim()
                    .to_owned();
                Some(ParsedResponse::raw(think, action))
            }
        }
    }

    // ── Format 5a: {think}…{action}… ─────────────────────────────────

    fn parse_brace_thinking(content: &str) -> Option<ParsedResponse> {
        if !content.contains("{think}") || !content.contains("{action}") {
            return None;
        }
        let thinking = re(&BRACE_THINK_RE, r"(?s)\{think\}(.*?)\{action\}")
            .captures(content)?
            .get(1)?
            .as_str()
            .trim()
            .to_owned();
        let section = content.split("{action}").nth(1)?;
        let action = match re(&DO_CALL_RE, r"((?:do|finish)\([^()]*(?:\([^()]*\))?[^()]*\))")
            .captures(section)
        {
            Some(caps) => caps.get(1)?.as_str().trim().to_owned(),
            None => section.lines().next()?.trim().to_owned(),
        };
        let action = strip_line_comments(&action);
        Some(ParsedResponse::raw(thinking, action))
    }

    // ── Format 5b: {think>…}<|begin_of_box|>…<|end_of_box|> ──────────

    fn parse_boxed(content: &str) -> Option<ParsedResponse> {
        if !content.contains("{think>") && !content.contains("{think}") {
            return None;
        }
        let thinking = re(&BOX_THINK_RE, r"(?s)\{think[>]?(.*?)\}")
            .captures(content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_owned())
            .unwrap_or_default();

        let action = match re(&BOX_RE, r"(?s)<\|begin_of_box\|>(.*?)<\|end_of_box\|>")
            .captures(content)
        {
            Some(caps) => {
                let inner = caps.get(1)?.as_str().trim();
                let inner = inner.strip_prefix("{action}").unwrap_or(inner).trim();
                strip_line_comments(inner)
            }
            None => {
                let tail = re(&BOX_THINK_RE, r"(?s)\{think[>]?(.*?)\}")
                    .splitn(content, 2)
                    .nth(1)?;
                strip_line_comments(tail.trim())
            }
        };
        if action.is_empty() {
            return None;
        }
        Some(ParsedResponse::raw(thinking, action))
    }

    // ── Format 6: trailing do(…)/finish(…) regex ─────────────────────

    fn parse_fallback(content: &str) -> Option<ParsedResponse> {
        let pattern = re(
            &DO_CALL_RE,
            r"((?:do|finish)\([^()]*(?:\([^()]*\))?[^()]*\))",
        );
        let last = pattern
            .captures_iter(content)
            .last()?
            .get(1)?
            .as_str()
            .trim()
            .to_owned();

        let idx = content.rfind(&last).unwrap_or(0);
        let mut thinking = content[..idx]
            .replace("<think>", "")
            .replace("</think>", "")
            .replace("<thinking>", "")
            .replace("</thinking>", "")
            .trim()
            .to_owned();
        if thinking.chars().count() > 500 {
            thinking = thinking
                .chars()
                .skip(thinking.chars().count() - 500)
                .collect();
        }
        Some(ParsedResponse::raw(thinking, last))
    }
}

fn strip_line_comments(text: &str) -> String {
    re(&LINE_COMMENT_RE, r"//[^\n]*")
        .replace_all(text, "")
        .trim()
        .to_owned()
}

trait ValueExt {
    fn to_string_lossy(&self) -> String;
}

impl ValueExt for Value {
    fn to_string_lossy(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
