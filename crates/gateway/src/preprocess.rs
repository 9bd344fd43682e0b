//! Preprocessing rule engine — the optional fast path.
//!
//! Before a kernel spins up, the instruction text is matched against a
//! small set of launch patterns. A pure launch command executes directly
//! and finishes the task without any LLM round trip; a compound command
//! (launch + follow-up work) executes the launch as step 0 and hands the
//! rest to the kernel. Anything else is a no-op.

use fg_domain::action::Action;

/// What the rule engine decided about an instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// Direct action to run (always a launch today).
    pub action: Option<Action>,
    pub confidence: f64,
    /// True when the whole instruction is covered and no kernel is needed.
    pub skip_llm: bool,
    /// Remainder text for the kernel (compound commands).
    pub remainder: Option<String>,
}

impl ExecutionPlan {
    fn noop() -> Self {
        Self {
            action: None,
            confidence: 0.0,
            skip_llm: false,
            remainder: None,
        }
    }

    /// Pure system command with high confidence: execute and finish.
    pub fn is_direct(&self) -> bool {
        self.action.is_some() && self.skip_llm && self.confidence >= 0.9
    }

    /// Compound: run the launch first, then the kernel.
    pub fn is_compound(&self) -> bool {
        self.action.is_some() && !self.skip_llm && self.confidence >= 0.85
    }
}

const LAUNCH_PREFIXES: [&str; 6] = ["打开", "启动", "open ", "launch ", "start ", "运行"];
const CONNECTIVES: [&str; 8] = [
    "然后", "再", "并且", "并", ", then ", " then ", " and ", "，",
];

/// Classify one instruction. Deterministic and cheap; never touches a
/// device or a model.
pub fn analyze(instruction: &str) -> ExecutionPlan {
    let text = instruction.trim();
    let Some(after_prefix) = strip_launch_prefix(text) else {
        return ExecutionPlan::noop();
    };

    // Compound: a connective splits the launch target from follow-up work.
    if let Some((app, rest)) = split_at_connective(after_prefix) {
        let app = app.trim();
        let rest = rest.trim();
        if !plausible_app_name(app) || rest.is_empty() {
            return ExecutionPlan::noop();
        }
        return ExecutionPlan {
            action: Some(launch(app)),
            confidence: 0.9,
            skip_llm: false,
            remainder: Some(rest.to_owned()),
        };
    }

    // Pure launch.
    let app = after_prefix.trim();
    if !plausible_app_name(app) {
        return ExecutionPlan::noop();
    }
    ExecutionPlan {
        action: Some(launch(app)),
        confidence: 0.95,
        skip_llm: true,
        remainder: None,
    }
}

fn launch(app: &str) -> Action {
    Action::LaunchApp {
        app_name: app.to_owned(),
        reason: Some("rule engine: launch command".into()),
    }
}

fn strip_launch_prefix(text: &str) -> Option<&str> {
    let lowered = text.to_lowercase();
    for prefix in LAUNCH_PREFIXES {
        if lowered.starts_with(prefix) {
            return Some(&text[prefix.len()..]);
        }
    }
    None
}

fn split_at_connective(text: &str) -> Option<(&str, &str)> {
    let mut best: Option<(usize, &str)> = None;
    for connective in CONNECTIVES {
        if let Some(pos) = text.find(connective) {
            if best.map_or(true, |(b, _)| pos < b) {
                best = Some((pos, connective));
            }
        }
    }
    best.map(|(pos, connective)| (&text[..pos], &text[pos + connective.len()..]))
}

/// A plausible app name is short and free of further instructions.
fn plausible_app_name(app: &str) -> bool {
    !app.is_empty() && app.chars().count() <= 16 && !app.contains(|c: char| c == '\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_launch_chinese() {
        let plan = analyze("打开设置");
        assert!(plan.is_direct());
        assert_eq!(plan.confidence, 0.95);
        assert!(matches!(
            plan.action,
            Some(Action::LaunchApp { ref app_name, .. }) if app_name == "设置"
        ));
    }

    #[test]
    fn pure_launch_english() {
        let plan = analyze("open Settings");
        assert!(plan.is_direct());
        assert!(matches!(
            plan.action,
            Some(Action::LaunchApp { ref app_name, .. }) if app_name == "Settings"
        ));
    }

    #[test]
    fn compound_splits_launch_and_rest() {
        let plan = analyze("打开微信然后给张三发消息");
        assert!(plan.is_compound());
        assert!(!plan.skip_llm);
        assert_eq!(plan.confidence, 0.9);
        assert!(matches!(
            plan.action,
            Some(Action::LaunchApp { ref app_name, .. }) if app_name == "微信"
        ));
        assert_eq!(plan.remainder.as_deref(), Some("给张三发消息"));
    }

    #[test]
    fn compound_english_then() {
        let plan = analyze("open Chrome and search for rust async");
        assert!(plan.is_compound());
        assert_eq!(plan.remainder.as_deref(), Some("search for rust async"));
    }

    #[test]
    fn non_launch_is_noop() {
        let plan = analyze("在淘宝搜索耳机并比价");
        assert_eq!(plan, ExecutionPlan::noop());
        assert!(!plan.is_direct());
        assert!(!plan.is_compound());
    }

    #[test]
    fn overlong_app_name_is_rejected() {
        let plan = analyze("打开那个我昨天下载的视频编辑应用程序的设置页面里面的选项");
        assert!(!plan.is_direct());
    }
}
