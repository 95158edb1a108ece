// Mode intent detection and auto-revert phrasing
//
// The detector inspects a user message for an explicit mode request. It
// only ever returns modes from AgentMode::INFERRABLE - sovereign cannot be
// reached this way regardless of phrasing. Auto-revert matches the final
// assistant content: plan mode reverts once a plan has been presented,
// auto mode reverts on completion phrasing.

use regex::RegexSet;
use std::sync::OnceLock;

use podex_core::AgentMode;

fn plan_intent() -> &'static RegexSet {
    static RE: OnceLock<RegexSet> = OnceLock::new();
    RE.get_or_init(|| {
        RegexSet::new([
            r"(?i)\bswitch(?:ing)? to plan(?: mode)?\b",
            r"(?i)\bplan mode\b",
            r"(?i)\b(?:make|draft|create|put together) a plan\b",
            r"(?i)\bplan (?:this|it) out\b",
            r"(?i)\bdon'?t (?:change|touch|modify) (?:any|the)? ?(?:files|code)\b",
        ])
        .expect("plan intent regexes")
    })
}

fn auto_intent() -> &'static RegexSet {
    static RE: OnceLock<RegexSet> = OnceLock::new();
    RE.get_or_init(|| {
        RegexSet::new([
            r"(?i)\bswitch(?:ing)? to auto(?: mode)?\b",
            r"(?i)\bauto mode\b",
            r"(?i)\bjust (?:do|fix|build) it\b",
            r"(?i)\bgo ahead and (?:implement|fix|build)\b",
            r"(?i)\bstop asking\b",
        ])
        .expect("auto intent regexes")
    })
}

fn ask_intent() -> &'static RegexSet {
    static RE: OnceLock<RegexSet> = OnceLock::new();
    RE.get_or_init(|| {
        RegexSet::new([
            r"(?i)\bswitch(?:ing)? to ask(?: mode)?\b",
            r"(?i)\bask mode\b",
            r"(?i)\bask (?:me )?(?:before|first)\b",
            r"(?i)\bcheck with me\b",
        ])
        .expect("ask intent regexes")
    })
}

fn plan_presented() -> &'static RegexSet {
    static RE: OnceLock<RegexSet> = OnceLock::new();
    RE.get_or_init(|| {
        RegexSet::new([
            r"(?i)\bhere'?s (?:the|my|a) plan\b",
            r"(?i)\bproposed plan\b",
            r"(?i)^#+\s*plan\b",
            r"(?i)\bimplementation plan\b",
            r"(?m)^\s*(?:1[.)]|step 1)",
        ])
        .expect("plan presented regexes")
    })
}

fn work_completed() -> &'static RegexSet {
    static RE: OnceLock<RegexSet> = OnceLock::new();
    RE.get_or_init(|| {
        RegexSet::new([
            r"(?i)\b(?:all )?done\b",
            r"(?i)\bimplemented\b",
            r"(?i)\bcompleted? the\b",
            r"(?i)\bchanges (?:are|have been) (?:made|applied)\b",
            r"(?i)\beverything is (?:in place|working)\b",
        ])
        .expect("work completed regexes")
    })
}

/// Detect an explicit mode switch request in a user message.
///
/// The result is restricted to AgentMode::INFERRABLE by construction;
/// there is no phrasing that yields Sovereign.
pub fn detect_mode_intent(message: &str) -> Option<AgentMode> {
    let detected = if plan_intent().is_match(message) {
        Some(AgentMode::Plan)
    } else if auto_intent().is_match(message) {
        Some(AgentMode::Auto)
    } else if ask_intent().is_match(message) {
        Some(AgentMode::Ask)
    } else {
        None
    };

    // Data-level guard: never emit a non-inferrable mode
    detected.filter(|mode| mode.is_inferrable())
}

/// Whether the final assistant content should revert the given mode back
/// to the previously active one
pub fn should_auto_revert(mode: AgentMode, assistant_content: &str) -> bool {
    match mode {
        AgentMode::Plan => plan_presented().is_match(assistant_content),
        AgentMode::Auto => work_completed().is_match(assistant_content),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_intent() {
        assert_eq!(
            detect_mode_intent("please switch to plan mode"),
            Some(AgentMode::Plan)
        );
        assert_eq!(
            detect_mode_intent("can you make a plan for the refactor?"),
            Some(AgentMode::Plan)
        );
    }

    #[test]
    fn test_auto_intent() {
        assert_eq!(detect_mode_intent("just do it"), Some(AgentMode::Auto));
        assert_eq!(
            detect_mode_intent("stop asking and go"),
            Some(AgentMode::Auto)
        );
    }

    #[test]
    fn test_ask_intent() {
        assert_eq!(
            detect_mode_intent("ask me before changing anything"),
            Some(AgentMode::Ask)
        );
    }

    #[test]
    fn test_no_intent() {
        assert_eq!(detect_mode_intent("fix the login bug"), None);
    }

    #[test]
    fn test_sovereign_phrasing_is_not_inferrable() {
        assert_eq!(detect_mode_intent("switch to sovereign mode"), None);
        assert_eq!(detect_mode_intent("sovereign mode please, full access"), None);
    }

    #[test]
    fn test_plan_revert_on_presented_plan() {
        assert!(should_auto_revert(
            AgentMode::Plan,
            "Here's the plan:\n1. extract the parser\n2. add tests"
        ));
        assert!(!should_auto_revert(AgentMode::Plan, "What should I look at?"));
    }

    #[test]
    fn test_auto_revert_on_completion() {
        assert!(should_auto_revert(
            AgentMode::Auto,
            "All done - I implemented the retry logic and the tests pass."
        ));
        assert!(!should_auto_revert(AgentMode::Auto, "Working on it."));
    }

    #[test]
    fn test_ask_mode_never_auto_reverts() {
        assert!(!should_auto_revert(AgentMode::Ask, "done, implemented"));
    }
}
