// Agent permission modes
//
// The mode gates what a tool executor will do without asking the user.
// Sovereign can only be set through explicit configuration - it is excluded
// from INFERRABLE so the intent detector can never promote an agent to it.

use serde::{Deserialize, Serialize};

/// Agent operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Read-only: no file edits, no commands
    Plan,
    /// Requires approval for file edits and commands
    Ask,
    /// Auto file edits, commands require allowlist or approval
    Auto,
    /// Full access: all operations allowed
    Sovereign,
}

impl AgentMode {
    /// Modes an intent detector is allowed to produce. Sovereign is absent.
    pub const INFERRABLE: [AgentMode; 3] = [AgentMode::Plan, AgentMode::Ask, AgentMode::Auto];

    /// Whether this mode may be the result of inferred intent
    pub fn is_inferrable(self) -> bool {
        Self::INFERRABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Plan => "plan",
            AgentMode::Ask => "ask",
            AgentMode::Auto => "auto",
            AgentMode::Sovereign => "sovereign",
        }
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(AgentMode::Plan),
            "ask" => Ok(AgentMode::Ask),
            "auto" => Ok(AgentMode::Auto),
            "sovereign" => Ok(AgentMode::Sovereign),
            _ => Err(format!("Unknown agent mode: {}", s)),
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("plan".parse::<AgentMode>().unwrap(), AgentMode::Plan);
        assert_eq!("ASK".parse::<AgentMode>().unwrap(), AgentMode::Ask);
        assert_eq!("auto".parse::<AgentMode>().unwrap(), AgentMode::Auto);
        assert_eq!(
            "sovereign".parse::<AgentMode>().unwrap(),
            AgentMode::Sovereign
        );
        assert!("yolo".parse::<AgentMode>().is_err());
    }

    #[test]
    fn test_sovereign_is_never_inferrable() {
        assert!(!AgentMode::Sovereign.is_inferrable());
        assert!(AgentMode::Plan.is_inferrable());
        assert!(AgentMode::Ask.is_inferrable());
        assert!(AgentMode::Auto.is_inferrable());
    }

    #[test]
    fn test_mode_display_roundtrip() {
        for mode in [
            AgentMode::Plan,
            AgentMode::Ask,
            AgentMode::Auto,
            AgentMode::Sovereign,
        ] {
            assert_eq!(mode.to_string().parse::<AgentMode>().unwrap(), mode);
        }
    }
}
