// Tool types and category configuration
//
// Tool categories come from the shared config store as data. The executor
// never hardcodes which tool belongs where; the built-in catalog below is
// only the fallback for deployments that have not seeded the store.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool call emitted by an LLM (vendor-independent shape)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments object. Vendors returning JSON text have it parsed
    /// upstream; malformed JSON becomes {} and is logged.
    pub arguments: Value,
}

/// A tool schema advertised to the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Action type attached to approval requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FileWrite,
    CommandExecute,
    Other,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::FileWrite => "file_write",
            ActionType::CommandExecute => "command_execute",
            ActionType::Other => "other",
        }
    }
}

/// Tool category membership, loaded once per process from the config store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCategories {
    #[serde(default)]
    pub read_tools: HashSet<String>,
    #[serde(default)]
    pub write_tools: HashSet<String>,
    #[serde(default)]
    pub command_tools: HashSet<String>,
    #[serde(default)]
    pub deploy_tools: HashSet<String>,
    /// Named groups (git, memory, web, vision, skill, health, orchestrator, ...)
    #[serde(default)]
    pub groups: HashMap<String, HashSet<String>>,
}

impl ToolCategories {
    pub fn is_write(&self, tool: &str) -> bool {
        self.write_tools.contains(tool)
    }

    pub fn is_command(&self, tool: &str) -> bool {
        self.command_tools.contains(tool)
    }

    pub fn is_deploy(&self, tool: &str) -> bool {
        self.deploy_tools.contains(tool)
    }

    pub fn in_group(&self, group: &str, tool: &str) -> bool {
        self.groups
            .get(group)
            .map(|tools| tools.contains(tool))
            .unwrap_or(false)
    }

    /// Action type reported in approval requests for a tool
    pub fn action_type(&self, tool: &str) -> ActionType {
        if self.is_write(tool) {
            ActionType::FileWrite
        } else if self.is_command(tool) {
            ActionType::CommandExecute
        } else {
            ActionType::Other
        }
    }

    /// Built-in catalog used when the config store has no entry
    pub fn builtin() -> Self {
        fn set(names: &[&str]) -> HashSet<String> {
            names.iter().map(|s| s.to_string()).collect()
        }

        let mut groups = HashMap::new();
        groups.insert(
            "git".to_string(),
            set(&[
                "git_status",
                "git_commit",
                "git_push",
                "git_branch",
                "git_diff",
                "git_log",
                "create_pr",
            ]),
        );
        groups.insert(
            "memory".to_string(),
            set(&[
                "store_memory",
                "recall_memory",
                "update_memory",
                "delete_memory",
                "get_session_memories",
            ]),
        );
        groups.insert(
            "web".to_string(),
            set(&[
                "fetch_url",
                "screenshot_page",
                "search_web",
                "interact_with_page",
                "extract_page_data",
            ]),
        );
        groups.insert(
            "vision".to_string(),
            set(&["analyze_screenshot", "design_to_code"]),
        );
        groups.insert(
            "skill".to_string(),
            set(&[
                "list_skills",
                "get_skill",
                "match_skills",
                "execute_skill",
                "create_skill",
                "delete_skill",
            ]),
        );
        groups.insert(
            "health".to_string(),
            set(&[
                "analyze_project_health",
                "get_health_score",
                "apply_health_fix",
                "list_health_checks",
            ]),
        );
        groups.insert(
            "orchestrator".to_string(),
            set(&[
                "create_execution_plan",
                "delegate_task",
                "create_custom_agent",
                "delegate_to_custom_agent",
                "get_subagent_status",
                "wait_for_subagents",
                "get_active_subagents",
                "synthesize_results",
            ]),
        );
        groups.insert(
            "agent_builder".to_string(),
            set(&[
                "create_agent_template",
                "list_available_tools",
                "preview_agent_template",
            ]),
        );
        groups.insert(
            "filesystem".to_string(),
            set(&[
                "read_file",
                "write_file",
                "list_directory",
                "search_code",
                "glob_files",
                "grep",
                "apply_patch",
            ]),
        );

        Self {
            read_tools: set(&[
                "read_file",
                "list_directory",
                "search_code",
                "glob_files",
                "grep",
                "git_status",
                "git_diff",
                "git_log",
            ]),
            write_tools: set(&["write_file", "apply_patch"]),
            command_tools: set(&["run_command"]),
            deploy_tools: set(&[
                "deploy_preview",
                "stop_preview",
                "run_e2e_tests",
                "rollback_deploy",
            ]),
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_action_types() {
        let cats = ToolCategories::builtin();
        assert_eq!(cats.action_type("write_file"), ActionType::FileWrite);
        assert_eq!(cats.action_type("run_command"), ActionType::CommandExecute);
        assert_eq!(cats.action_type("recall_memory"), ActionType::Other);
    }

    #[test]
    fn test_group_membership() {
        let cats = ToolCategories::builtin();
        assert!(cats.in_group("git", "git_commit"));
        assert!(cats.in_group("filesystem", "read_file"));
        assert!(!cats.in_group("git", "write_file"));
        assert!(!cats.in_group("nope", "git_commit"));
    }

    #[test]
    fn test_categories_deserialize_from_config_json() {
        let json = serde_json::json!({
            "read_tools": ["read_file"],
            "write_tools": ["write_file"],
            "command_tools": ["run_command"],
            "deploy_tools": [],
            "groups": {"git": ["git_status"]}
        });
        let cats: ToolCategories = serde_json::from_value(json).unwrap();
        assert!(cats.is_write("write_file"));
        assert!(cats.in_group("git", "git_status"));
        assert!(!cats.is_deploy("deploy_preview"));
    }
}
