// Agent instances and the in-process agent cache
//
// One instance per agent id per process. The cache evicts entries idle
// longer than the configured TTL; when the cache is full, idle eviction
// runs first and a still-full cache rejects the new agent. Mode changes
// flow through update_mode - there is no other path that writes the mode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::info;

use podex_core::{AgentMode, CoreError, Message, MessageRole, Result, ToolDefinition};

/// Configuration an incoming task carries for its agent
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub role: String,
    pub model: String,
    pub mode: Option<AgentMode>,
    pub command_allowlist: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    /// Decrypted user API keys per provider, injected by the API layer
    pub llm_api_keys: Option<HashMap<String, String>>,
    pub tools: Vec<ToolDefinition>,
}

impl AgentConfig {
    /// Read agent configuration out of a task context map
    pub fn from_context(context: &HashMap<String, Value>) -> Self {
        let str_of = |key: &str| {
            context
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        Self {
            role: str_of("role").unwrap_or_else(|| "coder".to_string()),
            model: str_of("model").unwrap_or_else(|| "sonnet".to_string()),
            mode: str_of("mode").and_then(|m| m.parse().ok()),
            command_allowlist: context.get("command_allowlist").and_then(|v| {
                v.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(|s| s.to_string()))
                        .collect()
                })
            }),
            system_prompt: str_of("system_prompt"),
            workspace_id: str_of("workspace_id"),
            user_id: str_of("user_id"),
            llm_api_keys: context.get("llm_api_keys").and_then(|v| {
                v.as_object().map(|keys| {
                    keys.iter()
                        .filter_map(|(provider, key)| {
                            key.as_str().map(|k| (provider.clone(), k.to_string()))
                        })
                        .collect()
                })
            }),
            tools: Vec::new(),
        }
    }
}

/// A cached, stateful agent
#[derive(Debug, Clone)]
pub struct AgentInstance {
    pub agent_id: String,
    pub session_id: String,
    pub role: String,
    pub model: String,
    mode: AgentMode,
    previous_mode: Option<AgentMode>,
    /// Shared with the agent's tool executor so approval-granted commands
    /// persist on the instance
    pub command_allowlist: Arc<Mutex<Vec<String>>>,
    pub history: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
    pub llm_api_keys: Option<HashMap<String, String>>,
    pub last_activity: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(agent_id: impl Into<String>, session_id: impl Into<String>, config: &AgentConfig) -> Self {
        let mut history = Vec::new();
        if let Some(prompt) = &config.system_prompt {
            history.push(Message::text(MessageRole::System, prompt.clone()));
        }

        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            role: config.role.clone(),
            model: config.model.clone(),
            mode: config.mode.unwrap_or(AgentMode::Ask),
            previous_mode: None,
            command_allowlist: Arc::new(Mutex::new(
                config.command_allowlist.clone().unwrap_or_default(),
            )),
            history,
            tools: config.tools.clone(),
            workspace_id: config.workspace_id.clone(),
            user_id: config.user_id.clone(),
            llm_api_keys: config.llm_api_keys.clone(),
            last_activity: Utc::now(),
        }
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn previous_mode(&self) -> Option<AgentMode> {
        self.previous_mode
    }

    /// The canonical mode-update path. Explicit updates (settings, task
    /// config) clear any pending auto-revert.
    pub fn update_mode(&mut self, mode: AgentMode) {
        if self.mode != mode {
            info!(agent_id = %self.agent_id, from = %self.mode, to = %mode, "Agent mode updated");
        }
        self.mode = mode;
        self.previous_mode = None;
    }

    /// Mode switch produced by the intent detector. Remembers the prior
    /// mode for auto-revert. Non-inferrable modes are refused.
    pub fn apply_inferred_mode(&mut self, mode: AgentMode) -> bool {
        if !mode.is_inferrable() || mode == self.mode {
            return false;
        }
        info!(agent_id = %self.agent_id, from = %self.mode, to = %mode, "Mode switched by inferred intent");
        self.previous_mode = Some(self.mode);
        self.mode = mode;
        true
    }

    /// Restore the mode recorded before an inferred switch
    pub fn revert_mode(&mut self) -> Option<AgentMode> {
        let previous = self.previous_mode.take()?;
        info!(agent_id = %self.agent_id, from = %self.mode, to = %previous, "Mode auto-reverted");
        self.mode = previous;
        Some(previous)
    }

    /// Refresh per-task settings without rebuilding history
    pub fn refresh_from(&mut self, config: &AgentConfig) {
        if let Some(mode) = config.mode {
            self.update_mode(mode);
        }
        if let Some(allowlist) = &config.command_allowlist {
            *self.command_allowlist.lock().unwrap() = allowlist.clone();
        }
        if config.workspace_id.is_some() {
            self.workspace_id = config.workspace_id.clone();
        }
        if config.llm_api_keys.is_some() {
            self.llm_api_keys = config.llm_api_keys.clone();
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn allowlist_snapshot(&self) -> Vec<String> {
        self.command_allowlist.lock().unwrap().clone()
    }
}

/// In-process agent cache keyed by agent id
pub struct AgentCache {
    agents: HashMap<String, AgentInstance>,
    max_agents: usize,
    idle_ttl: Duration,
}

/// Result of an eviction sweep
#[derive(Debug, Default)]
pub struct Evicted {
    pub agent_ids: Vec<String>,
    /// Sessions that lost their last agent in this sweep
    pub emptied_sessions: Vec<String>,
}

impl AgentCache {
    pub fn new(max_agents: usize, idle_ttl: std::time::Duration) -> Self {
        Self {
            agents: HashMap::new(),
            max_agents,
            idle_ttl: Duration::from_std(idle_ttl).unwrap_or_else(|_| Duration::seconds(3600)),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get_mut(&mut self, agent_id: &str) -> Option<&mut AgentInstance> {
        self.agents.get_mut(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentInstance> {
        self.agents.get(agent_id)
    }

    /// Get an existing agent (refreshing task-scoped settings) or create
    /// one. A full cache evicts idle entries first; if that frees nothing
    /// the request fails with agent_limit_exceeded.
    pub fn get_or_create(
        &mut self,
        agent_id: &str,
        session_id: &str,
        config: &AgentConfig,
    ) -> Result<(&mut AgentInstance, Evicted)> {
        let mut evicted = Evicted::default();

        if !self.agents.contains_key(agent_id) {
            if self.agents.len() >= self.max_agents {
                evicted = self.evict_idle(Utc::now());
            }
            if self.agents.len() >= self.max_agents {
                return Err(CoreError::AgentLimitExceeded(agent_id.to_string()));
            }
            let instance = AgentInstance::new(agent_id, session_id, config);
            info!(agent_id = %agent_id, session_id = %session_id, "Created agent instance");
            self.agents.insert(agent_id.to_string(), instance);
        }

        let agent = self.agents.get_mut(agent_id).expect("just inserted");
        agent.refresh_from(config);
        Ok((agent, evicted))
    }

    /// Remove entries idle longer than the TTL
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> Evicted {
        let cutoff = now - self.idle_ttl;
        let stale: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, agent)| agent.last_activity < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Evicted::default();
        for id in stale {
            if let Some(agent) = self.agents.remove(&id) {
                info!(agent_id = %id, "Evicted idle agent");
                let session = agent.session_id.clone();
                evicted.agent_ids.push(id);
                if !self.agents.values().any(|a| a.session_id == session) {
                    evicted.emptied_sessions.push(session);
                }
            }
        }
        evicted
    }

    /// Remove every agent belonging to a session
    pub fn remove_session(&mut self, session_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, agent)| agent.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.agents.remove(id);
        }
        ids
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn config() -> AgentConfig {
        AgentConfig {
            role: "coder".to_string(),
            model: "sonnet".to_string(),
            mode: Some(AgentMode::Ask),
            ..Default::default()
        }
    }

    #[test]
    fn test_inferred_mode_records_previous() {
        let mut agent = AgentInstance::new("a1", "s1", &config());
        assert!(agent.apply_inferred_mode(AgentMode::Plan));
        assert_eq!(agent.mode(), AgentMode::Plan);
        assert_eq!(agent.previous_mode(), Some(AgentMode::Ask));

        assert_eq!(agent.revert_mode(), Some(AgentMode::Ask));
        assert_eq!(agent.mode(), AgentMode::Ask);
        assert_eq!(agent.previous_mode(), None);
    }

    #[test]
    fn test_inferred_sovereign_is_refused() {
        let mut agent = AgentInstance::new("a1", "s1", &config());
        assert!(!agent.apply_inferred_mode(AgentMode::Sovereign));
        assert_eq!(agent.mode(), AgentMode::Ask);
    }

    #[test]
    fn test_explicit_update_clears_pending_revert() {
        let mut agent = AgentInstance::new("a1", "s1", &config());
        agent.apply_inferred_mode(AgentMode::Plan);
        agent.update_mode(AgentMode::Auto);
        assert_eq!(agent.previous_mode(), None);
        assert_eq!(agent.revert_mode(), None);
    }

    #[test]
    fn test_cache_limit_with_no_idle_agents() {
        let mut cache = AgentCache::new(2, StdDuration::from_secs(3600));
        cache.get_or_create("a1", "s1", &config()).unwrap();
        cache.get_or_create("a2", "s1", &config()).unwrap();

        let err = cache.get_or_create("a3", "s2", &config()).unwrap_err();
        assert!(matches!(err, CoreError::AgentLimitExceeded(_)));
        // Existing agents are still reachable
        assert!(cache.get_or_create("a1", "s1", &config()).is_ok());
    }

    #[test]
    fn test_idle_eviction_frees_capacity_and_reports_empty_sessions() {
        let mut cache = AgentCache::new(2, StdDuration::from_secs(60));
        cache.get_or_create("a1", "s1", &config()).unwrap();
        cache.get_or_create("a2", "s2", &config()).unwrap();

        // Age a1 past the TTL
        cache.get_mut("a1").unwrap().last_activity = Utc::now() - Duration::seconds(120);

        let (_, evicted) = cache.get_or_create("a3", "s3", &config()).unwrap();
        assert_eq!(evicted.agent_ids, vec!["a1".to_string()]);
        assert_eq!(evicted.emptied_sessions, vec!["s1".to_string()]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_refresh_updates_mode_and_allowlist() {
        let mut cache = AgentCache::new(4, StdDuration::from_secs(3600));
        cache.get_or_create("a1", "s1", &config()).unwrap();

        let mut updated = config();
        updated.mode = Some(AgentMode::Auto);
        updated.command_allowlist = Some(vec!["npm".to_string()]);

        let (agent, _) = cache.get_or_create("a1", "s1", &updated).unwrap();
        assert_eq!(agent.mode(), AgentMode::Auto);
        assert_eq!(agent.allowlist_snapshot(), vec!["npm".to_string()]);
        // History was not rebuilt
        assert!(agent.history.is_empty());
    }

    #[test]
    fn test_remove_session() {
        let mut cache = AgentCache::new(4, StdDuration::from_secs(3600));
        cache.get_or_create("a1", "s1", &config()).unwrap();
        cache.get_or_create("a2", "s1", &config()).unwrap();
        cache.get_or_create("b1", "s2", &config()).unwrap();

        let mut removed = cache.remove_session("s1");
        removed.sort();
        assert_eq!(removed, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_agent_config_from_context() {
        let mut context = HashMap::new();
        context.insert("mode".to_string(), serde_json::json!("plan"));
        context.insert("model".to_string(), serde_json::json!("opus"));
        context.insert(
            "command_allowlist".to_string(),
            serde_json::json!(["ls", "cat"]),
        );
        context.insert("workspace_id".to_string(), serde_json::json!("ws-1"));

        let config = AgentConfig::from_context(&context);
        assert_eq!(config.mode, Some(AgentMode::Plan));
        assert_eq!(config.model, "opus");
        assert_eq!(
            config.command_allowlist,
            Some(vec!["ls".to_string(), "cat".to_string()])
        );
        assert_eq!(config.workspace_id.as_deref(), Some("ws-1"));
    }
}
