// Agent Orchestrator
//
// Owns the task map and the agent cache, both guarded by one coarse lock.
// A single worker drains the task queue and runs each task's agent loop:
// generate -> dispatch tool calls -> append results -> generate again,
// capped at max_iterations. Cancellation never interrupts an in-flight
// LLM or tool call - the finished result is discarded instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use podex_core::{
    extract::extract_inline_tool_calls, CompletionRequest, CompletionResponse, CoreError, Message,
    MessageRole, Result, ToolCall, ToolCategories,
};

use crate::agent::{AgentCache, AgentConfig, AgentInstance};
use crate::approval::{ApprovalBus, ApprovalDecision};
use crate::executor::{ApprovalCallback, LocalToolRegistry, RemoteToolBackend, ToolExecutor};
use crate::intent::{detect_mode_intent, should_auto_revert};
use crate::memory::{render_context_block, MemoryRecall};
use crate::task::{Task, TaskStatus};

// ============================================================================
// Seams
// ============================================================================

/// LLM completion seam. The production implementation resolves the
/// provider per request; tests script responses.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Session event seam (WebSocket hub in production)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, session_id: &str, event_type: &str, payload: Value) -> Result<()>;
}

/// No-op sink for tests
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _session_id: &str, _event_type: &str, _payload: Value) -> Result<()> {
        Ok(())
    }
}

/// Callback run when a session loses its last in-memory agent, so
/// session-scoped external state (tool-server connections) is torn down
pub type SessionTeardown = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// Requests and views
// ============================================================================

/// Task submission request
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub session_id: String,
    pub agent_id: String,
    pub message: String,
    pub context: HashMap<String, Value>,
}

/// One agent in a delegate fan-out
#[derive(Debug, Clone)]
pub struct DelegateAgent {
    pub id: String,
    pub role: String,
    pub model: String,
}

/// Externally visible task state
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub response: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tokens_used: u32,
    pub error: Option<String>,
}

/// Knobs for the orchestrator, filled from Settings at wiring
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_agents: usize,
    pub max_tasks: usize,
    pub agent_idle_ttl: Duration,
    pub task_ttl: Duration,
    pub max_iterations: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            max_tasks: 10_000,
            agent_idle_ttl: Duration::from_secs(3600),
            task_ttl: Duration::from_secs(3600),
            max_iterations: 10,
        }
    }
}

/// Shared dependencies for building per-agent tool executors
pub struct ExecutorDeps {
    pub categories: Arc<ToolCategories>,
    pub approval_bus: Arc<dyn ApprovalBus>,
    pub approval_callback: Option<ApprovalCallback>,
    pub remote: Arc<dyn RemoteToolBackend>,
    pub local: Arc<LocalToolRegistry>,
}

impl ExecutorDeps {
    fn build(&self, agent: &AgentInstance) -> ToolExecutor {
        ToolExecutor::new(
            agent.session_id.clone(),
            agent.agent_id.clone(),
            agent.user_id.clone(),
            agent.workspace_id.clone(),
            agent.mode(),
            agent.command_allowlist.clone(),
            self.categories.clone(),
            self.approval_bus.clone(),
            self.approval_callback.clone(),
            self.remote.clone(),
            self.local.clone(),
        )
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct State {
    tasks: HashMap<String, Task>,
    agents: AgentCache,
}

pub struct Orchestrator {
    state: Mutex<State>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown_tx: watch::Sender<bool>,
    llm: Arc<dyn LlmService>,
    memory: Arc<dyn MemoryRecall>,
    events: Arc<dyn EventSink>,
    executor_deps: ExecutorDeps,
    session_teardown: Option<SessionTeardown>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmService>,
        memory: Arc<dyn MemoryRecall>,
        events: Arc<dyn EventSink>,
        executor_deps: ExecutorDeps,
        session_teardown: Option<SessionTeardown>,
        config: OrchestratorConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                agents: AgentCache::new(config.max_agents, config.agent_idle_ttl),
            }),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            llm,
            memory,
            events,
            executor_deps,
            session_teardown,
            config,
        }
    }

    /// Spawn the single worker that drains the task queue, plus the
    /// periodic task sweep. Returns handles the host awaits on shutdown.
    pub async fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let worker = {
            let orchestrator = Arc::clone(self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut rx = orchestrator
                    .queue_rx
                    .lock()
                    .await
                    .take()
                    .expect("worker started twice");
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            info!("Task worker shutting down");
                            break;
                        }
                        next = rx.recv() => {
                            match next {
                                Some(task_id) => orchestrator.process_task(&task_id).await,
                                None => break,
                            }
                        }
                    }
                }
            })
        };
        handles.push(worker);

        let sweeper = {
            let orchestrator = Arc::clone(self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = interval.tick() => {
                            orchestrator.sweep_tasks().await;
                            orchestrator.evict_idle_agents().await;
                        }
                    }
                }
            })
        };
        handles.push(sweeper);

        handles
    }

    /// Signal worker and sweeper to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // ========================================================================
    // Public contract
    // ========================================================================

    /// Create a pending task and schedule it
    pub async fn submit(&self, request: TaskRequest) -> Result<String> {
        let task = Task::new(
            request.session_id,
            request.agent_id,
            request.message,
            request.context,
        );
        let task_id = task.id.clone();

        {
            let mut state = self.state.lock().await;
            state.tasks.insert(task_id.clone(), task);
        }

        self.queue_tx
            .send(task_id.clone())
            .map_err(|_| CoreError::store("Task queue closed"))?;

        Ok(task_id)
    }

    /// Look up a task's externally visible state
    pub async fn status(&self, task_id: &str) -> Option<TaskStatusView> {
        let state = self.state.lock().await;
        state.tasks.get(task_id).map(|task| TaskStatusView {
            task_id: task.id.clone(),
            status: task.status,
            response: task.result.clone(),
            tool_calls: task.tool_calls.clone(),
            tokens_used: task.tokens_used,
            error: task.error.clone(),
        })
    }

    /// Cancel a pending or running task. The in-flight call is not
    /// interrupted; its result is discarded when the worker finishes.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Err(CoreError::tool(format!(
                "Cannot cancel task in status {:?}",
                task.status
            )));
        }
        task.fail("Task cancelled");
        info!(task_id = %task_id, "Task cancelled");
        Ok(())
    }

    /// Cancel every non-terminal task belonging to an agent
    pub async fn cancel_agent_tasks(&self, agent_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let mut cancelled = 0;
        for task in state.tasks.values_mut() {
            if task.agent_id == agent_id && !task.status.is_terminal() {
                task.fail("Task cancelled");
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Fan one description out to a list of agents; returns task ids in
    /// the same order
    pub async fn delegate(
        &self,
        session_id: &str,
        description: &str,
        agents: &[DelegateAgent],
    ) -> Result<Vec<String>> {
        let mut task_ids = Vec::with_capacity(agents.len());
        for agent in agents {
            let mut context = HashMap::new();
            context.insert("role".to_string(), json!(agent.role));
            context.insert("model".to_string(), json!(agent.model));
            let task_id = self
                .submit(TaskRequest {
                    session_id: session_id.to_string(),
                    agent_id: agent.id.clone(),
                    message: description.to_string(),
                    context,
                })
                .await?;
            task_ids.push(task_id);
        }
        Ok(task_ids)
    }

    /// Remove every in-memory agent and task for a session and tear down
    /// session-scoped external state
    pub async fn cleanup(&self, session_id: &str) {
        let removed_agents = {
            let mut state = self.state.lock().await;
            state.tasks.retain(|_, task| task.session_id != session_id);
            state.agents.remove_session(session_id)
        };
        info!(
            session_id = %session_id,
            agents = removed_agents.len(),
            "Session cleaned up"
        );
        if let Some(teardown) = &self.session_teardown {
            teardown(session_id.to_string()).await;
        }
    }

    /// Resolve a pending approval (passthrough to the approval bus)
    pub async fn resolve_approval(
        &self,
        agent_id: &str,
        approval_id: &str,
        approved: bool,
        add_to_allowlist: bool,
    ) -> Result<bool> {
        info!(
            agent_id = %agent_id,
            approval_id = %approval_id,
            approved = approved,
            "Resolving approval"
        );
        self.executor_deps
            .approval_bus
            .resolve(
                approval_id,
                ApprovalDecision {
                    approved,
                    add_to_allowlist,
                },
            )
            .await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove terminal tasks older than the TTL; force-remove the oldest
    /// terminal tasks while over max_tasks. Pending/running are never swept.
    pub async fn sweep_tasks(&self) {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.task_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));

        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, task| !(task.status.is_terminal() && task.created_at < cutoff));

        if state.tasks.len() > self.config.max_tasks {
            let mut terminal: Vec<(String, chrono::DateTime<Utc>)> = state
                .tasks
                .iter()
                .filter(|(_, t)| t.status.is_terminal())
                .map(|(id, t)| (id.clone(), t.created_at))
                .collect();
            terminal.sort_by_key(|(_, created)| *created);

            let excess = state.tasks.len() - self.config.max_tasks;
            for (id, _) in terminal.into_iter().take(excess) {
                state.tasks.remove(&id);
            }
        }

        let swept = before - state.tasks.len();
        if swept > 0 {
            info!(count = swept, "Swept finished tasks");
        }
    }

    /// Evict idle agents and run session teardown for emptied sessions
    pub async fn evict_idle_agents(&self) {
        let evicted = {
            let mut state = self.state.lock().await;
            state.agents.evict_idle(Utc::now())
        };
        for session_id in evicted.emptied_sessions {
            if let Some(teardown) = &self.session_teardown {
                teardown(session_id).await;
            }
        }
    }

    // ========================================================================
    // Task loop
    // ========================================================================

    async fn process_task(&self, task_id: &str) {
        // Phase 1: mark running and resolve the agent
        let setup = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            if !task.transition(TaskStatus::Running) {
                // Cancelled (or otherwise terminal) before the worker got here
                return;
            }
            let session_id = task.session_id.clone();
            let agent_id = task.agent_id.clone();
            let message = task.message.clone();
            let config = AgentConfig::from_context(&task.context);

            match state.agents.get_or_create(&agent_id, &session_id, &config) {
                Ok((agent, evicted)) => {
                    let snapshot = AgentSnapshot {
                        session_id,
                        agent_id,
                        message,
                        model: agent.model.clone(),
                        user_id: agent.user_id.clone(),
                        workspace_id: agent.workspace_id.clone(),
                        llm_api_keys: agent.llm_api_keys.clone(),
                        history: agent.history.clone(),
                        tools: agent.tools.clone(),
                    };
                    Some((snapshot, evicted.emptied_sessions))
                }
                Err(e) => {
                    let error = e.to_string();
                    if let Some(task) = state.tasks.get_mut(task_id) {
                        task.fail(error);
                    }
                    None
                }
            }
        };

        let Some((snapshot, emptied_sessions)) = setup else {
            self.emit_agent_status(task_id, "error").await;
            return;
        };
        for session in emptied_sessions {
            if let Some(teardown) = &self.session_teardown {
                teardown(session).await;
            }
        }

        self.events
            .emit(
                &snapshot.session_id,
                "agent_status",
                json!({"agent_id": snapshot.agent_id, "status": "running"}),
            )
            .await
            .ok();

        // Phase 2: intent detection on the user message
        if let Some(intent) = detect_mode_intent(&snapshot.message) {
            let switched = {
                let mut state = self.state.lock().await;
                state
                    .agents
                    .get_mut(&snapshot.agent_id)
                    .map(|agent| agent.apply_inferred_mode(intent))
                    .unwrap_or(false)
            };
            if switched {
                self.events
                    .emit(
                        &snapshot.session_id,
                        "mode_change",
                        json!({
                            "agent_id": snapshot.agent_id,
                            "mode": intent.as_str(),
                            "inferred": true,
                        }),
                    )
                    .await
                    .ok();
            }
        }

        // Phase 3: run the loop without holding the lock
        let outcome = self.run_agent_loop(&snapshot).await;

        // Phase 4: commit, unless the task was cancelled meanwhile
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            info!(task_id = %task_id, "Discarding result of cancelled task");
            return;
        }

        match outcome {
            Ok(run) => {
                task.result = Some(run.final_content.clone());
                task.tool_calls = run.tool_calls;
                task.tokens_used = run.tokens_used;
                task.transition(TaskStatus::Completed);

                if let Some(agent) = state.agents.get_mut(&snapshot.agent_id) {
                    agent.history.extend(run.new_messages);
                    agent.touch();

                    // Auto-revert from the final assistant content
                    if should_auto_revert(agent.mode(), &run.final_content) {
                        if let Some(restored) = agent.revert_mode() {
                            let session_id = snapshot.session_id.clone();
                            let agent_id = snapshot.agent_id.clone();
                            let events = self.events.clone();
                            let payload = json!({
                                "agent_id": agent_id,
                                "mode": restored.as_str(),
                                "reverted": true,
                            });
                            drop(state);
                            events
                                .emit(&session_id, "mode_change", payload)
                                .await
                                .ok();
                            self.emit_agent_status(task_id, "completed").await;
                            return;
                        }
                    }
                }
                drop(state);
                self.emit_agent_status(task_id, "completed").await;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task failed");
                task.fail(e.to_string());
                let session_id = task.session_id.clone();
                let agent_id = task.agent_id.clone();
                let message = e.to_string();
                drop(state);
                self.events
                    .emit(
                        &session_id,
                        "agent_status",
                        json!({"agent_id": agent_id, "status": "error", "error": message}),
                    )
                    .await
                    .ok();
            }
        }
    }

    async fn emit_agent_status(&self, task_id: &str, status: &str) {
        let info = {
            let state = self.state.lock().await;
            state
                .tasks
                .get(task_id)
                .map(|t| (t.session_id.clone(), t.agent_id.clone()))
        };
        if let Some((session_id, agent_id)) = info {
            self.events
                .emit(
                    &session_id,
                    "agent_status",
                    json!({"agent_id": agent_id, "status": status}),
                )
                .await
                .ok();
        }
    }

    async fn run_agent_loop(&self, snapshot: &AgentSnapshot) -> Result<LoopOutcome> {
        // Long-term memory is best effort and never fatal
        let memory_block = match self
            .memory
            .recall(
                &snapshot.session_id,
                snapshot.user_id.as_deref(),
                &snapshot.message,
                5,
            )
            .await
        {
            Ok(snippets) => render_context_block(&snippets),
            Err(e) => {
                warn!(error = %e, "Memory recall failed, continuing without context");
                None
            }
        };

        let mut new_messages = vec![Message::text(MessageRole::User, snapshot.message.clone())];
        let mut all_tool_calls = Vec::new();
        let mut tokens_used = 0u32;

        // Executor reflects the agent's mode after intent detection
        let executor = {
            let mut state = self.state.lock().await;
            let agent = state
                .agents
                .get_mut(&snapshot.agent_id)
                .ok_or_else(|| CoreError::AgentNotFound(snapshot.agent_id.clone()))?;
            self.executor_deps.build(agent)
        };

        for iteration in 1..=self.config.max_iterations {
            let mut messages = Vec::new();
            if let Some(block) = &memory_block {
                messages.push(Message::text(MessageRole::System, block.clone()));
            }
            messages.extend(snapshot.history.iter().cloned());
            messages.extend(new_messages.iter().cloned());

            let mut request = CompletionRequest::new(snapshot.model.clone(), messages);
            request.tools = snapshot.tools.clone();
            request.user_id = snapshot.user_id.clone();
            request.session_id = Some(snapshot.session_id.clone());
            request.workspace_id = snapshot.workspace_id.clone();
            request.agent_id = Some(snapshot.agent_id.clone());
            request.llm_api_keys = snapshot.llm_api_keys.clone();

            let response = self.llm.complete(&request).await?;
            tokens_used += response.usage.total_tokens;

            // Providers without a native tool channel embed JSON in the text
            let extracted = extract_inline_tool_calls(&response.content);
            let content = extracted.content;
            let mut tool_calls = response.tool_calls;
            tool_calls.extend(extracted.tool_calls);

            if tool_calls.is_empty() {
                let final_content = content;
                new_messages.push(Message::text(MessageRole::Assistant, final_content.clone()));
                return Ok(LoopOutcome {
                    final_content,
                    tool_calls: all_tool_calls,
                    tokens_used,
                    new_messages,
                });
            }

            new_messages.push(Message::assistant_with_tool_calls(
                content.clone(),
                tool_calls.clone(),
            ));

            // Sequential dispatch in response order; results appended in
            // the same order before the next LLM call
            for call in &tool_calls {
                let result = executor.execute(&call.name, &call.arguments).await;
                new_messages.push(Message::tool_result(call.id.clone(), result));
            }
            all_tool_calls.extend(tool_calls);

            if iteration == self.config.max_iterations {
                return Err(CoreError::MaxIterationsReached(self.config.max_iterations));
            }
        }

        Err(CoreError::MaxIterationsReached(self.config.max_iterations))
    }
}

struct AgentSnapshot {
    session_id: String,
    agent_id: String,
    message: String,
    model: String,
    user_id: Option<String>,
    workspace_id: Option<String>,
    llm_api_keys: Option<std::collections::HashMap<String, String>>,
    history: Vec<Message>,
    tools: Vec<podex_core::ToolDefinition>,
}

struct LoopOutcome {
    final_content: String,
    tool_calls: Vec<ToolCall>,
    tokens_used: u32,
    new_messages: Vec<Message>,
}

// ============================================================================
// Production LlmService
// ============================================================================

/// Resolves the provider per request, runs the completion, and records
/// usage when the request carries a user id
pub struct ResolvingLlmService {
    settings: podex_core::Settings,
    usage: Arc<dyn podex_core::UsageSink>,
}

impl ResolvingLlmService {
    pub fn new(settings: podex_core::Settings, usage: Arc<dyn podex_core::UsageSink>) -> Self {
        Self { settings, usage }
    }
}

#[async_trait]
impl LlmService for ResolvingLlmService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let (driver, source) = podex_core::driver_for_request(request, &self.settings)?;
        let response = driver.complete(request).await?;

        if let Some(user_id) = &request.user_id {
            let record = podex_core::UsageRecord {
                user_id: user_id.clone(),
                model: request.model.clone(),
                usage: response.usage,
                session_id: request.session_id.clone(),
                workspace_id: request.workspace_id.clone(),
                agent_id: request.agent_id.clone(),
                usage_source: source,
            };
            if let Err(e) = self.usage.record(record).await {
                warn!(error = %e, "Failed to record token usage");
            }
        }

        Ok(response)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::InMemoryApprovalBus;
    use crate::memory::NullMemoryRecall;
    use podex_core::TokenUsage;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedLlm {
        responses: StdMutex<VecDeque<CompletionResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| text_response("ok")))
        }
    }

    struct EchoBackend;

    #[async_trait]
    impl RemoteToolBackend for EchoBackend {
        async fn execute(
            &self,
            _workspace_id: &str,
            _user_id: &str,
            tool_name: &str,
            _arguments: &Value,
        ) -> Result<Value> {
            Ok(json!({"success": true, "tool": tool_name}))
        }
    }

    fn text_response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            tool_calls: vec![],
            usage: TokenUsage::new(10, 5),
            stop_reason: Some("end_turn".to_string()),
        }
    }

    fn tool_response(tool: &str, args: Value) -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", tool),
                name: tool.to_string(),
                arguments: args,
            }],
            usage: TokenUsage::new(10, 5),
            stop_reason: Some("tool_use".to_string()),
        }
    }

    fn orchestrator(llm: Arc<dyn LlmService>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            llm,
            Arc::new(NullMemoryRecall),
            Arc::new(NullEventSink),
            ExecutorDeps {
                categories: Arc::new(ToolCategories::builtin()),
                approval_bus: Arc::new(InMemoryApprovalBus::new()),
                approval_callback: None,
                remote: Arc::new(EchoBackend),
                local: Arc::new(LocalToolRegistry::new()),
            },
            None,
            OrchestratorConfig {
                max_iterations: 5,
                ..Default::default()
            },
        ))
    }

    fn request_for(agent_id: &str, message: &str, mode: &str) -> TaskRequest {
        let mut context = HashMap::new();
        context.insert("mode".to_string(), json!(mode));
        context.insert("workspace_id".to_string(), json!("ws-1"));
        context.insert("user_id".to_string(), json!("user-1"));
        TaskRequest {
            session_id: "sess-1".to_string(),
            agent_id: agent_id.to_string(),
            message: message.to_string(),
            context,
        }
    }

    async fn await_terminal(orch: &Orchestrator, task_id: &str) -> TaskStatusView {
        for _ in 0..200 {
            if let Some(view) = orch.status(task_id).await {
                if view.status.is_terminal() {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never reached a terminal status", task_id);
    }

    #[tokio::test]
    async fn test_plan_mode_denial_completes_task() {
        // Scenario: plan-mode agent, LLM asks to write a file, executor
        // blocks it, LLM acknowledges, task completes.
        let llm = ScriptedLlm::new(vec![
            tool_response("write_file", json!({"path": "a.py", "content": "..."})),
            text_response("I can't edit files in plan mode."),
        ]);
        let orch = orchestrator(llm);
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "fix the bug", "plan"))
            .await
            .unwrap();
        let view = await_terminal(&orch, &task_id).await;

        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(
            view.response.as_deref(),
            Some("I can't edit files in plan mode.")
        );
        assert_eq!(view.tool_calls.len(), 1);

        // The tool result recorded the mode denial
        let state = orch.state.lock().await;
        let agent = state.agents.get("agent-1").unwrap();
        let denial = agent
            .history
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert!(denial.content.contains("blocked_by_mode"));
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_max_iterations_fails_task() {
        // LLM keeps asking for tools forever
        let llm = ScriptedLlm::new(
            (0..10)
                .map(|_| tool_response("read_file", json!({"path": "x"})))
                .collect(),
        );
        let orch = orchestrator(llm);
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "loop forever", "sovereign"))
            .await
            .unwrap();
        let view = await_terminal(&orch, &task_id).await;

        assert_eq!(view.status, TaskStatus::Failed);
        assert!(view.error.as_deref().unwrap().contains("Max iterations"));
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_inline_tool_call_extraction_in_loop() {
        let llm = ScriptedLlm::new(vec![
            CompletionResponse {
                content: "Let me check.\n```json\n{\"name\": \"read_file\", \"arguments\": {\"path\": \"a.py\"}}\n```"
                    .to_string(),
                tool_calls: vec![],
                usage: TokenUsage::new(5, 5),
                stop_reason: None,
            },
            text_response("The file looks fine."),
        ]);
        let orch = orchestrator(llm);
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "check a.py", "sovereign"))
            .await
            .unwrap();
        let view = await_terminal(&orch, &task_id).await;

        assert_eq!(view.status, TaskStatus::Completed);
        // The extracted call executed and the JSON was stripped
        assert_eq!(view.tool_calls.len(), 1);
        assert_eq!(view.tool_calls[0].name, "read_file");

        let state = orch.state.lock().await;
        let agent = state.agents.get("agent-1").unwrap();
        let assistant_turn = agent
            .history
            .iter()
            .find(|m| m.role == MessageRole::Assistant && m.tool_calls.is_some())
            .unwrap();
        assert!(!assistant_turn.content.contains("read_file"));
        assert!(assistant_turn.content.contains("Let me check."));
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let orch = orchestrator(ScriptedLlm::new(vec![]));
        // Worker not started: task stays pending
        let task_id = orch
            .submit(request_for("agent-1", "hello", "ask"))
            .await
            .unwrap();

        orch.cancel(&task_id).await.unwrap();
        let view = orch.status(&task_id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("Task cancelled"));

        // Cancelling again conflicts
        assert!(orch.cancel(&task_id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let orch = orchestrator(ScriptedLlm::new(vec![]));
        let err = orch.cancel("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancelled_task_result_is_discarded() {
        let orch = orchestrator(ScriptedLlm::new(vec![text_response("too late")]));
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "hello", "ask"))
            .await
            .unwrap();
        // Race the worker: cancel as soon as possible. Whether the worker
        // got there first or not, a cancelled task never reports a result
        // from a run that finished after cancellation.
        let _ = orch.cancel(&task_id).await;
        let view = await_terminal(&orch, &task_id).await;
        if view.status == TaskStatus::Failed {
            assert!(view.response.is_none());
        }
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_delegate_fans_out() {
        let orch = orchestrator(ScriptedLlm::new(vec![]));
        let agents = vec![
            DelegateAgent {
                id: "researcher".to_string(),
                role: "researcher".to_string(),
                model: "haiku".to_string(),
            },
            DelegateAgent {
                id: "coder".to_string(),
                role: "coder".to_string(),
                model: "sonnet".to_string(),
            },
        ];
        let ids = orch
            .delegate("sess-1", "split this work", &agents)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let view = orch.status(&ids[0]).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cleanup_removes_session_state() {
        let llm = ScriptedLlm::new(vec![text_response("done")]);
        let orch = orchestrator(llm);
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "hello", "ask"))
            .await
            .unwrap();
        await_terminal(&orch, &task_id).await;

        orch.cleanup("sess-1").await;
        assert!(orch.status(&task_id).await.is_none());
        let state = orch.state.lock().await;
        assert!(state.agents.is_empty());
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_removes_old_terminal_tasks_only() {
        let orch = Arc::new(Orchestrator::new(
            ScriptedLlm::new(vec![]),
            Arc::new(NullMemoryRecall),
            Arc::new(NullEventSink),
            ExecutorDeps {
                categories: Arc::new(ToolCategories::builtin()),
                approval_bus: Arc::new(InMemoryApprovalBus::new()),
                approval_callback: None,
                remote: Arc::new(EchoBackend),
                local: Arc::new(LocalToolRegistry::new()),
            },
            None,
            OrchestratorConfig {
                task_ttl: Duration::from_secs(0),
                ..Default::default()
            },
        ));

        let done_id = orch
            .submit(request_for("agent-1", "old", "ask"))
            .await
            .unwrap();
        let pending_id = orch
            .submit(request_for("agent-1", "new", "ask"))
            .await
            .unwrap();
        {
            let mut state = orch.state.lock().await;
            let task = state.tasks.get_mut(&done_id).unwrap();
            task.transition(TaskStatus::Running);
            task.transition(TaskStatus::Completed);
            task.created_at = Utc::now() - chrono::Duration::hours(2);
        }

        orch.sweep_tasks().await;

        assert!(orch.status(&done_id).await.is_none());
        // Pending tasks are never swept
        assert!(orch.status(&pending_id).await.is_some());
    }

    #[tokio::test]
    async fn test_intent_switch_and_auto_revert() {
        // User asks for plan mode; the agent presents a plan; mode reverts.
        let llm = ScriptedLlm::new(vec![text_response(
            "Here's the plan:\n1. read the code\n2. propose a fix",
        )]);
        let orch = orchestrator(llm);
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "switch to plan mode please", "ask"))
            .await
            .unwrap();
        let view = await_terminal(&orch, &task_id).await;
        assert_eq!(view.status, TaskStatus::Completed);

        let state = orch.state.lock().await;
        let agent = state.agents.get("agent-1").unwrap();
        // Switched to plan for the turn, reverted to ask afterwards
        assert_eq!(agent.mode(), podex_core::AgentMode::Ask);
        assert_eq!(agent.previous_mode(), None);
        orch.shutdown();
    }

    #[tokio::test]
    async fn test_tokens_accumulate_across_iterations() {
        let llm = ScriptedLlm::new(vec![
            tool_response("read_file", json!({"path": "x"})),
            text_response("done reading"),
        ]);
        let orch = orchestrator(llm);
        orch.start().await;

        let task_id = orch
            .submit(request_for("agent-1", "read it", "sovereign"))
            .await
            .unwrap();
        let view = await_terminal(&orch, &task_id).await;
        // Two completions at 15 total tokens each
        assert_eq!(view.tokens_used, 30);
        orch.shutdown();
    }
}
