// Podex Agent - orchestrator, agent cache, tool executor, approvals
//
// The orchestrator accepts tasks and runs each task's agent loop to
// completion; the tool executor gates every tool call by mode and routes
// workspace tools to the compute service; the approval bus carries
// out-of-band user approvals.

pub mod agent;
pub mod approval;
pub mod executor;
pub mod intent;
pub mod memory;
pub mod orchestrator;
pub mod task;

pub use agent::{AgentCache, AgentConfig, AgentInstance};
pub use approval::{ApprovalBus, ApprovalDecision, ApprovalRequest, InMemoryApprovalBus};
pub use executor::{
    check_permission, is_command_allowed, ApprovalCallback, LocalHandler, LocalToolRegistry,
    PermissionCheck, RemoteToolBackend, ToolContext, ToolExecutor,
};
pub use intent::{detect_mode_intent, should_auto_revert};
pub use memory::{MemoryRecall, MemorySnippet, NullMemoryRecall};
pub use orchestrator::{
    DelegateAgent, EventSink, ExecutorDeps, LlmService, NullEventSink, Orchestrator,
    OrchestratorConfig, ResolvingLlmService, SessionTeardown, TaskRequest, TaskStatusView,
};
pub use task::{Task, TaskStatus};
