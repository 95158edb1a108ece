// Error types for the podex runtime

use thiserror::Error;

/// Result type alias for core runtime operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in the core runtime
#[derive(Debug, Error)]
pub enum CoreError {
    /// LLM provider error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Storage / external store error
    #[error("Store error: {0}")]
    Store(String),

    /// Event emission error
    #[error("Event emission error: {0}")]
    Event(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Task loop terminated due to max iterations
    #[error("Max iterations ({0}) reached")]
    MaxIterationsReached(usize),

    /// Task was cancelled
    #[error("Task cancelled")]
    Cancelled,

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Agent cache is full and idle eviction freed nothing
    #[error("agent_limit_exceeded: cannot create agent {0}")]
    AgentLimitExceeded(String),

    /// Tool needs a workspace container but none is configured
    #[error("Workspace not configured for agent {0}")]
    WorkspaceRequired(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Create an LLM error
    pub fn llm(msg: impl Into<String>) -> Self {
        CoreError::Llm(msg.into())
    }

    /// Create a tool execution error
    pub fn tool(msg: impl Into<String>) -> Self {
        CoreError::ToolExecution(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        CoreError::Store(msg.into())
    }

    /// Create an event emission error
    pub fn event(msg: impl Into<String>) -> Self {
        CoreError::Event(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Configuration(msg.into())
    }
}
