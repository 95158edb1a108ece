// Long-term memory recall
//
// The orchestrator prepends recalled snippets as a system context block
// before each task. Recall is best effort: failures are logged by the
// caller and never fail the task.

use async_trait::async_trait;

use podex_core::Result;

/// One recalled memory snippet
#[derive(Debug, Clone)]
pub struct MemorySnippet {
    pub content: String,
    pub memory_type: String,
    pub importance: f32,
}

/// Retrieval seam to the external knowledge store
#[async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn recall(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>>;
}

/// No-op recall for tests and deployments without a knowledge store
pub struct NullMemoryRecall;

#[async_trait]
impl MemoryRecall for NullMemoryRecall {
    async fn recall(
        &self,
        _session_id: &str,
        _user_id: Option<&str>,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        Ok(Vec::new())
    }
}

/// Render snippets into the system context block prepended to a task
pub fn render_context_block(snippets: &[MemorySnippet]) -> Option<String> {
    if snippets.is_empty() {
        return None;
    }
    let mut block = String::from("Relevant context from earlier sessions:\n");
    for snippet in snippets {
        block.push_str("- ");
        block.push_str(&snippet.content);
        block.push('\n');
    }
    Some(block)
}
