// Storage-backed implementations of the agent runtime seams

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use podex_agent::{MemoryRecall, MemorySnippet};
use podex_core::{CoreError, Result, UsageRecord, UsageSink};

use crate::models::CreateUsageRecord;
use crate::repositories::Database;

/// Postgres-backed long-term memory recall
pub struct PgMemoryRecall {
    db: Database,
}

impl PgMemoryRecall {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MemoryRecall for PgMemoryRecall {
    async fn recall(
        &self,
        _session_id: &str,
        user_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        let Some(user_id) = user_id.and_then(|id| id.parse().ok()) else {
            return Ok(Vec::new());
        };

        let rows = self
            .db
            .recall_memories(user_id, Some(query), limit as i64)
            .await
            .map_err(|e| CoreError::store(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| MemorySnippet {
                content: row.content,
                memory_type: row.memory_type,
                importance: row.importance as f32,
            })
            .collect())
    }
}

/// Postgres-backed usage sink
pub struct PgUsageSink {
    db: Database,
}

impl PgUsageSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UsageSink for PgUsageSink {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        let Ok(user_id) = record.user_id.parse() else {
            warn!(user_id = %record.user_id, "Skipping usage record with non-uuid user");
            return Ok(());
        };

        let insert = CreateUsageRecord {
            user_id,
            model: record.model,
            input_tokens: record.usage.input_tokens as i64,
            output_tokens: record.usage.output_tokens as i64,
            session_id: record.session_id.and_then(|id| id.parse().ok()),
            workspace_id: record.workspace_id,
            agent_id: record.agent_id,
            usage_source: match record.usage_source {
                podex_core::UsageSource::Included => "included".to_string(),
                podex_core::UsageSource::External => "external".to_string(),
                podex_core::UsageSource::Local => "local".to_string(),
            },
        };

        self.db
            .insert_usage_record(&insert)
            .await
            .map_err(|e| CoreError::store(e.to_string()))
    }
}

/// Convenience constructors used by startup wiring
pub fn memory_recall(db: Database) -> Arc<dyn MemoryRecall> {
    Arc::new(PgMemoryRecall::new(db))
}

pub fn usage_sink(db: Database) -> Arc<dyn UsageSink> {
    Arc::new(PgUsageSink::new(db))
}
