// Repository layer for database operations
//
// Reconciler-driven status changes go through compare-and-set updates
// (UPDATE ... WHERE status = expected) so they never clobber a
// concurrent API-initiated transition.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============================================
    // Users
    // ============================================

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, password_hash, role, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, password_hash, role, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_user_config(&self, user_id: Uuid) -> Result<Option<UserConfigRow>> {
        let row = sqlx::query_as::<_, UserConfigRow>(
            r#"
            SELECT user_id, default_standby_timeout_minutes, standby_auto_delete_hours
            FROM user_configs
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // ============================================
    // Sessions
    // ============================================

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, owner_id, name, status, settings, template_id, git_url,
                   workspace_id, archived_at, created_at, updated_at
            FROM sessions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Archive a session and detach its workspace reference
    pub async fn archive_session(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'archived', archived_at = NOW(), workspace_id = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Workspaces
    // ============================================

    pub async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRow>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT id, session_id, owner_id, host_id, container_id, status,
                   cpu_limit, memory_limit_mib, disk_limit_gib, bandwidth_limit_mbps,
                   gpu_enabled, last_activity, standby_at, created_at, updated_at
            FROM workspaces
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Compare-and-set workspace status. Returns false when the row's
    /// status no longer matches `expected` (someone else moved it).
    pub async fn cas_workspace_status(
        &self,
        id: &str,
        expected: &str,
        next: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET status = $3,
                standby_at = CASE WHEN $3 = 'standby' THEN NOW() ELSE standby_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_workspace_activity(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workspaces SET last_activity = NOW(), updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_workspace(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM workspaces WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Reconciler queries
    // ============================================

    /// Running workspaces joined with session and owner standby settings
    pub async fn standby_candidates(&self) -> Result<Vec<StandbyCandidate>> {
        let rows = sqlx::query_as::<_, StandbyCandidate>(
            r#"
            SELECT w.id AS workspace_id,
                   s.id AS session_id,
                   s.owner_id AS owner_id,
                   w.last_activity,
                   w.created_at AS workspace_created_at,
                   (s.settings->>'standby_timeout_minutes')::int AS session_timeout_minutes,
                   uc.default_standby_timeout_minutes AS user_timeout_minutes
            FROM workspaces w
            JOIN sessions s ON s.workspace_id = w.id
            LEFT JOIN user_configs uc ON uc.user_id = s.owner_id
            WHERE w.status = 'running'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Active sessions whose workspaces should be live on a host
    pub async fn provision_candidates(&self) -> Result<Vec<ProvisionCandidate>> {
        let rows = sqlx::query_as::<_, ProvisionCandidate>(
            r#"
            SELECT w.id AS workspace_id,
                   s.id AS session_id,
                   s.owner_id AS owner_id,
                   w.status AS workspace_status,
                   s.template_id,
                   s.git_url,
                   s.settings
            FROM sessions s
            JOIN workspaces w ON s.workspace_id = w.id
            WHERE s.status = 'active'
              AND w.status IN ('running', 'creating', 'pending')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Agents currently marked running, with their status timestamps
    pub async fn running_agents(&self) -> Result<Vec<StuckAgentCandidate>> {
        let rows = sqlx::query_as::<_, StuckAgentCandidate>(
            r#"
            SELECT a.id AS agent_id,
                   a.session_id,
                   a.status_changed_at,
                   a.updated_at
            FROM agents a
            WHERE a.status = 'running'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Compare-and-set an agent's status
    pub async fn cas_agent_status(&self, id: &str, expected: &str, next: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET status = $3, status_changed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Running workspaces without recent activity, for health probing
    pub async fn health_candidates(&self, inactive_since: DateTime<Utc>) -> Result<Vec<HealthCandidate>> {
        let rows = sqlx::query_as::<_, HealthCandidate>(
            r#"
            SELECT w.id AS workspace_id,
                   s.id AS session_id,
                   s.owner_id AS owner_id
            FROM workspaces w
            JOIN sessions s ON s.workspace_id = w.id
            WHERE w.status = 'running'
              AND w.last_activity < $1
            "#,
        )
        .bind(inactive_since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Standby workspaces joined with the owner's cleanup override
    pub async fn cleanup_candidates(&self) -> Result<Vec<CleanupCandidate>> {
        let rows = sqlx::query_as::<_, CleanupCandidate>(
            r#"
            SELECT w.id AS workspace_id,
                   s.id AS session_id,
                   s.owner_id AS owner_id,
                   w.standby_at,
                   w.updated_at AS workspace_updated_at,
                   uc.standby_auto_delete_hours AS user_max_hours
            FROM workspaces w
            JOIN sessions s ON s.workspace_id = w.id
            LEFT JOIN user_configs uc ON uc.user_id = s.owner_id
            WHERE w.status = 'standby'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Usage quotas and records
    // ============================================

    /// Reset every quota whose reset_at has passed, advancing reset_at by
    /// the row's interval. Returns the number of rows reset.
    pub async fn reset_expired_quotas(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE usage_quotas
            SET current_usage = 0,
                reset_at = NOW() + make_interval(secs => reset_interval_seconds::double precision)
            WHERE reset_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn insert_usage_record(&self, record: &CreateUsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records
                (user_id, model, input_tokens, output_tokens, session_id,
                 workspace_id, agent_id, usage_source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(record.user_id)
        .bind(&record.model)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.session_id)
        .bind(&record.workspace_id)
        .bind(&record.agent_id)
        .bind(&record.usage_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Device sessions (refresh-token bookkeeping)
    // ============================================

    pub async fn create_device_session(
        &self,
        user_id: Uuid,
        refresh_token_jti: &str,
        device_name: Option<&str>,
    ) -> Result<DeviceSessionRow> {
        let row = sqlx::query_as::<_, DeviceSessionRow>(
            r#"
            INSERT INTO device_sessions (user_id, refresh_token_jti, device_name)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, refresh_token_jti, device_name, is_revoked, revoked_at, created_at
            "#,
        )
        .bind(user_id)
        .bind(refresh_token_jti)
        .bind(device_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_device_session_by_jti(&self, jti: &str) -> Result<Option<DeviceSessionRow>> {
        let row = sqlx::query_as::<_, DeviceSessionRow>(
            r#"
            SELECT id, user_id, refresh_token_jti, device_name, is_revoked, revoked_at, created_at
            FROM device_sessions
            WHERE refresh_token_jti = $1
            "#,
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Token rotation: point the device session at the new refresh jti
    pub async fn rotate_device_session(&self, id: Uuid, new_jti: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE device_sessions SET refresh_token_jti = $2 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_jti)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reuse detection compensating action: mark every live device
    /// session for the user revoked
    pub async fn revoke_all_device_sessions(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE device_sessions
            SET is_revoked = TRUE, revoked_at = NOW()
            WHERE user_id = $1 AND is_revoked = FALSE
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ============================================
    // User LLM API keys (encrypted at rest)
    // ============================================

    pub async fn upsert_user_llm_key(
        &self,
        user_id: Uuid,
        provider: &str,
        encrypted_key: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_llm_keys (user_id, provider, encrypted_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, provider) DO UPDATE SET encrypted_key = $3
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(encrypted_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_llm_keys(&self, user_id: Uuid) -> Result<Vec<UserLlmKeyRow>> {
        let rows = sqlx::query_as::<_, UserLlmKeyRow>(
            r#"
            SELECT user_id, provider, encrypted_key
            FROM user_llm_keys
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn delete_user_llm_key(&self, user_id: Uuid, provider: &str) -> Result<bool> {
        let result =
            sqlx::query(r#"DELETE FROM user_llm_keys WHERE user_id = $1 AND provider = $2"#)
                .bind(user_id)
                .bind(provider)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Memories
    // ============================================

    /// Recent high-importance memories for a session's owner, optionally
    /// filtered by a content match
    pub async fn recall_memories(
        &self,
        user_id: Uuid,
        query: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MemoryRow>> {
        let rows = match query {
            Some(query) if !query.trim().is_empty() => {
                let pattern = format!("%{}%", query.trim());
                sqlx::query_as::<_, MemoryRow>(
                    r#"
                    SELECT id, session_id, user_id, content, memory_type, importance, created_at
                    FROM memories
                    WHERE user_id = $1 AND content ILIKE $2
                    ORDER BY importance DESC, created_at DESC
                    LIMIT $3
                    "#,
                )
                .bind(user_id)
                .bind(&pattern)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            _ => {
                sqlx::query_as::<_, MemoryRow>(
                    r#"
                    SELECT id, session_id, user_id, content, memory_type, importance, created_at
                    FROM memories
                    WHERE user_id = $1
                    ORDER BY importance DESC, created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }
}
