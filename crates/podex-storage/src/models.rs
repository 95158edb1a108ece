// Database row models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserConfigRow {
    pub user_id: Uuid,
    /// None falls back to the platform default of 60 minutes
    pub default_standby_timeout_minutes: Option<i32>,
    /// None falls back to STANDBY_MAX_HOURS_DEFAULT; 0 disables cleanup
    pub standby_auto_delete_hours: Option<i32>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub status: String,
    pub settings: Option<Value>,
    pub template_id: Option<String>,
    pub git_url: Option<String>,
    pub workspace_id: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkspaceRow {
    pub id: String,
    pub session_id: Option<Uuid>,
    pub owner_id: Uuid,
    pub host_id: Option<String>,
    pub container_id: Option<String>,
    pub status: String,
    pub cpu_limit: f64,
    pub memory_limit_mib: i64,
    pub disk_limit_gib: i64,
    pub bandwidth_limit_mbps: i32,
    pub gpu_enabled: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub standby_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: String,
    pub session_id: Uuid,
    pub role: String,
    pub model: String,
    pub status: String,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceSessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_jti: String,
    pub device_name: Option<String>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageQuotaRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub quota_type: String,
    pub current_usage: i64,
    pub quota_limit: i64,
    pub reset_interval_seconds: i64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub memory_type: String,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserLlmKeyRow {
    pub user_id: Uuid,
    pub provider: String,
    /// AES-256-GCM ciphertext, base64(nonce || ciphertext)
    pub encrypted_key: String,
}

/// Insert shape for token usage records
#[derive(Debug, Clone)]
pub struct CreateUsageRecord {
    pub user_id: Uuid,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub session_id: Option<Uuid>,
    pub workspace_id: Option<String>,
    pub agent_id: Option<String>,
    pub usage_source: String,
}

/// Row shape for the standby reconciler: running workspaces joined with
/// their session and the owner's config
#[derive(Debug, Clone, FromRow)]
pub struct StandbyCandidate {
    pub workspace_id: String,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub last_activity: Option<DateTime<Utc>>,
    pub workspace_created_at: DateTime<Utc>,
    pub session_timeout_minutes: Option<i32>,
    pub user_timeout_minutes: Option<i32>,
}

/// Row shape for the auto-provision reconciler
#[derive(Debug, Clone, FromRow)]
pub struct ProvisionCandidate {
    pub workspace_id: String,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub workspace_status: String,
    pub template_id: Option<String>,
    pub git_url: Option<String>,
    pub settings: Option<Value>,
}

/// Row shape for the agent watchdog
#[derive(Debug, Clone, FromRow)]
pub struct StuckAgentCandidate {
    pub agent_id: String,
    pub session_id: Uuid,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Row shape for the container health reconciler
#[derive(Debug, Clone, FromRow)]
pub struct HealthCandidate {
    pub workspace_id: String,
    pub session_id: Uuid,
    pub owner_id: Uuid,
}

/// Row shape for the standby cleanup reconciler
#[derive(Debug, Clone, FromRow)]
pub struct CleanupCandidate {
    pub workspace_id: String,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub standby_at: Option<DateTime<Utc>>,
    pub workspace_updated_at: DateTime<Utc>,
    pub user_max_hours: Option<i32>,
}
