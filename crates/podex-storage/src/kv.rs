// Key-value store and pub/sub
//
// Shared coordination state: token revocation entries (TTL = remaining
// token lifetime), per-user jti sets, the tool-category configuration,
// and the approval pub/sub topic. RedisKv backs production; InMemoryKv
// backs tests and single-host development.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use podex_agent::{ApprovalBus, ApprovalDecision};
use podex_core::{CoreError, Result, ToolCategories};

/// Config-store key holding the tool category JSON
pub const TOOL_CATEGORIES_KEY: &str = "podex:config:tool_categories";

/// Pub/sub channel carrying approval resolutions
pub const APPROVAL_CHANNEL: &str = "podex:approvals";

/// Key-value seam over the shared coordination store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Add to a set whose entries share the given TTL
    async fn sadd_with_ttl(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}

// ============================================================================
// Redis implementation
// ============================================================================

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CoreError::store(format!("redis: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::store(format!("redis connect: {}", e)))?;
        info!("Connected to redis");
        Ok(Self { conn })
    }
}

fn kv_err(e: redis::RedisError) -> CoreError {
    CoreError::store(format!("redis: {}", e))
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(kv_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(kv_err)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(kv_err)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(kv_err)
    }

    async fn sadd_with_ttl(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = conn.sadd(key, member).await.map_err(kv_err)?;
        let () = conn
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(kv_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await.map_err(kv_err)?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct InMemoryState {
    values: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, Vec<(String, Option<Instant>)>>,
}

/// Process-local store for tests and single-host deployments
#[derive(Default)]
pub struct InMemoryKv {
    state: StdMutex<InMemoryState>,
    subscribers: StdMutex<Vec<tokio::sync::mpsc::UnboundedSender<(String, String)>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every published message (channel, payload)
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<(String, String)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn expired(entry: &Option<Instant>) -> bool {
        entry.map(|deadline| Instant::now() > deadline).unwrap_or(false)
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        match state.values.get(key) {
            Some((_, deadline)) if Self::expired(deadline) => {
                state.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.state.lock().unwrap().values.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().unwrap().values.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn sadd_with_ttl(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let set = state.sets.entry(key.to_string()).or_default();
        set.retain(|(existing, deadline)| existing != member && !Self::expired(deadline));
        set.push((member.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .iter()
            .filter(|(_, deadline)| !Self::expired(deadline))
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| {
            tx.send((channel.to_string(), payload.to_string())).is_ok()
        });
        Ok(())
    }
}

// ============================================================================
// Tool categories
// ============================================================================

/// Load tool categories from the config store, falling back to the
/// built-in catalog. Callers memoize the result once per process.
pub async fn load_tool_categories(kv: &dyn KvStore) -> ToolCategories {
    match kv.get(TOOL_CATEGORIES_KEY).await {
        Ok(Some(raw)) => match serde_json::from_str::<ToolCategories>(&raw) {
            Ok(categories) => {
                info!("Tool categories loaded from config store");
                categories
            }
            Err(e) => {
                warn!(error = %e, "Malformed tool categories in config store, using builtin");
                ToolCategories::builtin()
            }
        },
        Ok(None) => {
            debug!("No tool categories configured, using builtin catalog");
            ToolCategories::builtin()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load tool categories, using builtin");
            ToolCategories::builtin()
        }
    }
}

// ============================================================================
// Distributed approval bus
// ============================================================================

/// Wire shape on the approval channel
#[derive(Debug, Serialize, Deserialize)]
struct ApprovalMessage {
    approval_id: String,
    approved: bool,
    #[serde(default)]
    add_to_allowlist: bool,
}

type Waiters = Arc<StdMutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>>;

/// Approval bus over redis pub/sub.
///
/// A resolution published by any process reaches the process holding the
/// waiter: resolve() publishes to the channel and the listener task
/// completes the local future when the message arrives.
pub struct RedisApprovalBus {
    kv: RedisKv,
    waiters: Waiters,
}

impl RedisApprovalBus {
    /// Connect and spawn the subscriber task
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let client =
            redis::Client::open(url).map_err(|e| CoreError::store(format!("redis: {}", e)))?;
        let kv = RedisKv::connect(url).await?;
        let waiters: Waiters = Arc::new(StdMutex::new(HashMap::new()));

        let bus = Arc::new(Self {
            kv,
            waiters: waiters.clone(),
        });

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| CoreError::store(format!("redis pubsub: {}", e)))?;
        pubsub
            .subscribe(APPROVAL_CHANNEL)
            .await
            .map_err(|e| CoreError::store(format!("redis subscribe: {}", e)))?;

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(error = %e, "Bad approval payload");
                        continue;
                    }
                };
                dispatch_approval(&waiters, &payload);
            }
            warn!("Approval subscriber stream ended");
        });

        Ok(bus)
    }
}

/// Complete the local waiter for a published resolution, if any
fn dispatch_approval(waiters: &Waiters, payload: &str) {
    let message: ApprovalMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "Unparseable approval message");
            return;
        }
    };

    let sender = waiters.lock().unwrap().remove(&message.approval_id);
    match sender {
        Some(tx) => {
            let _ = tx.send(ApprovalDecision {
                approved: message.approved,
                add_to_allowlist: message.add_to_allowlist,
            });
        }
        None => {
            // The wait lives in another process, or already resolved
            debug!(approval_id = %message.approval_id, "No local waiter for approval");
        }
    }
}

#[async_trait]
impl ApprovalBus for RedisApprovalBus {
    async fn register(&self, approval_id: &str) -> Result<oneshot::Receiver<ApprovalDecision>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(approval_id.to_string(), tx);
        Ok(rx)
    }

    async fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> Result<bool> {
        let payload = serde_json::to_string(&ApprovalMessage {
            approval_id: approval_id.to_string(),
            approved: decision.approved,
            add_to_allowlist: decision.add_to_allowlist,
        })
        .map_err(|e| CoreError::store(e.to_string()))?;

        self.kv.publish(APPROVAL_CHANNEL, &payload).await?;
        Ok(true)
    }

    async fn unregister(&self, approval_id: &str) {
        self.waiters.lock().unwrap().remove(approval_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_kv_ttl() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_set_membership() {
        let kv = InMemoryKv::new();
        kv.sadd_with_ttl("s", "a", Duration::from_secs(60))
            .await
            .unwrap();
        kv.sadd_with_ttl("s", "b", Duration::from_secs(60))
            .await
            .unwrap();
        // Re-adding replaces instead of duplicating
        kv.sadd_with_ttl("s", "a", Duration::from_secs(60))
            .await
            .unwrap();

        let mut members = kv.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_in_memory_publish_reaches_subscribers() {
        let kv = InMemoryKv::new();
        let mut rx = kv.subscribe();
        kv.publish("chan", "hello").await.unwrap();

        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, "chan");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn test_load_tool_categories_fallback() {
        let kv = InMemoryKv::new();
        let categories = load_tool_categories(&kv).await;
        assert!(categories.is_command("run_command"));
    }

    #[tokio::test]
    async fn test_load_tool_categories_from_store() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl(
            TOOL_CATEGORIES_KEY,
            r#"{"read_tools":[],"write_tools":["custom_write"],"command_tools":[],"deploy_tools":[],"groups":{}}"#,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let categories = load_tool_categories(&kv).await;
        assert!(categories.is_write("custom_write"));
        assert!(!categories.is_command("run_command"));
    }

    #[test]
    fn test_dispatch_approval_first_wins() {
        let waiters: Waiters = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        waiters.lock().unwrap().insert("ap-1".to_string(), tx);

        dispatch_approval(
            &waiters,
            r#"{"approval_id":"ap-1","approved":true,"add_to_allowlist":true}"#,
        );
        let decision = rx.try_recv().unwrap();
        assert!(decision.approved && decision.add_to_allowlist);

        // A second resolution finds no waiter and is dropped
        dispatch_approval(
            &waiters,
            r#"{"approval_id":"ap-1","approved":false,"add_to_allowlist":false}"#,
        );
        assert!(waiters.lock().unwrap().is_empty());
    }
}
