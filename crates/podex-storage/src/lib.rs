// Podex Storage - Postgres repositories, kv store, tokens, encryption

pub mod adapters;
pub mod encryption;
pub mod kv;
pub mod models;
pub mod repositories;
pub mod tokens;

pub use adapters::{memory_recall, usage_sink, PgMemoryRecall, PgUsageSink};
pub use encryption::EncryptionService;
pub use kv::{
    load_tool_categories, InMemoryKv, KvStore, RedisApprovalBus, RedisKv, APPROVAL_CHANNEL,
    TOOL_CATEGORIES_KEY,
};
pub use models::*;
pub use repositories::Database;
pub use tokens::{
    hash_password, verify_password, Claims, IssuedToken, RotatedTokens, TokenError, TokenPair,
    TokenService, TokenResult, TOKEN_TYPE_ACCESS, TOKEN_TYPE_REFRESH,
};
