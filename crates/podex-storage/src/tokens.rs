// Token service
//
// Signed bearer tokens with jti-based revocation in the kv store.
// Refresh rotation revokes the old jti; presenting an already-revoked
// refresh token is treated as theft and revokes every token the user
// holds. Revocation entries carry TTL equal to the token's remaining
// lifetime so the store stays bounded.

use std::sync::Arc;
use std::time::Duration;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use podex_core::Settings;

use crate::kv::KvStore;

const REVOKED_PREFIX: &str = "podex:revoked:";
const USER_TOKENS_PREFIX: &str = "podex:user_tokens:";

pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token revoked")]
    Revoked,

    #[error("Wrong token type: expected {expected}")]
    WrongType { expected: &'static str },

    /// Refresh-token reuse: the compensating action has already revoked
    /// every token for this user
    #[error("Token reuse detected for user {user_id}")]
    ReuseDetected { user_id: Uuid },

    #[error("Token store error: {0}")]
    Store(String),
}

pub type TokenResult<T> = std::result::Result<T, TokenError>;

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
    pub jti: String,
}

impl Claims {
    pub fn user_id(&self) -> TokenResult<Uuid> {
        self.sub
            .parse()
            .map_err(|_| TokenError::Invalid("sub is not a user id".to_string()))
    }

    /// Remaining lifetime from now; zero when already past exp
    pub fn remaining_ttl(&self) -> Duration {
        let remaining = self.exp - Utc::now().timestamp();
        Duration::from_secs(remaining.max(0) as u64)
    }
}

/// A freshly issued token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_in: Duration,
}

/// Access + refresh pair from login or rotation
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

/// Outcome of a successful refresh
#[derive(Debug, Clone)]
pub struct RotatedTokens {
    pub pair: TokenPair,
    pub user_id: Uuid,
    /// The now-revoked jti, for device-session rotation
    pub old_jti: String,
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
    kv: Arc<dyn KvStore>,
}

impl TokenService {
    pub fn new(settings: &Settings, kv: Arc<dyn KvStore>) -> Self {
        let algorithm = settings
            .jwt_algorithm
            .parse()
            .unwrap_or(Algorithm::HS256);
        Self {
            encoding_key: EncodingKey::from_secret(settings.jwt_secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.jwt_secret_key.as_bytes()),
            algorithm,
            access_ttl: Duration::from_secs(settings.access_token_expire_minutes * 60),
            refresh_ttl: Duration::from_secs(settings.refresh_token_expire_days * 86_400),
            kv,
        }
    }

    fn issue(&self, user_id: Uuid, role: &str, token_type: &str, ttl: Duration) -> TokenResult<IssuedToken> {
        let jti = Uuid::now_v7().to_string();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
            token_type: token_type.to_string(),
            jti: jti.clone(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        Ok(IssuedToken {
            token,
            jti,
            expires_in: ttl,
        })
    }

    /// Issue an access+refresh pair and register both jtis on the user's
    /// revocation set
    pub async fn issue_pair(&self, user_id: Uuid, role: &str) -> TokenResult<TokenPair> {
        let access = self.issue(user_id, role, TOKEN_TYPE_ACCESS, self.access_ttl)?;
        let refresh = self.issue(user_id, role, TOKEN_TYPE_REFRESH, self.refresh_ttl)?;

        let set_key = format!("{}{}", USER_TOKENS_PREFIX, user_id);
        self.kv
            .sadd_with_ttl(&set_key, &access.jti, self.refresh_ttl)
            .await
            .map_err(|e| TokenError::Store(e.to_string()))?;
        self.kv
            .sadd_with_ttl(&set_key, &refresh.jti, self.refresh_ttl)
            .await
            .map_err(|e| TokenError::Store(e.to_string()))?;

        Ok(TokenPair { access, refresh })
    }

    /// Decode and validate a token of the expected type, rejecting
    /// revoked jtis
    pub async fn decode(&self, token: &str, expected_type: &'static str) -> TokenResult<Claims> {
        let claims = self.decode_unchecked(token)?;
        if claims.token_type != expected_type {
            return Err(TokenError::WrongType {
                expected: expected_type,
            });
        }
        if self.is_revoked(&claims.jti).await? {
            return Err(TokenError::Revoked);
        }
        Ok(claims)
    }

    /// Signature and expiry validation only
    fn decode_unchecked(&self, token: &str) -> TokenResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::new(self.algorithm))
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        Ok(data.claims)
    }

    pub async fn is_revoked(&self, jti: &str) -> TokenResult<bool> {
        self.kv
            .exists(&format!("{}{}", REVOKED_PREFIX, jti))
            .await
            .map_err(|e| TokenError::Store(e.to_string()))
    }

    /// Revoke one jti for its remaining lifetime
    pub async fn revoke(&self, jti: &str, remaining_ttl: Duration) -> TokenResult<()> {
        self.kv
            .set_with_ttl(
                &format!("{}{}", REVOKED_PREFIX, jti),
                "1",
                remaining_ttl.max(Duration::from_secs(1)),
            )
            .await
            .map_err(|e| TokenError::Store(e.to_string()))
    }

    /// Revoke every registered token for a user
    pub async fn revoke_all_user_tokens(&self, user_id: Uuid) -> TokenResult<usize> {
        let set_key = format!("{}{}", USER_TOKENS_PREFIX, user_id);
        let jtis = self
            .kv
            .smembers(&set_key)
            .await
            .map_err(|e| TokenError::Store(e.to_string()))?;

        for jti in &jtis {
            // The precise per-token remainder is unknown here; the refresh
            // TTL is the upper bound for every registered jti
            self.revoke(jti, self.refresh_ttl).await?;
        }
        info!(user_id = %user_id, count = jtis.len(), "Revoked all user tokens");
        Ok(jtis.len())
    }

    /// Rotate a refresh token.
    ///
    /// A structurally valid refresh token whose jti is already revoked is
    /// evidence of theft: every token for the user is revoked and
    /// ReuseDetected is returned. Otherwise the old jti is revoked and a
    /// new pair issued.
    pub async fn refresh(&self, refresh_token: &str) -> TokenResult<RotatedTokens> {
        let claims = self.decode_unchecked(refresh_token)?;
        if claims.token_type != TOKEN_TYPE_REFRESH {
            return Err(TokenError::WrongType {
                expected: TOKEN_TYPE_REFRESH,
            });
        }
        let user_id = claims.user_id()?;

        if self.is_revoked(&claims.jti).await? {
            warn!(
                user_id = %user_id,
                jti = %&claims.jti[..claims.jti.len().min(8)],
                "Refresh token reuse detected - revoking all user tokens"
            );
            self.revoke_all_user_tokens(user_id).await?;
            return Err(TokenError::ReuseDetected { user_id });
        }

        // Rotation: the presented token is dead from here on
        self.revoke(&claims.jti, claims.remaining_ttl()).await?;

        let pair = self.issue_pair(user_id, &claims.role).await?;
        Ok(RotatedTokens {
            pair,
            user_id,
            old_jti: claims.jti,
        })
    }
}

/// Hash a password with argon2
pub fn hash_password(password: &str) -> TokenResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TokenError::Invalid(e.to_string()))
}

/// Verify a password against its argon2 hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn service() -> TokenService {
        let settings = Settings {
            jwt_secret_key: "test-secret".to_string(),
            jwt_algorithm: "HS256".to_string(),
            access_token_expire_minutes: 15,
            refresh_token_expire_days: 30,
            ..Settings::from_env()
        };
        TokenService::new(&settings, Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn test_issue_and_decode() {
        let svc = service();
        let user_id = Uuid::now_v7();
        let pair = svc.issue_pair(user_id, "user").await.unwrap();

        let claims = svc.decode(&pair.access.token, TOKEN_TYPE_ACCESS).await.unwrap();
        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.role, "user");

        // An access token is not a refresh token
        let err = svc
            .decode(&pair.access.token, TOKEN_TYPE_REFRESH)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::WrongType { .. }));
    }

    #[tokio::test]
    async fn test_revoked_jti_is_rejected_until_expiry() {
        let svc = service();
        let pair = svc.issue_pair(Uuid::now_v7(), "user").await.unwrap();

        svc.revoke(&pair.access.jti, Duration::from_secs(60))
            .await
            .unwrap();
        let err = svc
            .decode(&pair.access.token, TOKEN_TYPE_ACCESS)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Revoked));
    }

    #[tokio::test]
    async fn test_refresh_rotation() {
        let svc = service();
        let user_id = Uuid::now_v7();
        let pair = svc.issue_pair(user_id, "user").await.unwrap();

        let rotated = svc.refresh(&pair.refresh.token).await.unwrap();
        assert_eq!(rotated.user_id, user_id);
        assert_eq!(rotated.old_jti, pair.refresh.jti);

        // Old refresh jti is revoked, the new one is live
        assert!(svc.is_revoked(&pair.refresh.jti).await.unwrap());
        assert!(!svc.is_revoked(&rotated.pair.refresh.jti).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_reuse_revokes_everything() {
        let svc = service();
        let user_id = Uuid::now_v7();
        let pair = svc.issue_pair(user_id, "user").await.unwrap();

        let rotated = svc.refresh(&pair.refresh.token).await.unwrap();

        // Replay of the rotated-away token triggers the reuse path
        let err = svc.refresh(&pair.refresh.token).await.unwrap_err();
        assert!(matches!(err, TokenError::ReuseDetected { user_id: u } if u == user_id));

        // Compensating action: even the new pair is dead
        assert!(svc.is_revoked(&rotated.pair.access.jti).await.unwrap());
        assert!(svc.is_revoked(&rotated.pair.refresh.jti).await.unwrap());
        let err = svc
            .decode(&rotated.pair.access.token, TOKEN_TYPE_ACCESS)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Revoked));
    }

    #[tokio::test]
    async fn test_garbage_token_is_invalid() {
        let svc = service();
        let err = svc.decode("not-a-token", TOKEN_TYPE_ACCESS).await.unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
    }
}
