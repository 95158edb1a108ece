// Auth routes
//
// Login issues an access/refresh pair and a device session. Refresh
// rotates the pair; presenting an already-rotated refresh token is
// treated as theft and revokes every token and device session the user
// holds. Tokens travel as httpOnly cookies, with COOKIE_SECURE and
// COOKIE_SAMESITE controlling their attributes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use utoipa::ToSchema;

use podex_core::Settings;
use podex_storage::{verify_password, Database, TokenError, TokenPair, TokenService};

use crate::routes::internal_error;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tokens: Arc<TokenService>,
    pub settings: Settings,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/logout", post(logout))
        .with_state(state)
}

fn same_site(settings: &Settings) -> SameSite {
    match settings.cookie_samesite.to_lowercase().as_str() {
        "strict" => SameSite::Strict,
        "none" => SameSite::None,
        _ => SameSite::Lax,
    }
}

fn auth_cookies(jar: CookieJar, pair: &TokenPair, settings: &Settings) -> CookieJar {
    let build = |name: &'static str, value: String, max_age: std::time::Duration| {
        Cookie::build((name, value))
            .path("/")
            .http_only(true)
            .secure(settings.cookie_secure)
            .same_site(same_site(settings))
            .max_age(time::Duration::seconds(max_age.as_secs() as i64))
            .build()
    };

    jar.add(build(
        "access_token",
        pair.access.token.clone(),
        pair.access.expires_in,
    ))
    .add(build(
        "refresh_token",
        pair.refresh.token.clone(),
        pair.refresh.expires_in,
    ))
}

fn clear_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(("access_token", "")).path("/").build())
        .remove(Cookie::build(("refresh_token", "")).path("/").build())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

/// Password login
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses((status = 200, body = TokenResponse), (status = 401)),
    tag = "auth"
)]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<TokenResponse>), (StatusCode, Json<Value>)> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid email or password"})),
        )
    };

    let user = state
        .db
        .get_user_by_email(&request.email)
        .await
        .map_err(|e| internal_error("login lookup", e))?
        .ok_or_else(unauthorized)?;

    if !verify_password(&request.password, &user.password_hash) {
        return Err(unauthorized());
    }

    let pair = state
        .tokens
        .issue_pair(user.id, &user.role)
        .await
        .map_err(|e| internal_error("issue tokens", e))?;

    state
        .db
        .create_device_session(user.id, &pair.refresh.jti, None)
        .await
        .map_err(|e| internal_error("device session", e))?;

    let jar = auth_cookies(jar, &pair, &state.settings);
    Ok((
        jar,
        Json(TokenResponse {
            access_token: pair.access.token,
            refresh_token: pair.refresh.token,
            token_type: "bearer",
        }),
    ))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefreshRequest {
    /// Refresh token for clients that do not use cookies
    pub refresh_token: Option<String>,
}

/// Rotate the refresh token
#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    request_body = RefreshRequest,
    responses((status = 200, body = TokenResponse), (status = 401)),
    tag = "auth"
)]
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Option<Json<RefreshRequest>>,
) -> Result<(CookieJar, Json<TokenResponse>), (StatusCode, Json<Value>)> {
    let token = body
        .and_then(|Json(request)| request.refresh_token)
        .or_else(|| jar.get("refresh_token").map(|c| c.value().to_string()))
        .ok_or((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No refresh token provided"})),
        ))?;

    let rotated = match state.tokens.refresh(&token).await {
        Ok(rotated) => rotated,
        Err(TokenError::ReuseDetected { user_id }) => {
            // Compensating action: every device session dies with the tokens
            warn!(user_id = %user_id, "Refresh token reuse detected");
            state
                .db
                .revoke_all_device_sessions(user_id)
                .await
                .map_err(|e| internal_error("revoke device sessions", e))?;
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "detail": "Security alert: Token reuse detected. \
                               All sessions have been revoked. Please log in again."
                })),
            ));
        }
        Err(e) => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": e.to_string()})),
            ));
        }
    };

    // Rotation: point the device session at the new refresh jti
    if let Ok(Some(device_session)) = state
        .db
        .get_device_session_by_jti(&rotated.old_jti)
        .await
    {
        state
            .db
            .rotate_device_session(device_session.id, &rotated.pair.refresh.jti)
            .await
            .map_err(|e| internal_error("rotate device session", e))?;
    }

    let jar = auth_cookies(jar, &rotated.pair, &state.settings);
    Ok((
        jar,
        Json(TokenResponse {
            access_token: rotated.pair.access.token,
            refresh_token: rotated.pair.refresh.token,
            token_type: "bearer",
        }),
    ))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LogoutRequest {
    #[serde(default)]
    pub revoke_all_sessions: bool,
}

/// Logout; optionally revoke every session ("log out everywhere")
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    request_body = LogoutRequest,
    responses((status = 200)),
    tag = "auth"
)]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Option<Json<LogoutRequest>>,
) -> Result<(CookieJar, Json<Value>), (StatusCode, Json<Value>)> {
    let revoke_all = body.map(|Json(b)| b.revoke_all_sessions).unwrap_or(false);

    if let Some(cookie) = jar.get("access_token") {
        if let Ok(claims) = state
            .tokens
            .decode(cookie.value(), podex_storage::TOKEN_TYPE_ACCESS)
            .await
        {
            state
                .tokens
                .revoke(&claims.jti, claims.remaining_ttl())
                .await
                .map_err(|e| internal_error("revoke token", e))?;

            if revoke_all {
                if let Ok(user_id) = claims.user_id() {
                    state
                        .tokens
                        .revoke_all_user_tokens(user_id)
                        .await
                        .map_err(|e| internal_error("revoke all tokens", e))?;
                    state
                        .db
                        .revoke_all_device_sessions(user_id)
                        .await
                        .map_err(|e| internal_error("revoke device sessions", e))?;
                }
            }
        }
    }

    Ok((clear_cookies(jar), Json(json!({"success": true}))))
}
