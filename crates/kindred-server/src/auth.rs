//! Registration, login and token verification.
//!
//! Passwords are hashed with Argon2id (PHC string format); access tokens
//! are HS256 JWTs whose subject is the user id. The coordinator never sees
//! credentials, only verified identities.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::Json;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::info;

use kindred_shared::types::{normalize_interests, ChatPreference, PublicProfile, UserId, UserStatus};
use kindred_shared::ChatError;
use kindred_store::UserRecord;

use crate::api::AppState;
use crate::error::ApiError;

pub fn hash_password(password: &str) -> Result<String, ChatError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ChatError::Internal(format!("password hash: {e}")))
}

/// `Ok(true)` on match, `Ok(false)` on mismatch, error only for a
/// malformed stored hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, ChatError> {
    let parsed = argon2::PasswordHash::new(hash)
        .map_err(|e| ChatError::Internal(format!("invalid stored hash: {e}")))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(ChatError::Internal(format!("password verify: {e}"))),
    }
}

/// JWT claims for an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject -- user id (UUID string).
    pub sub: String,
    /// Issued-at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
}

pub fn issue_token(user: UserId, secret: &str, ttl_secs: i64) -> Result<String, ChatError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ChatError::Internal(format!("JWT encode: {e}")))
}

/// Decode and verify a token; any failure is `AuthRequired`.
pub fn verify_token(token: &str, secret: &str) -> Result<UserId, ChatError> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| ChatError::AuthRequired)?;
    data.claims
        .sub
        .parse::<UserId>()
        .map_err(|_| ChatError::AuthRequired)
}

/// Extractor for `Authorization: Bearer <token>`.
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError(ChatError::AuthRequired))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError(ChatError::AuthRequired))?;
        let user = verify_token(token, &state.config.jwt_secret)?;
        Ok(AuthUser(user))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub interests: Vec<String>,
    pub chat_preference: ChatPreference,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub profile: PublicProfile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub profile: PublicProfile,
    pub status: UserStatus,
    pub online: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProfileUpdateRequest {
    pub interests: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceUpdateRequest {
    pub chat_preference: ChatPreference,
}

fn validate_username(username: &str) -> Result<(), ChatError> {
    let ok_len = (3..=32).contains(&username.len());
    let ok_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok_len && ok_chars {
        Ok(())
    } else {
        Err(ChatError::InvalidContent(
            "username must be 3-32 characters (alphanumeric, '-' or '_')".into(),
        ))
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    validate_username(&req.username)?;
    if req.password.len() < 8 {
        return Err(ChatError::InvalidContent("password must be at least 8 characters".into()).into());
    }
    let interests: Vec<String> = normalize_interests(&req.interests).into_iter().collect();
    if interests.is_empty() {
        return Err(ChatError::InvalidContent("at least one interest is required".into()).into());
    }

    let password_hash = hash_password(&req.password)?;
    let now = Utc::now();
    let user = UserRecord {
        id: UserId::new(),
        username: req.username.clone(),
        password_hash,
        interests,
        chat_preference: req.chat_preference,
        online: false,
        status: UserStatus::Offline,
        last_active: now,
        created_at: now,
    };

    {
        let db = state.repo.db().lock().await;
        if db.get_user_by_username(&req.username).is_ok() {
            return Err(ChatError::InvalidContent("username already taken".into()).into());
        }
        db.create_user(&user)?;
    }

    info!(user = %user.id, username = %user.username, "user registered");
    let token = issue_token(user.id, &state.config.jwt_secret, state.token_ttl_secs())?;
    Ok(Json(AuthResponse {
        token,
        profile: user.public_profile(),
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user = {
        let db = state.repo.db().lock().await;
        db.get_user_by_username(&req.username)
            .map_err(|_| ChatError::AuthRequired)?
    };
    if !verify_password(&req.password, &user.password_hash)? {
        return Err(ChatError::AuthRequired.into());
    }

    let token = issue_token(user.id, &state.config.jwt_secret, state.token_ttl_secs())?;
    Ok(Json(AuthResponse {
        token,
        profile: user.public_profile(),
    }))
}

pub async fn me(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<MeResponse>, ApiError> {
    let user = {
        let db = state.repo.db().lock().await;
        db.get_user(user_id).map_err(|_| ChatError::AuthRequired)?
    };
    Ok(Json(MeResponse {
        profile: user.public_profile(),
        status: user.status,
        online: user.online,
    }))
}

pub async fn update_profile(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<ProfileUpdateRequest>,
) -> Result<Json<PublicProfile>, ApiError> {
    let interests = normalize_interests(&req.interests);
    if interests.is_empty() {
        return Err(ChatError::InvalidContent("at least one interest is required".into()).into());
    }
    let flat: Vec<String> = interests.iter().cloned().collect();

    let user = {
        let db = state.repo.db().lock().await;
        db.update_interests(user_id, &flat)?;
        db.get_user(user_id)?
    };
    state
        .coordinator
        .update_profile(user_id, interests, user.chat_preference)
        .await;

    Ok(Json(user.public_profile()))
}

pub async fn update_chat_preference(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<PreferenceUpdateRequest>,
) -> Result<Json<PublicProfile>, ApiError> {
    let user = {
        let db = state.repo.db().lock().await;
        db.update_chat_preference(user_id, req.chat_preference)?;
        db.get_user(user_id)?
    };
    state
        .coordinator
        .update_profile(
            user_id,
            user.interests.iter().cloned().collect(),
            req.chat_preference,
        )
        .await;

    Ok(Json(user.public_profile()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("hunter2-hunter2").unwrap();
        assert!(verify_password("hunter2-hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(verify_password("pw", "not-a-hash").is_err());
    }

    #[test]
    fn token_round_trip() {
        let user = UserId::new();
        let token = issue_token(user, "secret", 3600).unwrap();
        assert_eq!(verify_token(&token, "secret").unwrap(), user);
    }

    #[test]
    fn token_with_wrong_secret_rejected() {
        let token = issue_token(UserId::new(), "secret", 3600).unwrap();
        assert_eq!(
            verify_token(&token, "other").unwrap_err(),
            ChatError::AuthRequired
        );
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("ada_lovelace").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("has space").is_err());
    }
}
