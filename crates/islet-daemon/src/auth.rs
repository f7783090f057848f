//! Auth gate: bearer credentials to tenant identity.
//!
//! Two credential shapes share the `Authorization: Bearer` header. Tokens
//! starting with `sk_` are long-lived API keys, resolved by prefix and
//! verified with a constant-time digest compare. Everything else is treated
//! as a signed HS256 session token whose subject is the user id.

use std::fmt;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use islet_db::{ApiKeyRecord, Database, NewApiKey, NewUser, UserRecord};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Well-known API key prefix; prefix lookup uses the first 12 characters.
pub const API_KEY_PREFIX: &str = "sk_";
const API_KEY_RANDOM_LEN: usize = 40;
const PREFIX_LOOKUP_LEN: usize = 12;
const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Tenant identity attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub trace_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct AuthGate {
    db: Database,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    header: Header,
}

impl AuthGate {
    pub fn new(db: Database, session_secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            db,
            encoding: EncodingKey::from_secret(session_secret),
            decoding: DecodingKey::from_secret(session_secret),
            validation,
            header: Header::new(Algorithm::HS256),
        }
    }

    /// Resolves a bearer token to an identity.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthorized);
        }
        if token.starts_with(API_KEY_PREFIX) {
            self.authenticate_api_key(token).await
        } else {
            self.authenticate_session(token).await
        }
    }

    async fn authenticate_api_key(&self, token: &str) -> Result<Identity, AuthError> {
        if token.len() < PREFIX_LOOKUP_LEN {
            return Err(AuthError::Unauthorized);
        }
        let prefix = &token[..PREFIX_LOOKUP_LEN];
        let candidates = self
            .db
            .find_api_keys_by_prefix(prefix)
            .await
            .map_err(internal)?;

        let digest = hash_secret(token);
        for candidate in candidates {
            if constant_time_eq(&digest, &candidate.secret_hash) {
                if let Err(err) = self.db.touch_api_key_usage(candidate.id, Utc::now()).await {
                    warn!(error = %err, "failed to touch api key usage");
                }
                return Ok(Identity {
                    user_id: candidate.user_id,
                    api_key_id: Some(candidate.id),
                    trace_id: Uuid::new_v4(),
                });
            }
        }
        Err(AuthError::Unauthorized)
    }

    async fn authenticate_session(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(|_| AuthError::Unauthorized)?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::Unauthorized)?;

        // The subject must still exist; tokens do not outlive their user.
        self.db
            .fetch_user(user_id)
            .await
            .map_err(internal)?
            .ok_or(AuthError::Unauthorized)?;

        Ok(Identity {
            user_id,
            api_key_id: None,
            trace_id: Uuid::new_v4(),
        })
    }

    /// Creates a user with an argon2id password verifier.
    pub async fn signup(&self, email: &str, password: &str) -> Result<UserRecord, SignupError> {
        let salt = salt_string()?;
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| SignupError::Internal(err.to_string()))?
            .to_string();

        self.db
            .create_user(NewUser {
                email,
                password_hash: &hash,
            })
            .await
            .map_err(|err| match err {
                islet_db::StoreError::Duplicate { .. } => SignupError::EmailTaken,
                other => SignupError::Internal(other.to_string()),
            })
    }

    /// Verifies credentials and issues a session token.
    pub async fn login(&self, email: &str, password: &str) -> Result<(UserRecord, String), AuthError> {
        let user = self
            .db
            .find_user_by_email(email)
            .await
            .map_err(internal)?
            .ok_or(AuthError::Unauthorized)?;

        let parsed =
            PasswordHash::new(&user.password_hash).map_err(|err| internal(err.to_string()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AuthError::Unauthorized)?;

        let token = self.issue_session(user.id)?;
        Ok((user, token))
    }

    pub fn issue_session(&self, user_id: Uuid) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(SESSION_TTL_HOURS)).timestamp(),
        };
        jsonwebtoken::encode(&self.header, &claims, &self.encoding)
            .map_err(|err| internal(err.to_string()))
    }

    /// Mints an API key. The full token is returned exactly once.
    pub async fn issue_api_key(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<(String, ApiKeyRecord), AuthError> {
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(API_KEY_RANDOM_LEN)
            .map(char::from)
            .collect();
        let token = format!("{API_KEY_PREFIX}{random}");
        let prefix: String = token.chars().take(PREFIX_LOOKUP_LEN).collect();
        let hash = hash_secret(&token);

        let record = self
            .db
            .insert_api_key(NewApiKey {
                user_id,
                key_prefix: &prefix,
                secret_hash: &hash,
                name,
            })
            .await
            .map_err(internal)?;
        Ok((token, record))
    }

    pub async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>, AuthError> {
        self.db.list_api_keys(user_id).await.map_err(internal)
    }

    pub async fn revoke_api_key(&self, user_id: Uuid, id: Uuid) -> Result<bool, AuthError> {
        self.db.revoke_api_key(user_id, id).await.map_err(internal)
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate").finish()
    }
}

#[derive(Debug, Error)]
pub enum SignupError {
    #[error("email is already registered")]
    EmailTaken,
    #[error("internal auth error: {0}")]
    Internal(String),
}

fn salt_string() -> Result<SaltString, SignupError> {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill(&mut salt_bytes);
    SaltString::encode_b64(&salt_bytes).map_err(|err| SignupError::Internal(err.to_string()))
}

fn hash_secret(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn internal<E: fmt::Display>(err: E) -> AuthError {
    AuthError::Internal(err.to_string())
}
