use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::models::Id;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Access-token claims as issued by the platform's identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("token: {0}")]
    Token(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Validate an access token and return its claims.
pub fn decode_access_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AuthError::Token(e.to_string()))?;
    Ok(data.claims)
}

/// Sign an access token the way the platform's identity service does
/// (HS256, 24 hour expiry). Used by the local-mode provider.
pub fn issue_access_token(
    user_id: Id,
    email: &str,
    metadata: UserMetadata,
    secret: &str,
) -> Result<String, AuthError> {
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(24))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration,
        email: Some(email.to_string()),
        user_metadata: metadata,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Token(e.to_string()))
}

/// Signed-in identity plus the bearer token remote calls are made with.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Id,
    pub email: Option<String>,
    pub access_token: String,
    pub metadata: UserMetadata,
}

impl Session {
    pub fn from_token(token: &str, secret: &str) -> Result<Self, AuthError> {
        let claims = decode_access_token(token, secret)?;
        let user_id = claims
            .sub
            .parse::<Id>()
            .map_err(|e| AuthError::Token(format!("bad subject: {e}")))?;
        Ok(Session {
            user_id,
            email: claims.email,
            access_token: token.to_string(),
            metadata: claims.user_metadata,
        })
    }
}

type Listener = Box<dyn Fn(Option<&Session>) + Send + Sync>;

struct SessionInner {
    current: RwLock<Option<Session>>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
}

/// Shared session context, passed by reference into every component that
/// needs the current identity. Not a global: each client owns exactly one.
/// Sign-in/out changes notify subscribed listeners; dropping the
/// subscription handle unregisters the listener.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                current: RwLock::new(None),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.inner.current.read().unwrap().clone()
    }

    pub fn user_id(&self) -> Option<Id> {
        self.inner.current.read().unwrap().as_ref().map(|s| s.user_id)
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub(crate) fn set(&self, session: Option<Session>) {
        {
            let mut cur = self.inner.current.write().unwrap();
            *cur = session.clone();
        }
        let listeners = self.inner.listeners.lock().unwrap();
        for listener in listeners.values() {
            listener(session.as_ref());
        }
    }

    /// Register a session-change listener. The callback fires on every
    /// sign-in and sign-out until the returned handle is dropped.
    pub fn subscribe(
        &self,
        listener: impl Fn(Option<&Session>) + Send + Sync + 'static,
    ) -> AuthSubscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Box::new(listener));
        AuthSubscription {
            id,
            ctx: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }
}

pub struct AuthSubscription {
    id: u64,
    ctx: Weak<SessionInner>,
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.ctx.upgrade() {
            inner.listeners.lock().unwrap().remove(&self.id);
        }
    }
}

use async_trait::async_trait;

/// Identity operations against the platform.
///
/// `sign_up` returns `None` when the platform defers the session until the
/// address is confirmed; local mode signs straight in.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<Option<Session>, AuthError>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
}

#[cfg(feature = "inmem-backend")]
pub mod local {
    use super::*;
    use crate::backend::{Backend, Filter, Query, Table};
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use uuid::Uuid;

    /// Local-mode identity: registers the profile row itself and signs its
    /// own tokens with the configured secret. Credentials live only for the
    /// process lifetime.
    pub struct LocalAuth {
        backend: Arc<dyn Backend>,
        session: SessionContext,
        secret: String,
        credentials: RwLock<HashMap<String, (Id, String)>>,
    }

    fn password_digest(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    impl LocalAuth {
        pub fn new(backend: Arc<dyn Backend>, session: SessionContext, secret: String) -> Self {
            Self {
                backend,
                session,
                secret,
                credentials: RwLock::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl AuthProvider for LocalAuth {
        async fn sign_up(
            &self,
            email: &str,
            password: &str,
            username: &str,
        ) -> Result<Option<Session>, AuthError> {
            if self.credentials.read().unwrap().contains_key(email) {
                return Err(AuthError::AlreadyRegistered);
            }
            let user_id = Uuid::new_v4();
            // username uniqueness is the backend's to enforce
            self.backend
                .insert(Table::Users, json!({ "id": user_id, "username": username }))
                .await?;
            self.credentials
                .write()
                .unwrap()
                .insert(email.to_string(), (user_id, password_digest(password)));

            let metadata = UserMetadata {
                username: Some(username.to_string()),
                ..UserMetadata::default()
            };
            let token = issue_access_token(user_id, email, metadata, &self.secret)?;
            let session = Session::from_token(&token, &self.secret)?;
            self.session.set(Some(session.clone()));
            Ok(Some(session))
        }

        async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
            let (user_id, digest) = self
                .credentials
                .read()
                .unwrap()
                .get(email)
                .cloned()
                .ok_or(AuthError::InvalidCredentials)?;
            if digest != password_digest(password) {
                return Err(AuthError::InvalidCredentials);
            }
            let rows = self
                .backend
                .select(
                    Table::Users,
                    Query::new().filter(Filter::eq("id", user_id)).limit(1),
                )
                .await?;
            let metadata = rows
                .first()
                .map(|row| UserMetadata {
                    username: row
                        .get("username")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    full_name: row
                        .get("full_name")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    avatar_url: row
                        .get("avatar_url")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                })
                .unwrap_or_default();
            let token = issue_access_token(user_id, email, metadata, &self.secret)?;
            let session = Session::from_token(&token, &self.secret)?;
            self.session.set(Some(session.clone()));
            Ok(session)
        }

        async fn sign_out(&self) -> Result<(), AuthError> {
            self.session.set(None);
            Ok(())
        }
    }
}

#[cfg(feature = "rest-backend")]
pub mod rest {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use std::time::Duration;

    /// Identity over the platform's auth endpoints.
    pub struct RestAuth {
        http: reqwest::Client,
        base: String,
        api_key: String,
        jwt_secret: String,
        session: SessionContext,
    }

    impl RestAuth {
        pub fn new(config: &Config, session: SessionContext) -> Result<Self, AuthError> {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| AuthError::Token(e.to_string()))?;
            Ok(Self {
                http,
                base: config.api_url.trim_end_matches('/').to_string(),
                api_key: config.api_key.clone(),
                jwt_secret: config.jwt_secret.clone(),
                session,
            })
        }

        async fn post_json(
            &self,
            path: &str,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, AuthError> {
            let resp = self
                .http
                .post(format!("{}{}", self.base, path))
                .header("apikey", &self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AuthError::Backend(BackendError::Other(e.to_string())))?;
            let status = resp.status();
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            if status.is_success() {
                Ok(body)
            } else if status.as_u16() == 422 || status.as_u16() == 409 {
                Err(AuthError::AlreadyRegistered)
            } else if status.as_u16() == 400 || status.as_u16() == 401 {
                Err(AuthError::InvalidCredentials)
            } else {
                Err(AuthError::Backend(BackendError::Other(format!(
                    "{status}: {body}"
                ))))
            }
        }
    }

    #[async_trait]
    impl AuthProvider for RestAuth {
        async fn sign_up(
            &self,
            email: &str,
            password: &str,
            username: &str,
        ) -> Result<Option<Session>, AuthError> {
            let body = self
                .post_json(
                    "/auth/v1/signup",
                    json!({
                        "email": email,
                        "password": password,
                        "data": { "username": username },
                    }),
                )
                .await?;
            // Confirmation-required deployments return a user but no token.
            match body.get("access_token").and_then(|v| v.as_str()) {
                Some(token) => {
                    let session = Session::from_token(token, &self.jwt_secret)?;
                    self.session.set(Some(session.clone()));
                    Ok(Some(session))
                }
                None => Ok(None),
            }
        }

        async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
            let body = self
                .post_json(
                    "/auth/v1/token?grant_type=password",
                    json!({ "email": email, "password": password }),
                )
                .await?;
            let token = body
                .get("access_token")
                .and_then(|v| v.as_str())
                .ok_or(AuthError::InvalidCredentials)?;
            let session = Session::from_token(token, &self.jwt_secret)?;
            self.session.set(Some(session.clone()));
            Ok(session)
        }

        async fn sign_out(&self) -> Result<(), AuthError> {
            if let Some(token) = self.session.access_token() {
                // Best effort; the local session ends either way.
                let _ = self
                    .http
                    .post(format!("{}/auth/v1/logout", self.base))
                    .header("apikey", &self.api_key)
                    .bearer_auth(token)
                    .send()
                    .await;
            }
            self.session.set(None);
            Ok(())
        }
    }
}
