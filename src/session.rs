//! Opaque bearer-token sessions and the request extractors built on them.

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::AppState;
use crate::database::UserRecord;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    Standard,
    AdminPanel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Session {
    pub user_id: i64,
    pub scope: SessionScope,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub scope: SessionScope,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    standard_ttl: Duration,
    admin_ttl: Duration,
}

impl SessionStore {
    pub fn new(standard_ttl_hours: i64, admin_ttl_hours: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            standard_ttl: Duration::hours(standard_ttl_hours),
            admin_ttl: Duration::hours(admin_ttl_hours),
        }
    }

    pub async fn issue(&self, user_id: i64, scope: SessionScope) -> IssuedToken {
        let ttl = match scope {
            SessionScope::Standard => self.standard_ttl,
            SessionScope::AdminPanel => self.admin_ttl,
        };
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let expires_at = now + ttl;

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(
            token.clone(),
            Session {
                user_id,
                scope,
                expires_at,
            },
        );
        drop(sessions);

        IssuedToken {
            access_token: token,
            token_type: "bearer",
            scope,
            expires_at,
        }
    }

    /// Expired tokens are dropped on lookup.
    pub async fn resolve(&self, token: &str) -> Option<Session> {
        let session = self.sessions.read().await.get(token).copied()?;
        if session.expires_at <= Utc::now() {
            self.sessions.write().await.remove(token);
            return None;
        }
        Some(session)
    }

    /// Tokens held in memory, expired ones included until the next issue.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    pub async fn revoke_user(&self, user_id: i64) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.user_id != user_id);
        before - sessions.len()
    }
}

pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// The authenticated, active user behind the request's bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: UserRecord,
    pub session: Session,
    pub token: String,
}

impl CurrentUser {
    /// Administrators see every user's uploads.
    pub fn owner_filter(&self) -> Option<i64> {
        if self.user.is_admin() {
            None
        } else {
            Some(self.user.id)
        }
    }

    pub fn can_access(&self, owner_id: Option<i64>) -> bool {
        self.user.is_admin() || owner_id == Some(self.user.id)
    }
}

async fn load_current_user(state: Option<web::Data<AppState>>, token: Option<String>) -> Result<CurrentUser> {
    let state = state.ok_or_else(|| AppError::Internal("application state missing".to_string()))?;
    let token = token.ok_or(AppError::Unauthorized)?;
    let session = state.sessions.resolve(&token).await.ok_or(AppError::Unauthorized)?;

    let user = state
        .db
        .find_user_by_id(session.user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    if !user.is_active {
        return Err(AppError::InactiveUser);
    }

    Ok(CurrentUser {
        user,
        session,
        token,
    })
}

impl FromRequest for CurrentUser {
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self>>>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let token = bearer_token(req);
        Box::pin(load_current_user(state, token))
    }
}

/// An administrator holding an admin-panel session.
#[derive(Debug, Clone)]
pub struct AdminPanelUser(pub CurrentUser);

impl FromRequest for AdminPanelUser {
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self>>>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let token = bearer_token(req);
        Box::pin(async move {
            let current = load_current_user(state, token).await?;
            if current.session.scope != SessionScope::AdminPanel || !current.user.is_admin() {
                return Err(AppError::Forbidden(
                    "an admin panel session is required".to_string(),
                ));
            }
            Ok(AdminPanelUser(current))
        })
    }
}
