use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::KinveyResult;

/// Credentials of the signed-in user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSession {
    pub user_id: String,
    pub auth_token: String,
}

impl ActiveSession {
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        }
    }
}

/// Source of the active user session. User management lives outside this crate;
/// the client only asks who is signed in.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    async fn active_session(&self) -> KinveyResult<Option<ActiveSession>>;

    /// Ends the active session. Called by [`Client::logout`](crate::client::Client::logout).
    fn sign_out(&self) {}
}

/// In-process session holder.
#[derive(Debug, Default)]
pub struct SessionStore {
    session: RwLock<Option<ActiveSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(session: ActiveSession) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }

    pub fn set_session(&self, session: ActiveSession) {
        *self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
    }

    pub fn current(&self) -> Option<ActiveSession> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        *self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[async_trait]
impl AuthProvider for SessionStore {
    async fn active_session(&self) -> KinveyResult<Option<ActiveSession>> {
        Ok(self.current())
    }

    fn sign_out(&self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_out_clears_session() {
        let store = SessionStore::signed_in(ActiveSession::new("user-1", "token"));
        assert_eq!(
            store.active_session().await.unwrap().map(|session| session.user_id),
            Some("user-1".to_string())
        );
        store.sign_out();
        assert!(store.active_session().await.unwrap().is_none());
    }
}
