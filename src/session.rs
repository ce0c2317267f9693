use crate::types::{SessionData, UserId};
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct CachedSession {
    data: SessionData,
    last_accessed: Instant,
}

/// Login sessions keyed by an opaque cookie value. A session expires after
/// `idle_ttl` without being read.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, CachedSession>>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub async fn create_session(&self, user_id: UserId) -> String {
        let session_id = Self::generate_session_id();
        let data = SessionData {
            user_id,
            created_at: Utc::now(),
        };

        self.sessions.write().await.insert(
            session_id.clone(),
            CachedSession {
                data,
                last_accessed: Instant::now(),
            },
        );
        debug!("Session created for user {}", user_id);
        session_id
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionData> {
        let mut sessions = self.sessions.write().await;

        // Clean up expired entries
        let idle_ttl = self.idle_ttl;
        sessions.retain(|_, cached| cached.last_accessed.elapsed() < idle_ttl);

        sessions.get_mut(session_id).map(|cached| {
            cached.last_accessed = Instant::now();
            cached.data.clone()
        })
    }

    pub async fn delete_session(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            debug!("Session removed");
        }
    }

    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_lifecycle() {
        let store = SessionStore::new(Duration::from_secs(60));
        let id = store.create_session(7).await;

        assert_eq!(store.get_session(&id).await.map(|s| s.user_id), Some(7));

        store.delete_session(&id).await;
        assert!(store.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let store = SessionStore::new(Duration::from_millis(20));
        let id = store.create_session(1).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_session_is_none() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert!(store.get_session("nope").await.is_none());
    }
}
