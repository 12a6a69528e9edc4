//! Login sessions.
//!
//! Tokens map to an expiry instant. Lookups take a shared read lock; an
//! expired entry found during a lookup is removed under the write lock.
//! A background sweep clears expired entries even when nobody looks them up.

use chrono::{DateTime, Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Issue a new random token valid for the configured lifetime.
    pub async fn issue(&self) -> (String, DateTime<Utc>) {
        let token = Uuid::new_v4().to_string();
        let expiry = Utc::now() + self.ttl;
        self.store(&token, expiry).await;
        tracing::info!(expires_at = %expiry, "issued session");
        (token, expiry)
    }

    pub async fn store(&self, token: &str, expiry: DateTime<Utc>) {
        self.sessions.write().await.insert(token.to_string(), expiry);
    }

    pub async fn load(&self, token: &str) -> Option<DateTime<Utc>> {
        self.sessions.read().await.get(token).copied()
    }

    pub async fn delete(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Present and not yet expired. Expired entries are dropped on discovery.
    pub async fn is_valid(&self, token: &str) -> bool {
        let now = Utc::now();
        match self.load(token).await {
            Some(expiry) if expiry > now => true,
            Some(_) => {
                let mut sessions = self.sessions.write().await;
                if sessions.get(token).is_some_and(|expiry| *expiry <= now) {
                    sessions.remove(token);
                }
                false
            }
            None => false,
        }
    }

    /// Remove every entry whose expiry has passed; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, expiry| *expiry > now);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired sessions");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        &self,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_token_is_valid() {
        let manager = SessionManager::new(Duration::hours(24));
        let (token, expiry) = manager.issue().await;
        assert!(manager.is_valid(&token).await);
        assert_eq!(manager.load(&token).await, Some(expiry));
        assert!(expiry > Utc::now() + Duration::hours(23));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let manager = SessionManager::new(Duration::hours(24));
        assert!(!manager.is_valid("nope").await);
    }

    #[tokio::test]
    async fn expired_token_is_dropped_on_lookup() {
        let manager = SessionManager::new(Duration::hours(24));
        manager
            .store("old", Utc::now() - Duration::seconds(1))
            .await;
        assert!(!manager.is_valid("old").await);
        assert_eq!(manager.load("old").await, None);
    }

    #[tokio::test]
    async fn delete_invalidates() {
        let manager = SessionManager::new(Duration::hours(24));
        let (token, _) = manager.issue().await;
        manager.delete(&token).await;
        assert!(!manager.is_valid(&token).await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let manager = SessionManager::new(Duration::hours(24));
        manager
            .store("old", Utc::now() - Duration::seconds(1))
            .await;
        let (fresh, _) = manager.issue().await;

        assert_eq!(manager.sweep().await, 1);
        assert_eq!(manager.len().await, 1);
        assert!(manager.load(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn background_sweeper_runs_without_lookups() {
        let manager = SessionManager::new(Duration::hours(24));
        manager
            .store("old", Utc::now() - Duration::seconds(1))
            .await;

        let shutdown = CancellationToken::new();
        let handle =
            manager.spawn_sweeper(std::time::Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(manager.len().await, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
