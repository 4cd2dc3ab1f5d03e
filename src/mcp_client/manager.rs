//! Named registry of sessions.
//!
//! The manager is an ordinary value: construct one, share it (`Arc`), and call
//! [`SessionManager::disconnect_all`] when done. It never connects or tears
//! down sessions on its own.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;

use super::config::SessionConfig;
use super::errors::McpError;
use super::session::Session;

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session, connect it, and register it under `config.name`.
    ///
    /// Only a successfully connected session is registered. An existing entry
    /// with the same name is replaced but NOT disconnected; whoever holds the
    /// old handle owns its teardown.
    pub async fn connect(&self, config: SessionConfig) -> Result<Arc<Session>, McpError> {
        let name = config.name.clone();
        let session = Arc::new(Session::new(config));
        session.connect().await?;

        let previous = self
            .sessions
            .write()
            .await
            .insert(name.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            tracing::warn!(
                server = %name,
                previous_state = %previous.state(),
                "replaced existing session; the previous one was not disconnected"
            );
        }

        Ok(session)
    }

    /// Connect several servers concurrently.
    ///
    /// Returns the names that connected and the failures (partial startup is OK).
    pub async fn connect_all(
        &self,
        configs: Vec<SessionConfig>,
    ) -> (Vec<String>, Vec<(String, McpError)>) {
        let attempts = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            (name, self.connect(config).await)
        });

        let mut connected = Vec::new();
        let mut failed = Vec::new();
        for (name, outcome) in join_all(attempts).await {
            match outcome {
                Ok(_) => connected.push(name),
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "failed to connect server");
                    failed.push((name, e));
                }
            }
        }

        tracing::info!(
            connected = connected.len(),
            failed = failed.len(),
            "server startup complete"
        );
        (connected, failed)
    }

    /// Remove and disconnect `name`. No-op if absent.
    pub async fn disconnect(&self, name: &str) {
        let removed = self.sessions.write().await.remove(name);
        if let Some(session) = removed {
            session.disconnect().await;
        }
    }

    /// Registered session, regardless of its state.
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Disconnect every registered session concurrently and clear the registry.
    pub async fn disconnect_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        join_all(drained.iter().map(|session| session.disconnect())).await;
        tracing::info!(count, "all sessions disconnected");
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::session::SessionState;
    use crate::mcp_client::test_support::fake_server;

    #[tokio::test]
    async fn test_connect_registers_only_on_success() {
        let manager = SessionManager::new();

        let err = manager
            .connect(SessionConfig::new("ghost", "/nonexistent/toolwire-no-such-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert!(manager.get("ghost").await.is_none());
        assert!(manager.is_empty().await);

        let session = manager.connect(fake_server("files")).await.unwrap();
        assert!(session.is_connected());
        let fetched = manager.get("files").await.unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_same_name_overwrites_without_disconnecting() {
        let manager = SessionManager::new();
        let first = manager.connect(fake_server("dup")).await.unwrap();
        let second = manager.connect(fake_server("dup")).await.unwrap();

        assert_eq!(manager.len().await, 1);
        let current = manager.get("dup").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        // The orphaned session is still alive and usable.
        assert_eq!(first.state(), SessionState::Ready);
        assert!(first.list_tools().await.is_ok());

        manager.disconnect_all().await;
        assert_eq!(second.state(), SessionState::Disconnected);
        assert_eq!(first.state(), SessionState::Ready);
        first.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let manager = SessionManager::new();
        let session = manager.connect(fake_server("temp")).await.unwrap();

        manager.disconnect("temp").await;
        assert!(manager.get("temp").await.is_none());
        assert_eq!(session.state(), SessionState::Disconnected);

        // Absent names are a no-op.
        manager.disconnect("temp").await;
        manager.disconnect("never-registered").await;
    }

    #[tokio::test]
    async fn test_connect_all_and_disconnect_all() {
        let manager = SessionManager::new();
        let (connected, failed) = manager
            .connect_all(vec![
                fake_server("b"),
                SessionConfig::new("broken", "/nonexistent/toolwire-no-such-binary"),
                fake_server("a"),
            ])
            .await;

        assert_eq!(connected.len(), 2);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "broken");
        assert_eq!(manager.names().await, vec!["a", "b"]);

        let sessions = vec![
            manager.get("a").await.unwrap(),
            manager.get("b").await.unwrap(),
        ];
        manager.disconnect_all().await;

        assert!(manager.is_empty().await);
        for session in sessions {
            assert_eq!(session.state(), SessionState::Disconnected);
            assert_eq!(session.pending_requests(), 0);
        }

        // Nothing registered: still fine.
        manager.disconnect_all().await;
    }
}
