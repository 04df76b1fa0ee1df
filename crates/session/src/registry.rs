use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;
use wabridge_core::error::{GatewayError, Result};
use wabridge_core::types::SessionStatus;
use wabridge_wa::WaClient;

/// Live state for one session. The client handle and the consumer task are
/// owned here; everything else is bookkeeping the API edge reads.
pub struct SessionHandle {
    pub client: Arc<dyn WaClient>,
    pub org_id: Uuid,
    pub status: SessionStatus,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The per-session event consumer. Aborted on teardown.
    pub consumer: Option<JoinHandle<()>>,
}

/// Read-only copy handed out to callers.
#[derive(Debug, Clone)]
pub struct HandleSnapshot {
    pub session_id: String,
    pub org_id: Uuid,
    pub status: SessionStatus,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Process-wide table of live sessions. The lock is never held across a
/// suspension point; all I/O happens on cloned-out handles.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when the id is already live.
    pub async fn register(&self, session_id: &str, handle: SessionHandle) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(session_id) {
            return Err(GatewayError::validation(format!(
                "session {} is already registered",
                session_id
            )));
        }
        inner.insert(session_id.to_string(), handle);
        Ok(())
    }

    /// Explicit removal, invoked by the supervisor on permanent teardown.
    pub async fn deregister(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.write().await.remove(session_id)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.read().await.contains_key(session_id)
    }

    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        phone_number: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.get_mut(session_id) {
            handle.status = status;
            if phone_number.is_some() {
                handle.phone_number = phone_number;
            }
        }
    }

    pub async fn set_consumer(&self, session_id: &str, consumer: JoinHandle<()>) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.get_mut(session_id) {
            handle.consumer = Some(consumer);
        } else {
            // Session was torn down before the consumer got recorded
            consumer.abort();
        }
    }

    /// Client handle for a connected session; `NotConnected` otherwise.
    pub async fn connected_client(&self, session_id: &str) -> Result<Arc<dyn WaClient>> {
        let inner = self.inner.read().await;
        match inner.get(session_id) {
            Some(handle) if handle.status == SessionStatus::Connected => {
                Ok(handle.client.clone())
            }
            _ => Err(GatewayError::NotConnected(session_id.to_string())),
        }
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<HandleSnapshot> {
        let inner = self.inner.read().await;
        inner.get(session_id).map(|handle| HandleSnapshot {
            session_id: session_id.to_string(),
            org_id: handle.org_id,
            status: handle.status,
            phone_number: handle.phone_number.clone(),
            created_at: handle.created_at,
        })
    }

    pub async fn snapshots(&self) -> Vec<HandleSnapshot> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .map(|(id, handle)| HandleSnapshot {
                session_id: id.clone(),
                org_id: handle.org_id,
                status: handle.status,
                phone_number: handle.phone_number.clone(),
                created_at: handle.created_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use wabridge_wa::stub::StubConnector;
    use wabridge_wa::WaConnector;

    async fn handle(org_id: Uuid) -> SessionHandle {
        let connector = StubConnector::new();
        let (client, _rx) = connector.connect("r1", None, Path::new("/tmp")).await.unwrap();
        SessionHandle {
            client,
            org_id,
            status: SessionStatus::Connecting,
            phone_number: None,
            created_at: Utc::now(),
            consumer: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let registry = SessionRegistry::new();
        let org_id = Uuid::new_v4();
        registry.register("r1", handle(org_id).await).await.unwrap();
        assert!(registry.register("r1", handle(org_id).await).await.is_err());
    }

    #[tokio::test]
    async fn test_connected_client_requires_connected_status() {
        let registry = SessionRegistry::new();
        let org_id = Uuid::new_v4();
        registry.register("r1", handle(org_id).await).await.unwrap();

        assert!(matches!(
            registry.connected_client("r1").await,
            Err(GatewayError::NotConnected(_))
        ));
        assert!(matches!(
            registry.connected_client("missing").await,
            Err(GatewayError::NotConnected(_))
        ));

        registry
            .set_status("r1", SessionStatus::Connected, Some("555".to_string()))
            .await;
        assert!(registry.connected_client("r1").await.is_ok());

        let snap = registry.snapshot("r1").await.unwrap();
        assert_eq!(snap.phone_number.as_deref(), Some("555"));
    }
}
