use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wabridge_core::store::SessionStore;
use wabridge_core::types::SessionStatus;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: i64,
    /// Override used when the upstream service rate-limited us.
    pub rate_limited_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
            rate_limited_delay: Duration::from_secs(15 * 60),
        }
    }
}

/// Schedules supervised reconnects with exponential backoff. One pending
/// timer per session: a disconnect that arrives while a timer is armed is a
/// no-op.
pub struct ReconnectController {
    config: ReconnectConfig,
    store: Arc<dyn SessionStore>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config,
            store,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn compute_delay(&self, attempts: i64) -> Duration {
        let exp = attempts.clamp(0, 30) as u32;
        let delay = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.config.max_delay)
    }

    /// True when a timer slot was armed for this session and has not fired.
    fn timer_pending(&self, session_id: &str) -> bool {
        let mut timers = self.timers.lock().unwrap();
        if let Some(handle) = timers.get(session_id) {
            if handle.is_finished() {
                timers.remove(session_id);
                return false;
            }
            return true;
        }
        false
    }

    fn clear_timer(&self, session_id: &str) {
        self.timers.lock().unwrap().remove(session_id);
    }

    /// Cancel any pending timer, e.g. on session destroy.
    pub fn cancel(&self, session_id: &str) {
        if let Some(handle) = self.timers.lock().unwrap().remove(session_id) {
            handle.abort();
        }
    }

    /// Entry point for a non-logout disconnect.
    pub fn handle_disconnect<'a>(
        self: &'a Arc<Self>,
        supervisor: Arc<Supervisor>,
        session_id: &'a str,
        rate_limited: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.handle_disconnect_inner(supervisor, session_id, rate_limited))
    }

    async fn handle_disconnect_inner(
        self: &Arc<Self>,
        supervisor: Arc<Supervisor>,
        session_id: &str,
        rate_limited: bool,
    ) {
        if self.timer_pending(session_id) {
            return;
        }

        let attempts = match self.store.get_session(session_id).await {
            Ok(Some(session)) => session.reconnect_attempts,
            Ok(None) => return,
            Err(e) => {
                warn!(session_id, error = %e, "failed to read reconnect state");
                return;
            }
        };

        if attempts >= self.config.max_attempts {
            warn!(session_id, attempts, "giving up on reconnection");
            supervisor
                .abandon_session(session_id, "Max reconnection attempts exceeded")
                .await;
            self.clear_timer(session_id);
            return;
        }

        let delay = if rate_limited {
            self.config.rate_limited_delay
        } else {
            self.compute_delay(attempts)
        };

        if let Err(e) = self.store.increment_reconnect_attempts(session_id).await {
            warn!(session_id, error = %e, "failed to persist reconnect attempt");
        }
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Connecting, None, None)
            .await
        {
            warn!(session_id, error = %e, "failed to mark session connecting");
        }

        info!(session_id, attempts, ?delay, "reconnect scheduled");

        let controller = self.clone();
        let session = session_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Free our own slot first so a failed attempt can re-arm
            controller.clear_timer(&session);
            if let Err(e) = supervisor.recreate_session(&session).await {
                warn!(session_id = %session, error = %e, "reconnect attempt failed");
                controller
                    .handle_disconnect(supervisor, &session, false)
                    .await;
            }
        });

        self.timers.lock().unwrap().insert(session_id.to_string(), timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabridge_core::store::MemoryStore;

    #[test]
    fn test_backoff_ladder() {
        let controller = ReconnectController::new(
            ReconnectConfig::default(),
            Arc::new(MemoryStore::new()),
        );
        let delays: Vec<u64> = (0..6)
            .map(|n| controller.compute_delay(n).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160]);
        // Capped at five minutes from attempt 7 on
        assert_eq!(controller.compute_delay(7).as_secs(), 300);
        assert_eq!(controller.compute_delay(40).as_secs(), 300);
    }
}
