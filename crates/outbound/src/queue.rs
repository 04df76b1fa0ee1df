use crate::bucket::TokenBucket;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use wabridge_core::error::{GatewayError, Result};
use wabridge_core::types::Message;
use wabridge_session::Supervisor;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub messages_per_minute: u32,
    /// Pacing between successful sends.
    pub delay_between_messages: Duration,
    /// Backoff after a failed send before the next head is tried.
    pub retry_delay: Duration,
    pub max_attempts: u32,
    /// How long the worker sleeps when the bucket is empty.
    pub bucket_wait: Duration,
    /// Bucket window; one minute in production, shrunk in tests.
    pub bucket_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: 20,
            delay_between_messages: Duration::from_secs(3),
            retry_delay: Duration::from_secs(5),
            max_attempts: 3,
            bucket_wait: Duration::from_secs(60),
            bucket_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub queue_id: Uuid,
    pub jid: String,
    pub content: String,
    pub message_type: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

struct SessionQueue {
    items: Mutex<VecDeque<QueueItem>>,
    bucket: Mutex<TokenBucket>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Per-session FIFO dispatch with token-bucket rate limiting and a bounded
/// retry cycle. One logical worker per session, spawned on demand and exiting
/// when its queue drains.
pub struct OutboundQueue {
    supervisor: Arc<Supervisor>,
    config: QueueConfig,
    sessions: Mutex<HashMap<String, Arc<SessionQueue>>>,
}

impl OutboundQueue {
    pub fn new(supervisor: Arc<Supervisor>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Append a text send and wake the session worker. Only text is carried
    /// on this path.
    pub fn enqueue(
        self: &Arc<Self>,
        session_id: &str,
        to: &str,
        body: &str,
        message_type: &str,
    ) -> Result<Uuid> {
        if message_type != "text" {
            return Err(GatewayError::validation(format!(
                "unsupported message type: {}",
                message_type
            )));
        }

        let item = QueueItem {
            queue_id: Uuid::new_v4(),
            jid: to.to_string(),
            content: body.to_string(),
            message_type: message_type.to_string(),
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let queue_id = item.queue_id;

        let queue = self.session_queue(session_id);
        queue.items.lock().unwrap().push_back(item);
        self.ensure_worker(session_id, queue);
        Ok(queue_id)
    }

    /// Enqueue a batch. No transactional guarantee across the batch: items
    /// already enqueued stay queued if a later one fails validation.
    pub fn enqueue_bulk(
        self: &Arc<Self>,
        session_id: &str,
        sends: &[(String, String)],
    ) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(sends.len());
        for (to, body) in sends {
            ids.push(self.enqueue(session_id, to, body, "text")?);
        }
        Ok(ids)
    }

    /// Emergency-only escape hatch: bypasses the queue and the bucket.
    pub async fn send_immediate(
        &self,
        session_id: &str,
        to: &str,
        body: &str,
    ) -> Result<Message> {
        self.supervisor.send_text(session_id, to, body).await
    }

    pub fn pending(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|q| q.items.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Drop the session's queue and cancel its worker, e.g. on destroy.
    pub fn remove_session(&self, session_id: &str) {
        if let Some(queue) = self.sessions.lock().unwrap().remove(session_id) {
            if let Some(worker) = queue.worker.lock().unwrap().take() {
                worker.abort();
            }
        }
    }

    fn session_queue(&self, session_id: &str) -> Arc<SessionQueue> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionQueue {
                    items: Mutex::new(VecDeque::new()),
                    bucket: Mutex::new(TokenBucket::with_window(
                        self.config.messages_per_minute,
                        self.config.bucket_window,
                    )),
                    worker: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Single-flight: spawn a worker only when none is running.
    fn ensure_worker(self: &Arc<Self>, session_id: &str, queue: Arc<SessionQueue>) {
        let mut slot = queue.worker.lock().unwrap();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let this = self.clone();
        let id = session_id.to_string();
        let worker_queue = queue.clone();
        *slot = Some(tokio::spawn(async move {
            this.run_worker(id, worker_queue).await;
        }));
    }

    async fn run_worker(self: Arc<Self>, session_id: String, queue: Arc<SessionQueue>) {
        loop {
            let head = {
                let items = queue.items.lock().unwrap();
                let head = items.front().cloned();
                if head.is_none() {
                    // Clear our slot while still holding the items lock: a
                    // racing enqueue either queued before we looked or will
                    // find the slot empty and spawn a fresh worker
                    *queue.worker.lock().unwrap() = None;
                }
                head
            };
            let Some(item) = head else {
                return;
            };

            let has_token = queue.bucket.lock().unwrap().try_take();
            if !has_token {
                debug!(session_id = %session_id, "rate limit reached, worker sleeping");
                tokio::time::sleep(self.config.bucket_wait).await;
                continue;
            }

            match self
                .supervisor
                .send_text(&session_id, &item.jid, &item.content)
                .await
            {
                Ok(_) => {
                    queue.items.lock().unwrap().pop_front();
                    tokio::time::sleep(self.config.delay_between_messages).await;
                }
                Err(e) => {
                    {
                        let mut items = queue.items.lock().unwrap();
                        if let Some(mut failed) = items.pop_front() {
                            failed.attempts += 1;
                            if failed.attempts >= self.config.max_attempts {
                                warn!(
                                    session_id = %session_id,
                                    queue_id = %failed.queue_id,
                                    attempts = failed.attempts,
                                    error = %e,
                                    "dropping message after repeated send failures"
                                );
                            } else {
                                items.push_back(failed);
                            }
                        }
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use uuid::Uuid;
    use wabridge_core::bus::EventBus;
    use wabridge_core::store::MemoryStore;
    use wabridge_session::supervisor::NoopSink;
    use wabridge_session::ReconnectConfig;
    use wabridge_wa::stub::{StubClient, StubConnector};
    use wabridge_wa::WaEvent;

    struct Fixture {
        connector: Arc<StubConnector>,
        supervisor: Arc<Supervisor>,
        _dir: tempfile::TempDir,
    }

    async fn connected_fixture(session_id: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(StubConnector::new());
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            store,
            connector.clone(),
            Arc::new(EventBus::new(64)),
            Arc::new(NoopSink),
            ReconnectConfig::default(),
            dir.path().to_path_buf(),
        );
        connector.script(
            session_id,
            vec![WaEvent::Open {
                phone_number: "5550000000".to_string(),
            }],
        );
        supervisor
            .create_session(session_id, Uuid::new_v4())
            .await
            .unwrap();
        // Wait until the Open event lands
        for _ in 0..200 {
            if let Some(snap) = supervisor.registry().snapshot(session_id).await {
                if snap.status == wabridge_core::types::SessionStatus::Connected {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Fixture {
            connector,
            supervisor,
            _dir: dir,
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            messages_per_minute: 100,
            delay_between_messages: Duration::from_millis(1),
            retry_delay: Duration::from_millis(5),
            max_attempts: 3,
            bucket_wait: Duration::from_millis(20),
            bucket_window: Duration::from_millis(500),
        }
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    fn client(f: &Fixture, session_id: &str) -> Arc<StubClient> {
        f.connector.client(session_id).unwrap()
    }

    #[tokio::test]
    async fn test_sends_in_fifo_order() {
        let f = connected_fixture("q1").await;
        let queue = OutboundQueue::new(f.supervisor.clone(), fast_config());

        for body in ["one", "two", "three"] {
            queue.enqueue("q1", "5551112222", body, "text").unwrap();
        }

        let c = client(&f, "q1");
        assert!(
            wait_until(Duration::from_secs(2), || c.sent().len() == 3).await,
            "queue did not drain"
        );
        let bodies: Vec<String> = c.sent().into_iter().map(|(_, b)| b).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert_eq!(queue.pending("q1"), 0);
    }

    #[tokio::test]
    async fn test_failed_send_reappends_at_tail() {
        let f = connected_fixture("q2").await;
        let queue = OutboundQueue::new(f.supervisor.clone(), fast_config());
        let c = client(&f, "q2");

        // First attempt of the first item fails; it must retry after "second"
        c.fail_sends(1);
        queue.enqueue("q2", "5551112222", "first", "text").unwrap();
        queue.enqueue("q2", "5551112222", "second", "text").unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || c.sent().len() == 2).await,
            "queue did not drain"
        );
        let bodies: Vec<String> = c.sent().into_iter().map(|(_, b)| b).collect();
        assert_eq!(bodies, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_item_dropped_after_attempt_cap() {
        let f = connected_fixture("q3").await;
        let queue = OutboundQueue::new(f.supervisor.clone(), fast_config());
        let c = client(&f, "q3");

        c.fail_sends(100);
        queue.enqueue("q3", "5551112222", "doomed", "text").unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || queue.pending("q3") == 0).await,
            "item was not dropped"
        );
        assert!(c.sent().is_empty());
    }

    #[tokio::test]
    async fn test_bucket_exhaustion_pauses_worker() {
        let f = connected_fixture("q4").await;
        let mut config = fast_config();
        config.messages_per_minute = 2;
        config.bucket_window = Duration::from_millis(400);
        config.bucket_wait = Duration::from_millis(50);
        let queue = OutboundQueue::new(f.supervisor.clone(), config);
        let c = client(&f, "q4");

        let started = Instant::now();
        for body in ["a", "b", "c"] {
            queue.enqueue("q4", "5551112222", body, "text").unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(3), || c.sent().len() == 3).await,
            "queue did not drain"
        );
        // Third send had to wait for a refill: 400ms window / 2 = 200ms
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_send_immediate_bypasses_queue_and_bucket() {
        let f = connected_fixture("q7").await;
        let mut config = fast_config();
        // One token, never refilled within the test, and a bucket wait far
        // longer than the test itself
        config.messages_per_minute = 1;
        config.bucket_window = Duration::from_secs(3600);
        config.bucket_wait = Duration::from_secs(3600);
        let queue = OutboundQueue::new(f.supervisor.clone(), config);
        let c = client(&f, "q7");

        queue.enqueue("q7", "5551112222", "queued", "text").unwrap();
        assert!(wait_until(Duration::from_secs(2), || c.sent().len() == 1).await);

        // The worker is now parked on an empty bucket
        queue.enqueue("q7", "5551112222", "stuck", "text").unwrap();
        let sent = queue
            .send_immediate("q7", "5551112222", "urgent")
            .await
            .unwrap();
        assert_eq!(sent.status, wabridge_core::types::MessageStatus::Sent);

        let bodies: Vec<String> = c.sent().into_iter().map(|(_, b)| b).collect();
        assert_eq!(bodies, vec!["queued", "urgent"]);
        assert_eq!(queue.pending("q7"), 1);
    }

    #[tokio::test]
    async fn test_non_text_rejected() {
        let f = connected_fixture("q5").await;
        let queue = OutboundQueue::new(f.supervisor.clone(), fast_config());
        assert!(matches!(
            queue.enqueue("q5", "5551112222", "payload", "image"),
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_bulk_enqueue_returns_ids_in_order() {
        let f = connected_fixture("q6").await;
        let queue = OutboundQueue::new(f.supervisor.clone(), fast_config());
        let sends: Vec<(String, String)> = (0..5)
            .map(|i| ("5551112222".to_string(), format!("msg {i}")))
            .collect();
        let ids = queue.enqueue_bulk("q6", &sends).unwrap();
        assert_eq!(ids.len(), 5);
        let c = client(&f, "q6");
        assert!(wait_until(Duration::from_secs(2), || c.sent().len() == 5).await);
    }
}
