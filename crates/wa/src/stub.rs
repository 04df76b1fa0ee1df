use crate::auth::AuthState;
use crate::client::{
    GroupMetadata, GroupParticipant, WaClient, WaConnector, WaEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Scripted connector for tests. Each session gets a canned event sequence
/// delivered right after connect; further events can be pushed while the
/// connection is live, and connects can be made to fail a set number of
/// times to exercise restore isolation and reconnection.
#[derive(Default)]
pub struct StubConnector {
    inner: Mutex<ConnectorInner>,
}

#[derive(Default)]
struct ConnectorInner {
    scripts: HashMap<String, Vec<WaEvent>>,
    fail_connects: HashMap<String, u32>,
    senders: HashMap<String, mpsc::Sender<WaEvent>>,
    clients: HashMap<String, Arc<StubClient>>,
    connect_counts: HashMap<String, u32>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events delivered immediately after the next connect of `session_id`.
    pub fn script(&self, session_id: &str, events: Vec<WaEvent>) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(session_id.to_string(), events);
    }

    /// Make the next `n` connects for `session_id` fail.
    pub fn fail_connects(&self, session_id: &str, n: u32) {
        self.inner
            .lock()
            .unwrap()
            .fail_connects
            .insert(session_id.to_string(), n);
    }

    /// Push an event into a live connection. Returns false when the session
    /// was never connected or its receiver is gone.
    pub async fn push(&self, session_id: &str, event: WaEvent) -> bool {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner.senders.get(session_id).cloned()
        };
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn client(&self, session_id: &str) -> Option<Arc<StubClient>> {
        self.inner.lock().unwrap().clients.get(session_id).cloned()
    }

    pub fn connect_count(&self, session_id: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .connect_counts
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl WaConnector for StubConnector {
    async fn connect(
        &self,
        session_id: &str,
        auth: Option<AuthState>,
        _storage_dir: &Path,
    ) -> anyhow::Result<(Arc<dyn WaClient>, mpsc::Receiver<WaEvent>)> {
        let (tx, rx) = mpsc::channel(256);
        let script;
        let client;
        {
            let mut inner = self.inner.lock().unwrap();
            *inner
                .connect_counts
                .entry(session_id.to_string())
                .or_insert(0) += 1;

            if let Some(remaining) = inner.fail_connects.get_mut(session_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("stub connect refused for {}", session_id);
                }
            }

            script = inner.scripts.remove(session_id).unwrap_or_default();
            client = Arc::new(StubClient::new(session_id, auth));
            inner
                .senders
                .insert(session_id.to_string(), tx.clone());
            inner
                .clients
                .insert(session_id.to_string(), client.clone());
        }

        for event in script {
            let _ = tx.send(event).await;
        }

        Ok((client, rx))
    }
}

/// Records outbound traffic and serves canned group state.
pub struct StubClient {
    pub session_id: String,
    pub auth: Option<AuthState>,
    sends: Mutex<Vec<(String, String)>>,
    fail_sends: AtomicU32,
    fail_group_ops: AtomicU32,
    send_seq: AtomicU64,
    logouts: AtomicU32,
    groups: Mutex<HashMap<String, GroupMetadata>>,
}

impl StubClient {
    fn new(session_id: &str, auth: Option<AuthState>) -> Self {
        Self {
            session_id: session_id.to_string(),
            auth,
            sends: Mutex::new(Vec::new()),
            fail_sends: AtomicU32::new(0),
            fail_group_ops: AtomicU32::new(0),
            send_seq: AtomicU64::new(0),
            logouts: AtomicU32::new(0),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `n` sends fail.
    pub fn fail_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` group operations fail.
    pub fn fail_group_ops(&self, n: u32) {
        self.fail_group_ops.store(n, Ordering::SeqCst);
    }

    fn group_gate(&self) -> anyhow::Result<()> {
        let remaining = self.fail_group_ops.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_group_ops.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("stub group op refused");
        }
        Ok(())
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn logout_count(&self) -> u32 {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn seed_group(&self, meta: GroupMetadata) {
        self.groups
            .lock()
            .unwrap()
            .insert(meta.group_jid.clone(), meta);
    }
}

#[async_trait]
impl WaClient for StubClient {
    async fn send_text(&self, jid: &str, text: &str) -> anyhow::Result<String> {
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("stub send refused");
        }
        self.sends
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("stub-{}-{}", self.session_id, seq))
    }

    async fn logout(&self) -> anyhow::Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_group(
        &self,
        subject: &str,
        participants: &[String],
    ) -> anyhow::Result<GroupMetadata> {
        self.group_gate()?;
        let meta = GroupMetadata {
            group_jid: format!("{}-{}@g.us", self.session_id, subject.len()),
            subject: subject.to_string(),
            description: None,
            participants: participants
                .iter()
                .map(|p| GroupParticipant {
                    jid: p.clone(),
                    is_admin: false,
                })
                .collect(),
            we_are_admin: true,
        };
        self.seed_group(meta.clone());
        Ok(meta)
    }

    async fn list_groups(&self) -> anyhow::Result<Vec<GroupMetadata>> {
        self.group_gate()?;
        Ok(self.groups.lock().unwrap().values().cloned().collect())
    }

    async fn group_metadata(&self, group_jid: &str) -> anyhow::Result<GroupMetadata> {
        self.group_gate()?;
        self.groups
            .lock()
            .unwrap()
            .get(group_jid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown group {}", group_jid))
    }

    async fn add_participants(
        &self,
        group_jid: &str,
        participants: &[String],
    ) -> anyhow::Result<()> {
        self.group_gate()?;
        let mut groups = self.groups.lock().unwrap();
        let meta = groups
            .get_mut(group_jid)
            .ok_or_else(|| anyhow::anyhow!("unknown group {}", group_jid))?;
        for p in participants {
            meta.participants.push(GroupParticipant {
                jid: p.clone(),
                is_admin: false,
            });
        }
        Ok(())
    }

    async fn remove_participant(&self, group_jid: &str, participant: &str) -> anyhow::Result<()> {
        self.group_gate()?;
        let mut groups = self.groups.lock().unwrap();
        let meta = groups
            .get_mut(group_jid)
            .ok_or_else(|| anyhow::anyhow!("unknown group {}", group_jid))?;
        meta.participants.retain(|p| p.jid != participant);
        Ok(())
    }

    async fn promote_participant(&self, group_jid: &str, participant: &str) -> anyhow::Result<()> {
        self.group_gate()?;
        self.set_admin(group_jid, participant, true)
    }

    async fn demote_participant(&self, group_jid: &str, participant: &str) -> anyhow::Result<()> {
        self.group_gate()?;
        self.set_admin(group_jid, participant, false)
    }

    async fn leave_group(&self, group_jid: &str) -> anyhow::Result<()> {
        self.group_gate()?;
        self.groups.lock().unwrap().remove(group_jid);
        Ok(())
    }

    async fn update_group_settings(
        &self,
        group_jid: &str,
        _announce_only: bool,
    ) -> anyhow::Result<()> {
        self.group_gate()?;
        if !self.groups.lock().unwrap().contains_key(group_jid) {
            anyhow::bail!("unknown group {}", group_jid);
        }
        Ok(())
    }
}

impl StubClient {
    fn set_admin(&self, group_jid: &str, participant: &str, admin: bool) -> anyhow::Result<()> {
        let mut groups = self.groups.lock().unwrap();
        let meta = groups
            .get_mut(group_jid)
            .ok_or_else(|| anyhow::anyhow!("unknown group {}", group_jid))?;
        match meta.participants.iter_mut().find(|p| p.jid == participant) {
            Some(p) => {
                p.is_admin = admin;
                Ok(())
            }
            None => anyhow::bail!("unknown participant {}", participant),
        }
    }
}
