//! Status propagation between the supervisor and its frontends
//!
//! [`StatusHub`] is the backend half: it fans every status transition out to
//! the connected clients without ever waiting on one. [`StatusCache`] is the
//! frontend half: it keeps the latest status per instance, dropping anything
//! that is not newer than what it already has.

use crate::status::{now_ms, InstanceStatus, StatusId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Per-client buffer of pending status events
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Status message used when an instance vanished while disconnected
pub const INSTANCE_GONE_MESSAGE: &str = "instance no longer exists";

/// A connected frontend
pub trait StatusClient: Send + Sync {
    /// Deliver a status without blocking. Returns `false` when the client is
    /// gone or cannot keep up; it is then disconnected.
    fn fire_status_changed(&self, status: &InstanceStatus) -> bool;
}

/// Client backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelClient {
    tx: mpsc::Sender<InstanceStatus>,
}

impl ChannelClient {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InstanceStatus>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StatusClient for ChannelClient {
    fn fire_status_changed(&self, status: &InstanceStatus) -> bool {
        self.tx.try_send(status.clone()).is_ok()
    }
}

pub type ClientId = u64;

/// Registry of connected clients
#[derive(Default)]
pub struct StatusHub {
    next_id: AtomicU64,
    clients: DashMap<ClientId, Arc<dyn StatusClient>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, client: Arc<dyn StatusClient>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients.insert(id, client);
        debug!(client_id = id, clients = self.clients.len(), "Status client connected");
        id
    }

    /// Connect a channel client and return its receiving end
    pub fn connect_channel(&self, capacity: usize) -> (ClientId, mpsc::Receiver<InstanceStatus>) {
        let (client, rx) = ChannelClient::new(capacity);
        (self.connect(Arc::new(client)), rx)
    }

    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            debug!(client_id = id, "Status client disconnected");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Push a status to every client, dropping the ones that fail
    pub fn publish(&self, status: &InstanceStatus) {
        let failed: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().fire_status_changed(status))
            .map(|entry| *entry.key())
            .collect();

        for id in failed {
            if self.clients.remove(&id).is_some() {
                warn!(
                    client_id = id,
                    instance_id = %status.instance_id,
                    "Dropping status client that is closed or lagging"
                );
            }
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, InstanceStatus>,
    /// Last timestamp of instances dropped by the latest reconciliation.
    /// Events from the connection that preceded it are the only late ones.
    tombstones: HashMap<String, u64>,
}

/// Frontend view of instance statuses
pub struct StatusCache {
    state: Mutex<CacheState>,
    updates: broadcast::Sender<InstanceStatus>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(DEFAULT_CLIENT_BUFFER);
        Self {
            state: Mutex::new(CacheState::default()),
            updates,
        }
    }

    /// Local observers of accepted updates
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceStatus> {
        self.updates.subscribe()
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.state.lock().entries.get(instance_id).cloned()
    }

    /// All cached statuses, ordered by instance id
    pub fn snapshot(&self) -> Vec<InstanceStatus> {
        let mut all: Vec<_> = self.state.lock().entries.values().cloned().collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a pushed status. Returns `false` if it was stale.
    pub fn apply(&self, status: InstanceStatus) -> bool {
        let mut state = self.state.lock();
        if !Self::is_newer(&state, &status) {
            return false;
        }
        state.tombstones.remove(&status.instance_id);
        state
            .entries
            .insert(status.instance_id.clone(), status.clone());
        let _ = self.updates.send(status);
        true
    }

    fn is_newer(state: &CacheState, status: &InstanceStatus) -> bool {
        if let Some(known) = state.entries.get(&status.instance_id) {
            return status.time_ms > known.time_ms;
        }
        if let Some(&dropped_at) = state.tombstones.get(&status.instance_id) {
            return status.time_ms > dropped_at;
        }
        true
    }

    /// Merge the full live set fetched after a (re)connect.
    ///
    /// Cached instances missing from `live` are dropped; the ones that were
    /// not terminal yet get a synthesized `errored` status, which is returned.
    pub fn reconcile(&self, live: &[InstanceStatus]) -> Vec<InstanceStatus> {
        let mut state = self.state.lock();

        for status in live {
            if Self::is_newer(&state, status) {
                state.tombstones.remove(&status.instance_id);
                state
                    .entries
                    .insert(status.instance_id.clone(), status.clone());
                let _ = self.updates.send(status.clone());
            }
        }

        state.tombstones.clear();

        let live_ids: HashSet<&str> = live.iter().map(|s| s.instance_id.as_str()).collect();
        let vanished: Vec<String> = state
            .entries
            .keys()
            .filter(|id| !live_ids.contains(id.as_str()))
            .cloned()
            .collect();

        let mut synthesized = Vec::new();
        for id in vanished {
            let Some(known) = state.entries.remove(&id) else {
                continue;
            };

            if known.is_terminal() {
                state.tombstones.insert(id, known.time_ms);
                continue;
            }

            let status = InstanceStatus {
                instance_id: id.clone(),
                status_id: StatusId::Errored,
                time_ms: now_ms().max(known.time_ms + 1),
                status_message: Some(INSTANCE_GONE_MESSAGE.to_string()),
            };
            state.tombstones.insert(id, status.time_ms);
            let _ = self.updates.send(status.clone());
            synthesized.push(status);
        }

        synthesized
    }
}
