//! # State store
//!
//! Owns the single [`SystemState`], serialises mutation, persists every change
//! atomically and fans the change out to subscribers. Reads are lock-free:
//! `get` hands out the current `Arc` snapshot. Two subscription mechanisms
//! exist: synchronous callbacks receiving `(old, new)` in registration order,
//! and a watch channel for task subscribers (websocket, display, mdns) which
//! observe a totally ordered sequence of snapshots.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use log::{debug, error, warn};
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::ProvisionError;
use crate::state::{ConnectionState, ErrorInfo, SystemState, TunnelProvider};

pub type ChangeCallback = Box<dyn Fn(&SystemState, &SystemState) + Send + Sync>;

/// Handle returned by [`StateStore::on_change`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// A partial update. `None` fields keep their current value; the nested
/// `Option`s allow explicitly clearing an optional field.
#[derive(Debug, Default)]
pub struct StatePatch {
    pub connection_state: Option<ConnectionState>,
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub signal_dbm: Option<Option<i32>>,
    pub ap_password: Option<String>,
    pub tunnel_url: Option<Option<String>>,
    pub tunnel_provider: Option<TunnelProvider>,
    pub error: Option<Option<ErrorInfo>>,
    pub session_id: Option<Uuid>,
}

impl StatePatch {
    pub fn state(state: ConnectionState) -> Self {
        StatePatch { connection_state: Some(state), ..Default::default() }
    }

    fn apply(self, base: &SystemState) -> SystemState {
        let mut next = base.clone();
        if let Some(v) = self.connection_state {
            next.connection_state = v;
        }
        if let Some(v) = self.ssid {
            next.ssid = v;
        }
        if let Some(v) = self.ip_address {
            next.ip_address = v;
        }
        if let Some(v) = self.signal_dbm {
            next.signal_dbm = v;
        }
        if let Some(v) = self.ap_password {
            next.ap_password = v;
        }
        if let Some(v) = self.tunnel_url {
            next.tunnel_url = v;
        }
        if let Some(v) = self.tunnel_provider {
            next.tunnel_provider = v;
        }
        if let Some(v) = self.error {
            next.error = v;
        }
        if let Some(v) = self.session_id {
            next.session_id = v;
        }
        next.updated_at = Utc::now();
        next
    }
}

pub struct StateStore {
    current: RwLock<Arc<SystemState>>,
    /// Serialises update + persist + callback pass
    write_lock: tokio::sync::Mutex<()>,
    callbacks: Mutex<Vec<(CallbackId, ChangeCallback)>>,
    next_callback_id: AtomicU64,
    watch_tx: watch::Sender<Arc<SystemState>>,
    path: PathBuf,
}

impl StateStore {
    /// Build the store from the persisted snapshot, or from defaults when the
    /// file is missing or unreadable. Secrets are never on disk, so a loaded
    /// snapshot always has an empty `ap_password`.
    pub fn load(path: &Path) -> Self {
        let initial = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<SystemState>(&raw) {
                Ok(state) => {
                    debug!("Loaded persisted state from {}", path.display());
                    state
                },
                Err(e) => {
                    warn!("Discarding unreadable state file {}: {}", path.display(), e);
                    SystemState::default()
                },
            },
            Err(_) => SystemState::default(),
        };

        let initial = Arc::new(initial);
        let (watch_tx, _) = watch::channel(initial.clone());
        StateStore {
            current: RwLock::new(initial),
            write_lock: tokio::sync::Mutex::new(()),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            watch_tx,
            path: path.to_owned(),
        }
    }

    /// Cheap snapshot of the current state.
    pub fn get(&self) -> Arc<SystemState> {
        self.current.read().expect("state store read lock").clone()
    }

    /// Atomically merge `patch`, persist the result, then notify subscribers.
    ///
    /// Callbacks run in registration order; a panicking callback is isolated
    /// and does not prevent the others or roll the state back. The watch
    /// channel is updated last so task subscribers observe the same total
    /// order as the callback pass.
    pub async fn update(&self, patch: StatePatch) -> Result<Arc<SystemState>, ProvisionError> {
        let _guard = self.write_lock.lock().await;

        let old = self.get();
        let new = Arc::new(patch.apply(&old));

        self.persist(&new).await?;
        *self.current.write().expect("state store write lock") = new.clone();

        {
            let callbacks = self.callbacks.lock().expect("state store callback lock");
            for (id, callback) in callbacks.iter() {
                let result = catch_unwind(AssertUnwindSafe(|| callback(&old, &new)));
                if result.is_err() {
                    error!("State change callback {:?} panicked; continuing", id);
                }
            }
        }

        let _ = self.watch_tx.send(new.clone());
        Ok(new)
    }

    /// Register a synchronous change callback. Returns a handle for
    /// [`off_change`](Self::off_change).
    pub fn on_change(&self, callback: ChangeCallback) -> CallbackId {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().expect("state store callback lock").push((id, callback));
        id
    }

    pub fn off_change(&self, id: CallbackId) {
        self.callbacks
            .lock()
            .expect("state store callback lock")
            .retain(|(existing, _)| *existing != id);
    }

    /// Watch channel for task subscribers. The receiver yields the current
    /// snapshot immediately and every later one in order.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemState>> {
        self.watch_tx.subscribe()
    }

    /// Write the snapshot to a temp file on the same filesystem, then rename
    /// into place. Rename is atomic on POSIX, so readers never observe a
    /// partial file.
    async fn persist(&self, state: &SystemState) -> Result<(), ProvisionError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProvisionError::IO(e, "create state dir"))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| ProvisionError::IO(e, "write state temp file"))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ProvisionError::IO(e, "rename state file"))?;
        Ok(())
    }
}
