//! # The provisioning state machine
//!
//! Owns the process-wide connection lock and drives every AP/STA transition.
//! The http layer submits commands over a channel; the network adapter's
//! event stream feeds recovery. Exactly one connection attempt runs at any
//! time, enforced by [`ConnectionLock`].
//!
//! Transitions:
//! **boot** -> CONNECTING when a saved profile exists, AP_MODE otherwise.
//! **AP_MODE** --user connect--> SWITCHING -> CONNECTING -> CONNECTED | FAILED.
//! **FAILED** -> AP_MODE after a three second dwell.
//! **CONNECTED** --user disconnect--> SWITCHING -> AP_MODE.
//! **CONNECTED** --connectivity lost--> recovery (reactivate once, else AP_MODE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use uuid::Uuid;

use crate::captive::CaptivePortal;
use crate::config::Config;
use crate::errors::{ErrorCode, ProvisionError};
use crate::identity::DeviceIdentity;
use crate::network::{NetworkAdapter, NetworkEvent};
use crate::state::{ConnectionState, ErrorInfo, TunnelProvider};
use crate::store::{StatePatch, StateStore};
use crate::tunnel::TunnelHandle;
use crate::utils::{generate_ap_password, validate_psk, validate_ssid};

/// Dwell in FAILED before falling back to the access point.
const FAILED_DWELL: Duration = Duration::from_secs(3);
/// Jitter filter before recovery reacts to a connectivity loss.
const RECOVERY_SETTLE: Duration = Duration::from_secs(3);
/// One retry gap when bringing the access point up fails.
const AP_RETRY_DELAY: Duration = Duration::from_secs(3);

/// The process-wide connection lock. Non-reentrant; auto-recovery uses
/// [`try_acquire`](Self::try_acquire) and yields when a user connect has
/// published the preempt flag before blocking on
/// [`acquire_preempting`](Self::acquire_preempting).
#[derive(Clone)]
pub struct ConnectionLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    preempt: Arc<AtomicBool>,
}

pub struct ConnectionPermit {
    _guard: OwnedMutexGuard<()>,
}

impl ConnectionLock {
    pub fn new() -> Self {
        ConnectionLock {
            inner: Arc::new(tokio::sync::Mutex::new(())),
            preempt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Non-blocking acquisition, used by auto-recovery.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        self.inner.clone().try_lock_owned().ok().map(|guard| ConnectionPermit { _guard: guard })
    }

    /// Blocking acquisition for user operations. Publishes the preempt flag
    /// first so a recovery holder releases at its next await point.
    pub async fn acquire_preempting(&self) -> ConnectionPermit {
        self.preempt.store(true, Ordering::SeqCst);
        let guard = self.inner.clone().lock_owned().await;
        self.preempt.store(false, Ordering::SeqCst);
        ConnectionPermit { _guard: guard }
    }

    /// Checked by recovery on each await point.
    pub fn preempt_requested(&self) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionLock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum ConnectReply {
    /// Lock acquired; the attempt runs under this session id.
    Accepted { session_id: Uuid },
    /// Another user attempt holds the lock.
    Busy,
    /// Input validation failed; state unchanged.
    Rejected(ProvisionError),
}

pub enum Command {
    Connect { ssid: String, psk: String, reply: oneshot::Sender<ConnectReply> },
    Disconnect,
    Shutdown,
}

/// Cheap handle for the http layer.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    pub async fn connect(&self, ssid: String, psk: String) -> ConnectReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Connect { ssid, psk, reply: reply_tx };
        if self.tx.send(command).await.is_err() {
            return ConnectReply::Rejected(ProvisionError::Generic(
                "orchestrator is gone".to_owned(),
            ));
        }
        reply_rx.await.unwrap_or(ConnectReply::Busy)
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(Command::Disconnect).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    rx: mpsc::Receiver<Command>,
}

struct Inner {
    config: Config,
    identity: DeviceIdentity,
    store: Arc<StateStore>,
    adapter: Arc<dyn NetworkAdapter>,
    captive: CaptivePortal,
    tunnel: TunnelHandle,
    lock: ConnectionLock,
    user_inflight: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        identity: DeviceIdentity,
        store: Arc<StateStore>,
        adapter: Arc<dyn NetworkAdapter>,
        captive: CaptivePortal,
        tunnel: TunnelHandle,
    ) -> (Orchestrator, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(16);
        let orchestrator = Orchestrator {
            inner: Arc::new(Inner {
                config,
                identity,
                store,
                adapter,
                captive,
                tunnel,
                lock: ConnectionLock::new(),
                user_inflight: AtomicBool::new(false),
            }),
            rx,
        };
        (orchestrator, OrchestratorHandle { tx })
    }

    /// Drive the state machine until shutdown. Long-running work (user
    /// connects, recovery) runs in separate tasks so the loop keeps consuming
    /// commands and events.
    pub async fn run(mut self) -> Result<(), ProvisionError> {
        // Subscribe before the first transition so no event is missed.
        let mut events = self.inner.adapter.watch_events().await?;

        self.inner.clone().startup().await;

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Connect { ssid, psk, reply }) => {
                        let inner = self.inner.clone();
                        tokio::spawn(async move { inner.user_connect(ssid, psk, reply).await });
                    },
                    Some(Command::Disconnect) => {
                        let inner = self.inner.clone();
                        tokio::spawn(async move { inner.user_disconnect().await });
                    },
                    Some(Command::Shutdown) | None => break,
                },
                event = events.next() => match event {
                    Some(event) => self.inner.clone().handle_event(event),
                    None => {
                        warn!("Network event stream ended");
                        break;
                    },
                },
            }
        }

        self.inner.shutdown().await;
        Ok(())
    }
}

impl Inner {
    /// Boot decision: reconnect to a saved network when one exists, otherwise
    /// open the setup access point.
    async fn startup(self: Arc<Self>) {
        let saved = match self.adapter.list_profiles().await {
            Ok(profiles) => {
                let last = self.store.get().ssid.clone();
                if !last.is_empty() && profiles.iter().any(|p| *p == last) {
                    Some(last)
                } else {
                    profiles.into_iter().next()
                }
            },
            Err(e) => {
                warn!("Failed to list saved profiles: {}", e);
                None
            },
        };

        match saved {
            Some(ssid) => {
                info!("Boot: saved profile '{}' found, connecting", ssid);
                let permit = self.lock.acquire_preempting().await;
                self.attempt_connect(&ssid, permit).await;
            },
            None => {
                info!("Boot: no saved profile, entering AP mode");
                let _permit = self.lock.acquire_preempting().await;
                self.enter_ap_mode().await;
            },
        }
    }

    /// One complete attempt against an existing profile, lock held by the
    /// caller. Ends in CONNECTED or, after the failure dwell, AP_MODE.
    async fn attempt_connect(&self, ssid: &str, permit: ConnectionPermit) {
        self.update(StatePatch {
            connection_state: Some(ConnectionState::Connecting),
            ssid: Some(ssid.to_owned()),
            error: Some(None),
            ..Default::default()
        })
        .await;

        match self.adapter.activate_profile(ssid).await {
            Ok(()) => self.on_connected(ssid).await,
            Err(e) => self.fail_then_ap(e).await,
        }
        drop(permit);
    }

    /// Validated user connect; preempts auto-recovery.
    async fn user_connect(
        self: Arc<Self>,
        ssid: String,
        psk: String,
        reply: oneshot::Sender<ConnectReply>,
    ) {
        if let Err(e) = validate_ssid(&ssid).and_then(|_| validate_psk(&psk)) {
            let _ = reply.send(ConnectReply::Rejected(e));
            return;
        }
        if self.user_inflight.swap(true, Ordering::SeqCst) {
            let _ = reply.send(ConnectReply::Busy);
            return;
        }

        let permit = self.lock.acquire_preempting().await;
        let session_id = Uuid::new_v4();
        let _ = reply.send(ConnectReply::Accepted { session_id });
        info!("User connect to '{}' (session {})", ssid, session_id);

        let previous = self.store.get().connection_state;
        self.update(StatePatch {
            connection_state: Some(ConnectionState::Switching),
            ssid: Some(ssid.clone()),
            session_id: Some(session_id),
            ap_password: Some(String::new()),
            error: Some(None),
            ..Default::default()
        })
        .await;

        match previous {
            ConnectionState::ApMode => {
                if self.config.enable_captive_portal {
                    self.captive.exit().await;
                }
                if let Err(e) = self.adapter.stop_ap().await {
                    warn!("Stopping access point failed: {}", e);
                }
            },
            ConnectionState::Connected => self.tunnel.stop().await,
            _ => {},
        }

        let psk = if psk.is_empty() { None } else { Some(psk.as_str()) };
        let result = self.adapter.create_or_update_profile(&ssid, psk, false).await;

        self.update(StatePatch::state(ConnectionState::Connecting)).await;
        let result = match result {
            Ok(()) => self.adapter.activate_profile(&ssid).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.on_connected(&ssid).await,
            Err(e) => {
                // a profile with rejected credentials would only boot-loop
                if e.code() == ErrorCode::AuthFail {
                    if let Err(delete_err) = self.adapter.delete_profile(&ssid).await {
                        warn!("Failed to remove rejected profile '{}': {}", ssid, delete_err);
                    }
                }
                self.fail_then_ap(e).await;
            },
        }

        self.user_inflight.store(false, Ordering::SeqCst);
        drop(permit);
    }

    /// Tear the station down and return to the setup access point. The saved
    /// profile is kept so a later boot can still auto-connect.
    async fn user_disconnect(self: Arc<Self>) {
        info!("User disconnect");
        let permit = self.lock.acquire_preempting().await;

        self.update(StatePatch {
            connection_state: Some(ConnectionState::Switching),
            error: Some(None),
            ..Default::default()
        })
        .await;

        self.tunnel.stop().await;
        if let Err(e) = self.adapter.deactivate_all_wifi().await {
            warn!("Deactivating wifi failed: {}", e);
        }
        self.enter_ap_mode().await;
        drop(permit);
    }

    fn handle_event(self: Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::ConnectivityLost
            | NetworkEvent::DeviceDisconnected
            | NetworkEvent::ConnectionDeactivated => {
                if self.store.get().connection_state == ConnectionState::Connected {
                    tokio::spawn(async move { self.recover().await });
                }
            },
            NetworkEvent::ConnectivityRestored => {
                if self.store.get().connection_state == ConnectionState::Connected {
                    tokio::spawn(async move { self.refresh_link_details().await });
                }
            },
            NetworkEvent::ActiveConnectionChanged(ssid) => {
                if self.store.get().connection_state == ConnectionState::Connected {
                    tokio::spawn(async move {
                        self.update(StatePatch { ssid: Some(ssid), ..Default::default() }).await;
                        self.refresh_link_details().await;
                    });
                }
            },
        }
    }

    /// Recovery from connectivity loss. A held lock means a user operation is
    /// in progress and owns recovery; the preempt flag is re-checked at every
    /// await point so a user connect never waits on us longer than one step.
    async fn recover(self: Arc<Self>) {
        let permit = match self.lock.try_acquire() {
            Some(permit) => permit,
            None => return,
        };

        tokio::time::sleep(RECOVERY_SETTLE).await;
        if self.lock.preempt_requested() {
            return;
        }

        match self.adapter.has_connectivity().await {
            Ok(true) => {
                info!("Connectivity restored by itself");
                return;
            },
            Ok(false) => {},
            Err(e) => warn!("Connectivity re-check failed: {}", e),
        }
        if self.lock.preempt_requested() {
            return;
        }

        let last_ssid = self.store.get().ssid.clone();
        if last_ssid.is_empty() {
            self.enter_ap_mode().await;
            return;
        }

        info!("Connectivity lost; reactivating '{}'", last_ssid);
        self.update(StatePatch::state(ConnectionState::Connecting)).await;
        match self.adapter.activate_profile(&last_ssid).await {
            Ok(()) => self.on_connected(&last_ssid).await,
            Err(e) => self.fail_then_ap(e).await,
        }
        drop(permit);
    }

    /// Publish CONNECTED with fresh link details and bring the tunnel up.
    async fn on_connected(&self, ssid: &str) {
        let ip = self
            .adapter
            .primary_ipv4()
            .await
            .ok()
            .flatten()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let signal = self.adapter.signal_dbm().await.ok().flatten();

        self.update(StatePatch {
            connection_state: Some(ConnectionState::Connected),
            ssid: Some(ssid.to_owned()),
            ip_address: Some(ip),
            signal_dbm: Some(signal),
            ap_password: Some(String::new()),
            error: Some(None),
            ..Default::default()
        })
        .await;
        info!("Connected to '{}'", ssid);

        if self.config.tunnel_enabled {
            self.tunnel.start().await;
        }
    }

    async fn refresh_link_details(&self) {
        let ip = self
            .adapter
            .primary_ipv4()
            .await
            .ok()
            .flatten()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let signal = self.adapter.signal_dbm().await.ok().flatten();
        let ssid = self.adapter.current_ssid().await.ok().flatten();
        self.update(StatePatch {
            ip_address: Some(ip),
            signal_dbm: Some(signal),
            ssid,
            ..Default::default()
        })
        .await;
    }

    /// Record the failure, dwell, then fall back to the access point.
    async fn fail_then_ap(&self, error: ProvisionError) {
        warn!("Connection attempt failed: {} ({})", error, error.code());
        self.update(StatePatch {
            connection_state: Some(ConnectionState::Failed),
            error: Some(Some(ErrorInfo::new(error.code(), error.to_string()))),
            ..Default::default()
        })
        .await;

        tokio::time::sleep(FAILED_DWELL).await;
        self.enter_ap_mode().await;
    }

    /// Idempotent AP entry: fresh password, captive portal re-applied, AP
    /// profile restarted. Retries once; a second failure leaves FAILED and
    /// the error in state.
    async fn enter_ap_mode(&self) {
        self.tunnel.stop().await;
        let password = generate_ap_password();

        if let Err(e) = self.adapter.deactivate_all_wifi().await {
            warn!("Deactivating wifi before AP entry failed: {}", e);
        }

        let mut captive_error = None;
        if self.config.enable_captive_portal {
            // re-entry purges older rules first, so this stays idempotent
            if let Err(e) = self.captive.enter().await {
                error!("{}", e);
                captive_error = Some(ErrorInfo::new(ErrorCode::CaptiveFail, e.to_string()));
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .adapter
                .start_ap(
                    &self.identity.ap_ssid,
                    &password,
                    self.config.ap_channel,
                    self.config.ap_ip,
                )
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < 2 => {
                    warn!("AP start failed, retrying: {}", e);
                    tokio::time::sleep(AP_RETRY_DELAY).await;
                },
                Err(e) => {
                    error!("AP start failed twice: {}", e);
                    self.update(StatePatch {
                        connection_state: Some(ConnectionState::Failed),
                        error: Some(Some(ErrorInfo::new(e.code(), e.to_string()))),
                        ..Default::default()
                    })
                    .await;
                    return;
                },
            }
        }

        self.update(StatePatch {
            connection_state: Some(ConnectionState::ApMode),
            ssid: Some(String::new()),
            ip_address: Some(self.config.ap_ip.to_string()),
            signal_dbm: Some(None),
            ap_password: Some(password),
            tunnel_url: Some(None),
            tunnel_provider: Some(TunnelProvider::None),
            error: Some(captive_error),
            ..Default::default()
        })
        .await;
        info!("AP mode active: {}", self.identity.ap_ssid);
    }

    async fn shutdown(&self) {
        info!("Shutting down");
        self.tunnel.stop().await;
        if self.store.get().connection_state == ConnectionState::ApMode {
            if self.config.enable_captive_portal {
                self.captive.exit().await;
            }
            if let Err(e) = self.adapter.stop_ap().await {
                warn!("Stopping access point on shutdown failed: {}", e);
            }
            self.update(StatePatch::state(ConnectionState::Disconnected)).await;
        }
    }

    async fn update(&self, patch: StatePatch) {
        if let Err(e) = self.store.update(patch).await {
            error!("State update failed: {}", e);
        }
    }
}
