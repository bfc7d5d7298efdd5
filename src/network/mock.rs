//! Scripted in-memory adapter for tests. Results for `activate_profile` are
//! queued ahead of time; events are pushed by the test through a channel. An
//! activation counter records the maximum observed concurrency so tests can
//! assert the single-attempt invariant.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::stream;
use tokio::sync::mpsc;

use super::{NetworkAdapter, NetworkEvent};
use crate::errors::{ErrorCode, ProvisionError};
use crate::state::WifiNetwork;

#[derive(Default)]
pub struct MockState {
    pub profiles: Vec<String>,
    pub scan_results: Vec<WifiNetwork>,
    pub activate_results: VecDeque<Result<(), ProvisionError>>,
    pub current_ssid: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub ap_active: bool,
    pub calls: Vec<String>,
}

pub struct MockAdapter {
    pub state: Mutex<MockState>,
    pub connectivity: AtomicBool,
    pub active_attempts: AtomicUsize,
    pub max_active_attempts: AtomicUsize,
    /// Artificial latency inside `activate_profile`, for overlap tests
    pub activate_delay: Mutex<Duration>,
    event_tx: Mutex<Vec<mpsc::UnboundedSender<NetworkEvent>>>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(MockAdapter {
            state: Mutex::new(MockState::default()),
            connectivity: AtomicBool::new(true),
            active_attempts: AtomicUsize::new(0),
            max_active_attempts: AtomicUsize::new(0),
            activate_delay: Mutex::new(Duration::from_millis(10)),
            event_tx: Mutex::new(Vec::new()),
        })
    }

    pub fn push_event(&self, event: NetworkEvent) {
        let senders = self.event_tx.lock().unwrap();
        for tx in senders.iter() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn script_activate(&self, result: Result<(), ProvisionError>) {
        self.state.lock().unwrap().activate_results.push_back(result);
    }

    pub fn with_networks(self: Arc<Self>, networks: Vec<WifiNetwork>) -> Arc<Self> {
        self.state.lock().unwrap().scan_results = networks;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn ap_active(&self) -> bool {
        self.state.lock().unwrap().ap_active
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }
}

#[async_trait]
impl NetworkAdapter for MockAdapter {
    async fn scan(&self) -> Result<Vec<WifiNetwork>, ProvisionError> {
        self.record("scan");
        Ok(self.state.lock().unwrap().scan_results.clone())
    }

    async fn list_profiles(&self) -> Result<Vec<String>, ProvisionError> {
        Ok(self.state.lock().unwrap().profiles.clone())
    }

    async fn create_or_update_profile(
        &self,
        ssid: &str,
        _psk: Option<&str>,
        _hidden: bool,
    ) -> Result<(), ProvisionError> {
        self.record(format!("create_profile:{}", ssid));
        let mut state = self.state.lock().unwrap();
        if !state.profiles.iter().any(|p| p == ssid) {
            state.profiles.push(ssid.to_owned());
        }
        Ok(())
    }

    async fn delete_profile(&self, name: &str) -> Result<(), ProvisionError> {
        self.record(format!("delete_profile:{}", name));
        self.state.lock().unwrap().profiles.retain(|p| p != name);
        Ok(())
    }

    async fn activate_profile(&self, name: &str) -> Result<(), ProvisionError> {
        self.record(format!("activate:{}", name));
        let concurrent = self.active_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_attempts.fetch_max(concurrent, Ordering::SeqCst);

        let delay = *self.activate_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let result = self
            .state
            .lock()
            .unwrap()
            .activate_results
            .pop_front()
            .unwrap_or(Ok(()));

        self.active_attempts.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            let mut state = self.state.lock().unwrap();
            state.current_ssid = Some(name.to_owned());
            state.ipv4 = Some(Ipv4Addr::new(10, 0, 0, 17));
            state.ap_active = false;
            self.connectivity.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn deactivate_all_wifi(&self) -> Result<(), ProvisionError> {
        self.record("deactivate_all_wifi");
        let mut state = self.state.lock().unwrap();
        state.current_ssid = None;
        state.ipv4 = None;
        Ok(())
    }

    async fn start_ap(
        &self,
        ssid: &str,
        _psk: &str,
        _channel: u8,
        ipv4: Ipv4Addr,
    ) -> Result<(), ProvisionError> {
        self.record(format!("start_ap:{}", ssid));
        let mut state = self.state.lock().unwrap();
        state.ap_active = true;
        state.current_ssid = None;
        state.ipv4 = Some(ipv4);
        Ok(())
    }

    async fn stop_ap(&self) -> Result<(), ProvisionError> {
        self.record("stop_ap");
        let mut state = self.state.lock().unwrap();
        state.ap_active = false;
        state.ipv4 = None;
        Ok(())
    }

    async fn primary_ipv4(&self) -> Result<Option<Ipv4Addr>, ProvisionError> {
        Ok(self.state.lock().unwrap().ipv4)
    }

    async fn current_ssid(&self) -> Result<Option<String>, ProvisionError> {
        Ok(self.state.lock().unwrap().current_ssid.clone())
    }

    async fn signal_dbm(&self) -> Result<Option<i32>, ProvisionError> {
        Ok(self.state.lock().unwrap().current_ssid.as_ref().map(|_| -55))
    }

    async fn has_connectivity(&self) -> Result<bool, ProvisionError> {
        Ok(self.connectivity.load(Ordering::SeqCst))
    }

    async fn watch_events(&self) -> Result<BoxStream<'static, NetworkEvent>, ProvisionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx.lock().unwrap().push(tx);
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }
}

/// Convenience constructor for an auth failure.
pub fn auth_fail() -> ProvisionError {
    ProvisionError::Connect(ErrorCode::AuthFail, "secrets were required".to_owned())
}
