//! Bridges the daemon's signals into the adapter's [`NetworkEvent`] stream.
//! A background task owns the proxies and forwards mapped events through a
//! channel; duplicates inside the coalescing window are dropped.

use std::time::Instant;

use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use zbus::zvariant::OwnedObjectPath;

use super::proxies::{
    AccessPointProxy, DaemonState, DeviceProxy, DeviceState, NetworkManagerProxy,
    WirelessDeviceProxy,
};
use crate::errors::ProvisionError;
use crate::network::{NetworkEvent, EVENT_COALESCE_WINDOW};

struct Coalescer {
    tx: mpsc::UnboundedSender<NetworkEvent>,
    last: Option<(NetworkEvent, Instant)>,
}

impl Coalescer {
    fn new(tx: mpsc::UnboundedSender<NetworkEvent>) -> Self {
        Coalescer { tx, last: None }
    }

    fn emit(&mut self, event: NetworkEvent) {
        if let Some((previous, at)) = &self.last {
            if *previous == event && at.elapsed() < EVENT_COALESCE_WINDOW {
                return;
            }
        }
        debug!("Network event: {:?}", event);
        let _ = self.tx.send(event.clone());
        self.last = Some((event, Instant::now()));
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Subscribe to the daemon and return a lazy infinite event stream. The
/// forwarding task ends when the receiver is dropped or the bus goes away.
pub async fn event_stream(
    connection: zbus::Connection,
    device_path: OwnedObjectPath,
) -> Result<futures_core::stream::BoxStream<'static, NetworkEvent>, ProvisionError> {
    let nm = NetworkManagerProxy::new(&connection).await?;
    let device = DeviceProxy::builder(&connection).path(device_path.clone())?.build().await?;
    let wireless = WirelessDeviceProxy::builder(&connection).path(device_path)?.build().await?;

    let mut daemon_states = nm.receive_state_changed().await?;
    let mut device_states = device.receive_device_state_changed().await?;
    let mut active_aps = wireless.receive_active_access_point_changed().await;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut coalescer = Coalescer::new(tx);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = daemon_states.next() => {
                    let Some(signal) = signal else { break };
                    if let Ok(args) = signal.args() {
                        match DaemonState::from(args.state) {
                            DaemonState::Connected => {
                                coalescer.emit(NetworkEvent::ConnectivityRestored);
                            },
                            DaemonState::Disconnected | DaemonState::Asleep => {
                                coalescer.emit(NetworkEvent::ConnectivityLost);
                            },
                            _ => {},
                        }
                    }
                },
                signal = device_states.next() => {
                    let Some(signal) = signal else { break };
                    if let Ok(args) = signal.args() {
                        match DeviceState::from(args.new_state) {
                            DeviceState::Disconnected | DeviceState::Failed => {
                                coalescer.emit(NetworkEvent::DeviceDisconnected);
                            },
                            DeviceState::Deactivating => {
                                coalescer.emit(NetworkEvent::ConnectionDeactivated);
                            },
                            _ => {},
                        }
                    }
                },
                change = active_aps.next() => {
                    let Some(change) = change else { break };
                    if let Ok(path) = change.get().await {
                        if path.len() > 1 {
                            match ssid_of(&connection, &path).await {
                                Ok(ssid) => {
                                    coalescer.emit(NetworkEvent::ActiveConnectionChanged(ssid));
                                },
                                Err(e) => warn!("Failed to resolve new active network: {}", e),
                            }
                        }
                    }
                },
            }
            if coalescer.is_closed() {
                break;
            }
        }
        debug!("Network event forwarder finished");
    });

    Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })))
}

async fn ssid_of(
    connection: &zbus::Connection,
    ap_path: &OwnedObjectPath,
) -> Result<String, ProvisionError> {
    let ap = AccessPointProxy::builder(connection).path(ap_path)?.build().await?;
    Ok(String::from_utf8(ap.ssid().await?)?)
}
