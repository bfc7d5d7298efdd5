//! # mDNS publisher
//!
//! Fire-and-forget helper keeping `{hostname}.local` resolvable. The glue
//! here subscribes to the state store and re-publishes whenever the address
//! changes; the actual advertisement is delegated through the
//! [`MdnsPublisher`] trait.

use std::process::Stdio;
use std::sync::Arc;

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::store::StateStore;

pub trait MdnsPublisher: Send + Sync {
    fn publish(&self, hostname: &str, ip: &str);
}

/// Publishes through avahi. Each publish replaces the previous registration;
/// the helper process is fire-and-forget.
#[derive(Default)]
pub struct AvahiPublisher;

impl MdnsPublisher for AvahiPublisher {
    fn publish(&self, hostname: &str, ip: &str) {
        let result = tokio::process::Command::new("avahi-publish-address")
            .args(["-R", &format!("{}.local", hostname), ip])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match result {
            Ok(_) => debug!("mDNS publish {}.local -> {}", hostname, ip),
            Err(e) => warn!("mDNS publish failed: {}", e),
        }
    }
}

/// Re-publish whenever `ip_address` changes to a new non-empty value.
pub fn spawn(
    store: Arc<StateStore>,
    hostname: String,
    publisher: Arc<dyn MdnsPublisher>,
) -> JoinHandle<()> {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        let mut last_ip = String::new();
        loop {
            {
                let snapshot = changes.borrow_and_update().clone();
                if snapshot.ip_address != last_ip && !snapshot.ip_address.is_empty() {
                    publisher.publish(&hostname, &snapshot.ip_address);
                    last_ip = snapshot.ip_address.clone();
                }
            }
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatePatch;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingPublisher {
        published: Mutex<Vec<(String, String)>>,
    }

    impl MdnsPublisher for RecordingPublisher {
        fn publish(&self, hostname: &str, ip: &str) {
            self.published.lock().unwrap().push((hostname.to_owned(), ip.to_owned()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn republishes_only_on_address_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(&dir.path().join("state.json")));
        let publisher = Arc::new(RecordingPublisher { published: Mutex::new(Vec::new()) });

        let handle = spawn(store.clone(), "distiller-34ab".to_owned(), publisher.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        store
            .update(StatePatch { ip_address: Some("10.0.0.4".to_owned()), ..Default::default() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // same address again: no duplicate publish
        store
            .update(StatePatch { ssid: Some("HomeNet".to_owned()), ..Default::default() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        store
            .update(StatePatch { ip_address: Some("10.0.0.9".to_owned()), ..Default::default() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(
            published,
            vec![
                ("distiller-34ab".to_owned(), "10.0.0.4".to_owned()),
                ("distiller-34ab".to_owned(), "10.0.0.9".to_owned()),
            ]
        );
    }
}
