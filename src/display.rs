//! # Display sink
//!
//! Pull-based contract for the e-ink renderer: it subscribes to the state
//! store and receives at most one frame every two seconds. Rendering happens
//! on its own task and never blocks the orchestrator; bursts of state changes
//! coalesce into the latest snapshot.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

use crate::state::SystemState;
use crate::store::StateStore;

/// Minimum period between two rendered frames.
const MIN_RENDER_PERIOD: Duration = Duration::from_secs(2);

/// Frame consumer. The real renderer lives in the display stack; this crate
/// only defines the contract and feeds it snapshots.
pub trait DisplaySink: Send + Sync {
    fn render(&self, state: &SystemState);
}

/// Default sink when no display stack is attached.
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn render(&self, state: &SystemState) {
        debug!(
            "display frame: {} ssid={:?} ip={:?}",
            state.connection_state.as_str(),
            state.ssid,
            state.ip_address
        );
    }
}

/// Render the current snapshot, then one frame per change, throttled to
/// [`MIN_RENDER_PERIOD`].
pub fn spawn(store: Arc<StateStore>, sink: Arc<dyn DisplaySink>) -> JoinHandle<()> {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            let snapshot = changes.borrow_and_update().clone();
            sink.render(&snapshot);

            tokio::time::sleep(MIN_RENDER_PERIOD).await;
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;
    use crate::store::StatePatch;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Mutex<Vec<ConnectionState>>,
    }

    impl DisplaySink for RecordingSink {
        fn render(&self, state: &SystemState) {
            self.frames.lock().unwrap().push(state.connection_state);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_coalesce_into_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(&dir.path().join("state.json")));
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });

        let handle = spawn(store.clone(), sink.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // burst of changes inside one render period
        for state in [
            ConnectionState::Switching,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            store.update(StatePatch::state(state)).await.unwrap();
        }

        tokio::time::sleep(MIN_RENDER_PERIOD + Duration::from_millis(500)).await;
        handle.abort();

        let frames = sink.frames.lock().unwrap().clone();
        // initial frame plus exactly one coalesced frame showing the latest state
        assert_eq!(frames, vec![ConnectionState::Disconnected, ConnectionState::Connected]);
    }
}
