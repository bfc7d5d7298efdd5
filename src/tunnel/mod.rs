//! # Tunnel supervisor
//!
//! Keeps the device remotely reachable while it is connected. Two providers
//! exist: the managed reverse proxy (preferred when the device carries a
//! credential) and an on-demand ssh tunnel to a public relay. The supervisor
//! runs as its own task, owns the provider children and publishes
//! `tunnel_url`/`tunnel_provider` through the state store. It never blocks
//! the orchestrator; every failure degrades to a logged `TUNNEL_FAIL` and a
//! null URL.

pub mod managed;
pub mod ssh;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::{Config, TunnelProviderKind};
use crate::state::TunnelProvider;
use crate::store::{StatePatch, StateStore};
use managed::ManagedProvider;
use ssh::SshTunnel;

/// Health poll / managed re-check cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(60);
/// Consecutive failed health probes before failing over to ssh.
const MANAGED_FAIL_THRESHOLD: u32 = 3;
/// Relay session lifetimes; refresh happens five minutes early.
const SSH_LIFETIME_WITH_TOKEN: Duration = Duration::from_secs(24 * 60 * 60);
const SSH_LIFETIME_ANONYMOUS: Duration = Duration::from_secs(60 * 60);
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Supervisor position. `StartingManaged`/`StartingSsh` are transient while a
/// provider is brought up; `Failed` means both providers are down until the
/// next start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    Idle,
    StartingManaged,
    Managed,
    StartingSsh,
    Ssh,
    Failed,
}

enum Session {
    Managed { provider: ManagedProvider, fails: u32 },
    Ssh { tunnel: SshTunnel, started: Instant, refresh_after: Duration },
}

#[derive(Debug)]
enum TunnelCommand {
    Start,
    Stop,
}

/// Cheap handle the orchestrator keeps. Commands are fire-and-forget.
#[derive(Clone)]
pub struct TunnelHandle {
    tx: mpsc::Sender<TunnelCommand>,
}

impl TunnelHandle {
    pub async fn start(&self) {
        let _ = self.tx.send(TunnelCommand::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(TunnelCommand::Stop).await;
    }
}

pub struct TunnelSupervisor {
    config: Config,
    hostname: String,
    store: Arc<StateStore>,
    env_file: PathBuf,
    rx: mpsc::Receiver<TunnelCommand>,
}

/// Spawn the supervisor task and return its handle.
pub fn spawn(config: Config, hostname: String, store: Arc<StateStore>) -> TunnelHandle {
    let (tx, rx) = mpsc::channel(8);
    let supervisor = TunnelSupervisor {
        config,
        hostname,
        store,
        env_file: PathBuf::from(managed::TOKEN_ENV_FILE),
        rx,
    };
    tokio::spawn(supervisor.run());
    TunnelHandle { tx }
}

impl TunnelSupervisor {
    async fn run(mut self) {
        let mut state = TunnelState::Idle;
        let mut session: Option<Session> = None;
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(TunnelCommand::Start) => self.start(&mut state, &mut session).await,
                    Some(TunnelCommand::Stop) => self.stop(&mut state, &mut session).await,
                    None => break,
                },
                _ = ticker.tick() => self.tick(&mut state, &mut session).await,
            }
        }

        self.stop(&mut state, &mut session).await;
    }

    /// Bring a provider up. The managed provider wins when a device credential
    /// exists and the primary configuration does not say otherwise.
    async fn start(&self, state: &mut TunnelState, session: &mut Option<Session>) {
        if !self.config.tunnel_enabled {
            return;
        }
        if matches!(*state, TunnelState::Managed | TunnelState::Ssh) {
            return;
        }

        let managed = ManagedProvider::from_env_file(&self.env_file);
        let try_managed = self.config.tunnel_provider_primary == TunnelProviderKind::Managed
            && managed.is_some();

        if try_managed {
            *state = TunnelState::StartingManaged;
            let provider = managed.expect("checked above");
            if provider.healthy().await {
                let url = provider.public_url(&self.hostname);
                info!("Managed tunnel active: {}", url);
                self.publish(Some(url), TunnelProvider::Managed).await;
                *session = Some(Session::Managed { provider, fails: 0 });
                *state = TunnelState::Managed;
                return;
            }
            warn!("Managed tunnel daemon unhealthy; falling back to ssh");
        }

        self.start_ssh(state, session).await;
    }

    async fn start_ssh(&self, state: &mut TunnelState, session: &mut Option<Session>) {
        *state = TunnelState::StartingSsh;
        let token = &self.config.tunnel_access_token;
        match SshTunnel::open(
            &self.config.tunnel_ssh_host,
            self.config.tunnel_ssh_port,
            token,
            self.config.web_port,
        )
        .await
        {
            Ok(tunnel) => {
                self.publish(Some(tunnel.public_url.clone()), TunnelProvider::Ssh).await;
                *session = Some(Session::Ssh {
                    tunnel,
                    started: Instant::now(),
                    refresh_after: self.refresh_after(),
                });
                *state = TunnelState::Ssh;
            },
            Err(e) => {
                warn!("TUNNEL_FAIL: {}", e);
                self.publish(None, TunnelProvider::None).await;
                *session = None;
                *state = TunnelState::Failed;
            },
        }
    }

    async fn stop(&self, state: &mut TunnelState, session: &mut Option<Session>) {
        if let Some(Session::Ssh { tunnel, .. }) = session.take() {
            tunnel.close().await;
        }
        if *state != TunnelState::Idle {
            self.publish(None, TunnelProvider::None).await;
        }
        *state = TunnelState::Idle;
    }

    async fn tick(&self, state: &mut TunnelState, session: &mut Option<Session>) {
        match *state {
            TunnelState::Managed => {
                let healthy = match session.as_ref() {
                    Some(Session::Managed { provider, .. }) => provider.healthy().await,
                    _ => return,
                };
                if let Some(Session::Managed { fails, .. }) = session.as_mut() {
                    if healthy {
                        *fails = 0;
                        return;
                    }
                    *fails += 1;
                    warn!(
                        "Managed tunnel health probe failed ({}/{})",
                        fails, MANAGED_FAIL_THRESHOLD
                    );
                    if *fails < MANAGED_FAIL_THRESHOLD {
                        return;
                    }
                }
                self.start_ssh(state, session).await;
            },
            TunnelState::Ssh => {
                // While on ssh, prefer to move back to the managed provider.
                if self.config.tunnel_provider_primary == TunnelProviderKind::Managed {
                    if let Some(provider) = ManagedProvider::from_env_file(&self.env_file) {
                        if provider.healthy().await {
                            info!("Managed tunnel recovered; switching back");
                            if let Some(Session::Ssh { tunnel, .. }) = session.take() {
                                tunnel.close().await;
                            }
                            let url = provider.public_url(&self.hostname);
                            self.publish(Some(url), TunnelProvider::Managed).await;
                            *session = Some(Session::Managed { provider, fails: 0 });
                            *state = TunnelState::Managed;
                            return;
                        }
                    }
                }

                let refresh_due = matches!(
                    session.as_ref(),
                    Some(Session::Ssh { started, refresh_after, .. })
                        if started.elapsed() >= *refresh_after
                );
                if refresh_due {
                    info!("Refreshing ssh tunnel before relay expiry");
                    if let Some(Session::Ssh { tunnel, .. }) = session.take() {
                        tunnel.close().await;
                    }
                    self.start_ssh(state, session).await;
                }
            },
            _ => {},
        }
    }

    /// Refresh five minutes before the relay drops the session; the
    /// configured interval can shorten the anonymous cycle further.
    fn refresh_after(&self) -> Duration {
        if self.config.tunnel_access_token.is_empty() {
            let configured = Duration::from_secs(self.config.tunnel_refresh_interval_s);
            configured.min(SSH_LIFETIME_ANONYMOUS - REFRESH_MARGIN)
        } else {
            SSH_LIFETIME_WITH_TOKEN - REFRESH_MARGIN
        }
    }

    async fn publish(&self, url: Option<String>, provider: TunnelProvider) {
        let patch = StatePatch {
            tunnel_url: Some(url),
            tunnel_provider: Some(provider),
            ..Default::default()
        };
        if let Err(e) = self.store.update(patch).await {
            warn!("Failed to publish tunnel state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TunnelProvider;
    use std::io::Write;

    /// A loopback port with nothing listening, so relay and health probes
    /// fail fast and deterministically.
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn supervisor(config: Config) -> (TunnelSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(&dir.path().join("state.json")));
        let (_tx, rx) = mpsc::channel(1);
        let supervisor = TunnelSupervisor {
            config,
            hostname: "distiller-34ab".to_owned(),
            store,
            env_file: PathBuf::from("/nonexistent/env"),
            rx,
        };
        (supervisor, dir)
    }

    #[test]
    fn anonymous_refresh_respects_config_and_lifetime() {
        let mut config = Config::default();
        config.tunnel_access_token = String::new();
        config.tunnel_refresh_interval_s = 3300;
        let (sup, _dir) = supervisor(config);
        assert_eq!(sup.refresh_after(), Duration::from_secs(3300));

        let mut config = Config::default();
        config.tunnel_refresh_interval_s = 100_000;
        let (sup, _dir) = supervisor(config);
        assert_eq!(sup.refresh_after(), SSH_LIFETIME_ANONYMOUS - REFRESH_MARGIN);
    }

    #[test]
    fn token_extends_refresh_to_a_day() {
        let mut config = Config::default();
        config.tunnel_access_token = "tok".to_owned();
        let (sup, _dir) = supervisor(config);
        assert_eq!(sup.refresh_after(), SSH_LIFETIME_WITH_TOKEN - REFRESH_MARGIN);
    }

    #[tokio::test]
    async fn disabled_tunnel_ignores_start() {
        let mut config = Config::default();
        config.tunnel_enabled = false;
        let (sup, _dir) = supervisor(config);

        let mut state = TunnelState::Idle;
        let mut session = None;
        sup.start(&mut state, &mut session).await;
        assert_eq!(state, TunnelState::Idle);
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn managed_fails_over_after_three_failed_probes() {
        // the relay is unreachable too, so the failover attempt lands in Failed
        let mut config = Config::default();
        config.tunnel_ssh_host = "127.0.0.1".to_owned();
        config.tunnel_ssh_port = closed_port();
        let (sup, _dir) = supervisor(config);

        let provider = ManagedProvider {
            device_token: "tok".to_owned(),
            domain: "devices.example.net".to_owned(),
            health_addr: std::net::SocketAddr::from(([127, 0, 0, 1], closed_port())),
        };
        let mut state = TunnelState::Managed;
        let mut session = Some(Session::Managed { provider, fails: 0 });

        // two failed probes stay below the threshold
        sup.tick(&mut state, &mut session).await;
        assert_eq!(state, TunnelState::Managed);
        assert!(matches!(session, Some(Session::Managed { fails: 1, .. })));
        sup.tick(&mut state, &mut session).await;
        assert_eq!(state, TunnelState::Managed);
        assert!(matches!(session, Some(Session::Managed { fails: 2, .. })));

        // the third crosses it and the supervisor leaves the managed provider
        sup.tick(&mut state, &mut session).await;
        assert_eq!(state, TunnelState::Failed);
        assert!(session.is_none());

        let published = sup.store.get();
        assert_eq!(published.tunnel_url, None);
        assert_eq!(published.tunnel_provider, TunnelProvider::None);
    }

    #[tokio::test]
    async fn managed_probe_success_resets_the_fail_count() {
        let (sup, _dir) = supervisor(Config::default());

        let health = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let provider = ManagedProvider {
            device_token: "tok".to_owned(),
            domain: "devices.example.net".to_owned(),
            health_addr: health.local_addr().unwrap(),
        };
        let mut state = TunnelState::Managed;
        let mut session = Some(Session::Managed { provider, fails: 2 });

        sup.tick(&mut state, &mut session).await;
        assert_eq!(state, TunnelState::Managed);
        assert!(matches!(session, Some(Session::Managed { fails: 0, .. })));
    }

    #[tokio::test]
    async fn ssh_switches_back_when_managed_recovers() {
        let health = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut env = tempfile::NamedTempFile::new().unwrap();
        writeln!(env, "DEVICE_TOKEN=tok").unwrap();
        writeln!(env, "TUNNEL_DOMAIN=devices.example.net").unwrap();
        writeln!(env, "TUNNEL_HEALTH_PORT={}", health.local_addr().unwrap().port()).unwrap();
        env.flush().unwrap();

        let (mut sup, _dir) = supervisor(Config::default());
        sup.env_file = env.path().to_owned();

        let mut state = TunnelState::Ssh;
        let mut session = Some(Session::Ssh {
            tunnel: SshTunnel::stub(),
            started: Instant::now(),
            refresh_after: Duration::from_secs(3600),
        });

        sup.tick(&mut state, &mut session).await;

        assert_eq!(state, TunnelState::Managed);
        assert!(matches!(session, Some(Session::Managed { .. })));
        let published = sup.store.get();
        assert_eq!(published.tunnel_provider, TunnelProvider::Managed);
        assert_eq!(
            published.tunnel_url.as_deref(),
            Some("https://distiller-34ab.devices.example.net")
        );
    }

    #[tokio::test]
    async fn ssh_stays_put_before_refresh_is_due() {
        // env file absent: no managed provider to switch back to
        let (sup, _dir) = supervisor(Config::default());

        let mut state = TunnelState::Ssh;
        let mut session = Some(Session::Ssh {
            tunnel: SshTunnel::stub(),
            started: Instant::now(),
            refresh_after: Duration::from_secs(3600),
        });

        sup.tick(&mut state, &mut session).await;
        assert_eq!(state, TunnelState::Ssh);
        assert!(matches!(session, Some(Session::Ssh { .. })));
    }

    #[tokio::test]
    async fn ssh_reopens_when_refresh_is_due() {
        let mut config = Config::default();
        config.tunnel_ssh_host = "127.0.0.1".to_owned();
        config.tunnel_ssh_port = closed_port();
        let (sup, _dir) = supervisor(config);

        let mut state = TunnelState::Ssh;
        let mut session = Some(Session::Ssh {
            tunnel: SshTunnel::stub(),
            started: Instant::now(),
            refresh_after: Duration::ZERO,
        });

        sup.tick(&mut state, &mut session).await;

        // the old session was closed and a reopen attempted; the unreachable
        // relay leaves the supervisor in Failed with no published URL
        assert_eq!(state, TunnelState::Failed);
        assert!(session.is_none());
        assert!(sup.store.get().tunnel_url.is_none());
    }
}
