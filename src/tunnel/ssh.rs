//! On-demand ssh reverse tunnel to a public relay. The relay announces the
//! assigned public URL on the child's stderr; the first matching line within
//! the parse timeout wins.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::errors::ProvisionError;

/// Bound for the relay to announce the public URL.
pub const URL_PARSE_TIMEOUT: Duration = Duration::from_secs(20);

pub struct SshTunnel {
    child: Child,
    pub public_url: String,
}

impl SshTunnel {
    /// Spawn `ssh -R` towards the relay and wait for the announced URL.
    /// `token` selects the authenticated relay account when non-empty.
    pub async fn open(
        host: &str,
        port: u16,
        token: &str,
        local_port: u16,
    ) -> Result<SshTunnel, ProvisionError> {
        let user = if token.is_empty() { "anonymous" } else { token };
        let destination = format!("{}@{}", user, host);
        let forward = format!("0:localhost:{}", local_port);

        debug!("Opening ssh tunnel via {}:{}", host, port);
        let mut child = Command::new("ssh")
            .args([
                "-o", "StrictHostKeyChecking=no",
                "-o", "UserKnownHostsFile=/dev/null",
                "-o", "ServerAliveInterval=30",
                "-o", "ServerAliveCountMax=3",
                "-o", "ExitOnForwardFailure=yes",
                "-p", &port.to_string(),
                "-R", &forward,
                "-N",
                &destination,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionError::Tunnel(format!("spawn ssh: {}", e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProvisionError::Tunnel("ssh child without stderr".to_owned()))?;
        let mut lines = BufReader::new(stderr).lines();

        let url = tokio::time::timeout(URL_PARSE_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ssh: {}", line);
                if let Some(url) = find_url(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await;

        let public_url = match url {
            Ok(Some(url)) => url,
            Ok(None) => {
                let _ = child.kill().await;
                return Err(ProvisionError::Tunnel("relay closed without a URL".to_owned()));
            },
            Err(_) => {
                let _ = child.kill().await;
                return Err(ProvisionError::Tunnel(format!(
                    "no URL within {}s",
                    URL_PARSE_TIMEOUT.as_secs()
                )));
            },
        };

        // Keep draining stderr so the child never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ssh: {}", line);
            }
        });

        info!("SSH tunnel established: {}", public_url);
        Ok(SshTunnel { child, public_url })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill ssh tunnel child: {}", e);
        }
    }

    /// A live session around a harmless child, for supervisor tests.
    #[cfg(test)]
    pub(crate) fn stub() -> SshTunnel {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn stub child");
        SshTunnel { child, public_url: "https://stub.relay.example".to_owned() }
    }
}

/// Extract the first `http(s)://…` token from a relay output line.
fn find_url(line: &str) -> Option<String> {
    let start = line.find("https://").or_else(|| line.find("http://"))?;
    let url: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | ',' | '>'))
        .collect();
    // require at least a scheme and a host
    let host = url.split("://").nth(1)?;
    if host.is_empty() {
        return None;
    }
    Some(url)
}
