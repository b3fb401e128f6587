//! SSH readiness probing.
//!
//! A node is usable once its ssh daemon answers. vboxcore does not log in: it only checks that
//! something on the forwarded port speaks the ssh protocol.

use std::{
    fmt::{self, Display},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncReadExt, net::TcpStream, time};

use crate::{config::DEFAULT_POLL_INTERVAL, hypervisor::LOOPBACK_HOST, utils};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Every ssh server opens with this identification prefix.
pub const SSH_IDENTIFICATION_PREFIX: &[u8] = b"SSH-";

/// How long one probe may take, connect and banner included.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Servers may send lines before the identification string. This bounds how much is read.
const MAX_BANNER_BYTES: usize = 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a guest's ssh daemon is reachable from the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshEndpoint {
    /// The host-side address.
    pub host: String,

    /// The host-side port.
    pub port: u16,
}

/// Connects to the TCP endpoint and waits for an ssh identification line.
#[derive(Debug, Clone, Default)]
pub struct BannerProbe;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Decides whether an ssh endpoint is up.
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Whether the endpoint answers right now. Never blocks for long.
    async fn responds(&self, endpoint: &SshEndpoint) -> bool;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshEndpoint {
    /// The NAT forward on the host's loopback interface.
    pub fn loopback(port: u16) -> Self {
        Self {
            host: LOOPBACK_HOST.to_string(),
            port,
        }
    }
}

impl BannerProbe {
    async fn read_banner(endpoint: &SshEndpoint) -> std::io::Result<bool> {
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        let mut received = Vec::with_capacity(256);
        let mut buf = [0u8; 256];

        while received.len() < MAX_BANNER_BYTES {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);

            if received
                .split(|b| *b == b'\n')
                .any(|line| line.starts_with(SSH_IDENTIFICATION_PREFIX))
            {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Probes `endpoint` every 500 ms until it responds or `timeout` elapses.
pub async fn wait_for_ssh(client: &dyn SshClient, endpoint: &SshEndpoint, timeout: Duration) -> bool {
    utils::retry_until(DEFAULT_POLL_INTERVAL, timeout, || client.responds(endpoint)).await
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SshClient for BannerProbe {
    async fn responds(&self, endpoint: &SshEndpoint) -> bool {
        match time::timeout(PROBE_TIMEOUT, Self::read_banner(endpoint)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::trace!(%endpoint, error = %e, "ssh probe failed");
                false
            }
            Err(_) => {
                tracing::trace!(%endpoint, "ssh probe timed out");
                false
            }
        }
    }
}

impl Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    async fn serve_once(greeting: &'static [u8]) -> anyhow::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(greeting).await;
            }
        });

        Ok(port)
    }

    #[tokio::test]
    async fn test_banner_probe_accepts_ssh_servers() -> anyhow::Result<()> {
        let port = serve_once(b"Welcome\r\nSSH-2.0-OpenSSH_8.9p1\r\n").await?;
        assert!(BannerProbe.responds(&SshEndpoint::loopback(port)).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_banner_probe_rejects_other_services() -> anyhow::Result<()> {
        let port = serve_once(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        assert!(!BannerProbe.responds(&SshEndpoint::loopback(port)).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_ssh_gives_up() -> anyhow::Result<()> {
        let port = crate::utils::free_local_port()?;
        let started = tokio::time::Instant::now();

        let up = wait_for_ssh(
            &BannerProbe,
            &SshEndpoint::loopback(port),
            Duration::from_millis(300),
        )
        .await;

        assert!(!up);
        assert!(started.elapsed() < Duration::from_secs(2));
        Ok(())
    }
}
