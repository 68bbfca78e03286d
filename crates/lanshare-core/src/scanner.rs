// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Peer scanner
//
// Probes every other address of the local /24 on the service port. Probes run
// concurrently behind a semaphore; each one is bounded by its own timeout so a
// silent host never holds up the rest.

use crate::netinfo::subnet_hosts;
use crate::protocol::{self, Request, CONNECTION_OK};
use crate::types::{AppError, AppSettings, PeerRecord};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Name reported when reverse DNS gives nothing
pub const UNKNOWN_HOSTNAME: &str = "Unknown";

const REVERSE_DNS_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    pub concurrency: usize,
    /// Require a `CONNECTION_OK` reply, not just an accepted connect
    pub verify: bool,
    pub resolve_names: bool,
}

impl ScanConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            port: settings.port,
            connect_timeout: Duration::from_millis(settings.scan_timeout_ms),
            concurrency: settings.scan_concurrency.max(1),
            verify: settings.verify_probe,
            resolve_names: true,
        }
    }
}

/// Outcome of one scan. An empty peer list is a normal result.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Sorted by address
    pub peers: Vec<PeerRecord>,
    pub probed: usize,
    pub cancelled: bool,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn summary(&self) -> String {
        match (self.cancelled, self.peers.len()) {
            (true, _) => "Scan cancelled".to_string(),
            (false, 0) => "No devices found".to_string(),
            (false, 1) => "Found 1 device".to_string(),
            (false, n) => format!("Found {} devices", n),
        }
    }
}

pub struct PeerScanner {
    config: ScanConfig,
}

impl PeerScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scan the /24 around `local`, skipping `local` itself
    pub async fn scan_subnet(&self, local: IpAddr, cancel: &CancellationToken) -> Result<ScanReport, AppError> {
        let local = match local {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => {
                return Err(AppError::InvalidConfig(format!(
                    "Subnet scanning needs an IPv4 address, got {}",
                    v6
                )));
            }
        };

        let [a, b, c, _] = local.octets();
        tracing::info!("Scanning {}.{}.{}.0/24 on port {}", a, b, c, self.config.port);
        let hosts = subnet_hosts(local).into_iter().map(IpAddr::V4);
        Ok(self.scan_hosts(hosts, cancel).await)
    }

    /// Probe an explicit set of addresses
    pub async fn scan_hosts<I>(&self, hosts: I, cancel: &CancellationToken) -> ScanReport
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut report = ScanReport::default();

        for ip in hosts {
            let semaphore = Arc::clone(&semaphore);
            let config = self.config.clone();
            report.probed += 1;
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if !probe(&config, ip).await {
                    return None;
                }
                let hostname = if config.resolve_names {
                    reverse_lookup(ip).await
                } else {
                    UNKNOWN_HOSTNAME.to_string()
                };
                Some(PeerRecord {
                    address: ip,
                    hostname,
                    reachable_at: chrono::Utc::now(),
                })
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.abort_all();
                    report.cancelled = true;
                    tracing::info!("Scan cancelled after {} peer(s)", report.peers.len());
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(Ok(Some(peer))) => {
                        tracing::info!("Found peer {} ({})", peer.address, peer.hostname);
                        report.peers.push(peer);
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => tracing::warn!("Probe task failed: {}", e),
                    None => break,
                }
            }
        }

        report.peers.sort_by(|a, b| a.address.cmp(&b.address));
        if !report.cancelled {
            tracing::info!("Scan finished: {}", report.summary());
        }
        report
    }
}

/// Check whether `ip` runs the service
pub async fn probe(config: &ScanConfig, ip: IpAddr) -> bool {
    let addr = SocketAddr::new(ip, config.port);
    let mut stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!("Probe {} refused: {}", addr, e);
            return false;
        }
        Err(_) => {
            tracing::debug!("Probe {} timed out", addr);
            return false;
        }
    };

    if !config.verify {
        return true;
    }

    let reply_timeout = config.connect_timeout.max(MIN_REPLY_TIMEOUT);
    let exchange = async {
        protocol::write_request(&mut stream, &Request::TestConnection).await?;
        let mut reply = vec![0u8; CONNECTION_OK.len()];
        stream.read_exact(&mut reply).await?;
        Ok::<_, AppError>(reply == CONNECTION_OK)
    };

    match tokio::time::timeout(reply_timeout, exchange).await {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            tracing::debug!("Probe {} answered with something else", addr);
            false
        }
        Ok(Err(e)) => {
            tracing::debug!("Probe {} failed: {}", addr, e);
            false
        }
        Err(_) => {
            tracing::debug!("Probe {} did not answer", addr);
            false
        }
    }
}

/// Best-effort reverse DNS
async fn reverse_lookup(ip: IpAddr) -> String {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
    match tokio::time::timeout(REVERSE_DNS_TIMEOUT, lookup).await {
        Ok(Ok(Ok(name))) if !name.is_empty() && name != ip.to_string() => name,
        _ => UNKNOWN_HOSTNAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn config(port: u16, verify: bool) -> ScanConfig {
        ScanConfig {
            port,
            connect_timeout: Duration::from_millis(200),
            concurrency: 8,
            verify,
            resolve_names: false,
        }
    }

    #[test]
    fn test_summary_wording() {
        let report = ScanReport::default();
        assert!(report.is_empty());
        assert_eq!(report.summary(), "No devices found");
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!probe(&config(port, false), IpAddr::V4(Ipv4Addr::LOCALHOST)).await);
    }

    #[tokio::test]
    async fn test_verified_probe_rejects_silent_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(!probe(&config(port, true), localhost).await);
    }

    #[tokio::test]
    async fn test_ipv6_subnet_is_rejected() {
        let scanner = PeerScanner::new(config(1, false));
        let cancel = CancellationToken::new();
        let result = scanner
            .scan_subnet(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), &cancel)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_promptly() {
        let scanner = PeerScanner::new(ScanConfig {
            connect_timeout: Duration::from_secs(30),
            ..config(9, false)
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        // TEST-NET-1 addresses never answer
        let hosts = (1..=20u8).map(|d| IpAddr::V4(Ipv4Addr::new(192, 0, 2, d)));
        let report = tokio::time::timeout(Duration::from_secs(5), scanner.scan_hosts(hosts, &cancel))
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.probed, 20);
    }
}
