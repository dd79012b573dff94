//! Host liveness probing: TCP connect over common ports, then ICMP echo.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, SurgeError};
use tokio::sync::OnceCell;

use crate::config::ScanConfig;
use crate::core::resources::ResourceManager;
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Whether `addr` answered. `quick` skips the ICMP fallback. An error
    /// means the probe itself could not run, not that the host is down.
    async fn is_alive(&self, addr: Ipv4Addr, quick: bool) -> CoreResult<bool>;
}

/// Probes through leased sockets from the resource manager.
pub struct SystemProbe {
    resources: Arc<ResourceManager>,
    ports: Vec<u16>,
    connect_timeout: Duration,
    icmp_timeout: Duration,
    icmp: OnceCell<Option<Client>>,
    next_ident: AtomicU16,
}

impl SystemProbe {
    pub fn new(resources: Arc<ResourceManager>, config: &ScanConfig) -> Self {
        Self {
            resources,
            ports: config.probe_ports.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            icmp_timeout: Duration::from_millis(config.icmp_timeout_ms),
            icmp: OnceCell::new(),
            next_ident: AtomicU16::new(1),
        }
    }

    /// First port that accepts or actively refuses proves the host is up.
    async fn tcp_alive(&self, addr: Ipv4Addr) -> CoreResult<bool> {
        for &port in &self.ports {
            let mut lease = self.resources.acquire_socket().await?;
            match lease
                .connect(SocketAddr::new(IpAddr::V4(addr), port), self.connect_timeout)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => return Ok(true),
                Err(_) => continue,
            }
        }
        Ok(false)
    }

    async fn icmp_client(&self) -> Option<&Client> {
        self.icmp
            .get_or_init(|| async {
                match Client::new(&Config::default()) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        tracing::info!("ICMP probing unavailable ({e}); using TCP only");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    async fn icmp_alive(&self, addr: Ipv4Addr) -> CoreResult<bool> {
        let Some(client) = self.icmp_client().await else {
            return Ok(false);
        };
        let ident = PingIdentifier(self.next_ident.fetch_add(1, Ordering::Relaxed));
        let mut pinger = client.pinger(IpAddr::V4(addr), ident).await;
        pinger.timeout(self.icmp_timeout);
        match pinger.ping(PingSequence(0), &[0u8; 56]).await {
            Ok(_) => Ok(true),
            Err(SurgeError::Timeout { .. }) => Ok(false),
            Err(e) => Err(CoreError::ProbeFailed(format!("ICMP echo to {addr}: {e}"))),
        }
    }
}

#[async_trait]
impl LivenessProbe for SystemProbe {
    async fn is_alive(&self, addr: Ipv4Addr, quick: bool) -> CoreResult<bool> {
        if self.tcp_alive(addr).await? {
            return Ok(true);
        }
        if quick {
            return Ok(false);
        }
        self.icmp_alive(addr).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;

    fn probe_with_ports(ports: Vec<u16>) -> SystemProbe {
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default()));
        let config = ScanConfig {
            probe_ports: ports,
            connect_timeout_ms: 300,
            ..ScanConfig::default()
        };
        SystemProbe::new(resources, &config)
    }

    #[tokio::test]
    async fn test_accepting_port_proves_liveness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = probe_with_ports(vec![port]);
        assert!(probe.is_alive(Ipv4Addr::LOCALHOST, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_connection_proves_liveness() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = probe_with_ports(vec![port]);
        assert!(probe.tcp_alive(Ipv4Addr::LOCALHOST).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_socket_pool_is_an_error_not_a_dead_host() {
        let probe = probe_with_ports(vec![9]);
        probe.resources.close();
        let err = probe.is_alive(Ipv4Addr::LOCALHOST, true).await.unwrap_err();
        assert_eq!(err.kind(), "ResourceExhausted");
    }

    #[tokio::test]
    async fn test_leases_are_released_after_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = probe_with_ports(vec![port]);
        probe.is_alive(Ipv4Addr::LOCALHOST, true).await.unwrap();
        assert_eq!(probe.resources.live_sockets(), 0);
    }
}
