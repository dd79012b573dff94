//! Neighbor (ARP) table access.
//!
//! Linux exposes the table at `/proc/net/arp`; elsewhere `arp -a` output is
//! parsed (Windows and BSD/macOS formats).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::enforcement::command::{CommandRunner, Platform};
use crate::error::CoreResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub address: Ipv4Addr,
    /// Normalized `AA:BB:CC:DD:EE:FF`.
    pub hardware_address: String,
    /// Resolution finished (not `incomplete`, not all-zero).
    pub complete: bool,
}

#[async_trait]
pub trait NeighborTable: Send + Sync {
    async fn entries(&self) -> CoreResult<Vec<NeighborEntry>>;

    /// Hardware address of a complete entry for `addr`.
    async fn lookup(&self, addr: Ipv4Addr) -> Option<String> {
        self.entries()
            .await
            .ok()?
            .into_iter()
            .find(|e| e.address == addr && e.complete)
            .map(|e| e.hardware_address)
    }

    /// Provoke address resolution for `addr` so a later lookup can succeed.
    async fn populate(&self, _addr: Ipv4Addr) {}
}

/// Reads the OS neighbor table.
pub struct SystemNeighborTable {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    populate_delay: Duration,
    command_timeout: Duration,
}

impl SystemNeighborTable {
    pub fn new(runner: Arc<dyn CommandRunner>, populate_delay: Duration) -> Self {
        Self {
            runner,
            platform: Platform::current(),
            populate_delay,
            command_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl NeighborTable for SystemNeighborTable {
    async fn entries(&self) -> CoreResult<Vec<NeighborEntry>> {
        if self.platform == Platform::Linux {
            match tokio::fs::read_to_string("/proc/net/arp").await {
                Ok(text) => return Ok(parse_proc_net_arp(&text)),
                Err(e) => tracing::debug!("/proc/net/arp unreadable ({e}), falling back to arp -a"),
            }
        }
        let output = self.runner.run_checked("arp", &["-a"], self.command_timeout).await?;
        Ok(parse_arp_output(&output))
    }

    async fn populate(&self, addr: Ipv4Addr) {
        // Any datagram forces the kernel to resolve the neighbor; port 9 is discard.
        match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => {
                if let Err(e) = socket.send_to(&[0u8], (addr, 9)).await {
                    tracing::trace!("populate {addr}: {e}");
                }
            }
            Err(e) => tracing::trace!("populate {addr}: bind failed: {e}"),
        }
        tokio::time::sleep(self.populate_delay).await;
    }
}

/// Normalize `aa:bb:cc:dd:ee:ff`, `AA-BB-...` or BSD's `0:1a:...` to `AA:BB:CC:DD:EE:FF`.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = Vec::with_capacity(6);
    for part in parts {
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        let value = u8::from_str_radix(part, 16).ok()?;
        octets.push(format!("{value:02X}"));
    }
    Some(octets.join(":"))
}

/// Parse `/proc/net/arp` (header line, then `IP HWtype Flags HWaddr Mask Device`).
pub fn parse_proc_net_arp(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            let address = cols[0].parse::<Ipv4Addr>().ok()?;
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).unwrap_or(0);
            let hardware_address = normalize_mac(cols[3])?;
            let complete = flags & 0x2 != 0 && hardware_address != "00:00:00:00:00:00";
            Some(NeighborEntry {
                address,
                hardware_address,
                complete,
            })
        })
        .collect()
}

/// Parse `arp -a` output from Windows (`1.2.3.4   aa-bb-..   dynamic`) or
/// BSD/macOS (`? (1.2.3.4) at aa:bb:.. on en0`). Incomplete entries are skipped.
pub fn parse_arp_output(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .filter_map(|line| {
            let mut address = None;
            let mut hardware_address = None;
            for token in line.split_whitespace() {
                let token = token.trim_matches(|c| c == '(' || c == ')');
                if address.is_none() {
                    if let Ok(ip) = token.parse::<Ipv4Addr>() {
                        address = Some(ip);
                        continue;
                    }
                }
                if hardware_address.is_none() {
                    hardware_address = normalize_mac(token);
                }
            }
            let hardware_address = hardware_address?;
            let complete = hardware_address != "00:00:00:00:00:00"
                && hardware_address != "FF:FF:FF:FF:FF:FF";
            Some(NeighborEntry {
                address: address?,
                hardware_address,
                complete,
            })
        })
        .collect()
}
