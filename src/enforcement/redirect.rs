//! Redirect backends: Windows port proxy, then iptables DNAT.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

use super::{EnforcementBackend, Mechanism, OsContext, Platform, Rule};

/// Port used when a redirect names no port.
pub const DEFAULT_REDIRECT_PORT: u16 = 80;

fn destination(rule: &Rule) -> CoreResult<Ipv4Addr> {
    rule.redirect_destination().ok_or_else(|| {
        CoreError::MalformedTarget(format!("rule {} carries no redirect destination", rule.id))
    })
}

/// `netsh interface portproxy` v4-to-v4 forwarding.
pub struct PortProxy {
    ctx: OsContext,
}

impl PortProxy {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EnforcementBackend for PortProxy {
    fn mechanism(&self) -> Mechanism {
        Mechanism::PortProxy
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let destination = destination(rule)?;
        let port = rule.port.unwrap_or(DEFAULT_REDIRECT_PORT);
        let listen_port = format!("listenport={port}");
        let listen_address = format!("listenaddress={}", rule.target);
        let connect_port = format!("connectport={port}");
        let connect_address = format!("connectaddress={destination}");
        self.ctx
            .run(
                "netsh",
                &[
                    "interface",
                    "portproxy",
                    "add",
                    "v4tov4",
                    &listen_port,
                    &listen_address,
                    &connect_port,
                    &connect_address,
                ],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let port = rule.port.unwrap_or(DEFAULT_REDIRECT_PORT);
        let listen_port = format!("listenport={port}");
        let listen_address = format!("listenaddress={}", rule.target);
        self.ctx
            .run(
                "netsh",
                &["interface", "portproxy", "delete", "v4tov4", &listen_port, &listen_address],
            )
            .await?;
        Ok(())
    }
}

/// `iptables -t nat` PREROUTING DNAT, TCP only when a port is given.
pub struct NatRedirect {
    ctx: OsContext,
}

impl NatRedirect {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }

    fn args(op: &'static str, rule: &Rule, destination: Ipv4Addr) -> Vec<String> {
        let mut args: Vec<String> = ["-t", "nat", op, "PREROUTING", "-d"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(rule.target.to_string());
        let to = match rule.port {
            Some(port) => {
                args.extend(["-p", "tcp", "--dport"].iter().map(|s| s.to_string()));
                args.push(port.to_string());
                format!("{destination}:{port}")
            }
            None => destination.to_string(),
        };
        args.extend(["-j", "DNAT", "--to-destination"].iter().map(|s| s.to_string()));
        args.push(to);
        args
    }

    async fn iptables(&self, args: Vec<String>) -> CoreResult<()> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ctx.run("iptables", &args).await?;
        Ok(())
    }
}

#[async_trait]
impl EnforcementBackend for NatRedirect {
    fn mechanism(&self) -> Mechanism {
        Mechanism::NatRedirect
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let destination = destination(rule)?;
        self.iptables(Self::args("-A", rule, destination)).await
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let destination = destination(rule)?;
        self.iptables(Self::args("-D", rule, destination)).await
    }
}
