//! Block backends, in the order the engine tries them.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::discovery::subnet::SubnetPrefix;
use crate::error::{CoreError, CoreResult};

use super::{EnforcementBackend, Mechanism, OsContext, Platform, Rule};

/// Inbound and outbound `netsh advfirewall` block rules.
pub struct WindowsFirewall {
    ctx: OsContext,
}

impl WindowsFirewall {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }

    fn names(&self, rule: &Rule) -> [(String, &'static str); 2] {
        let base = self.ctx.rule_name(rule.kind, rule.target);
        [(format!("{base}_In"), "in"), (format!("{base}_Out"), "out")]
    }

    async fn delete(&self, name: &str) -> CoreResult<String> {
        let name_arg = format!("name={name}");
        self.ctx
            .run("netsh", &["advfirewall", "firewall", "delete", "rule", &name_arg])
            .await
    }
}

#[async_trait]
impl EnforcementBackend for WindowsFirewall {
    fn mechanism(&self) -> Mechanism {
        Mechanism::WindowsFirewall
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let remote = format!("remoteip={}", rule.target);

        let mut added: Vec<String> = Vec::new();
        for (name, dir) in self.names(rule) {
            let name_arg = format!("name={name}");
            let dir_arg = format!("dir={dir}");
            let result = self
                .ctx
                .run(
                    "netsh",
                    &[
                        "advfirewall",
                        "firewall",
                        "add",
                        "rule",
                        &name_arg,
                        &dir_arg,
                        "action=block",
                        &remote,
                        "enable=yes",
                    ],
                )
                .await;
            if let Err(e) = result {
                for name in &added {
                    if let Err(undo) = self.delete(name).await {
                        tracing::warn!("Rollback of firewall rule {name} failed: {undo}");
                    }
                }
                return Err(e);
            }
            added.push(name);
        }
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let mut first_error = None;
        for (name, _) in self.names(rule) {
            if let Err(e) = self.delete(&name).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Host route to nowhere: `ip route add blackhole` on Linux, a route via
/// `0.0.0.0` on Windows.
pub struct RouteBlackhole {
    ctx: OsContext,
}

impl RouteBlackhole {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EnforcementBackend for RouteBlackhole {
    fn mechanism(&self) -> Mechanism {
        Mechanism::RouteBlackhole
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        let target = rule.target.to_string();
        match self.ctx.platform() {
            Platform::Linux => {
                let host = format!("{target}/32");
                self.ctx.run("ip", &["route", "add", "blackhole", &host]).await?;
            }
            Platform::Windows => {
                self.ctx
                    .run(
                        "route",
                        &["add", &target, "mask", "255.255.255.255", "0.0.0.0", "metric", "1"],
                    )
                    .await?;
            }
            Platform::Other => {
                return Err(CoreError::MechanismUnavailable(
                    "route black-holing is not supported on this platform".into(),
                ))
            }
        }
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        let target = rule.target.to_string();
        match self.ctx.platform() {
            Platform::Linux => {
                let host = format!("{target}/32");
                self.ctx.run("ip", &["route", "del", "blackhole", &host]).await?;
            }
            Platform::Windows => {
                self.ctx.run("route", &["delete", &target]).await?;
            }
            Platform::Other => {
                return Err(CoreError::MechanismUnavailable(
                    "route black-holing is not supported on this platform".into(),
                ))
            }
        }
        Ok(())
    }
}

/// Static neighbor entry pointing the target at a null hardware address.
/// Only meaningful for hosts on the local /24.
pub struct NeighborPoison {
    ctx: OsContext,
    local: Option<Ipv4Addr>,
}

impl NeighborPoison {
    pub fn new(ctx: OsContext, local: Option<Ipv4Addr>) -> Self {
        Self { ctx, local }
    }

    fn null_mac(&self) -> &'static str {
        match self.ctx.platform() {
            Platform::Windows => "00-00-00-00-00-00",
            _ => "00:00:00:00:00:00",
        }
    }
}

#[async_trait]
impl EnforcementBackend for NeighborPoison {
    fn mechanism(&self) -> Mechanism {
        Mechanism::NeighborPoison
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        let Some(local) = self.local else {
            return Err(CoreError::MechanismUnavailable(
                "local address unknown, cannot tell whether target is on-link".into(),
            ));
        };
        if !SubnetPrefix::of(local).contains(rule.target) {
            return Err(CoreError::MechanismUnavailable(format!(
                "{} is not on the local subnet",
                rule.target
            )));
        }
        let target = rule.target.to_string();
        self.ctx.run("arp", &["-s", &target, self.null_mac()]).await?;
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        let target = rule.target.to_string();
        self.ctx.run("arp", &["-d", &target]).await?;
        Ok(())
    }
}

/// `iptables` DROP rules for traffic to and from the target.
pub struct PacketFilter {
    ctx: OsContext,
}

impl PacketFilter {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }

    fn specs(target: &str) -> [[&str; 4]; 2] {
        [["OUTPUT", "-d", target, "DROP"], ["INPUT", "-s", target, "DROP"]]
    }
}

#[async_trait]
impl EnforcementBackend for PacketFilter {
    fn mechanism(&self) -> Mechanism {
        Mechanism::PacketFilter
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let target = rule.target.to_string();

        let mut inserted: Vec<[&str; 4]> = Vec::new();
        for [chain, flag, addr, verdict] in Self::specs(&target) {
            let result = self
                .ctx
                .run("iptables", &["-I", chain, flag, addr, "-j", verdict])
                .await;
            if let Err(e) = result {
                for [chain, flag, addr, verdict] in inserted {
                    if let Err(undo) = self
                        .ctx
                        .run("iptables", &["-D", chain, flag, addr, "-j", verdict])
                        .await
                    {
                        tracing::warn!("Rollback of {chain} {verdict} rule for {addr} failed: {undo}");
                    }
                }
                return Err(e);
            }
            inserted.push([chain, flag, addr, verdict]);
        }
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let target = rule.target.to_string();
        let mut first_error = None;
        for [chain, flag, addr, verdict] in Self::specs(&target) {
            if let Err(e) = self
                .ctx
                .run("iptables", &["-D", chain, flag, addr, "-j", verdict])
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::command::testing::ScriptedRunner;
    use super::super::testing::context;
    use super::super::{RuleKind, RuleParams};
    use super::*;

    fn block_rule(last: u8) -> Rule {
        Rule::new(
            RuleKind::Block,
            Ipv4Addr::new(192, 168, 1, last),
            None,
            RuleParams::None,
        )
    }

    #[tokio::test]
    async fn test_windows_firewall_adds_and_deletes_both_directions() {
        let runner = Arc::new(ScriptedRunner::new());
        let fw = WindowsFirewall::new(context(runner.clone(), Platform::Windows));
        let rule = block_rule(5);

        fw.apply(&rule).await.unwrap();
        fw.remove(&rule).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].contains("name=LanWard_Block_192_168_1_5_In dir=in action=block remoteip=192.168.1.5"));
        assert!(calls[1].contains("_Out dir=out"));
        assert_eq!(
            calls[2],
            "netsh advfirewall firewall delete rule name=LanWard_Block_192_168_1_5_In"
        );
    }

    #[tokio::test]
    async fn test_windows_firewall_rolls_back_partial_apply() {
        let runner = Arc::new(
            ScriptedRunner::new().fail_on("netsh advfirewall firewall add rule name=LanWard_Block_192_168_1_5_Out"),
        );
        let fw = WindowsFirewall::new(context(runner.clone(), Platform::Windows));

        assert!(fw.apply(&block_rule(5)).await.is_err());
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].ends_with("delete rule name=LanWard_Block_192_168_1_5_In"));
    }

    #[tokio::test]
    async fn test_failed_rollback_still_reports_the_apply_error() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .fail_on("netsh advfirewall firewall add rule name=LanWard_Block_192_168_1_5_Out")
                .fail_on("netsh advfirewall firewall delete rule"),
        );
        let fw = WindowsFirewall::new(context(runner.clone(), Platform::Windows));

        let err = fw.apply(&block_rule(5)).await.unwrap_err();
        assert_eq!(err.kind(), "MechanismUnavailable");
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].ends_with("delete rule name=LanWard_Block_192_168_1_5_In"));
    }

    #[tokio::test]
    async fn test_windows_firewall_unavailable_off_windows() {
        let runner = Arc::new(ScriptedRunner::new());
        let fw = WindowsFirewall::new(context(runner.clone(), Platform::Linux));
        let err = fw.apply(&block_rule(5)).await.unwrap_err();
        assert_eq!(err.kind(), "MechanismUnavailable");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_route_blackhole_commands_per_platform() {
        let runner = Arc::new(ScriptedRunner::new());
        let linux = RouteBlackhole::new(context(runner.clone(), Platform::Linux));
        linux.apply(&block_rule(9)).await.unwrap();
        linux.remove(&block_rule(9)).await.unwrap();

        let windows = RouteBlackhole::new(context(runner.clone(), Platform::Windows));
        windows.apply(&block_rule(9)).await.unwrap();
        windows.remove(&block_rule(9)).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "ip route add blackhole 192.168.1.9/32",
                "ip route del blackhole 192.168.1.9/32",
                "route add 192.168.1.9 mask 255.255.255.255 0.0.0.0 metric 1",
                "route delete 192.168.1.9",
            ]
        );
    }

    #[tokio::test]
    async fn test_neighbor_poison_local_subnet_only() {
        let runner = Arc::new(ScriptedRunner::new());
        let poison = NeighborPoison::new(
            context(runner.clone(), Platform::Linux),
            Some(Ipv4Addr::new(192, 168, 1, 2)),
        );

        poison.apply(&block_rule(40)).await.unwrap();
        let remote = Rule::new(RuleKind::Block, Ipv4Addr::new(8, 8, 8, 8), None, RuleParams::None);
        assert!(poison.apply(&remote).await.is_err());
        assert_eq!(runner.calls(), vec!["arp -s 192.168.1.40 00:00:00:00:00:00"]);

        let unknown = NeighborPoison::new(context(runner, Platform::Linux), None);
        assert!(unknown.apply(&block_rule(40)).await.is_err());
    }

    #[tokio::test]
    async fn test_packet_filter_rolls_back_and_reverses() {
        let runner = Arc::new(ScriptedRunner::new());
        let filter = PacketFilter::new(context(runner.clone(), Platform::Linux));
        let rule = block_rule(7);
        filter.apply(&rule).await.unwrap();
        filter.remove(&rule).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "iptables -I OUTPUT -d 192.168.1.7 -j DROP",
                "iptables -I INPUT -s 192.168.1.7 -j DROP",
                "iptables -D OUTPUT -d 192.168.1.7 -j DROP",
                "iptables -D INPUT -s 192.168.1.7 -j DROP",
            ]
        );

        let failing = Arc::new(ScriptedRunner::new().fail_on("iptables -I INPUT"));
        let filter = PacketFilter::new(context(failing.clone(), Platform::Linux));
        assert!(filter.apply(&rule).await.is_err());
        assert_eq!(
            failing.calls().last().unwrap(),
            "iptables -D OUTPUT -d 192.168.1.7 -j DROP"
        );
    }
}
