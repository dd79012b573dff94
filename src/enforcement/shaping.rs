//! Throttle backends (QoS policy, `tc`, software shaper) and the in-process
//! packet modifier.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

use super::rule::ThrottleParams;
use super::tasks::{ShapingProfile, TaskRegistry};
use super::{EnforcementBackend, Mechanism, OsContext, Platform, Rule};

fn throttle_params(rule: &Rule) -> CoreResult<&ThrottleParams> {
    rule.throttle_params().ok_or_else(|| {
        CoreError::MalformedTarget(format!("rule {} carries no throttle parameters", rule.id))
    })
}

/// PowerShell `New-NetQosPolicy` with a throttle rate. Bandwidth only.
pub struct WindowsQos {
    ctx: OsContext,
}

impl WindowsQos {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EnforcementBackend for WindowsQos {
    fn mechanism(&self) -> Mechanism {
        Mechanism::WindowsQos
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let params = throttle_params(rule)?;
        if params.latency_ms.is_some() || params.jitter_ms.is_some() || params.loss_percent.is_some() {
            return Err(CoreError::MechanismUnavailable(
                "QoS policies cannot add latency, jitter or loss".into(),
            ));
        }
        let Some(bytes_per_second) = params.bytes_per_second() else {
            return Err(CoreError::MechanismUnavailable(
                "QoS policy needs a bandwidth cap".into(),
            ));
        };

        let name = self.ctx.rule_name(rule.kind, rule.target);
        let script = format!(
            "New-NetQosPolicy -Name '{name}' -IPDstPrefixMatchCondition '{}/32' \
             -ThrottleRateActionBitsPerSecond {} -PolicyStore ActiveStore -Confirm:$false",
            rule.target,
            bytes_per_second * 8
        );
        self.ctx.powershell(&script).await?;
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let name = self.ctx.rule_name(rule.kind, rule.target);
        let script = format!("Remove-NetQosPolicy -Name '{name}' -PolicyStore ActiveStore -Confirm:$false");
        self.ctx.powershell(&script).await?;
        Ok(())
    }
}

/// Linux `tc`: a root HTB qdisc shared by all targets, one class per target
/// with an optional netem child, and a u32 filter steering the target's
/// traffic into its class. The filter priority equals the class minor so
/// removal can address it.
pub struct TrafficControl {
    ctx: OsContext,
}

impl TrafficControl {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }

    fn class_minor(rule: &Rule) -> u32 {
        0x100 + rule.target.octets()[3] as u32
    }

    async fn interface(&self) -> CoreResult<String> {
        if let Some(iface) = &self.ctx.config().interface {
            return Ok(iface.clone());
        }
        let routes = self.ctx.run("ip", &["route", "show", "default"]).await?;
        parse_default_interface(&routes).ok_or_else(|| {
            CoreError::MechanismUnavailable("no default route to shape traffic on".into())
        })
    }

    async fn teardown(&self, iface: &str, rule: &Rule) -> CoreResult<()> {
        let minor = Self::class_minor(rule);
        let prio = minor.to_string();
        let classid = format!("1:{minor:x}");
        let filter = self
            .ctx
            .run(
                "tc",
                &["filter", "del", "dev", iface, "parent", "1:", "protocol", "ip", "prio", &prio, "u32"],
            )
            .await;
        let class = self
            .ctx
            .run("tc", &["class", "del", "dev", iface, "classid", &classid])
            .await;
        filter.and(class).map(|_| ())
    }

    async fn install(&self, iface: &str, rule: &Rule, params: &ThrottleParams) -> CoreResult<()> {
        let minor = Self::class_minor(rule);
        let classid = format!("1:{minor:x}");
        let rate = params
            .bandwidth_mbps
            .map(|mbps| format!("{}kbit", ((mbps * 1000.0).round() as u64).max(1)))
            .unwrap_or_else(|| "1000mbit".to_string());

        self.ctx
            .run(
                "tc",
                &["class", "add", "dev", iface, "parent", "1:", "classid", &classid, "htb", "rate", &rate],
            )
            .await?;

        let netem = netem_args(params);
        if !netem.is_empty() {
            let handle = format!("{minor:x}:");
            let mut args: Vec<&str> = vec![
                "qdisc", "add", "dev", iface, "parent", &classid, "handle", &handle, "netem",
            ];
            args.extend(netem.iter().map(String::as_str));
            self.ctx.run("tc", &args).await?;
        }

        let prio = minor.to_string();
        let dst = format!("{}/32", rule.target);
        self.ctx
            .run(
                "tc",
                &[
                    "filter", "add", "dev", iface, "protocol", "ip", "parent", "1:", "prio", &prio, "u32",
                    "match", "ip", "dst", &dst, "flowid", &classid,
                ],
            )
            .await?;
        Ok(())
    }
}

/// Interface named by `dev` in `ip route show default` output.
pub fn parse_default_interface(routes: &str) -> Option<String> {
    routes.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "dev" {
                return words.next().map(str::to_string);
            }
        }
        None
    })
}

fn netem_args(params: &ThrottleParams) -> Vec<String> {
    let mut args = Vec::new();
    if params.latency_ms.is_some() || params.jitter_ms.is_some() {
        args.push("delay".to_string());
        args.push(format!("{}ms", params.latency_ms.unwrap_or(0)));
        if let Some(jitter) = params.jitter_ms {
            args.push(format!("{jitter}ms"));
        }
    }
    if let Some(loss) = params.loss_percent {
        args.push("loss".to_string());
        args.push(format!("{loss}%"));
    }
    args
}

#[async_trait]
impl EnforcementBackend for TrafficControl {
    fn mechanism(&self) -> Mechanism {
        Mechanism::TrafficControl
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let params = throttle_params(rule)?;
        let iface = self.interface().await?;

        match self
            .ctx
            .run("tc", &["qdisc", "add", "dev", &iface, "root", "handle", "1:", "htb"])
            .await
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("File exists") => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = self.install(&iface, rule, params).await {
            if let Err(undo) = self.teardown(&iface, rule).await {
                tracing::warn!(
                    "Rollback of tc class 1:{:x} for {} on {iface} failed: {undo}",
                    Self::class_minor(rule),
                    rule.target
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let iface = self.interface().await?;
        self.teardown(&iface, rule).await
    }
}

/// Last-resort throttle: a per-rule task answering `TaskRegistry::verdict`.
/// Advisory only. No packet is slowed unless a capture collaborator asks for
/// verdicts, so rules it applies carry `advisory: true`.
pub struct SoftwareShaper {
    registry: Arc<TaskRegistry>,
}

impl SoftwareShaper {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EnforcementBackend for SoftwareShaper {
    fn mechanism(&self) -> Mechanism {
        Mechanism::SoftwareShaper
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        let params = throttle_params(rule)?;
        self.registry
            .start(&rule.id, rule.target, ShapingProfile::from_throttle(params));
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        if let Some(stats) = self.registry.stop(&rule.id).await {
            tracing::debug!("Software shaper for {} finished: {stats:?}", rule.target);
        }
        Ok(())
    }
}

/// Delays and drops packets for the target from a per-rule task.
pub struct PacketModifier {
    registry: Arc<TaskRegistry>,
}

impl PacketModifier {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EnforcementBackend for PacketModifier {
    fn mechanism(&self) -> Mechanism {
        Mechanism::PacketModifier
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        let params = rule.modify_params().ok_or_else(|| {
            CoreError::MalformedTarget(format!("rule {} carries no modify parameters", rule.id))
        })?;
        self.registry
            .start(&rule.id, rule.target, ShapingProfile::from_modify(params));
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.registry.stop(&rule.id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::super::command::testing::ScriptedRunner;
    use super::super::rule::{ModifyParams, RuleKind, RuleParams};
    use super::super::tasks::Verdict;
    use super::super::testing::context;
    use super::*;

    fn throttle_rule(params: ThrottleParams) -> Rule {
        Rule::new(
            RuleKind::Throttle,
            Ipv4Addr::new(192, 168, 1, 5),
            None,
            RuleParams::Throttle(params),
        )
    }

    #[test]
    fn test_parse_default_interface() {
        let out = "default via 192.168.1.1 dev wlp3s0 proto dhcp metric 600\n";
        assert_eq!(parse_default_interface(out).as_deref(), Some("wlp3s0"));
        assert_eq!(parse_default_interface(""), None);
    }

    #[tokio::test]
    async fn test_windows_qos_bandwidth_only() {
        let runner = Arc::new(ScriptedRunner::new());
        let qos = WindowsQos::new(context(runner.clone(), Platform::Windows));

        qos.apply(&throttle_rule(ThrottleParams::bandwidth(2.0))).await.unwrap();
        let calls = runner.calls();
        assert!(calls[0].starts_with("powershell -NoProfile -NonInteractive -Command New-NetQosPolicy"));
        assert!(calls[0].contains("-Name 'LanWard_Throttle_192_168_1_5'"));
        assert!(calls[0].contains("-ThrottleRateActionBitsPerSecond 2000000"));

        let mut lagged = ThrottleParams::bandwidth(2.0);
        lagged.latency_ms = Some(50);
        let err = qos.apply(&throttle_rule(lagged)).await.unwrap_err();
        assert_eq!(err.kind(), "MechanismUnavailable");
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_traffic_control_builds_class_netem_and_filter() {
        let runner = Arc::new(
            ScriptedRunner::new().respond("ip route show default", "default via 10.0.0.1 dev eth0"),
        );
        let tc = TrafficControl::new(context(runner.clone(), Platform::Linux));
        let rule = throttle_rule(ThrottleParams {
            bandwidth_mbps: Some(1.5),
            latency_ms: Some(100),
            jitter_ms: Some(10),
            loss_percent: Some(2.0),
        });

        tc.apply(&rule).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "ip route show default",
                "tc qdisc add dev eth0 root handle 1: htb",
                "tc class add dev eth0 parent 1: classid 1:105 htb rate 1500kbit",
                "tc qdisc add dev eth0 parent 1:105 handle 105: netem delay 100ms 10ms loss 2%",
                "tc filter add dev eth0 protocol ip parent 1: prio 261 u32 match ip dst 192.168.1.5/32 flowid 1:105",
            ]
        );

        runner.clear();
        tc.remove(&rule).await.unwrap();
        assert_eq!(
            runner.calls()[1..],
            [
                "tc filter del dev eth0 parent 1: protocol ip prio 261 u32",
                "tc class del dev eth0 classid 1:105",
            ]
        );
    }

    #[tokio::test]
    async fn test_traffic_control_tolerates_existing_root_and_cleans_up_failures() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("ip route show default", "default via 10.0.0.1 dev eth0")
                .fail_on("tc filter add"),
        );
        let config = crate::config::EnforcementConfig {
            interface: Some("br0".into()),
            ..Default::default()
        };
        let tc = TrafficControl::new(OsContext::new(runner.clone(), Platform::Linux, config));

        let err = tc.apply(&throttle_rule(ThrottleParams::bandwidth(1.0))).await.unwrap_err();
        assert_eq!(err.kind(), "MechanismUnavailable");
        let calls = runner.calls();
        // Configured interface skips the route lookup.
        assert!(calls[0].starts_with("tc qdisc add dev br0"));
        assert!(calls.iter().any(|c| c == "tc class del dev br0 classid 1:105"));
    }

    #[tokio::test]
    async fn test_software_shaper_registers_task() {
        let registry = Arc::new(TaskRegistry::new());
        let shaper = SoftwareShaper::new(registry.clone());
        let rule = throttle_rule(ThrottleParams {
            bandwidth_mbps: None,
            latency_ms: None,
            jitter_ms: None,
            loss_percent: Some(100.0),
        });

        shaper.apply(&rule).await.unwrap();
        assert!(registry.is_running(&rule.id));
        assert_eq!(registry.verdict(rule.target, 100).await, Verdict::Drop);

        shaper.remove(&rule).await.unwrap();
        assert!(!registry.is_running(&rule.id));
        assert_eq!(registry.verdict(rule.target, 100).await, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_packet_modifier_requires_modify_params() {
        let registry = Arc::new(TaskRegistry::new());
        let modifier = PacketModifier::new(registry.clone());
        let err = modifier
            .apply(&throttle_rule(ThrottleParams::bandwidth(1.0)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MalformedTarget");

        let rule = Rule::new(
            RuleKind::Modify,
            Ipv4Addr::new(192, 168, 1, 6),
            None,
            RuleParams::Modify(ModifyParams {
                delay_ms: Some(40),
                drop_percent: None,
            }),
        );
        modifier.apply(&rule).await.unwrap();
        assert!(matches!(
            registry.verdict(rule.target, 100).await,
            Verdict::Delay(d) if d.as_millis() == 40
        ));
        modifier.remove(&rule).await.unwrap();
        assert!(registry.is_empty());
    }
}
