//! Priority backends. A priority rule marks traffic from its target to one
//! destination port with a DSCP value so upstream queues favor it.

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

use super::{EnforcementBackend, Mechanism, OsContext, Platform, Rule};

/// Expedited forwarding.
pub const DEFAULT_DSCP: u8 = 46;

/// Port and DSCP value of a priority rule.
fn priority_spec(rule: &Rule) -> CoreResult<(u16, u8)> {
    match (rule.port, rule.priority_dscp()) {
        (Some(port), Some(dscp)) if port != 0 => Ok((port, dscp)),
        _ => Err(CoreError::MalformedTarget(format!(
            "rule {} needs a port and a DSCP value to prioritize",
            rule.id
        ))),
    }
}

/// PowerShell `New-NetQosPolicy` with a DSCP action, matched on the source
/// host and destination port.
pub struct QosPriority {
    ctx: OsContext,
}

impl QosPriority {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }

    fn name(&self, rule: &Rule, port: u16) -> String {
        format!("{}_{port}", self.ctx.rule_name(rule.kind, rule.target))
    }
}

#[async_trait]
impl EnforcementBackend for QosPriority {
    fn mechanism(&self) -> Mechanism {
        Mechanism::QosPriority
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let (port, dscp) = priority_spec(rule)?;
        let script = format!(
            "New-NetQosPolicy -Name '{}' -IPSrcPrefixMatchCondition '{}/32' \
             -IPDstPortMatchCondition {port} -DSCPAction {dscp} -PolicyStore ActiveStore -Confirm:$false",
            self.name(rule, port),
            rule.target
        );
        self.ctx.powershell(&script).await?;
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Windows, self.mechanism())?;
        let (port, _) = priority_spec(rule)?;
        let script = format!(
            "Remove-NetQosPolicy -Name '{}' -PolicyStore ActiveStore -Confirm:$false",
            self.name(rule, port)
        );
        self.ctx.powershell(&script).await?;
        Ok(())
    }
}

/// `iptables -t mangle` DSCP rules in POSTROUTING, one per transport
/// protocol, so both local and forwarded traffic is marked.
pub struct DscpMark {
    ctx: OsContext,
}

impl DscpMark {
    pub fn new(ctx: OsContext) -> Self {
        Self { ctx }
    }

    async fn mangle(&self, op: &str, rule: &Rule, proto: &str, port: u16, dscp: u8) -> CoreResult<String> {
        let source = format!("{}/32", rule.target);
        let port = port.to_string();
        let dscp = dscp.to_string();
        self.ctx
            .run(
                "iptables",
                &[
                    "-t", "mangle", op, "POSTROUTING", "-s", &source, "-p", proto, "--dport", &port, "-j",
                    "DSCP", "--set-dscp", &dscp,
                ],
            )
            .await
    }
}

const PROTOCOLS: [&str; 2] = ["udp", "tcp"];

#[async_trait]
impl EnforcementBackend for DscpMark {
    fn mechanism(&self) -> Mechanism {
        Mechanism::DscpMark
    }

    async fn apply(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let (port, dscp) = priority_spec(rule)?;

        let mut added: Vec<&str> = Vec::new();
        for proto in PROTOCOLS {
            if let Err(e) = self.mangle("-A", rule, proto, port, dscp).await {
                for proto in &added {
                    if let Err(undo) = self.mangle("-D", rule, proto, port, dscp).await {
                        tracing::warn!(
                            "Rollback of {proto} DSCP mark for {}:{port} failed: {undo}",
                            rule.target
                        );
                    }
                }
                return Err(e);
            }
            added.push(proto);
        }
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> CoreResult<()> {
        self.ctx.require(Platform::Linux, self.mechanism())?;
        let (port, dscp) = priority_spec(rule)?;
        let mut first_error = None;
        for proto in PROTOCOLS {
            if let Err(e) = self.mangle("-D", rule, proto, port, dscp).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
