//! Rule bookkeeping and fallback chains.
//!
//! Every mutation holds the rule map lock for the whole attempt chain, so an
//! apply and a remove for the same target can never interleave.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::EnforcementConfig;
use crate::core::events::{CoreEvent, EventBus};
use crate::db::Database;
use crate::error::{CoreError, CoreResult};

use super::block::{NeighborPoison, PacketFilter, RouteBlackhole, WindowsFirewall};
use super::priority::{DscpMark, QosPriority};
use super::redirect::{NatRedirect, PortProxy};
use super::rule::{Mechanism, ModifyParams, RuleKind, RuleParams, RuleState, ThrottleParams};
use super::shaping::{PacketModifier, SoftwareShaper, TrafficControl, WindowsQos};
use super::tasks::TaskRegistry;
use super::{CommandRunner, EnforcementBackend, OsContext, Platform, Rule};

type Chain = Vec<Arc<dyn EnforcementBackend>>;

/// Ordered backends per action. The first one that applies wins.
#[derive(Default)]
pub struct BackendChains {
    pub block: Chain,
    pub throttle: Chain,
    pub redirect: Chain,
    pub modify: Chain,
    pub priority: Chain,
}

impl BackendChains {
    /// The OS-command chains for this host plus the in-process fallbacks.
    pub fn system(ctx: OsContext, local: Option<Ipv4Addr>, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            block: vec![
                Arc::new(WindowsFirewall::new(ctx.clone())),
                Arc::new(RouteBlackhole::new(ctx.clone())),
                Arc::new(NeighborPoison::new(ctx.clone(), local)),
                Arc::new(PacketFilter::new(ctx.clone())),
            ],
            throttle: vec![
                Arc::new(WindowsQos::new(ctx.clone())),
                Arc::new(TrafficControl::new(ctx.clone())),
                Arc::new(SoftwareShaper::new(tasks.clone())),
            ],
            redirect: vec![
                Arc::new(PortProxy::new(ctx.clone())),
                Arc::new(NatRedirect::new(ctx.clone())),
            ],
            modify: vec![Arc::new(PacketModifier::new(tasks))],
            priority: vec![
                Arc::new(QosPriority::new(ctx.clone())),
                Arc::new(DscpMark::new(ctx)),
            ],
        }
    }

    fn for_kind(&self, kind: RuleKind) -> &[Arc<dyn EnforcementBackend>] {
        match kind {
            RuleKind::Block => &self.block,
            RuleKind::Throttle => &self.throttle,
            RuleKind::Redirect => &self.redirect,
            RuleKind::Modify => &self.modify,
            RuleKind::Priority => &self.priority,
        }
    }
}

/// Result of removing a rule. The record is gone either way; a failed inverse
/// means OS state may still carry the rule's effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub rule_id: String,
    pub mechanism: Mechanism,
    pub inverse_succeeded: bool,
}

pub struct ManipulationEngine {
    rules: Mutex<HashMap<String, Rule>>,
    chains: BackendChains,
    tasks: Arc<TaskRegistry>,
    db: Option<Arc<Database>>,
    bus: EventBus,
}

impl ManipulationEngine {
    pub fn new(
        chains: BackendChains,
        tasks: Arc<TaskRegistry>,
        db: Option<Arc<Database>>,
        bus: EventBus,
    ) -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            chains,
            tasks,
            db,
            bus,
        }
    }

    /// Engine over the real OS mechanisms of this host.
    pub fn system(
        config: EnforcementConfig,
        runner: Arc<dyn CommandRunner>,
        local: Option<Ipv4Addr>,
        db: Option<Arc<Database>>,
        bus: EventBus,
    ) -> Self {
        let tasks = Arc::new(TaskRegistry::new());
        let ctx = OsContext::new(runner, Platform::current(), config);
        let chains = BackendChains::system(ctx, local, tasks.clone());
        Self::new(chains, tasks, db, bus)
    }

    /// Per-rule shaping tasks, for a capture collaborator asking for verdicts.
    pub fn task_registry(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Restore persisted rules. In-process rules cannot survive a restart and
    /// come back disabled; re-enable them to restart their tasks.
    pub async fn load(&self) -> CoreResult<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let stored = db.load_rules()?;
        let mut rules = self.rules.lock().await;
        for mut rule in stored {
            if rule.enabled && rule.mechanism.is_in_process() {
                rule.enabled = false;
                rule.state = RuleState::Disabled;
                if let Err(e) = db.set_rule_enabled(&rule.id, false) {
                    tracing::error!("Failed to mark rule {} disabled: {e:#}", rule.id);
                }
            }
            rules.insert(rule.id.clone(), rule);
        }
        tracing::info!("Loaded {} enforcement rules", rules.len());
        Ok(rules.len())
    }

    /// Block all traffic for `target`. Blocking an already blocked address
    /// returns the existing rule without touching the OS again.
    pub async fn block(&self, target: Ipv4Addr) -> CoreResult<Rule> {
        validate_target(target)?;
        let mut rules = self.rules.lock().await;
        if let Some(existing) = rules
            .values()
            .find(|r| r.kind == RuleKind::Block && r.target == target && r.enabled)
        {
            tracing::debug!("{target} is already blocked by rule {}", existing.id);
            return Ok(existing.clone());
        }

        let rule = Rule::new(RuleKind::Block, target, None, RuleParams::None);
        self.apply_new(&mut rules, rule).await
    }

    /// Remove every block rule for `target`. Returns how many were removed;
    /// zero is a successful no-op.
    pub async fn unblock(&self, target: Ipv4Addr) -> CoreResult<usize> {
        validate_target(target)?;
        let mut rules = self.rules.lock().await;
        let ids: Vec<String> = rules
            .values()
            .filter(|r| r.kind == RuleKind::Block && r.target == target)
            .map(|r| r.id.clone())
            .collect();
        for id in &ids {
            self.remove_locked(&mut rules, id).await?;
        }
        if ids.is_empty() {
            tracing::debug!("No block rule for {target}, nothing to unblock");
        }
        Ok(ids.len())
    }

    /// Throttle `target`, replacing any previous throttle on it.
    pub async fn throttle(&self, target: Ipv4Addr, params: ThrottleParams) -> CoreResult<Rule> {
        validate_target(target)?;
        params.validate()?;
        let mut rules = self.rules.lock().await;
        let rule = Rule::new(RuleKind::Throttle, target, None, RuleParams::Throttle(params));
        self.replace_locked(&mut rules, |r| r.kind == RuleKind::Throttle && r.target == target, rule)
            .await
    }

    /// Redirect traffic for `source` (optionally one TCP port) to `destination`,
    /// replacing a previous redirect of the same source and port.
    pub async fn redirect(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        port: Option<u16>,
    ) -> CoreResult<Rule> {
        validate_target(source)?;
        validate_target(destination)?;
        if source == destination {
            return Err(CoreError::MalformedTarget(format!(
                "cannot redirect {source} to itself"
            )));
        }
        if port == Some(0) {
            return Err(CoreError::MalformedTarget("port 0 is not a valid redirect port".into()));
        }
        let mut rules = self.rules.lock().await;
        let rule = Rule::new(
            RuleKind::Redirect,
            source,
            port,
            RuleParams::Redirect { destination },
        );
        self.replace_locked(
            &mut rules,
            |r| r.kind == RuleKind::Redirect && r.target == source && r.port == port,
            rule,
        )
        .await
    }

    /// Delay or drop packets for `target` from a background task.
    pub async fn modify(&self, target: Ipv4Addr, params: ModifyParams) -> CoreResult<Rule> {
        validate_target(target)?;
        params.validate()?;
        let mut rules = self.rules.lock().await;
        let rule = Rule::new(RuleKind::Modify, target, None, RuleParams::Modify(params));
        self.replace_locked(&mut rules, |r| r.kind == RuleKind::Modify && r.target == target, rule)
            .await
    }

    /// Mark traffic from `target` to `port` with `dscp`. Prioritizing the
    /// same host and port again returns the existing rule.
    pub async fn prioritize(&self, target: Ipv4Addr, port: u16, dscp: u8) -> CoreResult<Rule> {
        validate_target(target)?;
        if port == 0 {
            return Err(CoreError::MalformedTarget("port 0 cannot be prioritized".into()));
        }
        if dscp > 63 {
            return Err(CoreError::MalformedTarget(format!(
                "DSCP value must be within 0-63, got {dscp}"
            )));
        }
        let mut rules = self.rules.lock().await;
        if let Some(existing) = rules.values().find(|r| {
            r.kind == RuleKind::Priority && r.target == target && r.port == Some(port) && r.enabled
        }) {
            tracing::debug!("{target}:{port} is already prioritized by rule {}", existing.id);
            return Ok(existing.clone());
        }

        let rule = Rule::new(RuleKind::Priority, target, Some(port), RuleParams::Priority { dscp });
        self.apply_new(&mut rules, rule).await
    }

    /// All rules, oldest first.
    pub async fn list_rules(&self) -> Vec<Rule> {
        let rules = self.rules.lock().await;
        let mut list: Vec<Rule> = rules.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules.lock().await.get(id).cloned()
    }

    /// Reverse the rule's mechanism and delete the record. The record is
    /// deleted even when the inverse fails; the outcome says which happened.
    pub async fn remove_rule(&self, id: &str) -> CoreResult<RemovalOutcome> {
        let mut rules = self.rules.lock().await;
        self.remove_locked(&mut rules, id).await
    }

    /// Re-apply a disabled rule, preferring the mechanism it last used.
    pub async fn enable_rule(&self, id: &str) -> CoreResult<Rule> {
        let mut rules = self.rules.lock().await;
        let mut rule = rules
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("rule {id} not found")))?;
        if rule.enabled {
            return Ok(rule);
        }

        let preferred = rule.mechanism;
        self.run_chain(&mut rule, Some(preferred)).await?;
        self.persist(&rule);
        rules.insert(rule.id.clone(), rule.clone());
        self.bus.publish(CoreEvent::RuleStateChanged {
            rule_id: rule.id.clone(),
            enabled: true,
        });
        Ok(rule)
    }

    /// Reverse the rule's mechanism but keep the record. If the inverse fails
    /// the rule stays enabled and the error is returned.
    pub async fn disable_rule(&self, id: &str) -> CoreResult<Rule> {
        let mut rules = self.rules.lock().await;
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {id} not found")))?;
        if !rule.enabled {
            return Ok(rule.clone());
        }

        self.reverse(rule).await?;
        rule.enabled = false;
        rule.state = RuleState::Disabled;
        let rule = rule.clone();
        self.persist(&rule);
        self.bus.publish(CoreEvent::RuleStateChanged {
            rule_id: rule.id.clone(),
            enabled: false,
        });
        tracing::info!("Disabled rule {} ({} {})", rule.id, rule.kind.as_str(), rule.target);
        Ok(rule)
    }

    /// Remove every rule. Returns how many were removed.
    pub async fn clear_all(&self) -> CoreResult<usize> {
        let mut rules = self.rules.lock().await;
        let ids: Vec<String> = rules.keys().cloned().collect();
        for id in &ids {
            self.remove_locked(&mut rules, id).await?;
        }
        Ok(ids.len())
    }

    /// Stop in-process tasks. OS-level rules stay in place and persisted.
    pub async fn close(&self) {
        self.tasks.stop_all().await;
    }

    async fn apply_new(&self, rules: &mut HashMap<String, Rule>, mut rule: Rule) -> CoreResult<Rule> {
        self.run_chain(&mut rule, None).await?;
        self.persist(&rule);
        rules.insert(rule.id.clone(), rule.clone());
        self.bus.publish(CoreEvent::RuleApplied(rule.clone()));
        Ok(rule)
    }

    /// Try the chain for the rule's kind in order, `preferred` first. On
    /// success the rule records the mechanism that worked.
    async fn run_chain(&self, rule: &mut Rule, preferred: Option<Mechanism>) -> CoreResult<()> {
        let chain = self.chains.for_kind(rule.kind);
        let ordered = chain
            .iter()
            .filter(|b| Some(b.mechanism()) == preferred)
            .chain(chain.iter().filter(|b| Some(b.mechanism()) != preferred));

        let mut attempts = Vec::new();
        for backend in ordered {
            match backend.apply(rule).await {
                Ok(()) => {
                    rule.mechanism = backend.mechanism();
                    rule.advisory = rule.mechanism.is_advisory();
                    rule.enabled = true;
                    rule.state = RuleState::Applied;
                    if rule.advisory {
                        tracing::warn!(
                            "{} for {} fell back to {}; it is enforced only where verdicts are consulted",
                            rule.kind.as_str(),
                            rule.target,
                            rule.mechanism
                        );
                    } else {
                        tracing::info!(
                            "Applied {} for {} via {}",
                            rule.kind.as_str(),
                            rule.target,
                            rule.mechanism
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "{} for {} via {} failed: {e}",
                        rule.kind.as_str(),
                        rule.target,
                        backend.mechanism()
                    );
                    attempts.push(backend.mechanism().to_string());
                }
            }
        }

        tracing::error!(
            "No enforcement mechanism could {} {}",
            rule.kind.as_str(),
            rule.target
        );
        Err(CoreError::AllMechanismsFailed {
            action: format!("{} {}", rule.kind.as_str(), rule.target),
            attempts,
        })
    }

    fn backend_for(&self, rule: &Rule) -> CoreResult<&Arc<dyn EnforcementBackend>> {
        self.chains
            .for_kind(rule.kind)
            .iter()
            .find(|b| b.mechanism() == rule.mechanism)
            .ok_or_else(|| {
                CoreError::MechanismUnavailable(format!(
                    "no {} backend for {} rules",
                    rule.mechanism,
                    rule.kind.as_str()
                ))
            })
    }

    async fn reverse(&self, rule: &Rule) -> CoreResult<()> {
        self.backend_for(rule)?.remove(rule).await
    }

    async fn reapply(&self, rule: &Rule) -> CoreResult<()> {
        self.backend_for(rule)?.apply(rule).await
    }

    /// Install `rule` in place of the records `matches` selects. Old and new
    /// rules share OS objects, so the old effects are reversed first. If no
    /// mechanism takes the new rule the old ones are re-applied and their
    /// records stay as they were.
    async fn replace_locked<F>(
        &self,
        rules: &mut HashMap<String, Rule>,
        matches: F,
        mut rule: Rule,
    ) -> CoreResult<Rule>
    where
        F: Fn(&Rule) -> bool,
    {
        let previous: Vec<Rule> = rules.values().filter(|r| matches(r)).cloned().collect();
        let mut reversed: Vec<&Rule> = Vec::new();
        for old in previous.iter().filter(|r| r.enabled) {
            if let Err(e) = self.reverse(old).await {
                tracing::error!(
                    "Cannot replace rule {}: reversing {} failed: {e}",
                    old.id,
                    old.mechanism
                );
                self.restore(rules, &reversed).await;
                return Err(e);
            }
            reversed.push(old);
        }

        if let Err(e) = self.run_chain(&mut rule, None).await {
            self.restore(rules, &reversed).await;
            return Err(e);
        }

        for old in &previous {
            rules.remove(&old.id);
            self.forget(old, true);
        }
        self.persist(&rule);
        rules.insert(rule.id.clone(), rule.clone());
        self.bus.publish(CoreEvent::RuleApplied(rule.clone()));
        Ok(rule)
    }

    /// Put back rules reversed for a replacement that did not go through. A
    /// rule that cannot be restored is kept but marked disabled.
    async fn restore(&self, rules: &mut HashMap<String, Rule>, reversed: &[&Rule]) {
        for old in reversed {
            match self.reapply(old).await {
                Ok(()) => tracing::info!("Restored rule {} via {}", old.id, old.mechanism),
                Err(e) => {
                    tracing::error!("Failed to restore rule {} via {}: {e}", old.id, old.mechanism);
                    if let Some(stored) = rules.get_mut(&old.id) {
                        stored.enabled = false;
                        stored.state = RuleState::Disabled;
                        let stored = stored.clone();
                        self.persist(&stored);
                        self.bus.publish(CoreEvent::RuleStateChanged {
                            rule_id: stored.id,
                            enabled: false,
                        });
                    }
                }
            }
        }
    }

    async fn remove_locked(&self, rules: &mut HashMap<String, Rule>, id: &str) -> CoreResult<RemovalOutcome> {
        let rule = rules
            .remove(id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {id} not found")))?;

        let inverse_succeeded = if rule.enabled {
            match self.reverse(&rule).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(
                        "Failed to reverse {} for rule {} ({}); OS state may still carry it: {e}",
                        rule.mechanism,
                        rule.id,
                        rule.target
                    );
                    false
                }
            }
        } else {
            true
        };

        self.forget(&rule, inverse_succeeded);
        Ok(RemovalOutcome {
            rule_id: rule.id,
            mechanism: rule.mechanism,
            inverse_succeeded,
        })
    }

    /// Drop the stored copy of a rule already taken out of the map.
    fn forget(&self, rule: &Rule, inverse_succeeded: bool) {
        if let Some(db) = &self.db {
            if let Err(e) = db.delete_rule(&rule.id) {
                tracing::error!("Failed to delete stored rule {}: {e:#}", rule.id);
            }
        }
        tracing::info!(
            "Removed rule {} ({} {} via {})",
            rule.id,
            rule.kind.as_str(),
            rule.target,
            rule.mechanism
        );
        self.bus.publish(CoreEvent::RuleRemoved {
            rule_id: rule.id.clone(),
            inverse_succeeded,
        });
    }

    fn persist(&self, rule: &Rule) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_rule(rule) {
                tracing::error!("Failed to persist rule {}: {e:#}", rule.id);
            }
        }
    }
}

/// Reject addresses no enforcement mechanism can meaningfully target.
pub fn validate_target(addr: Ipv4Addr) -> CoreResult<()> {
    if addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() || addr.is_loopback() {
        return Err(CoreError::MalformedTarget(format!(
            "{addr} is not a valid enforcement target"
        )));
    }
    Ok(())
}
