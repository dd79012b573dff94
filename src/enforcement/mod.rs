//! Traffic enforcement: block, throttle, redirect and modify.
//!
//! Each OS facility is one [`EnforcementBackend`]. The [`ManipulationEngine`]
//! tries an ordered chain of backends per action and records the first one
//! that succeeds on the rule, so removal can run that backend's inverse.
//!
//! - [`block`]: firewall, route black-hole, neighbor poisoning, packet filter
//! - [`shaping`]: QoS policy, `tc` queueing, in-process software shaper
//! - [`redirect`]: port proxy and NAT
//! - [`priority`]: DSCP marking through a QoS policy or the mangle table
//! - [`tasks`]: per-rule background tasks for in-process shaping and modification

pub mod block;
pub mod command;
pub mod engine;
pub mod priority;
pub mod redirect;
pub mod rule;
pub mod shaping;
pub mod tasks;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EnforcementConfig;
use crate::error::{CoreError, CoreResult};

pub use command::{CommandRunner, Platform, SystemCommandRunner};
pub use engine::{ManipulationEngine, RemovalOutcome};
pub use rule::{Mechanism, ModifyParams, Rule, RuleKind, RuleParams, RuleState, ThrottleParams};
pub use tasks::{TaskRegistry, Verdict};

/// One enforcement mechanism. `remove` reverses exactly what `apply` did for
/// the same rule.
#[async_trait]
pub trait EnforcementBackend: Send + Sync {
    fn mechanism(&self) -> Mechanism;

    async fn apply(&self, rule: &Rule) -> CoreResult<()>;

    async fn remove(&self, rule: &Rule) -> CoreResult<()>;
}

/// What every command-driven backend needs: a runner, the platform it runs on
/// and the command settings.
#[derive(Clone)]
pub struct OsContext {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    config: EnforcementConfig,
}

impl OsContext {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform, config: EnforcementConfig) -> Self {
        Self {
            runner,
            platform,
            config,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn config(&self) -> &EnforcementConfig {
        &self.config
    }

    /// Fail fast when `mechanism` does not exist on this platform.
    pub fn require(&self, platform: Platform, mechanism: Mechanism) -> CoreResult<()> {
        if self.platform == platform {
            Ok(())
        } else {
            Err(CoreError::MechanismUnavailable(format!(
                "{mechanism} is not available on {:?}",
                self.platform
            )))
        }
    }

    pub async fn run(&self, program: &str, args: &[&str]) -> CoreResult<String> {
        self.runner
            .run_checked(program, args, self.config.command_timeout())
            .await
    }

    /// For operations known to take long, such as PowerShell cmdlets.
    pub async fn run_slow(&self, program: &str, args: &[&str]) -> CoreResult<String> {
        self.runner
            .run_checked(program, args, self.config.slow_command_timeout())
            .await
    }

    pub async fn powershell(&self, script: &str) -> CoreResult<String> {
        self.run_slow("powershell", &["-NoProfile", "-NonInteractive", "-Command", script])
            .await
    }

    /// `LanWard_Block_192_168_1_5`, unique per kind and target.
    pub fn rule_name(&self, kind: RuleKind, target: Ipv4Addr) -> String {
        let kind = match kind {
            RuleKind::Block => "Block",
            RuleKind::Throttle => "Throttle",
            RuleKind::Redirect => "Redirect",
            RuleKind::Modify => "Modify",
            RuleKind::Priority => "Priority",
        };
        format!(
            "{}_{kind}_{}",
            self.config.rule_name_prefix,
            target.to_string().replace('.', "_")
        )
    }

    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Backend that records calls and succeeds unless told to fail.
    pub struct RecordingBackend {
        mechanism: Mechanism,
        fail_apply: bool,
        fail_remove: bool,
        refuse_next: Arc<AtomicBool>,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingBackend {
        pub fn new(mechanism: Mechanism, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                mechanism,
                fail_apply: false,
                fail_remove: false,
                refuse_next: Arc::new(AtomicBool::new(false)),
                log,
            }
        }

        pub fn failing(mut self) -> Self {
            self.fail_apply = true;
            self
        }

        pub fn failing_remove(mut self) -> Self {
            self.fail_remove = true;
            self
        }

        /// Setting the returned flag makes the next apply fail once.
        pub fn refusal_switch(&self) -> Arc<AtomicBool> {
            self.refuse_next.clone()
        }
    }

    #[async_trait]
    impl EnforcementBackend for RecordingBackend {
        fn mechanism(&self) -> Mechanism {
            self.mechanism
        }

        async fn apply(&self, rule: &Rule) -> CoreResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("apply {} {}", self.mechanism, rule.target));
            if self.fail_apply || self.refuse_next.swap(false, Ordering::SeqCst) {
                Err(CoreError::MechanismUnavailable(format!("{} refused", self.mechanism)))
            } else {
                Ok(())
            }
        }

        async fn remove(&self, rule: &Rule) -> CoreResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("remove {} {}", self.mechanism, rule.target));
            if self.fail_remove {
                Err(CoreError::MechanismUnavailable(format!("{} refused", self.mechanism)))
            } else {
                Ok(())
            }
        }
    }

    pub fn context(runner: Arc<dyn CommandRunner>, platform: Platform) -> OsContext {
        OsContext::new(runner, platform, EnforcementConfig::default())
    }
}
