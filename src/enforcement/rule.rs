//! Enforcement rule model.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Block,
    Throttle,
    Redirect,
    Modify,
    Priority,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Block => "block",
            RuleKind::Throttle => "throttle",
            RuleKind::Redirect => "redirect",
            RuleKind::Modify => "modify",
            RuleKind::Priority => "priority",
        }
    }
}

impl FromStr for RuleKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(RuleKind::Block),
            "throttle" => Ok(RuleKind::Throttle),
            "redirect" => Ok(RuleKind::Redirect),
            "modify" => Ok(RuleKind::Modify),
            "priority" => Ok(RuleKind::Priority),
            other => Err(CoreError::Database(format!("unknown rule kind '{other}'"))),
        }
    }
}

/// The OS-level (or in-process) mechanism that enforces a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mechanism {
    WindowsFirewall,
    RouteBlackhole,
    NeighborPoison,
    PacketFilter,
    WindowsQos,
    TrafficControl,
    SoftwareShaper,
    PortProxy,
    NatRedirect,
    PacketModifier,
    QosPriority,
    DscpMark,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::WindowsFirewall => "windows-firewall",
            Mechanism::RouteBlackhole => "route-blackhole",
            Mechanism::NeighborPoison => "neighbor-poison",
            Mechanism::PacketFilter => "packet-filter",
            Mechanism::WindowsQos => "windows-qos",
            Mechanism::TrafficControl => "traffic-control",
            Mechanism::SoftwareShaper => "software-shaper",
            Mechanism::PortProxy => "port-proxy",
            Mechanism::NatRedirect => "nat-redirect",
            Mechanism::PacketModifier => "packet-modifier",
            Mechanism::QosPriority => "qos-priority",
            Mechanism::DscpMark => "dscp-mark",
        }
    }

    /// Enforced by a task inside this process; gone after a restart.
    pub fn is_in_process(&self) -> bool {
        matches!(self, Mechanism::SoftwareShaper | Mechanism::PacketModifier)
    }

    /// Only computes verdicts. Traffic changes only when a capture
    /// collaborator asks `TaskRegistry::verdict` and acts on the answer.
    pub fn is_advisory(&self) -> bool {
        self.is_in_process()
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [Mechanism; 12] = [
            Mechanism::WindowsFirewall,
            Mechanism::RouteBlackhole,
            Mechanism::NeighborPoison,
            Mechanism::PacketFilter,
            Mechanism::WindowsQos,
            Mechanism::TrafficControl,
            Mechanism::SoftwareShaper,
            Mechanism::PortProxy,
            Mechanism::NatRedirect,
            Mechanism::PacketModifier,
            Mechanism::QosPriority,
            Mechanism::DscpMark,
        ];
        ALL.into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CoreError::Database(format!("unknown mechanism '{s}'")))
    }
}

/// Shaping parameters. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleParams {
    pub bandwidth_mbps: Option<f64>,
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub loss_percent: Option<f64>,
}

impl ThrottleParams {
    pub fn bandwidth(mbps: f64) -> Self {
        Self {
            bandwidth_mbps: Some(mbps),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.bandwidth_mbps.is_none()
            && self.latency_ms.is_none()
            && self.jitter_ms.is_none()
            && self.loss_percent.is_none()
        {
            return Err(CoreError::MalformedTarget(
                "throttle needs a bandwidth, latency, jitter or loss value".into(),
            ));
        }
        if let Some(mbps) = self.bandwidth_mbps {
            if !mbps.is_finite() || mbps <= 0.0 {
                return Err(CoreError::MalformedTarget(format!(
                    "bandwidth must be a positive number of Mbps, got {mbps}"
                )));
            }
        }
        validate_percent("loss", self.loss_percent)
    }

    /// Bytes per second for the configured cap.
    pub fn bytes_per_second(&self) -> Option<u64> {
        self.bandwidth_mbps
            .map(|mbps| (mbps * 1_000_000.0 / 8.0).max(1.0) as u64)
    }
}

/// In-process packet modification settings. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyParams {
    pub delay_ms: Option<u32>,
    pub drop_percent: Option<f64>,
}

impl ModifyParams {
    pub fn validate(&self) -> CoreResult<()> {
        if self.delay_ms.is_none() && self.drop_percent.is_none() {
            return Err(CoreError::MalformedTarget(
                "modify needs a delay or drop percentage".into(),
            ));
        }
        validate_percent("drop", self.drop_percent)
    }
}

fn validate_percent(name: &str, value: Option<f64>) -> CoreResult<()> {
    match value {
        Some(p) if !(0.0..=100.0).contains(&p) => Err(CoreError::MalformedTarget(format!(
            "{name} percentage must be within 0-100, got {p}"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleParams {
    None,
    Throttle(ThrottleParams),
    Redirect { destination: Ipv4Addr },
    Modify(ModifyParams),
    Priority { dscp: u8 },
}

/// `Created → Applied → (Disabled ⇄ Applied) → Removed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Created,
    Applied,
    Disabled,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    pub target: Ipv4Addr,
    pub port: Option<u16>,
    pub mechanism: Mechanism,
    pub params: RuleParams,
    pub enabled: bool,
    pub state: RuleState,
    /// Unix seconds.
    pub created_at: i64,
    /// Set when the mechanism only answers verdict queries and nothing
    /// outside this process enforces the rule.
    #[serde(default)]
    pub advisory: bool,
}

impl Rule {
    pub fn new(kind: RuleKind, target: Ipv4Addr, port: Option<u16>, params: RuleParams) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            target,
            port,
            // Replaced by whichever mechanism succeeds.
            mechanism: Mechanism::PacketFilter,
            params,
            enabled: true,
            state: RuleState::Created,
            created_at: crate::db::chrono_timestamp(),
            advisory: false,
        }
    }

    pub fn throttle_params(&self) -> Option<&ThrottleParams> {
        match &self.params {
            RuleParams::Throttle(p) => Some(p),
            _ => None,
        }
    }

    pub fn modify_params(&self) -> Option<&ModifyParams> {
        match &self.params {
            RuleParams::Modify(p) => Some(p),
            _ => None,
        }
    }

    pub fn priority_dscp(&self) -> Option<u8> {
        match &self.params {
            RuleParams::Priority { dscp } => Some(*dscp),
            _ => None,
        }
    }

    pub fn redirect_destination(&self) -> Option<Ipv4Addr> {
        match &self.params {
            RuleParams::Redirect { destination } => Some(*destination),
            _ => None,
        }
    }
}
