//! Per-rule background tasks for in-process shaping and packet modification.
//!
//! Each active rule owns one tokio task. A capture collaborator asks
//! [`TaskRegistry::verdict`] what to do with a packet for a target; the
//! registry forwards the question to every task for that target and combines
//! the answers. Dropping a rule's channel ends its task.
//!
//! Rate limiting uses a token bucket with a burst allowance of 2x the rate.

use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::rule::{ModifyParams, ThrottleParams};

const QUERY_QUEUE: usize = 256;

/// What to do with one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Delay(Duration),
    Drop,
}

/// Settings a shaping task applies to every packet for its target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapingProfile {
    pub bytes_per_second: Option<u64>,
    pub delay: Duration,
    pub jitter: Duration,
    pub loss_percent: f64,
}

impl ShapingProfile {
    pub fn from_throttle(params: &ThrottleParams) -> Self {
        Self {
            bytes_per_second: params.bytes_per_second(),
            delay: Duration::from_millis(params.latency_ms.unwrap_or(0) as u64),
            jitter: Duration::from_millis(params.jitter_ms.unwrap_or(0) as u64),
            loss_percent: params.loss_percent.unwrap_or(0.0),
        }
    }

    pub fn from_modify(params: &ModifyParams) -> Self {
        Self {
            bytes_per_second: None,
            delay: Duration::from_millis(params.delay_ms.unwrap_or(0) as u64),
            jitter: Duration::ZERO,
            loss_percent: params.drop_percent.unwrap_or(0.0),
        }
    }
}

/// Packets a task has decided on so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub passed: u64,
    pub delayed: u64,
    pub dropped: u64,
}

struct PacketQuery {
    len: usize,
    reply: oneshot::Sender<Verdict>,
}

struct TaskHandle {
    target: Ipv4Addr,
    sender: mpsc::Sender<PacketQuery>,
    join: JoinHandle<TaskStats>,
}

/// Deterministic shaping state owned by one task.
struct Shaper {
    limiter: Option<DefaultDirectRateLimiter>,
    clock: DefaultClock,
    profile: ShapingProfile,
    loss_accumulator: f64,
    seq: u64,
}

impl Shaper {
    fn new(profile: ShapingProfile) -> Self {
        let limiter = profile.bytes_per_second.map(|bps| {
            let rate = bps.clamp(1, u32::MAX as u64 / 2) as u32;
            let per_second = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
            let burst = NonZeroU32::new(rate.saturating_mul(2)).unwrap_or(per_second);
            RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst))
        });
        Self {
            limiter,
            clock: DefaultClock::default(),
            profile,
            loss_accumulator: 0.0,
            seq: 0,
        }
    }

    fn decide(&mut self, len: usize) -> Verdict {
        self.seq += 1;

        // Evenly spaced drops: with 25% loss every fourth packet goes.
        if self.profile.loss_percent > 0.0 {
            self.loss_accumulator += self.profile.loss_percent / 100.0;
            if self.loss_accumulator >= 1.0 {
                self.loss_accumulator -= 1.0;
                return Verdict::Drop;
            }
        }

        let mut wait = Duration::ZERO;
        if let Some(limiter) = &self.limiter {
            let cells = NonZeroU32::new(len.clamp(1, u32::MAX as usize) as u32).unwrap_or(NonZeroU32::MIN);
            match limiter.check_n(cells) {
                Ok(Ok(())) => {}
                Ok(Err(not_until)) => wait = not_until.wait_time_from(self.clock.now()),
                // Larger than the whole burst; it can never conform.
                Err(_) => return Verdict::Drop,
            }
        }

        let jitter = self.profile.jitter;
        let latency = match self.seq % 3 {
            1 => self.profile.delay + jitter,
            2 => self.profile.delay.saturating_sub(jitter),
            _ => self.profile.delay,
        };

        let total = latency + wait;
        if total.is_zero() {
            Verdict::Pass
        } else {
            Verdict::Delay(total)
        }
    }
}

async fn run_shaper(target: Ipv4Addr, profile: ShapingProfile, mut queries: mpsc::Receiver<PacketQuery>) -> TaskStats {
    tracing::debug!("Shaping task for {target} started: {profile:?}");
    let mut shaper = Shaper::new(profile);
    let mut stats = TaskStats::default();

    while let Some(query) = queries.recv().await {
        let verdict = shaper.decide(query.len);
        match verdict {
            Verdict::Pass => stats.passed += 1,
            Verdict::Delay(_) => stats.delayed += 1,
            Verdict::Drop => stats.dropped += 1,
        }
        let _ = query.reply.send(verdict);
    }

    tracing::debug!("Shaping task for {target} stopped: {stats:?}");
    stats
}

/// Live shaping tasks keyed by rule id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, TaskHandle>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task for `rule_id`, replacing any previous one.
    pub fn start(&self, rule_id: &str, target: Ipv4Addr, profile: ShapingProfile) {
        let (sender, receiver) = mpsc::channel(QUERY_QUEUE);
        let join = tokio::spawn(run_shaper(target, profile, receiver));
        if let Some(previous) = self.tasks.insert(
            rule_id.to_string(),
            TaskHandle {
                target,
                sender,
                join,
            },
        ) {
            previous.join.abort();
        }
    }

    /// End the task for `rule_id` and return what it decided. `None` when no
    /// task was running.
    pub async fn stop(&self, rule_id: &str) -> Option<TaskStats> {
        let (_, handle) = self.tasks.remove(rule_id)?;
        drop(handle.sender);
        match handle.join.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!("Shaping task for rule {rule_id} ended abnormally: {e}");
                Some(TaskStats::default())
            }
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn is_running(&self, rule_id: &str) -> bool {
        self.tasks.contains_key(rule_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Combined verdict of every task shaping `target`. Any drop wins; delays add.
    pub async fn verdict(&self, target: Ipv4Addr, len: usize) -> Verdict {
        let senders: Vec<mpsc::Sender<PacketQuery>> = self
            .tasks
            .iter()
            .filter(|e| e.value().target == target)
            .map(|e| e.value().sender.clone())
            .collect();

        let mut delay = Duration::ZERO;
        for sender in senders {
            let (reply, answer) = oneshot::channel();
            if sender.send(PacketQuery { len, reply }).await.is_err() {
                continue;
            }
            match answer.await {
                Ok(Verdict::Drop) => return Verdict::Drop,
                Ok(Verdict::Delay(d)) => delay += d,
                Ok(Verdict::Pass) | Err(_) => {}
            }
        }

        if delay.is_zero() {
            Verdict::Pass
        } else {
            Verdict::Delay(delay)
        }
    }
}
