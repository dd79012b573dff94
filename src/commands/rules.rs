//! Block, throttle, redirect, modify and priority commands, plus rule management.

use crate::enforcement::priority::DEFAULT_DSCP;
use crate::enforcement::{ModifyParams, RemovalOutcome, Rule, ThrottleParams};
use crate::error::CoreResult;

use super::logic::parse_target;
use super::state::AppState;

// ---- Actions ----

pub async fn block_address(state: &AppState, target: &str) -> CoreResult<Rule> {
    let target = parse_target(target)?;
    let rule = state.engine.block(target).await?;
    tracing::info!("Blocked {target} via {}", rule.mechanism.as_str());
    Ok(rule)
}

/// Returns how many block rules were removed; zero when none existed.
pub async fn unblock_address(state: &AppState, target: &str) -> CoreResult<usize> {
    let target = parse_target(target)?;
    state.engine.unblock(target).await
}

pub async fn throttle_address(
    state: &AppState,
    target: &str,
    params: ThrottleParams,
) -> CoreResult<Rule> {
    let target = parse_target(target)?;
    state.engine.throttle(target, params).await
}

pub async fn redirect_address(
    state: &AppState,
    source: &str,
    destination: &str,
    port: Option<u16>,
) -> CoreResult<Rule> {
    let source = parse_target(source)?;
    let destination = parse_target(destination)?;
    state.engine.redirect(source, destination, port).await
}

pub async fn modify_address(
    state: &AppState,
    target: &str,
    params: ModifyParams,
) -> CoreResult<Rule> {
    let target = parse_target(target)?;
    state.engine.modify(target, params).await
}

/// Mark traffic from `target` to `port`, expedited forwarding unless `dscp` is given.
pub async fn prioritize_address(
    state: &AppState,
    target: &str,
    port: u16,
    dscp: Option<u8>,
) -> CoreResult<Rule> {
    let target = parse_target(target)?;
    state
        .engine
        .prioritize(target, port, dscp.unwrap_or(DEFAULT_DSCP))
        .await
}

// ---- Rule management ----

pub async fn list_rules(state: &AppState) -> Vec<Rule> {
    state.engine.list_rules().await
}

pub async fn enable_rule(state: &AppState, rule_id: &str) -> CoreResult<Rule> {
    state.engine.enable_rule(rule_id).await
}

pub async fn disable_rule(state: &AppState, rule_id: &str) -> CoreResult<Rule> {
    state.engine.disable_rule(rule_id).await
}

pub async fn remove_rule(state: &AppState, rule_id: &str) -> CoreResult<RemovalOutcome> {
    state.engine.remove_rule(rule_id).await
}

/// Remove every rule, reversing each mechanism.
pub async fn clear_rules(state: &AppState) -> CoreResult<usize> {
    let removed = state.engine.clear_all().await?;
    tracing::info!("Cleared {removed} rules");
    Ok(removed)
}
