//! Deterministic per-node fault injection.
//!
//! Rules are empty unless a test installs them. They are consulted on every
//! connect and every outbound send, keyed by target node id.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::{
    error::{Result, TransportError},
    node::{NodeDescriptor, NodeId},
};

/// Reason carried by failures from a fail-to-send rule.
pub const SIMULATED_DISCONNECT: &str = "DISCONNECT: simulated";
/// Reason carried by connect failures from an unresponsive rule.
pub const SIMULATED_UNRESPONSIVE: &str = "UNRESPONSIVE: simulated";

/// A simulated network failure towards one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRule {
    /// Sends and connects fail immediately with a simulated disconnect.
    FailToSendNoConnect,
    /// New connects fail; sends on existing connections succeed but the
    /// bytes are dropped.
    Unresponsive,
}

/// What to do with an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Deliver,
    Drop,
}

/// Holds the active fault rules of one service.
#[derive(Debug, Default)]
pub struct FaultInjector {
    rules: DashMap<NodeId, FaultRule>,
    dropped: AtomicU64,
}

impl FaultInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fail_to_send_no_connect_rule(&self, node: &NodeDescriptor) {
        tracing::debug!(node = %node.id, "installing fail-to-send rule");
        self.rules
            .insert(node.id.clone(), FaultRule::FailToSendNoConnect);
    }

    pub fn add_unresponsive_rule(&self, node: &NodeDescriptor) {
        tracing::debug!(node = %node.id, "installing unresponsive rule");
        self.rules.insert(node.id.clone(), FaultRule::Unresponsive);
    }

    pub fn clear_rule(&self, node: &NodeDescriptor) -> Option<FaultRule> {
        self.rules.remove(&node.id).map(|(_, rule)| rule)
    }

    pub fn clear_all_rules(&self) {
        self.rules.clear();
    }

    #[must_use]
    pub fn rule_for(&self, node_id: &str) -> Option<FaultRule> {
        self.rules.get(node_id).map(|r| *r.value())
    }

    /// # Errors
    ///
    /// Returns `Connect` if any rule targets `node`.
    pub fn check_connect(&self, node: &NodeDescriptor) -> Result<()> {
        let reason = match self.rule_for(&node.id) {
            None => return Ok(()),
            Some(FaultRule::FailToSendNoConnect) => SIMULATED_DISCONNECT,
            Some(FaultRule::Unresponsive) => SIMULATED_UNRESPONSIVE,
        };
        Err(TransportError::Connect {
            node: node.id.clone(),
            reason: reason.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns `Connect` with a simulated disconnect under a fail-to-send
    /// rule.
    pub fn check_send(&self, node: &NodeDescriptor) -> Result<SendDecision> {
        match self.rule_for(&node.id) {
            None => Ok(SendDecision::Deliver),
            Some(FaultRule::FailToSendNoConnect) => Err(TransportError::Connect {
                node: node.id.clone(),
                reason: SIMULATED_DISCONNECT.to_string(),
            }),
            Some(FaultRule::Unresponsive) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node = %node.id, "frame dropped: unresponsive rule");
                Ok(SendDecision::Drop)
            },
        }
    }

    /// Frames dropped by unresponsive rules so far.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{TransportAddress, Version};

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(id, TransportAddress::Local(id.into()), Version::CURRENT)
    }

    #[test]
    fn test_no_rule_passes() {
        let faults = FaultInjector::new();
        assert!(faults.check_connect(&node("b")).is_ok());
        assert_eq!(faults.check_send(&node("b")).unwrap(), SendDecision::Deliver);
    }

    #[test]
    fn test_fail_to_send_rule() {
        let faults = FaultInjector::new();
        faults.add_fail_to_send_no_connect_rule(&node("b"));

        let err = faults.check_send(&node("b")).unwrap_err();
        assert!(err.to_string().ends_with(SIMULATED_DISCONNECT));
        let err = faults.check_connect(&node("b")).unwrap_err();
        assert!(err.is_connect_failure());
        assert!(faults.check_send(&node("c")).is_ok());
    }

    #[test]
    fn test_unresponsive_rule_drops() {
        let faults = FaultInjector::new();
        faults.add_unresponsive_rule(&node("b"));

        assert_eq!(faults.check_send(&node("b")).unwrap(), SendDecision::Drop);
        assert_eq!(faults.check_send(&node("b")).unwrap(), SendDecision::Drop);
        assert_eq!(faults.dropped_count(), 2);
        let err = faults.check_connect(&node("b")).unwrap_err();
        assert!(err.to_string().ends_with(SIMULATED_UNRESPONSIVE));
    }

    #[test]
    fn test_clear_rules() {
        let faults = FaultInjector::new();
        faults.add_unresponsive_rule(&node("b"));
        faults.add_fail_to_send_no_connect_rule(&node("c"));

        assert_eq!(faults.clear_rule(&node("b")), Some(FaultRule::Unresponsive));
        assert_eq!(faults.rule_for("b"), None);
        faults.clear_all_rules();
        assert_eq!(faults.rule_for("c"), None);
    }
}
