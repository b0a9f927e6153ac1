use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decision from the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    NeedsApproval,
    Deny,
}

/// Policy governing tool calls made from LLM nodes.
///
/// Tool nodes are never gated: their presence in the graph authorizes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Tools that never require approval, even on nodes with `require_approval`.
    #[serde(default)]
    pub auto_approve: HashSet<String>,

    /// Tools whose calls are always refused.
    #[serde(default)]
    pub deny: HashSet<String>,
}

impl ApprovalPolicy {
    /// Decide what to do for a tool call on a node.
    pub fn decide(&self, tool_name: &str, node_requires_approval: bool) -> GateDecision {
        if self.deny.contains(tool_name) {
            return GateDecision::Deny;
        }
        if !node_requires_approval || self.auto_approve.contains(tool_name) {
            return GateDecision::Allow;
        }
        GateDecision::NeedsApproval
    }
}

/// A pending approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub node: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub input_summary: String,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(node: impl Into<String>, tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        let tool_name = tool_name.into();
        let input_summary = summarize_input(&input);
        Self {
            id: Uuid::new_v4().to_string(),
            node: node.into(),
            tool_name,
            input,
            input_summary,
            timestamp: Utc::now(),
        }
    }

    /// Question shown to the caller.
    pub fn question(&self) -> String {
        format!(
            "Allow tool '{}' with input {}?",
            self.tool_name, self.input_summary
        )
    }
}

/// Decision on an approval request.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

fn summarize_input(input: &serde_json::Value) -> String {
    let text = input.to_string();
    if text.chars().count() > 200 {
        let head: String = text.chars().take(200).collect();
        format!("{head}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_allows_ungated_nodes() {
        let policy = ApprovalPolicy::default();
        assert_eq!(policy.decide("search", false), GateDecision::Allow);
    }

    #[test]
    fn policy_needs_approval_on_gated_nodes() {
        let policy = ApprovalPolicy::default();
        assert_eq!(policy.decide("send_email", true), GateDecision::NeedsApproval);
    }

    #[test]
    fn policy_auto_approve_override() {
        let mut policy = ApprovalPolicy::default();
        policy.auto_approve.insert("search".to_string());
        assert_eq!(policy.decide("search", true), GateDecision::Allow);
        assert_eq!(policy.decide("delete", true), GateDecision::NeedsApproval);
    }

    #[test]
    fn policy_deny_wins() {
        let mut policy = ApprovalPolicy::default();
        policy.deny.insert("rm".to_string());
        policy.auto_approve.insert("rm".to_string());
        assert_eq!(policy.decide("rm", false), GateDecision::Deny);
    }

    #[test]
    fn request_summary_truncated() {
        let long = "x".repeat(500);
        let req = ApprovalRequest::new("n", "echo", serde_json::json!({ "text": long }));
        assert!(req.input_summary.ends_with("..."));
        assert!(req.question().contains("echo"));
    }
}
