//! Approval gate: decides whether an item may run unattended.
//!
//! [`evaluate`] is a pure function of the item category, its payload and the
//! configured threshold table. Anything it cannot positively clear
//! (unknown category, missing or non-numeric field) requires a human.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state_machine::ItemKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    AutoApprove,
    RequireHuman,
}

/// Per-category approval rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApprovalRule {
    /// Always runs without a human.
    Auto,
    /// Always needs a human.
    Human,
    /// Auto-approves while `payload[field]` stays under `limit`.
    /// With `inclusive`, a value equal to the limit still auto-approves.
    Threshold {
        field: String,
        limit: f64,
        #[serde(default = "default_inclusive")]
        inclusive: bool,
    },
}

fn default_inclusive() -> bool {
    true
}

/// Category name → rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdTable(BTreeMap<String, ApprovalRule>);

impl Default for ThresholdTable {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            ItemKind::Payment.to_string(),
            ApprovalRule::Threshold {
                field: "amount".into(),
                limit: 100.0,
                inclusive: true,
            },
        );
        rules.insert(ItemKind::Invoice.to_string(), ApprovalRule::Auto);
        rules.insert(ItemKind::Alert.to_string(), ApprovalRule::Auto);
        rules.insert(ItemKind::SocialMention.to_string(), ApprovalRule::Auto);
        rules.insert(ItemKind::Email.to_string(), ApprovalRule::Human);
        rules.insert(ItemKind::SocialPost.to_string(), ApprovalRule::Human);
        Self(rules)
    }
}

impl ThresholdTable {
    pub fn new(rules: BTreeMap<String, ApprovalRule>) -> Self {
        Self(rules)
    }

    pub fn rule(&self, kind: &ItemKind) -> Option<&ApprovalRule> {
        self.0.get(kind.as_str())
    }
}

/// Decides AutoApprove vs RequireHuman. No side effects.
pub fn evaluate(kind: &ItemKind, payload: &Value, table: &ThresholdTable) -> GateDecision {
    match table.rule(kind) {
        None | Some(ApprovalRule::Human) => GateDecision::RequireHuman,
        Some(ApprovalRule::Auto) => GateDecision::AutoApprove,
        Some(ApprovalRule::Threshold {
            field,
            limit,
            inclusive,
        }) => match numeric_field(payload, field) {
            Some(value) if *inclusive && value <= *limit => GateDecision::AutoApprove,
            Some(value) if !*inclusive && value < *limit => GateDecision::AutoApprove,
            _ => GateDecision::RequireHuman,
        },
    }
}

fn numeric_field(payload: &Value, field: &str) -> Option<f64> {
    let value = match payload.get(field)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}
