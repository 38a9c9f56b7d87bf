//! Message Router - pattern rules from message type to agent ids
//!
//! Patterns are either an exact type name or a single `*` wildcard that
//! splits the pattern into a prefix and a suffix (`risk_*`, `*_alert`,
//! `market_*_update`). No regex, no multi-wildcard.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::message::ProtocolMessage;

/// Compiled form of a rule pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl Pattern {
    /// Compile a pattern. Only the first `*` is a wildcard; anything after it
    /// is treated as the literal suffix.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('*') {
            Some((prefix, suffix)) => Pattern::Wildcard {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            },
            None => Pattern::Exact(raw.to_string()),
        }
    }

    pub fn matches(&self, message_type: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == message_type,
            Pattern::Wildcard { prefix, suffix } => {
                message_type.len() >= prefix.len() + suffix.len()
                    && message_type.starts_with(prefix.as_str())
                    && message_type.ends_with(suffix.as_str())
            }
        }
    }
}

/// A routing rule
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub pattern: String,
    pub targets: BTreeSet<String>,
    pub priority: i32,
    /// Payload fields that must all be present and equal for the rule to apply
    pub conditions: Option<HashMap<String, Value>>,
    compiled: Pattern,
}

impl RoutingRule {
    pub fn new<I, S>(pattern: &str, targets: I, priority: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pattern: pattern.to_string(),
            targets: targets.into_iter().map(Into::into).collect(),
            priority,
            conditions: None,
            compiled: Pattern::parse(pattern),
        }
    }

    pub fn with_conditions(mut self, conditions: HashMap<String, Value>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Whether this rule applies to a message of the given type and payload
    pub fn matches(&self, message_type: &str, payload: &Value) -> bool {
        if !self.compiled.matches(message_type) {
            return false;
        }
        match &self.conditions {
            None => true,
            Some(conditions) => conditions
                .iter()
                .all(|(key, expected)| payload.get(key) == Some(expected)),
        }
    }
}

/// Routing table
#[derive(Debug, Default)]
pub struct Router {
    rules: Vec<RoutingRule>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. A rule with the same pattern is replaced.
    pub fn add_rule(&mut self, rule: RoutingRule) {
        let replaced = self.remove_rule(&rule.pattern);
        info!(
            "{} routing rule {} -> {:?} (priority {})",
            if replaced { "Replaced" } else { "Added" },
            rule.pattern,
            rule.targets,
            rule.priority
        );
        self.rules.push(rule);
        // Highest priority first; stable so insertion order breaks ties
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Add a rule unless one with the same pattern exists. Returns whether it
    /// was added.
    pub fn add_rule_if_absent(&mut self, rule: RoutingRule) -> bool {
        if self.rules.iter().any(|r| r.pattern == rule.pattern) {
            debug!("Keeping existing routing rule {}", rule.pattern);
            return false;
        }
        self.add_rule(rule);
        true
    }

    /// Remove the rule with this pattern. Returns whether one existed.
    pub fn remove_rule(&mut self, pattern: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.pattern != pattern);
        before != self.rules.len()
    }

    /// Union of the targets of every rule matching this type and payload
    pub fn targets_for(&self, message_type: &str, payload: &Value) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(message_type, payload))
            .flat_map(|rule| rule.targets.iter().cloned())
            .collect()
    }

    /// Resolve the recipients of a message.
    ///
    /// Point-to-point messages go to their receiver only; the rules are not
    /// consulted. Receiver-less messages go to the union of all matching rules.
    pub fn route(&self, message: &ProtocolMessage) -> BTreeSet<String> {
        if let Some(receiver) = message.receiver() {
            return BTreeSet::from([receiver.to_string()]);
        }

        let targets = self.targets_for(message.message_type().as_str(), message.payload());
        debug!(
            "Routed {} message {} to {} targets",
            message.message_type(),
            message.id(),
            targets.len()
        );
        targets
    }

    /// Rules ordered by descending priority
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
