//! Rule management.
//!
//! Rules pair a set of byte patterns with connection-level constraints.
//! [RulesManager] owns the authoritative rule set: every mutation is gated
//! on a full recompile of the set through the [PatternIndex], so a rule that
//! does not compile is never published and never persisted.

pub mod pattern_index;

pub use pattern_index::{CompiledPatterns, PatternIndex, PatternMatch};

use crate::conntrack::conn_id::ObjectIdGen;
use crate::error::CoreError;
use crate::storage::{collections, DocumentStore, Filter};

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default palette for rules created without an explicit color.
const RULE_COLORS: &[&str] = &[
    "#e53935", "#8e24aa", "#3949ab", "#039be5", "#00897b", "#7cb342", "#fdd835", "#fb8c00",
];

/// A detection rule.
///
/// A rule matches a connection iff all of its patterns satisfy their
/// occurrence bounds and all connection-level constraints hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Identifier, assigned on creation. Empty for not-yet-added rules.
    #[serde(default)]
    pub id: String,
    /// Unique human-readable name.
    pub name: String,
    /// Display color.
    #[serde(default)]
    pub color: String,
    /// Free-form operator notes.
    #[serde(default)]
    pub notes: String,
    /// Byte patterns; all must satisfy their bounds for the rule to match.
    #[serde(default)]
    pub patterns: Vec<RulePattern>,
    /// Connection-level constraints.
    #[serde(default)]
    pub filter: RuleFilter,
    /// Pattern-set version the rule was last compiled under.
    #[serde(default)]
    pub version: u64,
}

/// Connection-level constraints of a [Rule].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFilter {
    /// Minimum total payload bytes.
    #[serde(default)]
    pub min_bytes: u64,
    /// Maximum total payload bytes, unbounded when absent.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    /// Minimum connection duration in milliseconds.
    #[serde(default)]
    pub min_duration: u64,
    /// Maximum connection duration in milliseconds, unbounded when absent.
    #[serde(default)]
    pub max_duration: Option<u64>,
    /// Server ports the rule applies to. Empty means any.
    #[serde(default)]
    pub services: Vec<u16>,
    /// Which sides' bytes occurrences may come from.
    #[serde(default)]
    pub direction: RuleDirection,
}

/// Direction restriction of a [Rule].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    #[default]
    Both,
    Client,
    Server,
}

/// One byte pattern of a [Rule].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePattern {
    /// The pattern expression.
    #[serde(flatten)]
    pub expr: PatternExpr,
    /// Whether matching is case sensitive. Defaults to `true`.
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
    /// Minimum occurrence count for the pattern to be satisfied.
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u32,
    /// Maximum occurrence count, unbounded when absent.
    #[serde(default)]
    pub max_occurrences: Option<u32>,
    /// Which side's bytes the pattern may match in.
    #[serde(default)]
    pub origin: PatternOrigin,
}

fn default_case_sensitive() -> bool {
    true
}

fn default_min_occurrences() -> u32 {
    1
}

/// A pattern expression: a regex or literal bytes (hex-encoded in
/// documents).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternExpr {
    Regex(String),
    Literal(#[serde(with = "hex")] Vec<u8>),
}

/// Origin restriction of a [RulePattern].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOrigin {
    #[default]
    Both,
    Client,
    Server,
}

/* --------------------------------------------------------------------------------- */

/// CRUD over the rule set with compile gating and versioning.
///
/// Rules are never physically deleted; updates are in-place at the stored
/// id. Old connections retain the rule ids they matched under prior
/// versions.
pub struct RulesManager {
    rules: RwLock<IndexMap<String, Rule>>,
    index: Arc<PatternIndex>,
    storage: Arc<dyn DocumentStore>,
    ids: ObjectIdGen,
}

impl RulesManager {
    /// Loads persisted rules from `storage` and publishes the initial
    /// compiled pattern set.
    pub fn load(
        storage: Arc<dyn DocumentStore>,
        index: Arc<PatternIndex>,
    ) -> Result<Self, CoreError> {
        let docs = storage
            .find(collections::RULES, &Filter::all(), None, 0, 0)
            .map_err(CoreError::storage)?;
        let mut rules = IndexMap::new();
        for doc in docs {
            match serde_json::from_value::<Rule>(doc) {
                Ok(rule) => {
                    rules.insert(rule.id.clone(), rule);
                }
                Err(e) => log::error!("Skipping undecodable rule document: {}", e),
            }
        }
        let set: Vec<Rule> = rules.values().cloned().collect();
        index.rebuild(&set)?;
        log::info!("Loaded {} rules", rules.len());
        Ok(RulesManager {
            rules: RwLock::new(rules),
            index,
            storage,
            ids: ObjectIdGen::new(),
        })
    }

    /// Validates and adds `rule`. The whole rule set, including the new
    /// rule, is recompiled before anything is published or persisted.
    pub fn add_rule(&self, mut rule: Rule) -> Result<Rule, CoreError> {
        let mut rules = self.rules.write().unwrap();
        if rules.values().any(|r| r.name == rule.name) {
            return Err(CoreError::RuleCompile {
                rule_id: None,
                pattern_index: 0,
                reason: format!("duplicate rule name {:?}", rule.name),
            });
        }
        rule.id = self.ids.next();
        if rule.color.is_empty() {
            rule.color = RULE_COLORS[rules.len() % RULE_COLORS.len()].to_string();
        }

        let mut set: Vec<Rule> = rules.values().cloned().collect();
        set.push(rule.clone());
        rule.version = self.index.rebuild(&set)?;

        let doc = serde_json::to_value(&rule).map_err(CoreError::storage)?;
        self.storage
            .insert(collections::RULES, doc)
            .map_err(CoreError::storage)?;
        rules.insert(rule.id.clone(), rule.clone());
        log::info!("Added rule {:?} ({})", rule.name, rule.id);
        Ok(rule)
    }

    /// Replaces the rule stored at `id`, bumping the pattern-set version.
    /// The same compile gate as [add_rule](Self::add_rule) applies.
    pub fn update_rule(&self, id: &str, mut rule: Rule) -> Result<Rule, CoreError> {
        let mut rules = self.rules.write().unwrap();
        if !rules.contains_key(id) {
            return Err(CoreError::RuleNotFound(id.to_string()));
        }
        if rules.values().any(|r| r.name == rule.name && r.id != id) {
            return Err(CoreError::RuleCompile {
                rule_id: Some(id.to_string()),
                pattern_index: 0,
                reason: format!("duplicate rule name {:?}", rule.name),
            });
        }
        rule.id = id.to_string();
        if rule.color.is_empty() {
            rule.color = rules[id].color.clone();
        }

        let set: Vec<Rule> = rules
            .values()
            .map(|r| if r.id == id { rule.clone() } else { r.clone() })
            .collect();
        rule.version = self.index.rebuild(&set)?;

        let patch = serde_json::to_value(&rule).map_err(CoreError::storage)?;
        self.storage
            .update(collections::RULES, id, patch)
            .map_err(CoreError::storage)?;
        rules.insert(rule.id.clone(), rule.clone());
        log::info!("Updated rule {:?} ({})", rule.name, rule.id);
        Ok(rule)
    }

    /// Point-in-time snapshot of all rules.
    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.read().unwrap().values().cloned().collect()
    }

    /// Point-in-time snapshot of one rule.
    pub fn get_rule(&self, id: &str) -> Result<Rule, CoreError> {
        self.rules
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::RuleNotFound(id.to_string()))
    }
}
