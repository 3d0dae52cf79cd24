//! Prometheus-style relabeling applied to block external labels.
//!
//! Used by the label-shard filter to split compaction work between several
//! compactor instances: a block is processed only if the rules keep it.

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::labels::Labels;

/// Relabel action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    /// Write the expanded replacement into `target_label` when the regex matches.
    #[default]
    Replace,
    /// Drop the block unless the regex matches.
    Keep,
    /// Drop the block when the regex matches.
    Drop,
    /// Write `hash(source) % modulus` into `target_label`.
    HashMod,
    /// Copy labels whose name matches to the name given by the replacement.
    LabelMap,
    /// Remove labels whose name matches.
    LabelDrop,
    /// Remove labels whose name does not match.
    LabelKeep,
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_regex() -> String {
    "(.*)".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

/// Serialized relabel rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelabelConfig {
    /// Labels whose values are joined to form the matched string.
    #[serde(default)]
    pub source_labels: Vec<String>,
    /// Separator placed between joined source values.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Fully anchored regular expression.
    #[serde(default = "default_regex")]
    pub regex: String,
    /// Modulus for [`RelabelAction::HashMod`].
    #[serde(default)]
    pub modulus: u64,
    /// Label written by replace and hashmod.
    #[serde(default)]
    pub target_label: String,
    /// Replacement template, `$1` style capture references.
    #[serde(default = "default_replacement")]
    pub replacement: String,
    /// Action to perform.
    #[serde(default)]
    pub action: RelabelAction,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            regex: default_regex(),
            modulus: 0,
            target_label: String::new(),
            replacement: default_replacement(),
            action: RelabelAction::Replace,
        }
    }
}

/// Errors raised while compiling relabel rules.
#[derive(Debug, Error)]
pub enum RelabelError {
    /// The rule regex did not compile.
    #[error("invalid relabel regex {regex:?}: {source}")]
    Regex {
        /// Offending expression.
        regex: String,
        /// Compiler error.
        #[source]
        source: regex::Error,
    },
    /// `hashmod` without a positive modulus.
    #[error("relabel action hashmod requires a positive modulus")]
    MissingModulus,
    /// `replace`/`hashmod` without a target label.
    #[error("relabel action {0:?} requires a target_label")]
    MissingTarget(RelabelAction),
}

/// Compiled relabel rule.
#[derive(Debug, Clone)]
pub struct RelabelRule {
    config: RelabelConfig,
    regex: Regex,
}

impl RelabelRule {
    /// Compile a rule.
    pub fn compile(config: RelabelConfig) -> Result<Self, RelabelError> {
        let regex = Regex::new(&format!("^(?:{})$", config.regex)).map_err(|source| {
            RelabelError::Regex {
                regex: config.regex.clone(),
                source,
            }
        })?;
        match config.action {
            RelabelAction::HashMod if config.modulus == 0 => {
                return Err(RelabelError::MissingModulus)
            }
            RelabelAction::Replace | RelabelAction::HashMod if config.target_label.is_empty() => {
                return Err(RelabelError::MissingTarget(config.action))
            }
            _ => {}
        }
        Ok(Self { config, regex })
    }

    fn source_value(&self, labels: &Labels) -> String {
        self.config
            .source_labels
            .iter()
            .map(|name| labels.get(name).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&self.config.separator)
    }

    /// Apply the rule; `false` means the block was dropped.
    fn apply(&self, labels: &mut Labels) -> bool {
        let cfg = &self.config;
        match cfg.action {
            RelabelAction::Keep => self.regex.is_match(&self.source_value(labels)),
            RelabelAction::Drop => !self.regex.is_match(&self.source_value(labels)),
            RelabelAction::Replace => {
                let value = self.source_value(labels);
                if let Some(caps) = self.regex.captures(&value) {
                    let mut target = String::new();
                    caps.expand(&cfg.target_label, &mut target);
                    let mut replaced = String::new();
                    caps.expand(&cfg.replacement, &mut replaced);
                    if !target.is_empty() {
                        labels.set(target, replaced);
                    }
                }
                true
            }
            RelabelAction::HashMod => {
                let value = self.source_value(labels);
                let shard = hash_mod(&value, cfg.modulus);
                labels.set(cfg.target_label.clone(), shard.to_string());
                true
            }
            RelabelAction::LabelMap => {
                let mapped: Vec<(String, String)> = labels
                    .iter()
                    .filter_map(|(name, value)| {
                        let caps = self.regex.captures(name)?;
                        let mut renamed = String::new();
                        caps.expand(&cfg.replacement, &mut renamed);
                        Some((renamed, value.to_string()))
                    })
                    .collect();
                for (name, value) in mapped {
                    labels.set(name, value);
                }
                true
            }
            RelabelAction::LabelDrop => {
                labels.retain(|name, _| !self.regex.is_match(name));
                true
            }
            RelabelAction::LabelKeep => {
                labels.retain(|name, _| self.regex.is_match(name));
                true
            }
        }
    }
}

/// Prometheus shard of `value`: the low 8 bytes of its md5, big-endian,
/// modulo `modulus`.
fn hash_mod(value: &str, modulus: u64) -> u64 {
    let digest = Md5::digest(value.as_bytes());
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[8..]);
    u64::from_be_bytes(low) % modulus
}

/// Compile a list of rules.
pub fn compile(configs: &[RelabelConfig]) -> Result<Vec<RelabelRule>, RelabelError> {
    configs.iter().cloned().map(RelabelRule::compile).collect()
}

/// Run `labels` through `rules`. `None` means the labels were dropped.
pub fn process(labels: &Labels, rules: &[RelabelRule]) -> Option<Labels> {
    let mut out = labels.clone();
    for rule in rules {
        if !rule.apply(&mut out) {
            return None;
        }
    }
    Some(out)
}
