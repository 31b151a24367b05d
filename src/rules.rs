use crate::config::RuleConfig;
use crate::types::{ChatIdentity, MediaKind};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("rule has an empty name")]
    EmptyRuleName,
    #[error("rule {rule:?} is defined more than once")]
    DuplicateRuleName { rule: String },
    #[error("rule {rule:?} has no source chats")]
    NoSources { rule: String },
    #[error("rule {rule:?} has no target chats")]
    NoTargets { rule: String },
    #[error("rule {rule:?}: {reason}")]
    InvalidChat { rule: String, reason: String },
    #[error("rule {rule:?}: invalid regex {pattern:?}: {reason}")]
    InvalidRegex {
        rule: String,
        pattern: String,
        reason: String,
    },
    #[error("rule {rule:?}: unknown media type {token:?}")]
    UnknownMediaType { rule: String, token: String },
    #[error("rule {rule:?}: unknown filter mode {mode:?}")]
    UnknownFilterMode { rule: String, mode: String },
    #[error("rule {rule:?}: min_file_size {min} exceeds max_file_size {max}")]
    InvalidSizeBounds { rule: String, min: u64, max: u64 },
    #[error("rule {rule:?}: delay {delay} is not a non-negative number of seconds")]
    InvalidDelay { rule: String, delay: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Whitelist,
    Blacklist,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Whitelist => "whitelist",
            FilterMode::Blacklist => "blacklist",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub mode: FilterMode,
    pub patterns: Vec<Regex>,
    pub keywords: Vec<String>,
    /// Empty means every kind is allowed.
    pub media_types: HashSet<MediaKind>,
    pub min_file_size: u64,
    pub max_file_size: Option<u64>,
}

impl FilterSpec {
    pub fn has_match_criteria(&self) -> bool {
        !self.patterns.is_empty() || !self.keywords.is_empty()
    }
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            mode: FilterMode::Whitelist,
            patterns: Vec::new(),
            keywords: Vec::new(),
            media_types: HashSet::new(),
            min_file_size: 0,
            max_file_size: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreSpec {
    pub user_ids: HashSet<i64>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardingOptions {
    pub preserve_format: bool,
    pub add_source_info: bool,
    pub delay: Duration,
    pub force_forward: bool,
}

impl Default for ForwardingOptions {
    fn default() -> Self {
        Self {
            preserve_format: true,
            add_source_info: true,
            delay: Duration::from_millis(500),
            force_forward: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub sources: Vec<ChatIdentity>,
    pub targets: Vec<ChatIdentity>,
    pub filter: FilterSpec,
    pub ignore: IgnoreSpec,
    pub options: ForwardingOptions,
}

impl Rule {
    pub fn is_inert(&self) -> bool {
        self.sources.is_empty() || self.targets.is_empty()
    }

    pub fn watches(&self, chat: &ChatIdentity) -> bool {
        self.sources.iter().any(|s| s == chat)
    }

    pub fn from_config(raw: &RuleConfig) -> Result<Rule, ConfigError> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::EmptyRuleName);
        }

        let sources = parse_chats(&name, &raw.source_chats)?;
        if sources.is_empty() {
            return Err(ConfigError::NoSources { rule: name });
        }
        let targets = parse_chats(&name, &raw.target_chats)?;
        if targets.is_empty() {
            return Err(ConfigError::NoTargets { rule: name });
        }

        let mode = match raw.filters.mode.trim().to_lowercase().as_str() {
            "whitelist" => FilterMode::Whitelist,
            "blacklist" => FilterMode::Blacklist,
            _ => {
                return Err(ConfigError::UnknownFilterMode {
                    rule: name,
                    mode: raw.filters.mode.clone(),
                })
            }
        };

        let mut patterns = Vec::with_capacity(raw.filters.regex_patterns.len());
        for pattern in &raw.filters.regex_patterns {
            let compiled = Regex::new(pattern).map_err(|err| ConfigError::InvalidRegex {
                rule: name.clone(),
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;
            patterns.push(compiled);
        }

        let mut media_types = HashSet::new();
        for token in &raw.filters.media_types {
            let kind = token
                .parse::<MediaKind>()
                .map_err(|_| ConfigError::UnknownMediaType {
                    rule: name.clone(),
                    token: token.clone(),
                })?;
            media_types.insert(kind);
        }

        let min_file_size = raw.filters.min_file_size;
        let max_file_size = match raw.filters.max_file_size {
            0 => None,
            max if max < min_file_size => {
                return Err(ConfigError::InvalidSizeBounds {
                    rule: name,
                    min: min_file_size,
                    max,
                })
            }
            max => Some(max),
        };

        let delay = match Duration::try_from_secs_f64(raw.forwarding.delay) {
            Ok(delay) => delay,
            Err(_) => {
                return Err(ConfigError::InvalidDelay {
                    rule: name,
                    delay: raw.forwarding.delay,
                })
            }
        };

        Ok(Rule {
            enabled: raw.enabled,
            sources,
            targets,
            filter: FilterSpec {
                mode,
                patterns,
                keywords: normalize_keywords(&raw.filters.keywords),
                media_types,
                min_file_size,
                max_file_size,
            },
            ignore: IgnoreSpec {
                user_ids: raw.ignore.user_ids.iter().copied().collect(),
                keywords: normalize_keywords(&raw.ignore.keywords),
            },
            options: ForwardingOptions {
                preserve_format: raw.forwarding.preserve_format,
                add_source_info: raw.forwarding.add_source_info,
                delay,
                force_forward: raw.forwarding.force_forward,
            },
            name,
        })
    }
}

// Blank keywords would match every message, so they are dropped.
fn normalize_keywords(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn parse_chats(rule: &str, raw: &[serde_json::Value]) -> Result<Vec<ChatIdentity>, ConfigError> {
    let mut out: Vec<ChatIdentity> = Vec::with_capacity(raw.len());
    for value in raw {
        let chat = ChatIdentity::from_config_value(value).map_err(|reason| {
            ConfigError::InvalidChat {
                rule: rule.to_string(),
                reason,
            }
        })?;
        if !out.contains(&chat) {
            out.push(chat);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn load(raw: &[RuleConfig]) -> (RuleSet, Vec<ConfigError>) {
        let mut rules: Vec<Arc<Rule>> = Vec::new();
        let mut rejected = Vec::new();
        for doc in raw {
            match Rule::from_config(doc) {
                Ok(rule) if rules.iter().any(|r| r.name == rule.name) => {
                    rejected.push(ConfigError::DuplicateRuleName { rule: rule.name });
                }
                Ok(rule) => rules.push(Arc::new(rule)),
                Err(err) => rejected.push(err),
            }
        }
        (RuleSet { rules }, rejected)
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn with_enabled(&self, name: &str, enabled: bool) -> Option<RuleSet> {
        self.get(name)?;
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                if rule.name == name && rule.enabled != enabled {
                    let mut toggled = Rule::clone(rule);
                    toggled.enabled = enabled;
                    Arc::new(toggled)
                } else {
                    Arc::clone(rule)
                }
            })
            .collect();
        Some(RuleSet { rules })
    }
}
