use crate::rules::{Rule, RuleSet};
use crate::types::{ChatIdentity, InboundMessage};
use std::sync::{Arc, RwLock};
use tracing::info;

pub struct RuleRouter {
    table: RwLock<Arc<RuleSet>>,
}

impl RuleRouter {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            table: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        let guard = self.table.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, rules: RuleSet) {
        let count = rules.len();
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rules);
        info!(rules = count, "routing table replaced");
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        match guard.with_enabled(name, enabled) {
            Some(next) => {
                *guard = Arc::new(next);
                info!(rule = name, enabled, "rule toggled");
                true
            }
            None => false,
        }
    }

    pub fn route(&self, source: &ChatIdentity) -> Vec<Arc<Rule>> {
        self.snapshot()
            .rules()
            .iter()
            .filter(|rule| rule.enabled && !rule.is_inert() && rule.watches(source))
            .cloned()
            .collect()
    }

    pub fn route_message(&self, message: &InboundMessage) -> Vec<Arc<Rule>> {
        let identities = message.source_identities();
        self.snapshot()
            .rules()
            .iter()
            .filter(|rule| rule.enabled && !rule.is_inert())
            .filter(|rule| identities.iter().any(|id| rule.watches(id)))
            .cloned()
            .collect()
    }
}
