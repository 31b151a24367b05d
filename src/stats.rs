use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub forwarded: u64,
    pub filtered: u64,
    pub total: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounters {
    pub total: u64,
    pub forwarded: u64,
    pub filtered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub global: CounterSnapshot,
    pub rules: BTreeMap<String, RuleCounters>,
}

#[derive(Debug, Default)]
pub struct Counters {
    global: Mutex<CounterSnapshot>,
    rules: Mutex<BTreeMap<String, RuleCounters>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_global(&self, f: impl FnOnce(&mut CounterSnapshot)) {
        let mut global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut global);
    }

    fn bump_rule(&self, rule: &str, f: impl FnOnce(&mut RuleCounters)) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        f(rules.entry(rule.to_string()).or_default());
    }

    pub fn record_routed(&self) {
        self.bump_global(|c| c.total += 1);
    }

    pub fn record_forwarded(&self) {
        self.bump_global(|c| c.forwarded += 1);
    }

    pub fn record_filtered(&self) {
        self.bump_global(|c| c.filtered += 1);
    }

    pub fn record_failed(&self) {
        self.bump_global(|c| c.failed += 1);
    }

    pub fn record_rule_evaluated(&self, rule: &str) {
        self.bump_rule(rule, |c| c.total += 1);
    }

    pub fn record_rule_forwarded(&self, rule: &str) {
        self.bump_rule(rule, |c| c.forwarded += 1);
    }

    pub fn record_rule_filtered(&self, rule: &str) {
        self.bump_rule(rule, |c| c.filtered += 1);
    }

    pub fn record_rule_failed(&self, rule: &str) {
        self.bump_rule(rule, |c| c.failed += 1);
    }

    pub fn global(&self) -> CounterSnapshot {
        *self.global.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rule(&self, rule: &str) -> RuleCounters {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(rule)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            global: self.global(),
            rules: self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub fn reset(&self) {
        *self.global.lock().unwrap_or_else(|e| e.into_inner()) = CounterSnapshot::default();
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
