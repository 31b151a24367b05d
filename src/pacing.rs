use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct RulePacer {
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
}

impl RulePacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `delay` has elapsed since the previous slot and claims the
    /// next one. Returns `None` when cancelled while waiting.
    pub async fn acquire(&self, delay: Duration, cancel: &CancellationToken) -> Option<Instant> {
        let mut last = tokio::select! {
            guard = self.last_dispatch.lock() => guard,
            _ = cancel.cancelled() => return None,
        };
        if let Some(previous) = *last {
            let ready = previous + delay;
            if ready > Instant::now() {
                tokio::select! {
                    _ = sleep_until(ready) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
        }
        let now = Instant::now();
        *last = Some(now);
        Some(now)
    }
}

#[derive(Debug, Default)]
pub struct PacerRegistry {
    pacers: Mutex<HashMap<String, Arc<RulePacer>>>,
}

impl PacerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rule: &str) -> Arc<RulePacer> {
        let mut pacers = self.pacers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(pacers.entry(rule.to_string()).or_default())
    }

    pub fn clear(&self) {
        self.pacers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
