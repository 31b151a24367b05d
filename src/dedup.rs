use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Records `text` and reports whether it was already seen inside the window.
    /// Blank text is never a duplicate.
    pub fn check(&mut self, text: &str, now: Instant) -> bool {
        if !self.is_enabled() || text.trim().is_empty() {
            return false;
        }
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);

        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let key = digest[..16].to_string();
        if self.seen.contains_key(&key) {
            debug!(hash = %key, "duplicate content skipped");
            return true;
        }
        self.seen.insert(key, now);
        false
    }
}
