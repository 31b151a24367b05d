use crate::types::{ChatIdentity, InboundMessage, MediaGroupKey};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub inactivity: Duration,
    pub max_group_size: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_millis(1500),
            max_group_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Single,
    Completed,
    MaxSize,
    TimedOut,
    Shutdown,
}

impl FlushReason {
    pub fn is_partial(&self) -> bool {
        matches!(self, FlushReason::TimedOut | FlushReason::Shutdown)
    }
}

#[derive(Debug, Clone)]
pub struct MediaGroup {
    pub key: Option<MediaGroupKey>,
    pub messages: Vec<InboundMessage>,
    pub reason: FlushReason,
    pub suppressed: usize,
}

impl MediaGroup {
    pub fn single(message: InboundMessage) -> Self {
        Self {
            key: None,
            messages: vec![message],
            reason: FlushReason::Single,
            suppressed: 0,
        }
    }

    pub fn is_album(&self) -> bool {
        self.key.is_some()
    }

    pub fn first(&self) -> Option<&InboundMessage> {
        self.messages.first()
    }

    pub fn part_count(&self) -> usize {
        self.messages.len()
    }

    pub fn message_ids(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupId {
    chat: ChatIdentity,
    key: MediaGroupKey,
}

#[derive(Debug)]
struct PendingMediaGroup {
    messages: Vec<InboundMessage>,
    first_seen: Instant,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct MediaGroupAggregator {
    settings: AggregatorSettings,
    pending: HashMap<GroupId, PendingMediaGroup>,
}

impl MediaGroupAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            pending: HashMap::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, message: InboundMessage, now: Instant) -> Option<MediaGroup> {
        let Some(key) = message.group_key().cloned() else {
            return Some(MediaGroup::single(message));
        };
        let id = GroupId {
            chat: message.chat.id.clone(),
            key,
        };
        let deadline = now + self.settings.inactivity;
        let entry = self.pending.entry(id.clone()).or_insert_with(|| {
            debug!(group = %id.key, chat = %id.chat, "album started");
            PendingMediaGroup {
                messages: Vec::new(),
                first_seen: now,
                deadline,
            }
        });
        entry.messages.push(message);
        entry.deadline = deadline;

        if entry.messages.len() >= self.settings.max_group_size.max(1) {
            return self.take(&id, FlushReason::MaxSize);
        }
        None
    }

    pub fn complete(&mut self, chat: &ChatIdentity, key: &MediaGroupKey) -> Option<MediaGroup> {
        let id = GroupId {
            chat: chat.clone(),
            key: key.clone(),
        };
        self.take(&id, FlushReason::Completed)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn expire(&mut self, now: Instant) -> Vec<MediaGroup> {
        let mut due: Vec<(Instant, GroupId)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (p.first_seen, id.clone()))
            .collect();
        due.sort_by_key(|(first_seen, _)| *first_seen);
        due.into_iter()
            .filter_map(|(_, id)| self.take(&id, FlushReason::TimedOut))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<MediaGroup> {
        let mut all: Vec<(Instant, GroupId)> = self
            .pending
            .iter()
            .map(|(id, p)| (p.first_seen, id.clone()))
            .collect();
        all.sort_by_key(|(first_seen, _)| *first_seen);
        all.into_iter()
            .filter_map(|(_, id)| self.take(&id, FlushReason::Shutdown))
            .collect()
    }

    fn take(&mut self, id: &GroupId, reason: FlushReason) -> Option<MediaGroup> {
        let pending = self.pending.remove(id)?;
        let received = pending.messages.len();
        let (messages, suppressed) = dedup_parts(pending.messages);
        debug!(
            group = %id.key,
            chat = %id.chat,
            parts = messages.len(),
            received,
            suppressed,
            partial = reason.is_partial(),
            "album flushed"
        );
        Some(MediaGroup {
            key: Some(id.key.clone()),
            messages,
            reason,
            suppressed,
        })
    }
}

pub fn content_hash(message: &InboundMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.text().as_bytes());
    hasher.update([0u8]);
    if let Some(media) = message.media.as_ref() {
        hasher.update(media.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(media.size.unwrap_or(0).to_le_bytes());
        if let Some(file_id) = media.file_id.as_deref() {
            hasher.update(file_id.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

fn dedup_parts(messages: Vec<InboundMessage>) -> (Vec<InboundMessage>, usize) {
    let mut seen: HashSet<(Option<i64>, String)> = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    let mut suppressed = 0;
    for message in messages {
        if seen.insert((message.sender_id(), content_hash(&message))) {
            kept.push(message);
        } else {
            suppressed += 1;
        }
    }
    (kept, suppressed)
}
