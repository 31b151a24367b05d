use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric ids and handles never compare equal. Handles are stored
/// case-folded without `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatIdentity {
    Id(i64),
    Handle(String),
}

impl ChatIdentity {
    pub fn handle(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let name = trimmed.strip_prefix('@').unwrap_or(trimmed).to_lowercase();
        let valid_len = (4..=64).contains(&name.len());
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        let starts_alpha = name.chars().next().is_some_and(|c| c.is_ascii_lowercase());
        if valid_len && valid_chars && starts_alpha {
            Some(ChatIdentity::Handle(name))
        } else {
            None
        }
    }

    pub fn from_config_value(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(ChatIdentity::Id)
                .ok_or_else(|| format!("chat id {} is not an integer", n)),
            serde_json::Value::String(s) => {
                ChatIdentity::handle(s).ok_or_else(|| format!("invalid chat handle {:?}", s))
            }
            other => Err(format!("unsupported chat reference {}", other)),
        }
    }
}

impl fmt::Display for ChatIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatIdentity::Id(id) => write!(f, "{}", id),
            ChatIdentity::Handle(name) => write!(f, "@{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    Webpage,
}

impl MediaKind {
    pub const ALL: [MediaKind; 9] = [
        MediaKind::Text,
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Document,
        MediaKind::Audio,
        MediaKind::Voice,
        MediaKind::Sticker,
        MediaKind::Animation,
        MediaKind::Webpage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Sticker => "sticker",
            MediaKind::Animation => "animation",
            MediaKind::Webpage => "webpage",
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_lowercase();
        MediaKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == token)
            .ok_or_else(|| format!("unknown media type {:?}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaGroupKey(pub String);

impl fmt::Display for MediaGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub size: Option<u64>,
    pub group_key: Option<MediaGroupKey>,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub name: Option<String>,
    pub username: Option<String>,
    pub is_bot: Option<bool>,
    pub is_premium: Option<bool>,
    pub is_verified: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChat {
    pub id: ChatIdentity,
    pub title: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: i64,
    pub chat: SourceChat,
    pub sender: Option<Sender>,
    pub text: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub date: DateTime<Utc>,
    pub restricted: bool,
}

impl InboundMessage {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media
            .as_ref()
            .map(|m| m.kind)
            .unwrap_or(MediaKind::Text)
    }

    pub fn file_size(&self) -> Option<u64> {
        self.media.as_ref().and_then(|m| m.size)
    }

    pub fn group_key(&self) -> Option<&MediaGroupKey> {
        self.media.as_ref().and_then(|m| m.group_key.as_ref())
    }

    pub fn sender_id(&self) -> Option<i64> {
        self.sender.as_ref().map(|s| s.id)
    }

    pub fn source_identities(&self) -> Vec<ChatIdentity> {
        let mut out = vec![self.chat.id.clone()];
        if let Some(handle) = self.chat.username.as_deref().and_then(ChatIdentity::handle) {
            if handle != self.chat.id {
                out.push(handle);
            }
        }
        out
    }

    pub fn preview(&self, max_chars: usize) -> String {
        let raw = match self.text.as_deref() {
            Some(text) if !text.is_empty() => text.replace('\n', " "),
            _ => format!("[{}]", self.media_kind().as_str()),
        };
        if raw.chars().count() > max_chars {
            let cut: String = raw.chars().take(max_chars).collect();
            format!("{}...", cut)
        } else {
            raw
        }
    }
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(InboundMessage),
    MediaGroupCompleted {
        chat: ChatIdentity,
        key: MediaGroupKey,
    },
}
