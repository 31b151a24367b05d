use crate::types::{ChatIdentity, InboundMessage, MediaKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    #[error("throttled, retry after {0:?}")]
    Throttled(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("native forwarding restricted: {0}")]
    ForwardRestricted(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Forward,
    Copy,
}

// Shared across retries of one (unit, target) dispatch.
#[derive(Debug, Default)]
pub struct DispatchProgress {
    header_sent: AtomicBool,
    chunks_sent: AtomicUsize,
}

impl DispatchProgress {
    pub fn header_sent(&self) -> bool {
        self.header_sent.load(Ordering::SeqCst)
    }

    pub fn mark_header_sent(&self) {
        self.header_sent.store(true, Ordering::SeqCst);
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent.load(Ordering::SeqCst)
    }

    pub fn mark_chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub mode: SendMode,
    pub progress: Arc<DispatchProgress>,
}

impl SendOptions {
    pub fn new(mode: SendMode) -> Self {
        Self {
            mode,
            progress: Arc::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundContent {
    pub source_chat: ChatIdentity,
    pub message_ids: Vec<i64>,
    /// Replacement text for the first part; `None` keeps the original.
    pub caption: Option<String>,
    /// No part carries media, so a caption replaces the message text.
    pub text_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadItem {
    pub kind: MediaKind,
    pub bytes: Bytes,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadMetadata {
    pub caption: Option<String>,
    pub progress: Arc<DispatchProgress>,
}

/// An empty `items` slice in `upload` means a text-only message.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(
        &self,
        target: &ChatIdentity,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> DeliveryResult<()>;

    async fn download(&self, message: &InboundMessage) -> DeliveryResult<Bytes>;

    async fn upload(
        &self,
        target: &ChatIdentity,
        items: &[UploadItem],
        metadata: &UploadMetadata,
    ) -> DeliveryResult<()>;
}

pub fn source_header(message: &InboundMessage) -> String {
    let chat = &message.chat;
    let link = match (chat.username.as_deref(), &chat.id) {
        (Some(username), _) if !username.is_empty() => {
            Some(format!("https://t.me/{}/{}", username, message.id))
        }
        (_, ChatIdentity::Id(id)) => {
            let raw = id.to_string();
            raw.strip_prefix("-100")
                .filter(|rest| !rest.is_empty())
                .map(|internal| format!("https://t.me/c/{}/{}", internal, message.id))
        }
        _ => None,
    };
    let label = chat
        .title
        .clone()
        .unwrap_or_else(|| chat.id.to_string());

    let mut header = match link {
        Some(link) => format!("Source: {} {}", label, link),
        None => format!("Source: {}", label),
    };
    if let Some(sender) = message.sender.as_ref() {
        let name = sender.name.as_deref().filter(|n| !n.is_empty());
        let by = match (name, sender.username.as_deref()) {
            (Some(name), Some(username)) => format!("{} (@{})", name, username),
            (Some(name), None) => name.to_string(),
            (None, Some(username)) => format!("@{}", username),
            (None, None) => sender.id.to_string(),
        };
        header.push_str("\nFrom: ");
        header.push_str(&by);
    }
    header
}

pub fn prepend_source(text: &str, header: &str) -> String {
    if header.is_empty() {
        return text.to_string();
    }
    if text.is_empty() {
        header.to_string()
    } else {
        format!("{}\n\n{}", header, text)
    }
}
