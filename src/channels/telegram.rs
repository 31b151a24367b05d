use crate::delivery::{
    DeliveryClient, DeliveryError, DeliveryResult, DispatchProgress, OutboundContent, SendMode,
    SendOptions, UploadItem, UploadMetadata,
};
use crate::types::{
    ChatIdentity, InboundEvent, InboundMessage, MediaDescriptor, MediaGroupKey, MediaKind, Sender,
    SourceChat,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// sendMediaGroup accepts at most ten items.
const MEDIA_GROUP_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    async fn call(&self, method: &str, payload: &Value) -> DeliveryResult<Value> {
        let resp = self
            .http
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(resp).await
    }

    async fn call_multipart(&self, method: &str, form: Form) -> DeliveryResult<Value> {
        let resp = self
            .http
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(resp).await
    }

    pub async fn get_updates(&self, offset: i64, timeout_seconds: u64) -> DeliveryResult<Vec<Value>> {
        let result = self
            .call(
                "getUpdates",
                &json!({
                    "offset": offset,
                    "timeout": timeout_seconds,
                    "allowed_updates": ["message", "channel_post"],
                }),
            )
            .await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    pub async fn send_text(&self, target: &ChatIdentity, text: &str) -> DeliveryResult<()> {
        self.call(
            "sendMessage",
            &json!({ "chat_id": chat_param(target), "text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn upload_single(
        &self,
        target: &ChatIdentity,
        item: &UploadItem,
        caption: Option<&str>,
    ) -> DeliveryResult<()> {
        let (method, field) = upload_method(item.kind);
        let mut form = Form::new()
            .text("chat_id", chat_param_text(target))
            .part(field, upload_part(item, field)?);
        if let Some(caption) = caption.filter(|_| item.kind != MediaKind::Sticker) {
            form = form.text("caption", caption.to_string());
        }
        self.call_multipart(method, form).await.map(|_| ())
    }

    async fn upload_album(
        &self,
        target: &ChatIdentity,
        items: &[UploadItem],
        caption: Option<&str>,
        progress: &DispatchProgress,
    ) -> DeliveryResult<()> {
        let done = progress.chunks_sent();
        for (chunk_index, chunk) in items.chunks(MEDIA_GROUP_LIMIT).enumerate().skip(done) {
            if chunk.len() == 1 {
                let caption = caption.filter(|_| chunk_index == 0);
                self.upload_single(target, &chunk[0], caption).await?;
                progress.mark_chunk_sent();
                continue;
            }
            let mut media = Vec::with_capacity(chunk.len());
            let mut form = Form::new().text("chat_id", chat_param_text(target));
            for (i, item) in chunk.iter().enumerate() {
                let name = format!("file{}", i);
                let mut entry = json!({
                    "type": album_media_type(item.kind),
                    "media": format!("attach://{}", name),
                });
                if chunk_index == 0 && i == 0 {
                    if let Some(caption) = caption {
                        entry["caption"] = Value::String(caption.to_string());
                    }
                }
                media.push(entry);
                form = form.part(name.clone(), upload_part(item, &name)?);
            }
            form = form.text("media", Value::Array(media).to_string());
            self.call_multipart("sendMediaGroup", form).await?;
            progress.mark_chunk_sent();
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryClient for TelegramClient {
    async fn send(
        &self,
        target: &ChatIdentity,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> DeliveryResult<()> {
        let chat_id = chat_param(target);
        let from_chat_id = chat_param(&content.source_chat);
        match (options.mode, content.caption.as_deref()) {
            (SendMode::Forward, _) => {
                self.call(
                    "forwardMessages",
                    &json!({
                        "chat_id": chat_id,
                        "from_chat_id": from_chat_id,
                        "message_ids": content.message_ids,
                    }),
                )
                .await?;
            }
            (SendMode::Copy, Some(caption)) if content.text_only => {
                self.send_text(target, caption).await?;
            }
            (SendMode::Copy, Some(caption)) if content.message_ids.len() == 1 => {
                self.call(
                    "copyMessage",
                    &json!({
                        "chat_id": chat_id,
                        "from_chat_id": from_chat_id,
                        "message_id": content.message_ids[0],
                        "caption": caption,
                    }),
                )
                .await?;
            }
            (SendMode::Copy, caption) => {
                // Album copies keep their own captions; a rewritten caption
                // goes out once, as a separate message ahead of the album.
                if let Some(caption) = caption.filter(|_| !options.progress.header_sent()) {
                    self.send_text(target, caption).await?;
                    options.progress.mark_header_sent();
                }
                self.call(
                    "copyMessages",
                    &json!({
                        "chat_id": chat_id,
                        "from_chat_id": from_chat_id,
                        "message_ids": content.message_ids,
                    }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn download(&self, message: &InboundMessage) -> DeliveryResult<Bytes> {
        let file_id = message
            .media
            .as_ref()
            .and_then(|m| m.file_id.as_deref())
            .ok_or_else(|| {
                DeliveryError::Permanent(format!("message {} has no downloadable media", message.id))
            })?;
        let file = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let file_path = file
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DeliveryError::Permanent("getFile returned no file_path".to_string()))?;
        let resp = self
            .http
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify(status.as_u16(), &Value::Null));
        }
        resp.bytes().await.map_err(transport_error)
    }

    async fn upload(
        &self,
        target: &ChatIdentity,
        items: &[UploadItem],
        metadata: &UploadMetadata,
    ) -> DeliveryResult<()> {
        let caption = metadata.caption.as_deref().filter(|c| !c.is_empty());
        match items {
            [] => match caption {
                Some(text) => self.send_text(target, text).await,
                None => Err(DeliveryError::Permanent("nothing to send".to_string())),
            },
            [item] => self.upload_single(target, item, caption).await,
            _ => {
                self.upload_album(target, items, caption, &metadata.progress)
                    .await
            }
        }
    }
}

fn chat_param(chat: &ChatIdentity) -> Value {
    match chat {
        ChatIdentity::Id(id) => json!(id),
        ChatIdentity::Handle(name) => json!(format!("@{}", name)),
    }
}

fn chat_param_text(chat: &ChatIdentity) -> String {
    chat.to_string()
}

fn upload_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Voice => ("sendVoice", "voice"),
        MediaKind::Animation => ("sendAnimation", "animation"),
        MediaKind::Sticker => ("sendSticker", "sticker"),
        _ => ("sendDocument", "document"),
    }
}

fn album_media_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "photo",
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        _ => "document",
    }
}

fn upload_part(item: &UploadItem, fallback_name: &str) -> DeliveryResult<Part> {
    let file_name = item
        .file_name
        .clone()
        .unwrap_or_else(|| fallback_name.to_string());
    let part = Part::bytes(item.bytes.to_vec()).file_name(file_name);
    match item.mime_type.as_deref() {
        Some(mime) => part
            .mime_str(mime)
            .map_err(|e| DeliveryError::Permanent(format!("invalid mime type {mime}: {e}"))),
        None => Ok(part),
    }
}

fn transport_error(err: reqwest::Error) -> DeliveryError {
    DeliveryError::Transient(err.to_string())
}

async fn read_response(resp: reqwest::Response) -> DeliveryResult<Value> {
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if body.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(body.get("result").cloned().unwrap_or(Value::Null));
    }
    Err(classify(status, &body))
}

pub fn classify(status: u16, body: &Value) -> DeliveryError {
    let description = body
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let retry_after = body
        .get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(|v| v.as_u64());
    if let Some(seconds) = retry_after {
        return DeliveryError::Throttled(Duration::from_secs(seconds));
    }
    if status == 429 {
        return DeliveryError::Throttled(Duration::from_secs(1));
    }
    let lowered = description.to_lowercase();
    if lowered.contains("protected content")
        || lowered.contains("can't be forwarded")
        || lowered.contains("can't be copied")
    {
        return DeliveryError::ForwardRestricted(description);
    }
    let reason = if description.is_empty() {
        format!("http {}", status)
    } else {
        description
    };
    if status >= 500 {
        DeliveryError::Transient(reason)
    } else {
        DeliveryError::Permanent(reason)
    }
}

pub async fn start_telegram_poller(
    client: TelegramClient,
    tx: mpsc::Sender<InboundEvent>,
    interval_seconds: u64,
    timeout_seconds: u64,
    cancel: CancellationToken,
) {
    let mut offset: i64 = 0;
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = client.get_updates(offset, timeout_seconds) => batch,
        };
        match batch {
            Ok(updates) => {
                for update in updates {
                    if let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) {
                        offset = offset.max(update_id + 1);
                    }
                    if let Some(msg) = parse_telegram_update(&update) {
                        debug!(message_id = msg.id, chat = %msg.chat.id, "telegram update");
                        if tx.send(InboundEvent::Message(msg)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(DeliveryError::Throttled(wait)) => {
                warn!(wait_ms = wait.as_millis() as u64, "telegram polling throttled");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(wait) => {}
                }
                continue;
            }
            Err(err) => warn!("telegram polling failed: {err}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(Duration::from_secs(interval_seconds)) => {}
        }
    }
    debug!("telegram poller stopped");
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn media_of(msg: &Value) -> Option<(MediaKind, &Value)> {
    if let Some(photo) = msg
        .get("photo")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
    {
        return Some((MediaKind::Photo, photo));
    }
    // Animations also carry a `document` field, so they are checked first.
    const FIELDS: [(&str, MediaKind); 6] = [
        ("animation", MediaKind::Animation),
        ("video", MediaKind::Video),
        ("audio", MediaKind::Audio),
        ("voice", MediaKind::Voice),
        ("sticker", MediaKind::Sticker),
        ("document", MediaKind::Document),
    ];
    FIELDS
        .iter()
        .find_map(|(field, kind)| msg.get(*field).map(|v| (*kind, v)))
}

pub fn parse_telegram_update(update: &Value) -> Option<InboundMessage> {
    let msg = update.get("message").or_else(|| update.get("channel_post"))?;
    let chat = msg.get("chat")?;
    let chat_id = chat.get("id")?.as_i64()?;
    let id = msg.get("message_id")?.as_i64()?;

    let title = str_field(chat, "title").or_else(|| str_field(chat, "first_name"));
    let sender = if let Some(from) = msg.get("from") {
        let name = [str_field(from, "first_name"), str_field(from, "last_name")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        Some(Sender {
            id: from.get("id")?.as_i64()?,
            name: Some(name).filter(|n| !n.is_empty()),
            username: str_field(from, "username"),
            is_bot: from.get("is_bot").and_then(|v| v.as_bool()),
            is_premium: from.get("is_premium").and_then(|v| v.as_bool()),
            is_verified: None,
        })
    } else {
        msg.get("sender_chat").and_then(|sc| {
            Some(Sender {
                id: sc.get("id")?.as_i64()?,
                name: str_field(sc, "title"),
                username: str_field(sc, "username"),
                is_bot: None,
                is_premium: None,
                is_verified: None,
            })
        })
    };

    let text = str_field(msg, "text").or_else(|| str_field(msg, "caption"));
    let group_key = str_field(msg, "media_group_id").map(MediaGroupKey);
    let media = match media_of(msg) {
        Some((kind, file)) => Some(MediaDescriptor {
            kind,
            size: file.get("file_size").and_then(|v| v.as_u64()),
            group_key,
            file_id: str_field(file, "file_id"),
            file_name: str_field(file, "file_name"),
            mime_type: str_field(file, "mime_type"),
        }),
        None if msg
            .get("link_preview_options")
            .and_then(|o| o.get("url"))
            .is_some() =>
        {
            Some(MediaDescriptor {
                kind: MediaKind::Webpage,
                size: None,
                group_key: None,
                file_id: None,
                file_name: None,
                mime_type: None,
            })
        }
        None => None,
    };

    let date = msg
        .get("date")
        .and_then(|v| v.as_i64())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        id,
        chat: SourceChat {
            id: ChatIdentity::Id(chat_id),
            title,
            username: str_field(chat, "username"),
        },
        sender,
        text,
        media,
        date,
        restricted: msg
            .get("has_protected_content")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}
