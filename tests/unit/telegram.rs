mod support;

use bytes::Bytes;
use chat_relay::channels::telegram::{
    parse_telegram_update, start_telegram_poller, TelegramClient,
};
use chat_relay::config::RuleConfig;
use chat_relay::delivery::{
    DeliveryClient, DeliveryError, OutboundContent, SendMode, SendOptions, UploadItem,
    UploadMetadata,
};
use chat_relay::engine::{EngineSettings, ForwardingEngine};
use chat_relay::retry::RetryPolicy;
use chat_relay::rules::RuleSet;
use chat_relay::types::{ChatIdentity, InboundEvent, MediaGroupKey, MediaKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use support::{blacklist, media_message, rule_config};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

#[test]
fn test_parse_telegram_private_message() {
    let payload = json!({
        "update_id": 123456789,
        "message": {
            "message_id": 1,
            "from": {
                "id": 123456789_i64,
                "is_bot": false,
                "first_name": "Test",
                "last_name": "User",
                "username": "testuser"
            },
            "chat": {
                "id": 123456789_i64,
                "type": "private",
                "first_name": "Test",
                "username": "testuser"
            },
            "date": 1609459200,
            "text": "Hello from Telegram"
        }
    });
    let inbound = parse_telegram_update(&payload).unwrap();
    assert_eq!(inbound.id, 1);
    assert_eq!(inbound.chat.id, ChatIdentity::Id(123456789));
    assert_eq!(inbound.chat.title, Some("Test".to_string()));
    assert_eq!(inbound.text, Some("Hello from Telegram".to_string()));
    assert_eq!(inbound.date.timestamp(), 1609459200);
    let sender = inbound.sender.unwrap();
    assert_eq!(sender.name, Some("Test User".to_string()));
    assert_eq!(sender.username, Some("testuser".to_string()));
    assert_eq!(sender.is_bot, Some(false));
    assert!(inbound.media.is_none());
    assert!(!inbound.restricted);
}

#[test]
fn test_parse_telegram_channel_post() {
    let payload = json!({
        "update_id": 5,
        "channel_post": {
            "message_id": 77,
            "sender_chat": {
                "id": -1001234567890_i64,
                "title": "News Feed",
                "username": "newsfeed"
            },
            "chat": {
                "id": -1001234567890_i64,
                "type": "channel",
                "title": "News Feed",
                "username": "newsfeed"
            },
            "date": 1609459200,
            "text": "Breaking"
        }
    });
    let inbound = parse_telegram_update(&payload).unwrap();
    assert_eq!(inbound.chat.id, ChatIdentity::Id(-1001234567890));
    assert_eq!(inbound.chat.username, Some("newsfeed".to_string()));
    let sender = inbound.sender.unwrap();
    assert_eq!(sender.id, -1001234567890);
    assert_eq!(sender.name, Some("News Feed".to_string()));
}

#[test]
fn test_parse_telegram_album_photo() {
    let payload = json!({
        "update_id": 9,
        "message": {
            "message_id": 10,
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
            "chat": {"id": -100, "type": "supergroup", "title": "Photos"},
            "date": 1609459200,
            "media_group_id": "13579",
            "caption": "holiday",
            "has_protected_content": true,
            "photo": [
                {"file_id": "small", "file_size": 100, "width": 90, "height": 90},
                {"file_id": "large", "file_size": 2048, "width": 1280, "height": 1280}
            ]
        }
    });
    let inbound = parse_telegram_update(&payload).unwrap();
    assert_eq!(inbound.text, Some("holiday".to_string()));
    assert!(inbound.restricted);
    let media = inbound.media.unwrap();
    assert_eq!(media.kind, MediaKind::Photo);
    assert_eq!(media.file_id, Some("large".to_string()));
    assert_eq!(media.size, Some(2048));
    assert_eq!(media.group_key, Some(MediaGroupKey("13579".to_string())));
}

#[test]
fn test_parse_telegram_document() {
    let payload = json!({
        "update_id": 11,
        "message": {
            "message_id": 3,
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
            "chat": {"id": 555, "type": "private", "first_name": "Ada"},
            "date": 1609459200,
            "document": {
                "file_id": "doc-1",
                "file_name": "report.pdf",
                "mime_type": "application/pdf",
                "file_size": 4096
            }
        }
    });
    let media = parse_telegram_update(&payload).unwrap().media.unwrap();
    assert_eq!(media.kind, MediaKind::Document);
    assert_eq!(media.file_name, Some("report.pdf".to_string()));
    assert_eq!(media.mime_type, Some("application/pdf".to_string()));
    assert_eq!(media.group_key, None);
}

#[test]
fn test_parse_telegram_link_preview_is_webpage() {
    let payload = json!({
        "update_id": 12,
        "message": {
            "message_id": 4,
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
            "chat": {"id": 555, "type": "private"},
            "date": 1609459200,
            "text": "see https://example.com",
            "link_preview_options": {"url": "https://example.com"}
        }
    });
    let media = parse_telegram_update(&payload).unwrap().media.unwrap();
    assert_eq!(media.kind, MediaKind::Webpage);
}

#[test]
fn test_parse_telegram_ignores_other_updates() {
    let payload = json!({
        "update_id": 13,
        "edited_message": {"message_id": 1, "chat": {"id": 1}}
    });
    assert!(parse_telegram_update(&payload).is_none());
}

fn forward_content(ids: Vec<i64>) -> OutboundContent {
    OutboundContent {
        source_chat: ChatIdentity::Id(-100),
        message_ids: ids,
        caption: None,
        text_only: false,
    }
}

fn forward() -> SendOptions {
    SendOptions::new(SendMode::Forward)
}

#[tokio::test]
async fn test_forward_messages_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/forwardMessages"))
        .and(body_partial_json(json!({
            "chat_id": 200,
            "from_chat_id": -100,
            "message_ids": [1, 2]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true, "result": [{"message_id": 9}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    client
        .send(&ChatIdentity::Id(200), &forward_content(vec![1, 2]), &forward())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_flood_wait_is_throttled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/forwardMessages"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 12",
            "parameters": {"retry_after": 12}
        })))
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    let err = client
        .send(&ChatIdentity::Id(200), &forward_content(vec![1]), &forward())
        .await
        .unwrap_err();
    assert_eq!(err, DeliveryError::Throttled(Duration::from_secs(12)));
}

#[tokio::test]
async fn test_protected_content_is_forward_restricted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/forwardMessages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: message has protected content and can't be forwarded"
        })))
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    let err = client
        .send(&ChatIdentity::Id(200), &forward_content(vec![1]), &forward())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::ForwardRestricted(_)));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/forwardMessages"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    let err = client
        .send(&ChatIdentity::Id(200), &forward_content(vec![1]), &forward())
        .await
        .unwrap_err();
    assert_eq!(err, DeliveryError::Transient("http 500".to_string()));
}

#[tokio::test]
async fn test_copy_single_with_caption() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/copyMessage"))
        .and(body_partial_json(json!({
            "chat_id": "@relay",
            "message_id": 5,
            "caption": "From: Feed\n\nhello"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {"message_id": 1}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    let content = OutboundContent {
        caption: Some("From: Feed\n\nhello".to_string()),
        ..forward_content(vec![5])
    };
    client
        .send(
            &ChatIdentity::Handle("relay".to_string()),
            &content,
            &SendOptions::new(SendMode::Copy),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_download_fetches_file_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/getFile"))
        .and(body_partial_json(json!({"file_id": "large"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"file_id": "large", "file_path": "photos/file_1.jpg"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file/botTOKEN/photos/file_1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".to_vec()))
        .mount(&server)
        .await;

    let payload = json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "chat": {"id": -100, "type": "supergroup", "title": "Photos"},
            "date": 1609459200,
            "photo": [{"file_id": "large", "file_size": 10}]
        }
    });
    let message = parse_telegram_update(&payload).unwrap();
    let client = TelegramClient::new("TOKEN", server.uri());
    let bytes = client.download(&message).await.unwrap();
    assert_eq!(&bytes[..], b"jpeg-bytes");
}

#[tokio::test]
async fn test_download_without_media_is_permanent() {
    let client = TelegramClient::new("TOKEN", "http://127.0.0.1:9");
    let payload = json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "chat": {"id": -100, "type": "supergroup"},
            "date": 1609459200,
            "text": "plain"
        }
    });
    let message = parse_telegram_update(&payload).unwrap();
    let err = client.download(&message).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Permanent(_)));
}

#[tokio::test]
async fn test_upload_without_items_sends_caption_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .and(body_partial_json(json!({"chat_id": 200, "text": "only words"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {"message_id": 1}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    client
        .upload(
            &ChatIdentity::Id(200),
            &[],
            &UploadMetadata {
                caption: Some("only words".to_string()),
                ..UploadMetadata::default()
            },
        )
        .await
        .unwrap();

    let err = client
        .upload(&ChatIdentity::Id(200), &[], &UploadMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Permanent(_)));
}

fn ok_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {"message_id": 1}}))
}

async fn hits(server: &MockServer, endpoint: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == endpoint)
        .collect()
}

fn body_text(request: &Request) -> String {
    String::from_utf8_lossy(&request.body).to_string()
}

fn photo(payload: &'static [u8]) -> UploadItem {
    UploadItem {
        kind: MediaKind::Photo,
        bytes: Bytes::from_static(payload),
        file_name: None,
        mime_type: None,
    }
}

fn copy_rule() -> RuleConfig {
    let mut raw = blacklist(rule_config("copy", &[-100], &[200]));
    raw.forwarding.preserve_format = false;
    raw.forwarding.add_source_info = true;
    raw
}

fn telegram_engine(server: &MockServer, raw: RuleConfig) -> ForwardingEngine {
    let (rules, rejected) = RuleSet::load(&[raw]);
    assert!(rejected.is_empty(), "{rejected:?}");
    let settings = EngineSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            wait_on_throttle: true,
        },
        ..EngineSettings::default()
    };
    let client: Arc<dyn DeliveryClient> = Arc::new(TelegramClient::new("TOKEN", server.uri()));
    let engine = ForwardingEngine::new(client, rules, settings);
    engine.start().unwrap();
    engine
}

async fn submit_album(engine: &ForwardingEngine, ids: &[i64]) {
    for id in ids {
        engine
            .submit(InboundEvent::Message(media_message(
                -100,
                *id,
                MediaKind::Photo,
                10,
                Some("album"),
            )))
            .await
            .unwrap();
    }
    engine
        .submit(InboundEvent::MediaGroupCompleted {
            chat: ChatIdentity::Id(-100),
            key: MediaGroupKey("album".to_string()),
        })
        .await
        .unwrap();
}

async fn wait_for_outcome(engine: &ForwardingEngine) {
    for _ in 0..250 {
        let counters = engine.counters();
        if counters.global.forwarded + counters.global.failed > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_album_copy_retry_sends_header_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .respond_with(ok_response())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/copyMessages"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/copyMessages"))
        .respond_with(ok_response())
        .mount(&server)
        .await;

    let engine = telegram_engine(&server, copy_rule());
    submit_album(&engine, &[1, 2]).await;
    wait_for_outcome(&engine).await;
    let counters = engine.stop().await.unwrap();

    assert_eq!(counters.global.forwarded, 1);
    assert_eq!(counters.global.failed, 0);
    assert_eq!(hits(&server, "/botTOKEN/sendMessage").await.len(), 1);
    let copies = hits(&server, "/botTOKEN/copyMessages").await;
    assert_eq!(copies.len(), 3);
    let body: Value = serde_json::from_slice(&copies[2].body).unwrap();
    assert_eq!(body["message_ids"], json!([1, 2]));
}

#[tokio::test]
async fn test_restricted_album_copy_does_not_repeat_header_on_upload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .respond_with(ok_response())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/copyMessages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: message has protected content and can't be forwarded"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/getFile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"file_path": "photos/part.jpg"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file/botTOKEN/photos/part.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMediaGroup"))
        .respond_with(ok_response())
        .mount(&server)
        .await;

    let engine = telegram_engine(&server, copy_rule());
    submit_album(&engine, &[1, 2]).await;
    wait_for_outcome(&engine).await;
    let counters = engine.stop().await.unwrap();

    assert_eq!(counters.global.forwarded, 1);
    assert_eq!(hits(&server, "/botTOKEN/sendMessage").await.len(), 1);
    let albums = hits(&server, "/botTOKEN/sendMediaGroup").await;
    assert_eq!(albums.len(), 1);
    assert!(!body_text(&albums[0]).contains("Source:"));
}

#[tokio::test]
async fn test_album_copy_without_caption_is_one_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/copyMessages"))
        .and(body_partial_json(json!({
            "chat_id": 200,
            "from_chat_id": -100,
            "message_ids": [4, 5, 6]
        })))
        .respond_with(ok_response())
        .expect(1)
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    client
        .send(
            &ChatIdentity::Id(200),
            &forward_content(vec![4, 5, 6]),
            &SendOptions::new(SendMode::Copy),
        )
        .await
        .unwrap();
    assert!(hits(&server, "/botTOKEN/sendMessage").await.is_empty());
}

#[tokio::test]
async fn test_album_upload_uses_attach_references() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMediaGroup"))
        .respond_with(ok_response())
        .expect(1)
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    client
        .upload(
            &ChatIdentity::Id(200),
            &[photo(b"first"), photo(b"second")],
            &UploadMetadata {
                caption: Some("trip".to_string()),
                ..UploadMetadata::default()
            },
        )
        .await
        .unwrap();

    let albums = hits(&server, "/botTOKEN/sendMediaGroup").await;
    let body = body_text(&albums[0]);
    assert!(body.contains("attach://file0"));
    assert!(body.contains("attach://file1"));
    assert_eq!(body.matches(r#""caption":"trip""#).count(), 1);
    assert!(body.find("first").unwrap() < body.find("second").unwrap());
}

#[tokio::test]
async fn test_single_upload_uses_kind_method() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendPhoto"))
        .respond_with(ok_response())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendDocument"))
        .respond_with(ok_response())
        .expect(1)
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    client
        .upload(
            &ChatIdentity::Id(200),
            &[photo(b"pixels")],
            &UploadMetadata {
                caption: Some("sunset".to_string()),
                ..UploadMetadata::default()
            },
        )
        .await
        .unwrap();
    let document = UploadItem {
        kind: MediaKind::Document,
        bytes: Bytes::from_static(b"%PDF"),
        file_name: Some("report.pdf".to_string()),
        mime_type: Some("application/pdf".to_string()),
    };
    client
        .upload(&ChatIdentity::Id(200), &[document], &UploadMetadata::default())
        .await
        .unwrap();

    let photos = hits(&server, "/botTOKEN/sendPhoto").await;
    let body = body_text(&photos[0]);
    assert!(body.contains(r#"name="photo""#));
    assert!(body.contains(r#"name="caption""#));
    assert!(body.contains("sunset"));
    let documents = hits(&server, "/botTOKEN/sendDocument").await;
    let body = body_text(&documents[0]);
    assert!(body.contains(r#"filename="report.pdf""#));
    assert!(!body.contains(r#"name="caption""#));
}

#[tokio::test]
async fn test_album_upload_resumes_after_failed_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMediaGroup"))
        .respond_with(ok_response())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendPhoto"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendPhoto"))
        .respond_with(ok_response())
        .mount(&server)
        .await;

    let client = TelegramClient::new("TOKEN", server.uri());
    let items: Vec<UploadItem> = (0..11).map(|_| photo(b"part")).collect();
    let metadata = UploadMetadata::default();
    let err = client
        .upload(&ChatIdentity::Id(200), &items, &metadata)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Transient(_)));
    client
        .upload(&ChatIdentity::Id(200), &items, &metadata)
        .await
        .unwrap();

    assert_eq!(hits(&server, "/botTOKEN/sendMediaGroup").await.len(), 1);
    assert_eq!(hits(&server, "/botTOKEN/sendPhoto").await.len(), 2);
}

#[tokio::test]
async fn test_poller_advances_offset_and_stops_on_cancel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/getUpdates"))
        .and(body_partial_json(json!({"offset": 0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [
                {
                    "update_id": 5,
                    "message": {
                        "message_id": 1,
                        "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
                        "chat": {"id": 100, "type": "private", "first_name": "Ada"},
                        "date": 1609459200,
                        "text": "first"
                    }
                },
                {
                    "update_id": 6,
                    "channel_post": {
                        "message_id": 2,
                        "chat": {"id": -100, "type": "channel", "title": "Feed"},
                        "date": 1609459200,
                        "text": "second"
                    }
                }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": []})))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(start_telegram_poller(
        TelegramClient::new("TOKEN", server.uri()),
        tx,
        0,
        0,
        cancel.clone(),
    ));

    let mut ids = Vec::new();
    for _ in 0..2 {
        match rx.recv().await {
            Some(InboundEvent::Message(message)) => ids.push(message.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(ids, vec![1, 2]);

    let mut advanced = false;
    for _ in 0..100 {
        advanced = hits(&server, "/botTOKEN/getUpdates")
            .await
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .any(|body| body["offset"] == 7);
        if advanced {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(advanced);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), poller)
        .await
        .unwrap()
        .unwrap();
}
