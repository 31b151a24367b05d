pub mod api;
pub mod channels;
pub mod config;
pub mod dedup;
pub mod delivery;
pub mod engine;
pub mod filter;
pub mod media_group;
pub mod pacing;
pub mod retry;
pub mod router;
pub mod rules;
pub mod stats;
pub mod types;

pub use config::Config;

use self::api::AppState;
use self::channels::telegram as telegram_channel;
use self::config::load_config;
use self::delivery::DeliveryClient;
use self::engine::{EngineSettings, ForwardingEngine};
use self::rules::RuleSet;

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    let config = load_config()?;
    let token = config
        .telegram
        .bot_token
        .clone()
        .filter(|t| config.telegram.enabled && !t.trim().is_empty())
        .context("telegram.bot_token is required (or set CHAT_RELAY_TELEGRAM_TOKEN)")?;
    let client = telegram_channel::TelegramClient::new(token, config.telegram.api_base.clone());

    let (state, app) = build_app(config.clone(), Arc::new(client.clone()))?;

    let tx = state.engine.sender();
    tokio::spawn(telegram_channel::start_telegram_poller(
        client,
        tx,
        config.telegram.poll_interval_seconds,
        config.telegram.poll_timeout_seconds,
        state.shutdown.child_token(),
    ));

    Ok((state, app))
}

pub fn build_app(
    config: Config,
    client: Arc<dyn DeliveryClient>,
) -> anyhow::Result<(AppState, Router)> {
    let (rules, rejected) = RuleSet::load(&config.forwarding_rules);
    for err in &rejected {
        warn!("rule rejected: {err}");
    }
    info!(
        loaded = rules.len(),
        rejected = rejected.len(),
        "forwarding rules loaded"
    );

    let engine = Arc::new(ForwardingEngine::new(
        client,
        rules,
        EngineSettings::from(&config.engine),
    ));
    engine.start()?;

    let state = AppState {
        config,
        engine,
        shutdown: CancellationToken::new(),
    };
    let app = api::router(state.clone());
    Ok((state, app))
}
