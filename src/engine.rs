use crate::config::EngineConfig;
use crate::dedup::DedupCache;
use crate::delivery::{
    prepend_source, source_header, DeliveryClient, DeliveryError, DeliveryResult,
    DispatchProgress, OutboundContent, SendMode, SendOptions, UploadItem, UploadMetadata,
};
use crate::filter::decide_group;
use crate::media_group::{AggregatorSettings, MediaGroup, MediaGroupAggregator};
use crate::pacing::PacerRegistry;
use crate::retry::{AttemptOutcome, DeliveryAttempt, Pacing, RetryCoordinator, RetryPolicy};
use crate::router::RuleRouter;
use crate::rules::{Rule, RuleSet};
use crate::stats::{Counters, StatsSnapshot};
use crate::types::{ChatIdentity, InboundEvent, MediaKind};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
    #[error("engine event stream is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub aggregator: AggregatorSettings,
    pub retry: RetryPolicy,
    pub dedup_window: Duration,
    pub queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            aggregator: AggregatorSettings {
                inactivity: Duration::from_millis(cfg.media_group_timeout_ms),
                max_group_size: cfg.max_group_size.max(1),
            },
            retry: RetryPolicy {
                max_attempts: cfg.max_attempts.max(1),
                base_backoff: Duration::from_millis(cfg.backoff_base_ms),
                max_backoff: Duration::from_millis(cfg.backoff_max_ms),
                wait_on_throttle: true,
            },
            dedup_window: Duration::from_secs(cfg.dedup_window_seconds),
            queue_capacity: cfg.queue_capacity.max(1),
        }
    }
}

struct Shared {
    client: Arc<dyn DeliveryClient>,
    router: RuleRouter,
    counters: Counters,
    pacers: PacerRegistry,
    retry: RetryCoordinator,
    settings: EngineSettings,
}

struct Running {
    cancel: CancellationToken,
    driver: JoinHandle<mpsc::Receiver<InboundEvent>>,
}

pub struct ForwardingEngine {
    shared: Arc<Shared>,
    events: Mutex<mpsc::Sender<InboundEvent>>,
    inbox: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    running: Mutex<Option<Running>>,
}

impl ForwardingEngine {
    pub fn new(client: Arc<dyn DeliveryClient>, rules: RuleSet, settings: EngineSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                client,
                router: RuleRouter::new(rules),
                counters: Counters::new(),
                pacers: PacerRegistry::new(),
                retry: RetryCoordinator::new(settings.retry.clone()),
                settings,
            }),
            events: Mutex::new(tx),
            inbox: Mutex::new(Some(rx)),
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let rx = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(EngineError::AlreadyRunning)?;
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(Arc::clone(&self.shared), rx, cancel.clone()));
        *running = Some(Running { cancel, driver });
        info!(
            rules = self.shared.router.snapshot().len(),
            "forwarding engine started"
        );
        Ok(())
    }

    /// Buffered albums get one best-effort attempt per target. Counters are kept.
    pub async fn stop(&self) -> Result<StatsSnapshot, EngineError> {
        let run = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(EngineError::NotRunning)?;
        run.cancel.cancel();
        let rx = match run.driver.await {
            Ok(rx) => rx,
            Err(err) => {
                error!("engine driver failed: {err:?}");
                let (tx, rx) = mpsc::channel(self.shared.settings.queue_capacity.max(1));
                *self.events.lock().unwrap_or_else(|e| e.into_inner()) = tx;
                rx
            }
        };
        *self.inbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);

        let snapshot = self.shared.counters.snapshot();
        info!(
            forwarded = snapshot.global.forwarded,
            filtered = snapshot.global.filtered,
            total = snapshot.global.total,
            failed = snapshot.global.failed,
            "forwarding engine stopped"
        );
        Ok(snapshot)
    }

    pub async fn restart(&self) -> Result<(), EngineError> {
        match self.stop().await {
            Ok(_) | Err(EngineError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        self.shared.counters.reset();
        self.shared.pacers.clear();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn sender(&self) -> mpsc::Sender<InboundEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn submit(&self, event: InboundEvent) -> Result<(), EngineError> {
        self.sender()
            .send(event)
            .await
            .map_err(|_| EngineError::Closed)
    }

    pub fn reload(&self, rules: RuleSet) {
        self.shared.router.replace(rules);
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        self.shared.router.set_enabled(name, enabled)
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.shared.router.snapshot()
    }

    pub fn counters(&self) -> StatsSnapshot {
        self.shared.counters.snapshot()
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
) -> mpsc::Receiver<InboundEvent> {
    let mut aggregator = MediaGroupAggregator::new(shared.settings.aggregator.clone());
    let mut dispatcher = Dispatcher::new(Arc::clone(&shared), cancel.clone());

    loop {
        let deadline = aggregator.next_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wait_for(deadline) => {
                for group in aggregator.expire(Instant::now()) {
                    info!(
                        group = ?group.key,
                        parts = group.part_count(),
                        timed_out = true,
                        "album flushed after inactivity"
                    );
                    dispatcher.dispatch(group).await;
                }
            }
            event = rx.recv() => match event {
                Some(InboundEvent::Message(message)) => {
                    if let Some(group) = aggregator.push(message, Instant::now()) {
                        dispatcher.dispatch(group).await;
                    }
                }
                Some(InboundEvent::MediaGroupCompleted { chat, key }) => {
                    if let Some(group) = aggregator.complete(&chat, &key) {
                        dispatcher.dispatch(group).await;
                    }
                }
                None => break,
            }
        }
    }

    let leftovers = aggregator.drain();
    if !leftovers.is_empty() {
        info!(albums = leftovers.len(), "flushing buffered albums on stop");
    }
    for group in leftovers {
        dispatcher.dispatch(group).await;
    }
    dispatcher.close().await;
    rx
}

struct Unit {
    group: MediaGroup,
    forwarded: AtomicBool,
}

struct Job {
    rule: Arc<Rule>,
    unit: Arc<Unit>,
}

struct Dispatcher {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    dedup: DedupCache,
    workers: HashMap<String, mpsc::Sender<Job>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    fn new(shared: Arc<Shared>, cancel: CancellationToken) -> Self {
        let dedup = DedupCache::new(shared.settings.dedup_window);
        Self {
            shared,
            cancel,
            dedup,
            workers: HashMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    async fn dispatch(&mut self, group: MediaGroup) {
        let Some(first) = group.first() else {
            return;
        };
        let rules = self.shared.router.route_message(first);
        if rules.is_empty() {
            debug!(message_id = first.id, chat = %first.chat.id, "no rule watches chat");
            return;
        }

        if self.dedup.is_enabled() {
            let text = group
                .messages
                .iter()
                .map(|m| m.text())
                .collect::<Vec<_>>()
                .join("\n");
            if self.dedup.check(&text, Instant::now()) {
                debug!(message_id = first.id, "duplicate unit skipped");
                return;
            }
        }

        let shared = Arc::clone(&self.shared);
        let counters = &shared.counters;
        counters.record_routed();
        let message_id = first.id;
        let unit = Arc::new(Unit {
            group,
            forwarded: AtomicBool::new(false),
        });

        let mut accepted = false;
        for rule in rules {
            counters.record_rule_evaluated(&rule.name);
            let decision = decide_group(&unit.group.messages, &rule);
            debug!(
                message_id,
                rule = %rule.name,
                action = ?decision.action,
                reason = %decision.reason,
                "filter decision"
            );
            if decision.is_forward() {
                accepted = true;
                self.enqueue(Job {
                    rule,
                    unit: Arc::clone(&unit),
                })
                .await;
            } else {
                counters.record_rule_filtered(&rule.name);
            }
        }
        if !accepted {
            counters.record_filtered();
        }
    }

    async fn enqueue(&mut self, job: Job) {
        let name = job.rule.name.clone();
        let tx = match self.workers.get(&name) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::channel(self.shared.settings.queue_capacity.max(1));
                self.tracker.spawn(run_worker(
                    Arc::clone(&self.shared),
                    rx,
                    self.cancel.clone(),
                ));
                self.workers.insert(name.clone(), tx.clone());
                tx
            }
        };
        if tx.send(job).await.is_err() {
            error!(rule = %name, "rule worker is gone, unit dropped");
            self.workers.remove(&name);
        }
    }

    async fn close(mut self) {
        self.workers.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_worker(shared: Arc<Shared>, mut rx: mpsc::Receiver<Job>, cancel: CancellationToken) {
    while let Some(job) = rx.recv().await {
        deliver_job(&shared, job, &cancel).await;
    }
}

async fn deliver_job(shared: &Shared, job: Job, cancel: &CancellationToken) {
    let Job { rule, unit } = job;
    // Work dequeued after a stop gets one attempt per target and no waits.
    let best_effort = cancel.is_cancelled();
    let downloads: OnceCell<Vec<UploadItem>> = OnceCell::new();
    let pacer = shared.pacers.get(&rule.name);
    let best_effort_retry = RetryCoordinator::new(RetryPolicy::best_effort());
    let no_cancel = CancellationToken::new();

    let rule_ref: &Rule = &rule;
    let unit_ref: &Unit = &unit;
    let deliveries = rule.targets.iter().map(|target| {
        let downloads = &downloads;
        let pacer = pacer.as_ref();
        let (coordinator, token) = if best_effort {
            (&best_effort_retry, &no_cancel)
        } else {
            (&shared.retry, cancel)
        };
        async move {
            let mut attempt =
                DeliveryAttempt::new(&rule_ref.name, target.clone(), unit_ref.group.message_ids());
            let pacing = (!best_effort).then(|| Pacing {
                pacer,
                delay: rule_ref.options.delay,
            });
            let client = shared.client.as_ref();
            let progress = Arc::new(DispatchProgress::default());
            let progress = &progress;
            let outcome = coordinator
                .drive(&mut attempt, pacing, token, move || {
                    deliver_once(client, rule_ref, &unit_ref.group, target, downloads, progress)
                })
                .await;
            report(shared, &attempt, &outcome);
            outcome == AttemptOutcome::Delivered
        }
    });
    let delivered = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();

    if delivered > 0 {
        shared.counters.record_rule_forwarded(&rule.name);
        if !unit.forwarded.swap(true, Ordering::SeqCst) {
            shared.counters.record_forwarded();
        }
    }
    let (message_id, preview) = unit
        .group
        .first()
        .map(|m| (m.id, m.preview(50)))
        .unwrap_or_default();
    info!(
        rule = %rule.name,
        message_id,
        preview = %preview,
        album = unit.group.is_album(),
        parts = unit.group.part_count(),
        delivered,
        targets = rule.targets.len(),
        "unit dispatched"
    );
}

fn report(shared: &Shared, attempt: &DeliveryAttempt, outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::Delivered => debug!(
            rule = %attempt.rule,
            target = %attempt.target,
            attempts = attempt.dispatches,
            outcome = "delivered",
            "delivery finished"
        ),
        AttemptOutcome::Failed(reason) => {
            shared.counters.record_failed();
            shared.counters.record_rule_failed(&attempt.rule);
            error!(
                rule = %attempt.rule,
                target = %attempt.target,
                message_ids = ?attempt.message_ids,
                attempts = attempt.dispatches,
                outcome = "failed",
                "delivery failed: {reason}"
            );
        }
        AttemptOutcome::Cancelled => {
            shared.counters.record_failed();
            shared.counters.record_rule_failed(&attempt.rule);
            warn!(
                rule = %attempt.rule,
                target = %attempt.target,
                message_ids = ?attempt.message_ids,
                attempts = attempt.dispatches,
                outcome = "cancelled",
                "delivery abandoned on stop"
            );
        }
    }
}

// A restriction reported by the platform falls back to re-upload within the
// same dispatch.
async fn deliver_once(
    client: &dyn DeliveryClient,
    rule: &Rule,
    group: &MediaGroup,
    target: &ChatIdentity,
    downloads: &OnceCell<Vec<UploadItem>>,
    progress: &Arc<DispatchProgress>,
) -> DeliveryResult<()> {
    let first = group
        .first()
        .ok_or_else(|| DeliveryError::Permanent("empty unit".to_string()))?;
    let restricted = group.messages.iter().any(|m| m.restricted);
    if rule.options.force_forward || restricted {
        return reupload(client, rule, group, target, downloads, progress).await;
    }

    let (mode, caption) = if rule.options.preserve_format {
        (SendMode::Forward, None)
    } else {
        (SendMode::Copy, source_caption(rule, group))
    };
    let content = OutboundContent {
        source_chat: first.chat.id.clone(),
        message_ids: group.message_ids(),
        caption,
        text_only: group.messages.iter().all(|m| m.media.is_none()),
    };
    let options = SendOptions {
        mode,
        progress: Arc::clone(progress),
    };
    match client.send(target, &content, &options).await {
        Err(DeliveryError::ForwardRestricted(reason)) => {
            warn!(
                rule = %rule.name,
                target = %target,
                "forwarding restricted ({reason}), re-uploading"
            );
            reupload(client, rule, group, target, downloads, progress).await
        }
        other => other,
    }
}

async fn reupload(
    client: &dyn DeliveryClient,
    rule: &Rule,
    group: &MediaGroup,
    target: &ChatIdentity,
    downloads: &OnceCell<Vec<UploadItem>>,
    progress: &Arc<DispatchProgress>,
) -> DeliveryResult<()> {
    let items = downloads
        .get_or_try_init(|| async {
            let mut items = Vec::new();
            for message in group.messages.iter() {
                let Some(media) = message.media.as_ref() else {
                    continue;
                };
                if media.kind == MediaKind::Webpage {
                    continue;
                }
                let bytes = client.download(message).await?;
                items.push(UploadItem {
                    kind: media.kind,
                    bytes,
                    file_name: media.file_name.clone(),
                    mime_type: media.mime_type.clone(),
                });
            }
            Ok::<_, DeliveryError>(items)
        })
        .await?;
    // A header already delivered by an earlier copy attempt is not repeated.
    let caption = source_caption(rule, group)
        .filter(|_| !progress.header_sent())
        .or_else(|| {
            group
                .first()
                .map(|m| m.text().to_string())
                .filter(|t| !t.is_empty())
        });
    let metadata = UploadMetadata {
        caption,
        progress: Arc::clone(progress),
    };
    client.upload(target, items, &metadata).await
}

fn source_caption(rule: &Rule, group: &MediaGroup) -> Option<String> {
    if !rule.options.add_source_info {
        return None;
    }
    let first = group.first()?;
    Some(prepend_source(first.text(), &source_header(first)))
}
