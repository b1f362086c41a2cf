//! Event intake: match cached listeners, rate-limit, and enqueue follow-up tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::task::{LLM_CALLBACK_TASK_TYPE, SCRIPT_EXECUTION_TASK_TYPE};
use crate::domain::models::{EventListener, ListenerAction, NewTask, RateLimitDecision, StoredEvent};
use crate::domain::ports::{EventRepository, ListenerRepository};
use crate::services::condition_matcher::matches_conditions;
use crate::services::rate_limiter::RateLimiter;
use crate::services::task_queue::TaskQueue;

type ListenerCache = HashMap<String, Vec<EventListener>>;

/// What happened to one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Id of the recorded event, if recording succeeded.
    pub event_id: Option<String>,
    /// Listeners whose conditions matched.
    pub matched: Vec<i64>,
    /// Task ids enqueued for matched listeners.
    pub enqueued: Vec<String>,
    /// Listeners refused by their daily cap.
    pub rate_limited: Vec<i64>,
    /// One-time listeners disabled by this event.
    pub disabled: Vec<i64>,
    /// Listeners whose task could not be enqueued.
    pub failed: Vec<i64>,
    /// Fail-open or fail-soft paths taken (rate-limit or recording errors).
    pub degraded: u32,
}

impl ProcessReport {
    pub fn triggered(&self) -> usize {
        self.enqueued.len()
    }
}

pub struct EventProcessor {
    listeners: Arc<dyn ListenerRepository>,
    events: Arc<dyn EventRepository>,
    queue: Arc<TaskQueue>,
    rate_limiter: RateLimiter,
    cache: RwLock<Option<ListenerCache>>,
}

impl EventProcessor {
    pub fn new(
        listeners: Arc<dyn ListenerRepository>,
        events: Arc<dyn EventRepository>,
        queue: Arc<TaskQueue>,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            listeners,
            events,
            queue,
            rate_limiter,
            cache: RwLock::new(None),
        }
    }

    /// Reload enabled listeners from storage. Returns how many were cached.
    #[instrument(skip(self), err)]
    pub async fn refresh_listener_cache(&self) -> DomainResult<usize> {
        let enabled = self.listeners.list_enabled().await?;
        let count = enabled.len();

        let mut by_source: ListenerCache = HashMap::new();
        for listener in enabled {
            by_source.entry(listener.source_id.clone()).or_default().push(listener);
        }
        *self.cache.write().await = Some(by_source);

        debug!(count, "Listener cache refreshed");
        Ok(count)
    }

    /// Drop the cache so the next event reloads it.
    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    /// Refresh the cache every `interval` until `shutdown` flips to true.
    ///
    /// `interval` bounds how long a new or edited listener can go unseen.
    pub fn spawn_cache_refresher(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = processor.refresh_listener_cache().await {
                            warn!(error = %e, "Listener cache refresh failed, keeping previous cache");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Listener cache refresher stopped");
        })
    }

    async fn ensure_cache(&self) -> DomainResult<()> {
        if self.cache.read().await.is_none() {
            self.refresh_listener_cache().await?;
        }
        Ok(())
    }

    /// Take a one-time listener out of the cache. False if another pass
    /// already took it.
    async fn evict(&self, listener: &EventListener) -> bool {
        let mut cache = self.cache.write().await;
        let Some(entries) = cache.as_mut().and_then(|c| c.get_mut(&listener.source_id)) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|l| l.id != listener.id);
        before != entries.len()
    }

    /// Put back a one-time listener that was evicted but did not fire.
    async fn restore(&self, listener: EventListener) {
        if let Some(cache) = self.cache.write().await.as_mut() {
            cache.entry(listener.source_id.clone()).or_default().push(listener);
        }
    }

    pub async fn process_event(&self, source_id: &str, payload: Value) -> DomainResult<ProcessReport> {
        self.process_event_at(source_id, payload, Utc::now()).await
    }

    /// Match `payload` from `source_id` against cached listeners and enqueue
    /// one task per allowed match.
    #[instrument(skip(self, payload), err)]
    pub async fn process_event_at(
        &self,
        source_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> DomainResult<ProcessReport> {
        self.ensure_cache().await?;

        let candidates: Vec<EventListener> = self
            .cache
            .read()
            .await
            .as_ref()
            .and_then(|c| c.get(source_id))
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|l| l.enabled && matches_conditions(&l.match_conditions, &payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut report = ProcessReport::default();
        let mut triggered = Vec::new();

        for listener in candidates {
            report.matched.push(listener.id);

            // A one-time listener fires at most once per process even when
            // events for it arrive concurrently.
            if listener.one_time && !self.evict(&listener).await {
                debug!(listener_id = listener.id, "One-time listener already consumed");
                continue;
            }

            match self
                .rate_limiter
                .check_and_update_rate_limit(listener.id, &listener.conversation_id, now)
                .await
            {
                RateLimitDecision::Allowed { executions } => {
                    debug!(listener_id = listener.id, executions, "Rate limit check passed");
                }
                RateLimitDecision::Degraded { error } => {
                    warn!(listener_id = listener.id, %error, "Rate limiter degraded, allowing execution");
                    report.degraded += 1;
                }
                RateLimitDecision::Denied { reason } => {
                    info!(listener_id = listener.id, %reason, "Listener rate limited");
                    report.rate_limited.push(listener.id);
                    if listener.one_time {
                        self.restore(listener).await;
                    }
                    continue;
                }
            }

            let task = build_task(&listener, source_id, &payload, now);
            match self.queue.enqueue_at(task, now).await {
                Ok(record) => {
                    info!(
                        listener_id = listener.id,
                        listener = %listener.name,
                        task_id = %record.task_id,
                        "Listener triggered"
                    );
                    report.enqueued.push(record.task_id);
                    triggered.push(listener.id);
                }
                Err(e) => {
                    error!(listener_id = listener.id, error = %e, "Failed to enqueue listener task");
                    report.failed.push(listener.id);
                    if listener.one_time {
                        self.restore(listener).await;
                    }
                    continue;
                }
            }

            if listener.one_time {
                match self.listeners.set_enabled(listener.id, false).await {
                    Ok(_) => {
                        info!(listener_id = listener.id, "One-time listener disabled");
                        report.disabled.push(listener.id);
                    }
                    Err(e) => {
                        error!(listener_id = listener.id, error = %e, "Failed to disable one-time listener");
                        report.degraded += 1;
                    }
                }
            }
        }

        let event = StoredEvent::new(source_id, payload, triggered, now);
        match self.events.record(&event).await {
            Ok(()) => report.event_id = Some(event.event_id),
            Err(e) => {
                warn!(error = %e, "Failed to record event");
                report.degraded += 1;
            }
        }

        Ok(report)
    }
}

/// Build the follow-up task for a matched listener.
fn build_task(listener: &EventListener, source_id: &str, event_data: &Value, now: DateTime<Utc>) -> NewTask {
    let suffix = Uuid::new_v4().simple();
    match &listener.action {
        ListenerAction::WakeLlm { context } => {
            let trigger = context.as_deref().map_or_else(
                || format!("Event listener '{}' matched an event from {source_id}", listener.name),
                |context| format!("Event listener '{}' matched: {context}", listener.name),
            );
            NewTask::new(
                format!("event_listener_{}_{suffix}", listener.id),
                LLM_CALLBACK_TASK_TYPE,
                json!({
                    "interface_type": listener.interface_type,
                    "conversation_id": listener.conversation_id,
                    "callback_context": {
                        "trigger": trigger,
                        "source": source_id,
                        "event_data": event_data,
                    },
                    "scheduling_timestamp": now.to_rfc3339(),
                }),
            )
        }
        ListenerAction::Script { code, config } => NewTask::new(
            format!("event_script_{}_{suffix}", listener.id),
            SCRIPT_EXECUTION_TASK_TYPE,
            json!({
                "script_code": code,
                "config": config,
                "event_data": event_data,
                "listener_id": listener.id,
                "conversation_id": listener.conversation_id,
                "interface_type": listener.interface_type,
                "task_name": format!("Event script: {}", listener.name),
            }),
        ),
    }
}
