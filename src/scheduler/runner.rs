use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::fairness::{effective_priority, order_candidates};
use crate::engine::SignalBus;
use crate::storage::TaskStore;
use crate::types::names::{
    EVENT_SLICE_REQUESTED, EVENT_STARVATION_WARNING, QUEUE_RUNNER_SOURCE, SIGNAL_SLICE_REQUESTED,
};
use crate::types::{OwnerId, Payload, PdcaTask, Signal, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub batch_limit: usize,
    pub lease_seconds: i64,
    pub dispatch_cooldown_seconds: i64,
    pub interactive_boost: i64,
    pub starvation_threshold_seconds: i64,
    pub starvation_warning_cooldown_seconds: i64,
    /// How many runnable tasks the starvation check looks at. Tasks sitting below the
    /// dispatch batch are the ones most likely to starve.
    pub starvation_scan_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval_ms: 1000,
            batch_limit: 20,
            lease_seconds: 30,
            dispatch_cooldown_seconds: 5,
            interactive_boost: 40,
            starvation_threshold_seconds: 300,
            starvation_warning_cooldown_seconds: 600,
            starvation_scan_limit: 500,
        }
    }
}

fn default_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("runner-{}", &id[..8])
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub candidates: usize,
    pub dispatched: Option<TaskId>,
    pub lease_conflicts: usize,
    pub starvation_warnings: usize,
}

/// Polling scheduler that turns runnable tasks into `pdca.slice.requested` signals.
///
/// Several runners with distinct worker ids may share one store; the only
/// coordination between them is `acquire_lease`.
pub struct QueueRunner {
    store: Arc<dyn TaskStore>,
    bus: SignalBus,
    config: RunnerConfig,
    last_owner: Option<OwnerId>,
}

impl QueueRunner {
    pub fn new(store: Arc<dyn TaskStore>, bus: SignalBus, config: RunnerConfig) -> Self {
        Self {
            store,
            bus,
            config,
            last_owner: None,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Owner of the task this runner dispatched most recently.
    pub fn last_owner(&self) -> Option<&str> {
        self.last_owner.as_deref()
    }

    /// One scheduling pass: starvation check, then at most one dispatch.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let runnable = self.store.list_runnable(now, self.config.batch_limit).await?;
        let mut report = TickReport {
            candidates: runnable.len(),
            ..TickReport::default()
        };
        if runnable.is_empty() {
            return Ok(report);
        }

        // A short batch already holds every runnable task.
        report.starvation_warnings = if runnable.len() < self.config.batch_limit
            || self.config.starvation_scan_limit <= runnable.len()
        {
            self.warn_starving(&runnable, now).await?
        } else {
            let backlog = self
                .store
                .list_runnable(now, self.config.starvation_scan_limit)
                .await?;
            self.warn_starving(&backlog, now).await?
        };

        let ordered = order_candidates(
            runnable,
            self.config.interactive_boost,
            self.last_owner.as_deref(),
        );

        for task in ordered {
            let leased = self
                .store
                .acquire_lease(
                    &task.task_id,
                    &self.config.worker_id,
                    self.config.lease_seconds,
                    now,
                )
                .await?;
            if !leased {
                log::debug!(
                    "lease lost task_id={} worker_id={}",
                    task.task_id,
                    self.config.worker_id
                );
                report.lease_conflicts += 1;
                continue;
            }

            let dispatched = self.dispatch_leased(&task, now).await;
            let released = self
                .store
                .release_lease(&task.task_id, &self.config.worker_id)
                .await;
            dispatched?;
            released?;

            self.last_owner = Some(task.owner_id.clone());
            report.dispatched = Some(task.task_id);
            break;
        }

        Ok(report)
    }

    async fn dispatch_leased(&self, task: &PdcaTask, now: DateTime<Utc>) -> Result<()> {
        let correlation_id = Uuid::new_v4().to_string();

        let signal = Signal::new(SIGNAL_SLICE_REQUESTED)
            .with_field("task_id", task.task_id.as_str())
            .with_field("owner_id", task.owner_id.as_str())
            .with_field("conversation_key", task.conversation_key.as_str())
            .with_field("session_id", task.session_id.as_str())
            .with_field("correlation_id", correlation_id.as_str())
            .with_source(QUEUE_RUNNER_SOURCE)
            .with_correlation_id(correlation_id.as_str());
        self.bus.emit(signal).await?;

        let mut payload = Payload::new();
        payload.insert("owner_id".into(), json!(task.owner_id));
        payload.insert("worker_id".into(), json!(self.config.worker_id));
        payload.insert("priority".into(), json!(task.priority));
        payload.insert(
            "effective_priority".into(),
            json!(effective_priority(task, self.config.interactive_boost)),
        );
        self.store
            .append_event(
                Some(&task.task_id),
                EVENT_SLICE_REQUESTED,
                payload,
                Some(&correlation_id),
            )
            .await?;

        let next_run_at = now + Duration::seconds(self.config.dispatch_cooldown_seconds.max(0));
        let rescheduled = self
            .store
            .reschedule(
                &task.task_id,
                &self.config.worker_id,
                Some(next_run_at),
                TaskStatus::Running,
            )
            .await?;
        if !rescheduled {
            log::warn!(
                "reschedule rejected task_id={} worker_id={}",
                task.task_id,
                self.config.worker_id
            );
        }

        log::info!(
            "dispatched task_id={} owner_id={} correlation_id={}",
            task.task_id,
            task.owner_id,
            correlation_id
        );
        Ok(())
    }

    async fn warn_starving(&self, candidates: &[PdcaTask], now: DateTime<Utc>) -> Result<usize> {
        let threshold = self.config.starvation_threshold_seconds;
        let cooldown = Duration::seconds(self.config.starvation_warning_cooldown_seconds.max(0));
        let mut warned = 0;

        for task in candidates {
            let Some(wait_seconds) = task.wait_seconds(now) else {
                continue;
            };
            if wait_seconds <= threshold {
                continue;
            }

            let recent = self
                .store
                .latest_event(&task.task_id, EVENT_STARVATION_WARNING)
                .await?
                .map(|event| now - event.created_at < cooldown)
                .unwrap_or(false);
            if recent {
                continue;
            }

            let mut payload = Payload::new();
            payload.insert("owner_id".into(), json!(task.owner_id));
            payload.insert("wait_seconds".into(), json!(wait_seconds));
            payload.insert("threshold_seconds".into(), json!(threshold));
            payload.insert("queue_depth".into(), json!(candidates.len()));
            self.store
                .append_event(Some(&task.task_id), EVENT_STARVATION_WARNING, payload, None)
                .await?;

            log::warn!(
                "task starving task_id={} owner_id={} wait_seconds={}",
                task.task_id,
                task.owner_id,
                wait_seconds
            );
            warned += 1;
        }

        Ok(warned)
    }

    /// Polls until `shutdown` flips to `true`. Tick failures are logged and retried
    /// on the next poll.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let interval = std::time::Duration::from_millis(self.config.poll_interval_ms.max(1));
        log::info!(
            "queue runner {} started (poll {:?}, batch {})",
            self.config.worker_id,
            interval,
            self.config.batch_limit
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick(Utc::now()).await {
                log::error!("queue runner tick failed: {:#}", e);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        log::info!("queue runner {} stopped", self.config.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SignalReceiver;
    use crate::storage::InMemoryTaskStore;
    use crate::types::TaskClass;

    fn create_test_task(id: &str, owner: &str, priority: i64) -> PdcaTask {
        PdcaTask::new(id, owner, format!("conv-{}", owner), format!("sess-{}", id))
            .with_priority(priority)
    }

    fn create_test_config() -> RunnerConfig {
        RunnerConfig {
            worker_id: "worker-1".to_string(),
            ..RunnerConfig::default()
        }
    }

    async fn create_test_runner(
        tasks: Vec<PdcaTask>,
        config: RunnerConfig,
    ) -> (QueueRunner, Arc<InMemoryTaskStore>, SignalReceiver) {
        let store = Arc::new(InMemoryTaskStore::new());
        for task in tasks {
            store.upsert(task).await.unwrap();
        }
        let (bus, rx) = SignalBus::new(None);
        let runner = QueueRunner::new(store.clone(), bus, config);
        (runner, store, rx)
    }

    #[tokio::test]
    async fn test_interactive_task_dispatched_first() {
        let t1 = create_test_task("T1", "O1", 100);
        let t2 = create_test_task("T2", "O2", 70).with_class(TaskClass::Interactive);
        let config = RunnerConfig {
            interactive_boost: 40,
            ..create_test_config()
        };
        let (mut runner, _store, mut rx) = create_test_runner(vec![t1, t2], config).await;

        let report = runner.tick(Utc::now()).await.unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.dispatched.as_deref(), Some("T2"));
        let signal = rx.try_receive().unwrap();
        assert_eq!(signal.signal_type(), SIGNAL_SLICE_REQUESTED);
        assert_eq!(signal.payload_str("task_id"), Some("T2"));
    }

    #[tokio::test]
    async fn test_dispatch_emits_signal_and_reschedules() {
        let task = create_test_task("T1", "O1", 10);
        let (mut runner, store, mut rx) = create_test_runner(vec![task], create_test_config()).await;
        let now = Utc::now();

        let report = runner.tick(now).await.unwrap();
        assert_eq!(report.dispatched.as_deref(), Some("T1"));

        let signal = rx.try_receive().unwrap();
        assert_eq!(signal.source(), QUEUE_RUNNER_SOURCE);
        assert_eq!(signal.payload_str("owner_id"), Some("O1"));
        assert_eq!(signal.payload_str("conversation_key"), Some("conv-O1"));
        assert_eq!(signal.payload_str("session_id"), Some("sess-T1"));
        assert_eq!(
            signal.payload_str("correlation_id"),
            Some(signal.correlation_id())
        );

        let stored = store.get_task("T1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.next_run_at, Some(now + Duration::seconds(5)));
        assert!(stored.lease_until.is_none());
        assert!(stored.worker_id.is_none());

        let event = store
            .latest_event("T1", EVENT_SLICE_REQUESTED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.correlation_id.as_deref(), Some(signal.correlation_id()));
        assert_eq!(event.payload_str("owner_id"), Some("O1"));

        // Cooling down: nothing to do until next_run_at.
        let report = runner.tick(now).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert!(report.dispatched.is_none());
    }

    #[tokio::test]
    async fn test_one_dispatch_per_tick() {
        let tasks = vec![
            create_test_task("a", "O1", 10),
            create_test_task("b", "O2", 10),
            create_test_task("c", "O3", 10),
        ];
        let (mut runner, _store, rx) = create_test_runner(tasks, create_test_config()).await;

        let report = runner.tick(Utc::now()).await.unwrap();

        assert_eq!(report.candidates, 3);
        assert!(report.dispatched.is_some());
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test]
    async fn test_owner_fairness_alternates() {
        let base = Utc::now() - Duration::seconds(60);
        let tasks = vec![
            create_test_task("a1", "A", 50).with_next_run_at(Some(base)),
            create_test_task("a2", "A", 50).with_next_run_at(Some(base + Duration::seconds(1))),
            create_test_task("b1", "B", 50).with_next_run_at(Some(base + Duration::seconds(2))),
        ];
        let (mut runner, _store, _rx) = create_test_runner(tasks, create_test_config()).await;
        let now = Utc::now();

        let first = runner.tick(now).await.unwrap();
        assert_eq!(first.dispatched.as_deref(), Some("a1"));
        assert_eq!(runner.last_owner(), Some("A"));

        // a2 is next in store order, but owner A was just served and B is waiting.
        let second = runner.tick(now).await.unwrap();
        assert_eq!(second.dispatched.as_deref(), Some("b1"));

        let third = runner.tick(now).await.unwrap();
        assert_eq!(third.dispatched.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_single_owner_is_dispatched_again() {
        let tasks = vec![
            create_test_task("a1", "A", 50),
            create_test_task("a2", "A", 40),
        ];
        let (mut runner, _store, _rx) = create_test_runner(tasks, create_test_config()).await;
        let now = Utc::now();

        assert_eq!(runner.tick(now).await.unwrap().dispatched.as_deref(), Some("a1"));
        assert_eq!(runner.tick(now).await.unwrap().dispatched.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_starvation_warning_respects_cooldown() {
        let now = Utc::now();
        let starving = create_test_task("old", "O1", 1)
            .with_next_run_at(Some(now - Duration::seconds(900)));
        let fresh = create_test_task("new", "O2", 1).with_next_run_at(Some(now - Duration::seconds(10)));
        let config = RunnerConfig {
            starvation_threshold_seconds: 300,
            starvation_warning_cooldown_seconds: 600,
            batch_limit: 10,
            ..create_test_config()
        };
        // A busy owner with higher priority keeps getting served.
        let hog = create_test_task("hog", "O3", 99);
        let (mut runner, store, _rx) = create_test_runner(vec![starving, fresh, hog], config).await;

        let report = runner.tick(now).await.unwrap();
        assert_eq!(report.starvation_warnings, 1);

        let warning = store
            .latest_event("old", EVENT_STARVATION_WARNING)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(warning.payload_str("owner_id"), Some("O1"));
        assert_eq!(warning.payload["wait_seconds"], 900);
        assert_eq!(warning.payload["threshold_seconds"], 300);
        assert_eq!(warning.payload["queue_depth"], 3);
        assert!(store.latest_event("new", EVENT_STARVATION_WARNING).await.unwrap().is_none());

        // Still starving on the next pass, but inside the cooldown window.
        let report = runner.tick(now).await.unwrap();
        assert_eq!(report.starvation_warnings, 0);
    }

    #[tokio::test]
    async fn test_starvation_scan_reaches_below_batch() {
        let now = Utc::now();
        let starving = create_test_task("buried", "O1", 1)
            .with_next_run_at(Some(now - Duration::seconds(900)));
        let hogs = (0..3).map(|i| create_test_task(&format!("hog-{}", i), "O2", 90));
        let config = RunnerConfig {
            starvation_threshold_seconds: 300,
            batch_limit: 2,
            ..create_test_config()
        };
        let (mut runner, store, _rx) =
            create_test_runner(hogs.chain(std::iter::once(starving)).collect(), config).await;

        let report = runner.tick(now).await.unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.starvation_warnings, 1);
        let warning = store
            .latest_event("buried", EVENT_STARVATION_WARNING)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(warning.payload["queue_depth"], 4);
        assert_ne!(report.dispatched.as_deref(), Some("buried"));
    }

    #[tokio::test]
    async fn test_empty_queue_is_quiet() {
        let (mut runner, store, rx) = create_test_runner(vec![], create_test_config()).await;

        let report = runner.tick(Utc::now()).await.unwrap();

        assert_eq!(report, TickReport::default());
        assert!(rx.is_empty());
        assert_eq!(store.event_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = RunnerConfig {
            poll_interval_ms: 10,
            ..create_test_config()
        };
        let (mut runner, _store, rx) =
            create_test_runner(vec![create_test_task("T1", "O1", 1)], config).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(rx.len(), 1);
    }
}
