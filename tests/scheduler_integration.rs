use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pdca_runtime::definitions::builtin::{ACTION_RUN_SLICE, STATE_IDLE, STATE_WORKING};
use pdca_runtime::definitions::control_plane_definition;
use pdca_runtime::engine::{
    ActionContext, ActionHandler, ActionRegistry, DispatchReport, Dispatcher, DispatcherConfig,
    SignalBus, StateTable,
};
use pdca_runtime::types::names::{
    EVENT_SIGNAL_EMITTED, EVENT_SLICE_COMPLETED_DONE, EVENT_SLICE_REQUESTED,
    SIGNAL_ACTION_SUCCEEDED, SIGNAL_SLICE_REQUESTED,
};
use pdca_runtime::scheduler::{
    get_metrics, record_slice_outcome, QueueRunner, RunnerConfig, SliceOutcome, SliceRequest,
};
use pdca_runtime::storage::{update_checkpoint, InMemoryTaskStore, StoreResult, TaskStore};
use pdca_runtime::{
    Checkpoint, CheckpointWrite, Event, Payload, PdcaTask, Signal, TaskClass, TaskStatus,
};

fn create_test_task(id: &str, owner: &str, priority: i64) -> PdcaTask {
    PdcaTask::new(id, owner, format!("conv-{}", owner), "session").with_priority(priority)
}

fn runner_config(worker_id: &str) -> RunnerConfig {
    RunnerConfig {
        worker_id: worker_id.to_string(),
        ..RunnerConfig::default()
    }
}

/// Slice executor that completes the task and checkpoints its progress.
struct CompletingSlice {
    store: Arc<InMemoryTaskStore>,
}

#[async_trait]
impl ActionHandler for CompletingSlice {
    async fn handle(&self, ctx: ActionContext<'_>) -> Result<Value> {
        let request = SliceRequest::from_signal(ctx.signal)
            .ok_or_else(|| anyhow::anyhow!("not a slice request"))?;

        let version = update_checkpoint(self.store.as_ref(), &request.task_id, 3, |state, task_state| {
            let mut state = state.clone();
            state.insert("last_slice".into(), json!(request.correlation_id));
            (state, task_state.clone())
        })
        .await?;

        let task = record_slice_outcome(
            self.store.as_ref(),
            &request.task_id,
            SliceOutcome::Done,
            Some(&request.correlation_id),
        )
        .await?;

        Ok(json!({"task_id": task.task_id, "checkpoint_version": version}))
    }
}

#[tokio::test]
async fn test_runner_to_dispatcher_round_trip() {
    let store = Arc::new(InMemoryTaskStore::new());
    store.upsert(create_test_task("T1", "O1", 10)).await.unwrap();

    let (bus, mut receiver) = SignalBus::new(Some(store.clone() as Arc<dyn TaskStore>));
    let table = Arc::new(StateTable::from_definition(control_plane_definition()).unwrap());
    let registry = ActionRegistry::new().with(
        ACTION_RUN_SLICE,
        Arc::new(CompletingSlice {
            store: store.clone(),
        }),
    );
    let mut dispatcher =
        Dispatcher::new(table, registry, bus.clone(), DispatcherConfig::default()).unwrap();
    let mut runner = QueueRunner::new(store.clone(), bus, runner_config("worker-1"));

    let report = runner.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.as_deref(), Some("T1"));

    let slice_signal = receiver.receive(Duration::from_millis(100)).await.unwrap();
    assert_eq!(slice_signal.signal_type(), SIGNAL_SLICE_REQUESTED);
    let correlation_id = slice_signal.correlation_id().to_string();

    let report = dispatcher.dispatch(slice_signal).await;
    assert!(matches!(report, DispatchReport::ActionSucceeded { emitted: true, .. }));
    assert_eq!(dispatcher.current_state().key, STATE_WORKING);

    let outcome = receiver.receive(Duration::from_millis(100)).await.unwrap();
    assert_eq!(outcome.signal_type(), SIGNAL_ACTION_SUCCEEDED);
    assert_eq!(outcome.correlation_id(), correlation_id);
    assert_eq!(outcome.payload()["output"]["checkpoint_version"], 1);

    // The success signal is routed like any other and settles the control plane.
    dispatcher.dispatch(outcome).await;
    assert_eq!(dispatcher.current_state().key, STATE_IDLE);

    let task = store.get_task("T1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.slice_cycles, 1);

    let checkpoint = store.get_checkpoint("T1").await.unwrap().unwrap();
    assert_eq!(checkpoint.state["last_slice"], json!(correlation_id));

    let completed = store
        .latest_event("T1", EVENT_SLICE_COMPLETED_DONE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.correlation_id.as_deref(), Some(correlation_id.as_str()));

    let metrics = get_metrics(store.as_ref(), Utc::now(), 5).await.unwrap();
    assert_eq!(metrics.terminal_outcomes_total.done, 1);
    assert_eq!(metrics.queue_depth_by_status["done"], 1);
    assert!((metrics.dispatch_rate_per_minute - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_interactive_boost_scenario() {
    let store = Arc::new(InMemoryTaskStore::new());
    store.upsert(create_test_task("T1", "O1", 100)).await.unwrap();
    store
        .upsert(create_test_task("T2", "O2", 70).with_class(TaskClass::Interactive))
        .await
        .unwrap();

    let (bus, mut receiver) = SignalBus::new(None);
    let config = RunnerConfig {
        interactive_boost: 40,
        ..runner_config("worker-1")
    };
    let mut runner = QueueRunner::new(store.clone(), bus, config);

    let first = runner.tick(Utc::now()).await.unwrap();
    assert_eq!(first.dispatched.as_deref(), Some("T2"));
    let second = runner.tick(Utc::now()).await.unwrap();
    assert_eq!(second.dispatched.as_deref(), Some("T1"));

    let dispatched: Vec<String> = std::iter::from_fn(|| receiver.try_receive())
        .filter_map(|s| s.payload_str("task_id").map(str::to_string))
        .collect();
    assert_eq!(dispatched, vec!["T2", "T1"]);
}

#[tokio::test]
async fn test_upsert_round_trip_through_runnable() {
    let store = InMemoryTaskStore::new();
    let task = create_test_task("round-trip", "owner-7", 42)
        .with_next_run_at(Some(Utc::now() - chrono::Duration::seconds(1)));
    store.upsert(task).await.unwrap();

    let runnable = store.list_runnable(Utc::now(), 10).await.unwrap();

    assert_eq!(runnable.len(), 1);
    assert_eq!(runnable[0].task_id, "round-trip");
    assert_eq!(runnable[0].owner_id, "owner-7");
    assert_eq!(runnable[0].priority, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lease_has_single_winner() {
    let store = Arc::new(InMemoryTaskStore::new());
    store.upsert(create_test_task("hot", "O1", 1)).await.unwrap();
    let now = Utc::now();

    let attempts = (0..32).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .acquire_lease("hot", &format!("worker-{}", i), 30, now)
                .await
                .unwrap()
        })
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(winners, 1);
    assert!(store.list_runnable(now, 10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkpoint_updates_all_land() {
    let store = Arc::new(InMemoryTaskStore::new());
    let writers = 8;

    let updates = (0..writers).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            update_checkpoint(store.as_ref(), "shared", writers, |state, task_state| {
                let mut state = state.clone();
                let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
                state.insert("count".into(), json!(count + 1));
                (state, task_state.clone())
            })
            .await
            .unwrap()
        })
    });
    let versions: HashSet<i64> = futures::future::join_all(updates)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(versions, (1..=writers as i64).collect::<HashSet<_>>());
    let checkpoint = store.get_checkpoint("shared").await.unwrap().unwrap();
    assert_eq!(checkpoint.version, writers as i64);
    assert_eq!(checkpoint.state["count"], writers as i64);
}

#[tokio::test]
async fn test_stale_checkpoint_write_does_not_mutate() {
    let store = InMemoryTaskStore::new();
    let first = json!({"step": 1}).as_object().cloned().unwrap();
    let stale = json!({"step": 99}).as_object().cloned().unwrap();

    assert_eq!(
        store.save_checkpoint("t", first, Payload::new(), 0).await.unwrap(),
        CheckpointWrite::Saved { version: 1 }
    );
    assert_eq!(
        store.save_checkpoint("t", stale, Payload::new(), 0).await.unwrap(),
        CheckpointWrite::Conflict { current_version: 1 }
    );

    let checkpoint = store.get_checkpoint("t").await.unwrap().unwrap();
    assert_eq!(checkpoint.version, 1);
    assert_eq!(checkpoint.state["step"], 1);
}

#[tokio::test]
async fn test_durable_slice_signal_is_audited() {
    let store = Arc::new(InMemoryTaskStore::new());
    let (bus, mut receiver) = SignalBus::new(Some(store.clone() as Arc<dyn TaskStore>));

    bus.emit(
        Signal::new(SIGNAL_SLICE_REQUESTED)
            .with_field("task_id", "T9")
            .durable(),
    )
    .await
    .unwrap();

    let audit = store
        .latest_event("T9", EVENT_SIGNAL_EMITTED)
        .await
        .unwrap()
        .unwrap();
    let delivered = receiver.try_receive().unwrap();
    assert_eq!(
        audit.payload_str("signal_id"),
        Some(delivered.id().to_string().as_str())
    );
}

/// Store that hands out every task in `list_runnable` but refuses leases on
/// `contended` ids, as if another runner won the race in between.
struct ContendedStore {
    inner: InMemoryTaskStore,
    contended: HashSet<String>,
}

#[async_trait]
impl TaskStore for ContendedStore {
    async fn upsert(&self, task: PdcaTask) -> StoreResult<PdcaTask> {
        self.inner.upsert(task).await
    }
    async fn get_task(&self, task_id: &str) -> StoreResult<Option<PdcaTask>> {
        self.inner.get_task(task_id).await
    }
    async fn list_tasks(&self) -> StoreResult<Vec<PdcaTask>> {
        self.inner.list_tasks().await
    }
    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PdcaTask>> {
        self.inner.list_runnable(now, limit).await
    }
    async fn acquire_lease(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if self.contended.contains(task_id) {
            return Ok(false);
        }
        self.inner
            .acquire_lease(task_id, worker_id, lease_seconds, now)
            .await
    }
    async fn release_lease(&self, task_id: &str, worker_id: &str) -> StoreResult<()> {
        self.inner.release_lease(task_id, worker_id).await
    }
    async fn reschedule(
        &self,
        task_id: &str,
        worker_id: &str,
        next_run_at: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> StoreResult<bool> {
        self.inner
            .reschedule(task_id, worker_id, next_run_at, status)
            .await
    }
    async fn get_checkpoint(&self, task_id: &str) -> StoreResult<Option<Checkpoint>> {
        self.inner.get_checkpoint(task_id).await
    }
    async fn save_checkpoint(
        &self,
        task_id: &str,
        state: Payload,
        task_state: Payload,
        expected_version: i64,
    ) -> StoreResult<CheckpointWrite> {
        self.inner
            .save_checkpoint(task_id, state, task_state, expected_version)
            .await
    }
    async fn append_event(
        &self,
        task_id: Option<&str>,
        event_type: &str,
        payload: Payload,
        correlation_id: Option<&str>,
    ) -> StoreResult<Event> {
        self.inner
            .append_event(task_id, event_type, payload, correlation_id)
            .await
    }
    async fn list_events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Event>> {
        self.inner.list_events_since(since).await
    }
    async fn latest_event(&self, task_id: &str, event_type: &str) -> StoreResult<Option<Event>> {
        self.inner.latest_event(task_id, event_type).await
    }
}

#[tokio::test]
async fn test_lost_lease_moves_to_next_candidate() {
    let store = Arc::new(ContendedStore {
        inner: InMemoryTaskStore::new(),
        contended: HashSet::from(["top".to_string()]),
    });
    store.upsert(create_test_task("top", "O1", 90)).await.unwrap();
    store.upsert(create_test_task("next", "O2", 50)).await.unwrap();

    let (bus, receiver) = SignalBus::new(None);
    let mut runner = QueueRunner::new(store.clone(), bus, runner_config("worker-1"));

    let report = runner.tick(Utc::now()).await.unwrap();

    assert_eq!(report.lease_conflicts, 1);
    assert_eq!(report.dispatched.as_deref(), Some("next"));
    assert_eq!(receiver.len(), 1);
    assert!(store
        .latest_event("top", EVENT_SLICE_REQUESTED)
        .await
        .unwrap()
        .is_none());
}
