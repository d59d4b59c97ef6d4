//! Background auto-save.
//!
//! Quiz answers arrive far faster than storage should be written. Changes are
//! coalesced by `type:language` and flushed to a [`ChangeSink`] on an interval, after
//! the queue has been idle for a while, when the pending count reaches its cap, or on
//! demand. A failed write is put back at low priority unless a newer change for the
//! same key arrived in the meantime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AutoSaveConfig;
use crate::storage::{Priority, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    WordProgress,
    GameState,
    SessionState,
    Achievements,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::WordProgress => "wordProgress",
            ChangeType::GameState => "gameState",
            ChangeType::SessionState => "sessionState",
            ChangeType::Achievements => "achievements",
        }
    }

    fn is_singleton(self) -> bool {
        !matches!(self, ChangeType::WordProgress)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub language_code: Option<String>,
    pub data: Value,
    pub timestamp: i64,
    pub priority: Priority,
    #[serde(skip)]
    sequence: u64,
}

impl PendingChange {
    pub fn key(&self) -> String {
        change_key(self.change_type, self.language_code.as_deref())
    }
}

fn change_key(change_type: ChangeType, language: Option<&str>) -> String {
    format!("{}:{}", change_type.as_str(), language.unwrap_or(""))
}

/// One storage write produced by a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushWrite {
    WordProgress { language: String, data: Value },
    GameState(Value),
    SessionState(Value),
    Achievements(Value),
}

impl FlushWrite {
    fn from_change(change: &PendingChange) -> Option<Self> {
        let data = change.data.clone();
        match change.change_type {
            ChangeType::WordProgress => change
                .language_code
                .clone()
                .map(|language| FlushWrite::WordProgress { language, data }),
            ChangeType::GameState => Some(FlushWrite::GameState(data)),
            ChangeType::SessionState => Some(FlushWrite::SessionState(data)),
            ChangeType::Achievements => Some(FlushWrite::Achievements(data)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FlushWrite::WordProgress { .. } => "wordProgress",
            FlushWrite::GameState(_) => "gameState",
            FlushWrite::SessionState(_) => "sessionState",
            FlushWrite::Achievements(_) => "achievements",
        }
    }
}

/// Destination of flushed writes.
pub trait ChangeSink: Send + Sync + 'static {
    fn apply(&self, write: FlushWrite) -> impl Future<Output = Result<(), StorageError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlushTrigger {
    Interval,
    Idle,
    Capacity,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    /// Singleton changes superseded by a later one in the same batch.
    pub superseded: usize,
    pub requeued: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub enabled: bool,
    pub pending_changes: usize,
    pub is_processing: bool,
    pub last_action_time: Option<i64>,
    pub config: AutoSaveConfig,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, PendingChange>,
    /// Snapshot taken by the flush that is currently writing.
    in_flight: HashMap<String, PendingChange>,
    last_action: Option<i64>,
    sequence: u64,
}

pub struct AutoSaveQueue<S: ChangeSink> {
    config: AutoSaveConfig,
    sink: Arc<S>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    flush_lock: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    activity: Notify,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: ChangeSink> AutoSaveQueue<S> {
    pub fn new(config: AutoSaveConfig, sink: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sink,
            clock,
            state: Mutex::new(QueueState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            processing: AtomicBool::new(false),
            activity: Notify::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AutoSaveConfig {
        &self.config
    }

    /// Upserts the change for `type:language`. A disabled queue writes straight through.
    pub async fn queue_change(
        &self,
        change_type: ChangeType,
        data: Value,
        language: Option<&str>,
        priority: Priority,
    ) {
        let now = self.clock.now_ms();

        if !self.config.enabled {
            let change = PendingChange {
                change_type,
                language_code: language.map(str::to_string),
                data,
                timestamp: now,
                priority,
                sequence: 0,
            };
            if let Some(write) = FlushWrite::from_change(&change) {
                if let Err(err) = self.sink.apply(write).await {
                    warn!(key = %change.key(), error = %err, "write-through save failed");
                }
            }
            return;
        }

        let pending = {
            let mut state = self.state.lock();
            state.sequence += 1;
            let sequence = state.sequence;
            state.last_action = Some(now);

            let key = change_key(change_type, language);
            let priority = state
                .pending
                .get(&key)
                .map_or(priority, |existing| existing.priority.max(priority));
            state.pending.insert(
                key,
                PendingChange {
                    change_type,
                    language_code: language.map(str::to_string),
                    data,
                    timestamp: now,
                    priority,
                    sequence,
                },
            );
            state.pending.len()
        };
        self.activity.notify_one();

        if pending >= self.config.max_pending_changes {
            debug!(pending, "pending change cap reached, forcing flush");
            self.flush_with(FlushTrigger::Capacity).await;
        }
    }

    /// Waits for any in-flight flush, then flushes everything pending.
    pub async fn flush(&self) -> FlushReport {
        self.flush_with(FlushTrigger::Manual).await
    }

    async fn flush_with(&self, trigger: FlushTrigger) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked(trigger).await
    }

    /// Timer flushes never queue up behind a running one.
    async fn timer_flush(&self, trigger: FlushTrigger) -> Option<FlushReport> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!(trigger = ?trigger, "flush already in progress, skipping");
            return None;
        };
        Some(self.flush_locked(trigger).await)
    }

    async fn flush_locked(&self, trigger: FlushTrigger) -> FlushReport {
        let snapshot = {
            let mut state = self.state.lock();
            let snapshot = std::mem::take(&mut state.pending);
            state.in_flight = snapshot.clone();
            snapshot
        };
        if snapshot.is_empty() {
            return FlushReport::default();
        }

        self.processing.store(true, Ordering::SeqCst);
        let (batch, superseded) = plan_writes(snapshot);

        let results = join_all(
            batch
                .iter()
                .map(|(write, _)| self.sink.apply(write.clone())),
        )
        .await;

        let mut report = FlushReport {
            superseded,
            ..FlushReport::default()
        };
        for ((write, change), result) in batch.into_iter().zip(results) {
            match result {
                Ok(()) => report.written += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(kind = write.label(), key = %change.key(), error = %err, "auto-save write failed");
                    if self.requeue(change) {
                        report.requeued += 1;
                    }
                }
            }
        }
        self.state.lock().in_flight.clear();
        self.processing.store(false, Ordering::SeqCst);

        info!(
            trigger = ?trigger,
            written = report.written,
            failed = report.failed,
            superseded = report.superseded,
            "auto-save flush finished"
        );
        report
    }

    fn requeue(&self, change: PendingChange) -> bool {
        let mut state = self.state.lock();
        let key = change.key();
        if state.pending.contains_key(&key) {
            return false;
        }
        state.pending.insert(
            key,
            PendingChange {
                priority: Priority::Low,
                ..change
            },
        );
        true
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        QueueStatus {
            enabled: self.config.enabled,
            pending_changes: state.pending.len(),
            is_processing: self.processing.load(Ordering::SeqCst),
            last_action_time: state.last_action,
            config: self.config.clone(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Newest unsaved payload for `type:language`, whether still queued or being
    /// written by a running flush.
    pub fn latest_data(&self, change_type: ChangeType, language: Option<&str>) -> Option<Value> {
        let key = change_key(change_type, language);
        let state = self.state.lock();
        state
            .pending
            .get(&key)
            .or_else(|| state.in_flight.get(&key))
            .map(|change| change.data.clone())
    }

    pub fn pending(&self) -> Vec<PendingChange> {
        let mut changes: Vec<_> = self.state.lock().pending.values().cloned().collect();
        changes.sort_by_key(|c| c.sequence);
        changes
    }

    /// Spawns the interval and idle flush loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(interval_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(idle_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));
        info!(
            interval_ms = self.config.save_interval.as_millis() as u64,
            idle_ms = self.config.idle_threshold.as_millis() as u64,
            "auto-save started"
        );
    }

    /// Stops the timers and flushes what is left.
    pub async fn stop(&self) -> FlushReport {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "auto-save task ended abnormally");
            }
        }
        self.flush().await
    }
}

/// Orders the snapshot into writes, high priority first. Singleton types keep only
/// their latest change.
fn plan_writes(snapshot: HashMap<String, PendingChange>) -> (Vec<(FlushWrite, PendingChange)>, usize) {
    let mut latest_singleton: HashMap<ChangeType, PendingChange> = HashMap::new();
    let mut changes = Vec::with_capacity(snapshot.len());
    let mut superseded = 0;

    for change in snapshot.into_values() {
        if !change.change_type.is_singleton() {
            changes.push(change);
            continue;
        }
        match latest_singleton.get(&change.change_type) {
            Some(current) if (current.timestamp, current.sequence) >= (change.timestamp, change.sequence) => {
                superseded += 1;
            }
            Some(_) => {
                superseded += 1;
                latest_singleton.insert(change.change_type, change);
            }
            None => {
                latest_singleton.insert(change.change_type, change);
            }
        }
    }
    changes.extend(latest_singleton.into_values());
    changes.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));

    let batch = changes
        .into_iter()
        .filter_map(|change| match FlushWrite::from_change(&change) {
            Some(write) => Some((write, change)),
            None => {
                warn!(key = %change.key(), "dropping word progress change without a language");
                None
            }
        })
        .collect();
    (batch, superseded)
}

async fn interval_loop<S: ChangeSink>(queue: Arc<AutoSaveQueue<S>>, mut shutdown: broadcast::Receiver<()>) {
    let period = queue
        .config
        .save_interval
        .max(std::time::Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                queue.timer_flush(FlushTrigger::Interval).await;
            }
        }
    }
    debug!("auto-save interval loop stopped");
}

async fn idle_loop<S: ChangeSink>(queue: Arc<AutoSaveQueue<S>>, mut shutdown: broadcast::Receiver<()>) {
    let idle = queue.config.idle_threshold;
    'outer: loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = queue.activity.notified() => {}
        }
        // Restart the idle countdown on every new change.
        loop {
            tokio::select! {
                _ = shutdown.recv() => break 'outer,
                _ = queue.activity.notified() => continue,
                _ = tokio::time::sleep(idle) => {
                    queue.timer_flush(FlushTrigger::Idle).await;
                    break;
                }
            }
        }
    }
    debug!("auto-save idle loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<FlushWrite>>,
        fail: AtomicBool,
    }

    impl ChangeSink for RecordingSink {
        fn apply(&self, write: FlushWrite) -> impl Future<Output = Result<(), StorageError>> + Send {
            let failing = self.fail.load(Ordering::SeqCst);
            if !failing {
                self.writes.lock().push(write);
            }
            async move {
                if failing {
                    Err(StorageError::Offline("test".into()))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn queue_with(config: AutoSaveConfig) -> (Arc<AutoSaveQueue<RecordingSink>>, Arc<RecordingSink>, Arc<ManualClock>) {
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = Arc::new(AutoSaveQueue::new(config, sink.clone(), clock.clone()));
        (queue, sink, clock)
    }

    fn manual_config() -> AutoSaveConfig {
        AutoSaveConfig {
            enabled: true,
            save_interval: Duration::from_secs(3600),
            idle_threshold: Duration::from_secs(3600),
            max_pending_changes: 50,
        }
    }

    #[tokio::test]
    async fn burst_to_one_key_yields_one_write_with_last_data() {
        let (queue, sink, clock) = queue_with(manual_config());
        for score in [10, 20, 30] {
            queue
                .queue_change(ChangeType::GameState, json!({"score": score}), None, Priority::Medium)
                .await;
            clock.advance_ms(1);
        }
        assert_eq!(queue.pending_count(), 1);

        let report = queue.flush().await;
        assert_eq!(report.written, 1);
        assert_eq!(*sink.writes.lock(), vec![FlushWrite::GameState(json!({"score": 30}))]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn word_progress_is_written_per_language() {
        let (queue, sink, _) = queue_with(manual_config());
        queue
            .queue_change(ChangeType::WordProgress, json!({"a": 1}), Some("de"), Priority::Medium)
            .await;
        queue
            .queue_change(ChangeType::WordProgress, json!({"b": 1}), Some("es"), Priority::High)
            .await;
        queue
            .queue_change(ChangeType::WordProgress, json!({"a": 2}), Some("de"), Priority::Medium)
            .await;

        queue.flush().await;
        let writes = sink.writes.lock().clone();
        assert_eq!(writes.len(), 2);
        // High priority goes first.
        assert_eq!(
            writes[0],
            FlushWrite::WordProgress { language: "es".into(), data: json!({"b": 1}) }
        );
        assert!(writes.contains(&FlushWrite::WordProgress { language: "de".into(), data: json!({"a": 2}) }));
    }

    #[tokio::test]
    async fn failed_writes_are_requeued_at_low_priority() {
        let (queue, sink, _) = queue_with(manual_config());
        sink.fail.store(true, Ordering::SeqCst);
        queue
            .queue_change(ChangeType::SessionState, json!({"s": 1}), None, Priority::High)
            .await;

        let report = queue.flush().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 1);
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, Priority::Low);

        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(queue.flush().await.written, 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn latest_data_tracks_queued_and_failed_changes() {
        let (queue, sink, _) = queue_with(manual_config());
        assert!(queue.latest_data(ChangeType::WordProgress, Some("de")).is_none());
        queue
            .queue_change(ChangeType::WordProgress, json!({"a": 1}), Some("de"), Priority::Medium)
            .await;
        queue
            .queue_change(ChangeType::WordProgress, json!({"a": 2}), Some("de"), Priority::Medium)
            .await;
        assert_eq!(queue.latest_data(ChangeType::WordProgress, Some("de")), Some(json!({"a": 2})));
        assert!(queue.latest_data(ChangeType::WordProgress, Some("es")).is_none());

        sink.fail.store(true, Ordering::SeqCst);
        queue.flush().await;
        assert_eq!(queue.latest_data(ChangeType::WordProgress, Some("de")), Some(json!({"a": 2})));

        sink.fail.store(false, Ordering::SeqCst);
        queue.flush().await;
        assert!(queue.latest_data(ChangeType::WordProgress, Some("de")).is_none());
    }

    #[tokio::test]
    async fn cap_forces_flush() {
        let config = AutoSaveConfig {
            max_pending_changes: 2,
            ..manual_config()
        };
        let (queue, sink, _) = queue_with(config);
        queue
            .queue_change(ChangeType::WordProgress, json!({}), Some("de"), Priority::Medium)
            .await;
        assert!(sink.writes.lock().is_empty());
        queue
            .queue_change(ChangeType::WordProgress, json!({}), Some("es"), Priority::Medium)
            .await;
        assert_eq!(sink.writes.lock().len(), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn disabled_queue_writes_through() {
        let config = AutoSaveConfig {
            enabled: false,
            ..manual_config()
        };
        let (queue, sink, _) = queue_with(config);
        queue
            .queue_change(ChangeType::Achievements, json!(["first"]), None, Priority::Low)
            .await;
        assert_eq!(*sink.writes.lock(), vec![FlushWrite::Achievements(json!(["first"]))]);
        assert!(!queue.status().enabled);
        assert_eq!(queue.status().pending_changes, 0);
    }

    #[tokio::test]
    async fn idle_timer_flushes_after_quiet_period() {
        let config = AutoSaveConfig {
            idle_threshold: Duration::from_millis(30),
            ..manual_config()
        };
        let (queue, sink, _) = queue_with(config);
        queue.start();
        queue
            .queue_change(ChangeType::GameState, json!({"score": 1}), None, Priority::Medium)
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.writes.lock().len(), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_pending_changes() {
        let (queue, sink, _) = queue_with(manual_config());
        queue.start();
        queue
            .queue_change(ChangeType::GameState, json!({"score": 5}), None, Priority::Medium)
            .await;
        let report = queue.stop().await;
        assert_eq!(report.written, 1);
        assert_eq!(sink.writes.lock().len(), 1);
        assert_eq!(queue.status().last_action_time, Some(1_000));
    }
}
