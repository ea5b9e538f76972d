//! Task Store
//!
//! Durable task records, the priority dispatch queue, and the idempotency
//! index, all guarded by a single mutex so that creation, claim, and cancel
//! are each one atomic step. This is the only mutable structure shared
//! between producers and the orchestrator.
//!
//! # Dispatch order
//!
//! Queue entries sort by `(Reverse(priority), enqueue_seq)`: priority
//! strictly dominates, and ties break strictly FIFO. Priority is fixed at
//! creation. No reordering happens after enqueue.
//!
//! # Retention
//!
//! Terminal tasks and idempotency mappings expire after a TTL (24h default).
//! Pending and processing tasks are never purged; the retention clock for a
//! task only starts at its terminal transition.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::error::{Error, Result, TaskError};
use crate::task::{now_ms, GenerationResult, Task, TaskId, TaskSpec, TaskStatus};

/// Store tuning knobs, filled in from [`crate::config::GatewayConfig`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Retention window for terminal tasks
    pub task_ttl: Duration,
    /// Lifetime of an idempotency mapping
    pub idempotency_ttl: Duration,
    /// Maximum pending entries in the dispatch queue (0 = unlimited)
    pub queue_max_size: usize,
    /// Capacity of the status-change broadcast channel
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            task_ttl: Duration::from_secs(24 * 3600),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            queue_max_size: 1000,
            event_capacity: 256,
        }
    }
}

/// Status-change event published to subscribers. Fire-and-forget: the store
/// publishes whether or not anyone is listening.
#[derive(Clone, Debug)]
pub struct TaskEvent {
    /// Task that changed
    pub task_id: TaskId,
    /// Status after the change
    pub status: TaskStatus,
}

/// Outcome of a cancellation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task was still pending; it is now terminal and will never be claimed
    Cancelled,
    /// Task was in flight; the cooperative flag is set, nothing is aborted
    CancelRequested,
}

/// Queue sort key: priority strictly dominates, FIFO within a priority class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
}

struct IdempotencyEntry {
    task_id: TaskId,
    fingerprint: String,
    expires_at: u64,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<String, Task>,
    queue: BTreeMap<QueueKey, TaskId>,
    queued: HashMap<String, QueueKey>,
    idempotency: HashMap<String, IdempotencyEntry>,
}

/// The shared task store.
pub struct TaskStore {
    inner: Mutex<StoreInner>,
    config: StoreConfig,
    seq: AtomicU64,
    notify: Notify,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    /// Create a store with the given configuration
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Mutex::new(StoreInner::default()),
            config,
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A poisoned lock means a panic mid-mutation; the data is still the
        // most consistent view we have, so keep serving it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, task: &Task) {
        let _ = self.events.send(TaskEvent {
            task_id: task.id.clone(),
            status: task.status,
        });
    }

    /// Subscribe to status-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Create a task from a validated spec.
    ///
    /// If the spec carries an idempotency key this is a check-and-set: within
    /// the TTL window a repeated key resolves to the existing task without a
    /// new queue entry, and a reused key with a different spec is a
    /// [`Error::Conflict`]. Record, mapping, and queue entry are created as
    /// one atomic unit under the store lock.
    pub fn create(&self, spec: TaskSpec) -> Result<Task> {
        spec.validate()?;
        let now = now_ms();
        let mut inner = self.lock();
        self.purge_expired_locked(&mut inner, now);

        if let Some(key) = &spec.idempotency_key {
            if let Some(entry) = inner.idempotency.get(key) {
                if entry.fingerprint != spec.fingerprint() {
                    return Err(Error::Conflict(format!(
                        "idempotency key '{key}' reused with a different spec"
                    )));
                }
                if let Some(existing) = inner.records.get(entry.task_id.as_str()) {
                    return Ok(existing.clone());
                }
                // Record already purged; fall through and mint a new task.
            }
        }

        if self.config.queue_max_size > 0 && inner.queue.len() >= self.config.queue_max_size {
            return Err(Error::ResourceExhausted(format!(
                "dispatch queue full ({} entries)",
                inner.queue.len()
            )));
        }

        let fingerprint = spec.fingerprint();
        let task = Task::from_spec(TaskId::generate(), spec);
        let key = QueueKey {
            priority: Reverse(task.priority),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };

        if let Some(idem) = &task.idempotency_key {
            inner.idempotency.insert(
                idem.clone(),
                IdempotencyEntry {
                    task_id: task.id.clone(),
                    fingerprint,
                    expires_at: now + self.config.idempotency_ttl.as_millis() as u64,
                },
            );
        }
        inner.queue.insert(key, task.id.clone());
        inner.queued.insert(task.id.0.clone(), key);
        inner.records.insert(task.id.0.clone(), task.clone());
        drop(inner);

        self.publish(&task);
        self.notify.notify_one();
        tracing::debug!(task_id = %task.id, priority = task.priority, "task enqueued");
        Ok(task)
    }

    /// Atomically remove and return the next eligible task, already marked
    /// Processing. Two concurrent claimers can never receive the same task.
    pub fn try_claim(&self) -> Option<Task> {
        let mut inner = self.lock();
        loop {
            let (_, task_id) = inner.queue.pop_first()?;
            inner.queued.remove(task_id.as_str());
            if let Some(record) = inner.records.get_mut(task_id.as_str()) {
                // Pending -> Processing cannot fail for a queued entry.
                if record.transition(TaskStatus::Processing).is_ok() {
                    let task = record.clone();
                    drop(inner);
                    self.publish(&task);
                    return Some(task);
                }
            }
            // Stale entry (record gone or already terminal): skip it.
        }
    }

    /// Wait until [`TaskStore::create`] enqueues new work. The orchestrator
    /// pairs this with a poll-interval fallback.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Fetch a task by id.
    pub fn get(&self, id: &TaskId) -> Result<Task> {
        let mut inner = self.lock();
        self.purge_expired_locked(&mut inner, now_ms());
        inner
            .records
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// Cancel a task.
    ///
    /// Pending: the queue entry is removed and the task terminally fails with
    /// code `cancelled`, all in one step, so it will never be claimed.
    /// Processing: only the cooperative flag is set; in-flight work is not
    /// interrupted. Terminal: [`Error::Conflict`].
    pub fn cancel(&self, id: &TaskId) -> Result<CancelOutcome> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        match record.status {
            TaskStatus::Pending => {
                record.error = Some(TaskError::cancelled());
                record.transition(TaskStatus::Failed)?;
                let task = record.clone();
                if let Some(key) = inner.queued.remove(id.as_str()) {
                    inner.queue.remove(&key);
                }
                drop(inner);
                self.publish(&task);
                tracing::info!(task_id = %id, "pending task cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Processing => {
                record.cancel_requested = true;
                tracing::info!(task_id = %id, "cancellation requested for in-flight task");
                Ok(CancelOutcome::CancelRequested)
            }
            TaskStatus::Completed | TaskStatus::Failed => Err(Error::Conflict(format!(
                "task {id} is already {}",
                record.status
            ))),
        }
    }

    /// Whether cooperative cancellation was requested for a task.
    #[must_use]
    pub fn cancel_requested(&self, id: &TaskId) -> bool {
        self.lock()
            .records
            .get(id.as_str())
            .is_some_and(|t| t.cancel_requested)
    }

    /// Record the provider the orchestrator resolved for a claimed task.
    pub fn set_provider(&self, id: &TaskId, provider: &str) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        record.provider = Some(provider.to_string());
        record.updated_at = now_ms();
        Ok(())
    }

    /// Bump the attempt counter for a claimed task.
    pub fn note_attempt(&self, id: &TaskId) -> Result<u32> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        record.attempts += 1;
        record.updated_at = now_ms();
        Ok(record.attempts)
    }

    /// Terminal write: Processing -> Completed with the generation result.
    pub fn complete(&self, id: &TaskId, result: GenerationResult) -> Result<Task> {
        self.finish(id, TaskStatus::Completed, Some(result), None)
    }

    /// Terminal write: -> Failed with a typed error description.
    pub fn fail(&self, id: &TaskId, error: TaskError) -> Result<Task> {
        self.finish(id, TaskStatus::Failed, None, Some(error))
    }

    fn finish(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<GenerationResult>,
        error: Option<TaskError>,
    ) -> Result<Task> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        // Validate before writing: a rejected transition must leave the
        // record exactly as it was.
        record.transition(status)?;
        record.result = result;
        record.error = error;
        let task = record.clone();
        drop(inner);
        self.publish(&task);
        Ok(task)
    }

    /// Number of entries waiting in the dispatch queue
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot of store counters for the monitoring boundary.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            queue_size: inner.queue.len(),
            processing: inner
                .records
                .values()
                .filter(|t| t.status == TaskStatus::Processing)
                .count(),
            total_records: inner.records.len(),
            idempotency_entries: inner.idempotency.len(),
        }
    }

    /// Drop expired terminal tasks and stale idempotency mappings. The
    /// daemon runs this on an interval; creation and reads also purge
    /// opportunistically.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        self.purge_expired_locked(&mut inner, now_ms())
    }

    fn purge_expired_locked(&self, inner: &mut StoreInner, now: u64) -> usize {
        let task_ttl_ms = self.config.task_ttl.as_millis() as u64;

        // Only terminal tasks age out, and only once the TTL has elapsed
        // since they finished. In-flight tasks survive regardless of age.
        let expired: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, t)| {
                t.status.is_terminal()
                    && t.finished_at
                        .is_some_and(|finished| finished.saturating_add(task_ttl_ms) <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.records.remove(id);
        }

        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, entry| {
            entry.expires_at > now && !expired.contains(&entry.task_id.0)
        });

        let purged = expired.len() + (before - inner.idempotency.len());
        if purged > 0 {
            tracing::debug!(purged, "expired store entries purged");
        }
        purged
    }
}

/// Store counters exposed to the monitoring boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Entries waiting for dispatch
    pub queue_size: usize,
    /// Tasks currently marked Processing
    pub processing: usize,
    /// Retained task records (all statuses)
    pub total_records: usize,
    /// Live idempotency mappings
    pub idempotency_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(StoreConfig::default())
    }

    fn spec(model: &str, priority: i32) -> TaskSpec {
        TaskSpec::new(model, "prompt").with_priority(priority)
    }

    #[test]
    fn test_priority_dominates_enqueue_order() {
        let store = store();
        let low = store.create(spec("m", 0)).unwrap();
        let high = store.create(spec("m", 10)).unwrap();

        assert_eq!(store.try_claim().unwrap().id, high.id);
        assert_eq!(store.try_claim().unwrap().id, low.id);
        assert!(store.try_claim().is_none());
    }

    #[test]
    fn test_fifo_within_equal_priority() {
        let store = store();
        let first = store.create(spec("m", 5)).unwrap();
        let second = store.create(spec("m", 5)).unwrap();

        assert_eq!(store.try_claim().unwrap().id, first.id);
        assert_eq!(store.try_claim().unwrap().id, second.id);
    }

    #[test]
    fn test_claim_marks_processing() {
        let store = store();
        store.create(spec("m", 0)).unwrap();
        let claimed = store.try_claim().unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(store.get(&claimed.id).unwrap().status, TaskStatus::Processing);
    }

    #[test]
    fn test_idempotent_create_returns_same_task() {
        let store = store();
        let a = store
            .create(spec("m", 0).with_idempotency_key("k1"))
            .unwrap();
        let b = store
            .create(spec("m", 0).with_idempotency_key("k1"))
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(store.queue_size(), 1);
        assert_eq!(store.stats().total_records, 1);
    }

    #[test]
    fn test_idempotency_key_with_different_spec_conflicts() {
        let store = store();
        store
            .create(spec("m", 0).with_idempotency_key("k1"))
            .unwrap();
        let err = store
            .create(
                TaskSpec::new("m", "other prompt").with_idempotency_key("k1"),
            )
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn test_cancel_pending_removes_queue_entry() {
        let store = store();
        let task = store.create(spec("m", 0)).unwrap();

        assert_eq!(store.cancel(&task.id).unwrap(), CancelOutcome::Cancelled);
        assert!(store.try_claim().is_none());

        let record = store.get(&task.id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().code, "cancelled");
    }

    #[test]
    fn test_cancel_processing_is_cooperative() {
        let store = store();
        let task = store.create(spec("m", 0)).unwrap();
        store.try_claim().unwrap();

        assert_eq!(
            store.cancel(&task.id).unwrap(),
            CancelOutcome::CancelRequested
        );
        assert!(store.cancel_requested(&task.id));
        // Still processing: cancellation of in-flight work is advisory.
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Processing);
    }

    #[test]
    fn test_cancel_terminal_conflicts() {
        let store = store();
        let task = store.create(spec("m", 0)).unwrap();
        store.try_claim().unwrap();
        store.fail(&task.id, TaskError::cancelled()).unwrap();

        assert_eq!(store.cancel(&task.id).unwrap_err().code(), "conflict");
    }

    #[test]
    fn test_cancel_unknown_not_found() {
        let store = store();
        let err = store.cancel(&TaskId::new("task-missing")).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_rejected_terminal_write_leaves_record_intact() {
        let store = store();
        let task = store.create(spec("m", 0)).unwrap();
        store.try_claim().unwrap();
        store
            .complete(
                &task.id,
                GenerationResult {
                    text: "out".into(),
                    finish_reason: "stop".into(),
                    usage: Default::default(),
                    model: "m".into(),
                },
            )
            .unwrap();

        // Out-of-order terminal write is rejected without touching the record.
        let err = store.fail(&task.id, TaskError::cancelled()).unwrap_err();
        assert_eq!(err.code(), "internal_error");

        let record = store.get(&task.id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.unwrap().text, "out");
        assert!(record.error.is_none());
    }

    #[test]
    fn test_queue_capacity_bound() {
        let store = TaskStore::new(StoreConfig {
            queue_max_size: 2,
            ..StoreConfig::default()
        });
        store.create(spec("m", 0)).unwrap();
        store.create(spec("m", 0)).unwrap();
        let err = store.create(spec("m", 0)).unwrap_err();
        assert_eq!(err.code(), "resource_exhausted");
    }

    #[test]
    fn test_idempotency_mapping_expires() {
        let store = TaskStore::new(StoreConfig {
            idempotency_ttl: Duration::from_millis(10),
            ..StoreConfig::default()
        });
        let a = store
            .create(spec("m", 0).with_idempotency_key("k1"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(25));
        let b = store
            .create(spec("m", 0).with_idempotency_key("k1"))
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_terminal_tasks_purge_after_ttl_and_active_survive() {
        let store = TaskStore::new(StoreConfig {
            task_ttl: Duration::from_millis(10),
            ..StoreConfig::default()
        });
        let done = store.create(spec("m", 0)).unwrap();
        let inflight = store.create(spec("m", 0)).unwrap();
        assert_eq!(store.try_claim().unwrap().id, done.id);
        assert_eq!(store.try_claim().unwrap().id, inflight.id);
        store.fail(&done.id, TaskError::cancelled()).unwrap();

        std::thread::sleep(Duration::from_millis(25));
        store.purge_expired();

        assert_eq!(store.get(&done.id).unwrap_err().code(), "not_found");
        // Past TTL but still processing: never purged.
        assert_eq!(
            store.get(&inflight.id).unwrap().status,
            TaskStatus::Processing
        );
    }

    #[test]
    fn test_events_published_on_status_changes() {
        let store = store();
        let mut rx = store.subscribe();
        let task = store.create(spec("m", 0)).unwrap();
        store.try_claim().unwrap();
        store.fail(&task.id, TaskError::cancelled()).unwrap();

        assert_eq!(rx.try_recv().unwrap().status, TaskStatus::Pending);
        assert_eq!(rx.try_recv().unwrap().status, TaskStatus::Processing);
        assert_eq!(rx.try_recv().unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_wait_for_work_wakes_on_enqueue() {
        let store = std::sync::Arc::new(store());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store.wait_for_work().await;
                store.try_claim()
            })
        };
        tokio::task::yield_now().await;
        store.create(spec("m", 0)).unwrap();
        let claimed = waiter.await.unwrap();
        assert!(claimed.is_some());
    }
}
