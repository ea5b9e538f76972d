//! Accelerator Guard
//!
//! Exclusive access to the single physical accelerator, plus a read-only
//! resource monitor. Exactly one orchestrator consumer runs per accelerator
//! (a deployment invariant; residency state is process-local), but the
//! guard's exclusion is a true mutex and stays correct for any number of
//! logical callers inside one process.
//!
//! The guard is an explicitly constructed, injected handle rather than
//! ambient global state, so tests can swap in a fake monitor and drive the
//! lease directly.
//!
//! # Hot path
//!
//! The guard remembers which model is resident on the device. Acquiring for
//! the already-resident model succeeds without a reload
//! (`DeviceLease::reload_required` is false) while remaining exclusive for
//! the generation itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::task::{now_ms, TaskId};

/// Admission tuning for the accelerator, from gateway configuration.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Accelerator index (informational, surfaces in stats/logs)
    pub device_index: u32,
    /// Hard ceiling on memory usage, percent of total
    pub max_usage_percent: u8,
    /// Memory held back from admission decisions, MB
    pub reserve_mb: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            max_usage_percent: 95,
            reserve_mb: 1024,
        }
    }
}

/// Point-in-time accelerator readings.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct DeviceStats {
    /// Total device memory, MB
    pub total_mb: u64,
    /// Memory in use, MB
    pub used_mb: u64,
    /// Free memory, MB
    pub free_mb: u64,
    /// Used memory as a percentage of total
    pub used_percent: f64,
    /// Core temperature in Celsius, if the device reports one
    pub temperature_c: Option<u32>,
}

/// Read-only probe of the accelerator. Injected into the guard so hardware
/// bindings stay an adapter concern and tests can fake readings.
pub trait ResourceMonitor: Send + Sync {
    /// Current memory usage and temperature. Non-blocking; safe to call
    /// while a lease is held.
    fn probe(&self) -> Result<DeviceStats>;
}

/// Monitor with a configured capacity and an externally tracked usage
/// figure. The default monitor for deployments without a hardware probe,
/// and the workhorse for tests.
pub struct FixedMonitor {
    total_mb: u64,
    used_mb: AtomicU64,
    temperature_c: Option<u32>,
}

impl FixedMonitor {
    /// Create a monitor for a device with `total_mb` of memory
    #[must_use]
    pub fn new(total_mb: u64) -> Self {
        Self {
            total_mb,
            used_mb: AtomicU64::new(0),
            temperature_c: None,
        }
    }

    /// Override the reported usage figure
    pub fn set_used(&self, used_mb: u64) {
        self.used_mb.store(used_mb, Ordering::SeqCst);
    }

    /// Override the reported temperature
    #[must_use]
    pub fn with_temperature(mut self, celsius: u32) -> Self {
        self.temperature_c = Some(celsius);
        self
    }
}

impl ResourceMonitor for FixedMonitor {
    fn probe(&self) -> Result<DeviceStats> {
        let used = self.used_mb.load(Ordering::SeqCst).min(self.total_mb);
        Ok(DeviceStats {
            total_mb: self.total_mb,
            used_mb: used,
            free_mb: self.total_mb - used,
            used_percent: if self.total_mb == 0 {
                0.0
            } else {
                used as f64 / self.total_mb as f64 * 100.0
            },
            temperature_c: self.temperature_c,
        })
    }
}

#[derive(Debug, Default)]
struct GuardState {
    holder: Option<TaskId>,
    resident_model: Option<String>,
    acquired_at: Option<u64>,
}

#[derive(Debug)]
struct GuardShared {
    lock: Arc<Mutex<()>>,
    state: StdMutex<GuardState>,
}

impl GuardShared {
    fn state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive-access token for the accelerator. At most one exists at any
/// instant. Dropping the lease releases the device on success and failure
/// paths alike, so release cannot be forgotten or doubled.
#[derive(Debug)]
pub struct DeviceLease {
    _permit: OwnedMutexGuard<()>,
    shared: Arc<GuardShared>,
    holder: TaskId,
    acquired_at: u64,
    reload_required: bool,
}

impl DeviceLease {
    /// Task holding the lease
    #[must_use]
    pub fn holder(&self) -> &TaskId {
        &self.holder
    }

    /// When the lease was granted (unix ms)
    #[must_use]
    pub fn acquired_at(&self) -> u64 {
        self.acquired_at
    }

    /// Whether the requested model was not resident at acquisition time and
    /// must be (re)loaded before generating
    #[must_use]
    pub fn reload_required(&self) -> bool {
        self.reload_required
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        state.holder = None;
        state.acquired_at = None;
        tracing::debug!(task_id = %self.holder, "accelerator lease released");
    }
}

/// Serializes access to the accelerator and answers admission questions.
pub struct DeviceGuard {
    config: DeviceConfig,
    monitor: Arc<dyn ResourceMonitor>,
    shared: Arc<GuardShared>,
}

impl DeviceGuard {
    /// Create a guard over the device described by `monitor`
    #[must_use]
    pub fn new(config: DeviceConfig, monitor: Arc<dyn ResourceMonitor>) -> Self {
        Self {
            config,
            monitor,
            shared: Arc::new(GuardShared {
                lock: Arc::new(Mutex::new(())),
                state: StdMutex::new(GuardState::default()),
            }),
        }
    }

    /// Block until the device is free or `wait_timeout` elapses.
    ///
    /// Returns [`Error::DeviceBusy`] on timeout. Acquisition while the same
    /// model is resident is the hot path: it still takes the lock but the
    /// lease reports that no reload is needed.
    pub async fn acquire(
        &self,
        task_id: &TaskId,
        model: &str,
        wait_timeout: Duration,
    ) -> Result<DeviceLease> {
        let permit = tokio::time::timeout(wait_timeout, self.shared.lock.clone().lock_owned())
            .await
            .map_err(|_| {
                let holder = self
                    .shared
                    .state()
                    .holder
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string);
                tracing::warn!(task_id = %task_id, %holder, "accelerator wait timed out");
                Error::DeviceBusy { holder }
            })?;

        let now = now_ms();
        let mut state = self.shared.state();
        let reload_required = state.resident_model.as_deref() != Some(model);
        state.holder = Some(task_id.clone());
        state.resident_model = Some(model.to_string());
        state.acquired_at = Some(now);
        drop(state);

        tracing::debug!(
            task_id = %task_id,
            model,
            reload_required,
            "accelerator lease acquired"
        );
        Ok(DeviceLease {
            _permit: permit,
            shared: Arc::clone(&self.shared),
            holder: task_id.clone(),
            acquired_at: now,
            reload_required,
        })
    }

    /// Current memory usage and temperature. Read-only, never blocks on the
    /// lease.
    pub fn probe(&self) -> Result<DeviceStats> {
        self.monitor
            .probe()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))
    }

    /// Whether a new load of `estimated_mb` fits under the usage ceiling
    /// minus the reserved margin. Denial is a hard stop: the engine never
    /// auto-evicts or falls back.
    pub fn can_admit(&self, estimated_mb: u64) -> Result<bool> {
        let stats = self.probe()?;
        let ceiling_mb = stats.total_mb * u64::from(self.config.max_usage_percent) / 100;
        let headroom = ceiling_mb
            .saturating_sub(stats.used_mb)
            .saturating_sub(self.config.reserve_mb);
        Ok(headroom >= estimated_mb)
    }

    /// Task currently holding the lease, if any
    #[must_use]
    pub fn holder(&self) -> Option<TaskId> {
        self.shared.state().holder.clone()
    }

    /// Whether a lease is outstanding
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.shared.state().holder.is_some()
    }

    /// Model currently resident on the device, if any
    #[must_use]
    pub fn resident_model(&self) -> Option<String> {
        self.shared.state().resident_model.clone()
    }

    /// Accelerator index from configuration
    #[must_use]
    pub fn device_index(&self) -> u32 {
        self.config.device_index
    }
}
