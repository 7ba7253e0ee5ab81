//! Hierarchical time and memory instrumentation.
//!
//! A [`Monitor`] accumulates wall-clock time and, optionally, resident
//! memory deltas for one named operation. Monitors created with
//! [`Monitor::child`] are registered with their parent, so a single
//! [`Monitor::get_data`] or [`Monitor::flush`] collects the whole tree.
//!
//! ```
//! use taskfarm::monitor::Monitor;
//!
//! let mon = Monitor::new("total");
//! let read = mon.child("read");
//! read.time(|| std::thread::sleep(std::time::Duration::from_millis(1)));
//! assert_eq!(read.count(), 1);
//! assert_eq!(mon.get_data().len(), 1);
//! ```
//!
//! A monitor is meant to be driven by one thread; only the store behind it
//! is shared.

use crate::error::{FarmError, Result};
use crate::memory::own_rss_bytes;
use crate::paths::scratch_path_for;
use crate::store::{PerfRecord, PerfStore, ScratchStore, TaskInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

const MB: f64 = 1024.0 * 1024.0;

fn default_weight() -> f32 {
    1.0
}

/// Settings shared by a monitor and the children it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub operation: String,
    /// Record resident memory deltas.
    #[serde(default)]
    pub measuremem: bool,
    /// Entered once per loop iteration; memory is never measured.
    #[serde(default)]
    pub inner_loop: bool,
    /// Flush to `store_path` on every exit.
    #[serde(default)]
    pub autoflush: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// Defaults to the scratch file next to `store_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_path: Option<PathBuf>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_no: Option<u32>,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl MonitorConfig {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            measuremem: false,
            inner_loop: false,
            autoflush: false,
            store_path: None,
            scratch_path: None,
            version: crate::version::full_version().to_string(),
            hostname: crate::paths::hostname(),
            task_no: None,
            weight: 1.0,
        }
    }
}

/// Running totals of a monitor. Times are seconds, memory is MB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub duration: f64,
    pub last_duration: f64,
    pub mem_total: f64,
    pub count: u64,
}

#[derive(Default)]
struct MonitorState {
    counters: Counters,
    /// Start time and baseline RSS of the open region.
    started: Option<(Instant, Option<u64>)>,
    error: Option<String>,
    children: Vec<Monitor>,
    /// Records of children that were serialized away from their monitors.
    pending: Vec<PerfRecord>,
}

/// Time and memory accounting for a named operation.
#[derive(Serialize, Deserialize)]
#[serde(into = "MonitorSnapshot", from = "MonitorSnapshot")]
pub struct Monitor {
    config: MonitorConfig,
    state: Arc<Mutex<MonitorState>>,
}

/// Open enter/exit region; records on drop, including during unwinding.
#[must_use = "the region ends when the guard is dropped"]
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
    active: bool,
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.monitor.stop(std::thread::panicking());
        }
    }
}

impl Monitor {
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_config(MonitorConfig::new(operation))
    }

    pub fn with_config(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    pub fn with_measuremem(mut self, measuremem: bool) -> Self {
        self.config.measuremem = measuremem;
        self
    }

    pub fn with_inner_loop(mut self, inner_loop: bool) -> Self {
        self.config.inner_loop = inner_loop;
        self
    }

    /// Write to `path` on [`flush_to_store`](Self::flush_to_store) and on
    /// every exit.
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self.config.autoflush = true;
        self
    }

    pub fn with_scratch(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_path = Some(path.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle to the same counters.
    fn share(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }

    fn tracks_memory(&self) -> bool {
        self.config.measuremem && !self.config.inner_loop
    }

    fn sample_memory(&self) -> Option<u64> {
        if self.tracks_memory() {
            own_rss_bytes()
        } else {
            None
        }
    }

    /// Open a timed region. A second, nested enter is ignored.
    pub fn enter(&self) -> MonitorGuard<'_> {
        MonitorGuard {
            monitor: self,
            active: self.start(),
        }
    }

    fn start(&self) -> bool {
        let baseline = self.sample_memory();
        let mut state = self.lock();
        if state.started.is_some() {
            tracing::debug!(operation = %self.config.operation, "monitor already entered");
            return false;
        }
        state.started = Some((Instant::now(), baseline));
        true
    }

    fn stop(&self, panicked: bool) {
        let after = self.sample_memory();
        {
            let mut state = self.lock();
            let Some((started, before)) = state.started.take() else {
                return;
            };
            let elapsed = started.elapsed().as_secs_f64();
            let counters = &mut state.counters;
            counters.duration += elapsed;
            counters.last_duration = elapsed;
            counters.count += 1;
            if let (Some(before), Some(after)) = (before, after) {
                counters.mem_total += (after as f64 - before as f64) / MB;
            }
            if panicked {
                state.error.get_or_insert_with(|| "panicked".to_string());
            }
        }
        if self.config.autoflush
            && let Err(e) = self.flush_to_store()
        {
            tracing::warn!(operation = %self.config.operation, error = %e, "autoflush failed");
        }
    }

    /// Close an open region without counting it.
    fn abandon(&self) {
        self.lock().started = None;
    }

    /// Run `f` as one region, remembering an `Err` without swallowing it.
    pub fn measure<T, E: fmt::Display>(
        &self,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let guard = self.enter();
        let out = f();
        if let Err(e) = &out {
            self.record_error(e.to_string());
        }
        drop(guard);
        out
    }

    /// Run `f` as one region.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.lock().error = Some(message.into());
    }

    /// A registered child with this configuration and fresh counters.
    pub fn child(&self, operation: impl Into<String>) -> Monitor {
        self.child_with(operation, |_| {})
    }

    /// Like [`child`](Self::child), with configuration overrides.
    pub fn child_with(
        &self,
        operation: impl Into<String>,
        configure: impl FnOnce(&mut MonitorConfig),
    ) -> Monitor {
        let mut config = self.config.clone();
        config.operation = operation.into();
        configure(&mut config);
        let child = Monitor::with_config(config);
        self.lock().children.push(child.share());
        child
    }

    /// Monitor carried by a single task; not registered with `self`.
    pub fn task_monitor(&self, operation: impl Into<String>, task_no: u32, weight: f32) -> Monitor {
        let mut config = self.config.clone();
        config.operation = operation.into();
        config.task_no = Some(task_no);
        config.weight = weight;
        config.autoflush = false;
        Monitor::with_config(config)
    }

    fn own_record(&self, counters: &Counters) -> Option<PerfRecord> {
        if counters.count == 0 {
            return None;
        }
        Some(PerfRecord {
            operation: self.config.operation.clone(),
            time_sec: counters.duration,
            memory_mb: counters.mem_total / counters.count as f64,
            counts: counters.count as i64,
            task_no: self.task_slot(),
        })
    }

    /// Task number as stored in the performance data, -1 outside tasks.
    fn task_slot(&self) -> i16 {
        self.config
            .task_no
            .and_then(|n| i16::try_from(n).ok())
            .unwrap_or(-1)
    }

    fn collect(&self, reset_children: bool) -> Vec<PerfRecord> {
        let (mut records, children) = {
            let mut state = self.lock();
            let mut records: Vec<PerfRecord> = self.own_record(&state.counters).into_iter().collect();
            if reset_children {
                records.append(&mut state.pending);
            } else {
                records.extend(state.pending.iter().cloned());
            }
            let children: Vec<Monitor> = state.children.iter().map(Monitor::share).collect();
            (records, children)
        };
        for child in children {
            records.extend(child.collect(reset_children));
            if reset_children {
                child.reset();
            }
        }
        records
    }

    /// One record per used monitor in this subtree; children are reset.
    pub fn get_data(&self) -> Vec<PerfRecord> {
        self.collect(true)
    }

    /// Append [`get_data`](Self::get_data) to `store` and reset.
    pub fn flush(&self, store: &PerfStore) -> Result<usize> {
        let records = self.get_data();
        let written = store.append_perf(&records)?;
        self.reset();
        Ok(written)
    }

    /// Flush to the configured store, if any.
    pub fn flush_to_store(&self) -> Result<usize> {
        match &self.config.store_path {
            Some(path) => self.flush(&PerfStore::open(path)?),
            None => Ok(0),
        }
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.counters = Counters::default();
        state.error = None;
    }

    /// Log the accumulated time per operation, slowest first.
    ///
    /// Includes what was already flushed to the configured store.
    pub fn log_data(&self) -> Vec<(String, f64)> {
        let mut totals: HashMap<String, f64> = HashMap::new();
        if let Some(path) = &self.config.store_path
            && path.exists()
        {
            match PerfStore::open_readonly(path).and_then(|store| store.performance_view()) {
                Ok(view) => {
                    for row in view {
                        *totals.entry(row.operation).or_default() += row.time_sec;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cannot read performance store"),
            }
        }
        for record in self.collect(false) {
            *totals.entry(record.operation).or_default() += record.time_sec;
        }

        let mut rows: Vec<(String, f64)> = totals.into_iter().collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (operation, secs) in &rows {
            tracing::info!(operation = %operation, time_sec = secs, "{} {:.3}s", operation, secs);
        }
        rows
    }

    /// Time every element production of `iter` as one region.
    ///
    /// `on_exhausted` runs once, after the last element.
    pub fn wrap_iter<I, F>(&self, iter: I, on_exhausted: F) -> MonitoredIter<I::IntoIter, F>
    where
        I: IntoIterator,
        F: FnOnce(),
    {
        MonitoredIter {
            inner: iter.into_iter(),
            monitor: self.share(),
            on_exhausted: Some(on_exhausted),
        }
    }

    fn scratch_path(&self) -> Result<PathBuf> {
        self.config
            .scratch_path
            .clone()
            .or_else(|| self.config.store_path.as_ref().map(scratch_path_for))
            .ok_or_else(|| FarmError::NoScratch(self.config.operation.clone()))
    }

    /// Stage `value` under `key`. Returns false if the key already exists,
    /// in which case the stored value is left untouched.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        let mut scratch = ScratchStore::open(self.scratch_path()?)?;
        let saved = scratch.save(key, &value)?;
        if !saved {
            tracing::debug!(key, "scratch key exists, keeping the first value");
        }
        Ok(saved)
    }

    /// Read back a slice of an array saved under `key`, or the whole value
    /// if it is not an array.
    pub fn read<T: DeserializeOwned, R: RangeBounds<usize>>(&self, key: &str, range: R) -> Result<T> {
        let scratch = ScratchStore::open(self.scratch_path()?)?;
        Ok(serde_json::from_value(scratch.read(key, range)?)?)
    }

    /// Append one task_info row describing the task this monitor timed.
    pub fn save_task_info(
        &self,
        store: &PerfStore,
        taskname: &str,
        received: usize,
        mem_gb: f32,
    ) -> Result<()> {
        let info = TaskInfo {
            taskname: taskname.to_string(),
            task_no: self.config.task_no.unwrap_or(0),
            weight: self.config.weight,
            duration: self.duration() as f32,
            received: received as i64,
            mem_gb,
        };
        store.append_task_info(&[info])?;
        Ok(())
    }

    pub fn operation(&self) -> &str {
        &self.config.operation
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn task_no(&self) -> Option<u32> {
        self.config.task_no
    }

    pub fn weight(&self) -> f32 {
        self.config.weight
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn count(&self) -> u64 {
        self.counters().count
    }

    /// Cumulative seconds over all regions.
    pub fn duration(&self) -> f64 {
        self.counters().duration
    }

    /// Seconds spent in the most recent region.
    pub fn last_duration(&self) -> f64 {
        self.counters().last_duration
    }

    /// Mean memory delta per region, in MB.
    pub fn mem(&self) -> f64 {
        let counters = self.counters();
        if counters.count == 0 {
            0.0
        } else {
            counters.mem_total / counters.count as f64
        }
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }
}

impl Clone for Monitor {
    /// An independent copy; children's data is folded into the copy.
    fn clone(&self) -> Self {
        Monitor::from(MonitorSnapshot::from(self))
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters = self.counters();
        f.debug_struct("Monitor")
            .field("operation", &self.config.operation)
            .field("count", &counters.count)
            .field("duration", &counters.duration)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct MonitorSnapshot {
    #[serde(flatten)]
    config: MonitorConfig,
    #[serde(default)]
    counters: Counters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pending: Vec<PerfRecord>,
}

impl From<&Monitor> for MonitorSnapshot {
    fn from(monitor: &Monitor) -> Self {
        let (counters, error, mut pending, children) = {
            let state = monitor.lock();
            (
                state.counters,
                state.error.clone(),
                state.pending.clone(),
                state.children.iter().map(Monitor::share).collect::<Vec<_>>(),
            )
        };
        for child in children {
            pending.extend(child.collect(false));
        }
        Self {
            config: monitor.config.clone(),
            counters,
            error,
            pending,
        }
    }
}

impl From<Monitor> for MonitorSnapshot {
    fn from(monitor: Monitor) -> Self {
        Self::from(&monitor)
    }
}

impl From<MonitorSnapshot> for Monitor {
    fn from(snapshot: MonitorSnapshot) -> Self {
        let monitor = Monitor::with_config(snapshot.config);
        {
            let mut state = monitor.lock();
            state.counters = snapshot.counters;
            state.error = snapshot.error;
            state.pending = snapshot.pending;
        }
        monitor
    }
}

/// Iterator adapter returned by [`Monitor::wrap_iter`].
pub struct MonitoredIter<I, F> {
    inner: I,
    monitor: Monitor,
    on_exhausted: Option<F>,
}

impl<I: Iterator, F: FnOnce()> Iterator for MonitoredIter<I, F> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        let entered = self.monitor.start();
        let item = self.inner.next();
        if item.is_some() {
            if entered {
                self.monitor.stop(false);
            }
        } else {
            if entered {
                self.monitor.abandon();
            }
            if let Some(on_exhausted) = self.on_exhausted.take() {
                on_exhausted();
            }
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::time::Duration;
    use tempfile::tempdir;

    fn nap() {
        std::thread::sleep(Duration::from_millis(5));
    }

    #[test]
    fn test_counts_and_cumulative_duration() {
        let mon = Monitor::new("loop");
        assert!(mon.get_data().is_empty());
        for _ in 0..3 {
            mon.time(nap);
        }
        assert_eq!(mon.count(), 3);
        assert!(mon.duration() >= 0.015);
        assert!(mon.last_duration() >= 0.005);
        assert!(mon.last_duration() < mon.duration());

        let data = mon.get_data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].counts, 3);
        assert_eq!(data[0].task_no, -1);
    }

    #[test]
    fn test_nested_enter_is_ignored() {
        let mon = Monitor::new("outer");
        {
            let _a = mon.enter();
            let _b = mon.enter();
        }
        assert_eq!(mon.count(), 1);
    }

    #[test]
    fn test_child_rows() {
        let parent = Monitor::new("total");
        let unused = parent.child("unused");
        let used = parent.child("used");
        used.time(nap);

        let data = parent.get_data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].operation, "used");
        assert_eq!(data[0].memory_mb, 0.0);
        assert_eq!(unused.count(), 0);

        // children are reset by get_data
        assert_eq!(used.count(), 0);
        assert!(parent.get_data().is_empty());
    }

    #[test]
    fn test_child_with_overrides() {
        let parent = Monitor::new("total").with_measuremem(true);
        let child = parent.child_with("inner", |cfg| cfg.inner_loop = true);
        assert!(child.config().measuremem);
        assert!(child.config().inner_loop);
        assert!(!child.tracks_memory());
    }

    #[test]
    fn test_measure_records_error_and_counts() {
        let mon = Monitor::new("parse");
        let out: std::result::Result<(), String> = mon.measure(|| Err("bad input".to_string()));
        assert!(out.is_err());
        assert_eq!(mon.count(), 1);
        assert_eq!(mon.error().as_deref(), Some("bad input"));
        mon.reset();
        assert_eq!(mon.error(), None);
        assert_eq!(mon.count(), 0);
    }

    #[test]
    fn test_exit_recorded_when_region_panics() {
        let mon = Monitor::new("risky");
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = mon.enter();
            panic!("boom");
        }));
        assert!(caught.is_err());
        assert_eq!(mon.count(), 1);
        assert_eq!(mon.error().as_deref(), Some("panicked"));
    }

    #[test]
    fn test_task_slot_out_of_range() {
        let mon = Monitor::new("total");
        let task = mon.task_monitor("big", 40_000, 1.0);
        task.time(|| ());
        assert_eq!(task.get_data()[0].task_no, -1);
        let task = mon.task_monitor("small", 12, 1.0);
        task.time(|| ());
        assert_eq!(task.get_data()[0].task_no, 12);
        // task monitors are not registered
        assert!(mon.get_data().is_empty());
    }

    #[test]
    fn test_serialization_carries_counters_and_children() {
        let mon = Monitor::new("task");
        mon.time(|| ());
        let child = mon.child("step");
        child.time(|| ());
        child.time(|| ());

        let text = serde_json::to_string(&mon).unwrap();
        let back: Monitor = serde_json::from_str(&text).unwrap();
        assert_eq!(back.operation(), "task");
        assert_eq!(back.count(), 1);

        let data = back.get_data();
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].operation, "step");
        assert_eq!(data[1].counts, 2);
        // pending records are consumed
        assert_eq!(back.get_data().len(), 1);
    }

    #[test]
    fn test_wrap_iter() {
        let mon = Monitor::new("produce");
        let done = Cell::new(0);
        let items: Vec<i32> = mon
            .wrap_iter(vec![1, 2, 3], || done.set(done.get() + 1))
            .collect();
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(mon.count(), 3);
        assert_eq!(done.get(), 1);
    }

    #[test]
    fn test_flush_and_autoflush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perf.db");
        let store = PerfStore::open(&path).unwrap();

        let mon = Monitor::new("total");
        mon.child("a").time(|| ());
        mon.time(|| ());
        assert_eq!(mon.flush(&store).unwrap(), 2);
        assert_eq!(mon.count(), 0);
        assert_eq!(store.performance_data().unwrap().len(), 2);

        let auto = Monitor::new("auto").with_store(&path);
        auto.time(|| ());
        auto.time(|| ());
        assert_eq!(store.performance_data().unwrap().len(), 4);
        assert_eq!(auto.count(), 0);
    }

    #[test]
    fn test_log_data_sorted_descending() {
        let mon = Monitor::new("total");
        let slow = mon.child("slow");
        let fast = mon.child("fast");
        slow.time(|| std::thread::sleep(Duration::from_millis(20)));
        fast.time(|| ());
        let rows = mon.log_data();
        assert_eq!(rows[0].0, "slow");
        assert_eq!(rows[1].0, "fast");
        // logging does not consume the data
        assert_eq!(mon.get_data().len(), 2);
    }

    #[test]
    fn test_save_is_idempotent() {
        let dir = tempdir().unwrap();
        let mon = Monitor::new("total").with_scratch(dir.path().join("scratch.db"));
        assert!(mon.save("sites", &json!([10, 20, 30])).unwrap());
        assert!(!mon.save("sites", &json!([0])).unwrap());
        let all: Vec<i32> = mon.read("sites", ..).unwrap();
        assert_eq!(all, vec![10, 20, 30]);
        let tail: Vec<i32> = mon.read("sites", 1..).unwrap();
        assert_eq!(tail, vec![20, 30]);
    }

    #[test]
    fn test_save_without_scratch() {
        let mon = Monitor::new("total");
        assert!(matches!(mon.save("k", &1), Err(FarmError::NoScratch(_))));
    }

    #[test]
    fn test_save_task_info() {
        let dir = tempdir().unwrap();
        let store = PerfStore::open(dir.path().join("perf.db")).unwrap();
        let task = Monitor::new("total").task_monitor("classical", 3, 2.5);
        task.time(nap);
        task.save_task_info(&store, "classical", 128, 0.25).unwrap();
        let rows = store.task_info(Some("classical")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_no, 3);
        assert_eq!(rows[0].weight, 2.5);
        assert_eq!(rows[0].received, 128);
        assert!(rows[0].duration > 0.0);
    }
}
