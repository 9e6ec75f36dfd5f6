//! Cross-thread execution profiling (diagnostic mode only)
//!
//! Enabled by the `CRUCIBLE_LUA_PROFILE` environment variable, whose
//! value is a semicolon-separated list of report sort keys (default
//! "time"). With the variable unset every public method returns before
//! touching any state: no sampler is created and no lock is taken.
//!
//! Each thread that runs plugin code gets its own sampler, armed by a
//! one-shot thread-start hook and parked in thread-local storage
//! together with a token; when the thread ends, TLS teardown drops the
//! token and folds the thread's samples into the process-wide report
//! under a dedicated lock. Sampling on one thread never blocks another.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::debug;

/// Process-constant diagnostic toggle; read once so every component
/// sees the same decision for the process lifetime
static ENV_TOGGLE: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("CRUCIBLE_LUA_PROFILE").ok());

/// Report sort key, selectable by name through the environment toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Cumulative wall time, descending
    Time,
    /// Call count, descending
    Calls,
    /// Operation name, ascending
    Name,
}

impl SortKey {
    fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "time" => Some(SortKey::Time),
            "calls" => Some(SortKey::Calls),
            "name" => Some(SortKey::Name),
            _ => None,
        }
    }
}

/// Per-operation statistics accumulated by one sampler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SampleStats {
    calls: u64,
    total: Duration,
}

/// Execution-time recorder for one thread
#[derive(Debug, Default)]
struct Sampler {
    enabled: bool,
    entries: HashMap<String, SampleStats>,
}

impl Sampler {
    fn armed() -> Self {
        Self {
            enabled: true,
            entries: HashMap::new(),
        }
    }

    fn record(&mut self, operation: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let stats = self.entries.entry(operation.to_string()).or_default();
        stats.calls += 1;
        stats.total += elapsed;
    }
}

/// One row of the printed report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub operation: String,
    pub calls: u64,
    pub total: Duration,
}

struct Inner {
    sort_keys: Vec<SortKey>,
    main_thread: ThreadId,
    main: Mutex<Sampler>,
    // Dedicated merge lock: merges arrive from thread teardown contexts
    // outside the interpreter's normal call sequencing.
    aggregate: Mutex<HashMap<String, SampleStats>>,
}

impl Inner {
    fn merge(&self, sampler: Sampler) {
        let mut aggregate = match self.aggregate.lock() {
            Ok(aggregate) => aggregate,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (operation, stats) in sampler.entries {
            let entry = aggregate.entry(operation).or_default();
            entry.calls += stats.calls;
            entry.total += stats.total;
        }
    }

    fn main_sampler(&self) -> MutexGuard<'_, Sampler> {
        match self.main.lock() {
            Ok(sampler) => sampler,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Token parked in TLS; dropping it (thread exit) merges the thread's
/// sampler into the aggregate. This replaces finalizer-timing-dependent
/// cleanup: worker threads expose no reliable exit callback, but TLS
/// teardown is guaranteed.
struct ThreadToken {
    owner: Weak<Inner>,
}

struct ThreadProfile {
    sampler: Sampler,
    token: ThreadToken,
}

impl Drop for ThreadProfile {
    // Runs during TLS teardown; must not touch other thread-locals.
    fn drop(&mut self) {
        if let Some(inner) = self.token.owner.upgrade() {
            inner.merge(std::mem::take(&mut self.sampler));
        }
    }
}

thread_local! {
    static THREAD_PROFILE: RefCell<Option<ThreadProfile>> = const { RefCell::new(None) };
}

/// Process-wide profile aggregator
pub struct Profiler {
    inner: Option<Arc<Inner>>,
}

impl Profiler {
    /// Read the `CRUCIBLE_LUA_PROFILE` toggle from the environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_toggle(ENV_TOGGLE.as_deref())
    }

    /// Build with an explicit toggle value; `None` disables profiling
    #[must_use]
    pub fn with_toggle(toggle: Option<&str>) -> Self {
        let Some(value) = toggle else {
            return Self { inner: None };
        };

        let mut sort_keys: Vec<SortKey> = value.split(';').filter_map(SortKey::parse).collect();
        if sort_keys.is_empty() {
            sort_keys.push(SortKey::Time);
        }

        Self {
            inner: Some(Arc::new(Inner {
                sort_keys,
                main_thread: std::thread::current().id(),
                main: Mutex::new(Sampler::armed()),
                aggregate: Mutex::new(HashMap::new()),
            })),
        }
    }

    /// True when the diagnostic toggle is present
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Thread-start hook: arm a sampler for the current thread.
    ///
    /// Called at every bridge entry; the first call on a given worker
    /// thread arms that thread's sampler and the hook disarms itself for
    /// the thread (later calls return immediately). The thread that
    /// created the profiler samples into the main sampler instead.
    pub fn on_thread_start(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        if std::thread::current().id() == inner.main_thread {
            return;
        }

        THREAD_PROFILE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return;
            }
            debug!("worker thread sampler armed");
            *slot = Some(ThreadProfile {
                sampler: Sampler::armed(),
                token: ThreadToken {
                    owner: Arc::downgrade(inner),
                },
            });
        });
    }

    /// Record one timed plugin operation on the current thread
    pub fn record(&self, operation: &str, elapsed: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };

        if std::thread::current().id() == inner.main_thread {
            inner.main_sampler().record(operation, elapsed);
            return;
        }

        THREAD_PROFILE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(profile) => profile.sampler.record(operation, elapsed),
                // Hook never fired on this thread; fold into the shared
                // report directly rather than losing the sample.
                None => {
                    let mut orphan = Sampler::armed();
                    orphan.record(operation, elapsed);
                    inner.merge(orphan);
                }
            }
        });
    }

    /// Merge the main sampler, print the sorted report, and start a
    /// fresh main sampler so later activity is not counted twice
    pub fn all_plugins_unloaded(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        let sampler = std::mem::replace(&mut *inner.main_sampler(), Sampler::armed());
        inner.merge(sampler);

        println!("{}", self.render_report().unwrap_or_default());
    }

    /// Stop the main sampler; pending worker merges still land
    pub fn exit(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.main_sampler().enabled = false;
    }

    /// Aggregate rows in the configured sort order; `None` when disabled
    #[must_use]
    pub fn report_rows(&self) -> Option<Vec<ReportRow>> {
        let inner = self.inner.as_ref()?;
        let aggregate = match inner.aggregate.lock() {
            Ok(aggregate) => aggregate,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut rows: Vec<ReportRow> = aggregate
            .iter()
            .map(|(operation, stats)| ReportRow {
                operation: operation.clone(),
                calls: stats.calls,
                total: stats.total,
            })
            .collect();

        rows.sort_by(|a, b| {
            for key in &inner.sort_keys {
                let ordering = match key {
                    SortKey::Time => b.total.cmp(&a.total),
                    SortKey::Calls => b.calls.cmp(&a.calls),
                    SortKey::Name => a.operation.cmp(&b.operation),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            a.operation.cmp(&b.operation)
        });
        Some(rows)
    }

    /// Total merged sample count across all finished threads
    #[must_use]
    pub fn merged_sample_count(&self) -> Option<u64> {
        let rows = self.report_rows()?;
        Some(rows.iter().map(|row| row.calls).sum())
    }

    fn render_report(&self) -> Option<String> {
        let rows = self.report_rows()?;
        let mut out = String::from("plugin profile (calls, cumulative time, operation):\n");
        for row in rows {
            out.push_str(&format!(
                "  {:>8}  {:>12.6}s  {}\n",
                row.calls,
                row.total.as_secs_f64(),
                row.operation
            ));
        }
        Some(out)
    }
}
