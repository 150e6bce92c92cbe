//! Logging, metrics and unbatched access detection.
//!
//! # Metrics Exposed
//!
//! - `lazybatch_batches_computed_total` - Batch units computed, by derivation
//! - `lazybatch_batch_failures_total` - Batch bodies that returned an error, by derivation
//! - `lazybatch_unbatched_resolutions_total` - Single-element fallbacks, by derivation
//! - `lazybatch_batch_size` - Elements per computed batch
//!
//! The crate only records; installing an exporter is up to the host.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{DetectionSettings, LoaderConfig, LoggingSettings};

/// Initialize the logging subsystem.
///
/// `RUST_LOG` takes precedence over the configured level. Later calls have
/// no effect once a global subscriber is set.
pub fn init_logging(settings: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.json {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_file(false)
                .with_line_number(false),
        );
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true));
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Describes the loader metrics to the installed recorder.
pub fn register_loader_metrics() {
    metrics::describe_counter!(
        "lazybatch_batches_computed_total",
        "Total number of batch units computed"
    );
    metrics::describe_counter!(
        "lazybatch_batch_failures_total",
        "Total number of batch computations that failed"
    );
    metrics::describe_counter!(
        "lazybatch_unbatched_resolutions_total",
        "Total number of derived attributes resolved through a single-element registry"
    );
    metrics::describe_histogram!("lazybatch_batch_size", "Number of elements per computed batch");
}

/// Applies `config` to the process-wide detection state.
pub fn configure(config: &LoaderConfig) {
    UnbatchedTracker::global().configure(&config.detection);
}

/// Counts single-element fallbacks per derivation.
///
/// Many fallbacks of one derivation usually mean a collection is read
/// without preloading.
#[derive(Debug)]
pub struct UnbatchedTracker {
    enabled: AtomicBool,
    threshold: AtomicU64,
    counts: DashMap<String, AtomicU64>,
}

static GLOBAL_TRACKER: OnceLock<UnbatchedTracker> = OnceLock::new();

impl UnbatchedTracker {
    pub fn new(settings: &DetectionSettings) -> Self {
        let tracker = Self {
            enabled: AtomicBool::new(false),
            threshold: AtomicU64::new(0),
            counts: DashMap::new(),
        };
        tracker.configure(settings);
        tracker
    }

    /// The tracker fed by every entity's fallback path.
    pub fn global() -> &'static UnbatchedTracker {
        GLOBAL_TRACKER.get_or_init(|| UnbatchedTracker::new(&DetectionSettings::default()))
    }

    pub fn configure(&self, settings: &DetectionSettings) {
        self.threshold.store(settings.threshold, Ordering::Relaxed);
        self.enabled.store(settings.warn_unbatched, Ordering::Relaxed);
    }

    /// Counts one fallback of `derivation`. Returns true when this call
    /// crossed the threshold and a warning was emitted.
    pub fn record(&self, derivation: &str) -> bool {
        let count = match self.counts.get(derivation) {
            Some(count) => count.fetch_add(1, Ordering::Relaxed) + 1,
            None => self
                .counts
                .entry(derivation.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed)
                + 1,
        };

        let threshold = self.threshold.load(Ordering::Relaxed);
        if !self.enabled.load(Ordering::Relaxed) || count != threshold {
            return false;
        }

        warn!(
            derivation,
            count, "derived attribute resolved one entity at a time; preload the collection"
        );
        true
    }

    pub fn count(&self, derivation: &str) -> u64 {
        self.counts
            .get(derivation)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.counts.clear();
    }
}

pub(crate) fn record_unbatched(derivation: &str) {
    metrics::counter!(
        "lazybatch_unbatched_resolutions_total",
        "derivation" => derivation.to_string()
    )
    .increment(1);
    UnbatchedTracker::global().record(derivation);
}
