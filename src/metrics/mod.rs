//! Prometheus metrics registration and export.
//!
//! All metrics live in a dedicated registry initialized once at startup.
//! The recording helpers are no-ops until [`init_metrics`] runs, so library
//! consumers and tests that never initialize metrics pay nothing.

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

use crate::job::{JobStatus, JobType};

/// Global Prometheus registry for all waveflow metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Current number of jobs, labeled by worker class and status.
pub static JOBS: OnceLock<GaugeVec> = OnceLock::new();

/// Total jobs handed to the dispatch queue, labeled by worker class.
pub static DISPATCHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total jobs marked failed after exhausting dispatch retries.
pub static DISPATCH_FAILED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total retry successor jobs created, labeled by worker class.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total running jobs failed by the heartbeat monitor as stale.
pub static STALE_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total jobs deleted by the cleanup sweeper, labeled by terminal status.
pub static CLEANUP_DELETED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total scaling actions applied, labeled by worker class and direction.
pub static SCALE_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Current replica count per worker class.
pub static REPLICAS: OnceLock<GaugeVec> = OnceLock::new();

/// Serializes initialization so concurrent callers cannot double-register.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initializes all metrics and registers them with the registry.
///
/// Call once at application startup; calling again is a no-op for metrics
/// that are already registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let registry = REGISTRY.get_or_init(Registry::new);

    if JOBS.get().is_none() {
        let jobs = GaugeVec::new(
            Opts::new("waveflow_jobs", "Current number of jobs"),
            &["class", "status"],
        )?;
        registry.register(Box::new(jobs.clone()))?;
        let _ = JOBS.set(jobs);
    }

    if DISPATCHED_TOTAL.get().is_none() {
        let dispatched = CounterVec::new(
            Opts::new(
                "waveflow_dispatched_total",
                "Jobs handed to the dispatch queue",
            ),
            &["class"],
        )?;
        registry.register(Box::new(dispatched.clone()))?;
        let _ = DISPATCHED_TOTAL.set(dispatched);
    }

    if DISPATCH_FAILED_TOTAL.get().is_none() {
        let dispatch_failed = CounterVec::new(
            Opts::new(
                "waveflow_dispatch_failed_total",
                "Jobs failed after exhausting dispatch retries",
            ),
            &["class"],
        )?;
        registry.register(Box::new(dispatch_failed.clone()))?;
        let _ = DISPATCH_FAILED_TOTAL.set(dispatch_failed);
    }

    if RETRIES_TOTAL.get().is_none() {
        let retries = CounterVec::new(
            Opts::new("waveflow_retries_total", "Retry successor jobs created"),
            &["class"],
        )?;
        registry.register(Box::new(retries.clone()))?;
        let _ = RETRIES_TOTAL.set(retries);
    }

    if STALE_TOTAL.get().is_none() {
        let stale = CounterVec::new(
            Opts::new("waveflow_stale_total", "Running jobs failed as stale"),
            &["class"],
        )?;
        registry.register(Box::new(stale.clone()))?;
        let _ = STALE_TOTAL.set(stale);
    }

    if CLEANUP_DELETED_TOTAL.get().is_none() {
        let cleanup = CounterVec::new(
            Opts::new(
                "waveflow_cleanup_deleted_total",
                "Jobs deleted by the sweeper",
            ),
            &["status"],
        )?;
        registry.register(Box::new(cleanup.clone()))?;
        let _ = CLEANUP_DELETED_TOTAL.set(cleanup);
    }

    if SCALE_EVENTS_TOTAL.get().is_none() {
        let scale_events = CounterVec::new(
            Opts::new("waveflow_scale_events_total", "Applied autoscaling actions"),
            &["class", "direction"],
        )?;
        registry.register(Box::new(scale_events.clone()))?;
        let _ = SCALE_EVENTS_TOTAL.set(scale_events);
    }

    if REPLICAS.get().is_none() {
        let replicas = GaugeVec::new(
            Opts::new("waveflow_replicas", "Current replica count per class"),
            &["class"],
        )?;
        registry.register(Box::new(replicas.clone()))?;
        let _ = REPLICAS.set(replicas);
    }

    Ok(())
}

/// Renders the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_dispatched(class: JobType) {
    if let Some(counter) = DISPATCHED_TOTAL.get() {
        counter.with_label_values(&[class.as_str()]).inc();
    }
}

pub fn record_dispatch_failed(class: JobType) {
    if let Some(counter) = DISPATCH_FAILED_TOTAL.get() {
        counter.with_label_values(&[class.as_str()]).inc();
    }
}

pub fn record_retry(class: JobType) {
    if let Some(counter) = RETRIES_TOTAL.get() {
        counter.with_label_values(&[class.as_str()]).inc();
    }
}

pub fn record_stale(class: JobType) {
    if let Some(counter) = STALE_TOTAL.get() {
        counter.with_label_values(&[class.as_str()]).inc();
    }
}

pub fn record_cleanup(status: JobStatus) {
    if let Some(counter) = CLEANUP_DELETED_TOTAL.get() {
        counter.with_label_values(&[status.as_str()]).inc();
    }
}

pub fn record_scale_event(class: JobType, direction: &str) {
    if let Some(counter) = SCALE_EVENTS_TOTAL.get() {
        counter
            .with_label_values(&[class.as_str(), direction])
            .inc();
    }
}

pub fn set_jobs_gauge(class: JobType, status: JobStatus, count: u64) {
    if let Some(gauge) = JOBS.get() {
        gauge
            .with_label_values(&[class.as_str(), status.as_str()])
            .set(count as f64);
    }
}

pub fn set_replicas_gauge(class: JobType, count: u32) {
    if let Some(gauge) = REPLICAS.get() {
        gauge.with_label_values(&[class.as_str()]).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        // Must not panic when the registry was never initialized. (Another
        // test in the same process may have initialized it already; either
        // way this must not blow up.)
        record_dispatched(JobType::Analysis);
        record_stale(JobType::Generation);
        set_jobs_gauge(JobType::Training, JobStatus::Pending, 3);
    }

    #[test]
    fn test_init_and_gather() {
        init_metrics().expect("init");
        record_dispatched(JobType::Analysis);
        record_scale_event(JobType::Analysis, "up");

        let text = gather_metrics();
        assert!(text.contains("waveflow_dispatched_total"));
        assert!(text.contains("waveflow_scale_events_total"));
    }

    #[test]
    fn test_init_is_reentrant() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
    }
}
