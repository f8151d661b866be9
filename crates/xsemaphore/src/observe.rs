// Metric emission facade.
//
// The semaphore never talks to a metrics backend directly. Callers inject a
// `Meter`; the default `NoopMeter` drops everything. Instruments are created
// once per semaphore instance and reused on every operation.

use std::sync::Arc;

/// A metric label: static key, per-call value.
pub type Label<'a> = (&'static str, &'a str);

/// Monotonic counter.
pub trait Counter: Send + Sync {
    fn add(&self, value: u64, labels: &[Label<'_>]);
}

/// Distribution recorder with fixed bucket boundaries.
pub trait Histogram: Send + Sync {
    fn record(&self, value: f64, labels: &[Label<'_>]);
}

/// Instrument factory supplied by the embedding application.
pub trait Meter: Send + Sync {
    fn counter(&self, name: &'static str) -> Arc<dyn Counter>;
    fn histogram(&self, name: &'static str, boundaries: &'static [f64]) -> Arc<dyn Histogram>;
}

/// Meter that discards all measurements. The default when none is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeter;

struct NoopInstrument;

impl Counter for NoopInstrument {
    fn add(&self, _value: u64, _labels: &[Label<'_>]) {}
}

impl Histogram for NoopInstrument {
    fn record(&self, _value: f64, _labels: &[Label<'_>]) {}
}

impl Meter for NoopMeter {
    fn counter(&self, _name: &'static str) -> Arc<dyn Counter> {
        Arc::new(NoopInstrument)
    }

    fn histogram(&self, _name: &'static str, _boundaries: &'static [f64]) -> Arc<dyn Histogram> {
        Arc::new(NoopInstrument)
    }
}

// ── Instrument names and label keys ─────────────────────────────────

pub const ACQUIRE_TOTAL: &str = "xsemaphore.acquire.total";
pub const ACQUIRE_DURATION: &str = "xsemaphore.acquire.duration";
pub const RELEASE_TOTAL: &str = "xsemaphore.release.total";
pub const EXTEND_TOTAL: &str = "xsemaphore.extend.total";
pub const QUERY_TOTAL: &str = "xsemaphore.query.total";
pub const QUERY_DURATION: &str = "xsemaphore.query.duration";
pub const FALLBACK_TOTAL: &str = "xsemaphore.fallback.total";

pub const LABEL_SEM_TYPE: &str = "sem_type";
pub const LABEL_RESOURCE: &str = "resource";
pub const LABEL_ACQUIRED: &str = "acquired";
pub const LABEL_SUCCESS: &str = "success";
pub const LABEL_FAIL_REASON: &str = "fail_reason";
pub const LABEL_STRATEGY: &str = "strategy";

pub const SEM_TYPE_REDIS: &str = "redis";
pub const SEM_TYPE_LOCAL: &str = "local";
pub const SEM_TYPE_NOOP: &str = "noop";

/// Fail reasons for acquire attempts that found a full ledger.
pub const REASON_CAPACITY_FULL: &str = "capacity_full";
pub const REASON_TENANT_QUOTA: &str = "tenant_quota_exceeded";

/// Bucket boundaries for the operation duration histograms, in seconds.
pub const DURATION_BOUNDARIES: [f64; 9] =
    [0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

// ── Pre-built instruments ───────────────────────────────────────────

/// The instrument set one semaphore instance emits to.
#[derive(Clone)]
pub(crate) struct Instruments {
    pub acquire_total: Arc<dyn Counter>,
    pub acquire_duration: Arc<dyn Histogram>,
    pub release_total: Arc<dyn Counter>,
    pub extend_total: Arc<dyn Counter>,
    pub query_total: Arc<dyn Counter>,
    pub query_duration: Arc<dyn Histogram>,
    pub fallback_total: Arc<dyn Counter>,
    disable_resource_label: bool,
}

impl Instruments {
    pub fn new(meter: &dyn Meter, disable_resource_label: bool) -> Self {
        Self {
            acquire_total: meter.counter(ACQUIRE_TOTAL),
            acquire_duration: meter.histogram(ACQUIRE_DURATION, &DURATION_BOUNDARIES),
            release_total: meter.counter(RELEASE_TOTAL),
            extend_total: meter.counter(EXTEND_TOTAL),
            query_total: meter.counter(QUERY_TOTAL),
            query_duration: meter.histogram(QUERY_DURATION, &DURATION_BOUNDARIES),
            fallback_total: meter.counter(FALLBACK_TOTAL),
            disable_resource_label,
        }
    }

    pub fn noop() -> Self {
        Self::new(&NoopMeter, true)
    }

    /// Append the `resource` label unless the factory disabled it
    /// (high-cardinality safeguard).
    pub fn push_resource<'a>(&self, labels: &mut Vec<Label<'a>>, resource: &'a str) {
        if !self.disable_resource_label {
            labels.push((LABEL_RESOURCE, resource));
        }
    }

    pub(crate) fn record_acquire(
        &self,
        sem_type: &'static str,
        resource: &str,
        acquired: bool,
        fail_reason: Option<&str>,
        elapsed_secs: f64,
    ) {
        let mut labels: Vec<Label<'_>> =
            vec![(LABEL_SEM_TYPE, sem_type), (LABEL_ACQUIRED, bool_str(acquired))];
        if let Some(reason) = fail_reason {
            labels.push((LABEL_FAIL_REASON, reason));
        }
        self.push_resource(&mut labels, resource);
        self.acquire_total.add(1, &labels);
        self.acquire_duration.record(elapsed_secs, &labels);
    }

    pub(crate) fn record_release(&self, sem_type: &'static str, resource: &str) {
        let mut labels: Vec<Label<'_>> = vec![(LABEL_SEM_TYPE, sem_type)];
        self.push_resource(&mut labels, resource);
        self.release_total.add(1, &labels);
    }

    pub(crate) fn record_extend(&self, sem_type: &'static str, resource: &str, success: bool) {
        let mut labels: Vec<Label<'_>> =
            vec![(LABEL_SEM_TYPE, sem_type), (LABEL_SUCCESS, bool_str(success))];
        self.push_resource(&mut labels, resource);
        self.extend_total.add(1, &labels);
    }

    pub(crate) fn record_query(
        &self,
        sem_type: &'static str,
        resource: &str,
        success: bool,
        elapsed_secs: f64,
    ) {
        let mut labels: Vec<Label<'_>> =
            vec![(LABEL_SEM_TYPE, sem_type), (LABEL_SUCCESS, bool_str(success))];
        self.push_resource(&mut labels, resource);
        self.query_total.add(1, &labels);
        self.query_duration.record(elapsed_secs, &labels);
    }

    pub(crate) fn record_fallback(&self, strategy: &'static str, fail_reason: &str, resource: &str) {
        let mut labels: Vec<Label<'_>> =
            vec![(LABEL_STRATEGY, strategy), (LABEL_FAIL_REASON, fail_reason)];
        self.push_resource(&mut labels, resource);
        self.fallback_total.add(1, &labels);
    }
}

pub(crate) fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
