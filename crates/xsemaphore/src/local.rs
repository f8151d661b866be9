// In-process semaphore: the fallback target, also usable stand-alone in
// single-process deployments.
//
// Layout: a concurrent outer map `resource → bucket`, each bucket guarding
// its global and per-tenant permit maps with one RwLock. Buckets are never
// removed once created — a reader holding a bucket that was unlinked from
// the outer map would write into a ledger nobody else can see — so empty
// buckets simply stay behind after their permits expire.
//
// Expired entries are swept on every write path and by a background sweeper;
// both use the same `expires_at <= now` cutoff as the remote scripts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::Error;
use crate::id::{IdGenerator, UuidGenerator};
use crate::observe::{
    Instruments, Meter, NoopMeter, REASON_CAPACITY_FULL, REASON_TENANT_QUOTA, SEM_TYPE_LOCAL,
};
use crate::permit::{expires_after, Permit, PermitBackend, PermitParams, PermitShared};
use crate::semaphore::{
    with_deadline, AcquireOptions, QueryOptions, QuotaUsage, ResourceInfo, Semaphore, TenantUsage,
};

/// Default wake interval for the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Construction options for [`LocalSemaphore`].
#[derive(Clone)]
pub struct LocalConfig {
    /// Number of cooperating processes the configured capacities are split
    /// across. Capacity and tenant quota scale as `max(1, value / pod_count)`.
    pub pod_count: u32,
    /// Background sweep interval.
    pub sweep_interval: Duration,
    /// Per-operation deadline applied when the caller brings none.
    pub default_timeout: Option<Duration>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub meter: Arc<dyn Meter>,
    /// Drop the `resource` metric label (high-cardinality safeguard).
    pub disable_resource_label: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            pod_count: 1,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_timeout: None,
            id_generator: Arc::new(UuidGenerator),
            meter: Arc::new(NoopMeter),
            disable_resource_label: false,
        }
    }
}

impl LocalConfig {
    pub fn with_pod_count(mut self, pod_count: u32) -> Self {
        self.pod_count = pod_count;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.pod_count == 0 {
            return Err(Error::InvalidPodCount);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BucketEntries {
    global: HashMap<String, LedgerEntry>,
    tenants: HashMap<String, HashMap<String, LedgerEntry>>,
}

#[derive(Debug, Default)]
struct ResourceBucket {
    entries: RwLock<BucketEntries>,
}

impl ResourceBucket {
    fn write(&self) -> RwLockWriteGuard<'_, BucketEntries> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct LocalInner {
    buckets: DashMap<String, Arc<ResourceBucket>>,
    pod_count: u32,
    default_timeout: Option<Duration>,
    closed: AtomicBool,
    id_generator: Arc<dyn IdGenerator>,
    instruments: Instruments,
}

/// Semaphore over an in-process ledger.
pub struct LocalSemaphore {
    inner: Arc<LocalInner>,
    stop_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSemaphore").finish_non_exhaustive()
    }
}

impl LocalSemaphore {
    pub fn new(config: LocalConfig) -> Result<Self, Error> {
        config.validate()?;

        let inner = Arc::new(LocalInner {
            buckets: DashMap::new(),
            pod_count: config.pod_count,
            default_timeout: config.default_timeout,
            closed: AtomicBool::new(false),
            id_generator: config.id_generator,
            instruments: Instruments::new(config.meter.as_ref(), config.disable_resource_label),
        });

        let (stop_tx, stop_rx) = broadcast::channel(1);
        // Interval periods must be non-zero; clamp rather than reject.
        let sweep_interval = config.sweep_interval.max(Duration::from_millis(1));
        let sweeper = tokio::spawn(sweeper_loop(Arc::clone(&inner), stop_rx, sweep_interval));

        Ok(Self { inner, stop_tx, sweeper: Mutex::new(Some(sweeper)) })
    }

    /// The capacity this instance actually enforces for a configured limit.
    ///
    /// `max(1, limit / pod_count)`: when the configured limit is smaller than
    /// the pod count, each pod still admits one holder.
    fn scaled(&self, limit: u32) -> u32 {
        scale_limit(limit, self.inner.pod_count)
    }

    async fn try_acquire_inner(
        &self,
        resource: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Permit>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::SemaphoreClosed);
        }
        opts.validate(resource)?;

        let started = Instant::now();
        let outcome = self.attempt(resource, opts);
        self.emit_acquire(resource, &outcome, started);

        match outcome {
            Attempt::Acquired(permit) => Ok(Some(permit)),
            Attempt::CapacityFull | Attempt::TenantQuotaExceeded => Ok(None),
            Attempt::Failed(err) => Err(err),
        }
    }

    /// One locked pass over the resource bucket: sweep, check, insert.
    fn attempt(&self, resource: &str, opts: &AcquireOptions) -> Attempt {
        // Allocate the id before taking the bucket lock; a slow generator
        // must not serialize every resource behind one allocation.
        let id = match self.inner.id_generator.generate() {
            Ok(id) => id,
            Err(err) => return Attempt::Failed(Error::IdGenerationFailed(err)),
        };

        let bucket = self.bucket(resource);
        let tenant = opts.effective_tenant().map(str::to_string);
        let now = Utc::now();
        let expires_at = expires_after(now, opts.ttl);

        {
            let mut entries = bucket.write();
            sweep_entries(&mut entries, now);

            if entries.global.len() >= self.scaled(opts.capacity) as usize {
                return Attempt::CapacityFull;
            }
            if let Some(tenant_id) = tenant.as_deref() {
                let held = entries.tenants.get(tenant_id).map_or(0, HashMap::len);
                if held >= self.scaled(opts.tenant_quota) as usize {
                    return Attempt::TenantQuotaExceeded;
                }
            }

            entries.global.insert(id.clone(), LedgerEntry { expires_at });
            if let Some(tenant_id) = tenant.clone() {
                entries
                    .tenants
                    .entry(tenant_id)
                    .or_default()
                    .insert(id.clone(), LedgerEntry { expires_at });
            }
        }

        let backend = Arc::new(LocalPermitBackend { inner: Arc::clone(&self.inner) });
        Attempt::Acquired(Permit::issue(
            PermitParams {
                id,
                resource: resource.to_string(),
                tenant_id: opts.tenant_id.clone().filter(|t| !t.is_empty()),
                ttl: opts.ttl,
                has_tenant_quota: tenant.is_some(),
                metadata: opts.metadata.clone(),
                expires_at,
            },
            backend,
            self.inner.instruments.clone(),
            SEM_TYPE_LOCAL,
        ))
    }

    fn bucket(&self, resource: &str) -> Arc<ResourceBucket> {
        if let Some(bucket) = self.inner.buckets.get(resource) {
            return Arc::clone(bucket.value());
        }
        Arc::clone(
            self.inner
                .buckets
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(ResourceBucket::default()))
                .value(),
        )
    }

    async fn acquire_inner(&self, resource: &str, opts: &AcquireOptions) -> Result<Permit, Error> {
        opts.validate_retry()?;
        for attempt in 1..=opts.max_retries {
            if let Some(permit) = self.try_acquire_inner(resource, opts).await? {
                return Ok(permit);
            }
            if attempt < opts.max_retries {
                tokio::time::sleep(opts.retry_delay).await;
            }
        }
        Err(Error::AcquireFailed { attempts: opts.max_retries })
    }

    async fn query_inner(
        &self,
        resource: &str,
        opts: &QueryOptions,
    ) -> Result<ResourceInfo, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::SemaphoreClosed);
        }
        opts.validate(resource)?;

        let started = Instant::now();
        let now = Utc::now();
        let capacity = self.scaled(opts.capacity);
        let tenant = opts.effective_tenant();

        let (global_used, tenant_used) = match self.inner.buckets.get(resource) {
            Some(bucket) => {
                let entries = match bucket.entries.read() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let global = count_live(&entries.global, now);
                let per_tenant = tenant
                    .and_then(|tenant_id| entries.tenants.get(tenant_id))
                    .map_or(0, |held| count_live(held, now));
                (global, per_tenant)
            }
            None => (0, 0),
        };

        let info = ResourceInfo {
            resource: resource.to_string(),
            global: QuotaUsage::new(capacity, global_used),
            tenant: tenant.map(|tenant_id| {
                TenantUsage::new(tenant_id, self.scaled(opts.tenant_quota), tenant_used)
            }),
        };

        self.emit_query(resource, true, started);
        Ok(info)
    }

    fn emit_acquire(&self, resource: &str, outcome: &Attempt, started: Instant) {
        let acquired = matches!(outcome, Attempt::Acquired(_));
        let reason = match outcome {
            Attempt::Acquired(_) => None,
            Attempt::CapacityFull => Some(REASON_CAPACITY_FULL),
            Attempt::TenantQuotaExceeded => Some(REASON_TENANT_QUOTA),
            Attempt::Failed(err) => Some(err.label().as_str()),
        };
        self.inner.instruments.record_acquire(
            SEM_TYPE_LOCAL,
            resource,
            acquired,
            reason,
            started.elapsed().as_secs_f64(),
        );
    }

    fn emit_query(&self, resource: &str, success: bool, started: Instant) {
        self.inner.instruments.record_query(
            SEM_TYPE_LOCAL,
            resource,
            success,
            started.elapsed().as_secs_f64(),
        );
    }
}

enum Attempt {
    Acquired(Permit),
    CapacityFull,
    TenantQuotaExceeded,
    Failed(Error),
}

#[async_trait]
impl Semaphore for LocalSemaphore {
    #[tracing::instrument(name = "semaphore.try_acquire", level = "debug", skip_all, fields(sem_type = "local", resource = %resource))]
    async fn try_acquire(
        &self,
        resource: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Permit>, Error> {
        with_deadline(self.inner.default_timeout, self.try_acquire_inner(resource, opts)).await
    }

    #[tracing::instrument(name = "semaphore.acquire", level = "debug", skip_all, fields(sem_type = "local", resource = %resource))]
    async fn acquire(&self, resource: &str, opts: &AcquireOptions) -> Result<Permit, Error> {
        with_deadline(self.inner.default_timeout, self.acquire_inner(resource, opts)).await
    }

    #[tracing::instrument(name = "semaphore.query", level = "debug", skip_all, fields(sem_type = "local", resource = %resource))]
    async fn query(&self, resource: &str, opts: &QueryOptions) -> Result<ResourceInfo, Error> {
        with_deadline(self.inner.default_timeout, self.query_inner(resource, opts)).await
    }

    async fn health(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::SemaphoreClosed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.stop_tx.send(());
        let sweeper = {
            let mut slot = match self.sweeper.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        Ok(())
    }
}

// ── Permit backend ──────────────────────────────────────────────────

struct LocalPermitBackend {
    inner: Arc<LocalInner>,
}

impl LocalPermitBackend {
    /// Look up an existing bucket. Buckets are only ever created by acquire,
    /// so a missing bucket means the permit cannot be held.
    fn bucket(&self, resource: &str) -> Option<Arc<ResourceBucket>> {
        self.inner.buckets.get(resource).map(|bucket| Arc::clone(bucket.value()))
    }
}

#[async_trait]
impl PermitBackend for LocalPermitBackend {
    async fn release(&self, permit: &PermitShared) -> Result<(), Error> {
        let Some(bucket) = self.bucket(&permit.resource) else {
            return Err(Error::PermitNotHeld);
        };

        let mut entries = bucket.write();
        let removed = entries.global.remove(&permit.id).is_some();
        if permit.has_tenant_quota {
            if let Some(tenant_id) = permit.tenant_id.as_deref() {
                if let Some(held) = entries.tenants.get_mut(tenant_id) {
                    held.remove(&permit.id);
                    if held.is_empty() {
                        entries.tenants.remove(tenant_id);
                    }
                }
            }
        }

        if removed {
            Ok(())
        } else {
            Err(Error::PermitNotHeld)
        }
    }

    async fn extend(
        &self,
        permit: &PermitShared,
        new_expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let Some(bucket) = self.bucket(&permit.resource) else {
            return Err(Error::PermitNotHeld);
        };

        let now = Utc::now();
        let mut entries = bucket.write();
        let live = entries
            .global
            .get(&permit.id)
            .is_some_and(|entry| entry.expires_at > now);

        if !live {
            // Remove any expired residue while we hold the lock.
            entries.global.remove(&permit.id);
            if let Some(tenant_id) = permit.tenant_id.as_deref() {
                if let Some(held) = entries.tenants.get_mut(tenant_id) {
                    held.remove(&permit.id);
                    if held.is_empty() {
                        entries.tenants.remove(tenant_id);
                    }
                }
            }
            return Err(Error::PermitNotHeld);
        }

        if let Some(entry) = entries.global.get_mut(&permit.id) {
            entry.expires_at = new_expires_at;
        }
        if permit.has_tenant_quota {
            if let Some(tenant_id) = permit.tenant_id.as_deref() {
                if let Some(entry) =
                    entries.tenants.get_mut(tenant_id).and_then(|held| held.get_mut(&permit.id))
                {
                    entry.expires_at = new_expires_at;
                }
            }
        }
        Ok(())
    }
}

// ── Sweeping ────────────────────────────────────────────────────────

fn scale_limit(limit: u32, pod_count: u32) -> u32 {
    (limit / pod_count.max(1)).max(1)
}

fn count_live(held: &HashMap<String, LedgerEntry>, now: DateTime<Utc>) -> u32 {
    held.values().filter(|entry| entry.expires_at > now).count() as u32
}

fn sweep_entries(entries: &mut BucketEntries, now: DateTime<Utc>) {
    entries.global.retain(|_, entry| entry.expires_at > now);
    entries.tenants.retain(|_, held| {
        held.retain(|_, entry| entry.expires_at > now);
        !held.is_empty()
    });
}

async fn sweeper_loop(
    inner: Arc<LocalInner>,
    mut stop_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => sweep_all(&inner),
        }
    }
    debug!("local semaphore sweeper stopped");
}

fn sweep_all(inner: &LocalInner) {
    let now = Utc::now();
    let buckets: Vec<Arc<ResourceBucket>> =
        inner.buckets.iter().map(|bucket| Arc::clone(bucket.value())).collect();
    for bucket in buckets {
        let mut entries = bucket.write();
        sweep_entries(&mut entries, now);
    }
}
