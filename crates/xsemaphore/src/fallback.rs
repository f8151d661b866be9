// Fallback wrapper: a remote semaphore with a degradation policy.
//
// Requests forward to the remote untouched. When a call fails with the
// store-unavailable classification, the wrapper applies its policy:
//   local — lazily build one in-process semaphore and serve from it
//   open  — hand out virtual permits (id prefix "noop-"), report everything
//           as available
//   close — surface the store error
// Each transition also emits a fallback counter, a structured event, and a
// rate-limited user callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Error;
use crate::id::{IdGenerator, UuidGenerator};
use crate::local::{LocalConfig, LocalSemaphore, DEFAULT_SWEEP_INTERVAL};
use crate::observe::{Instruments, Meter, NoopMeter, SEM_TYPE_NOOP};
use crate::permit::{expires_after, Permit, PermitBackend, PermitParams, PermitShared};
use crate::remote::RemoteSemaphore;
use crate::semaphore::{
    AcquireOptions, QueryOptions, QuotaUsage, ResourceInfo, Semaphore, TenantUsage,
};

/// Id prefix marking a virtual permit issued by the open policy.
pub const NOOP_ID_PREFIX: &str = "noop-";

/// Minimum spacing between `on_fallback` invocations.
const HOOK_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// What to do when the store classifies as unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackStrategy {
    /// No policy: the store error surfaces to the caller.
    #[default]
    None,
    /// Substitute an in-process semaphore with pod-scaled limits.
    Local,
    /// Fail open: grant virtual permits.
    Open,
    /// Fail closed: refuse with the store error.
    Close,
}

impl FallbackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Open => "open",
            Self::Close => "close",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "local" => Some(Self::Local),
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FallbackStrategy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| Error::InvalidFallbackStrategy(value.to_string()))
    }
}

/// Callback invoked (throttled) whenever a fallback transition happens.
pub type FallbackHook = Arc<dyn Fn(&str, FallbackStrategy, &Error) + Send + Sync>;

/// Construction options for [`FallbackSemaphore`].
#[derive(Clone)]
pub struct FallbackConfig {
    pub strategy: FallbackStrategy,
    /// Pod count used to scale limits for the lazily-built local semaphore.
    pub pod_count: u32,
    /// Per-operation deadline for the local semaphore.
    pub default_timeout: Option<Duration>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub meter: Arc<dyn Meter>,
    pub disable_resource_label: bool,
    pub on_fallback: Option<FallbackHook>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategy: FallbackStrategy::default(),
            pod_count: 1,
            default_timeout: None,
            id_generator: Arc::new(UuidGenerator),
            meter: Arc::new(NoopMeter),
            disable_resource_label: false,
            on_fallback: None,
        }
    }
}

impl FallbackConfig {
    pub fn with_strategy(mut self, strategy: FallbackStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_pod_count(mut self, pod_count: u32) -> Self {
        self.pod_count = pod_count;
        self
    }

    pub fn with_on_fallback(mut self, hook: FallbackHook) -> Self {
        self.on_fallback = Some(hook);
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.pod_count == 0 {
            return Err(Error::InvalidPodCount);
        }
        Ok(())
    }
}

struct FallbackState {
    closed: bool,
    local: Option<Arc<LocalSemaphore>>,
}

/// A remote semaphore wrapped with a store-unavailable policy.
pub struct FallbackSemaphore {
    remote: RemoteSemaphore,
    strategy: FallbackStrategy,
    // One mutex guards both the closed flag and the lazy local instance, so
    // no local (and no sweeper task) can be created after close.
    state: Mutex<FallbackState>,
    hook: Option<ThrottledHook>,
    instruments: Instruments,
    pod_count: u32,
    default_timeout: Option<Duration>,
    id_generator: Arc<dyn IdGenerator>,
    meter: Arc<dyn Meter>,
    disable_resource_label: bool,
}

impl std::fmt::Debug for FallbackSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackSemaphore").finish_non_exhaustive()
    }
}

impl FallbackSemaphore {
    pub fn new(remote: RemoteSemaphore, config: FallbackConfig) -> Result<Self, Error> {
        config.validate()?;
        let instruments =
            Instruments::new(config.meter.as_ref(), config.disable_resource_label);
        Ok(Self {
            remote,
            strategy: config.strategy,
            state: Mutex::new(FallbackState { closed: false, local: None }),
            hook: config.on_fallback.map(|hook| ThrottledHook::new(hook, HOOK_MIN_INTERVAL)),
            instruments,
            pod_count: config.pod_count,
            default_timeout: config.default_timeout,
            id_generator: config.id_generator,
            meter: config.meter,
            disable_resource_label: config.disable_resource_label,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, FallbackState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The lazily-built local instance. Construction happens at most once
    /// and never after close, both guaranteed by the state mutex.
    fn local(&self) -> Result<Arc<LocalSemaphore>, Error> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(Error::SemaphoreClosed);
        }
        if let Some(local) = &state.local {
            return Ok(Arc::clone(local));
        }

        let config = LocalConfig {
            pod_count: self.pod_count,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_timeout: self.default_timeout,
            id_generator: Arc::clone(&self.id_generator),
            meter: Arc::clone(&self.meter),
            disable_resource_label: self.disable_resource_label,
        };
        let local = Arc::new(LocalSemaphore::new(config)?);
        state.local = Some(Arc::clone(&local));
        Ok(local)
    }

    /// Record one fallback transition: event, counter, throttled callback.
    fn note_fallback(&self, resource: &str, err: &Error) {
        let fail_reason = err.label().as_str();
        warn!(
            fallback_used = true,
            strategy = self.strategy.as_str(),
            fail_reason,
            resource,
            "store unavailable, applying fallback policy"
        );
        self.instruments.record_fallback(self.strategy.as_str(), fail_reason, resource);
        if let Some(hook) = &self.hook {
            hook.fire(resource, self.strategy, err);
        }
    }

    fn noop_permit(&self, resource: &str, opts: &AcquireOptions) -> Result<Permit, Error> {
        let id = self.id_generator.generate().map_err(Error::IdGenerationFailed)?;
        let expires_at = expires_after(Utc::now(), opts.ttl);
        Ok(Permit::issue(
            PermitParams {
                id: format!("{NOOP_ID_PREFIX}{id}"),
                resource: resource.to_string(),
                tenant_id: opts.tenant_id.clone().filter(|t| !t.is_empty()),
                ttl: opts.ttl,
                has_tenant_quota: opts.effective_tenant().is_some(),
                metadata: opts.metadata.clone(),
                expires_at,
            },
            Arc::new(NoopPermitBackend),
            self.instruments.clone(),
            SEM_TYPE_NOOP,
        ))
    }

    /// Open-mode query: everything the caller asked about is available.
    fn open_query(&self, resource: &str, opts: &QueryOptions) -> ResourceInfo {
        ResourceInfo {
            resource: resource.to_string(),
            global: QuotaUsage::new(opts.capacity, 0),
            tenant: opts
                .effective_tenant()
                .map(|tenant_id| TenantUsage::new(tenant_id, opts.tenant_quota, 0)),
        }
    }
}

#[async_trait]
impl Semaphore for FallbackSemaphore {
    async fn try_acquire(
        &self,
        resource: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Permit>, Error> {
        match self.remote.try_acquire(resource, opts).await {
            Err(err) if err.is_store_unavailable() => {
                self.note_fallback(resource, &err);
                match self.strategy {
                    FallbackStrategy::Local => self.local()?.try_acquire(resource, opts).await,
                    FallbackStrategy::Open => self.noop_permit(resource, opts).map(Some),
                    FallbackStrategy::Close | FallbackStrategy::None => Err(err),
                }
            }
            other => other,
        }
    }

    async fn acquire(&self, resource: &str, opts: &AcquireOptions) -> Result<Permit, Error> {
        match self.remote.acquire(resource, opts).await {
            Err(err) if err.is_store_unavailable() => {
                self.note_fallback(resource, &err);
                match self.strategy {
                    FallbackStrategy::Local => self.local()?.acquire(resource, opts).await,
                    FallbackStrategy::Open => self.noop_permit(resource, opts),
                    FallbackStrategy::Close | FallbackStrategy::None => Err(err),
                }
            }
            other => other,
        }
    }

    async fn query(&self, resource: &str, opts: &QueryOptions) -> Result<ResourceInfo, Error> {
        match self.remote.query(resource, opts).await {
            Err(err) if err.is_store_unavailable() => {
                self.note_fallback(resource, &err);
                match self.strategy {
                    FallbackStrategy::Local => self.local()?.query(resource, opts).await,
                    FallbackStrategy::Open => Ok(self.open_query(resource, opts)),
                    FallbackStrategy::Close | FallbackStrategy::None => Err(err),
                }
            }
            other => other,
        }
    }

    /// Healthy only when the remote is. A healthy local fallback does not
    /// mask the remote failure — callers still see degraded mode.
    async fn health(&self) -> Result<(), Error> {
        let remote_err = match self.remote.health().await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let local = self.lock_state().local.clone();
        match local {
            Some(local) => match local.health().await {
                Ok(()) => Err(remote_err),
                Err(local_err) => Err(Error::Multiple(vec![remote_err, local_err])),
            },
            None => Err(remote_err),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        let local = {
            let mut state = self.lock_state();
            state.closed = true;
            state.local.clone()
        };

        let mut errors = Vec::new();
        if let Err(err) = self.remote.close().await {
            errors.push(err);
        }
        if let Some(local) = local {
            if let Err(err) = local.close().await {
                errors.push(err);
            }
        }
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ── Noop permits ────────────────────────────────────────────────────

/// Backend for open-mode permits: the ledger is imaginary, release and
/// extend always succeed. The shared envelopes still flip the released
/// flag, publish the new expiry, and record metrics, keeping observability
/// on par with real permits.
struct NoopPermitBackend;

#[async_trait]
impl PermitBackend for NoopPermitBackend {
    async fn release(&self, _permit: &PermitShared) -> Result<(), Error> {
        Ok(())
    }

    async fn extend(
        &self,
        _permit: &PermitShared,
        _new_expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

// ── Callback throttling ─────────────────────────────────────────────

struct ThrottledHook {
    hook: FallbackHook,
    min_interval: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl ThrottledHook {
    fn new(hook: FallbackHook, min_interval: Duration) -> Self {
        Self { hook, min_interval, last_fired: Mutex::new(None) }
    }

    /// Invoke the hook unless it fired within the window. Panics inside the
    /// callback are contained and logged; they never reach the caller.
    fn fire(&self, resource: &str, strategy: FallbackStrategy, err: &Error) {
        {
            let mut last = match self.last_fired.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.is_some_and(|at| at.elapsed() < self.min_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        if catch_unwind(AssertUnwindSafe(|| (self.hook)(resource, strategy, err))).is_err() {
            warn!(resource, strategy = strategy.as_str(), "fallback callback panicked");
        }
    }
}
