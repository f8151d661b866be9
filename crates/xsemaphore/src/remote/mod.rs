// Semaphore over a shared redis ledger.
//
// Every state change runs server-side in one of four Lua scripts
// (`scripts.rs`); the client validates, allocates an id, builds the KEYS and
// ARGV tables, and interprets a typed status code. Store failures classify
// into retryable vs unavailable (`classify.rs`); the latter is what the
// fallback wrapper reacts to.

mod classify;
mod decode;
mod keys;
mod runner;
mod scripts;

pub use runner::{ConnectionRunner, ScriptRunner};
pub use scripts::SemScript;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Error;
use crate::id::{IdGenerator, UuidGenerator};
use crate::observe::{
    Instruments, Meter, NoopMeter, REASON_CAPACITY_FULL, REASON_TENANT_QUOTA, SEM_TYPE_REDIS,
};
use crate::permit::{expires_after, Permit, PermitBackend, PermitParams, PermitShared};
use crate::semaphore::{
    with_deadline, AcquireOptions, QueryOptions, QuotaUsage, ResourceInfo, Semaphore, TenantUsage,
};
use crate::validate::validate_key_prefix;

use classify::{classify, is_retryable};
use decode::decode_int_array;
use keys::script_keys;
use scripts::{
    Scripts, STATUS_CAPACITY_FULL, STATUS_NOT_HELD, STATUS_OK, STATUS_TENANT_QUOTA_EXCEEDED,
};

/// Default key prefix for all ledger keys.
pub const DEFAULT_KEY_PREFIX: &str = "xsemaphore:";

/// Default slack added on top of the newest expiry when bumping a key TTL.
pub const DEFAULT_KEY_TTL_MARGIN: Duration = Duration::from_secs(60);

/// Construction options for [`RemoteSemaphore`].
#[derive(Clone)]
pub struct RemoteConfig {
    /// Prefix for every ledger key. Must not contain braces.
    pub key_prefix: String,
    /// Slack added to key-level TTLs beyond the newest permit expiry.
    pub key_ttl_margin: Duration,
    /// Per-operation deadline applied when the caller brings none.
    pub default_timeout: Option<Duration>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub meter: Arc<dyn Meter>,
    /// Drop the `resource` metric label (high-cardinality safeguard).
    pub disable_resource_label: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_ttl_margin: DEFAULT_KEY_TTL_MARGIN,
            default_timeout: None,
            id_generator: Arc::new(UuidGenerator),
            meter: Arc::new(NoopMeter),
            disable_resource_label: false,
        }
    }
}

impl RemoteConfig {
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_key_ttl_margin(mut self, margin: Duration) -> Self {
        self.key_ttl_margin = margin;
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
        validate_key_prefix(&self.key_prefix)
    }
}

struct RemoteInner {
    runner: Arc<dyn ScriptRunner>,
    scripts: Scripts,
    key_prefix: String,
    margin_ms: i64,
    default_timeout: Option<Duration>,
    closed: AtomicBool,
    id_generator: Arc<dyn IdGenerator>,
    instruments: Instruments,
}

/// Semaphore whose ledger lives in redis sorted sets.
pub struct RemoteSemaphore {
    inner: Arc<RemoteInner>,
}

impl std::fmt::Debug for RemoteSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSemaphore").finish_non_exhaustive()
    }
}

enum RemoteAttempt {
    Acquired(Permit),
    CapacityFull,
    TenantQuotaExceeded,
    /// Transient cluster state (TRYAGAIN); worth another attempt, never an
    /// error and never a fallback trigger.
    Retry,
}

impl RemoteSemaphore {
    /// Connect to the store and build a semaphore over it.
    pub async fn connect(client: redis::Client, config: RemoteConfig) -> Result<Self, Error> {
        config.validate()?;
        let runner = ConnectionRunner::connect(&client).await.map_err(classify)?;
        Self::with_runner(Arc::new(runner), config)
    }

    /// Build over an explicit [`ScriptRunner`]. The seam tests use to run
    /// the full client path against an in-memory ledger.
    pub fn with_runner(runner: Arc<dyn ScriptRunner>, config: RemoteConfig) -> Result<Self, Error> {
        config.validate()?;
        let margin_ms = i64::try_from(config.key_ttl_margin.as_millis()).unwrap_or(i64::MAX);
        Ok(Self {
            inner: Arc::new(RemoteInner {
                runner,
                scripts: Scripts::new(),
                key_prefix: config.key_prefix,
                margin_ms,
                default_timeout: config.default_timeout,
                closed: AtomicBool::new(false),
                id_generator: config.id_generator,
                instruments: Instruments::new(
                    config.meter.as_ref(),
                    config.disable_resource_label,
                ),
            }),
        })
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
        let outcome = self.attempt(resource, opts).await;
        self.emit_acquire(resource, &outcome, started);

        match outcome {
            Ok(RemoteAttempt::Acquired(permit)) => Ok(Some(permit)),
            Ok(RemoteAttempt::CapacityFull) | Ok(RemoteAttempt::TenantQuotaExceeded) => Ok(None),
            Ok(RemoteAttempt::Retry) => {
                debug!(resource, "acquire hit a transient cluster state, reporting no free slot");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// One script round-trip: allocate id, build KEYS/ARGV, interpret status.
    async fn attempt(
        &self,
        resource: &str,
        opts: &AcquireOptions,
    ) -> Result<RemoteAttempt, Error> {
        let id = self.inner.id_generator.generate().map_err(Error::IdGenerationFailed)?;
        let tenant = opts.effective_tenant();
        let keys = script_keys(&self.inner.key_prefix, resource, tenant);

        let now = Utc::now();
        let expires_at = expires_after(now, opts.ttl);
        let args = vec![
            now.timestamp_millis().to_string(),
            expires_at.timestamp_millis().to_string(),
            id.clone(),
            opts.capacity.to_string(),
            opts.tenant_quota.to_string(),
            self.inner.margin_ms.to_string(),
        ];

        let raw = match self.inner.runner.invoke(&self.inner.scripts.acquire, &keys, &args).await {
            Ok(raw) => raw,
            Err(err) if is_retryable(&err) => return Ok(RemoteAttempt::Retry),
            Err(err) => return Err(classify(err)),
        };

        let reply = decode_int_array(&raw, 3)?;
        match reply[0] {
            STATUS_OK => {
                let backend = Arc::new(RemotePermitBackend { inner: Arc::clone(&self.inner) });
                Ok(RemoteAttempt::Acquired(Permit::issue(
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
                    SEM_TYPE_REDIS,
                )))
            }
            STATUS_CAPACITY_FULL => Ok(RemoteAttempt::CapacityFull),
            STATUS_TENANT_QUOTA_EXCEEDED => Ok(RemoteAttempt::TenantQuotaExceeded),
            status => Err(Error::UnknownScriptStatus(status)),
        }
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
        let result = self.query_attempt(resource, opts).await;
        self.inner.instruments.record_query(
            SEM_TYPE_REDIS,
            resource,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn query_attempt(
        &self,
        resource: &str,
        opts: &QueryOptions,
    ) -> Result<ResourceInfo, Error> {
        let tenant = opts.effective_tenant();
        let keys = script_keys(&self.inner.key_prefix, resource, tenant);
        let args = vec![Utc::now().timestamp_millis().to_string()];

        let raw = self
            .inner
            .runner
            .invoke(&self.inner.scripts.query, &keys, &args)
            .await
            .map_err(classify)?;
        let reply = decode_int_array(&raw, 2)?;

        Ok(ResourceInfo {
            resource: resource.to_string(),
            global: QuotaUsage::new(opts.capacity, clamp_count(reply[0])),
            tenant: tenant.map(|tenant_id| {
                TenantUsage::new(tenant_id, opts.tenant_quota, clamp_count(reply[1]))
            }),
        })
    }

    fn emit_acquire(
        &self,
        resource: &str,
        outcome: &Result<RemoteAttempt, Error>,
        started: Instant,
    ) {
        let acquired = matches!(outcome, Ok(RemoteAttempt::Acquired(_)));
        let reason = match outcome {
            Ok(RemoteAttempt::Acquired(_)) => None,
            Ok(RemoteAttempt::CapacityFull) => Some(REASON_CAPACITY_FULL),
            Ok(RemoteAttempt::TenantQuotaExceeded) => Some(REASON_TENANT_QUOTA),
            Ok(RemoteAttempt::Retry) => Some(REASON_CAPACITY_FULL),
            Err(err) => Some(err.label().as_str()),
        };
        self.inner.instruments.record_acquire(
            SEM_TYPE_REDIS,
            resource,
            acquired,
            reason,
            started.elapsed().as_secs_f64(),
        );
    }
}

#[async_trait]
impl Semaphore for RemoteSemaphore {
    #[tracing::instrument(name = "semaphore.try_acquire", level = "debug", skip_all, fields(sem_type = "redis", resource = %resource))]
    async fn try_acquire(
        &self,
        resource: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Permit>, Error> {
        with_deadline(self.inner.default_timeout, self.try_acquire_inner(resource, opts)).await
    }

    #[tracing::instrument(name = "semaphore.acquire", level = "debug", skip_all, fields(sem_type = "redis", resource = %resource))]
    async fn acquire(&self, resource: &str, opts: &AcquireOptions) -> Result<Permit, Error> {
        with_deadline(self.inner.default_timeout, self.acquire_inner(resource, opts)).await
    }

    #[tracing::instrument(name = "semaphore.query", level = "debug", skip_all, fields(sem_type = "redis", resource = %resource))]
    async fn query(&self, resource: &str, opts: &QueryOptions) -> Result<ResourceInfo, Error> {
        with_deadline(self.inner.default_timeout, self.query_inner(resource, opts)).await
    }

    async fn health(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::SemaphoreClosed);
        }
        self.inner.runner.ping().await.map_err(classify)
    }

    /// Flag-only: scripts for already-issued permits keep running, new
    /// acquire/query calls are refused.
    async fn close(&self) -> Result<(), Error> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ── Permit backend ──────────────────────────────────────────────────

struct RemotePermitBackend {
    inner: Arc<RemoteInner>,
}

impl RemotePermitBackend {
    fn ledger_keys(&self, permit: &PermitShared) -> Vec<String> {
        let tenant = if permit.has_tenant_quota { permit.tenant_id.as_deref() } else { None };
        script_keys(&self.inner.key_prefix, &permit.resource, tenant)
    }
}

#[async_trait]
impl PermitBackend for RemotePermitBackend {
    async fn release(&self, permit: &PermitShared) -> Result<(), Error> {
        let keys = self.ledger_keys(permit);
        let args = vec![permit.id.clone()];
        let inner = &self.inner;

        with_deadline(inner.default_timeout, async {
            let raw = inner
                .runner
                .invoke(&inner.scripts.release, &keys, &args)
                .await
                .map_err(classify)?;
            let reply = decode_int_array(&raw, 2)?;
            match reply[0] {
                STATUS_OK => Ok(()),
                STATUS_NOT_HELD => Err(Error::PermitNotHeld),
                status => Err(Error::UnknownScriptStatus(status)),
            }
        })
        .await
    }

    async fn extend(
        &self,
        permit: &PermitShared,
        new_expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let keys = self.ledger_keys(permit);
        let args = vec![
            Utc::now().timestamp_millis().to_string(),
            new_expires_at.timestamp_millis().to_string(),
            permit.id.clone(),
            self.inner.margin_ms.to_string(),
        ];
        let inner = &self.inner;

        with_deadline(inner.default_timeout, async {
            let raw = inner
                .runner
                .invoke(&inner.scripts.extend, &keys, &args)
                .await
                .map_err(classify)?;
            let reply = decode_int_array(&raw, 1)?;
            match reply[0] {
                STATUS_OK => Ok(()),
                STATUS_NOT_HELD => Err(Error::PermitNotHeld),
                status => Err(Error::UnknownScriptStatus(status)),
            }
        })
        .await
    }
}

fn clamp_count(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::clamp_count;

    #[test]
    fn counts_clamp_into_u32() {
        assert_eq!(clamp_count(-3), 0);
        assert_eq!(clamp_count(7), 7);
        assert_eq!(clamp_count(i64::MAX), u32::MAX);
    }
}
