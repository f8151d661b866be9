// Public operation surface: the `Semaphore` trait, per-call options, and the
// `ResourceInfo` snapshot returned by query.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Error;
use crate::permit::Permit;
use crate::validate::{validate_resource, validate_tenant_id};

/// Default attempt budget for the blocking [`Semaphore::acquire`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default spacing between acquire attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bounded-concurrency semaphore over some ledger backend.
///
/// Implementations: [`RemoteSemaphore`] (scripted redis ledger),
/// [`LocalSemaphore`] (in-process ledger), and [`FallbackSemaphore`]
/// (remote with a degradation policy).
///
/// [`RemoteSemaphore`]: crate::RemoteSemaphore
/// [`LocalSemaphore`]: crate::LocalSemaphore
/// [`FallbackSemaphore`]: crate::FallbackSemaphore
#[async_trait]
pub trait Semaphore: Send + Sync + std::fmt::Debug {
    /// One non-blocking attempt. `Ok(None)` means the ledger is full right
    /// now; errors are reserved for validation and store failures.
    async fn try_acquire(
        &self,
        resource: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<Permit>, Error>;

    /// Attempt up to `opts.max_retries` times, sleeping `opts.retry_delay`
    /// between attempts. Fails with [`Error::AcquireFailed`] once the budget
    /// is exhausted.
    async fn acquire(&self, resource: &str, opts: &AcquireOptions) -> Result<Permit, Error>;

    /// Read-only usage snapshot. Never prunes the ledger.
    async fn query(&self, resource: &str, opts: &QueryOptions) -> Result<ResourceInfo, Error>;

    /// `Ok` when the semaphore is open and its backend reachable.
    async fn health(&self) -> Result<(), Error>;

    /// Reject further acquire/query. Release and extend on already-issued
    /// permits keep working so in-flight work can complete. Idempotent.
    async fn close(&self) -> Result<(), Error>;
}

/// Options for a single acquire call.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Global holder bound for the resource. Must be > 0.
    pub capacity: u32,
    /// Permit lifetime; also the window added by each extend. Must be > 0.
    pub ttl: Duration,
    /// Tenant to account the permit under. `None` disables tenant accounting.
    pub tenant_id: Option<String>,
    /// Per-tenant bound within `capacity`. `0` disables tenant accounting
    /// even when a tenant id is present.
    pub tenant_quota: u32,
    /// Attempt budget for the blocking acquire. Must be > 0 there.
    pub max_retries: u32,
    /// Sleep between blocking-acquire attempts. Must be > 0 there.
    pub retry_delay: Duration,
    /// Caller-supplied annotations, copied into the permit.
    pub metadata: BTreeMap<String, String>,
}

impl AcquireOptions {
    pub fn new(capacity: u32, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            tenant_id: None,
            tenant_quota: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, tenant_quota: u32) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self.tenant_quota = tenant_quota;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The tenant this acquire accounts under, after applying the "empty id
    /// or zero quota means no tenant ledger" rule.
    pub(crate) fn effective_tenant(&self) -> Option<&str> {
        match self.tenant_id.as_deref() {
            Some(id) if !id.is_empty() && self.tenant_quota > 0 => Some(id),
            _ => None,
        }
    }

    /// Per-call validation shared by try_acquire and acquire.
    pub(crate) fn validate(&self, resource: &str) -> Result<(), Error> {
        validate_resource(resource)?;
        if let Some(tenant_id) = self.tenant_id.as_deref() {
            validate_tenant_id(tenant_id)?;
        }
        if self.capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        if self.ttl.is_zero() {
            return Err(Error::InvalidTtl);
        }
        if self.tenant_quota > self.capacity {
            return Err(Error::InvalidTenantQuota);
        }
        Ok(())
    }

    /// Additional validation for the blocking acquire path.
    pub(crate) fn validate_retry(&self) -> Result<(), Error> {
        if self.max_retries == 0 {
            return Err(Error::InvalidMaxRetries);
        }
        if self.retry_delay.is_zero() {
            return Err(Error::InvalidRetryDelay);
        }
        Ok(())
    }
}

/// Options for a query call. Capacity and quota are caller-supplied because
/// the ledger stores members, not limits.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub capacity: u32,
    pub tenant_id: Option<String>,
    pub tenant_quota: u32,
}

impl QueryOptions {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, tenant_id: None, tenant_quota: 0 }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, tenant_quota: u32) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self.tenant_quota = tenant_quota;
        self
    }

    pub(crate) fn effective_tenant(&self) -> Option<&str> {
        match self.tenant_id.as_deref() {
            Some(id) if !id.is_empty() && self.tenant_quota > 0 => Some(id),
            _ => None,
        }
    }

    pub(crate) fn validate(&self, resource: &str) -> Result<(), Error> {
        validate_resource(resource)?;
        if let Some(tenant_id) = self.tenant_id.as_deref() {
            validate_tenant_id(tenant_id)?;
        }
        if self.capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        if self.tenant_quota > self.capacity {
            return Err(Error::InvalidTenantQuota);
        }
        Ok(())
    }
}

/// Usage snapshot for a resource, as reported by [`Semaphore::query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub resource: String,
    pub global: QuotaUsage,
    /// Present when the query named a tenant with a non-zero quota.
    pub tenant: Option<TenantUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub capacity: u32,
    pub used: u32,
    pub available: u32,
}

impl QuotaUsage {
    pub(crate) fn new(capacity: u32, used: u32) -> Self {
        Self { capacity, used, available: capacity.saturating_sub(used) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantUsage {
    pub tenant_id: String,
    pub quota: u32,
    pub used: u32,
    pub available: u32,
}

impl TenantUsage {
    pub(crate) fn new(tenant_id: impl Into<String>, quota: u32, used: u32) -> Self {
        Self { tenant_id: tenant_id.into(), quota, used, available: quota.saturating_sub(used) }
    }
}

/// Apply the factory-level default timeout to one operation.
///
/// A caller wrapping the returned future in a shorter `tokio::time::timeout`
/// still wins — dropping the future cancels the work — so this never extends
/// an existing deadline.
pub(crate) async fn with_deadline<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        },
        None => fut.await,
    }
}
