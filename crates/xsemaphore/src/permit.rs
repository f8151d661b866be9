// Permit handles.
//
// One concrete `Permit` type fronts every backend. The remote, local, and
// noop variants differ only in the `PermitBackend` they carry; the release
// and extend envelopes, the published expiry, and the auto-renewal loop are
// shared here.
//
// Lifecycle flags:
// - `released` is sticky; release is idempotent and downgrades
//   `PermitNotHeld` to success (the ledger already forgot the permit)
// - the auto-renew registration lives under a mutex with a generation
//   counter, so concurrent `start_auto_extend` calls attach to one loop

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::Error;
use crate::observe::Instruments;

/// Upper bound for the per-tick auto-renew timeout.
const MAX_TICK_TIMEOUT: Duration = Duration::from_secs(10);

/// Ledger-side operations behind a permit handle.
#[async_trait]
pub(crate) trait PermitBackend: Send + Sync {
    /// Remove the permit from its ledger(s). Must report
    /// [`Error::PermitNotHeld`] when the ledger no longer knows the id.
    async fn release(&self, permit: &PermitShared) -> Result<(), Error>;

    /// Move the permit's expiry to `new_expires_at`, failing with
    /// [`Error::PermitNotHeld`] when the entry is gone or already expired.
    async fn extend(&self, permit: &PermitShared, new_expires_at: DateTime<Utc>)
        -> Result<(), Error>;
}

/// Shared handle state. Everything observable from a `Permit` lives here so
/// the auto-renew task and the handle see one copy.
pub(crate) struct PermitShared {
    pub id: String,
    pub resource: String,
    pub tenant_id: Option<String>,
    pub ttl: Duration,
    pub has_tenant_quota: bool,
    metadata: BTreeMap<String, String>,
    expires_at_ms: AtomicI64,
    released: AtomicBool,
    auto: Mutex<Option<AutoExtendState>>,
    auto_generation: AtomicU64,
    backend: Arc<dyn PermitBackend>,
    instruments: Instruments,
    sem_type: &'static str,
}

struct AutoExtendState {
    generation: u64,
    stop_tx: broadcast::Sender<()>,
}

/// Construction parameters for a freshly acquired permit.
pub(crate) struct PermitParams {
    pub id: String,
    pub resource: String,
    pub tenant_id: Option<String>,
    pub ttl: Duration,
    pub has_tenant_quota: bool,
    pub metadata: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

/// A time-bounded grant for one holder of a resource.
///
/// The handle owns the grant exclusively: it is not clonable, release is
/// idempotent, and dropping the handle does **not** release the permit — the
/// ledger reclaims it when the TTL runs out.
pub struct Permit {
    shared: Arc<PermitShared>,
}

impl Permit {
    pub(crate) fn issue(
        params: PermitParams,
        backend: Arc<dyn PermitBackend>,
        instruments: Instruments,
        sem_type: &'static str,
    ) -> Self {
        let shared = PermitShared {
            id: params.id,
            resource: params.resource,
            tenant_id: params.tenant_id,
            ttl: params.ttl,
            has_tenant_quota: params.has_tenant_quota,
            metadata: params.metadata,
            expires_at_ms: AtomicI64::new(params.expires_at.timestamp_millis()),
            released: AtomicBool::new(false),
            auto: Mutex::new(None),
            auto_generation: AtomicU64::new(0),
            backend,
            instruments,
            sem_type,
        };
        Self { shared: Arc::new(shared) }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.shared.tenant_id.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    pub fn has_tenant_quota(&self) -> bool {
        self.shared.has_tenant_quota
    }

    /// Current expiry as last observed by this handle.
    pub fn expires_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.shared.expires_at_ms.load(Ordering::Acquire))
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// A fresh copy of the caller-supplied metadata.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.shared.metadata.clone()
    }

    /// Return the permit to the ledger. Safe to call more than once; a permit
    /// the ledger already reclaimed counts as released.
    #[tracing::instrument(name = "permit.release", level = "debug", skip_all, fields(permit_id = %self.shared.id, resource = %self.shared.resource))]
    pub async fn release(&self) -> Result<(), Error> {
        release_shared(&self.shared).await
    }

    /// Push the expiry out to `now + ttl`.
    #[tracing::instrument(name = "permit.extend", level = "debug", skip_all, fields(permit_id = %self.shared.id, resource = %self.shared.resource))]
    pub async fn extend(&self) -> Result<(), Error> {
        extend_shared(&self.shared).await
    }

    /// Start the cooperative renewal loop, extending every `interval`.
    ///
    /// At most one loop runs per permit: concurrent calls return handles
    /// attached to the same loop. A zero interval returns a no-op handle.
    /// The loop stops on release, on [`Error::PermitNotHeld`], or when a
    /// returned handle is stopped; other extend errors are logged and the
    /// loop keeps going.
    pub fn start_auto_extend(&self, interval: Duration) -> AutoExtend {
        if interval.is_zero() {
            return AutoExtend { inner: None };
        }

        let mut auto = lock_auto(&self.shared);
        if let Some(state) = auto.as_ref() {
            return AutoExtend {
                inner: Some(AutoExtendInner {
                    shared: Arc::clone(&self.shared),
                    stop_tx: state.stop_tx.clone(),
                    generation: state.generation,
                }),
            };
        }

        let generation = self.shared.auto_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = broadcast::channel(1);
        *auto = Some(AutoExtendState { generation, stop_tx: stop_tx.clone() });
        tokio::spawn(auto_extend_loop(Arc::clone(&self.shared), stop_rx, interval, generation));

        AutoExtend {
            inner: Some(AutoExtendInner { shared: Arc::clone(&self.shared), stop_tx, generation }),
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("id", &self.shared.id)
            .field("resource", &self.shared.resource)
            .field("tenant_id", &self.shared.tenant_id)
            .field("expires_at", &self.expires_at())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Stop handle for a running auto-renewal loop.
///
/// Stopping is cooperative and consumes the handle. Dropping the handle
/// without stopping leaves the loop running until release.
pub struct AutoExtend {
    inner: Option<AutoExtendInner>,
}

struct AutoExtendInner {
    shared: Arc<PermitShared>,
    stop_tx: broadcast::Sender<()>,
    generation: u64,
}

impl AutoExtend {
    /// True when `start_auto_extend` declined to start a loop (zero interval).
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Stop the loop this handle is attached to.
    pub fn stop(self) {
        if let Some(inner) = self.inner {
            let _ = inner.stop_tx.send(());
            clear_registration(&inner.shared, inner.generation);
        }
    }
}

// ── Envelopes ───────────────────────────────────────────────────────

async fn release_shared(shared: &Arc<PermitShared>) -> Result<(), Error> {
    if shared.released.load(Ordering::Acquire) {
        return Ok(());
    }

    stop_auto_extend(shared);

    match shared.backend.release(shared).await {
        Ok(()) => {
            shared.released.store(true, Ordering::Release);
            emit_release(shared);
            Ok(())
        }
        Err(Error::PermitNotHeld) => {
            // The ledger dropped the entry first: expired, or released by an
            // operator. The handle outcome is the same.
            shared.released.store(true, Ordering::Release);
            warn!(
                permit_id = %shared.id,
                resource = %shared.resource,
                "permit was already released externally or expired"
            );
            emit_release(shared);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn extend_shared(shared: &Arc<PermitShared>) -> Result<(), Error> {
    if shared.released.load(Ordering::Acquire) {
        return Err(Error::PermitNotHeld);
    }

    let new_expires_at = expires_after(Utc::now(), shared.ttl);
    let result = shared.backend.extend(shared, new_expires_at).await;

    let success = result.is_ok();
    if success {
        shared.expires_at_ms.store(new_expires_at.timestamp_millis(), Ordering::Release);
    }
    shared.instruments.record_extend(shared.sem_type, &shared.resource, success);
    result
}

fn emit_release(shared: &PermitShared) {
    shared.instruments.record_release(shared.sem_type, &shared.resource);
}

// ── Auto-renewal loop ───────────────────────────────────────────────

async fn auto_extend_loop(
    shared: Arc<PermitShared>,
    mut stop_rx: broadcast::Receiver<()>,
    interval: Duration,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval fires immediately; consume that tick so the first extend
    // happens one full interval after acquire.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                if shared.released.load(Ordering::Acquire) {
                    break;
                }
                match tokio::time::timeout(tick_timeout(shared.ttl), extend_shared(&shared)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(Error::PermitNotHeld)) => {
                        debug!(
                            permit_id = %shared.id,
                            resource = %shared.resource,
                            "auto extend stopping, permit no longer held"
                        );
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(
                            permit_id = %shared.id,
                            resource = %shared.resource,
                            error = %err,
                            "auto extend attempt failed"
                        );
                    }
                    Err(_) => {
                        warn!(
                            permit_id = %shared.id,
                            resource = %shared.resource,
                            "auto extend attempt timed out"
                        );
                    }
                }
            }
        }
    }

    clear_registration(&shared, generation);
}

/// Per-tick extend budget: a third of the TTL, capped at 10 s.
fn tick_timeout(ttl: Duration) -> Duration {
    (ttl / 3).min(MAX_TICK_TIMEOUT).max(Duration::from_millis(1))
}

fn stop_auto_extend(shared: &PermitShared) {
    let mut auto = lock_auto(shared);
    if let Some(state) = auto.take() {
        let _ = state.stop_tx.send(());
    }
}

/// Clear the loop registration, but only for the loop generation that is
/// exiting. A newer loop registered after a stop/start race keeps its slot.
fn clear_registration(shared: &PermitShared, generation: u64) {
    let mut auto = lock_auto(shared);
    if auto.as_ref().is_some_and(|state| state.generation == generation) {
        *auto = None;
    }
}

fn lock_auto(shared: &PermitShared) -> MutexGuard<'_, Option<AutoExtendState>> {
    match shared.auto.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Time helpers ────────────────────────────────────────────────────

pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now.checked_add_signed(chrono::Duration::milliseconds(ttl_ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
