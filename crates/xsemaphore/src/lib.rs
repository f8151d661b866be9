//! Distributed counting semaphore over redis sorted sets, with an optional
//! in-process fallback.
//!
//! A holder obtains a time-bounded [`Permit`] for a named resource and must
//! release, extend, or auto-renew it; expired permits are reclaimed by the
//! ledger itself. Capacity is two-level: a global bound per resource plus an
//! optional per-tenant quota inside it. All remote state changes run as
//! atomic server-side scripts; when the store is unhealthy, the
//! [`FallbackSemaphore`] degrades per policy (local ledger, fail-open, or
//! fail-closed).

pub mod observe;

mod config;
mod error;
mod fallback;
mod id;
mod local;
mod permit;
mod remote;
mod semaphore;
mod validate;

pub use config::Builder;
pub use error::{Error, ErrorLabel};
pub use fallback::{
    FallbackConfig, FallbackHook, FallbackSemaphore, FallbackStrategy, NOOP_ID_PREFIX,
};
pub use id::{IdError, IdGenerator, UuidGenerator};
pub use local::{LocalConfig, LocalSemaphore, DEFAULT_SWEEP_INTERVAL};
pub use permit::{AutoExtend, Permit};
pub use remote::{
    ConnectionRunner, RemoteConfig, RemoteSemaphore, ScriptRunner, SemScript, DEFAULT_KEY_PREFIX,
    DEFAULT_KEY_TTL_MARGIN,
};
pub use semaphore::{
    AcquireOptions, QueryOptions, QuotaUsage, ResourceInfo, Semaphore, TenantUsage,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
};
pub use validate::MAX_NAME_BYTES;
