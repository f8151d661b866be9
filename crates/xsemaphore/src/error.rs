// Typed error taxonomy for the semaphore.
//
// Every failure a caller can observe is a variant here. Store errors keep
// their `redis::RedisError` source; `RedisUnavailable` is the classified
// "store is down" shape that drives the fallback wrapper, while `Redis`
// carries store responses that are errors but not outages.

use thiserror::Error;

/// Errors returned by semaphore and permit operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource name is invalid: {0}")]
    InvalidResource(String),

    #[error("tenant id is invalid: {0}")]
    InvalidTenantId(String),

    #[error("key prefix is invalid: {0}")]
    InvalidKeyPrefix(String),

    #[error("capacity must be greater than zero")]
    InvalidCapacity,

    #[error("ttl must be greater than zero")]
    InvalidTtl,

    #[error("tenant quota must be between zero and the capacity")]
    InvalidTenantQuota,

    #[error("max retries must be greater than zero")]
    InvalidMaxRetries,

    #[error("retry delay must be greater than zero")]
    InvalidRetryDelay,

    #[error("pod count must be greater than zero")]
    InvalidPodCount,

    #[error("unknown fallback strategy: {0}")]
    InvalidFallbackStrategy(String),

    #[error("no redis client was supplied")]
    MissingClient,

    #[error("semaphore is closed")]
    SemaphoreClosed,

    /// Status-reporting only: `try_acquire` signals a full ledger with
    /// `Ok(None)`, never with this variant.
    #[error("resource capacity is exhausted")]
    CapacityFull,

    /// Status-reporting only, see [`Error::CapacityFull`].
    #[error("tenant quota is exhausted")]
    TenantQuotaExceeded,

    #[error("permit is not held")]
    PermitNotHeld,

    #[error("acquire gave up after {attempts} attempts")]
    AcquireFailed { attempts: u32 },

    #[error("redis unavailable")]
    RedisUnavailable(#[source] redis::RedisError),

    #[error("redis command failed")]
    Redis(#[source] redis::RedisError),

    #[error("permit id generation failed")]
    IdGenerationFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("script returned unknown status {0}")]
    UnknownScriptStatus(i64),

    #[error("unexpected script result: {0}")]
    UnexpectedScriptResult(String),

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Joined errors from paths that report on two backends at once
    /// (degraded health, close).
    #[error("{}", joined_message(.0))]
    Multiple(Vec<Error>),
}

/// Low-cardinality classification of an error for metric attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLabel {
    RedisUnavailable,
    PermitNotHeld,
    Timeout,
    Canceled,
    InternalError,
}

impl ErrorLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RedisUnavailable => "redis_unavailable",
            Self::PermitNotHeld => "permit_not_held",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::InternalError => "internal_error",
        }
    }
}

impl Error {
    /// Map any error to the metric label set. Everything that is not an
    /// outage, a lost permit, or a deadline collapses into `internal_error`;
    /// the label set must stay enumerable.
    pub fn label(&self) -> ErrorLabel {
        match self {
            Self::RedisUnavailable(_) => ErrorLabel::RedisUnavailable,
            Self::PermitNotHeld => ErrorLabel::PermitNotHeld,
            Self::DeadlineExceeded => ErrorLabel::Timeout,
            Self::Redis(err) if err.is_timeout() => ErrorLabel::Timeout,
            Self::Redis(err) if is_interrupted(err) => ErrorLabel::Canceled,
            Self::Multiple(errors) => {
                errors.first().map(Error::label).unwrap_or(ErrorLabel::InternalError)
            }
            _ => ErrorLabel::InternalError,
        }
    }

    /// True when this error marks the store as unavailable and should drive
    /// the fallback policy.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::RedisUnavailable(_))
    }

    /// Join a list of errors into one, flattening the empty and singleton
    /// cases.
    pub(crate) fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Multiple(errors)),
        }
    }
}

fn is_interrupted(err: &redis::RedisError) -> bool {
    matches!(err.kind(), redis::ErrorKind::IoError)
        && err.to_string().contains("operation interrupted")
}

fn joined_message(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    parts.join("; ")
}
