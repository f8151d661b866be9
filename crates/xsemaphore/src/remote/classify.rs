// Store-failure classification.
//
// Three buckets matter to callers:
// - retryable: transient cluster churn (TRYAGAIN); the blocking acquire
//   absorbs these, nothing escalates
// - unavailable: the store cannot serve us (cluster down, loading,
//   redirection already failed, a proxy without Lua, any socket-level
//   failure); this is the fallback trigger
// - everything else: a real response error, surfaced as-is
//
// Context/deadline expiry never reaches here — `with_deadline` maps it to
// `Error::DeadlineExceeded` before classification.

use redis::{ErrorKind, RedisError};

use crate::error::Error;

/// Error strings that mark a proxy or server unable to run scripts at all.
const CAPABILITY_PROBES: [&str; 3] =
    ["unknown command", "NOSCRIPT", "cluster support disabled"];

/// Transient cluster state worth retrying within the same acquire call.
pub(crate) fn is_retryable(err: &RedisError) -> bool {
    matches!(err.kind(), ErrorKind::TryAgain)
}

/// True when the store should be treated as unavailable.
pub(crate) fn is_unavailable(err: &RedisError) -> bool {
    if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() {
        return true;
    }
    if err.is_connection_dropped() || err.is_unrecoverable_error() {
        return true;
    }
    match err.kind() {
        ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::BusyLoadingError
        | ErrorKind::ReadOnly
        | ErrorKind::Moved
        | ErrorKind::Ask
        | ErrorKind::CrossSlot
        | ErrorKind::NoScriptError => true,
        _ => matches_capability_probe(err),
    }
}

/// Wrap a raw store error in its classified form.
pub(crate) fn classify(err: RedisError) -> Error {
    if is_unavailable(&err) {
        Error::RedisUnavailable(err)
    } else {
        Error::Redis(err)
    }
}

fn matches_capability_probe(err: &RedisError) -> bool {
    let rendered = err.to_string();
    CAPABILITY_PROBES.iter().any(|probe| rendered.contains(probe))
}
