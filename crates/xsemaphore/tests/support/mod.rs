// Shared test doubles: an in-memory script runner that honours the ledger
// contracts, plus a meter that records every measurement.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::{ErrorKind, RedisError, Value};
use xsemaphore::observe::{Counter, Histogram, Label, Meter};
use xsemaphore::{ScriptRunner, SemScript};

/// Route library tracing into the test output. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("xsemaphore=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ── Fake ledger runner ──────────────────────────────────────────────

/// Failure the fake store produces on every call until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    ConnectionRefused,
    Noscript,
    ClusterDown,
    TryAgain,
    UnknownCommand,
}

impl Failure {
    fn to_error(self) -> RedisError {
        match self {
            Self::ConnectionRefused => RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
            Self::Noscript => RedisError::from((
                ErrorKind::NoScriptError,
                "script not found",
                "NOSCRIPT No matching script".to_string(),
            )),
            Self::ClusterDown => {
                RedisError::from((ErrorKind::ClusterDown, "cluster is down"))
            }
            Self::TryAgain => RedisError::from((ErrorKind::TryAgain, "try again later")),
            Self::UnknownCommand => RedisError::from((
                ErrorKind::ResponseError,
                "response error",
                "ERR unknown command 'EVAL'".to_string(),
            )),
        }
    }
}

/// Sorted-set member map: member id → expiry millis.
type SortedSet = BTreeMap<String, i64>;

#[derive(Default)]
struct LedgerState {
    sets: HashMap<String, SortedSet>,
}

/// In-memory stand-in for the redis scripts. One lock around the whole
/// state keeps each invocation as atomic as the server-side original.
#[derive(Default)]
pub struct FakeLedgerRunner {
    state: Mutex<LedgerState>,
    failure: Mutex<Option<Failure>>,
    invocations: Mutex<HashMap<&'static str, usize>>,
    pings: AtomicUsize,
}

impl FakeLedgerRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every subsequent call with the given error, or recover with
    /// `None`.
    pub fn fail_with(&self, failure: Option<Failure>) {
        *self.failure.lock().expect("failure lock should not be poisoned") = failure;
    }

    /// Number of script invocations seen, by script name.
    pub fn invocations(&self, script: &str) -> usize {
        self.invocations
            .lock()
            .expect("invocation lock should not be poisoned")
            .get(script)
            .copied()
            .unwrap_or(0)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Keys currently holding at least one member.
    pub fn live_keys(&self) -> Vec<String> {
        let state = self.state.lock().expect("state lock should not be poisoned");
        let mut keys: Vec<String> =
            state.sets.iter().filter(|(_, set)| !set.is_empty()).map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys
    }

    /// Members of one key, sorted by id.
    pub fn members(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().expect("state lock should not be poisoned");
        state.sets.get(key).map(|set| set.keys().cloned().collect()).unwrap_or_default()
    }

    /// Drop a member everywhere, simulating an external release or expiry
    /// reclamation by another process.
    pub fn evict_member(&self, member: &str) {
        let mut state = self.state.lock().expect("state lock should not be poisoned");
        for set in state.sets.values_mut() {
            set.remove(member);
        }
    }

    fn note_invocation(&self, script: &'static str) {
        *self
            .invocations
            .lock()
            .expect("invocation lock should not be poisoned")
            .entry(script)
            .or_insert(0) += 1;
    }

    fn run_acquire(state: &mut LedgerState, keys: &[String], args: &[String]) -> Value {
        let now: i64 = args[0].parse().expect("now_ms should be numeric");
        let expires: i64 = args[1].parse().expect("expires_ms should be numeric");
        let permit_id = args[2].clone();
        let capacity: i64 = args[3].parse().expect("capacity should be numeric");
        let tenant_quota: i64 = args[4].parse().expect("tenant_quota should be numeric");

        for key in keys {
            let set = state.sets.entry(key.clone()).or_default();
            set.retain(|_, score| *score > now);
        }

        let global_count = state.sets.get(&keys[0]).map_or(0, |set| set.len() as i64);
        if global_count >= capacity {
            return int_array(&[1, global_count, 0]);
        }

        let mut tenant_count = 0;
        if keys.len() > 1 {
            tenant_count = state.sets.get(&keys[1]).map_or(0, |set| set.len() as i64);
            if tenant_count >= tenant_quota {
                return int_array(&[2, global_count, tenant_count]);
            }
        }

        for key in keys {
            state.sets.entry(key.clone()).or_default().insert(permit_id.clone(), expires);
        }
        let tenant_count = if keys.len() > 1 { tenant_count + 1 } else { 0 };
        int_array(&[0, global_count + 1, tenant_count])
    }

    fn run_release(state: &mut LedgerState, keys: &[String], args: &[String]) -> Value {
        let permit_id = &args[0];
        let removed = state
            .sets
            .get_mut(&keys[0])
            .map_or(false, |set| set.remove(permit_id).is_some());
        if keys.len() > 1 {
            if let Some(set) = state.sets.get_mut(&keys[1]) {
                set.remove(permit_id);
            }
        }
        if removed {
            int_array(&[0, 1])
        } else {
            int_array(&[3, 0])
        }
    }

    fn run_extend(state: &mut LedgerState, keys: &[String], args: &[String]) -> Value {
        let now: i64 = args[0].parse().expect("now_ms should be numeric");
        let expires: i64 = args[1].parse().expect("new_expires_ms should be numeric");
        let permit_id = &args[2];

        let live = state
            .sets
            .get(&keys[0])
            .and_then(|set| set.get(permit_id))
            .is_some_and(|score| *score > now);
        if !live {
            for key in keys {
                if let Some(set) = state.sets.get_mut(key) {
                    set.remove(permit_id);
                }
            }
            return int_array(&[3]);
        }

        for key in keys {
            if let Some(score) = state.sets.get_mut(key).and_then(|set| set.get_mut(permit_id)) {
                *score = expires;
            }
        }
        int_array(&[0])
    }

    fn run_query(state: &LedgerState, keys: &[String], args: &[String]) -> Value {
        let now: i64 = args[0].parse().expect("now_ms should be numeric");
        let count = |key: &String| {
            state.sets.get(key).map_or(0, |set| {
                set.values().filter(|score| **score > now).count() as i64
            })
        };
        let global_count = count(&keys[0]);
        let tenant_count = if keys.len() > 1 { count(&keys[1]) } else { 0 };
        int_array(&[global_count, tenant_count])
    }
}

fn int_array(values: &[i64]) -> Value {
    Value::Array(values.iter().map(|v| Value::Int(*v)).collect())
}

#[async_trait]
impl ScriptRunner for FakeLedgerRunner {
    async fn invoke(
        &self,
        script: &SemScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, RedisError> {
        if let Some(failure) = *self.failure.lock().expect("failure lock should not be poisoned") {
            return Err(failure.to_error());
        }
        self.note_invocation(script.name);

        let mut state = self.state.lock().expect("state lock should not be poisoned");
        let value = match script.name {
            "acquire" => Self::run_acquire(&mut state, keys, args),
            "release" => Self::run_release(&mut state, keys, args),
            "extend" => Self::run_extend(&mut state, keys, args),
            "query" => Self::run_query(&state, keys, args),
            other => panic!("unexpected script {other}"),
        };
        Ok(value)
    }

    async fn ping(&self) -> Result<(), RedisError> {
        if let Some(failure) = *self.failure.lock().expect("failure lock should not be poisoned") {
            return Err(failure.to_error());
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Recording meter ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub instrument: &'static str,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

impl MetricEvent {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct EventSink {
    events: Mutex<Vec<MetricEvent>>,
}

/// Meter capturing every measurement for assertions.
#[derive(Default, Clone)]
pub struct RecordingMeter {
    sink: Arc<EventSink>,
}

impl RecordingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.sink.events.lock().expect("event lock should not be poisoned").clone()
    }

    /// Sum of counter increments for one instrument.
    pub fn counter_total(&self, instrument: &str) -> u64 {
        self.events()
            .iter()
            .filter(|event| event.instrument == instrument)
            .map(|event| event.value as u64)
            .sum()
    }

    pub fn events_for(&self, instrument: &str) -> Vec<MetricEvent> {
        self.events().into_iter().filter(|event| event.instrument == instrument).collect()
    }
}

struct RecordingInstrument {
    instrument: &'static str,
    sink: Arc<EventSink>,
}

impl RecordingInstrument {
    fn push(&self, value: f64, labels: &[Label<'_>]) {
        let owned = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.sink
            .events
            .lock()
            .expect("event lock should not be poisoned")
            .push(MetricEvent { instrument: self.instrument, value, labels: owned });
    }
}

impl Counter for RecordingInstrument {
    fn add(&self, value: u64, labels: &[Label<'_>]) {
        self.push(value as f64, labels);
    }
}

impl Histogram for RecordingInstrument {
    fn record(&self, value: f64, labels: &[Label<'_>]) {
        self.push(value, labels);
    }
}

impl Meter for RecordingMeter {
    fn counter(&self, name: &'static str) -> Arc<dyn Counter> {
        Arc::new(RecordingInstrument { instrument: name, sink: Arc::clone(&self.sink) })
    }

    fn histogram(&self, name: &'static str, _boundaries: &'static [f64]) -> Arc<dyn Histogram> {
        Arc::new(RecordingInstrument { instrument: name, sink: Arc::clone(&self.sink) })
    }
}
