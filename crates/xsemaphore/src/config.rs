// Factory-level configuration.
//
// One builder covers the whole assembly: remote semaphore, optional fallback
// wrapper, and the collaborators (meter, id generator, callback) shared by
// both. Option setters store values verbatim; everything is validated once
// at `build()`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::fallback::{FallbackConfig, FallbackHook, FallbackSemaphore, FallbackStrategy};
use crate::id::{IdGenerator, UuidGenerator};
use crate::observe::{Meter, NoopMeter};
use crate::remote::{
    RemoteConfig, RemoteSemaphore, ScriptRunner, DEFAULT_KEY_PREFIX, DEFAULT_KEY_TTL_MARGIN,
};
use crate::semaphore::Semaphore;
use crate::validate::validate_key_prefix;

/// Builder for a fully assembled semaphore.
///
/// ```no_run
/// # async fn build() -> Result<(), xsemaphore::Error> {
/// use xsemaphore::{Builder, FallbackStrategy};
///
/// let client = redis::Client::open("redis://127.0.0.1/").expect("valid url");
/// let semaphore = Builder::new()
///     .with_client(client)
///     .with_pod_count(3)
///     .with_fallback(FallbackStrategy::Local)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Builder {
    client: Option<redis::Client>,
    key_prefix: String,
    key_ttl_margin: Duration,
    pod_count: u32,
    fallback: FallbackStrategy,
    default_timeout: Option<Duration>,
    meter: Arc<dyn Meter>,
    id_generator: Arc<dyn IdGenerator>,
    on_fallback: Option<FallbackHook>,
    disable_resource_label: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            client: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_ttl_margin: DEFAULT_KEY_TTL_MARGIN,
            pod_count: 1,
            fallback: FallbackStrategy::None,
            default_timeout: None,
            meter: Arc::new(NoopMeter),
            id_generator: Arc::new(UuidGenerator),
            on_fallback: None,
            disable_resource_label: false,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: redis::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_key_ttl_margin(mut self, margin: Duration) -> Self {
        self.key_ttl_margin = margin;
        self
    }

    /// Number of cooperating processes; the local fallback divides
    /// capacities by this.
    pub fn with_pod_count(mut self, pod_count: u32) -> Self {
        self.pod_count = pod_count;
        self
    }

    pub fn with_fallback(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback = strategy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_on_fallback(mut self, hook: FallbackHook) -> Self {
        self.on_fallback = Some(hook);
        self
    }

    /// Omit the `resource` metric label (high-cardinality safeguard).
    pub fn disable_resource_label(mut self) -> Self {
        self.disable_resource_label = true;
        self
    }

    /// Connect to the store and assemble the configured semaphore stack.
    pub async fn build(mut self) -> Result<Arc<dyn Semaphore>, Error> {
        self.validate()?;
        let client = self.client.take().ok_or(Error::MissingClient)?;
        let remote = RemoteSemaphore::connect(client, self.remote_config()).await?;
        self.assemble(remote)
    }

    /// Assemble over an explicit [`ScriptRunner`] instead of a live
    /// connection. No client handle is required.
    pub fn build_with_runner(self, runner: Arc<dyn ScriptRunner>) -> Result<Arc<dyn Semaphore>, Error> {
        self.validate()?;
        let remote = RemoteSemaphore::with_runner(runner, self.remote_config())?;
        self.assemble(remote)
    }

    fn validate(&self) -> Result<(), Error> {
        validate_key_prefix(&self.key_prefix)?;
        if self.pod_count == 0 {
            return Err(Error::InvalidPodCount);
        }
        Ok(())
    }

    fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            key_prefix: self.key_prefix.clone(),
            key_ttl_margin: self.key_ttl_margin,
            default_timeout: self.default_timeout,
            id_generator: Arc::clone(&self.id_generator),
            meter: Arc::clone(&self.meter),
            disable_resource_label: self.disable_resource_label,
        }
    }

    fn assemble(self, remote: RemoteSemaphore) -> Result<Arc<dyn Semaphore>, Error> {
        if self.fallback == FallbackStrategy::None {
            return Ok(Arc::new(remote));
        }

        let config = FallbackConfig {
            strategy: self.fallback,
            pod_count: self.pod_count,
            default_timeout: self.default_timeout,
            id_generator: self.id_generator,
            meter: self.meter,
            disable_resource_label: self.disable_resource_label,
            on_fallback: self.on_fallback,
        };
        Ok(Arc::new(FallbackSemaphore::new(remote, config)?))
    }
}
