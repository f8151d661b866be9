// Script execution seam.
//
// `RemoteSemaphore` talks to redis only through this trait, so tests can
// substitute an in-memory runner and exercise the full client path without a
// server. The production runner drives a `ConnectionManager`, which
// reconnects on its own and keeps `EVALSHA`-with-`NOSCRIPT`-reload handling
// inside `redis::Script`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Value};

use super::scripts::SemScript;

/// Executes one script invocation against the store.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn invoke(
        &self,
        script: &SemScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, RedisError>;

    /// Liveness probe (`PING`).
    async fn ping(&self) -> Result<(), RedisError>;
}

/// Production runner over a reconnecting multiplexed connection.
pub struct ConnectionRunner {
    conn: ConnectionManager,
}

impl ConnectionRunner {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(client: &redis::Client) -> Result<Self, RedisError> {
        Ok(Self { conn: client.get_connection_manager().await? })
    }
}

#[async_trait]
impl ScriptRunner for ConnectionRunner {
    async fn invoke(
        &self,
        script: &SemScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, RedisError> {
        let mut invocation = script.script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        let mut conn = self.conn.clone();
        let value: Value = invocation.invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
