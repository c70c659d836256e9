use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, RedisError, Script};

use super::{KeyValueStore, RedisStoreConfig, StoreError, ttl_millis};

/// Deletes `KEYS[1]` only if it still holds `ARGV[1]`.
///
/// Evaluated server-side so that no other client can slip in between the comparison and the
/// deletion.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::Connection(err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            Self::Unexpected(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

/// A [`KeyValueStore`] backed by a Redis server.
///
/// Uses a multiplexed [`ConnectionManager`] which transparently reconnects after the connection
/// broke. Requests issued while disconnected fail with [`StoreError::Connection`].
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Connects to the Redis server at `url` with default timeouts.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(&RedisStoreConfig::new(url)).await
    }

    /// Connects to the configured Redis server.
    ///
    /// Every command is bounded by the configured response timeout, so a hung server surfaces
    /// as [`StoreError::Connection`].
    pub async fn connect_with(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| StoreError::Connection(format!("invalid redis URL: {err}")))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connect_timeout)
            .set_response_timeout(config.response_timeout);
        let connection = ConnectionManager::new_with_config(client, manager_config).await?;

        Ok(Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }

    fn connection(&self) -> ConnectionManager {
        // `ConnectionManager` is a cheap handle onto the shared multiplexed connection.
        self.connection.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        // `SET NX` replies `OK` when the value was written, and nil when the key existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        match deleted {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StoreError::Unexpected(format!(
                "compare-and-delete returned {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url() {
        let err = RedisStore::connect("not a redis url").await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[test]
    fn test_error_classification() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(StoreError::from(io), StoreError::Connection(_)));

        let type_error = RedisError::from((redis::ErrorKind::TypeError, "bad type"));
        assert!(matches!(
            StoreError::from(type_error),
            StoreError::Unexpected(_)
        ));

        let response = RedisError::from((redis::ErrorKind::ResponseError, "ERR"));
        assert!(matches!(StoreError::from(response), StoreError::Protocol(_)));
    }
}
