//! The bus-side half of the distributed schema store (spec.md §6
//! "Schema on bus"): each API's schema document lives under a
//! transport-specific key, with a per-key TTL refreshed by
//! [`meshbus_core::schema::SchemaRegistry::monitor`].
//!
//! Grounded on `auth/src/stores/session_redis.rs`'s `set_ex`/TTL pattern
//! for the per-API document key, plus a small index set (`SADD`/`SREM`)
//! so [`meshbus_core::transport::SchemaTransport::load_all`] can
//! enumerate known APIs without a `KEYS`/`SCAN` sweep.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use meshbus_core::error::BusResult;
use meshbus_core::transport::{SchemaTransport, Transport};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use crate::connection::connect;
use crate::error::{RedisResult, RedisTransportError};

const SCHEMA_KEY_PREFIX: &str = "bus.schema";
const SCHEMA_INDEX_KEY: &str = "bus.schema:index";

fn schema_key(api_name: &str) -> String {
    format!("{SCHEMA_KEY_PREFIX}:{api_name}")
}

/// The TTL-keyed bus-side schema store.
pub struct RedisSchemaTransport {
    conn: ConnectionManager,
}

impl RedisSchemaTransport {
    /// Connect against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RedisTransportError::ConnectionFailed`] if the initial
    /// connection cannot be established.
    pub async fn connect(url: &str) -> RedisResult<Self> {
        Ok(Self { conn: connect(url).await? })
    }
}

#[async_trait]
impl Transport for RedisSchemaTransport {}

#[async_trait]
impl SchemaTransport for RedisSchemaTransport {
    async fn store(&self, api_name: &str, schema: &Value, ttl: Duration) -> BusResult<()> {
        let key = schema_key(api_name);
        let encoded = serde_json::to_string(schema).map_err(RedisTransportError::from)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(&key, encoded, ttl.as_secs().max(1))
            .await
            .map_err(RedisTransportError::from)
            .map_err(RedisTransportError::into_bus_error)?;
        let _: i64 = conn
            .sadd(SCHEMA_INDEX_KEY, api_name)
            .await
            .map_err(RedisTransportError::from)
            .map_err(RedisTransportError::into_bus_error)?;
        Ok(())
    }

    async fn ping(&self, api_name: &str, ttl: Duration) -> BusResult<()> {
        let key = schema_key(api_name);
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire(&key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(RedisTransportError::from)
            .map_err(RedisTransportError::into_bus_error)?;
        Ok(())
    }

    async fn load(&self, api_name: &str) -> BusResult<Option<Value>> {
        let key = schema_key(api_name);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(RedisTransportError::from)
            .map_err(RedisTransportError::into_bus_error)?;
        let Some(raw) = raw else {
            // Expired or never stored; drop it from the index too so
            // `load_all` doesn't keep tripping over a dead entry.
            let _: i64 = conn
                .srem(SCHEMA_INDEX_KEY, api_name)
                .await
                .map_err(RedisTransportError::from)
                .map_err(RedisTransportError::into_bus_error)?;
            return Ok(None);
        };
        let doc = serde_json::from_str(&raw).map_err(RedisTransportError::from).map_err(RedisTransportError::into_bus_error)?;
        Ok(Some(doc))
    }

    async fn load_all(&self) -> BusResult<HashMap<String, Value>> {
        let mut conn = self.conn.clone();
        let api_names: Vec<String> = conn
            .smembers(SCHEMA_INDEX_KEY)
            .await
            .map_err(RedisTransportError::from)
            .map_err(RedisTransportError::into_bus_error)?;
        let mut result = HashMap::new();
        for api_name in api_names {
            if let Some(doc) = self.load(&api_name).await? {
                result.insert(api_name, doc);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_key_is_namespaced_per_api() {
        assert_eq!(schema_key("auth"), "bus.schema:auth");
    }
}
