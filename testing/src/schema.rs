//! An in-memory [`SchemaTransport`], identical in shape to the
//! `InMemorySchemaTransport` test double already embedded in
//! `meshbus_core::schema`'s own unit tests, but exported here so other
//! crates' tests (and downstream users) can reuse it instead of
//! re-writing it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meshbus_core::error::BusResult;
use meshbus_core::transport::{SchemaTransport, Transport};
use serde_json::Value;

struct Entry {
    doc: Value,
    expires_at: Instant,
}

/// A `HashMap`-backed schema store with TTL bookkeeping, so a test can
/// assert that an un-pinged schema expires without standing up Redis.
#[derive(Default)]
pub struct InMemorySchemaTransport {
    store: Mutex<HashMap<String, Entry>>,
}

impl InMemorySchemaTransport {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InMemorySchemaTransport {}

#[async_trait]
impl SchemaTransport for InMemorySchemaTransport {
    async fn store(&self, api_name: &str, schema: &Value, ttl: Duration) -> BusResult<()> {
        self.store.lock().unwrap().insert(
            api_name.to_string(),
            Entry {
                doc: schema.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn ping(&self, api_name: &str, ttl: Duration) -> BusResult<()> {
        if let Some(entry) = self.store.lock().unwrap().get_mut(api_name) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn load(&self, api_name: &str) -> BusResult<Option<Value>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .get(api_name)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.doc.clone()))
    }

    async fn load_all(&self) -> BusResult<HashMap<String, Value>> {
        let store = self.store.lock().unwrap();
        let now = Instant::now();
        Ok(store
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(name, entry)| (name.clone(), entry.doc.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_schema_is_loadable_before_ttl_elapses() {
        let transport = InMemorySchemaTransport::new();
        transport.store("auth", &serde_json::json!({"rpcs": {}}), Duration::from_secs(60)).await.unwrap();
        assert!(transport.load("auth").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_schema_is_absent() {
        let transport = InMemorySchemaTransport::new();
        transport.store("auth", &serde_json::json!({"rpcs": {}}), Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.load("auth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ping_refreshes_the_ttl() {
        let transport = InMemorySchemaTransport::new();
        transport.store("auth", &serde_json::json!({"rpcs": {}}), Duration::from_millis(20)).await.unwrap();
        transport.ping("auth", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(transport.load("auth").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn load_all_excludes_expired_entries() {
        let transport = InMemorySchemaTransport::new();
        transport.store("auth", &serde_json::json!({"rpcs": {}}), Duration::from_secs(60)).await.unwrap();
        transport.store("billing", &serde_json::json!({"rpcs": {}}), Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let all = transport.load_all().await.unwrap();
        assert!(all.contains_key("auth"));
        assert!(!all.contains_key("billing"));
    }
}
