//! The distributed, TTL-refreshed per-API schema store.
//!
//! Storage-agnostic logic grounded on
//! `original_source/lightbus/schema/schema.py`'s `Schema` class: local
//! schemas (APIs this process hosts) are distinguished from remote
//! schemas (pulled from the bus), `monitor` re-pings local schemas and
//! reloads the remote set on a fixed interval, and `save_local`/
//! `load_local` support both a single-file and a per-API-file directory
//! layout with last-wins merge.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::api::ApiMeta;
use crate::error::{BusError, BusResult};
use crate::transport::SchemaTransport;

/// Default `max_age_seconds` when a caller doesn't override it, matching
/// `Schema.__init__`'s `max_age_seconds=60` default in `original_source/`.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

/// The storage-agnostic schema registry layered on a [`SchemaTransport`].
pub struct SchemaRegistry {
    transport: Arc<dyn SchemaTransport>,
    max_age: Duration,
    local: RwLock<HashMap<String, Value>>,
    remote: RwLock<HashMap<String, Value>>,
}

impl SchemaRegistry {
    /// Build a registry backed by `transport`, refreshing every local
    /// schema's TTL every `max_age.mul_f64(0.8)` seconds by default (see
    /// [`SchemaRegistry::monitor`]).
    #[must_use]
    pub fn new(transport: Arc<dyn SchemaTransport>, max_age: Duration) -> Self {
        Self {
            transport,
            max_age,
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
        }
    }

    /// Derive `api`'s schema document and register it as a locally
    /// hosted API, storing it on the bus immediately.
    ///
    /// # Errors
    ///
    /// Propagates [`BusError::InvalidApiForSchemaCreation`] from
    /// [`ApiMeta::to_schema_document`], or a transport error from the
    /// initial store.
    pub async fn add_api(&self, api: &ApiMeta) -> BusResult<()> {
        let doc = api.to_schema_document()?;
        self.local.write().await.insert(api.name.clone(), doc.clone());
        self.transport.store(&api.name, &doc, self.max_age).await
    }

    /// Whether `api_name` is known locally or remotely.
    pub async fn contains(&self, api_name: &str) -> bool {
        self.local.read().await.contains_key(api_name) || self.remote.read().await.contains_key(api_name)
    }

    /// The full schema document for `api_name`, local first, else remote.
    ///
    /// # Errors
    ///
    /// [`BusError::SchemaNotFound`] if neither map has it.
    pub async fn get_api_schema(&self, api_name: &str) -> BusResult<Value> {
        if let Some(doc) = self.local.read().await.get(api_name) {
            return Ok(doc.clone());
        }
        if let Some(doc) = self.remote.read().await.get(api_name) {
            return Ok(doc.clone());
        }
        Err(BusError::SchemaNotFound(api_name.to_string()))
    }

    /// The schema fragment for one event.
    ///
    /// # Errors
    ///
    /// [`BusError::SchemaNotFound`] if the API or the event is missing.
    pub async fn get_event_schema(&self, api_name: &str, event_name: &str) -> BusResult<Value> {
        let doc = self.get_api_schema(api_name).await?;
        doc["events"]
            .get(event_name)
            .cloned()
            .ok_or_else(|| BusError::SchemaNotFound(format!("{api_name}.{event_name}")))
    }

    /// The schema fragment for one procedure.
    ///
    /// # Errors
    ///
    /// [`BusError::SchemaNotFound`] if the API or the procedure is missing.
    pub async fn get_rpc_schema(&self, api_name: &str, procedure_name: &str) -> BusResult<Value> {
        let doc = self.get_api_schema(api_name).await?;
        doc["rpcs"]
            .get(procedure_name)
            .cloned()
            .ok_or_else(|| BusError::SchemaNotFound(format!("{api_name}.{procedure_name}")))
    }

    /// Look up `name` as either an event or a procedure on `api_name`,
    /// trying events first (matching the order in `original_source/`'s
    /// `get_event_or_rpc_schema`).
    ///
    /// # Errors
    ///
    /// [`BusError::SchemaNotFound`] if neither matches.
    pub async fn get_event_or_rpc_schema(&self, api_name: &str, name: &str) -> BusResult<Value> {
        if let Ok(schema) = self.get_event_schema(api_name, name).await {
            return Ok(schema);
        }
        self.get_rpc_schema(api_name, name).await
    }

    /// Validate `kwargs` against the stored parameter schema for
    /// `api_name.name` (a procedure or an event).
    ///
    /// # Errors
    ///
    /// [`BusError::ValidationError`] with a path-tagged message if
    /// `kwargs` does not conform.
    pub async fn validate_parameters(&self, api_name: &str, name: &str, kwargs: &Value) -> BusResult<()> {
        let schema = self.get_event_or_rpc_schema(api_name, name).await?;
        let parameters = &schema["parameters"];
        validate_against(parameters, kwargs, &format!("{api_name}.{name}.parameters"))
    }

    /// Validate a procedure's return value against its stored response
    /// schema.
    ///
    /// # Errors
    ///
    /// [`BusError::ValidationError`] with a path-tagged message if
    /// `value` does not conform.
    pub async fn validate_response(&self, api_name: &str, procedure_name: &str, value: &Value) -> BusResult<()> {
        let schema = self.get_rpc_schema(api_name, procedure_name).await?;
        let response = &schema["response"];
        validate_against(response, value, &format!("{api_name}.{procedure_name}.response"))
    }

    /// Re-push every locally hosted schema to the bus (used at startup
    /// and by [`SchemaRegistry::monitor`]).
    pub async fn save_to_bus(&self) -> BusResult<()> {
        for (api_name, doc) in self.local.read().await.iter() {
            self.transport.store(api_name, doc, self.max_age).await?;
        }
        Ok(())
    }

    /// Replace the remote schema map with whatever is currently on the
    /// bus.
    pub async fn load_from_bus(&self) -> BusResult<()> {
        let all = self.transport.load_all().await?;
        *self.remote.write().await = all;
        Ok(())
    }

    /// Run forever, re-pinging local schemas and reloading the remote
    /// set every `interval` (defaulting to `0.8 * max_age_seconds`, per
    /// `Schema.monitor`'s `interval = interval or max_age_seconds * 0.8`).
    /// Intended to run as one of the client runtime's supervised tasks;
    /// returns only on a fatal transport error.
    ///
    /// # Errors
    ///
    /// Propagates the first transport error from a ping or reload pass.
    pub async fn monitor(&self, interval: Option<Duration>) -> BusResult<()> {
        let interval = interval.unwrap_or_else(|| self.max_age.mul_f64(0.8));
        loop {
            tokio::time::sleep(interval).await;
            let local_names: Vec<String> = self.local.read().await.keys().cloned().collect();
            for api_name in local_names {
                self.transport.ping(&api_name, self.max_age).await?;
            }
            self.load_from_bus().await?;
        }
    }

    /// Export every locally hosted schema to `path`: a single JSON file
    /// if `path` ends in a file extension, otherwise one file per API in
    /// a directory (created if missing).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `path` cannot be written.
    pub async fn save_local(&self, path: &Path) -> BusResult<()> {
        let local = self.local.read().await;
        if path.extension().is_some() {
            let doc: serde_json::Map<String, Value> =
                local.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let encoded = serde_json::to_string_pretty(&doc).map_err(io_err)?;
            std::fs::write(path, encoded).map_err(|e| crate::error::transport_error(IoError(e)))
        } else {
            std::fs::create_dir_all(path).map_err(|e| crate::error::transport_error(IoError(e)))?;
            for (api_name, doc) in local.iter() {
                let file_name = make_file_safe_api_name(api_name);
                let encoded = serde_json::to_string_pretty(doc).map_err(io_err)?;
                std::fs::write(path.join(format!("{file_name}.json")), encoded)
                    .map_err(|e| crate::error::transport_error(IoError(e)))?;
            }
            Ok(())
        }
    }

    /// Import schemas from `path` into the remote map, merging
    /// last-wins across files when `path` is a directory (mirroring
    /// `Schema.load_local`'s `ChainMap` merge).
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON-decode error.
    pub async fn load_local(&self, path: &Path) -> BusResult<()> {
        let mut merged = HashMap::new();
        if path.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(path)
                .map_err(|e| crate::error::transport_error(IoError(e)))?
                .filter_map(Result::ok)
                .collect();
            entries.sort_by_key(std::fs::DirEntry::path);
            for entry in entries {
                let contents = std::fs::read_to_string(entry.path()).map_err(|e| crate::error::transport_error(IoError(e)))?;
                let doc: serde_json::Map<String, Value> = serde_json::from_str(&contents).map_err(io_err)?;
                for (k, v) in doc {
                    merged.insert(k, v);
                }
            }
        } else {
            let contents = std::fs::read_to_string(path).map_err(|e| crate::error::transport_error(IoError(e)))?;
            let doc: serde_json::Map<String, Value> = serde_json::from_str(&contents).map_err(io_err)?;
            for (k, v) in doc {
                merged.insert(k, v);
            }
        }
        self.remote.write().await.extend(merged);
        Ok(())
    }

    /// Every known API name, local and remote.
    pub async fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local.read().await.keys().cloned().collect();
        names.extend(self.remote.read().await.keys().cloned());
        names.sort();
        names.dedup();
        names
    }
}

fn validate_against(schema: &Value, instance: &Value, path: &str) -> BusResult<()> {
    let validator = jsonschema::validator_for(schema).map_err(|e| BusError::InvalidSchema {
        api: path.to_string(),
        reason: e.to_string(),
    })?;
    if let Err(err) = validator.validate(instance) {
        return Err(BusError::ValidationError {
            path: format!("{path}{}", err.instance_path),
            message: err.to_string(),
        });
    }
    Ok(())
}

fn make_file_safe_api_name(api_name: &str) -> String {
    api_name.replace(['.', '/', '\\'], "_")
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct IoError(#[from] std::io::Error);

fn io_err(e: serde_json::Error) -> BusError {
    crate::error::transport_error(JsonError(e))
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct JsonError(#[from] serde_json::Error);

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemorySchemaTransport {
        store: StdMutex<HashMap<String, Value>>,
    }

    #[async_trait]
    impl crate::transport::Transport for InMemorySchemaTransport {}

    #[async_trait]
    impl SchemaTransport for InMemorySchemaTransport {
        async fn store(&self, api_name: &str, schema: &Value, _ttl: Duration) -> BusResult<()> {
            self.store.lock().unwrap().insert(api_name.to_string(), schema.clone());
            Ok(())
        }

        async fn ping(&self, _api_name: &str, _ttl: Duration) -> BusResult<()> {
            Ok(())
        }

        async fn load(&self, api_name: &str) -> BusResult<Option<Value>> {
            Ok(self.store.lock().unwrap().get(api_name).cloned())
        }

        async fn load_all(&self) -> BusResult<HashMap<String, Value>> {
            Ok(self.store.lock().unwrap().clone())
        }
    }

    fn sample_api() -> ApiMeta {
        ApiMeta::builder("auth")
            .rpc(
                "check_password",
                serde_json::json!({"type": "object", "required": ["username"], "properties": {"username": {"type": "string"}}}),
                serde_json::json!({"type": "boolean"}),
            )
            .event(
                "user_created",
                serde_json::json!({"type": "object", "required": ["user_id"]}),
            )
            .build()
    }

    #[tokio::test]
    async fn add_api_then_validate_parameters_accepts_conforming_input() {
        let transport = Arc::new(InMemorySchemaTransport::default());
        let registry = SchemaRegistry::new(transport, DEFAULT_MAX_AGE);
        registry.add_api(&sample_api()).await.unwrap();

        let ok = registry
            .validate_parameters("auth", "check_password", &serde_json::json!({"username": "alice"}))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn validate_parameters_rejects_nonconforming_input() {
        let transport = Arc::new(InMemorySchemaTransport::default());
        let registry = SchemaRegistry::new(transport, DEFAULT_MAX_AGE);
        registry.add_api(&sample_api()).await.unwrap();

        let err = registry
            .validate_parameters("auth", "check_password", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn validate_parameters_falls_back_from_event_to_rpc_lookup() {
        let transport = Arc::new(InMemorySchemaTransport::default());
        let registry = SchemaRegistry::new(transport, DEFAULT_MAX_AGE);
        registry.add_api(&sample_api()).await.unwrap();

        let ok = registry
            .validate_parameters("auth", "user_created", &serde_json::json!({"user_id": "1"}))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn unknown_api_is_schema_not_found() {
        let transport = Arc::new(InMemorySchemaTransport::default());
        let registry = SchemaRegistry::new(transport, DEFAULT_MAX_AGE);
        let err = registry.get_api_schema("nope").await.unwrap_err();
        assert_eq!(err.kind(), "SchemaNotFound");
    }

    #[tokio::test]
    async fn save_local_then_load_local_round_trips_into_remote_map() {
        let transport = Arc::new(InMemorySchemaTransport::default());
        let registry = SchemaRegistry::new(transport, DEFAULT_MAX_AGE);
        registry.add_api(&sample_api()).await.unwrap();

        let dir = std::env::temp_dir().join(format!("meshbus-schema-test-{}", std::process::id()));
        registry.save_local(&dir).await.unwrap();

        let transport2 = Arc::new(InMemorySchemaTransport::default());
        let registry2 = SchemaRegistry::new(transport2, DEFAULT_MAX_AGE);
        registry2.load_local(&dir).await.unwrap();

        assert!(registry2.contains("auth").await);
        std::fs::remove_dir_all(&dir).ok();
    }
}
