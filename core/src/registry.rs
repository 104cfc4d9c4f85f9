//! API → transport resolution, with a `default` fallback per capability.
//!
//! Grounded closely on `original_source/lightbus/transports/base.py`'s
//! `TransportRegistry` class: a `_RegistryEntry`-equivalent per API name
//! holding up to three transport references, plus a process-level
//! schema transport singleton, and recursive fallback to the `"default"`
//! entry when an API has no specific binding.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BusConfig, TransportSelector};
use crate::error::{BusError, BusResult};
use crate::transport::{EventTransport, ResultTransport, RpcTransport, SchemaTransport, Transport};

/// The key under which an API-agnostic fallback transport is registered,
/// per spec.md §3 "Invariant: resolution for API `a` ... else
/// `entry["default"].X`".
pub const DEFAULT_API: &str = "default";

#[derive(Default)]
struct RegistryEntry {
    rpc: Option<Arc<dyn RpcTransport>>,
    result: Option<Arc<dyn ResultTransport>>,
    event: Option<Arc<dyn EventTransport>>,
}

/// Which of the four capabilities a resolution failure was for; used
/// only for the error message's `capability` field.
const CAP_RPC: &str = "rpc";
const CAP_RESULT: &str = "result";
const CAP_EVENT: &str = "event";
const CAP_SCHEMA: &str = "schema";

/// Turns one named [`TransportSelector`] branch into concrete transport
/// instances for [`TransportRegistry::load_config`]. Implemented by a
/// transport crate (`meshbus-redis`) so this crate stays
/// transport-agnostic; `load_config` itself only knows how to walk a
/// [`BusConfig`] and cache/bind whatever the factory builds.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build the RPC capability for `selector`.
    async fn build_rpc(&self, selector: &TransportSelector) -> BusResult<Arc<dyn RpcTransport>>;

    /// Build the result capability for `selector`.
    async fn build_result(&self, selector: &TransportSelector) -> BusResult<Arc<dyn ResultTransport>>;

    /// Build the event capability for `selector`.
    async fn build_event(&self, selector: &TransportSelector) -> BusResult<Arc<dyn EventTransport>>;

    /// Build the schema capability for `selector`.
    async fn build_schema(&self, selector: &TransportSelector) -> BusResult<Arc<dyn SchemaTransport>>;
}

/// Resolves, for any API name, the transport that should carry each of
/// its four capabilities.
#[derive(Default)]
pub struct TransportRegistry {
    entries: HashMap<String, RegistryEntry>,
    schema_transport: Option<Arc<dyn SchemaTransport>>,
}

impl TransportRegistry {
    /// An empty registry with no bindings at all.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `api_name`'s RPC transport. Use [`DEFAULT_API`] to set the
    /// fallback used by every API with no specific binding.
    pub fn set_rpc_transport(&mut self, api_name: impl Into<String>, transport: Arc<dyn RpcTransport>) {
        self.entries.entry(api_name.into()).or_default().rpc = Some(transport);
    }

    /// Bind `api_name`'s result transport.
    pub fn set_result_transport(&mut self, api_name: impl Into<String>, transport: Arc<dyn ResultTransport>) {
        self.entries.entry(api_name.into()).or_default().result = Some(transport);
    }

    /// Bind `api_name`'s event transport.
    pub fn set_event_transport(&mut self, api_name: impl Into<String>, transport: Arc<dyn EventTransport>) {
        self.entries.entry(api_name.into()).or_default().event = Some(transport);
    }

    /// Set the process-level schema transport singleton. Unlike the
    /// other three capabilities this is not per-API: spec.md §3 calls it
    /// "a process-level `schema_transport` singleton".
    pub fn set_schema_transport(&mut self, transport: Arc<dyn SchemaTransport>) {
        self.schema_transport = Some(transport);
    }

    /// Walk `cfg`, instantiating and binding the configured transport for
    /// every entry via `factory` (spec.md §4.4 `load_config`): the
    /// `"default"` entry in `cfg.transports`, if present, is built once
    /// and bound as the fallback for all three per-API capabilities; an
    /// API's `<capability>_transport` name, if set, overrides that
    /// default for that capability alone. A named selector referenced by
    /// more than one API/capability is built only once and shared.
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if an API names a transport with
    /// no matching entry in `cfg.transports`; otherwise propagates the
    /// first `factory` build failure.
    pub async fn load_config(&mut self, cfg: &BusConfig, factory: &dyn TransportFactory) -> BusResult<()> {
        let mut rpc_cache: HashMap<String, Arc<dyn RpcTransport>> = HashMap::new();
        let mut result_cache: HashMap<String, Arc<dyn ResultTransport>> = HashMap::new();
        let mut event_cache: HashMap<String, Arc<dyn EventTransport>> = HashMap::new();

        if let Some(selector) = cfg.transports.get(DEFAULT_API) {
            let rpc = factory.build_rpc(selector).await?;
            rpc_cache.insert(DEFAULT_API.to_string(), Arc::clone(&rpc));
            self.set_rpc_transport(DEFAULT_API, rpc);

            let result = factory.build_result(selector).await?;
            result_cache.insert(DEFAULT_API.to_string(), Arc::clone(&result));
            self.set_result_transport(DEFAULT_API, result);

            let event = factory.build_event(selector).await?;
            event_cache.insert(DEFAULT_API.to_string(), Arc::clone(&event));
            self.set_event_transport(DEFAULT_API, event);
        }

        for (api_name, api_cfg) in &cfg.apis {
            if let Some(name) = &api_cfg.rpc_transport {
                let transport = match rpc_cache.get(name) {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let selector = cfg.transports.get(name).ok_or_else(|| BusError::TransportNotFound {
                            api: Some(api_name.clone()),
                            capability: CAP_RPC,
                        })?;
                        let built = factory.build_rpc(selector).await?;
                        rpc_cache.insert(name.clone(), Arc::clone(&built));
                        built
                    }
                };
                self.set_rpc_transport(api_name.clone(), transport);
            }

            if let Some(name) = &api_cfg.result_transport {
                let transport = match result_cache.get(name) {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let selector = cfg.transports.get(name).ok_or_else(|| BusError::TransportNotFound {
                            api: Some(api_name.clone()),
                            capability: CAP_RESULT,
                        })?;
                        let built = factory.build_result(selector).await?;
                        result_cache.insert(name.clone(), Arc::clone(&built));
                        built
                    }
                };
                self.set_result_transport(api_name.clone(), transport);
            }

            if let Some(name) = &api_cfg.event_transport {
                let transport = match event_cache.get(name) {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let selector = cfg.transports.get(name).ok_or_else(|| BusError::TransportNotFound {
                            api: Some(api_name.clone()),
                            capability: CAP_EVENT,
                        })?;
                        let built = factory.build_event(selector).await?;
                        event_cache.insert(name.clone(), Arc::clone(&built));
                        built
                    }
                };
                self.set_event_transport(api_name.clone(), transport);
            }
        }

        if let Some(selector) = &cfg.schema_transport {
            self.set_schema_transport(factory.build_schema(selector).await?);
        }

        Ok(())
    }

    fn resolve<'a, T: ?Sized>(
        &'a self,
        api_name: &str,
        capability: &'static str,
        pick: impl Fn(&'a RegistryEntry) -> Option<&'a Arc<T>>,
    ) -> BusResult<Arc<T>> {
        if let Some(found) = self.entries.get(api_name).and_then(&pick) {
            return Ok(Arc::clone(found));
        }
        if api_name != DEFAULT_API {
            if let Some(found) = self.entries.get(DEFAULT_API).and_then(&pick) {
                return Ok(Arc::clone(found));
            }
        }
        Err(BusError::TransportNotFound {
            api: Some(api_name.to_string()),
            capability,
        })
    }

    /// Resolve `api_name`'s RPC transport, falling back to `default`.
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if neither a specific nor a
    /// `default` binding exists.
    pub fn get_rpc_transport(&self, api_name: &str) -> BusResult<Arc<dyn RpcTransport>> {
        self.resolve(api_name, CAP_RPC, |e| e.rpc.as_ref())
    }

    /// Resolve `api_name`'s result transport, falling back to `default`.
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if neither binding exists.
    pub fn get_result_transport(&self, api_name: &str) -> BusResult<Arc<dyn ResultTransport>> {
        self.resolve(api_name, CAP_RESULT, |e| e.result.as_ref())
    }

    /// Resolve `api_name`'s event transport, falling back to `default`.
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if neither binding exists.
    pub fn get_event_transport(&self, api_name: &str) -> BusResult<Arc<dyn EventTransport>> {
        self.resolve(api_name, CAP_EVENT, |e| e.event.as_ref())
    }

    /// Resolve the schema transport singleton.
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if none was ever set.
    pub fn get_schema_transport(&self) -> BusResult<Arc<dyn SchemaTransport>> {
        self.schema_transport.clone().ok_or(BusError::TransportNotFound {
            api: None,
            capability: CAP_SCHEMA,
        })
    }

    /// Whether any RPC transport is bound for `api_name` (specific or
    /// `default`).
    #[must_use]
    pub fn has_rpc_transport(&self, api_name: &str) -> bool {
        self.get_rpc_transport(api_name).is_ok()
    }

    /// Whether any event transport is bound for `api_name`.
    #[must_use]
    pub fn has_event_transport(&self, api_name: &str) -> bool {
        self.get_event_transport(api_name).is_ok()
    }

    /// Group `apis` by the concrete event transport instance that serves
    /// them, so the client runtime can run one `consume` loop per
    /// distinct transport rather than one per API (spec.md §4.5,
    /// `get_X_transports`).
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if any of `apis` has no event
    /// transport binding.
    pub fn get_event_transports(
        &self,
        apis: &[String],
    ) -> BusResult<Vec<(Arc<dyn EventTransport>, Vec<String>)>> {
        group_by_instance(apis, |api| self.get_event_transport(api))
    }

    /// Group `apis` by the concrete RPC transport instance that serves
    /// them.
    ///
    /// # Errors
    ///
    /// [`BusError::TransportNotFound`] if any of `apis` has no RPC
    /// transport binding.
    pub fn get_rpc_transports(
        &self,
        apis: &[String],
    ) -> BusResult<Vec<(Arc<dyn RpcTransport>, Vec<String>)>> {
        group_by_instance(apis, |api| self.get_rpc_transport(api))
    }

    /// Every API name with an explicit (non-`default`) binding for any
    /// capability.
    #[must_use]
    pub fn bound_api_names(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|name| name.as_str() != DEFAULT_API)
            .cloned()
            .collect()
    }

    fn distinct_rpc_transports(&self) -> Vec<Arc<dyn RpcTransport>> {
        dedup_by_identity(self.entries.values().filter_map(|e| e.rpc.clone()))
    }

    fn distinct_result_transports(&self) -> Vec<Arc<dyn ResultTransport>> {
        dedup_by_identity(self.entries.values().filter_map(|e| e.result.clone()))
    }

    fn distinct_event_transports(&self) -> Vec<Arc<dyn EventTransport>> {
        dedup_by_identity(self.entries.values().filter_map(|e| e.event.clone()))
    }

    /// Open every distinct transport bound in this registry exactly
    /// once, deduplicated by instance identity (spec.md §4.4
    /// `get_all_transports`), in rpc → result → event → schema order.
    ///
    /// # Errors
    ///
    /// Propagates the first transport's `open` failure.
    pub async fn open_all(&self) -> BusResult<()> {
        for transport in self.distinct_rpc_transports() {
            transport.open().await?;
        }
        for transport in self.distinct_result_transports() {
            transport.open().await?;
        }
        for transport in self.distinct_event_transports() {
            transport.open().await?;
        }
        if let Some(schema) = &self.schema_transport {
            schema.open().await?;
        }
        Ok(())
    }

    /// Close every distinct transport bound in this registry, in the
    /// reverse of `open_all`'s order (spec.md §4.5 "closes transports in
    /// reverse dependency order").
    ///
    /// # Errors
    ///
    /// Propagates the first transport's `close` failure; later
    /// transports are still attempted is left to the caller, which may
    /// choose to call `close_all` again or close individually.
    pub async fn close_all(&self) -> BusResult<()> {
        if let Some(schema) = &self.schema_transport {
            schema.close().await?;
        }
        for transport in self.distinct_event_transports() {
            transport.close().await?;
        }
        for transport in self.distinct_result_transports() {
            transport.close().await?;
        }
        for transport in self.distinct_rpc_transports() {
            transport.close().await?;
        }
        Ok(())
    }
}

/// Deduplicates an iterator of `Arc<T>` by pointer identity, preserving
/// first-seen order.
fn dedup_by_identity<T: ?Sized>(items: impl Iterator<Item = Arc<T>>) -> Vec<Arc<T>> {
    let mut result: Vec<Arc<T>> = Vec::new();
    for item in items {
        if !result.iter().any(|existing| Arc::ptr_eq(existing, &item)) {
            result.push(item);
        }
    }
    result
}

/// Groups `apis` by transport instance using pointer identity, so two
/// APIs sharing the `default` transport are served by one consume loop
/// instead of two. Mirrors `TransportRegistry._get_transports` in
/// `original_source/lightbus/transports/base.py`.
fn group_by_instance<T: ?Sized>(
    apis: &[String],
    resolve_one: impl Fn(&str) -> BusResult<Arc<T>>,
) -> BusResult<Vec<(Arc<T>, Vec<String>)>> {
    let mut groups: Vec<(Arc<T>, Vec<String>)> = Vec::new();
    for api in apis {
        let transport = resolve_one(api)?;
        if let Some((_, names)) = groups
            .iter_mut()
            .find(|(existing, _)| Arc::ptr_eq(existing, &transport))
        {
            names.push(api.clone());
        } else {
            groups.push((transport, vec![api.clone()]));
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EventMessage, RpcMessage};
    use crate::transport::{
        CallOptions, ConsumeOptions, EventSelector, EventStream, RpcStream, SendEventOptions, Transport,
    };
    use async_trait::async_trait;

    struct StubEventTransport;

    #[async_trait]
    impl Transport for StubEventTransport {}

    #[async_trait]
    impl EventTransport for StubEventTransport {
        async fn send_event(&self, msg: EventMessage, _options: SendEventOptions) -> BusResult<EventMessage> {
            Ok(msg)
        }

        async fn consume(&self, _listen_for: Vec<EventSelector>, _options: ConsumeOptions) -> BusResult<EventStream> {
            unimplemented!("not exercised in these tests")
        }

        async fn acknowledge(&self, _msgs: &[EventMessage]) -> BusResult<()> {
            Ok(())
        }

        async fn history(&self, _listen_for: Vec<EventSelector>) -> BusResult<EventStream> {
            unimplemented!("not exercised in these tests")
        }
    }

    struct StubRpcTransport(&'static str);

    #[async_trait]
    impl Transport for StubRpcTransport {}

    #[async_trait]
    impl RpcTransport for StubRpcTransport {
        async fn call_rpc(&self, msg: RpcMessage, _options: CallOptions) -> BusResult<RpcMessage> {
            Ok(msg)
        }

        fn get_return_path(&self, _msg: &RpcMessage) -> crate::message::ReturnPath {
            crate::message::ReturnPath(self.0.to_string())
        }

        async fn consume_rpcs(&self, _apis: Vec<String>) -> BusResult<RpcStream> {
            unimplemented!("not exercised in these tests")
        }
    }

    #[test]
    fn falls_back_to_default_when_no_specific_binding() {
        let mut registry = TransportRegistry::new();
        let default_transport: Arc<dyn EventTransport> = Arc::new(StubEventTransport);
        registry.set_event_transport(DEFAULT_API, Arc::clone(&default_transport));

        let resolved = registry.get_event_transport("auth").unwrap();
        assert!(Arc::ptr_eq(&resolved, &default_transport));
    }

    #[test]
    fn specific_binding_wins_over_default() {
        let mut registry = TransportRegistry::new();
        registry.set_event_transport(DEFAULT_API, Arc::new(StubEventTransport));
        let specific: Arc<dyn EventTransport> = Arc::new(StubEventTransport);
        registry.set_event_transport("auth", Arc::clone(&specific));

        let resolved = registry.get_event_transport("auth").unwrap();
        assert!(Arc::ptr_eq(&resolved, &specific));
    }

    #[test]
    fn missing_binding_is_transport_not_found() {
        let registry = TransportRegistry::new();
        let err = registry.get_event_transport("auth").unwrap_err();
        assert_eq!(err.kind(), "TransportNotFound");
    }

    #[test]
    fn apis_sharing_a_transport_are_grouped_together() {
        let mut registry = TransportRegistry::new();
        let shared: Arc<dyn RpcTransport> = Arc::new(StubRpcTransport("shared"));
        registry.set_rpc_transport("auth", Arc::clone(&shared));
        registry.set_rpc_transport("billing", Arc::clone(&shared));
        registry.set_rpc_transport("reporting", Arc::new(StubRpcTransport("other")));

        let groups = registry
            .get_rpc_transports(&["auth".to_string(), "billing".to_string(), "reporting".to_string()])
            .unwrap();

        assert_eq!(groups.len(), 2);
        let shared_group = groups.iter().find(|(t, _)| Arc::ptr_eq(t, &shared)).unwrap();
        assert_eq!(shared_group.1, vec!["auth".to_string(), "billing".to_string()]);
    }

    struct CountingEventTransport {
        opens: std::sync::atomic::AtomicUsize,
        closes: std::sync::atomic::AtomicUsize,
    }

    impl CountingEventTransport {
        fn new() -> Self {
            Self {
                opens: std::sync::atomic::AtomicUsize::new(0),
                closes: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for CountingEventTransport {
        async fn open(&self) -> BusResult<()> {
            self.opens.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> BusResult<()> {
            self.closes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl EventTransport for CountingEventTransport {
        async fn send_event(&self, msg: EventMessage, _options: SendEventOptions) -> BusResult<EventMessage> {
            Ok(msg)
        }

        async fn consume(&self, _listen_for: Vec<EventSelector>, _options: ConsumeOptions) -> BusResult<EventStream> {
            unimplemented!("not exercised in these tests")
        }

        async fn acknowledge(&self, _msgs: &[EventMessage]) -> BusResult<()> {
            Ok(())
        }

        async fn history(&self, _listen_for: Vec<EventSelector>) -> BusResult<EventStream> {
            unimplemented!("not exercised in these tests")
        }
    }

    struct CountingRpcFactory {
        rpc_builds: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TransportFactory for CountingRpcFactory {
        async fn build_rpc(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn RpcTransport>> {
            self.rpc_builds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Arc::new(StubRpcTransport("built")))
        }

        async fn build_result(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn ResultTransport>> {
            unimplemented!("not exercised in this test")
        }

        async fn build_event(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn EventTransport>> {
            Ok(Arc::new(StubEventTransport))
        }

        async fn build_schema(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn SchemaTransport>> {
            unimplemented!("not exercised in this test")
        }
    }

    #[tokio::test]
    async fn load_config_binds_default_and_caches_shared_named_overrides() {
        use crate::config::{ApiConfig, BusConfig, RedisTransportConfig};

        let mut cfg = BusConfig::default();
        cfg.transports
            .insert(DEFAULT_API.to_string(), TransportSelector::Redis(RedisTransportConfig::default()));
        cfg.transports
            .insert("billing-rpc".to_string(), TransportSelector::Redis(RedisTransportConfig::default()));
        cfg.apis.insert(
            "billing".to_string(),
            ApiConfig {
                rpc_transport: Some("billing-rpc".to_string()),
                ..ApiConfig::default()
            },
        );
        cfg.apis.insert(
            "reporting".to_string(),
            ApiConfig {
                rpc_transport: Some("billing-rpc".to_string()),
                ..ApiConfig::default()
            },
        );

        let factory = CountingRpcFactory {
            rpc_builds: std::sync::atomic::AtomicUsize::new(0),
        };
        let mut registry = TransportRegistry::new();
        registry.load_config(&cfg, &factory).await.unwrap();

        // "auth" has no override; it resolves through the "default" entry
        // load_config also bound.
        assert!(registry.get_event_transport("auth").is_ok());

        // One build for "default", one (shared) build for "billing-rpc".
        assert_eq!(factory.rpc_builds.load(std::sync::atomic::Ordering::SeqCst), 2);

        let billing = registry.get_rpc_transport("billing").unwrap();
        let reporting = registry.get_rpc_transport("reporting").unwrap();
        assert!(Arc::ptr_eq(&billing, &reporting));
    }

    struct NoopFactory;

    #[async_trait]
    impl TransportFactory for NoopFactory {
        async fn build_rpc(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn RpcTransport>> {
            unimplemented!("not exercised in this test")
        }

        async fn build_result(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn ResultTransport>> {
            unimplemented!("not exercised in this test")
        }

        async fn build_event(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn EventTransport>> {
            unimplemented!("not exercised in this test")
        }

        async fn build_schema(&self, _selector: &TransportSelector) -> BusResult<Arc<dyn SchemaTransport>> {
            unimplemented!("not exercised in this test")
        }
    }

    #[tokio::test]
    async fn load_config_fails_when_an_api_names_an_unknown_transport() {
        use crate::config::{ApiConfig, BusConfig};

        let mut cfg = BusConfig::default();
        cfg.apis.insert(
            "billing".to_string(),
            ApiConfig {
                rpc_transport: Some("missing".to_string()),
                ..ApiConfig::default()
            },
        );

        let mut registry = TransportRegistry::new();
        let err = registry.load_config(&cfg, &NoopFactory).await.unwrap_err();
        assert_eq!(err.kind(), "TransportNotFound");
    }

    #[tokio::test]
    async fn open_all_and_close_all_touch_each_distinct_transport_once() {
        let mut registry = TransportRegistry::new();
        let shared = Arc::new(CountingEventTransport::new());
        registry.set_event_transport(DEFAULT_API, shared.clone() as Arc<dyn EventTransport>);
        registry.set_event_transport("auth", shared.clone() as Arc<dyn EventTransport>);

        registry.open_all().await.unwrap();
        registry.open_all().await.unwrap();
        assert_eq!(shared.opens.load(std::sync::atomic::Ordering::SeqCst), 2);

        registry.close_all().await.unwrap();
        assert_eq!(shared.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
