//! The redis-side half of `load_config` (spec.md §4.4): turns a
//! [`TransportSelector`] branch into the concrete Redis transports
//! [`meshbus_core::registry::TransportRegistry::load_config`] binds.
//!
//! `TransportSelector` has exactly one variant today
//! ([`TransportSelector::Redis`]), so [`RedisTransportFactory`] is a
//! unit struct; a future transport kind would get its own factory crate
//! rather than a branch added here.

use std::sync::Arc;

use async_trait::async_trait;
use meshbus_core::config::{ApiConfig, TransportSelector};
use meshbus_core::error::BusResult;
use meshbus_core::registry::TransportFactory;
use meshbus_core::transport::{EventTransport, ResultTransport, RpcTransport, SchemaTransport};

use crate::error::RedisTransportError;
use crate::event::{DecodeErrorPolicy, RedisEventTransport};
use crate::rpc::{RedisResultTransport, RedisRpcTransport};
use crate::schema::RedisSchemaTransport;

/// Instantiates Redis transports for [`TransportRegistry::load_config`].
///
/// [`TransportRegistry::load_config`]: meshbus_core::registry::TransportRegistry::load_config
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisTransportFactory;

#[async_trait]
impl TransportFactory for RedisTransportFactory {
    async fn build_rpc(&self, selector: &TransportSelector) -> BusResult<Arc<dyn RpcTransport>> {
        let TransportSelector::Redis(cfg) = selector;
        let transport = RedisRpcTransport::connect(&cfg.url).await.map_err(RedisTransportError::into_bus_error)?;
        Ok(Arc::new(transport))
    }

    async fn build_result(&self, selector: &TransportSelector) -> BusResult<Arc<dyn ResultTransport>> {
        let TransportSelector::Redis(cfg) = selector;
        // `load_config` builds this capability once per named selector,
        // independent of any one API's `rpc_timeout`; callers
        // (`runtime::client`) pass their own per-call timeout through
        // `CallOptions`, so this default only matters if one never does.
        let default_timeout = ApiConfig::default().rpc_timeout;
        let transport = RedisResultTransport::connect(&cfg.url, default_timeout)
            .await
            .map_err(RedisTransportError::into_bus_error)?;
        Ok(Arc::new(transport))
    }

    async fn build_event(&self, selector: &TransportSelector) -> BusResult<Arc<dyn EventTransport>> {
        let TransportSelector::Redis(cfg) = selector;
        let transport = RedisEventTransport::from_config(cfg.clone(), DecodeErrorPolicy::default())
            .await
            .map_err(RedisTransportError::into_bus_error)?;
        Ok(Arc::new(transport))
    }

    async fn build_schema(&self, selector: &TransportSelector) -> BusResult<Arc<dyn SchemaTransport>> {
        let TransportSelector::Redis(cfg) = selector;
        let transport = RedisSchemaTransport::connect(&cfg.url).await.map_err(RedisTransportError::into_bus_error)?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_is_a_zero_sized_default_constructible_unit() {
        let _factory = RedisTransportFactory;
        assert_eq!(std::mem::size_of::<RedisTransportFactory>(), 0);
    }
}
