//! The ordered hook pipeline interposed on client and server RPC/event
//! lifecycle points (spec.md §4.6).
//!
//! Plugins receive a non-owning [`ClientHandle`] rather than holding
//! their own reference to the client, per spec.md §9's cyclic-reference
//! design note ("the client has exclusive ownership of transports and
//! plugins; plugins receive a non-owning client handle passed into each
//! hook invocation rather than stored").

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BusResult;

/// A non-owning reference to the running client, passed to every hook so
/// a plugin can, say, fire an auxiliary event without storing a cycle
/// back to the client that owns it.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<dyn ClientHandleOps>,
}

impl ClientHandle {
    /// Wrap `inner` for handing to plugins.
    #[must_use]
    pub fn new(inner: Arc<dyn ClientHandleOps>) -> Self {
        Self { inner }
    }

    /// The service name the running client was configured with.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.inner.service_name()
    }
}

/// The narrow surface a [`ClientHandle`] exposes to plugins. The client
/// runtime implements this; plugins never see the full client type.
pub trait ClientHandleOps: Send + Sync {
    /// The service name the running client was configured with.
    fn service_name(&self) -> &str;
}

/// Arguments passed to a hook invocation. Which fields are populated
/// depends on the hook name; unused fields are `None`/empty.
#[derive(Debug, Clone, Default)]
pub struct HookArgs {
    /// The API the hook fired for, if applicable.
    pub api_name: Option<String>,
    /// The procedure or event name, if applicable.
    pub member_name: Option<String>,
    /// Arbitrary extra context a specific hook attaches (e.g. the
    /// exception's message for the `exception` hook).
    pub extra: Value,
}

/// One named hook a [`Plugin`] may implement. All default to a no-op so
/// a plugin only needs to override the hooks it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Execution order among plugins implementing the same hook; lower
    /// runs first (spec.md §8 invariant 7).
    fn priority(&self) -> i32 {
        0
    }

    /// Before an RPC call is published.
    async fn before_rpc_call(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// After the caller has the result in hand.
    async fn after_rpc_call(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// Before a server dispatches a received call to its local handler.
    async fn before_rpc_execution(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// After the local handler has produced a [`crate::message::ResultMessage`].
    async fn after_rpc_execution(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// Before an event is published.
    async fn before_event_sent(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// After an event has been published.
    async fn after_event_sent(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// Before a consumed event is dispatched to its handler.
    async fn before_event_execution(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// After a consumed event's handler has run.
    async fn after_event_execution(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// Before the client opens its transports and starts consuming.
    async fn before_server_start(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// After the client has fully shut down.
    async fn after_server_stopped(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// Before dispatching, an opportunity to transform handler arguments.
    async fn receive_args(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }

    /// An otherwise-uncaught exception escaped a supervised task.
    async fn exception(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
        Ok(())
    }
}

macro_rules! hook_dispatch {
    ($name:ident) => {
        /// Run every plugin's `
        #[doc = stringify!($name)]
        /// ` hook in ascending priority order, awaiting each
        /// sequentially. A plugin that raises is logged and surfaced
        /// through the `exception` hook but does not abort the
        /// pipeline, per spec.md §4.6.
        pub async fn $name(&self, client: &ClientHandle, args: &HookArgs) {
            for plugin in &self.sorted {
                if let Err(err) = plugin.$name(client, args).await {
                    tracing::warn!(hook = stringify!($name), error = %err, "plugin hook failed");
                    self.notify_exception(client, &err).await;
                }
            }
        }
    };
}

/// An ordered collection of plugins, executed hook-by-hook in ascending
/// [`Plugin::priority`] order.
pub struct PluginPipeline {
    sorted: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    /// Build a pipeline from `plugins`, sorting by priority once up
    /// front rather than on every hook invocation.
    #[must_use]
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.priority());
        Self { sorted: plugins }
    }

    /// Notifies every plugin's `exception` hook that a supervised task
    /// failed outside the normal request/response path (a consumer loop
    /// dying, a fatal transport error). Failures from the hooks themselves
    /// are ignored, matching the non-aborting contract of every other hook.
    pub async fn notify_exception(&self, client: &ClientHandle, err: &crate::error::BusError) {
        let args = HookArgs {
            extra: Value::String(err.to_string()),
            ..HookArgs::default()
        };
        for plugin in &self.sorted {
            let _ = plugin.exception(client, &args).await;
        }
    }

    hook_dispatch!(before_rpc_call);
    hook_dispatch!(after_rpc_call);
    hook_dispatch!(before_rpc_execution);
    hook_dispatch!(after_rpc_execution);
    hook_dispatch!(before_event_sent);
    hook_dispatch!(after_event_sent);
    hook_dispatch!(before_event_execution);
    hook_dispatch!(after_event_execution);
    hook_dispatch!(before_server_start);
    hook_dispatch!(after_server_stopped);
    hook_dispatch!(receive_args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct OrderRecordingPlugin {
        priority: i32,
        order: Arc<Mutex<Vec<i32>>>,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for OrderRecordingPlugin {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn before_rpc_call(&self, _client: &ClientHandle, _args: &HookArgs) -> BusResult<()> {
            self.order.lock().unwrap().push(self.priority);
            if self.fail {
                return Err(crate::error::BusError::CannotBlockHere);
            }
            Ok(())
        }
    }

    struct StubHandle;
    impl ClientHandleOps for StubHandle {
        fn service_name(&self) -> &str {
            "test-service"
        }
    }

    #[tokio::test]
    async fn plugins_fire_in_ascending_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            Arc::new(OrderRecordingPlugin { priority: 5, order: order.clone(), fail: false }),
            Arc::new(OrderRecordingPlugin { priority: -1, order: order.clone(), fail: false }),
            Arc::new(OrderRecordingPlugin { priority: 2, order: order.clone(), fail: false }),
        ]);
        let client = ClientHandle::new(Arc::new(StubHandle));

        pipeline.before_rpc_call(&client, &HookArgs::default()).await;

        assert_eq!(*order.lock().unwrap(), vec![-1, 2, 5]);
    }

    #[tokio::test]
    async fn a_failing_plugin_does_not_abort_the_rest_of_the_pipeline() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            Arc::new(OrderRecordingPlugin { priority: 0, order: order.clone(), fail: true }),
            Arc::new(OrderRecordingPlugin { priority: 1, order: order.clone(), fail: false }),
        ]);
        let client = ClientHandle::new(Arc::new(StubHandle));

        pipeline.before_rpc_call(&client, &HookArgs::default()).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }
}
