//! The client runtime: lifecycle state machine, handler registration,
//! client-side `rpc`/`fire` calls, and the supervised background tasks
//! that drive a server's consume loops.
//!
//! `BusClient` is an `Arc<Self>`-held piece of shared state, mutated
//! through interior mutability and cloned into spawned tasks rather
//! than referenced by lifetime, so RPC consumers, event consumers, the
//! schema monitor and the signal handler can each own a handle to the
//! same client.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use meshbus_core::api::Api;
use meshbus_core::config::{ApiConfig, BusConfig};
use meshbus_core::error::{BusError, BusResult};
use meshbus_core::message::{EventMessage, Kwargs, ResultError, ResultMessage, ResultOutcome, RpcMessage};
use meshbus_core::plugin::{ClientHandle, ClientHandleOps, HookArgs, Plugin, PluginPipeline};
use meshbus_core::registry::TransportRegistry;
use meshbus_core::schema::SchemaRegistry;
use meshbus_core::transport::{
    CallOptions, ConsumeOptions, EventBatch, EventSelector, EventTransport, RpcTransport, SendEventOptions,
};

use crate::metrics::{EventMetrics, RpcMetrics};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The boxed shape an `on_rpc` closure is stored as.
type RpcHandlerFn = dyn Fn(Kwargs) -> BoxFuture<Result<Value, ResultError>> + Send + Sync;

/// The boxed shape an `on_event` closure is stored as.
type EventHandlerFn = dyn Fn(EventMessage) -> BoxFuture<BusResult<()>> + Send + Sync;

/// Where a [`BusClient`] sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed; handlers/plugins/APIs may still be registered.
    Created,
    /// [`BusClient::setup`] has opened every transport; not yet consuming.
    Open,
    /// [`BusClient::run_forever`] is driving the supervised tasks.
    Running,
    /// [`BusClient::shutdown_server`] is draining tasks and closing transports.
    ShuttingDown,
    /// Fully shut down. Terminal.
    Closed,
}

/// Errors surfaced by the client runtime, on top of the cross-cutting
/// [`BusError`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// A lower-layer error (transport resolution, schema validation, ...).
    #[error(transparent)]
    Bus(#[from] BusError),
    /// The remote handler returned [`ResultOutcome::Err`] instead of a value.
    #[error("remote handler returned an error: {0:?}")]
    RemoteHandler(ResultError),
    /// A supervised background task panicked.
    #[error("supervised task panicked: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
    /// An operation was attempted from the wrong lifecycle state.
    #[error("client is in state {actual:?}, expected {expected:?}")]
    InvalidState {
        /// The state the operation required.
        expected: ClientState,
        /// The state the client was actually in.
        actual: ClientState,
    },
}

/// Builds a JSON value from [`Kwargs`] without a fallible `serde_json`
/// round trip, since `Kwargs` values are already [`Value`].
fn kwargs_value(kwargs: &Kwargs) -> Value {
    Value::Object(kwargs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn validation_error(err: BusError) -> ResultError {
    ResultError {
        error_kind: err.kind().to_string(),
        message: err.to_string(),
        payload: None,
    }
}

/// The running client: owns the transport registry, the schema registry,
/// the plugin pipeline, and every registered RPC/event handler.
///
/// Always held as `Arc<BusClient>` so it can be cloned into the tasks
/// [`BusClient::run_forever`] spawns while still implementing
/// [`ClientHandleOps`] directly (no separate handle wrapper type).
pub struct BusClient {
    service_name: String,
    registry: TransportRegistry,
    schema: Arc<SchemaRegistry>,
    config: BusConfig,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    pipeline: RwLock<Option<Arc<PluginPipeline>>>,
    rpc_handlers: RwLock<HashMap<(String, String), Arc<RpcHandlerFn>>>,
    event_handlers: RwLock<HashMap<(String, String), Arc<EventHandlerFn>>>,
    state: RwLock<ClientState>,
    exit_code: AtomicI32,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BusClient {
    /// Construct a client in [`ClientState::Created`], ready for handler
    /// registration.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        registry: TransportRegistry,
        schema: Arc<SchemaRegistry>,
        config: BusConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            service_name: service_name.into(),
            registry,
            schema,
            config,
            plugins: RwLock::new(Vec::new()),
            pipeline: RwLock::new(None),
            rpc_handlers: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(HashMap::new()),
            state: RwLock::new(ClientState::Created),
            exit_code: AtomicI32::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The service name this client was configured with.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The client's current lifecycle state.
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// The exit code a caller should propagate after `run_forever`
    /// returns, set by whichever signal or fatal error initiated shutdown.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    async fn require_state(&self, expected: ClientState) -> Result<(), ClientError> {
        let actual = *self.state.read().await;
        if actual == expected {
            Ok(())
        } else {
            Err(ClientError::InvalidState { expected, actual })
        }
    }

    fn client_handle(self: &Arc<Self>) -> ClientHandle {
        ClientHandle::new(Arc::clone(self) as Arc<dyn ClientHandleOps>)
    }

    async fn pipeline(&self) -> Arc<PluginPipeline> {
        match &*self.pipeline.read().await {
            Some(pipeline) => Arc::clone(pipeline),
            None => Arc::new(PluginPipeline::new(Vec::new())),
        }
    }

    /// Register `api`'s schema, deriving its document from [`Api::meta`].
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] outside [`ClientState::Created`], or
    /// a propagated schema error.
    pub async fn register_api(&self, api: &dyn Api) -> Result<(), ClientError> {
        self.require_state(ClientState::Created).await?;
        self.schema.add_api(api.meta()).await?;
        Ok(())
    }

    /// Add a plugin to the pipeline built at [`BusClient::setup`] time.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] outside [`ClientState::Created`].
    pub async fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), ClientError> {
        self.require_state(ClientState::Created).await?;
        self.plugins.write().await.push(plugin);
        Ok(())
    }

    /// Register a handler for `api_name.procedure_name`, replacing any
    /// prior registration for the same pair.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] outside [`ClientState::Created`].
    pub async fn on_rpc<F, Fut>(
        &self,
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        handler: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResultError>> + Send + 'static,
    {
        self.require_state(ClientState::Created).await?;
        let boxed: Arc<RpcHandlerFn> =
            Arc::new(move |kwargs| -> BoxFuture<Result<Value, ResultError>> { Box::pin(handler(kwargs)) });
        self.rpc_handlers
            .write()
            .await
            .insert((api_name.into(), procedure_name.into()), boxed);
        Ok(())
    }

    /// Register a handler for `api_name.event_name`, replacing any prior
    /// registration for the same pair.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] outside [`ClientState::Created`].
    pub async fn on_event<F, Fut>(
        &self,
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        handler: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        self.require_state(ClientState::Created).await?;
        let boxed: Arc<EventHandlerFn> =
            Arc::new(move |msg| -> BoxFuture<BusResult<()>> { Box::pin(handler(msg)) });
        self.event_handlers
            .write()
            .await
            .insert((api_name.into(), event_name.into()), boxed);
        Ok(())
    }

    /// Build the plugin pipeline, fire `before_server_start`, and open
    /// every bound transport.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] outside [`ClientState::Created`], or
    /// a propagated transport `open` failure.
    pub async fn setup(self: &Arc<Self>) -> Result<(), ClientError> {
        self.require_state(ClientState::Created).await?;

        let plugins = self.plugins.read().await.clone();
        let pipeline = Arc::new(PluginPipeline::new(plugins));
        pipeline.before_server_start(&self.client_handle(), &HookArgs::default()).await;
        *self.pipeline.write().await = Some(pipeline);

        self.registry.open_all().await?;
        *self.state.write().await = ClientState::Open;
        Ok(())
    }

    /// Call `api_name.procedure_name` with `kwargs`, blocking until the
    /// result arrives or the call times out.
    ///
    /// # Errors
    ///
    /// Schema validation failures, transport errors, a receive timeout,
    /// or [`ClientError::RemoteHandler`] if the handler itself failed.
    pub async fn rpc(
        self: &Arc<Self>,
        api_name: &str,
        procedure_name: &str,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let api_config = self.config.api_config(api_name);
        if api_config.validate_outgoing {
            self.schema
                .validate_parameters(api_name, procedure_name, &kwargs_value(&kwargs))
                .await?;
        }

        let handle = self.client_handle();
        let hook_args = HookArgs {
            api_name: Some(api_name.to_string()),
            member_name: Some(procedure_name.to_string()),
            extra: Value::Null,
        };
        let pipeline = self.pipeline().await;
        pipeline.before_rpc_call(&handle, &hook_args).await;

        let rpc_transport = self.registry.get_rpc_transport(api_name)?;
        let result_transport = self.registry.get_result_transport(api_name)?;

        let msg = RpcMessage::new(Uuid::new_v4().to_string(), api_name, procedure_name, kwargs);
        let call_options = CallOptions {
            timeout: Some(timeout.unwrap_or(api_config.rpc_timeout)),
        };

        let started = Instant::now();
        let sent = rpc_transport.call_rpc(msg, call_options.clone()).await?;
        let return_path = sent
            .return_path
            .clone()
            .unwrap_or_else(|| rpc_transport.get_return_path(&sent));

        let received = result_transport.receive_result(&sent, &return_path, call_options).await;
        pipeline.after_rpc_call(&handle, &hook_args).await;

        let result_msg = match received {
            Ok(result_msg) => result_msg,
            Err(err) => {
                RpcMetrics::record_timeout();
                return Err(err.into());
            }
        };
        RpcMetrics::record_call(started.elapsed());

        match result_msg.outcome {
            ResultOutcome::Ok { result } => {
                if api_config.validate_incoming {
                    self.schema.validate_response(api_name, procedure_name, &result).await?;
                }
                Ok(result)
            }
            ResultOutcome::Err { error } => {
                RpcMetrics::record_error();
                Err(ClientError::RemoteHandler(error))
            }
        }
    }

    /// Fire `api_name.event_name` with `kwargs`.
    ///
    /// # Errors
    ///
    /// Schema validation failures or a propagated transport error.
    pub async fn fire(self: &Arc<Self>, api_name: &str, event_name: &str, kwargs: Kwargs) -> Result<(), ClientError> {
        let api_config = self.config.api_config(api_name);
        if api_config.validate_outgoing {
            self.schema
                .validate_parameters(api_name, event_name, &kwargs_value(&kwargs))
                .await?;
        }

        let handle = self.client_handle();
        let hook_args = HookArgs {
            api_name: Some(api_name.to_string()),
            member_name: Some(event_name.to_string()),
            extra: Value::Null,
        };
        let pipeline = self.pipeline().await;
        pipeline.before_event_sent(&handle, &hook_args).await;

        let event_transport = self.registry.get_event_transport(api_name)?;
        let msg = EventMessage::new(Uuid::new_v4().to_string(), api_name, event_name, kwargs);
        let options = SendEventOptions {
            fire_timeout: Some(api_config.event_fire_timeout),
        };

        let started = Instant::now();
        event_transport.send_event(msg, options).await?;
        EventMetrics::record_sent(started.elapsed());

        pipeline.after_event_sent(&handle, &hook_args).await;
        Ok(())
    }

    /// The CLI collaborator's single entry point (spec.md §6): open every
    /// transport, optionally seed the remote schema map from a local
    /// file/directory, drive the supervised tasks until shutdown, then
    /// drain them and close every transport.
    ///
    /// `events_only` disables the RPC consume loop, leaving only event
    /// consumption and the schema monitor running. `schema_source`, when
    /// given, is loaded via [`SchemaRegistry::load_local`] before `setup`
    /// opens the transports, so validation has a remote schema set to
    /// fall back on even before the first bus reload.
    ///
    /// # Errors
    ///
    /// Propagates any error from schema loading, `setup`, `run_forever`,
    /// or `shutdown_server`.
    pub async fn run(
        self: &Arc<Self>,
        events_only: bool,
        schema_source: Option<&Path>,
    ) -> Result<i32, ClientError> {
        if let Some(path) = schema_source {
            self.schema.load_local(path).await?;
        }
        self.setup().await?;
        self.run_forever(!events_only).await?;
        self.shutdown_server(self.exit_code()).await?;
        Ok(self.exit_code())
    }

    async fn rpc_api_names(&self) -> Vec<String> {
        let handlers = self.rpc_handlers.read().await;
        let mut names: Vec<String> = handlers.keys().map(|(api, _)| api.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    async fn event_api_names(&self) -> Vec<String> {
        let handlers = self.event_handlers.read().await;
        let mut names: Vec<String> = handlers.keys().map(|(api, _)| api.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Spawn the supervised background tasks (RPC consumers, event
    /// consumers, the schema monitor, and the signal handler) and block
    /// until a shutdown is requested, either by a signal or by a
    /// supervised task hitting a fatal error.
    ///
    /// Does not itself drain tasks or close transports; call
    /// [`BusClient::shutdown_server`] after this returns.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidState`] outside [`ClientState::Open`], or a
    /// propagated transport-grouping error.
    pub async fn run_forever(self: &Arc<Self>, consume_rpcs_enabled: bool) -> Result<(), ClientError> {
        self.require_state(ClientState::Open).await?;
        *self.state.write().await = ClientState::Running;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if consume_rpcs_enabled {
            let apis = self.rpc_api_names().await;
            if !apis.is_empty() {
                for (transport, group_apis) in self.registry.get_rpc_transports(&apis)? {
                    let client = Arc::clone(self);
                    handles.push(tokio::spawn(async move {
                        client.supervise_rpc_consumer(transport, group_apis).await;
                    }));
                }
            }
        }

        let event_apis = self.event_api_names().await;
        if !event_apis.is_empty() {
            for (transport, group_apis) in self.registry.get_event_transports(&event_apis)? {
                let client = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    client.supervise_event_consumer(transport, group_apis).await;
                }));
            }
        }

        {
            let client = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                client.supervise_schema_monitor().await;
            }));
        }

        {
            let client = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                client.wait_for_signal().await;
            }));
        }

        *self.tasks.lock().await = handles;

        let mut shutdown_rx = self.shutdown.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn request_shutdown(&self, exit_code: i32) {
        self.exit_code.store(exit_code, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    /// Drain every supervised task and close every transport, in reverse
    /// of the order `setup`/`run_forever` opened/spawned them.
    ///
    /// # Errors
    ///
    /// [`BusError::BusAlreadyClosed`] if already [`ClientState::Closed`],
    /// a propagated join error from a supervised task, or a propagated
    /// transport `close` failure.
    pub async fn shutdown_server(self: &Arc<Self>, exit_code: i32) -> Result<(), ClientError> {
        if *self.state.read().await == ClientState::Closed {
            return Err(BusError::BusAlreadyClosed.into());
        }
        *self.state.write().await = ClientState::ShuttingDown;
        self.request_shutdown(exit_code);

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            handle.abort();
            if let Err(join_err) = handle.await {
                if !join_err.is_cancelled() {
                    return Err(join_err.into());
                }
            }
        }

        self.registry.close_all().await?;

        let handle = self.client_handle();
        self.pipeline().await.after_server_stopped(&handle, &HookArgs::default()).await;

        *self.state.write().await = ClientState::Closed;
        Ok(())
    }

    async fn wait_for_signal(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::signal::ctrl_c() => self.request_shutdown(0),
                _ = term.recv() => self.request_shutdown(0),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::signal::ctrl_c() => self.request_shutdown(0),
            }
        }
    }

    async fn fail_fatally(self: &Arc<Self>, err: BusError) {
        tracing::error!(error = %err, "supervised task failed fatally");
        let handle = self.client_handle();
        self.pipeline().await.notify_exception(&handle, &err).await;
        self.request_shutdown(1);
    }

    async fn supervise_rpc_consumer(self: Arc<Self>, transport: Arc<dyn RpcTransport>, apis: Vec<String>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let stream = match transport.consume_rpcs(apis).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_fatally(err).await;
                return;
            }
        };
        tokio::pin!(stream);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                item = stream.next() => match item {
                    Some(Ok(msg)) => {
                        let client = Arc::clone(&self);
                        tokio::spawn(async move { client.dispatch_rpc(msg).await; });
                    }
                    Some(Err(err)) => {
                        self.fail_fatally(err).await;
                        return;
                    }
                    None => return,
                }
            }
        }
    }

    async fn dispatch_rpc(self: Arc<Self>, msg: RpcMessage) {
        let api_name = msg.api_name.clone();
        let procedure_name = msg.procedure_name.clone();
        let handle = self.client_handle();
        let hook_args = HookArgs {
            api_name: Some(api_name.clone()),
            member_name: Some(procedure_name.clone()),
            extra: Value::Null,
        };
        let pipeline = self.pipeline().await;
        pipeline.before_rpc_execution(&handle, &hook_args).await;

        let api_config = self.config.api_config(&api_name);
        let started = Instant::now();
        let result_msg = self.execute_rpc_handler(&msg, &api_config).await;
        RpcMetrics::record_execution(started.elapsed());

        pipeline.after_rpc_execution(&handle, &hook_args).await;

        let Some(return_path) = msg.return_path.clone() else {
            tracing::error!(api = %api_name, procedure = %procedure_name, "rpc call arrived with no return path");
            return;
        };

        match self.registry.get_result_transport(&api_name) {
            Ok(result_transport) => {
                if let Err(err) = result_transport.send_result(&msg, result_msg, &return_path).await {
                    tracing::error!(error = %err, "failed to send rpc result");
                }
            }
            Err(err) => tracing::error!(error = %err, "no result transport bound for api"),
        }
    }

    async fn execute_rpc_handler(&self, msg: &RpcMessage, api_config: &ApiConfig) -> ResultMessage {
        if api_config.validate_incoming {
            if let Err(err) = self
                .schema
                .validate_parameters(&msg.api_name, &msg.procedure_name, &kwargs_value(&msg.kwargs))
                .await
            {
                RpcMetrics::record_error();
                return ResultMessage::err(msg.id.clone(), validation_error(err));
            }
        }

        let handler = self
            .rpc_handlers
            .read()
            .await
            .get(&(msg.api_name.clone(), msg.procedure_name.clone()))
            .cloned();
        let Some(handler) = handler else {
            RpcMetrics::record_error();
            return ResultMessage::err(
                msg.id.clone(),
                ResultError {
                    error_kind: "HandlerNotFound".to_string(),
                    message: format!("no handler registered for {}.{}", msg.api_name, msg.procedure_name),
                    payload: None,
                },
            );
        };

        let outcome = tokio::spawn(handler(msg.kwargs.clone())).await;
        match outcome {
            Ok(Ok(value)) => {
                if api_config.validate_outgoing {
                    if let Err(err) = self.schema.validate_response(&msg.api_name, &msg.procedure_name, &value).await {
                        RpcMetrics::record_error();
                        return ResultMessage::err(msg.id.clone(), validation_error(err));
                    }
                }
                ResultMessage::ok(msg.id.clone(), value)
            }
            Ok(Err(error)) => {
                RpcMetrics::record_error();
                ResultMessage::err(msg.id.clone(), error)
            }
            Err(join_err) => {
                RpcMetrics::record_error();
                ResultMessage::err(
                    msg.id.clone(),
                    ResultError {
                        error_kind: "HandlerError".to_string(),
                        message: join_err.to_string(),
                        payload: None,
                    },
                )
            }
        }
    }

    async fn supervise_event_consumer(self: Arc<Self>, transport: Arc<dyn EventTransport>, apis: Vec<String>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let selectors: Vec<EventSelector> = {
            let handlers = self.event_handlers.read().await;
            handlers
                .keys()
                .filter(|(api, _)| apis.contains(api))
                .map(|(api, event)| EventSelector::one(api.clone(), event.clone()))
                .collect()
        };
        if selectors.is_empty() {
            return;
        }

        let options = ConsumeOptions {
            listener_name: self.service_name.clone(),
            ..ConsumeOptions::default()
        };
        let stream = match transport.consume(selectors, options).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_fatally(err).await;
                return;
            }
        };
        tokio::pin!(stream);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                item = stream.next() => match item {
                    Some(Ok(batch)) => self.dispatch_event_batch(&transport, batch).await,
                    Some(Err(err)) => {
                        self.fail_fatally(err).await;
                        return;
                    }
                    None => return,
                }
            }
        }
    }

    async fn dispatch_event_batch(self: &Arc<Self>, transport: &Arc<dyn EventTransport>, batch: EventBatch) {
        let handle = self.client_handle();
        let pipeline = self.pipeline().await;
        let mut acked = Vec::new();

        for msg in batch {
            let hook_args = HookArgs {
                api_name: Some(msg.api_name.clone()),
                member_name: Some(msg.event_name.clone()),
                extra: Value::Null,
            };
            pipeline.before_event_execution(&handle, &hook_args).await;

            let handler = self
                .event_handlers
                .read()
                .await
                .get(&(msg.api_name.clone(), msg.event_name.clone()))
                .cloned();

            let Some(handler) = handler else {
                pipeline.after_event_execution(&handle, &hook_args).await;
                acked.push(msg);
                continue;
            };

            let started = Instant::now();
            let outcome = tokio::spawn(handler(msg.clone())).await;
            pipeline.after_event_execution(&handle, &hook_args).await;

            match outcome {
                Ok(Ok(())) => {
                    EventMetrics::record_consumed(started.elapsed());
                    acked.push(msg);
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        error = %err,
                        api = %msg.api_name,
                        event = %msg.event_name,
                        "event handler failed, leaving unacked for reclaim"
                    );
                }
                Err(join_err) => {
                    tracing::error!(
                        error = %join_err,
                        api = %msg.api_name,
                        event = %msg.event_name,
                        "event handler panicked, leaving unacked for reclaim"
                    );
                }
            }
        }

        if !acked.is_empty() {
            let count = acked.len();
            if let Err(err) = transport.acknowledge(&acked).await {
                tracing::error!(error = %err, "failed to acknowledge events");
            } else {
                EventMetrics::record_acknowledged(count);
            }
        }
    }

    async fn supervise_schema_monitor(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            result = self.schema.monitor(None) => {
                if let Err(err) = result {
                    self.fail_fatally(err).await;
                }
            }
        }
    }
}

impl ClientHandleOps for BusClient {
    fn service_name(&self) -> &str {
        &self.service_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshbus_core::message::ReturnPath;
    use meshbus_core::transport::{EventStream, RpcStream, Transport};
    use std::sync::atomic::AtomicUsize;

    struct EchoRpcTransport {
        result: Mutex<HashMap<String, ResultMessage>>,
    }

    impl EchoRpcTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for EchoRpcTransport {}

    #[async_trait]
    impl RpcTransport for EchoRpcTransport {
        async fn call_rpc(&self, msg: RpcMessage, _options: CallOptions) -> BusResult<RpcMessage> {
            let reply = ResultMessage::ok(msg.id.clone(), Value::String("pong".to_string()));
            self.result.lock().await.insert(msg.id.clone(), reply);
            Ok(msg.with_return_path(ReturnPath("stub".to_string())))
        }

        fn get_return_path(&self, _msg: &RpcMessage) -> ReturnPath {
            ReturnPath("stub".to_string())
        }

        async fn consume_rpcs(&self, _apis: Vec<String>) -> BusResult<RpcStream> {
            unimplemented!("not exercised in these tests")
        }
    }

    #[async_trait]
    impl meshbus_core::transport::ResultTransport for EchoRpcTransport {
        async fn send_result(
            &self,
            _rpc_msg: &RpcMessage,
            _result_msg: ResultMessage,
            _return_path: &ReturnPath,
        ) -> BusResult<()> {
            Ok(())
        }

        async fn receive_result(
            &self,
            rpc_msg: &RpcMessage,
            _return_path: &ReturnPath,
            _options: CallOptions,
        ) -> BusResult<ResultMessage> {
            Ok(self.result.lock().await.remove(&rpc_msg.id).unwrap())
        }
    }

    struct EventAndSchemaStub {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Transport for EventAndSchemaStub {}

    #[async_trait]
    impl EventTransport for EventAndSchemaStub {
        async fn send_event(&self, msg: EventMessage, _options: SendEventOptions) -> BusResult<EventMessage> {
            self.sent.fetch_add(1, Ordering::SeqCst);
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

    #[async_trait]
    impl meshbus_core::transport::SchemaTransport for EventAndSchemaStub {
        async fn store(&self, _api_name: &str, _schema: &Value, _ttl: Duration) -> BusResult<()> {
            Ok(())
        }

        async fn ping(&self, _api_name: &str, _ttl: Duration) -> BusResult<()> {
            Ok(())
        }

        async fn load(&self, _api_name: &str) -> BusResult<Option<Value>> {
            Ok(None)
        }

        async fn load_all(&self) -> BusResult<HashMap<String, Value>> {
            Ok(HashMap::new())
        }
    }

    fn test_client() -> Arc<BusClient> {
        let mut registry = TransportRegistry::new();
        let rpc: Arc<EchoRpcTransport> = EchoRpcTransport::new();
        registry.set_rpc_transport(meshbus_core::registry::DEFAULT_API, rpc.clone() as Arc<dyn RpcTransport>);
        registry.set_result_transport(
            meshbus_core::registry::DEFAULT_API,
            rpc as Arc<dyn meshbus_core::transport::ResultTransport>,
        );
        let schema_backend = Arc::new(EventAndSchemaStub { sent: AtomicUsize::new(0) });
        registry.set_event_transport(
            meshbus_core::registry::DEFAULT_API,
            schema_backend.clone() as Arc<dyn EventTransport>,
        );
        registry.set_schema_transport(schema_backend as Arc<dyn meshbus_core::transport::SchemaTransport>);

        let schema = Arc::new(SchemaRegistry::new(
            registry.get_schema_transport().unwrap(),
            meshbus_core::schema::DEFAULT_MAX_AGE,
        ));
        BusClient::new("test-service", registry, schema, BusConfig::default())
    }

    #[tokio::test]
    async fn registration_is_rejected_once_the_client_is_open() {
        let client = test_client();
        client.setup().await.unwrap();

        let err = client
            .add_plugin(Arc::new(NoopPlugin))
            .await
            .expect_err("registration should be rejected once open");
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    struct NoopPlugin;
    #[async_trait]
    impl Plugin for NoopPlugin {}

    #[tokio::test]
    async fn rpc_call_round_trips_through_the_stub_transport() {
        let client = test_client();
        let api = ApiMetaStub::new("greeter");
        client.register_api(&api).await.unwrap();
        client.setup().await.unwrap();

        let result = client
            .rpc("greeter", "ping", Kwargs::new(), None)
            .await
            .expect("call should succeed");
        assert_eq!(result, Value::String("pong".to_string()));
    }

    #[tokio::test]
    async fn run_drains_and_shuts_down_once_requested() {
        let client = test_client();
        let api = ApiMetaStub::new("greeter");
        client.register_api(&api).await.unwrap();

        let runner = Arc::clone(&client);
        let handle = tokio::spawn(async move { runner.run(true, None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.request_shutdown(0);

        let exit_code = handle.await.unwrap().unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(client.state().await, ClientState::Closed);
    }

    #[tokio::test]
    async fn fire_sends_through_the_bound_event_transport() {
        let client = test_client();
        let api = ApiMetaStub::new("greeter");
        client.register_api(&api).await.unwrap();
        client.setup().await.unwrap();

        client.fire("greeter", "greeted", Kwargs::new()).await.unwrap();
    }

    struct ApiMetaStub {
        meta: meshbus_core::api::ApiMeta,
    }

    impl ApiMetaStub {
        fn new(name: &str) -> Self {
            Self {
                meta: meshbus_core::api::ApiMeta::builder(name)
                    .rpc("ping", serde_json::json!({}), serde_json::json!({}))
                    .event("greeted", serde_json::json!({}))
                    .build(),
            }
        }
    }

    impl Api for ApiMetaStub {
        fn meta(&self) -> &meshbus_core::api::ApiMeta {
            &self.meta
        }
    }
}
