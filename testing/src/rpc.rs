//! In-memory call-queue and return-path transports, mirroring
//! `meshbus_redis::rpc`'s two-transport split but backed by
//! `tokio::sync::mpsc`/`oneshot` channels instead of Redis lists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshbus_core::error::{BusError, BusResult};
use meshbus_core::message::{ResultMessage, ReturnPath, RpcMessage};
use meshbus_core::transport::{CallOptions, ResultTransport, RpcStream, RpcTransport, Transport};
use tokio::sync::{mpsc, oneshot, Mutex};

/// The call-queue half: one unbounded channel per API name, shared by
/// every clone of the transport.
#[derive(Clone, Default)]
pub struct InMemoryRpcTransport {
    queues: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RpcMessage>>>>,
    receivers: Arc<Mutex<HashMap<String, mpsc::UnboundedReceiver<RpcMessage>>>>,
}

impl InMemoryRpcTransport {
    /// An empty transport with no APIs registered yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, api_name: &str) -> mpsc::UnboundedSender<RpcMessage> {
        let mut queues = self.queues.lock().await;
        if let Some(sender) = queues.get(api_name) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(api_name.to_string(), tx.clone());
        self.receivers.lock().await.insert(api_name.to_string(), rx);
        tx
    }
}

#[async_trait]
impl Transport for InMemoryRpcTransport {}

#[async_trait]
impl RpcTransport for InMemoryRpcTransport {
    async fn call_rpc(&self, msg: RpcMessage, _options: CallOptions) -> BusResult<RpcMessage> {
        let return_path = self.get_return_path(&msg);
        let msg = msg.with_return_path(return_path);
        let sender = self.sender_for(&msg.api_name).await;
        sender.send(msg.clone()).map_err(|_| {
            meshbus_core::error::transport_error(QueueClosed)
        })?;
        Ok(msg)
    }

    fn get_return_path(&self, msg: &RpcMessage) -> ReturnPath {
        ReturnPath(msg.id.clone())
    }

    async fn consume_rpcs(&self, apis: Vec<String>) -> BusResult<RpcStream> {
        if apis.is_empty() {
            return Err(BusError::NothingToListenFor);
        }
        // Ensure every requested API has a queue, then take ownership of
        // its receiver; `consume_rpcs` is one-shot per API in this test
        // double, matching how a single consumer task owns the Redis
        // queue's `BRPOP` loop.
        let mut receivers = Vec::with_capacity(apis.len());
        for api in &apis {
            self.sender_for(api).await;
            let rx = self
                .receivers
                .lock()
                .await
                .remove(api)
                .expect("sender_for just ensured this api's receiver exists");
            receivers.push(rx);
        }

        let stream = async_stream::stream! {
            let mut receivers = receivers;
            loop {
                let mut delivered = false;
                for rx in &mut receivers {
                    if let Ok(msg) = rx.try_recv() {
                        yield Ok(msg);
                        delivered = true;
                    }
                }
                if !delivered {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("rpc queue receiver has been dropped")]
struct QueueClosed;

/// The return-path half: one `oneshot` channel per in-flight call,
/// keyed by the return-path token.
#[derive(Clone, Default)]
pub struct InMemoryResultTransport {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResultMessage>>>>,
    default_timeout: Duration,
}

impl InMemoryResultTransport {
    /// A transport using `default_timeout` when a call supplies no
    /// [`CallOptions::timeout`].
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }
}

#[async_trait]
impl Transport for InMemoryResultTransport {}

#[async_trait]
impl ResultTransport for InMemoryResultTransport {
    async fn send_result(
        &self,
        _rpc_msg: &RpcMessage,
        result_msg: ResultMessage,
        return_path: &ReturnPath,
    ) -> BusResult<()> {
        if let Some(sender) = self.pending.lock().await.remove(&return_path.0) {
            // A receiver that gave up (timed out) drops its end; sending
            // into a dropped receiver is a harmless no-op here, mirroring
            // a result arriving after the caller stopped waiting.
            let _ = sender.send(result_msg);
        }
        Ok(())
    }

    async fn receive_result(
        &self,
        _rpc_msg: &RpcMessage,
        return_path: &ReturnPath,
        options: CallOptions,
    ) -> BusResult<ResultMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(return_path.0.clone(), tx);
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&return_path.0);
                Err(meshbus_core::error::transport_error(ResultTimeout {
                    return_path: return_path.0.clone(),
                }))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for result on return path {return_path}")]
struct ResultTimeout {
    return_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use meshbus_core::message::Kwargs;

    #[tokio::test]
    async fn call_then_consume_then_send_result_round_trips() {
        let rpc = InMemoryRpcTransport::new();
        let result = InMemoryResultTransport::new(Duration::from_secs(1));

        let msg = RpcMessage::new("call-1", "auth", "check_password", Kwargs::new());
        let published = rpc.call_rpc(msg, CallOptions::default()).await.unwrap();
        let return_path = published.return_path.clone().unwrap();

        let mut calls = rpc.consume_rpcs(vec!["auth".to_string()]).await.unwrap();
        let received = calls.next().await.unwrap().unwrap();
        assert_eq!(received.id, "call-1");

        let result_msg = ResultMessage::ok("call-1", serde_json::json!(true));
        result.send_result(&received, result_msg, &return_path).await.unwrap();

        let outcome = result
            .receive_result(&published, &return_path, CallOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.rpc_message_id, "call-1");
    }

    #[tokio::test]
    async fn receive_result_times_out_when_nothing_arrives() {
        let result = InMemoryResultTransport::new(Duration::from_millis(20));
        let msg = RpcMessage::new("call-2", "auth", "check_password", Kwargs::new());
        let return_path = ReturnPath("call-2".to_string());

        let err = result
            .receive_result(&msg, &return_path, CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TransportError");
    }

    #[tokio::test]
    async fn consume_rpcs_rejects_empty_api_list() {
        let rpc = InMemoryRpcTransport::new();
        let err = rpc.consume_rpcs(vec![]).await.unwrap_err();
        assert_eq!(err.kind(), "NothingToListenFor");
    }
}
