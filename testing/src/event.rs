//! An in-memory stand-in for [`meshbus_redis::event::RedisEventTransport`]
//! implementing the same consumer-group delivery algorithm (spec.md
//! §4.1) over a `Vec` per stream instead of a Redis Stream, so tests of
//! `meshbus-runtime`'s event-handling wiring don't need a live Redis.
//!
//! Grounded on `redis-transport/src/event.rs`'s shape (builder,
//! `consume` spawning a background delivery task that feeds a bounded
//! `mpsc` channel) and on the teacher's `testing/src/lib.rs` doc-comment
//! style.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meshbus_core::error::{BusError, BusResult};
use meshbus_core::message::{EventMessage, StreamId};
use meshbus_core::transport::{
    ConsumeOptions, EventBatch, EventSelector, EventStream, EventTransport, SendEventOptions, Transport,
};
use tokio::sync::{mpsc, RwLock};

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Id of the last entry handed out under `>` semantics; the next
    /// steady-state read starts strictly after this.
    cursor: StreamId,
    pending: HashMap<StreamId, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(StreamId, EventMessage)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    streams: RwLock<HashMap<String, StreamState>>,
    id_counter: AtomicU64,
}

/// An in-process event transport with the same at-least-once,
/// reclaim-capable semantics as [`meshbus_redis::event::RedisEventTransport`]
/// (minus the network), for fast unit/integration tests.
///
/// Stream ids are minted from a monotonically increasing counter rather
/// than a wall-clock timestamp, so ordering assertions in tests never
/// race the system clock.
pub struct InMemoryEventTransport {
    inner: Arc<Inner>,
    max_stream_length: Option<usize>,
    acknowledgement_timeout: Duration,
    reclaim_poll_interval: Duration,
}

impl InMemoryEventTransport {
    /// A transport with no stream truncation and a one-minute
    /// acknowledgement timeout, matching
    /// [`meshbus_core::config::RedisTransportConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            max_stream_length: None,
            acknowledgement_timeout: Duration::from_secs(60),
            reclaim_poll_interval: Duration::from_millis(20),
        }
    }

    /// Set the acknowledgement timeout used by the periodic reclaim
    /// pass, and how often that pass runs (tests typically want both
    /// much shorter than production defaults).
    #[must_use]
    pub fn with_acknowledgement_timeout(mut self, timeout: Duration) -> Self {
        self.acknowledgement_timeout = timeout;
        self.reclaim_poll_interval = (timeout / 4).max(Duration::from_millis(1));
        self
    }

    /// Cap stream length; appends past the cap truncate the oldest
    /// entries (spec.md §4.1 "max_stream_length").
    #[must_use]
    pub fn with_max_stream_length(mut self, max: usize) -> Self {
        self.max_stream_length = Some(max);
        self
    }

    /// A handle sharing this transport's backing store, for a test that
    /// wants to hold the transport by value in more than one place
    /// (e.g. a producer and a consumer).
    #[must_use]
    pub fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            max_stream_length: self.max_stream_length,
            acknowledgement_timeout: self.acknowledgement_timeout,
            reclaim_poll_interval: self.reclaim_poll_interval,
        }
    }

    fn next_id(&self) -> StreamId {
        let millis = self.inner.id_counter.fetch_add(1, Ordering::SeqCst);
        StreamId { millis, seq: 0 }
    }

    fn stream_name(api_name: &str, event_name: &str) -> String {
        format!("{api_name}.{event_name}:stream")
    }

    fn consumer_group_name(listener_name: &str) -> String {
        format!("default-{listener_name}")
    }
}

impl Default for InMemoryEventTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryEventTransport {}

#[async_trait]
impl EventTransport for InMemoryEventTransport {
    async fn send_event(&self, mut msg: EventMessage, _options: SendEventOptions) -> BusResult<EventMessage> {
        let stream_name = Self::stream_name(&msg.api_name, &msg.event_name);
        let id = self.next_id();
        msg.native_id = Some(id);

        let mut streams = self.inner.streams.write().await;
        let stream = streams.entry(stream_name).or_default();
        stream.entries.push((id, msg.clone()));
        if let Some(max_len) = self.max_stream_length {
            if stream.entries.len() > max_len {
                let drop_count = stream.entries.len() - max_len;
                stream.entries.drain(0..drop_count);
            }
        }
        Ok(msg)
    }

    async fn consume(&self, listen_for: Vec<EventSelector>, options: ConsumeOptions) -> BusResult<EventStream> {
        if listen_for.is_empty() {
            return Err(BusError::NothingToListenFor);
        }
        let stream_names: Vec<String> = listen_for
            .iter()
            .map(|selector| Self::stream_name(&selector.api_name, selector.event_name.as_deref().unwrap_or("*")))
            .collect();
        let group = Self::consumer_group_name(&options.listener_name);
        let consumer = format!("consumer-{}", options.listener_name);
        let since = options.since.unwrap_or(StreamId::ZERO);

        {
            let mut streams = self.inner.streams.write().await;
            for name in &stream_names {
                let stream = streams.entry(name.clone()).or_default();
                stream.groups.entry(group.clone()).or_insert_with(|| GroupState {
                    cursor: since,
                    pending: HashMap::new(),
                });
            }
        }

        let (tx, rx) = mpsc::channel::<BusResult<EventBatch>>(16);
        let inner = Arc::clone(&self.inner);
        let ack_timeout = self.acknowledgement_timeout;
        let poll_interval = self.reclaim_poll_interval;
        let forever = options.forever;

        tokio::spawn(async move {
            // Startup reclaim: anything already pending for this exact
            // consumer from a previous run is handed back before any
            // fresh `>` read (spec.md §4.1 step 1).
            if let Some(batch) = drain_own_pending(&inner, &stream_names, &group, &consumer).await {
                if tx.send(Ok(batch)).await.is_err() {
                    return;
                }
            }

            loop {
                let fresh = read_fresh(&inner, &stream_names, &group, &consumer).await;
                if !fresh.is_empty() && tx.send(Ok(fresh)).await.is_err() {
                    return;
                }

                let reclaimed = reclaim_idle(&inner, &stream_names, &group, &consumer, ack_timeout).await;
                if !reclaimed.is_empty() && tx.send(Ok(reclaimed)).await.is_err() {
                    return;
                }

                if !forever {
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn acknowledge(&self, msgs: &[EventMessage]) -> BusResult<()> {
        let mut streams = self.inner.streams.write().await;
        for msg in msgs {
            let (Some(native_id), Some(group)) = (msg.native_id, &msg.consumer_group) else {
                continue;
            };
            let stream_name = Self::stream_name(&msg.api_name, &msg.event_name);
            if let Some(stream) = streams.get_mut(&stream_name) {
                if let Some(state) = stream.groups.get_mut(group) {
                    state.pending.remove(&native_id);
                }
            }
        }
        Ok(())
    }

    async fn history(&self, listen_for: Vec<EventSelector>) -> BusResult<EventStream> {
        if listen_for.is_empty() {
            return Err(BusError::NothingToListenFor);
        }
        let stream_names: Vec<String> = listen_for
            .iter()
            .map(|selector| Self::stream_name(&selector.api_name, selector.event_name.as_deref().unwrap_or("*")))
            .collect();
        let streams = self.inner.streams.read().await;
        let mut batch = EventBatch::new();
        for name in &stream_names {
            if let Some(stream) = streams.get(name) {
                batch.extend(stream.entries.iter().map(|(_, msg)| msg.clone()));
            }
        }
        let stream = async_stream::stream! {
            yield Ok(batch);
        };
        Ok(Box::pin(stream))
    }

    fn supports_history(&self) -> bool {
        true
    }
}

/// Pending count for `(stream, group)`, exposed for tests asserting
/// invariant 3 ("for any acked message, xpending does not include its
/// id") without reaching into the transport's private state via a mock.
impl InMemoryEventTransport {
    /// Number of unacked entries currently pending for `group` on the
    /// stream `api_name.event_name` belongs to.
    pub async fn pending_count(&self, api_name: &str, event_name: &str, group: &str) -> usize {
        let streams = self.inner.streams.read().await;
        streams
            .get(&Self::stream_name(api_name, event_name))
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Total entries currently stored for the stream `api_name.event_name`
    /// belongs to, for asserting truncation behavior.
    pub async fn stream_length(&self, api_name: &str, event_name: &str) -> usize {
        let streams = self.inner.streams.read().await;
        streams.get(&Self::stream_name(api_name, event_name)).map_or(0, |s| s.entries.len())
    }
}

async fn drain_own_pending(
    inner: &Arc<Inner>,
    stream_names: &[String],
    group: &str,
    consumer: &str,
) -> Option<EventBatch> {
    let streams = inner.streams.read().await;
    let mut batch = EventBatch::new();
    for name in stream_names {
        let Some(stream) = streams.get(name) else { continue };
        let Some(state) = stream.groups.get(group) else { continue };
        for (id, entry) in &stream.entries {
            let Some(pending) = state.pending.get(id) else { continue };
            if pending.consumer == consumer {
                let mut msg = entry.clone();
                msg.consumer_group = Some(group.to_string());
                batch.push(msg);
            }
        }
    }
    if batch.is_empty() {
        None
    } else {
        Some(batch)
    }
}

async fn read_fresh(inner: &Arc<Inner>, stream_names: &[String], group: &str, consumer: &str) -> EventBatch {
    let mut streams = inner.streams.write().await;
    let mut batch = EventBatch::new();
    for name in stream_names {
        let Some(stream) = streams.get_mut(name) else { continue };
        let Some(state) = stream.groups.get_mut(group) else { continue };
        let cursor = state.cursor;
        let fresh: Vec<(StreamId, EventMessage)> = stream
            .entries
            .iter()
            .filter(|(id, _)| *id > cursor)
            .cloned()
            .collect();
        for (id, entry) in fresh {
            state.cursor = id;
            state.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                },
            );
            let mut msg = entry;
            msg.consumer_group = Some(group.to_string());
            batch.push(msg);
        }
    }
    batch
}

async fn reclaim_idle(
    inner: &Arc<Inner>,
    stream_names: &[String],
    group: &str,
    consumer: &str,
    ack_timeout: Duration,
) -> EventBatch {
    let mut streams = inner.streams.write().await;
    let mut batch = EventBatch::new();
    for name in stream_names {
        let Some(stream) = streams.get_mut(name) else { continue };
        let Some(state) = stream.groups.get_mut(group) else { continue };
        let now = Instant::now();
        let idle_ids: Vec<StreamId> = state
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= ack_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in idle_ids {
            state.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                },
            );
            if let Some((_, entry)) = stream.entries.iter().find(|(entry_id, _)| *entry_id == id) {
                let mut msg = entry.clone();
                msg.consumer_group = Some(group.to_string());
                batch.push(msg);
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbus_core::message::Kwargs;
    use meshbus_core::transport::EventSelector;
    use futures::StreamExt;

    fn sample_kwargs() -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("field".to_string(), serde_json::json!("value"));
        kwargs
    }

    #[tokio::test]
    async fn send_then_consume_delivers_the_event() {
        let transport = InMemoryEventTransport::new();
        let msg = EventMessage::new("1", "my.api", "my_event", sample_kwargs());
        transport.send_event(msg, SendEventOptions::default()).await.unwrap();

        let options = ConsumeOptions {
            listener_name: "listener".to_string(),
            since: Some(StreamId::ZERO),
            forever: false,
        };
        let mut stream = transport
            .consume(vec![EventSelector::one("my.api", "my_event")], options)
            .await
            .unwrap();

        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "1");
    }

    #[tokio::test]
    async fn two_services_each_receive_their_own_copy() {
        let transport = InMemoryEventTransport::new();
        transport
            .send_event(EventMessage::new("1", "my.api", "my_event", sample_kwargs()), SendEventOptions::default())
            .await
            .unwrap();

        for listener in ["service-a", "service-b"] {
            let options = ConsumeOptions {
                listener_name: listener.to_string(),
                since: Some(StreamId::ZERO),
                forever: false,
            };
            let mut stream = transport
                .consume(vec![EventSelector::one("my.api", "my_event")], options)
                .await
                .unwrap();
            let batch = stream.next().await.unwrap().unwrap();
            assert_eq!(batch.len(), 1);
        }
    }

    #[tokio::test]
    async fn unacked_message_reappears_after_acknowledgement_timeout() {
        let transport = InMemoryEventTransport::new().with_acknowledgement_timeout(Duration::from_millis(20));
        transport
            .send_event(EventMessage::new("1", "my.api", "my_event", sample_kwargs()), SendEventOptions::default())
            .await
            .unwrap();

        let options = ConsumeOptions {
            listener_name: "listener".to_string(),
            since: Some(StreamId::ZERO),
            forever: true,
        };
        let mut stream = transport
            .consume(vec![EventSelector::one("my.api", "my_event")], options)
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        // Deliberately not acknowledged.
        let reclaimed = stream.next().await.unwrap().unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, "1");
    }

    #[tokio::test]
    async fn acknowledged_message_drops_out_of_pending() {
        let transport = InMemoryEventTransport::new();
        transport
            .send_event(EventMessage::new("1", "my.api", "my_event", sample_kwargs()), SendEventOptions::default())
            .await
            .unwrap();

        let options = ConsumeOptions {
            listener_name: "listener".to_string(),
            since: Some(StreamId::ZERO),
            forever: false,
        };
        let mut stream = transport
            .consume(vec![EventSelector::one("my.api", "my_event")], options)
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();

        assert_eq!(transport.pending_count("my.api", "my_event", "default-listener").await, 1);
        transport.acknowledge(&batch).await.unwrap();
        assert_eq!(transport.pending_count("my.api", "my_event", "default-listener").await, 0);
    }

    #[tokio::test]
    async fn max_stream_length_truncates_oldest_entries() {
        let transport = InMemoryEventTransport::new().with_max_stream_length(5);
        for i in 0..10 {
            transport
                .send_event(
                    EventMessage::new(i.to_string(), "my.api", "my_event", sample_kwargs()),
                    SendEventOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(transport.stream_length("my.api", "my_event").await, 5);
    }

    #[tokio::test]
    async fn consume_with_empty_selector_is_nothing_to_listen_for() {
        let transport = InMemoryEventTransport::new();
        let err = transport.consume(vec![], ConsumeOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "NothingToListenFor");
    }
}
