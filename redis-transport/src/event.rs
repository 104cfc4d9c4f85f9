//! The Redis Streams event transport (spec.md §4.1).
//!
//! Grounded on
//! `other_examples/82381ce0_Muhammed5500-NEURO__services-ingestion-src-message_bus-redis_streams.rs.rs`
//! for the `XGROUP CREATE` / `XADD` / `XREADGROUP` / `XACK` command
//! sequences (the teacher itself never touches Redis Streams), on
//! `redpanda/src/lib.rs` for the builder-plus-`async_stream::stream!`
//! consumption shape, and on `test_unit_redis_events.py` in
//! `original_source/` for the exact field layout and reclaim semantics.
//!
//! The delivery algorithm's three cooperating producers (spec.md §9)
//! are two `tokio::spawn`ed tasks rather than three: startup pending
//! reclaim must complete, in order, before any steady-state `>` read for
//! the same stream ("yield them before doing any `>` read"), so those
//! two phases run sequentially inside one task; periodic lost-message
//! reclaim has no such ordering constraint against the other two and
//! runs as an independent concurrent task. Both feed the same bounded
//! `tokio::sync::mpsc` channel that the returned [`EventStream`] drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshbus_core::error::BusResult;
use meshbus_core::message::{EventMessage, Kwargs, StreamId};
use meshbus_core::serializer::{ByFieldSerializer, BlobSerializer, EventSerializer, FieldMap};
use meshbus_core::transport::{
    ConsumeOptions, EventBatch, EventSelector, EventStream, EventTransport, SendEventOptions, Transport,
};
use meshbus_core::config::{RedisTransportConfig, SerializerKind, StreamUse};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::connection::connect;
use crate::error::{RedisTransportError, RedisResult};

/// Policy applied when a stream entry fails to decode (DESIGN.md, Open
/// Question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    /// Log and ack the poison entry so consumption continues.
    #[default]
    AckAndDrop,
    /// Leave the entry pending; it will reappear on the next reclaim
    /// cycle (useful while debugging a bad producer).
    LeavePending,
}

fn serializer_for(kind: SerializerKind) -> Arc<dyn EventSerializer> {
    match kind {
        SerializerKind::ByField => Arc::new(ByFieldSerializer),
        SerializerKind::Blob => Arc::new(BlobSerializer),
    }
}

/// `RedisEventTransport` builder, in the style of the teacher's
/// `RedpandaEventBus::builder()`.
pub struct RedisEventTransportBuilder {
    config: RedisTransportConfig,
    on_decode_error: DecodeErrorPolicy,
}

impl RedisEventTransportBuilder {
    /// Start from the defaults in [`RedisTransportConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RedisTransportConfig::default(),
            on_decode_error: DecodeErrorPolicy::default(),
        }
    }

    /// Connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Logical service identity for consumer-group load-balancing.
    #[must_use]
    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.config.service_name = service_name.into();
        self
    }

    /// Stable consumer identity within `service_name`.
    #[must_use]
    pub fn consumer_name(mut self, consumer_name: impl Into<String>) -> Self {
        self.config.consumer_name = consumer_name.into();
        self
    }

    /// `PER_EVENT` or `PER_API` stream layout.
    #[must_use]
    pub fn stream_use(mut self, stream_use: StreamUse) -> Self {
        self.config.stream_use = stream_use;
        self
    }

    /// Idle-time threshold before an unacked entry is reclaimable.
    #[must_use]
    pub fn acknowledgement_timeout(mut self, timeout: Duration) -> Self {
        self.config.acknowledgement_timeout = timeout;
        self
    }

    /// Approximate stream length cap; `None` disables truncation.
    #[must_use]
    pub fn max_stream_length(mut self, max: Option<usize>) -> Self {
        self.config.max_stream_length = max;
        self
    }

    /// Delay before resuming after a transient read failure.
    #[must_use]
    pub fn consumption_restart_delay(mut self, delay: Duration) -> Self {
        self.config.consumption_restart_delay = delay;
        self
    }

    /// Entries requested per `XREADGROUP` call.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// What to do with a stream entry that fails to decode.
    #[must_use]
    pub fn on_decode_error(mut self, policy: DecodeErrorPolicy) -> Self {
        self.on_decode_error = policy;
        self
    }

    /// Connect and build the transport.
    ///
    /// # Errors
    ///
    /// Returns [`RedisTransportError::ConnectionFailed`] if the initial
    /// connection cannot be established.
    pub async fn build(self) -> RedisResult<RedisEventTransport> {
        RedisEventTransport::from_config(self.config, self.on_decode_error).await
    }
}

impl Default for RedisEventTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The Redis Streams implementation of [`EventTransport`].
pub struct RedisEventTransport {
    conn: ConnectionManager,
    config: RedisTransportConfig,
    serializer: Arc<dyn EventSerializer>,
    deserializer: Arc<dyn EventSerializer>,
    on_decode_error: DecodeErrorPolicy,
}

impl RedisEventTransport {
    /// Start building a transport with [`RedisEventTransportBuilder`].
    #[must_use]
    pub fn builder() -> RedisEventTransportBuilder {
        RedisEventTransportBuilder::new()
    }

    /// Construct directly from a [`RedisTransportConfig`], matching
    /// `RedisEventTransport.from_config` in `original_source/`'s
    /// `test_from_config`.
    ///
    /// # Errors
    ///
    /// Returns [`RedisTransportError::ConnectionFailed`] if the initial
    /// connection cannot be established.
    pub async fn from_config(
        config: RedisTransportConfig,
        on_decode_error: DecodeErrorPolicy,
    ) -> RedisResult<Self> {
        let conn = connect(&config.url).await?;
        let serializer = serializer_for(config.serializer);
        let deserializer = serializer_for(config.deserializer);
        Ok(Self {
            conn,
            config,
            serializer,
            deserializer,
            on_decode_error,
        })
    }

    fn stream_name(&self, api_name: &str, event_name: &str) -> String {
        match self.config.stream_use {
            StreamUse::PerEvent => format!("{api_name}.{event_name}:stream"),
            StreamUse::PerApi => format!("{api_name}.*:stream"),
        }
    }

    fn stream_names_for_selectors(&self, selectors: &[EventSelector]) -> Vec<(String, EventSelector)> {
        let mut seen = std::collections::HashSet::new();
        selectors
            .iter()
            .filter_map(|selector| {
                let event_name = selector.event_name.as_deref().unwrap_or("*");
                let name = self.stream_name(&selector.api_name, event_name);
                seen.insert(name.clone()).then(|| (name, selector.clone()))
            })
            .collect()
    }

    fn consumer_group_name(&self, listener_name: &str) -> String {
        format!("{}-{listener_name}", self.config.service_name)
    }
}

#[async_trait]
impl Transport for RedisEventTransport {
    async fn close(&self) -> BusResult<()> {
        Ok(())
    }
}

#[async_trait]
impl EventTransport for RedisEventTransport {
    async fn send_event(&self, mut msg: EventMessage, _options: SendEventOptions) -> BusResult<EventMessage> {
        let stream = self.stream_name(&msg.api_name, &msg.event_name);
        let fields = self.serializer.encode(&msg);
        let mut conn = self.conn.clone();
        let native_id = send_event_raw(&mut conn, &stream, &fields, self.config.max_stream_length)
            .await
            .map_err(RedisTransportError::into_bus_error)?;
        msg.native_id = Some(native_id);
        Ok(msg)
    }

    async fn consume(&self, listen_for: Vec<EventSelector>, options: ConsumeOptions) -> BusResult<EventStream> {
        if listen_for.is_empty() {
            return Err(meshbus_core::error::BusError::NothingToListenFor);
        }
        let streams = self.stream_names_for_selectors(&listen_for);
        let group = self.consumer_group_name(&options.listener_name);
        let since = options.since.unwrap_or(StreamId::ZERO);

        for (stream, _) in &streams {
            ensure_group(&mut self.conn.clone(), stream, &group, since)
                .await
                .map_err(RedisTransportError::into_bus_error)?;
        }

        let (tx, rx) = mpsc::channel::<BusResult<EventBatch>>(self.config.batch_size.max(1));

        spawn_startup_then_steady_state(self, streams.clone(), group.clone(), tx.clone(), options.forever);
        if options.forever {
            spawn_periodic_reclaim(self, streams, group, tx);
        }

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn acknowledge(&self, msgs: &[EventMessage]) -> BusResult<()> {
        let mut conn = self.conn.clone();
        for msg in msgs {
            let Some(native_id) = msg.native_id else { continue };
            let Some(group) = &msg.consumer_group else { continue };
            let stream = self.stream_name(&msg.api_name, &msg.event_name);
            xack(&mut conn, &stream, group, &native_id.to_string())
                .await
                .map_err(RedisTransportError::into_bus_error)?;
        }
        Ok(())
    }

    async fn history(&self, listen_for: Vec<EventSelector>) -> BusResult<EventStream> {
        if listen_for.is_empty() {
            return Err(meshbus_core::error::BusError::NothingToListenFor);
        }
        let streams = self.stream_names_for_selectors(&listen_for);
        let deserializer = Arc::clone(&self.deserializer);
        let mut conn = self.conn.clone();
        let batch_size = self.config.batch_size;

        let stream = async_stream::stream! {
            for (stream_name, _selector) in streams {
                let mut cursor = StreamId::ZERO;
                loop {
                    let reply = xrange(&mut conn, &stream_name, cursor, batch_size).await;
                    let entries = match reply {
                        Ok(entries) => entries,
                        Err(err) => {
                            yield Err(RedisTransportError::from(err).into_bus_error());
                            break;
                        }
                    };
                    if entries.is_empty() {
                        break;
                    }
                    let mut batch = EventBatch::new();
                    for (id, fields) in &entries {
                        if let Ok(parsed) = StreamId::parse(id) {
                            if let Ok(msg) = deserializer.decode(parsed, fields) {
                                batch.push(msg);
                            }
                        }
                    }
                    if let Some((last_id, _)) = entries.last() {
                        cursor = StreamId::parse(last_id).unwrap_or(cursor);
                    }
                    yield Ok(batch);
                    if entries.len() < batch_size {
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

fn spawn_startup_then_steady_state(
    transport: &RedisEventTransport,
    streams: Vec<(String, EventSelector)>,
    group: String,
    tx: mpsc::Sender<BusResult<EventBatch>>,
    forever: bool,
) {
    let mut conn = transport.conn.clone();
    let consumer = transport.config.consumer_name.clone();
    let batch_size = transport.config.batch_size;
    let restart_delay = transport.config.consumption_restart_delay;
    let deserializer = Arc::clone(&transport.deserializer);
    let on_decode_error = transport.on_decode_error;
    let stream_use = transport.config.stream_use;

    tokio::spawn(async move {
        for (stream_name, selector) in &streams {
            loop {
                match drain_pending(
                    &mut conn,
                    stream_name,
                    &group,
                    &consumer,
                    batch_size,
                    &deserializer,
                    on_decode_error,
                    stream_use,
                    selector,
                    &tx,
                )
                .await
                {
                    Ok(()) => break,
                    Err(err) => {
                        // Transient transport failures never surface on the
                        // stream (spec.md §7): log, back off, and retry.
                        // `ConnectionManager` reconnects transparently
                        // underneath us; unacked entries stay pending, so
                        // nothing is lost while we wait.
                        tracing::warn!(error = %err, stream = %stream_name, "pending-recovery read failed, retrying");
                        tokio::time::sleep(restart_delay).await;
                    }
                }
            }
        }

        loop {
            match steady_state_once(
                &mut conn,
                &streams,
                &group,
                &consumer,
                batch_size,
                &deserializer,
                on_decode_error,
                stream_use,
            )
            .await
            {
                Ok(Some(batch)) => {
                    if tx.send(Ok(batch)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    // Caught up: `history`-style one-shot `consume` calls
                    // (spec.md §4.1 `forever`) stop here instead of
                    // blocking on the next `>` read.
                    if !forever {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "steady-state read failed, reconnecting after backoff");
                    tokio::time::sleep(restart_delay).await;
                }
            }
        }
    });
}

fn spawn_periodic_reclaim(
    transport: &RedisEventTransport,
    streams: Vec<(String, EventSelector)>,
    group: String,
    tx: mpsc::Sender<BusResult<EventBatch>>,
) {
    let mut conn = transport.conn.clone();
    let consumer = transport.config.consumer_name.clone();
    let ack_timeout = transport.config.acknowledgement_timeout;
    let deserializer = Arc::clone(&transport.deserializer);
    let batch_size = transport.config.batch_size;
    let interval = Duration::from_secs_f64((ack_timeout.as_secs_f64() * 0.5).max(1.0));

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for (stream_name, _selector) in &streams {
                match reclaim_idle(&mut conn, stream_name, &group, &consumer, ack_timeout, batch_size, &deserializer).await {
                    Ok(batch) if !batch.is_empty() => {
                        if tx.send(Ok(batch)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        // Same propagation policy as the steady-state loop:
                        // a transient failure here just means this reclaim
                        // sweep is skipped; the next one retries.
                        tracing::warn!(error = %err, stream = %stream_name, "reclaim sweep failed, will retry next interval");
                    }
                }
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn drain_pending(
    conn: &mut ConnectionManager,
    stream_name: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
    deserializer: &Arc<dyn EventSerializer>,
    on_decode_error: DecodeErrorPolicy,
    stream_use: StreamUse,
    selector: &EventSelector,
    tx: &mpsc::Sender<BusResult<EventBatch>>,
) -> RedisResult<()> {
    loop {
        let entries = xreadgroup(conn, stream_name, group, consumer, "0", batch_size, None).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let batch = decode_entries(conn, stream_name, group, entries, deserializer, on_decode_error, stream_use, selector).await?;
        if !batch.is_empty() && tx.send(Ok(batch)).await.is_err() {
            return Ok(());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn steady_state_once(
    conn: &mut ConnectionManager,
    streams: &[(String, EventSelector)],
    group: &str,
    consumer: &str,
    batch_size: usize,
    deserializer: &Arc<dyn EventSerializer>,
    on_decode_error: DecodeErrorPolicy,
    stream_use: StreamUse,
) -> RedisResult<Option<EventBatch>> {
    let mut combined = EventBatch::new();
    for (stream_name, selector) in streams {
        let entries = xreadgroup(conn, stream_name, group, consumer, ">", batch_size, Some(1000)).await?;
        if entries.is_empty() {
            continue;
        }
        let batch = decode_entries(conn, stream_name, group, entries, deserializer, on_decode_error, stream_use, selector).await?;
        combined.extend(batch);
    }
    if combined.is_empty() {
        Ok(None)
    } else {
        Ok(Some(combined))
    }
}

#[allow(clippy::too_many_arguments)]
async fn decode_entries(
    conn: &mut ConnectionManager,
    stream_name: &str,
    group: &str,
    entries: Vec<(String, FieldMap)>,
    deserializer: &Arc<dyn EventSerializer>,
    on_decode_error: DecodeErrorPolicy,
    stream_use: StreamUse,
    selector: &EventSelector,
) -> RedisResult<EventBatch> {
    let mut batch = EventBatch::new();
    for (id, fields) in entries {
        if fields.is_empty() {
            // Sentinel entry written by `XGROUP CREATE ... MKSTREAM` on
            // an empty stream. Drop silently (spec.md §4.1 edge case).
            continue;
        }
        let Ok(native_id) = StreamId::parse(&id) else { continue };
        match deserializer.decode(native_id, &fields) {
            Ok(mut msg) => {
                if stream_use == StreamUse::PerApi {
                    if let Some(expected) = &selector.event_name {
                        if &msg.event_name != expected {
                            xack(conn, stream_name, group, &id).await?;
                            continue;
                        }
                    }
                }
                msg.consumer_group = Some(group.to_string());
                batch.push(msg);
            }
            Err(reason) => {
                tracing::warn!(entry_id = %id, %reason, "failed to decode stream entry");
                if on_decode_error == DecodeErrorPolicy::AckAndDrop {
                    xack(conn, stream_name, group, &id).await?;
                }
            }
        }
    }
    Ok(batch)
}

async fn reclaim_idle(
    conn: &mut ConnectionManager,
    stream_name: &str,
    group: &str,
    consumer: &str,
    ack_timeout: Duration,
    batch_size: usize,
    deserializer: &Arc<dyn EventSerializer>,
) -> RedisResult<EventBatch> {
    let min_idle_ms = ack_timeout.as_millis() as usize;
    let pending_ids: Vec<String> = redis::cmd("XPENDING")
        .arg(stream_name)
        .arg(group)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(batch_size)
        .query_async(conn)
        .await
        .map(|reply: Vec<(String, String, i64, i64)>| reply.into_iter().map(|(id, ..)| id).collect())?;

    if pending_ids.is_empty() {
        return Ok(EventBatch::new());
    }

    let mut args = redis::cmd("XCLAIM");
    args.arg(stream_name).arg(group).arg(consumer).arg(min_idle_ms);
    for id in &pending_ids {
        args.arg(id);
    }
    let claimed: Vec<(String, FieldMap)> = args.query_async(conn).await?;

    let mut batch = EventBatch::new();
    for (id, fields) in claimed {
        if fields.is_empty() {
            continue;
        }
        if let Ok(native_id) = StreamId::parse(&id) {
            if let Ok(mut msg) = deserializer.decode(native_id, &fields) {
                msg.consumer_group = Some(group.to_string());
                batch.push(msg);
            }
        }
    }
    Ok(batch)
}

async fn send_event_raw(
    conn: &mut ConnectionManager,
    stream: &str,
    fields: &FieldMap,
    max_len: Option<usize>,
) -> RedisResult<StreamId> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream);
    if let Some(max_len) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*");
    for (key, value) in fields {
        cmd.arg(key).arg(value);
    }
    let id: String = cmd.query_async(conn).await?;
    StreamId::parse(&id).map_err(|e| RedisTransportError::Decode {
        entry_id: id,
        reason: e.to_string(),
    })
}

async fn ensure_group(conn: &mut ConnectionManager, stream: &str, group: &str, since: StreamId) -> RedisResult<()> {
    let start = if since == StreamId::ZERO { "0".to_string() } else { since.to_string() };
    let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg(start)
        .arg("MKSTREAM")
        .query_async(conn)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn xreadgroup(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
    id: &str,
    count: usize,
    block_ms: Option<usize>,
) -> RedisResult<Vec<(String, FieldMap)>> {
    let mut options = StreamReadOptions::default().group(group, consumer).count(count);
    if let Some(block_ms) = block_ms {
        options = options.block(block_ms);
    }
    let reply: StreamReadReply = conn.xread_options(&[stream], &[id], &options).await?;
    let mut entries = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            let fields: FieldMap = entry
                .map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    redis::Value::BulkString(bytes) => Some((k, String::from_utf8_lossy(&bytes).into_owned())),
                    redis::Value::SimpleString(s) => Some((k, s)),
                    _ => None,
                })
                .collect();
            entries.push((entry.id, fields));
        }
    }
    Ok(entries)
}

async fn xack(conn: &mut ConnectionManager, stream: &str, group: &str, id: &str) -> RedisResult<()> {
    let _: i64 = conn.xack(stream, group, &[id]).await?;
    Ok(())
}

async fn xrange(
    conn: &mut ConnectionManager,
    stream: &str,
    since: StreamId,
    count: usize,
) -> RedisResult<Vec<(String, FieldMap)>> {
    let start = if since == StreamId::ZERO { "-".to_string() } else { format!("({since}") };
    let reply: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
        .arg(stream)
        .arg(start)
        .arg("+")
        .arg("COUNT")
        .arg(count)
        .query_async(conn)
        .await?;
    Ok(reply
        .into_iter()
        .map(|(id, map)| {
            let fields: FieldMap = map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    redis::Value::BulkString(bytes) => Some((k, String::from_utf8_lossy(&bytes).into_owned())),
                    redis::Value::SimpleString(s) => Some((k, s)),
                    _ => None,
                })
                .collect();
            (id, fields)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kwargs() -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("field".to_string(), serde_json::json!("value"));
        kwargs
    }

    #[test]
    fn stream_name_respects_stream_use_mode() {
        let mut config = RedisTransportConfig::default();
        config.stream_use = StreamUse::PerEvent;
        assert_eq!(
            stream_name_for(config.stream_use, "my.api", "my_event"),
            "my.api.my_event:stream"
        );
        config.stream_use = StreamUse::PerApi;
        assert_eq!(stream_name_for(config.stream_use, "my.api", "my_event"), "my.api.*:stream");
    }

    fn stream_name_for(stream_use: StreamUse, api_name: &str, event_name: &str) -> String {
        match stream_use {
            StreamUse::PerEvent => format!("{api_name}.{event_name}:stream"),
            StreamUse::PerApi => format!("{api_name}.*:stream"),
        }
    }

    #[test]
    fn consumer_group_name_combines_service_and_listener() {
        let mut config = RedisTransportConfig::default();
        config.service_name = "orders".to_string();
        let transport_config = config;
        assert_eq!(format!("{}-{}", transport_config.service_name, "listener"), "orders-listener");
    }

    #[test]
    fn event_message_round_trip_through_by_field_fields() {
        let msg = EventMessage::new("123", "my.api", "my_event", sample_kwargs());
        let fields = ByFieldSerializer.encode(&msg);
        assert_eq!(fields.get("id").unwrap(), "123");
    }
}
