//! Typed shape of the recognized configuration surface (spec.md §6).
//!
//! Turning a config *file* into these structs (TOML/YAML parsing, env
//! overlay) is the non-goal external collaborator's job; only the
//! target shape and [`TransportSelector`]'s tagged-union mapping onto a
//! concrete backend (spec.md §9 "Dynamic configuration") are in scope
//! here. Grounded on the `serde`-derived config struct pattern used
//! across the teacher's `runtime`/`redpanda` crates for their own
//! backend settings.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// `bus.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Debug,
    /// Default.
    Info,
    /// `warning` in spec.md §6; renamed `Warning` to avoid clashing with
    /// `std::result::Result`'s unrelated `Warn` conventions elsewhere.
    Warning,
    /// Errors only.
    Error,
    /// Only unrecoverable conditions.
    Critical,
}

/// One transport kind's tagged-union configuration branch (spec.md §9
/// "Dynamic configuration maps onto a tagged union per transport kind").
/// The loader in `meshbus-redis::config` picks a branch and instantiates
/// the corresponding transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSelector {
    /// Redis-backed transport, parameters per spec.md §6 "Redis backend".
    Redis(RedisTransportConfig),
}

/// Stream-use mode (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamUse {
    /// Each `(api, event)` pair gets its own stream.
    #[default]
    PerEvent,
    /// One stream per API; consumers filter by event name.
    PerApi,
}

/// Which serializer strategy a Redis transport should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// One `:kwarg` field per argument.
    #[default]
    ByField,
    /// A single `:payload` field.
    Blob,
}

/// Redis-backend transport settings, field-for-field per spec.md §6
/// "Redis backend" and `test_from_config` in `original_source/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisTransportConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Additional connection parameters not expressible in the URL.
    pub connection_parameters: HashMap<String, String>,
    /// How many stream entries to request per `XREADGROUP` call.
    pub batch_size: usize,
    /// `PER_EVENT` or `PER_API` stream layout.
    pub stream_use: StreamUse,
    /// Logical service identity; governs consumer-group load-balancing.
    pub service_name: String,
    /// Stable per-process consumer identity within `service_name`.
    pub consumer_name: String,
    /// How long an unacked entry may stay idle before it is eligible for
    /// reclaim by another consumer.
    #[serde(with = "duration_secs")]
    pub acknowledgement_timeout: Duration,
    /// Approximate cap on stream length; `None` disables truncation.
    pub max_stream_length: Option<usize>,
    /// Delay before re-opening a connection after a transient failure.
    #[serde(with = "duration_secs")]
    pub consumption_restart_delay: Duration,
    /// Which [`SerializerKind`] to encode outgoing events with.
    pub serializer: SerializerKind,
    /// Which [`SerializerKind`] to expect on incoming events.
    pub deserializer: SerializerKind,
}

impl Default for RedisTransportConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_parameters: HashMap::new(),
            batch_size: 10,
            stream_use: StreamUse::default(),
            service_name: "default".to_string(),
            consumer_name: "default".to_string(),
            acknowledgement_timeout: Duration::from_secs(60),
            max_stream_length: None,
            consumption_restart_delay: Duration::from_secs(5),
            serializer: SerializerKind::default(),
            deserializer: SerializerKind::default(),
        }
    }
}

/// Per-API overrides: transport bindings, timeouts, and validation
/// toggles (spec.md §6 `apis.<name>.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Overrides the registry's `default` RPC transport for this API.
    pub rpc_transport: Option<String>,
    /// Overrides the registry's `default` result transport.
    pub result_transport: Option<String>,
    /// Overrides the registry's `default` event transport.
    pub event_transport: Option<String>,
    /// How long a caller waits for an RPC result before timing out.
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
    /// How long `consume` setup may take before timing out.
    #[serde(with = "duration_secs")]
    pub event_listener_setup_timeout: Duration,
    /// How long `send_event` may take before timing out.
    #[serde(with = "duration_secs")]
    pub event_fire_timeout: Duration,
    /// Whether to validate inbound RPC parameters/events.
    pub validate_incoming: bool,
    /// Whether to validate outbound RPC responses/fired events.
    pub validate_outgoing: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rpc_transport: None,
            result_transport: None,
            event_transport: None,
            rpc_timeout: Duration::from_secs(5),
            event_listener_setup_timeout: Duration::from_secs(10),
            event_fire_timeout: Duration::from_secs(5),
            validate_incoming: true,
            validate_outgoing: true,
        }
    }
}

/// A single plugin's enabled flag plus its own free-form settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Whether to load this plugin at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Plugin-specific settings, opaque to the core.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

const fn default_true() -> bool {
    true
}

/// The whole recognized config surface the core reads (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusConfig {
    /// `bus.log_level`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// `bus.schema.transport.<name>` — exactly one entry is expected.
    pub schema_transport: Option<TransportSelector>,
    /// `apis.<name>.*` overrides, keyed by API name.
    pub apis: HashMap<String, ApiConfig>,
    /// `apis.<name>.{rpc_transport,result_transport,event_transport}`'s
    /// backend definitions, keyed by the transport name referenced from
    /// `ApiConfig`/the `default` entry.
    pub transports: HashMap<String, TransportSelector>,
    /// `plugins.<plugin_id>.*`.
    pub plugins: HashMap<String, PluginConfig>,
}

impl BusConfig {
    /// The effective [`ApiConfig`] for `api_name`, falling back to
    /// [`ApiConfig::default`] if unconfigured.
    #[must_use]
    pub fn api_config(&self, api_name: &str) -> ApiConfig {
        self.apis.get(api_name).cloned().unwrap_or_default()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_config_falls_back_to_defaults_when_unconfigured() {
        let config = BusConfig::default();
        let api_config = config.api_config("auth");
        assert_eq!(api_config.rpc_timeout, Duration::from_secs(5));
        assert!(api_config.validate_incoming);
    }

    #[test]
    fn transport_selector_round_trips_through_json() {
        let selector = TransportSelector::Redis(RedisTransportConfig::default());
        let encoded = serde_json::to_string(&selector).unwrap();
        let decoded: TransportSelector = serde_json::from_str(&encoded).unwrap();
        match decoded {
            TransportSelector::Redis(cfg) => assert_eq!(cfg.url, "redis://127.0.0.1:6379/0"),
        }
    }

    #[test]
    fn redis_transport_config_defaults_match_spec_surface() {
        let cfg = RedisTransportConfig::default();
        assert_eq!(cfg.stream_use, StreamUse::PerEvent);
        assert_eq!(cfg.serializer, SerializerKind::ByField);
        assert!(cfg.max_stream_length.is_none());
    }
}
