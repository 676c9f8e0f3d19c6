//! Link configuration.
//!
//! Everything here is plain `serde` data so embedding hosts can keep it in
//! whatever file format they already use. Defaults match a single-node
//! development setup against a local MQTT broker.

use crate::correlation::{DEFAULT_COMPLETION_TTL, DEFAULT_STREAM_TTL};
use crate::error::LinkError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete settings for one [`LinkBus`](crate::LinkBus).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default)]
    pub correlation: CorrelationSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

impl LinkSettings {
    /// Checks the settings for values that cannot work.
    pub fn validate(&self) -> Result<(), LinkError> {
        self.correlation.validate()?;
        self.transport.validate()
    }
}

/// Pending-request lifetimes and dispatcher sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationSettings {
    /// Lifetime of a boolean completion, in seconds
    #[serde(default = "default_completion_ttl_secs")]
    pub completion_ttl_secs: u64,
    /// Lifetime of a stream registration, in seconds
    #[serde(default = "default_stream_ttl_secs")]
    pub stream_ttl_secs: u64,
    /// Frames buffered between the transports and the dispatcher
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
}

fn default_completion_ttl_secs() -> u64 {
    DEFAULT_COMPLETION_TTL.as_secs()
}

fn default_stream_ttl_secs() -> u64 {
    DEFAULT_STREAM_TTL.as_secs()
}

fn default_inbound_queue_capacity() -> usize {
    1024
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            completion_ttl_secs: default_completion_ttl_secs(),
            stream_ttl_secs: default_stream_ttl_secs(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
        }
    }
}

impl CorrelationSettings {
    pub fn completion_ttl(&self) -> Duration {
        Duration::from_secs(self.completion_ttl_secs)
    }

    pub fn stream_ttl(&self) -> Duration {
        Duration::from_secs(self.stream_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.completion_ttl_secs == 0 {
            return Err(LinkError::Configuration(
                "completion_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.stream_ttl_secs == 0 {
            return Err(LinkError::Configuration(
                "stream_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(LinkError::Configuration(
                "inbound_queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which transport carries the link, with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSettings {
    Relay(RelaySettings),
    Mqtt(MqttSettings),
    Pulsar(PulsarSettings),
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings::Mqtt(MqttSettings::default())
    }
}

impl TransportSettings {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TransportSettings::Relay(_) => "relay",
            TransportSettings::Mqtt(_) => "mqtt",
            TransportSettings::Pulsar(_) => "pulsar",
        }
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        match self {
            TransportSettings::Relay(relay) => {
                if relay.queue_capacity == 0 {
                    return Err(LinkError::Configuration(
                        "relay queue_capacity must be greater than zero".to_string(),
                    ));
                }
                if relay.reply_route_ttl_secs == 0 {
                    return Err(LinkError::Configuration(
                        "relay reply_route_ttl_secs must be greater than zero".to_string(),
                    ));
                }
            }
            TransportSettings::Mqtt(mqtt) => mqtt.validate()?,
            TransportSettings::Pulsar(pulsar) => pulsar.validate()?,
        }
        Ok(())
    }
}

fn validate_topic(topic: &str) -> Result<(), LinkError> {
    if topic.trim().is_empty() {
        return Err(LinkError::Configuration("topic cannot be empty".to_string()));
    }
    Ok(())
}

/// In-band relay options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Frames held while no carrier can take them; the oldest is dropped on overflow
    #[serde(default = "default_relay_queue_capacity")]
    pub queue_capacity: usize,
    /// Proxy side: how long replies to a forwarded request are passed back to
    /// the server that sent it
    #[serde(default = "default_reply_route_ttl_secs")]
    pub reply_route_ttl_secs: u64,
}

fn default_relay_queue_capacity() -> usize {
    256
}

fn default_reply_route_ttl_secs() -> u64 {
    60
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_relay_queue_capacity(),
            reply_route_ttl_secs: default_reply_route_ttl_secs(),
        }
    }
}

impl RelaySettings {
    pub fn reply_route_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_route_ttl_secs)
    }
}

/// MQTT broker options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// The single topic every node publishes to and subscribes on
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Client id; generated from the node name when unset
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "horizon-link".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_clean_session() -> bool {
    true
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_topic(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: default_clean_session(),
            retry: RetryPolicy::default(),
        }
    }
}

impl MqttSettings {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.host.trim().is_empty() {
            return Err(LinkError::Configuration("mqtt host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(LinkError::Configuration("mqtt port cannot be 0".to_string()));
        }
        validate_topic(&self.topic)?;
        if self.topic.contains(['+', '#']) {
            return Err(LinkError::Configuration(format!(
                "mqtt topic '{}' must not contain wildcards",
                self.topic
            )));
        }
        Ok(())
    }
}

/// Pulsar broker options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsarSettings {
    #[serde(default = "default_pulsar_url")]
    pub service_url: String,
    #[serde(default = "default_pulsar_topic")]
    pub topic: String,
    /// Prefix of the per-node exclusive subscription name
    #[serde(default = "default_subscription_prefix")]
    pub subscription_prefix: String,
    /// JWT for token authentication
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_pulsar_url() -> String {
    "pulsar://127.0.0.1:6650".to_string()
}

fn default_pulsar_topic() -> String {
    "persistent://public/default/horizon-link".to_string()
}

fn default_subscription_prefix() -> String {
    "horizon-link".to_string()
}

impl Default for PulsarSettings {
    fn default() -> Self {
        Self {
            service_url: default_pulsar_url(),
            topic: default_pulsar_topic(),
            subscription_prefix: default_subscription_prefix(),
            auth_token: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl PulsarSettings {
    pub fn validate(&self) -> Result<(), LinkError> {
        if !self.service_url.starts_with("pulsar://") && !self.service_url.starts_with("pulsar+ssl://") {
            return Err(LinkError::Configuration(format!(
                "pulsar service_url '{}' must start with pulsar:// or pulsar+ssl://",
                self.service_url
            )));
        }
        validate_topic(&self.topic)?;
        if self.subscription_prefix.trim().is_empty() {
            return Err(LinkError::Configuration(
                "pulsar subscription_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = LinkSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.correlation.completion_ttl(), Duration::from_secs(60));
        assert_eq!(settings.correlation.stream_ttl(), Duration::from_secs(1800));
        assert_eq!(settings.transport.kind_name(), "mqtt");
    }

    #[test]
    fn transport_kind_is_a_tag() {
        let settings: LinkSettings = serde_json::from_value(serde_json::json!({
            "transport": { "kind": "pulsar", "topic": "persistent://games/link/main" }
        }))
        .unwrap();
        match &settings.transport {
            TransportSettings::Pulsar(pulsar) => {
                assert_eq!(pulsar.topic, "persistent://games/link/main");
                assert_eq!(pulsar.service_url, "pulsar://127.0.0.1:6650");
            }
            other => panic!("expected pulsar settings, got {other:?}"),
        }
        assert_eq!(settings.correlation, CorrelationSettings::default());
    }

    #[test]
    fn relay_settings_parse() {
        let settings: TransportSettings =
            serde_json::from_value(serde_json::json!({ "kind": "relay", "queue_capacity": 8 })).unwrap();
        assert_eq!(settings, TransportSettings::Relay(RelaySettings { queue_capacity: 8, ..Default::default() }));
    }

    #[test]
    fn rejects_unusable_values() {
        let mut settings = LinkSettings::default();
        settings.correlation.completion_ttl_secs = 0;
        assert!(matches!(settings.validate(), Err(LinkError::Configuration(_))));

        let wildcard = TransportSettings::Mqtt(MqttSettings {
            topic: "horizon/#".to_string(),
            ..Default::default()
        });
        assert!(wildcard.validate().is_err());

        let http = TransportSettings::Pulsar(PulsarSettings {
            service_url: "http://localhost:8080".to_string(),
            ..Default::default()
        });
        assert!(http.validate().is_err());

        let empty_relay = TransportSettings::Relay(RelaySettings { queue_capacity: 0, ..Default::default() });
        assert!(empty_relay.validate().is_err());
    }
}
