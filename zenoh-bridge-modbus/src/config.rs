//! Configuration for the Modbus bridge.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use modgate_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig, Result, ZenohConfig};
use modgate_common::keyexpr;

use crate::bridge::BridgeOptions;
use crate::frame::{Mode, ModePolicy};
use crate::poll::PollTask;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Bus endpoints and request handling
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Transport serving every mode without a route
    #[serde(default)]
    pub transport: TransportConfig,

    /// Per-mode transports, keyed by mode tag
    #[serde(default)]
    pub routes: HashMap<String, TransportConfig>,

    /// Scheduled polls
    #[serde(default)]
    pub polls: PollSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bus endpoints and request handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Prefix for status and health reports (default: "modgate/modbus")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Requests arrive below this key
    #[serde(default = "default_inbound_endpoint")]
    pub inbound_endpoint: String,

    /// Responses are published below this key
    #[serde(default = "default_outbound_endpoint")]
    pub outbound_endpoint: String,

    /// Upper bound on a single transport call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Age after which a pending request is evicted (default: 2x the request timeout)
    #[serde(default)]
    pub pending_ttl_ms: Option<u64>,

    /// How often pending requests are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// "strict" or "permissive" handling of unknown mode tags
    #[serde(default)]
    pub mode_policy: ModePolicy,

    /// Health report interval; 0 disables
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_key_prefix() -> String {
    "modgate/modbus".to_string()
}

fn default_inbound_endpoint() -> String {
    "modgate/modbus/request".to_string()
}

fn default_outbound_endpoint() -> String {
    "modgate/modbus/response".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_health_interval_secs() -> u64 {
    30
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            inbound_endpoint: default_inbound_endpoint(),
            outbound_endpoint: default_outbound_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            pending_ttl_ms: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            mode_policy: ModePolicy::default(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

impl BridgeSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(
            self.pending_ttl_ms
                .unwrap_or_else(|| self.request_timeout_ms.saturating_mul(2)),
        )
    }

    /// `None` when health reports are disabled.
    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }

    pub fn options(&self) -> BridgeOptions {
        BridgeOptions {
            request_timeout: self.request_timeout(),
            pending_ttl: self.pending_ttl(),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            mode_policy: self.mode_policy,
        }
    }
}

/// Scheduled polls and where their results go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSettings {
    /// Results are published below this key (default: "modgate/modbus/poll")
    #[serde(default = "default_poll_endpoint")]
    pub endpoint: String,

    /// Records kept per poll; 0 keeps none
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Polls created at startup
    #[serde(default)]
    pub tasks: Vec<PollTask>,
}

fn default_poll_endpoint() -> String {
    "modgate/modbus/poll".to_string()
}

fn default_history_size() -> usize {
    100
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            endpoint: default_poll_endpoint(),
            history_size: default_history_size(),
            tasks: Vec::new(),
        }
    }
}

/// Where accepted requests are handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Answer in-process: echo the request, or always send `reply`
    Loopback {
        #[serde(default)]
        reply: Option<Value>,
    },
    /// Forward to a device daemon over the bus and wait for its reply
    Downstream {
        request_endpoint: String,
        response_endpoint: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Loopback { reply: None }
    }
}

impl TransportConfig {
    /// Short name for logs and status metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Loopback { .. } => "loopback",
            TransportConfig::Downstream { .. } => "downstream",
        }
    }

    /// `claimed` are the bridge's own endpoints, by field name.
    fn validate(&self, name: &str, claimed: &[(&str, &str)]) -> Result<()> {
        let TransportConfig::Downstream {
            request_endpoint,
            response_endpoint,
        } = self
        else {
            return Ok(());
        };

        let request = format!("{}.request_endpoint", name);
        let response = format!("{}.response_endpoint", name);

        for (field, endpoint) in [(&request, request_endpoint), (&response, response_endpoint)] {
            keyexpr::validate_endpoint(endpoint)
                .map_err(|e| BridgeError::validation(format!("{}: {}", name, e)))?;

            for (other_field, other) in claimed {
                ensure_apart(field, endpoint, other_field, other)?;
            }
        }

        ensure_apart(&request, request_endpoint, &response, response_endpoint)
    }
}

/// Endpoints that are equal or nested would see each other's traffic.
fn ensure_apart(a_field: &str, a: &str, b_field: &str, b: &str) -> Result<()> {
    if keyexpr::overlaps(a, b) {
        return Err(BridgeError::validation(format!(
            "{} '{}' overlaps {} '{}'; endpoints must not be equal or nested",
            a_field, a, b_field, b
        )));
    }
    Ok(())
}

impl ModbusBridgeConfig {
    /// Route table with modes parsed under the configured policy.
    pub fn parsed_routes(&self) -> Result<Vec<(Mode, &TransportConfig)>> {
        let mut routes = Vec::with_capacity(self.routes.len());
        for (tag, transport) in &self.routes {
            let mode = Mode::parse(tag, self.bridge.mode_policy).ok_or_else(|| {
                BridgeError::validation(format!(
                    "routes: mode '{}' is not accepted under the '{}' policy",
                    tag,
                    match self.bridge.mode_policy {
                        ModePolicy::Strict => "strict",
                        ModePolicy::Permissive => "permissive",
                    }
                ))
            })?;
            routes.push((mode, transport));
        }
        routes.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Ok(routes)
    }
}

impl BridgeConfig for ModbusBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.bridge.key_prefix
    }

    fn validate(&self) -> Result<()> {
        let bridge = &self.bridge;

        let claimed = [
            ("inbound_endpoint", bridge.inbound_endpoint.as_str()),
            ("outbound_endpoint", bridge.outbound_endpoint.as_str()),
            ("polls.endpoint", self.polls.endpoint.as_str()),
        ];

        keyexpr::validate_endpoint(&bridge.key_prefix)
            .map_err(|e| BridgeError::validation(e.to_string()))?;
        for (_, endpoint) in claimed {
            keyexpr::validate_endpoint(endpoint)
                .map_err(|e| BridgeError::validation(e.to_string()))?;
        }

        for (i, (a_field, a)) in claimed.iter().enumerate() {
            for (b_field, b) in &claimed[i + 1..] {
                ensure_apart(a_field, a, b_field, b)?;
            }
        }

        if bridge.request_timeout_ms == 0 {
            return Err(BridgeError::validation("request_timeout_ms must be > 0"));
        }

        if bridge.pending_ttl() < bridge.request_timeout() {
            return Err(BridgeError::validation(format!(
                "pending_ttl_ms ({}) must be >= request_timeout_ms ({})",
                bridge.pending_ttl().as_millis(),
                bridge.request_timeout_ms
            )));
        }

        if bridge.sweep_interval_ms == 0 {
            return Err(BridgeError::validation("sweep_interval_ms must be > 0"));
        }

        self.transport.validate("transport", &claimed)?;
        for (mode, transport) in self.parsed_routes()? {
            transport.validate(&format!("routes.{}", mode), &claimed)?;
        }

        let mut names = HashSet::with_capacity(self.polls.tasks.len());
        for task in &self.polls.tasks {
            task.check(bridge.mode_policy)
                .map_err(|e| BridgeError::validation(format!("polls: {}", e)))?;
            if !names.insert(task.name.as_str()) {
                return Err(BridgeError::validation(format!(
                    "polls: name '{}' is used more than once",
                    task.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_minimal_config() {
        let config = ModbusBridgeConfig::from_json5("{}").unwrap();

        assert_eq!(config.zenoh.mode, "peer");
        assert_eq!(config.bridge, BridgeSettings::default());
        assert_eq!(config.transport, TransportConfig::Loopback { reply: None });
        assert!(config.routes.is_empty());
        assert_eq!(config.key_prefix(), "modgate/modbus");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            zenoh: { mode: "client", connect: ["tcp/127.0.0.1:7447"] },
            bridge: {
                key_prefix: "plant/modbus",
                inbound_endpoint: "plant/modbus/req",
                outbound_endpoint: "plant/modbus/res",
                request_timeout_ms: 1500,
                sweep_interval_ms: 250,
                mode_policy: "permissive",
                health_interval_secs: 0,
            },
            transport: {
                type: "downstream",
                request_endpoint: "plant/modbusd/req",
                response_endpoint: "plant/modbusd/res",
            },
            routes: {
                rtu: { type: "loopback", reply: { registers: [0] } },
            },
            logging: { level: "debug", format: "json" },
        }"#;

        let config = ModbusBridgeConfig::from_json5(json).unwrap();
        assert_eq!(config.zenoh.connect, vec!["tcp/127.0.0.1:7447"]);
        assert_eq!(config.bridge.mode_policy, ModePolicy::Permissive);
        assert_eq!(config.bridge.health_interval(), None);
        assert_eq!(config.transport.kind(), "downstream");

        let routes = config.parsed_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0, Mode::Rtu);
        assert_eq!(
            routes[0].1,
            &TransportConfig::Loopback {
                reply: Some(json!({"registers": [0]}))
            }
        );

        let options = config.bridge.options();
        assert_eq!(options.request_timeout, Duration::from_millis(1500));
        assert_eq!(options.pending_ttl, Duration::from_millis(3000));
        assert_eq!(options.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_same_inbound_and_outbound_rejected() {
        let json = r#"{
            bridge: { inbound_endpoint: "a/b", outbound_endpoint: "a/b" }
        }"#;
        let err = ModbusBridgeConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_nested_endpoints_rejected() {
        let nested = [
            r#"{ bridge: { inbound_endpoint: "m/bus", outbound_endpoint: "m/bus/resp" } }"#,
            r#"{ bridge: { inbound_endpoint: "m/bus/req", outbound_endpoint: "m/bus" } }"#,
            r#"{ polls: { endpoint: "modgate/modbus/request/poll" } }"#,
        ];
        for json in nested {
            let err = ModbusBridgeConfig::from_json5(json).unwrap_err();
            assert!(err.to_string().contains("overlaps"), "{}: {}", json, err);
        }

        // Siblings sharing a parent are fine.
        assert_ok!(ModbusBridgeConfig::from_json5(
            r#"{ bridge: { inbound_endpoint: "m/bus/req", outbound_endpoint: "m/bus/res" } }"#
        ));
    }

    #[test]
    fn test_wildcard_endpoint_rejected() {
        let json = r#"{ bridge: { inbound_endpoint: "modgate/**" } }"#;
        assert_err!(ModbusBridgeConfig::from_json5(json));
    }

    #[test]
    fn test_timeout_and_ttl_rules() {
        assert_err!(ModbusBridgeConfig::from_json5("{ bridge: { request_timeout_ms: 0 } }"));
        assert_err!(ModbusBridgeConfig::from_json5("{ bridge: { sweep_interval_ms: 0 } }"));

        let err = ModbusBridgeConfig::from_json5(
            "{ bridge: { request_timeout_ms: 1000, pending_ttl_ms: 500 } }",
        )
        .unwrap_err();
        assert!(err.to_string().contains("pending_ttl_ms"));

        let config = assert_ok!(ModbusBridgeConfig::from_json5(
            "{ bridge: { request_timeout_ms: 1000, pending_ttl_ms: 1000 } }",
        ));
        assert_eq!(config.bridge.pending_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_downstream_endpoints_must_not_collide() {
        let json = r#"{
            transport: {
                type: "downstream",
                request_endpoint: "modgate/modbus/request",
                response_endpoint: "modgate/modbusd/response",
            }
        }"#;
        let err = ModbusBridgeConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("inbound_endpoint"));

        let json = r#"{
            transport: {
                type: "downstream",
                request_endpoint: "modgate/modbusd/x",
                response_endpoint: "modgate/modbusd/x",
            }
        }"#;
        assert!(ModbusBridgeConfig::from_json5(json).is_err());

        // Daemon replies nested under the bridge's own responses.
        let json = r#"{
            transport: {
                type: "downstream",
                request_endpoint: "modgate/modbusd/req",
                response_endpoint: "modgate/modbus/response/daemon",
            }
        }"#;
        let err = ModbusBridgeConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("transport.response_endpoint"));

        let json = r#"{
            routes: {
                rtu: {
                    type: "downstream",
                    request_endpoint: "modgate/modbusd",
                    response_endpoint: "modgate/modbusd/res",
                },
            }
        }"#;
        let err = ModbusBridgeConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("routes.rtu"));
    }

    #[test]
    fn test_poll_tasks() {
        let json = r#"{
            polls: {
                history_size: 10,
                tasks: [
                    { name: "boiler", mode: "tcp", interval_ms: 5000, data: { fc: 3, addr: 0 } },
                    { name: "pump", mode: "rtu", enabled: false },
                ],
            },
        }"#;
        let config = assert_ok!(ModbusBridgeConfig::from_json5(json));
        assert_eq!(config.polls.endpoint, "modgate/modbus/poll");
        assert_eq!(config.polls.history_size, 10);
        assert_eq!(config.polls.tasks.len(), 2);
        assert_eq!(config.polls.tasks[1].interval_ms, 1000);
        assert!(!config.polls.tasks[1].enabled);
        assert_eq!(config.polls.tasks[0].data, json!({"fc": 3, "addr": 0}));

        let duplicate = r#"{ polls: { tasks: [
            { name: "a", mode: "tcp" }, { name: "a", mode: "rtu" },
        ] } }"#;
        assert_err!(ModbusBridgeConfig::from_json5(duplicate));

        let bad_mode = r#"{ polls: { tasks: [{ name: "a", mode: "canbus" }] } }"#;
        assert_err!(ModbusBridgeConfig::from_json5(bad_mode));

        let bad_name = r#"{ polls: { tasks: [{ name: "a/b", mode: "tcp" }] } }"#;
        assert_err!(ModbusBridgeConfig::from_json5(bad_name));
    }

    #[test]
    fn test_route_mode_must_fit_policy() {
        let json = r#"{ routes: { canbus: { type: "loopback" } } }"#;
        let err = ModbusBridgeConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("canbus"));

        let json = r#"{
            bridge: { mode_policy: "permissive" },
            routes: { canbus: { type: "loopback" } }
        }"#;
        let config = ModbusBridgeConfig::from_json5(json).unwrap();
        assert_eq!(
            config.parsed_routes().unwrap()[0].0,
            Mode::Other("canbus".to_string())
        );
    }

    #[test]
    fn test_unknown_transport_type() {
        let json = r#"{ transport: { type: "serial" } }"#;
        assert!(ModbusBridgeConfig::from_json5(json).is_err());
    }
}
