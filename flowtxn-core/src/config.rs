//! Engine configuration.
//!
//! Everything has a usable default; [`EngineConfig::validate`] catches the
//! mistakes that would otherwise only show up as silently missing
//! transactions (overlapping ports, zero timeouts).

use std::collections::HashMap;

use crate::decoder::Protocol;
use crate::error::ConfigError;
use crate::queue::QueueLimits;

/// Per-protocol settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub protocol: Protocol,
    /// Server ports that identify this protocol.
    pub ports: Vec<u16>,
    /// How long a request waits for its response (microseconds).
    pub transaction_timeout_us: i64,
}

impl ProtocolConfig {
    pub fn new(protocol: Protocol, ports: impl Into<Vec<u16>>) -> Self {
        Self {
            protocol,
            ports: ports.into(),
            transaction_timeout_us: DEFAULT_TRANSACTION_TIMEOUT_US,
        }
    }
}

/// 10 seconds.
pub const DEFAULT_TRANSACTION_TIMEOUT_US: i64 = 10_000_000;

/// Caps on decoded field values.
///
/// These bound what decoders copy out of the buffer, independently of the
/// buffer cap itself. Oversized values are truncated and flagged, never
/// rejected. A cap of 0 disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLimits {
    /// Thrift and Redis string values, MySQL execute parameters.
    pub max_string_len: usize,
    /// Thrift list/set/map elements and struct fields shown.
    pub max_collection_len: usize,
    /// Thrift structs with more fields than this are treated as corrupt.
    pub max_struct_fields: usize,
    /// Rendered SQL row length.
    pub max_row_length: usize,
    /// SQL rows kept per result set (all rows are still counted).
    pub max_rows: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            max_string_len: 200,
            max_collection_len: 15,
            max_struct_fields: 100,
            max_row_length: 1024,
            max_rows: 10,
        }
    }
}

/// Thrift transport framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThriftTransport {
    /// Messages written directly to the socket.
    #[default]
    Socket,
    /// Each message preceded by a 4-byte big-endian frame length.
    Framed,
}

/// Options handed to every decoder instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderOptions {
    pub limits: FieldLimits,
    pub thrift_transport: ThriftTransport,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Enabled protocols and their ports.
    pub protocols: Vec<ProtocolConfig>,
    /// Unconsumed bytes allowed per flow direction before the flow is torn down.
    pub max_buffer_bytes: usize,
    /// Idle time after which a flow is evicted (microseconds).
    pub flow_timeout_us: i64,
    /// Ceilings for pipelined request queues.
    pub queue: QueueLimits,
    pub decoder: DecoderOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocols: vec![
                ProtocolConfig::new(Protocol::Http, [80, 8080, 8000, 5000, 8002]),
                ProtocolConfig::new(Protocol::Mysql, [3306]),
                ProtocolConfig::new(Protocol::Pgsql, [5432]),
                ProtocolConfig::new(Protocol::Redis, [6379]),
                ProtocolConfig::new(Protocol::Thrift, [9090]),
            ],
            max_buffer_bytes: 10 * 1024 * 1024, // 10 MB per direction
            flow_timeout_us: 60_000_000,        // 1 minute
            queue: QueueLimits::default(),
            decoder: DecoderOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Config with no protocols enabled.
    pub fn empty() -> Self {
        Self {
            protocols: Vec::new(),
            ..Self::default()
        }
    }

    /// Enable a protocol, replacing any existing entry for it.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocols.retain(|p| p.protocol != protocol.protocol);
        self.protocols.push(protocol);
        self
    }

    /// Config entry for a protocol, if enabled.
    pub fn protocol(&self, protocol: Protocol) -> Option<&ProtocolConfig> {
        self.protocols.iter().find(|p| p.protocol == protocol)
    }

    pub fn protocol_mut(&mut self, protocol: Protocol) -> Option<&mut ProtocolConfig> {
        self.protocols.iter_mut().find(|p| p.protocol == protocol)
    }

    /// Transaction timeout for a protocol (default when not enabled).
    pub fn transaction_timeout(&self, protocol: Protocol) -> i64 {
        self.protocol(protocol)
            .map(|p| p.transaction_timeout_us)
            .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_US)
    }

    /// Build the static port -> protocol table used for flow classification.
    pub fn port_map(&self) -> Result<HashMap<u16, Protocol>, ConfigError> {
        let mut map = HashMap::new();
        for cfg in &self.protocols {
            for &port in &cfg.ports {
                if let Some(&first) = map.get(&port) {
                    if first != cfg.protocol {
                        return Err(ConfigError::PortConflict {
                            port,
                            first,
                            second: cfg.protocol,
                        });
                    }
                }
                map.insert(port, cfg.protocol);
            }
        }
        if map.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        Ok(map)
    }

    /// Check the configuration for conflicts and nonsensical values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.port_map()?;
        if self.flow_timeout_us <= 0 {
            return Err(ConfigError::NonPositiveTimeout {
                name: "flow_timeout",
                value_us: self.flow_timeout_us,
            });
        }
        for cfg in &self.protocols {
            if cfg.transaction_timeout_us <= 0 {
                return Err(ConfigError::NonPositiveTimeout {
                    name: "transaction_timeout",
                    value_us: cfg.transaction_timeout_us,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        let map = config.port_map().unwrap();
        assert_eq!(map.get(&3306), Some(&Protocol::Mysql));
        assert_eq!(map.get(&6379), Some(&Protocol::Redis));
        assert_eq!(map.get(&22), None);
    }

    #[test]
    fn test_port_conflict() {
        let config = EngineConfig::default()
            .with_protocol(ProtocolConfig::new(Protocol::Redis, [6379, 80]));
        assert_eq!(
            config.validate(),
            Err(ConfigError::PortConflict {
                port: 80,
                first: Protocol::Http,
                second: Protocol::Redis,
            })
        );
    }

    #[test]
    fn test_with_protocol_replaces() {
        let config =
            EngineConfig::default().with_protocol(ProtocolConfig::new(Protocol::Mysql, [3307]));
        assert_eq!(config.protocol(Protocol::Mysql).unwrap().ports, vec![3307]);
        assert_eq!(config.protocols.len(), 5);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = EngineConfig::default();
        config.protocol_mut(Protocol::Http).unwrap().transaction_timeout_us = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveTimeout { .. })
        ));

        assert_eq!(EngineConfig::empty().validate(), Err(ConfigError::NoPorts));
    }
}
