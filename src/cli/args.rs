//! Command-line argument definitions.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use flowtxn_core::config::ThriftTransport;
use flowtxn_core::{EngineConfig, Protocol, ProtocolConfig};

use super::OutputFormat;

/// `PROTOCOL=PORT[,PORT...]` from `--ports`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, ports) = s
            .split_once('=')
            .ok_or_else(|| format!("expected PROTOCOL=PORTS, got '{}'", s))?;
        let protocol = name.trim().parse::<Protocol>().map_err(|e| e.to_string())?;
        let ports = ports
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PortSpec { protocol, ports })
    }
}

/// Reconstruct request/response transactions from a packet capture.
#[derive(Parser, Debug)]
#[command(name = "flowtxn")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture file (pcap or pcapng, optionally gzip-compressed)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Decode a protocol on these server ports, e.g. `http=80,8080`.
    /// Repeatable; when given, only the listed protocols are decoded.
    #[arg(short = 'p', long = "ports", value_name = "PROTO=PORTS")]
    pub ports: Vec<PortSpec>,

    /// How long a request waits for its response, in milliseconds
    #[arg(long = "transaction-timeout", value_name = "MS")]
    pub transaction_timeout_ms: Option<u64>,

    /// Idle time after which a flow is dropped, in seconds
    #[arg(long = "flow-timeout", value_name = "SECS", default_value = "60")]
    pub flow_timeout_secs: u64,

    /// Unparsed bytes allowed per flow direction
    #[arg(long = "max-buffer", value_name = "BYTES", default_value = "10485760")]
    pub max_buffer: usize,

    /// Thrift messages are framed (4-byte length prefix)
    #[arg(long = "thrift-framed")]
    pub thrift_framed: bool,

    /// Capture time between expiry sweeps, in milliseconds
    #[arg(long = "sweep-interval", value_name = "MS", default_value = "1000")]
    pub sweep_interval_ms: u64,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Write transactions to a file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "OUTPUT_FILE")]
    pub output: Option<PathBuf>,

    /// Print replay and engine counters to stderr when done
    #[arg(long = "stats")]
    pub stats: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Engine configuration described by the flags.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = if self.ports.is_empty() {
            EngineConfig::default()
        } else {
            self.ports.iter().fold(EngineConfig::empty(), |config, spec| {
                config.with_protocol(ProtocolConfig::new(spec.protocol, spec.ports.clone()))
            })
        };

        if let Some(ms) = self.transaction_timeout_ms {
            let us = i64::try_from(ms.saturating_mul(1000)).unwrap_or(i64::MAX);
            for protocol in &mut config.protocols {
                protocol.transaction_timeout_us = us;
            }
        }
        config.flow_timeout_us =
            i64::try_from(self.flow_timeout_secs.saturating_mul(1_000_000)).unwrap_or(i64::MAX);
        config.max_buffer_bytes = self.max_buffer;
        if self.thrift_framed {
            config.decoder.thrift_transport = ThriftTransport::Framed;
        }
        config
    }

    pub fn sweep_interval_us(&self) -> i64 {
        i64::try_from(self.sweep_interval_ms.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}
