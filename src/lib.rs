//! TRUDP: a reliable, connection-oriented, in-order byte-stream transport
//! over UDP, with AIMD congestion control, RFC 6298-style RTT estimation,
//! and optional in-band Diffie-Hellman key agreement for confidentiality.

mod config;
mod congestion;
mod connection;
mod crypto;
mod endpoint;
mod error;
mod metrics;
mod monitor;
mod packet;
mod rtt;

pub use config::Config;
pub use congestion::CongestionState;
pub use crypto::DhGroup;
pub use endpoint::{CongestionStats, Endpoint, RttStats};
pub use error::{Error, Result};
pub use metrics::{MetricsSink, MetricsSummary, PacketMetric, ThroughputSample};
pub use monitor::{print_snapshot, render_panel, snapshot_from_endpoint};
