//! Packet-level metrics collection and JSON export.
//!
//! A `Mutex`-guarded sink accumulating two record shapes (per-packet,
//! per-throughput-sample) fed directly by the engine's receive/timer/
//! application call sites, dumped to JSON on demand.

use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::congestion::CongestionState;

#[derive(Debug, Clone, Serialize)]
pub struct PacketMetric {
    pub elapsed_secs: f64,
    pub seq_num: u32,
    pub size: usize,
    pub is_retransmission: bool,
    pub rtt_secs: Option<f64>,
    pub cwnd: f64,
    pub ssthresh: f64,
    pub congestion_state: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSample {
    pub elapsed_secs: f64,
    pub bytes_acked: u64,
    pub packets_in_flight: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub experiment_name: String,
    pub total_packets_sent: usize,
    pub total_retransmissions: usize,
    pub loss_rate: f64,
    pub total_bytes_acked: u64,
    pub avg_rtt_secs: f64,
    pub min_rtt_secs: f64,
    pub max_rtt_secs: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Serialize)]
struct MetricsDump {
    summary: MetricsSummary,
    packet_metrics: Vec<PacketMetric>,
    throughput_samples: Vec<ThroughputSample>,
}

struct Inner {
    packet_metrics: Vec<PacketMetric>,
    throughput_samples: Vec<ThroughputSample>,
    total_bytes_acked: u64,
    started_at: Instant,
}

pub struct MetricsSink {
    experiment_name: String,
    inner: Mutex<Inner>,
}

impl MetricsSink {
    pub fn new(experiment_name: impl Into<String>) -> Self {
        MetricsSink {
            experiment_name: experiment_name.into(),
            inner: Mutex::new(Inner {
                packet_metrics: Vec::new(),
                throughput_samples: Vec::new(),
                total_bytes_acked: 0,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn record_packet_sent(
        &self,
        seq_num: u32,
        size: usize,
        is_retransmission: bool,
        cwnd: f64,
        ssthresh: f64,
        congestion_state: CongestionState,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let elapsed_secs = inner.started_at.elapsed().as_secs_f64();
        inner.packet_metrics.push(PacketMetric {
            elapsed_secs,
            seq_num,
            size,
            is_retransmission,
            rtt_secs: None,
            cwnd,
            ssthresh,
            congestion_state: state_label(congestion_state),
        });
    }

    pub fn record_ack(&self, seq_num: u32, rtt_secs: f64, acked_bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(metric) = inner
            .packet_metrics
            .iter_mut()
            .rev()
            .find(|m| m.seq_num == seq_num && m.rtt_secs.is_none())
        {
            metric.rtt_secs = Some(rtt_secs);
        }
        inner.total_bytes_acked += acked_bytes as u64;
    }

    pub fn sample_throughput(&self, packets_in_flight: usize) {
        let mut inner = self.inner.lock().unwrap();
        let elapsed_secs = inner.started_at.elapsed().as_secs_f64();
        let bytes_acked = inner.total_bytes_acked;
        inner.throughput_samples.push(ThroughputSample {
            elapsed_secs,
            bytes_acked,
            packets_in_flight,
        });
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().unwrap();
        let rtts: Vec<f64> = inner
            .packet_metrics
            .iter()
            .filter_map(|m| m.rtt_secs)
            .collect();

        let (avg, min, max) = if rtts.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = rtts.iter().sum();
            (
                sum / rtts.len() as f64,
                rtts.iter().cloned().fold(f64::INFINITY, f64::min),
                rtts.iter().cloned().fold(0.0, f64::max),
            )
        };

        let total = inner.packet_metrics.len();
        let retransmissions = inner
            .packet_metrics
            .iter()
            .filter(|m| m.is_retransmission)
            .count();

        MetricsSummary {
            experiment_name: self.experiment_name.clone(),
            total_packets_sent: total,
            total_retransmissions: retransmissions,
            loss_rate: if total > 0 {
                retransmissions as f64 / total as f64
            } else {
                0.0
            },
            total_bytes_acked: inner.total_bytes_acked,
            avg_rtt_secs: avg,
            min_rtt_secs: min,
            max_rtt_secs: max,
            duration_secs: inner.started_at.elapsed().as_secs_f64(),
        }
    }

    pub fn snapshot(&self) -> (Vec<PacketMetric>, Vec<ThroughputSample>) {
        let inner = self.inner.lock().unwrap();
        (inner.packet_metrics.clone(), inner.throughput_samples.clone())
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        let (packet_metrics, throughput_samples) = self.snapshot();
        let dump = MetricsDump {
            summary: self.summary(),
            packet_metrics,
            throughput_samples,
        };
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &dump)?;
        Ok(())
    }
}

fn state_label(state: CongestionState) -> &'static str {
    match state {
        CongestionState::SlowStart => "SLOW_START",
        CongestionState::CongestionAvoidance => "CONGESTION_AVOIDANCE",
        CongestionState::FastRecovery => "FAST_RECOVERY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reflects_recorded_packets() {
        let sink = MetricsSink::new("test");
        sink.record_packet_sent(0, 1400, false, 4.0, 64.0, CongestionState::SlowStart);
        sink.record_packet_sent(1400, 1400, true, 4.0, 64.0, CongestionState::SlowStart);
        sink.record_ack(0, 0.05, 1400);

        let summary = sink.summary();
        assert_eq!(summary.total_packets_sent, 2);
        assert_eq!(summary.total_retransmissions, 1);
        assert_eq!(summary.total_bytes_acked, 1400);
        assert!((summary.avg_rtt_secs - 0.05).abs() < 1e-9);
    }
}
