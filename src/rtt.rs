//! Round-trip time estimation and derived retransmission timeout.
//!
//! RFC 6298-style SRTT/RTTVAR smoothing with Karn's algorithm applied by
//! the caller (only genuine, non-retransmitted samples are fed in).

use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const K: f64 = 4.0;
const RTO_FLOOR: f64 = 0.1;
const RTO_CEILING: f64 = 10.0;
const MAX_SAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    samples: Vec<f64>,
    min_rtt: f64,
    max_rtt: f64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            srtt: None,
            rttvar: 0.0,
            samples: Vec::with_capacity(MAX_SAMPLES),
            min_rtt: 0.0001,
            max_rtt: 2.0,
        }
    }
}

impl RttEstimator {
    pub fn with_bounds(min_rtt: Duration, max_rtt: Duration) -> Self {
        RttEstimator {
            min_rtt: min_rtt.as_secs_f64(),
            max_rtt: max_rtt.as_secs_f64(),
            ..Default::default()
        }
    }

    /// Feeds an RTT sample if it falls inside `[min_rtt, max_rtt]`, or if
    /// it's the very first sample ever observed (tolerates a slow initial
    /// handshake round trip rather than discarding it outright).
    pub fn sample(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64();
        let in_bounds = sample >= self.min_rtt && sample <= self.max_rtt;
        if !in_bounds && self.srtt.is_some() {
            return;
        }

        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2.0;
            }
            Some(srtt) => {
                self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (srtt - sample).abs();
                self.srtt = Some((1.0 - ALPHA) * srtt + ALPHA * sample);
            }
        }

        self.samples.push(sample);
        if self.samples.len() > MAX_SAMPLES {
            self.samples.remove(0);
        }
    }

    pub fn rto(&self) -> Duration {
        let srtt = self.srtt.unwrap_or(1.0);
        let rtt_floor = self.rttvar.max(0.01);
        let rto = (srtt + K * rtt_floor).clamp(RTO_FLOOR, RTO_CEILING);
        Duration::from_secs_f64(rto)
    }

    pub fn avg(&self) -> f64 {
        self.srtt.unwrap_or(0.0)
    }

    pub fn dev(&self) -> f64 {
        self.rttvar
    }

    pub fn min(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().cloned().fold(f64::INFINITY, f64::min)
        }
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().cloned().fold(0.0, f64::max)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
