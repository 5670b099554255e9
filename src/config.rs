//! Endpoint configuration: every constructor knob gathered into one
//! struct. Outbound synthetic loss is `Config::loss_probability`, read
//! by the endpoint's own send path, rather than process-wide state.

use std::time::Duration;

use crate::crypto::DhGroup;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub mss: usize,
    pub initial_cwnd: f64,
    pub initial_ssthresh: f64,
    pub rto_bounds: (Duration, Duration),
    pub timer_granularity: Duration,
    pub socket_recv_buf: usize,
    pub retry_bound: u32,
    pub send_completion_multiplier: u32,
    pub recv_completion_timeout: Duration,
    /// Cadence between SYN retransmissions while `connect` waits for a
    /// SYN-ACK.
    pub syn_retry_interval: Duration,
    /// How many times `connect` retransmits the original SYN before
    /// giving up (the initial send doesn't count as a retry).
    pub syn_retry_limit: u32,
    /// Wall-clock deadline for `listen` to observe a complete handshake.
    pub accept_timeout: Duration,
    /// Wall-clock deadline for `close` to observe the peer's FIN_ACK.
    pub fin_ack_timeout: Duration,
    /// Wall-clock deadline for the initiator's side of key exchange.
    pub key_exchange_initiator_timeout: Duration,
    /// Wall-clock deadline for the responder's side of key exchange.
    pub key_exchange_responder_timeout: Duration,
    pub recv_poll_interval: Duration,
    pub loss_probability: f64,
    pub dh_group: DhGroup,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mss: 1400,
            initial_cwnd: 1.0,
            initial_ssthresh: 64.0,
            rto_bounds: (Duration::from_millis(100), Duration::from_secs(10)),
            timer_granularity: Duration::from_millis(100),
            socket_recv_buf: 2048,
            retry_bound: 3,
            send_completion_multiplier: 3,
            recv_completion_timeout: Duration::from_secs(30),
            syn_retry_interval: Duration::from_secs(1),
            syn_retry_limit: 3,
            accept_timeout: Duration::from_secs(30),
            fin_ack_timeout: Duration::from_secs(2),
            key_exchange_initiator_timeout: Duration::from_secs(10),
            key_exchange_responder_timeout: Duration::from_secs(30),
            recv_poll_interval: Duration::from_millis(200),
            loss_probability: 0.0,
            dh_group: DhGroup::default(),
        }
    }
}

impl Config {
    /// Upper bound on how long `send_data` waits for every outstanding
    /// segment of a `total`-byte payload to be acknowledged, scaled by
    /// the current RTO estimate via `send_completion_multiplier` with a
    /// floor so small sends don't get an unreasonably short deadline.
    pub fn send_completion_timeout(&self, total: usize) -> Duration {
        let segments = (total / self.mss.max(1)).max(1) as u32;
        let per_segment = self.rto_bounds.1 * self.send_completion_multiplier;
        (per_segment * segments).min(self.recv_completion_timeout * 4)
    }

    /// Synthetic outbound drop used by tests and the `--loss` CLI flag;
    /// replaces the source's global `loss_filter`.
    pub fn should_drop_outbound(&self) -> bool {
        self.loss_probability > 0.0
            && rand::random::<f64>() < self.loss_probability
    }
}
