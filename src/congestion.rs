//! AIMD congestion control: slow start, congestion avoidance, fast
//! recovery, with a duplicate-ACK counter that resets on every fresh
//! cumulative ACK rather than only on a new-data ACK (see DESIGN.md).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

#[derive(Debug, Clone)]
pub struct CongestionController {
    cwnd: f64,
    ssthresh: f64,
    state: CongestionState,
    dup_ack_count: u32,
    last_ack: u32,
    has_last_ack: bool,
}

impl CongestionController {
    pub fn new(initial_cwnd: f64, initial_ssthresh: f64) -> Self {
        CongestionController {
            cwnd: initial_cwnd.max(1.0),
            ssthresh: initial_ssthresh.max(2.0),
            state: CongestionState::SlowStart,
            dup_ack_count: 0,
            last_ack: 0,
            has_last_ack: false,
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    /// Window (in segments) the send loop is allowed to keep in flight.
    pub fn window_size(&self) -> usize {
        self.cwnd.floor().max(1.0) as usize
    }

    /// Feed an inbound ACK. `acked_new_bytes` is true when this ACK moved
    /// the send buffer forward (i.e. it isn't purely a duplicate of the
    /// last cumulative ACK observed by the sender). Returns true if this
    /// ACK pushed the controller into fast recovery.
    pub fn on_ack(&mut self, ack_num: u32, acked_new_bytes: bool) -> bool {
        if self.has_last_ack && ack_num <= self.last_ack {
            self.dup_ack_count += 1;
            if self.dup_ack_count >= 3 {
                self.enter_fast_recovery();
                return true;
            }
            return false;
        }

        self.last_ack = ack_num;
        self.has_last_ack = true;
        self.dup_ack_count = 0;

        if acked_new_bytes {
            self.on_new_data_ack();
        }
        false
    }

    fn on_new_data_ack(&mut self) {
        match self.state {
            CongestionState::SlowStart => {
                self.cwnd += 1.0;
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
            CongestionState::CongestionAvoidance => {
                self.cwnd += 1.0 / self.cwnd;
            }
            CongestionState::FastRecovery => {
                self.cwnd = self.ssthresh;
                self.state = CongestionState::CongestionAvoidance;
            }
        }
    }

    fn enter_fast_recovery(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(2.0);
        self.cwnd = self.ssthresh;
        self.state = CongestionState::FastRecovery;
    }

    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(2.0);
        self.cwnd = 1.0;
        self.state = CongestionState::SlowStart;
        self.dup_ack_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_by_one_per_ack_until_ssthresh() {
        let mut cc = CongestionController::new(1.0, 4.0);
        cc.on_ack(100, true);
        cc.on_ack(200, true);
        cc.on_ack(300, true);
        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);
        assert_eq!(cc.cwnd(), 4.0);
    }

    #[test]
    fn congestion_avoidance_grows_by_reciprocal() {
        let mut cc = CongestionController::new(4.0, 4.0);
        cc.on_ack(100, true);
        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);
        assert!((cc.cwnd() - 4.25).abs() < 1e-9);
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_recovery() {
        let mut cc = CongestionController::new(10.0, 64.0);
        cc.on_ack(500, true);
        assert!(!cc.on_ack(500, false));
        assert!(!cc.on_ack(500, false));
        assert!(cc.on_ack(500, false));
        assert_eq!(cc.state(), CongestionState::FastRecovery);
        assert_eq!(cc.ssthresh(), 5.0);
        assert_eq!(cc.cwnd(), 5.0);

        cc.on_ack(600, true);
        assert_eq!(cc.state(), CongestionState::CongestionAvoidance);
        assert_eq!(cc.cwnd(), 5.0);
    }

    #[test]
    fn timeout_resets_to_slow_start() {
        let mut cc = CongestionController::new(16.0, 64.0);
        cc.on_timeout();
        assert_eq!(cc.state(), CongestionState::SlowStart);
        assert_eq!(cc.cwnd(), 1.0);
        assert_eq!(cc.ssthresh(), 8.0);
        assert_eq!(cc.dup_ack_count(), 0);
    }

    #[test]
    fn window_size_floors_and_has_minimum_one() {
        let cc = CongestionController::new(1.4, 64.0);
        assert_eq!(cc.window_size(), 1);
    }
}
