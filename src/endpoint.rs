//! Concurrency and orchestration glue: owns the UDP socket, runs a
//! receive thread and a retransmission-timer thread, and exposes a
//! blocking `open`/`listen`/`send_data`/`recv_data`/`close` surface.
//!
//! Generalizes an `Arc<Mutex<Manager>>` plus per-stream
//! `rvar`/`wvar`/`svar` `Condvar` pattern down to a single
//! `Mutex<Connection>` shared by one set of condvars,
//! since an endpoint here speaks to exactly one peer rather than
//! juggling a table of streams.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::{Action, ConnState, Connection};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::packet::{Packet, PacketType};

struct Shared {
    conn: Mutex<Connection>,
    handshake_cv: Condvar,
    key_cv: Condvar,
    data_cv: Condvar,
    send_cv: Condvar,
    close_cv: Condvar,
    shutdown: Mutex<bool>,
}

pub struct Endpoint {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    config: Config,
    metrics: Mutex<Option<Arc<MetricsSink>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Endpoint {
    fn new(socket: UdpSocket, config: Config) -> Result<Arc<Self>> {
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let conn = Connection::with_congestion_window(
            config.dh_group,
            config.retry_bound,
            config.mss,
            config.initial_cwnd,
            config.initial_ssthresh,
            crate::rtt::RttEstimator::with_bounds(config.rto_bounds.0, config.rto_bounds.1),
        );

        let shared = Arc::new(Shared {
            conn: Mutex::new(conn),
            handshake_cv: Condvar::new(),
            key_cv: Condvar::new(),
            data_cv: Condvar::new(),
            send_cv: Condvar::new(),
            close_cv: Condvar::new(),
            shutdown: Mutex::new(false),
        });

        let endpoint = Arc::new(Endpoint {
            socket: Arc::new(socket),
            shared,
            config,
            metrics: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });

        endpoint.spawn_background_threads();
        Ok(endpoint)
    }

    /// Attach a metrics sink; packets sent/acked after this call are
    /// recorded. Safe to call at any point in the endpoint's lifetime.
    pub fn set_metrics_sink(&self, sink: Arc<MetricsSink>) {
        *self.metrics.lock().unwrap() = Some(sink);
    }

    pub fn metrics_sink(&self) -> Option<Arc<MetricsSink>> {
        self.metrics.lock().unwrap().clone()
    }

    fn spawn_background_threads(self: &Arc<Self>) {
        let recv_ep = Arc::clone(self);
        let recv_handle = thread::spawn(move || recv_ep.receive_loop());

        let timer_ep = Arc::clone(self);
        let timer_handle = thread::spawn(move || timer_ep.timer_loop());

        let mut threads = self.threads.lock().unwrap();
        threads.push(recv_handle);
        threads.push(timer_handle);
    }

    /// Active open: bind an ephemeral socket, send SYN, wait for the
    /// handshake to complete or time out. Retransmits the original SYN
    /// unchanged (same ISN) at `syn_retry_interval` up to `syn_retry_limit`
    /// times before giving up — a dropped SYN or SYN-ACK must not burn the
    /// whole handshake budget on a single lost datagram.
    pub fn connect(peer: SocketAddr, config: Config) -> Result<Arc<Endpoint>> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(peer)?;
        let endpoint = Endpoint::new(socket, config)?;

        let iss: u32 = rand::thread_rng().gen();
        let syn = {
            let mut conn = endpoint.shared.conn.lock().unwrap();
            conn.initiate(peer, iss)
        };
        endpoint.send_raw(&syn)?;

        let mut conn = endpoint.shared.conn.lock().unwrap();
        let mut retries = 0u32;
        while conn.state != ConnState::Established {
            let (guard, timeout) = endpoint
                .shared
                .handshake_cv
                .wait_timeout(conn, endpoint.config.syn_retry_interval)
                .unwrap();
            conn = guard;
            if conn.state == ConnState::Established {
                break;
            }
            if timeout.timed_out() {
                if retries >= endpoint.config.syn_retry_limit {
                    return Err(Error::HandshakeTimeout { addr: peer });
                }
                retries += 1;
                debug!(attempt = retries, "retransmitting SYN");
                drop(conn);
                let _ = endpoint.send_raw(&syn);
                conn = endpoint.shared.conn.lock().unwrap();
            }
        }
        drop(conn);
        Ok(endpoint)
    }

    /// Passive open: bind and block until a peer completes a handshake.
    pub fn listen(bind_addr: SocketAddr, config: Config) -> Result<Arc<Endpoint>> {
        let socket = UdpSocket::bind(bind_addr)?;
        let endpoint = Endpoint::new(socket, config)?;

        let deadline = endpoint.config.accept_timeout;
        let start = Instant::now();
        let mut conn = endpoint.shared.conn.lock().unwrap();
        while conn.state != ConnState::Established {
            let remaining = deadline.saturating_sub(start.elapsed()).max(Duration::from_millis(1));
            let (guard, timeout) = endpoint.shared.handshake_cv.wait_timeout(conn, remaining).unwrap();
            conn = guard;
            if conn.state == ConnState::Established {
                break;
            }
            if timeout.timed_out() && start.elapsed() >= deadline {
                return Err(Error::HandshakeTimeout {
                    addr: bind_addr,
                });
            }
        }
        drop(conn);
        Ok(endpoint)
    }

    fn send_raw(&self, packet: &Packet) -> Result<()> {
        if self.config.should_drop_outbound() {
            trace!(seq = packet.seq_num, "synthetic loss dropped outbound packet");
            return Ok(());
        }
        let bytes = packet.serialize();
        self.socket.send(&bytes)?;
        Ok(())
    }

    fn send_raw_to(&self, packet: &Packet, addr: SocketAddr) -> Result<()> {
        if self.config.should_drop_outbound() {
            trace!(seq = packet.seq_num, "synthetic loss dropped outbound packet");
            return Ok(());
        }
        let bytes = packet.serialize();
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    // ---- Receive loop -----------------------------------------------

    fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65535];
        loop {
            if *self.shared.shutdown.lock().unwrap() {
                return;
            }
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!(error = %e, "receive loop socket error");
                    continue;
                }
            };

            let confidential = self.shared.conn.lock().unwrap().confidential;
            let packet = match Packet::deserialize(&buf[..n], confidential) {
                Some(p) => p,
                None => {
                    trace!("dropped malformed or corrupt packet");
                    continue;
                }
            };

            self.dispatch(packet, from);
        }
    }

    fn dispatch(&self, packet: Packet, from: SocketAddr) {
        let mut conn = self.shared.conn.lock().unwrap();

        let action = match packet.packet_type {
            PacketType::Syn => {
                if conn.state == ConnState::Closed {
                    let iss: u32 = rand::thread_rng().gen();
                    let syn_ack = conn.accept_syn(from, &packet, iss);
                    drop(conn);
                    let _ = self.send_raw_to(&syn_ack, from);
                }
                return;
            }
            PacketType::SynAck => {
                let (action, ack) = conn.handle_syn_ack(&packet);
                if let Some(ack) = ack {
                    drop(conn);
                    let _ = self.send_raw(&ack);
                    self.notify(action);
                    return;
                }
                action
            }
            PacketType::Ack => {
                let (action, acked_bytes, to_send) = conn.handle_ack(&packet);
                let rtt_secs = conn.rtt.avg();
                let cwnd = conn.congestion.cwnd();
                let ssthresh = conn.congestion.ssthresh();
                let state = conn.congestion.state();
                let hs = conn.handle_handshake_ack(&packet);
                drop(conn);

                let sink = self.metrics_sink();
                if acked_bytes > 0 {
                    if let Some(sink) = &sink {
                        sink.record_ack(packet.ack_num, rtt_secs, acked_bytes as usize);
                    }
                }
                for segment in &to_send {
                    if let Some(sink) = &sink {
                        sink.record_packet_sent(segment.seq_num, segment.data.len(), false, cwnd, ssthresh, state);
                    }
                    let _ = self.send_raw(segment);
                }

                if hs != Action::Noop {
                    self.notify(hs);
                    return;
                }
                self.notify(action);
                return;
            }
            PacketType::Data => {
                let (action, ack_num) = conn.handle_data(&packet);
                let ack = conn.make_ack(ack_num);
                drop(conn);
                let _ = self.send_raw(&ack);
                self.notify(action);
                return;
            }
            PacketType::Fin => {
                let (action, fin_ack) = conn.handle_fin(&packet);
                drop(conn);
                let _ = self.send_raw(&fin_ack);
                self.notify(action);
                return;
            }
            PacketType::FinAck => conn.handle_fin_ack(&packet),
            PacketType::KeyExchange => {
                let (action, response) = conn.handle_key_exchange(&packet);
                if let Some(response) = response {
                    drop(conn);
                    let _ = self.send_raw(&response);
                    self.notify(action);
                    return;
                }
                action
            }
            PacketType::KeyResponse => conn.handle_key_response(&packet),
        };

        drop(conn);
        self.notify(action);
    }

    fn notify(&self, action: Action) {
        match action {
            Action::WakeHandshake => self.shared.handshake_cv.notify_all(),
            Action::WakeKeyExchange => self.shared.key_cv.notify_all(),
            Action::WakeData => self.shared.data_cv.notify_all(),
            Action::WakeSend => self.shared.send_cv.notify_all(),
            Action::WakeClose => self.shared.close_cv.notify_all(),
            Action::Noop => {}
        }
    }

    // ---- Timer loop --------------------------------------------------

    fn timer_loop(self: Arc<Self>) {
        loop {
            thread::sleep(self.config.timer_granularity);
            if *self.shared.shutdown.lock().unwrap() {
                return;
            }

            let mut conn = self.shared.conn.lock().unwrap();
            if conn.state != ConnState::Established {
                continue;
            }
            if let Some(sink) = self.metrics_sink() {
                sink.sample_throughput(conn.in_flight());
            }
            let base_rto = conn.rtt.rto();
            let expired = conn.expired_entries(base_rto);
            if expired.is_empty() {
                continue;
            }

            let mut dead = false;
            for (seq, packet, _retries) in &expired {
                if !conn.mark_retransmitted(*seq) {
                    dead = true;
                    break;
                }
                debug!(seq = seq, "retransmitting segment");
                let bytes = packet.serialize();
                drop(conn);
                let _ = self.socket.send(&bytes);
                conn = self.shared.conn.lock().unwrap();
            }

            if dead {
                conn.reset();
                drop(conn);
                self.shared.send_cv.notify_all();
                self.shared.data_cv.notify_all();
                self.shared.close_cv.notify_all();
            }
        }
    }

    // ---- Public data-plane API ---------------------------------------

    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        let total = data.len();
        let (packets, cwnd, ssthresh, state) = {
            let mut conn = self.shared.conn.lock().unwrap();
            if conn.state != ConnState::Established {
                return Err(Error::NotConnected);
            }
            let packets = conn.queue_send(data);
            (
                packets,
                conn.congestion.cwnd(),
                conn.congestion.ssthresh(),
                conn.congestion.state(),
            )
        };
        if let Some(sink) = self.metrics_sink() {
            for packet in &packets {
                sink.record_packet_sent(packet.seq_num, packet.data.len(), false, cwnd, ssthresh, state);
            }
        }
        for packet in &packets {
            self.send_raw(packet)?;
        }

        let deadline = Instant::now() + self.config.send_completion_timeout(total);
        let mut conn = self.shared.conn.lock().unwrap();
        while !conn.send_buffer_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let acked = total - conn.pending_bytes();
                return Err(Error::SendIncomplete { acked, total });
            }
            conn = self.shared.send_cv.wait_timeout(conn, remaining).unwrap().0;
            if conn.state == ConnState::Closed {
                return Err(Error::ConnectionReset);
            }
        }
        Ok(())
    }

    pub fn recv_data(&self, max_len: usize) -> Result<Vec<u8>> {
        let mut conn = self.shared.conn.lock().unwrap();
        while !conn.has_delivered_data() {
            if conn.state == ConnState::Closed2Msl || conn.state == ConnState::CloseWait {
                if !conn.has_delivered_data() {
                    return Ok(Vec::new());
                }
            }
            if conn.state == ConnState::Closed {
                return Err(Error::ConnectionReset);
            }
            let (guard, timeout) = self
                .shared
                .data_cv
                .wait_timeout(conn, self.config.recv_poll_interval)
                .unwrap();
            conn = guard;
            let _ = timeout;
        }
        Ok(conn.drain_delivered(max_len))
    }

    pub fn negotiate_key_as_initiator(&self) -> Result<()> {
        let exchange = {
            let mut conn = self.shared.conn.lock().unwrap();
            conn.begin_key_exchange()
        };
        self.send_raw(&exchange)?;

        let deadline = Instant::now() + self.config.key_exchange_initiator_timeout;
        let mut conn = self.shared.conn.lock().unwrap();
        while conn.session_key.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::KeyExchangeTimeout);
            }
            conn = self.shared.key_cv.wait_timeout(conn, remaining).unwrap().0;
        }
        Ok(())
    }

    /// Responder side needs no explicit call: `dispatch` answers
    /// `KeyExchange` packets inline. This just blocks until a key has
    /// been agreed, for callers that want a synchronization point.
    pub fn await_key_agreement(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.key_exchange_responder_timeout;
        let mut conn = self.shared.conn.lock().unwrap();
        while conn.session_key.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::KeyExchangeTimeout);
            }
            conn = self.shared.key_cv.wait_timeout(conn, remaining).unwrap().0;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let fin = {
            let mut conn = self.shared.conn.lock().unwrap();
            if conn.state != ConnState::Established {
                return Ok(());
            }
            conn.begin_close()
        };
        self.send_raw(&fin)?;

        let deadline = Instant::now() + self.config.fin_ack_timeout;
        let mut conn = self.shared.conn.lock().unwrap();
        while conn.state == ConnState::FinWait {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            conn = self.shared.close_cv.wait_timeout(conn, remaining).unwrap().0;
        }
        drop(conn);

        *self.shared.shutdown.lock().unwrap() = true;
        Ok(())
    }

    pub fn rtt_stats(&self) -> RttStats {
        let conn = self.shared.conn.lock().unwrap();
        RttStats {
            avg_secs: conn.rtt.avg(),
            dev_secs: conn.rtt.dev(),
            min_secs: conn.rtt.min(),
            max_secs: conn.rtt.max(),
            rto_secs: conn.rtt.rto().as_secs_f64(),
            sample_count: conn.rtt.sample_count(),
        }
    }

    pub fn congestion_stats(&self) -> CongestionStats {
        let conn = self.shared.conn.lock().unwrap();
        CongestionStats {
            cwnd: conn.congestion.cwnd(),
            ssthresh: conn.congestion.ssthresh(),
            state: conn.congestion.state(),
            in_flight: conn.in_flight(),
            bytes_acked_total: conn.bytes_acked_total,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RttStats {
    pub avg_secs: f64,
    pub dev_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub rto_secs: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CongestionStats {
    pub cwnd: f64,
    pub ssthresh: f64,
    pub state: crate::congestion::CongestionState,
    pub in_flight: usize,
    pub bytes_acked_total: u64,
}
