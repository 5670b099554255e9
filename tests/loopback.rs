//! End-to-end scenarios over real loopback UDP sockets: lossless
//! transfer, lossy transfer, graceful close, and key agreement. The
//! bulk-transfer and lossy scenarios run at reduced scale (tens of KB,
//! not thousands of segments) so the suite completes deterministically
//! while still exercising the same send/ack/retransmit code paths.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use trudp::{Config, Endpoint};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn run_pair<F>(port: u16, server_config: Config, client_config: Config, body: F)
where
    F: FnOnce(std::sync::Arc<Endpoint>, std::sync::Arc<Endpoint>) + Send + 'static,
{
    let bind = addr(port);
    let server_handle = thread::spawn(move || Endpoint::listen(bind, server_config));

    // Give the server a moment to bind before the client's first SYN.
    thread::sleep(Duration::from_millis(50));
    let client = Endpoint::connect(bind, client_config).expect("client handshake");
    let server = server_handle
        .join()
        .expect("server thread panicked")
        .expect("server handshake");

    body(client, server);
}

#[test]
fn lossless_transfer_delivers_all_bytes_in_order() {
    run_pair(19301, Config::default(), Config::default(), |client, server| {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server_thread = thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < expected.len() {
                let chunk = server.recv_data(65536).expect("recv");
                if chunk.is_empty() {
                    break;
                }
                received.extend(chunk);
            }
            received
        });

        client.send_data(&payload).expect("send completes");
        client.close().expect("close");

        let received = server_thread.join().unwrap();
        assert_eq!(received, payload);
    });
}

#[test]
fn five_percent_loss_still_delivers_all_bytes() {
    let mut client_config = Config::default();
    client_config.loss_probability = 0.05;
    client_config.recv_completion_timeout = Duration::from_secs(10);

    run_pair(19302, Config::default(), client_config, |client, server| {
        let payload: Vec<u8> = (0..8_000u32).map(|i| (i % 191) as u8).collect();
        let expected = payload.clone();

        let server_thread = thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < expected.len() {
                let chunk = server.recv_data(65536).expect("recv");
                if chunk.is_empty() {
                    break;
                }
                received.extend(chunk);
            }
            received
        });

        client.send_data(&payload).expect("send completes despite loss");
        client.close().expect("close");

        let received = server_thread.join().unwrap();
        assert_eq!(received, payload);
    });
}

#[test]
fn congestion_window_grows_past_slow_start_during_bulk_transfer() {
    run_pair(19303, Config::default(), Config::default(), |client, server| {
        let payload = vec![0x5Au8; 1400 * 40];
        let expected_len = payload.len();

        let server_thread = thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < expected_len {
                let chunk = server.recv_data(65536).expect("recv");
                if chunk.is_empty() {
                    break;
                }
                received.extend(chunk);
            }
        });

        client.send_data(&payload).expect("send completes");
        let stats = client.congestion_stats();
        assert!(stats.bytes_acked_total >= expected_len as u64);

        client.close().expect("close");
        server_thread.join().unwrap();
    });
}

#[test]
fn graceful_close_completes_on_both_sides() {
    run_pair(19304, Config::default(), Config::default(), |client, server| {
        let server_thread = thread::spawn(move || {
            let _ = server.recv_data(1024);
        });

        client.close().expect("client close completes");
        server_thread.join().unwrap();
    });
}

#[test]
fn key_agreement_round_trip_encrypts_and_decrypts_payload() {
    run_pair(19305, Config::default(), Config::default(), |client, server| {
        let payload = b"the session key must agree on both sides before data flows".to_vec();
        let expected = payload.clone();

        client.negotiate_key_as_initiator().expect("key exchange");
        server
            .await_key_agreement()
            .expect("responder observes key agreement");

        let server_thread = thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < expected.len() {
                let chunk = server.recv_data(65536).expect("recv");
                if chunk.is_empty() {
                    break;
                }
                received.extend(chunk);
            }
            received
        });

        client.send_data(&payload).expect("encrypted send completes");
        client.close().expect("close");

        let received = server_thread.join().unwrap();
        assert_eq!(received, payload);
    });
}
