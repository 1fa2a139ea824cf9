//! Loopback client/service exchanges.
//!
//! A real service engine on an ephemeral UDP port answers a real client
//! engine; the tests assert the recorded T1/R1/T2/R2 and sequence
//! progression for both one-step and two-step modes.

use clap::Parser;

use csptp::cli::ServiceCli;
use csptp::client::ClientEngine;
use csptp::config::{ClientConfig, ServiceConfig};
use csptp::service::ServiceEngine;

fn service_engine(extra: &[&str]) -> ServiceEngine {
    let mut args = vec!["csptp-service", "-p", "0"];
    args.extend_from_slice(extra);
    let cfg = ServiceConfig::resolve(&ServiceCli::parse_from(args), None).unwrap();
    ServiceEngine::new(&cfg).unwrap()
}

fn client_config(port: u16, two_step: bool) -> ClientConfig {
    ClientConfig {
        service_address: "127.0.0.1".into(),
        forced: None,
        domain_number: 200,
        two_step,
        req_status: true,
        req_alt_time: true,
        interface: None,
        port,
        cycle_ms: 1,
        wait_loops: 50,
        poll_ms: 50,
    }
}

/// Serve until `want` requests were answered (bounded), then hand the
/// engine back for inspection.
fn serve(mut service: ServiceEngine, want: usize) -> std::thread::JoinHandle<ServiceEngine> {
    std::thread::spawn(move || {
        let mut answered = 0;
        for _ in 0..200 {
            if service.iterate().unwrap_or(false) {
                answered += 1;
                if answered == want {
                    break;
                }
            }
        }
        service
    })
}

fn assert_plausible(ex: &csptp::client::Exchange) {
    // All four stamps are real wall-clock readings taken within the test.
    assert!(ex.t1 > 0 && ex.r1 > 0 && ex.t2 > 0 && ex.r2 > 0);
    // Same host, same clock: the exchange spans well under two seconds.
    assert!(ex.offset.abs() < 2_000_000_000, "offset {}", ex.offset);
    assert!(ex.r2 >= ex.t1, "r2 {} before t1 {}", ex.r2, ex.t1);
    assert_eq!(ex.offset, ex.t2.wrapping_sub(ex.t1));
}

#[test]
fn one_step_exchange() {
    let service = service_engine(&["-r", "1", "-t", "1"]);
    let bound = service.local_addr().unwrap();
    let handle = serve(service, 1);

    let mut client = ClientEngine::new(&client_config(bound.port(), false)).unwrap();
    // Both optional TLVs requested over IPv4 pad the frame to 160 octets.
    assert_eq!(client.frame_size(), 160);
    assert_eq!(client.sequence_id(), 1);

    let ex = client.run_cycle().unwrap().expect("one-step exchange completes");
    assert_eq!(ex.sequence_id, 1);
    assert_eq!(client.sequence_id(), 2);
    assert_plausible(&ex);

    let service = handle.join().unwrap();
    // One-step service keeps no per-client state.
    assert!(service.store().is_none());
}

#[test]
fn two_step_exchange() {
    let service = service_engine(&[]);
    let bound = service.local_addr().unwrap();
    let handle = serve(service, 1);

    let mut client = ClientEngine::new(&client_config(bound.port(), true)).unwrap();
    let ex = client.run_cycle().unwrap().expect("two-step exchange completes");
    assert_eq!(ex.sequence_id, 1);
    assert_plausible(&ex);

    let service = handle.join().unwrap();
    // T2 was retained per client IP for the Follow_Up; the clearing fetch
    // left a zeroed record behind.
    let store = service.store().unwrap();
    assert_eq!(store.records(), 1);
}

#[test]
fn consecutive_cycles_advance_sequence() {
    let service = service_engine(&[]);
    let bound = service.local_addr().unwrap();
    let handle = serve(service, 3);

    let mut client = ClientEngine::new(&client_config(bound.port(), true)).unwrap();
    for want_seq in 1..=3u16 {
        let ex = client.run_cycle().unwrap().expect("exchange completes");
        assert_eq!(ex.sequence_id, want_seq);
    }
    assert_eq!(client.sequence_id(), 4);
    handle.join().unwrap();
}

#[test]
fn unanswered_cycle_times_out() {
    // Bind a socket to reserve a port, then drop it so nothing answers.
    let dead_port = {
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().port()
    };
    let mut cfg = client_config(dead_port, false);
    cfg.wait_loops = 3;
    cfg.poll_ms = 10;
    let mut client = ClientEngine::new(&cfg).unwrap();
    assert!(client.run_cycle().unwrap().is_none());
    // The sequence advances even for a lost cycle.
    assert_eq!(client.sequence_id(), 2);
}
