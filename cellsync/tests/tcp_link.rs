//! Two coordinators talking over real localhost TCP.
//!
//! ```bash
//! RUST_LOG=cellsync=debug cargo test --test tcp_link -- --nocapture
//! ```

use std::sync::Once;
use std::thread;
use std::time::Duration;

use cellsync::coordinator::{AcceptRequests, Coordinator, LinkHealth, PhaseOutcome};
use cellsync::link::{TcpAcceptor, TcpTransport};
use cellsync::net::Endpoint;
use cellsync::protocol::{FailureReport, MeasurementId, Signal};
use cellsync::wait::Timeout;
use cellsync::{CellConfig, CellRole};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        cellsync::init_tracing();
    });
}

fn config(role: CellRole) -> CellConfig {
    let mut config = CellConfig::default();
    config.link.role = role;
    config.link.poll_interval_ms = 5;
    config.link.phase_timeout_secs = 10;
    config
}

/// Accepts one primary and serves it until the link closes.
fn spawn_secondary() -> (Endpoint, thread::JoinHandle<Vec<Signal>>) {
    let mut acceptor = TcpAcceptor::bind(Endpoint::localhost(0)).unwrap();
    let endpoint = acceptor.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let link = loop {
            if let Some(link) = acceptor.accept(Duration::from_millis(50)).unwrap() {
                break link;
            }
        };
        let mut seen = Vec::new();
        let handler = |request: &Signal| {
            seen.push(request.clone());
            match request {
                Signal::Save(ids) if ids.is_empty() => {
                    Err(FailureReport::new(301, "nothing to save"))
                }
                _ => Ok(()),
            }
        };
        let mut secondary = Coordinator::new(link, handler, config(CellRole::Secondary));
        secondary.serve().unwrap();
        drop(secondary);
        seen
    });
    (endpoint, handle)
}

#[test]
fn primary_and_secondary_handshake_and_run_phases() {
    init_test_tracing();
    let (endpoint, secondary) = spawn_secondary();

    let mut primary = Coordinator::new(
        TcpTransport::new().unwrap(),
        AcceptRequests,
        config(CellRole::Primary),
    );
    primary.connect(endpoint);
    primary
        .await_handshake(Timeout::Duration(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(primary.link_health(), LinkHealth::Handshaked);

    primary.probe_alive().unwrap();
    assert_eq!(primary.start_digitizing().unwrap(), PhaseOutcome::Completed);
    assert_eq!(
        primary.save(vec![MeasurementId(1), MeasurementId(2)]).unwrap(),
        PhaseOutcome::Completed
    );
    assert!(primary.ledger().is_empty());

    // closing the primary ends the secondary's session
    drop(primary);
    let seen = secondary.join().unwrap();
    assert_eq!(
        seen,
        vec![
            Signal::Unpair { unpaired: false },
            Signal::Start,
            Signal::Save(vec![MeasurementId(1), MeasurementId(2)]),
        ]
    );
}

#[test]
fn secondary_failure_degrades_primary() {
    init_test_tracing();
    let (endpoint, secondary) = spawn_secondary();

    let mut primary = Coordinator::new(
        TcpTransport::new().unwrap(),
        AcceptRequests,
        config(CellRole::Primary),
    );
    primary.connect(endpoint);
    primary
        .await_handshake(Timeout::Duration(Duration::from_secs(5)))
        .unwrap();

    let err = primary.save(Vec::new()).unwrap_err();
    assert_eq!(err.code(), 301);
    assert!(primary.ledger().is_empty());
    assert!(!primary.forwards_phases());
    assert_eq!(primary.start_digitizing().unwrap(), PhaseOutcome::Local);

    drop(primary);
    secondary.join().unwrap();
}
