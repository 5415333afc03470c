//! Coordinator scenarios against a scripted in-process peer.
//!
//! Each test drives a primary coordinator over a `LoopbackTransport` whose
//! responder plays the secondary cell.
//!
//! ```bash
//! RUST_LOG=cellsync=debug cargo test --test coordinator_scenarios -- --nocapture
//! ```

use std::sync::Once;
use std::time::Duration;

use cellsync::coordinator::{
    AcceptRequests, Coordinator, HardwareProfile, LinkHealth, Pairing, PhaseOutcome, PlanRoute,
    RoleMode, SharedPlan,
};
use cellsync::link::{LoopbackTransport, Responder, Transport};
use cellsync::net::Endpoint;
use cellsync::protocol::{
    ErrorCategory, FailureReport, MeasureMode, MeasurementId, PlanRef, Signal, SignalKey, codes,
};
use cellsync::retry::{
    FailurePropagation, MeasurementRetryLoop, MeasurementSurface, MemoryClock, Telemetry,
};
use cellsync::verify::errors::known;
use cellsync::verify::{
    CalibrationCause, DigitizingRun, MeasurementError, MeasurementTelemetry, OperatorDecision,
    OperatorPrompt, TemperatureSource,
};
use cellsync::wait::{Tick, Timeout};
use cellsync::{CellConfig, CellError, CellRole};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        cellsync::init_tracing();
    });
}

/// Peer that handshakes, answers requests with `reply` when it returns
/// `Some`, and with `SUCCESS(key)` otherwise.
fn scripted<F>(mut reply: F) -> impl FnMut(&Signal) -> Vec<Signal>
where
    F: FnMut(&Signal) -> Option<Vec<Signal>>,
{
    move |signal: &Signal| match signal {
        Signal::Handshake { .. } => vec![Signal::Handshake { pid: 2 }],
        s if s.is_request() => reply(s).unwrap_or_else(|| vec![Signal::Success { key: s.key() }]),
        _ => Vec::new(),
    }
}

fn config() -> CellConfig {
    let mut config = CellConfig::default();
    config.link.poll_interval_ms = 1;
    config.link.phase_timeout_secs = 5;
    config
}

fn primary<R: Responder>(peer: R) -> Coordinator<LoopbackTransport<R>> {
    init_test_tracing();
    let mut c = Coordinator::new(LoopbackTransport::new(peer), AcceptRequests, config()).with_pid(1);
    c.connect(Endpoint::localhost(7410));
    c.await_handshake(Timeout::Duration(Duration::from_secs(1)))
        .unwrap();
    c
}

fn settled<T: Transport>(c: &mut Coordinator<T>) {
    c.wait_until_settled(Timeout::Duration(Duration::from_secs(1)))
        .unwrap();
}

fn plan(content: &[&str]) -> SharedPlan {
    SharedPlan::new(PlanRef::new("door-left"), content.iter().copied())
}

fn requests_sent<R: Responder>(c: &Coordinator<LoopbackTransport<R>>) -> Vec<SignalKey> {
    c.transport()
        .sent()
        .iter()
        .map(Signal::key)
        .filter(|k| !matches!(k, SignalKey::Handshake | SignalKey::Unpair))
        .collect()
}

#[test]
fn peer_only_plan_is_forwarded_as_single_side() {
    let mut c = primary(scripted(|_| None));
    settled(&mut c);

    let local = HardwareProfile::new(["fringe"]);
    let peer = HardwareProfile::new(["laser"]);
    let route = c.open_shared_plan(&plan(&["laser"]), &local, &peer).unwrap();

    assert_eq!(route, PlanRoute::PeerOnly);
    assert_eq!(requests_sent(&c), vec![SignalKey::Open, SignalKey::SingleSide]);
    assert!(c.ledger().is_empty());
    assert!(c.local_plan().is_none());
    assert_eq!(c.pairing().mode, RoleMode::SingleSideSecondary);

    // phases now drive the peer
    assert_eq!(c.start_digitizing().unwrap(), PhaseOutcome::Completed);
}

#[test]
fn local_only_plan_forwards_nothing() {
    let mut c = primary(scripted(|_| None));
    settled(&mut c);

    let local = HardwareProfile::new(["fringe"]);
    let peer = HardwareProfile::new(["laser"]);
    let route = c.open_shared_plan(&plan(&["fringe"]), &local, &peer).unwrap();

    assert_eq!(route, PlanRoute::LocalOnly);
    assert_eq!(c.pairing().mode, RoleMode::SingleSidePrimary);
    assert_eq!(c.start_digitizing().unwrap(), PhaseOutcome::Local);
    assert!(requests_sent(&c).is_empty());
}

#[test]
fn dual_plan_runs_every_phase_on_both_cells() {
    let mut c = primary(scripted(|_| None));

    let both = HardwareProfile::new(["fringe"]);
    // waits for the handshake-time UNPAIR before routing
    let route = c.open_shared_plan(&plan(&["fringe"]), &both, &both).unwrap();
    assert_eq!(route, PlanRoute::Dual);

    c.open_init(PlanRef::new("door-left")).unwrap();
    c.start_digitizing().unwrap();
    c.measure(MeasureMode::Digitize).unwrap();
    c.calibrate().unwrap();
    c.save(vec![MeasurementId(1), MeasurementId(2)]).unwrap();
    c.export_photogrammetry("bundle.xml").unwrap();
    c.import_reference(Some("ref.xml".to_owned())).unwrap();
    c.retry_alignment(None).unwrap();
    c.restart().unwrap();
    c.close_template().unwrap();

    assert_eq!(
        requests_sent(&c),
        vec![
            SignalKey::Open,
            SignalKey::OpenInit,
            SignalKey::Start,
            SignalKey::Measure,
            SignalKey::Measure,
            SignalKey::Save,
            SignalKey::ExportedFile,
            SignalKey::RefXml,
            SignalKey::AlignmentIter,
            SignalKey::Restart,
            SignalKey::CloseTemplate,
        ]
    );
    assert!(c.ledger().is_empty());
    assert_eq!(c.pairing().mode, RoleMode::Dual);
}

#[test]
fn failed_save_clears_ledger_and_degrades() {
    // UNPAIR is left unanswered so two requests are outstanding at failure
    let mut c = primary(scripted(|s| match s {
        Signal::Unpair { .. } => Some(Vec::new()),
        Signal::Save(_) => Some(vec![Signal::failure_for(
            SignalKey::Save,
            FailureReport::parse("303 - bad mlist"),
        )]),
        _ => None,
    }));
    assert!(c.ledger().has_todo(SignalKey::Unpair));

    let err = c.save(vec![MeasurementId(7)]).unwrap_err();
    assert_eq!(err.code(), 303);
    assert_eq!(err.category(), ErrorCategory::MeasurementList);
    assert!(c.ledger().is_empty());
    assert_eq!(c.pairing().mode, RoleMode::SingleSidePrimary);
    assert_eq!(c.last_fault().map(|f| f.code), Some(303));

    // the local side carries on alone
    assert_eq!(c.start_digitizing().unwrap(), PhaseOutcome::Local);
}

#[test]
fn failure_while_unpaired_is_suppressed() {
    let mut c = primary(scripted(|s| match s {
        Signal::Unpair { unpaired: true } => Some(vec![Signal::failure_for(
            SignalKey::Unpair,
            FailureReport::new(202, "already unpaired"),
        )]),
        _ => None,
    }));
    settled(&mut c);

    c.set_desired_pairing(Pairing::Unpaired).unwrap();
    settled(&mut c);
    assert!(c.last_fault().is_none());
    assert_eq!(c.pairing().mode, RoleMode::Dual);
    assert_eq!(c.pairing_display(), "unpaired");
}

#[test]
fn peer_unpairing_mid_phase_ends_phase_locally() {
    let mut c = primary(scripted(|s| match s {
        Signal::Start => Some(vec![
            Signal::Unpair { unpaired: true },
            Signal::failure_for(SignalKey::Start, FailureReport::parse("404 - peer unpaired")),
        ]),
        _ => None,
    }));
    settled(&mut c);

    let started = std::time::Instant::now();
    assert_eq!(c.start_digitizing().unwrap(), PhaseOutcome::Local);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(c.pairing().desired, Pairing::Unpaired);
    assert!(c.last_fault().is_none());
    assert!(c.warnings().is_empty());
    assert!(c.ledger().is_empty());
    assert!(c.transport().sent().contains(&Signal::Success { key: SignalKey::Unpair }));
}

#[test]
fn unpaired_cells_open_plans_locally() {
    let mut c = primary(scripted(|_| None));
    settled(&mut c);
    c.set_desired_pairing(Pairing::Unpaired).unwrap();
    settled(&mut c);
    c.transport_mut().clear_sent();

    let both = HardwareProfile::new(["fringe"]);
    let route = c.open_shared_plan(&plan(&["fringe"]), &both, &both).unwrap();
    assert_eq!(route, PlanRoute::LocalOnly);
    assert_eq!(c.start_digitizing().unwrap(), PhaseOutcome::Local);
    assert!(c.transport().sent().is_empty());

    let laser_only = plan(&["laser"]);
    let err = c.open_shared_plan(&laser_only, &both, &HardwareProfile::new(["laser"]));
    assert!(matches!(err, Err(CellError::Fault(f)) if f.code == codes::NO_COMPATIBLE_CONTENT));
}

#[test]
fn peer_abort_interrupts_phase() {
    let mut c = primary(scripted(|s| match s {
        Signal::Start => Some(vec![Signal::Failure {
            key: None,
            report: FailureReport::new(codes::OPERATOR_CANCELLED, "stopped at cell B"),
        }]),
        _ => None,
    }));
    settled(&mut c);

    let err = c.start_digitizing().unwrap_err();
    assert_eq!(err.code(), codes::OPERATOR_CANCELLED);
    assert!(c.ledger().is_empty());
    assert_eq!(c.pairing().mode, RoleMode::SingleSidePrimary);
    assert_eq!(c.warnings().len(), 1);
}

#[test]
fn operator_cancel_notifies_peer() {
    let mut cancel_after = 3;
    let ui = move || {
        cancel_after -= 1;
        if cancel_after == 0 { Tick::Cancel } else { Tick::Continue }
    };
    let mut c = primary(scripted(|s| match s {
        Signal::Start => Some(Vec::new()),
        _ => None,
    }));
    settled(&mut c);
    let mut c = c.with_ui(Box::new(ui));
    c.transport_mut().clear_sent();

    let err = c.start_digitizing().unwrap_err();
    assert!(err.is_cancelled());
    assert!(c.ledger().is_empty());
    let sent = c.transport().sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(
        &sent[1],
        Signal::Failure { key: None, report } if report.code == codes::OPERATOR_CANCELLED
    ));
}

#[test]
fn silent_peer_times_out_phase() {
    let mut cfg = config();
    cfg.link.phase_timeout_secs = 1;
    let peer = scripted(|s| match s {
        Signal::Measure(_) => Some(Vec::new()),
        _ => None,
    });
    init_test_tracing();
    let mut c = Coordinator::new(LoopbackTransport::new(peer), AcceptRequests, cfg);
    c.connect(Endpoint::localhost(7410));
    c.await_handshake(Timeout::Duration(Duration::from_secs(1)))
        .unwrap();

    let err = c.measure(MeasureMode::Photogrammetry).unwrap_err();
    assert_eq!(err.code(), codes::PHASE_TIMEOUT);
    assert!(c.ledger().is_empty());
    assert_eq!(c.pairing().mode, RoleMode::SingleSidePrimary);
}

#[test]
fn secondary_services_single_side_request() {
    init_test_tracing();
    let mut cfg = config();
    cfg.link.role = CellRole::Secondary;
    let mut seen = Vec::new();
    let handler = |request: &Signal| {
        seen.push(request.key());
        match request {
            Signal::Save(ids) if ids.is_empty() => Err(FailureReport::new(301, "empty list")),
            _ => Ok(()),
        }
    };
    let mut c = Coordinator::new(LoopbackTransport::new(|_: &Signal| Vec::<Signal>::new()), handler, cfg);
    c.connect(Endpoint::localhost(7410));
    c.tick().unwrap();

    c.transport_mut().inject(Signal::Handshake { pid: 9 });
    c.transport_mut().inject(Signal::Unpair { unpaired: false });
    c.transport_mut().inject(Signal::SingleSide(PlanRef::new("door-left")));
    c.transport_mut().inject(Signal::Save(Vec::new()));
    c.tick().unwrap();

    assert_eq!(c.link_health(), LinkHealth::Handshaked);
    assert_eq!(c.pairing().mode, RoleMode::SingleSideSecondary);
    // secondaries never send UNPAIR on handshake
    assert!(c.ledger().is_empty());
    assert_eq!(
        c.transport().sent()[1..],
        [
            Signal::Success { key: SignalKey::Unpair },
            Signal::Success { key: SignalKey::SingleSide },
            Signal::failure_for(SignalKey::Save, FailureReport::new(301, "empty list")),
        ]
    );
    drop(c);
    assert_eq!(seen, vec![SignalKey::Unpair, SignalKey::SingleSide, SignalKey::Save]);
}

/// Hardware that fails with an unrecoverable temperature error.
struct OverheatedSensor;

impl MeasurementSurface for OverheatedSensor {
    fn perform_measurement(&mut self) -> Result<Telemetry, MeasurementError> {
        Err(MeasurementError::new(
            known::TEMPERATURE_CONSISTENCY,
            "sensor heated during acquisition",
        )
        .with_temperatures(TemperatureSource::Acquisition, TemperatureSource::Current))
    }

    fn initialize(&mut self, _only_init: bool) -> Result<(), MeasurementError> {
        Ok(())
    }

    fn check_for_reinitialize(&mut self) -> bool {
        false
    }

    fn calibrate(&mut self, _cause: CalibrationCause) -> Result<(), MeasurementError> {
        Ok(())
    }

    fn move_reverse_home(&mut self) -> Result<(), MeasurementError> {
        Ok(())
    }

    fn purge(&mut self, _ids: &[MeasurementId]) {}
}

struct Unattended;

impl OperatorPrompt for Unattended {
    fn present(&mut self, _message: &str) {}

    fn poll_decision(&mut self, _wait: Duration) -> Option<OperatorDecision> {
        Some(OperatorDecision::Abort)
    }
}

#[test]
fn terminal_measurement_aborts_shared_plan_on_peer() {
    let mut c = primary(scripted(|_| None));
    let both = HardwareProfile::new(["fringe"]);
    c.open_shared_plan(&plan(&["fringe"]), &both, &both).unwrap();
    c.transport_mut().clear_sent();

    let config = c.config().clone();
    let mut sensor = OverheatedSensor;
    let mut clock = MemoryClock::default();
    let mut prompt = Unattended;
    let result = MeasurementRetryLoop::new(&config, &mut sensor, &mut clock, &mut prompt)
        .propagate_to(&mut c as &mut dyn FailurePropagation)
        .run();

    let terminal = result.unwrap_err();
    assert_eq!(terminal.fault.code, codes::MEASUREMENT_TERMINAL);
    assert!(matches!(
        c.transport().sent(),
        [Signal::Failure { key: None, report }] if report.code == codes::MEASUREMENT_TERMINAL
    ));
    assert_eq!(c.pairing().mode, RoleMode::SingleSidePrimary);
}

#[test]
fn digitizing_run_with_peer_mirrors_phases() {
    struct CleanSensor;

    impl MeasurementSurface for CleanSensor {
        fn perform_measurement(&mut self) -> Result<Telemetry, MeasurementError> {
            Ok(Telemetry::Digitizing(DigitizingRun {
                measurements: (1..=4)
                    .map(|i| MeasurementTelemetry::nominal(MeasurementId(i)))
                    .collect(),
                volume_diagonal: 1500.0,
                alignment_residual: 0.02,
            }))
        }

        fn initialize(&mut self, _only_init: bool) -> Result<(), MeasurementError> {
            Ok(())
        }

        fn check_for_reinitialize(&mut self) -> bool {
            false
        }

        fn calibrate(&mut self, _cause: CalibrationCause) -> Result<(), MeasurementError> {
            Ok(())
        }

        fn move_reverse_home(&mut self) -> Result<(), MeasurementError> {
            Ok(())
        }

        fn purge(&mut self, _ids: &[MeasurementId]) {}
    }

    let mut c = primary(scripted(|_| None));
    let both = HardwareProfile::new(["fringe"]);
    c.open_shared_plan(&plan(&["fringe"]), &both, &both).unwrap();
    c.start_digitizing().unwrap();

    let config = c.config().clone();
    let mut sensor = CleanSensor;
    let mut clock = MemoryClock::default();
    let mut prompt = Unattended;
    let measured = MeasurementRetryLoop::new(&config, &mut sensor, &mut clock, &mut prompt)
        .run()
        .unwrap();
    assert_eq!(measured.attempts, 1);

    c.save(vec![MeasurementId(1), MeasurementId(2), MeasurementId(3), MeasurementId(4)])
        .unwrap();
    assert!(c.ledger().is_empty());
    assert_eq!(c.link_health(), LinkHealth::Handshaked);
}
