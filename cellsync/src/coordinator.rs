//! The coordinator: one owned object per pairing session.
//!
//! Drives the link through `Disconnected -> Connected -> Handshaked`, keeps
//! the remote todo ledger consistent with the link, services requests from
//! the peer and runs phase handshakes for shared plans. Everything happens
//! on the thread that calls [`Coordinator::tick`] (directly or through one
//! of the blocking phase methods).
//!
//! Failure handling:
//! - link loss clears the ledger and reconnects after the configured delay;
//! - a `FAILURE` for an outstanding request clears the ledger and degrades
//!   the run to this cell alone, unless pairing is off;
//! - a completion that matches nothing is a desync: the ledger is cleared and
//!   the handshake rerun.

pub mod pairing;
pub mod phase;
pub mod plan;
pub mod service;

use std::collections::VecDeque;

use minstant::Instant;

use crate::config::{CellConfig, CellRole};
use crate::error::{CellError, Fault, ProtocolError};
use crate::ledger::{LedgerError, RemoteTodoLedger};
use crate::link::{Handshake, LinkState, Transport};
use crate::net::Endpoint;
use crate::protocol::{Completion, FailureReport, Outcome, Signal, SignalKey, codes};
use crate::retry::FailurePropagation;
use crate::trace::{debug, info, trace, warn};
use crate::verify::WarningStack;
use crate::wait::{Headless, ModalSurface};

pub use pairing::{LinkHealth, Pairing, PairingState, RoleMode};
pub use phase::PhaseOutcome;
pub use plan::{HardwareProfile, PlanRoute, SharedPlan};
pub use service::{AcceptRequests, RequestHandler};

/// Completions kept for waiters; older ones are dropped.
const RESOLVED_CAPACITY: usize = 32;

pub struct Coordinator<T, H = AcceptRequests> {
    transport: T,
    handler: H,
    config: CellConfig,
    ledger: RemoteTodoLedger,
    pairing: PairingState,
    /// Cached `pairing_display` text; `None` when stale.
    display: Option<String>,
    handshake: Handshake,
    endpoint: Option<Endpoint>,
    next_reconnect: Option<Instant>,
    /// Bumped whenever outstanding requests are discarded.
    generation: u64,
    resolved: VecDeque<Completion>,
    last_fault: Option<Fault>,
    local_plan: Option<SharedPlan>,
    warnings: WarningStack,
    ui: Box<dyn ModalSurface>,
}

impl<T: Transport, H: RequestHandler> Coordinator<T, H> {
    pub fn new(transport: T, handler: H, config: CellConfig) -> Self {
        Self {
            transport,
            handler,
            config,
            ledger: RemoteTodoLedger::new(),
            pairing: PairingState::default(),
            display: None,
            handshake: Handshake::new(std::process::id()),
            endpoint: None,
            next_reconnect: None,
            generation: 0,
            resolved: VecDeque::new(),
            last_fault: None,
            local_plan: None,
            warnings: WarningStack::default(),
            ui: Box::new(Headless),
        }
    }

    /// Pid announced in the handshake.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.handshake = Handshake::new(pid);
        self
    }

    /// Surface ticked during every blocking wait.
    pub fn with_ui(mut self, ui: Box<dyn ModalSurface>) -> Self {
        self.ui = ui;
        self
    }

    /// Starts connecting to the peer and remembers it for reconnects.
    pub fn connect(&mut self, endpoint: Endpoint) {
        info!(%endpoint, "connecting to peer");
        self.endpoint = Some(endpoint);
        self.next_reconnect = Some(Instant::now() + self.config.link.reconnect_interval());
        self.transport.connect(endpoint);
    }

    pub fn role(&self) -> CellRole {
        self.config.link.role
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub fn pairing(&self) -> PairingState {
        self.pairing
    }

    pub fn link_health(&self) -> LinkHealth {
        self.pairing.health
    }

    pub fn ledger(&self) -> &RemoteTodoLedger {
        &self.ledger
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// The plan this cell executes, if any.
    pub fn local_plan(&self) -> Option<&SharedPlan> {
        self.local_plan.as_ref()
    }

    /// Most recent fault reported by or about the peer.
    pub fn last_fault(&self) -> Option<&Fault> {
        self.last_fault.as_ref()
    }

    pub fn take_fault(&mut self) -> Option<Fault> {
        self.last_fault.take()
    }

    pub fn warnings(&mut self) -> &mut WarningStack {
        &mut self.warnings
    }

    /// Shared plans run jointly: pairing wanted, link up, no change pending.
    pub fn is_paired(&self) -> bool {
        self.pairing.desired == Pairing::Paired
            && self.pairing.health == LinkHealth::Handshaked
            && !self.ledger.has_todo(SignalKey::Unpair)
    }

    /// Operator-facing pairing summary, rendered once per transition.
    pub fn pairing_display(&mut self) -> &str {
        let pairing = &self.pairing;
        let pending = self.ledger.has_todo(SignalKey::Unpair);
        let peer_pid = self.handshake.peer_pid();
        self.display
            .get_or_insert_with(|| pairing.describe(pending, peer_pid))
            .as_str()
    }

    /// Changes the desired pairing, telling the peer if the link is up.
    pub fn set_desired_pairing(&mut self, desired: Pairing) -> Result<(), CellError> {
        if self.pairing.desired == desired {
            return Ok(());
        }
        info!(%desired, "pairing changed by operator");
        self.pairing.desired = desired;
        if desired == Pairing::Paired {
            self.pairing.mode = RoleMode::Dual;
        }
        self.invalidate_display();

        if self.pairing.health == LinkHealth::Handshaked {
            let request = Signal::Unpair {
                unpaired: desired.is_unpaired(),
            };
            self.ledger.append_todo(request.clone());
            self.send(&request)?;
        } else {
            debug!("no link, pairing applied locally");
        }
        Ok(())
    }

    /// Drives I/O once and reacts to what happened.
    pub fn tick(&mut self) -> Result<(), CellError> {
        if let Err(e) = self.transport.poll(self.config.link.poll_interval()) {
            warn!(error = %e, "transport poll failed");
            self.transport.close();
        }
        self.observe_link()?;
        for signal in self.transport.drain() {
            self.dispatch(signal)?;
        }
        Ok(())
    }

    /// Operator abort: tells the peer, drops all outstanding requests.
    pub fn abort(&mut self) -> CellError {
        if self.pairing.health == LinkHealth::Handshaked && self.pairing.desired == Pairing::Paired {
            let report = FailureReport::new(codes::OPERATOR_CANCELLED, "cancelled by operator");
            if let Err(e) = self.transport.send(&Signal::Failure { key: None, report }) {
                warn!(error = %e, "could not notify peer of abort");
            }
        }
        let dropped = self.discard_outstanding();
        self.local_plan = None;
        info!(dropped, "run aborted by operator");
        CellError::Cancelled
    }

    fn observe_link(&mut self) -> Result<(), CellError> {
        match (self.pairing.health, self.transport.state()) {
            (LinkHealth::Disconnected, LinkState::Connected) => self.on_connected()?,
            (LinkHealth::Connected | LinkHealth::Handshaked, LinkState::Disconnected) => {
                self.on_link_lost();
            }
            (LinkHealth::Disconnected, LinkState::Disconnected) => self.maybe_reconnect(),
            _ => {}
        }

        if self.pairing.health == LinkHealth::Connected
            && self.handshake.timed_out(self.config.link.handshake_timeout())
        {
            let err = ProtocolError::HandshakeTimeout;
            warn!(error = %err, "dropping link");
            self.last_fault = Some(Fault::new(err.code(), err.to_string()));
            self.transport.close();
            self.on_link_lost();
        }
        Ok(())
    }

    fn on_connected(&mut self) -> Result<(), CellError> {
        info!("link connected, handshaking");
        self.pairing.health = LinkHealth::Connected;
        self.invalidate_display();
        let started = self.handshake.start(&mut self.transport);
        started.map_err(|e| {
            self.on_link_lost();
            CellError::from(e)
        })
    }

    fn on_link_lost(&mut self) {
        let dropped = self.discard_outstanding();
        warn!(dropped, "link lost");
        if dropped > 0 {
            self.last_fault = Some(Fault::new(
                codes::LINK_LOST,
                format!("link lost with {dropped} requests outstanding"),
            ));
        }
        self.handshake.reset();
        self.pairing.health = LinkHealth::Disconnected;
        self.invalidate_display();
        self.next_reconnect = Some(Instant::now() + self.config.link.reconnect_interval());
    }

    fn maybe_reconnect(&mut self) {
        let Some(endpoint) = self.endpoint else {
            return;
        };
        let now = Instant::now();
        if self.next_reconnect.is_some_and(|at| now < at) {
            return;
        }
        debug!(%endpoint, "reconnecting");
        self.next_reconnect = Some(now + self.config.link.reconnect_interval());
        self.transport.connect(endpoint);
    }

    fn on_handshaked(&mut self, peer_pid: u32) -> Result<(), CellError> {
        let renewed = self.pairing.health == LinkHealth::Handshaked;
        self.handshake.on_peer(peer_pid, &mut self.transport)?;
        if renewed {
            let dropped = self.discard_outstanding();
            warn!(peer_pid, dropped, "peer renewed handshake");
        } else {
            info!(peer_pid, "link handshaked");
        }
        self.pairing.health = LinkHealth::Handshaked;
        self.invalidate_display();

        if self.role() == CellRole::Primary {
            let request = Signal::Unpair {
                unpaired: self.pairing.desired.is_unpaired(),
            };
            self.ledger.append_todo(request.clone());
            self.send(&request)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, signal: Signal) -> Result<(), CellError> {
        trace!(%signal, "received");
        match signal {
            Signal::Handshake { pid } => self.on_handshaked(pid),
            Signal::Success { key } => {
                self.on_completion(Completion::success(key));
                Ok(())
            }
            Signal::Failure {
                key: Some(key),
                report,
            } => {
                self.on_completion(Completion::failure(key, report));
                Ok(())
            }
            Signal::Failure { key: None, report } => {
                self.on_peer_abort(report);
                Ok(())
            }
            request => self.service(request),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match &completion.outcome {
            Outcome::Success => match self.ledger.finish(&completion) {
                Ok(request) => {
                    debug!(%request, outstanding = self.ledger.len(), "request completed");
                    if completion.key == SignalKey::Unpair {
                        self.invalidate_display();
                    }
                    self.push_resolved(completion);
                }
                Err(e) => self.resync(e),
            },
            Outcome::Failure(report) if self.pairing.desired == Pairing::Unpaired => {
                debug!(key = %completion.key, %report, "failure suppressed while unpaired");
                if let Err(_e) = self.ledger.finish(&completion) {
                    debug!(error = %_e, "suppressed failure matched nothing");
                }
                self.push_resolved(completion);
            }
            Outcome::Failure(report) => {
                match self.ledger.get_todo(&completion) {
                    Some(request) => warn!(%request, %report, "peer failed request"),
                    None => warn!(key = %completion.key, %report, "peer failed unknown request"),
                }
                self.last_fault = Some(report.clone().into());
                self.warnings.push(format!("peer failure: {report}"));
                self.push_resolved(completion);
                self.discard_outstanding();
                self.degrade();
            }
        }
    }

    fn on_peer_abort(&mut self, report: FailureReport) {
        if self.pairing.desired == Pairing::Unpaired {
            debug!(%report, "peer abort suppressed while unpaired");
            return;
        }
        warn!(%report, "peer aborted shared plan");
        self.warnings.push(format!("peer aborted: {report}"));
        self.last_fault = Some(report.into());
        self.discard_outstanding();
        self.degrade();
    }

    /// A completion matched nothing: rerun the handshake from scratch.
    fn resync(&mut self, e: LedgerError) {
        let err = ProtocolError::from(e);
        warn!(error = %err, "protocol desync, rehandshaking");
        self.last_fault = Some(Fault::new(err.code(), err.to_string()));
        self.discard_outstanding();
        self.handshake.reset();
        self.pairing.health = LinkHealth::Connected;
        self.invalidate_display();
        if let Err(e) = self.handshake.start(&mut self.transport) {
            warn!(error = %e, "rehandshake failed");
            self.transport.close();
            self.on_link_lost();
        }
    }

    /// Continues the current run on this cell alone.
    fn degrade(&mut self) {
        let mode = RoleMode::alone(self.role());
        if self.pairing.mode != mode {
            info!(from = %self.pairing.mode, to = %mode, "degrading to single-side");
            self.set_mode(mode);
        }
    }

    fn set_mode(&mut self, mode: RoleMode) {
        self.pairing.mode = mode;
        self.invalidate_display();
    }

    /// Clears the ledger and wakes every waiter. Returns entries dropped.
    fn discard_outstanding(&mut self) -> usize {
        self.generation += 1;
        let dropped = self.ledger.clear();
        if dropped > 0 {
            debug!(dropped, generation = self.generation, "outstanding requests discarded");
        }
        dropped
    }

    fn send(&mut self, signal: &Signal) -> Result<(), CellError> {
        trace!(%signal, "sending");
        self.transport.send(signal).map_err(|e| {
            warn!(error = %e, %signal, "send failed");
            self.transport.close();
            self.on_link_lost();
            CellError::from(e)
        })
    }

    fn invalidate_display(&mut self) {
        self.display = None;
    }

    fn push_resolved(&mut self, completion: Completion) {
        if self.resolved.len() == RESOLVED_CAPACITY {
            self.resolved.pop_front();
        }
        self.resolved.push_back(completion);
    }

    fn take_resolved(&mut self, key: SignalKey) -> Option<Completion> {
        let idx = self.resolved.iter().position(|c| c.key == key)?;
        self.resolved.remove(idx)
    }

    fn forget_resolved(&mut self, key: SignalKey) {
        self.resolved.retain(|c| c.key != key);
    }

    /// Error for a waiter whose request was discarded.
    fn interrupted(&self) -> CellError {
        let fault = self.last_fault.clone().unwrap_or_else(|| {
            Fault::new(codes::LINK_LOST, "outstanding requests were discarded")
        });
        CellError::Fault(fault)
    }
}

impl<T: Transport, H: RequestHandler> FailurePropagation for Coordinator<T, H> {
    /// Aborts the shared plan on the peer and continues alone.
    fn propagate_failure(&mut self, report: &FailureReport) {
        if self.forwards_phases() && self.pairing.health == LinkHealth::Handshaked {
            let abort = Signal::Failure {
                key: None,
                report: report.clone(),
            };
            if let Err(e) = self.send(&abort) {
                warn!(error = %e, "could not propagate failure");
            }
        }
        self.last_fault = Some(report.clone().into());
        self.discard_outstanding();
        self.degrade();
    }
}
