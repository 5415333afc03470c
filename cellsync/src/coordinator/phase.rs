//! Phase handshakes with the peer.
//!
//! Every phase boundary follows one pattern: record the request in the
//! ledger, send it, then wait cooperatively until its completion arrives.
//! A `FAILURE` has already cleared the ledger and degraded the run by the
//! time the waiter sees it; the waiter only surfaces it.

use std::time::Duration;

use minstant::Instant;

use crate::error::{CellError, Fault, ProtocolError};
use crate::link::Transport;
use crate::protocol::{
    Completion, MeasureMode, MeasurementId, Outcome, PlanRef, Signal, SignalKey, codes,
};
use crate::trace::{debug, warn};
use crate::wait::{Headless, Timeout, await_completion};

use super::Coordinator;
use super::pairing::{LinkHealth, Pairing};
use super::service::RequestHandler;

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The peer completed the phase.
    Completed,
    /// The phase runs on this cell only; nothing was forwarded.
    Local,
}

impl<T: Transport, H: RequestHandler> Coordinator<T, H> {
    /// Ticks the link until `step` yields, with the modal surface live.
    pub(super) fn wait_for<R>(
        &mut self,
        timeout: Timeout,
        mut step: impl FnMut(&mut Self) -> Result<Option<R>, CellError>,
    ) -> Result<R, CellError> {
        let mut ui = std::mem::replace(&mut self.ui, Box::new(Headless));
        let result = await_completion(timeout, ui.as_mut(), || {
            self.tick()?;
            step(self)
        });
        self.ui = ui;
        result
    }

    /// Waits for the completion of `key`, failing if outstanding requests
    /// are discarded first.
    fn await_resolution(
        &mut self,
        key: SignalKey,
        generation: u64,
        timeout: Timeout,
    ) -> Result<Completion, CellError> {
        self.wait_for(timeout, |c| {
            if let Some(done) = c.take_resolved(key) {
                return Ok(Some(done));
            }
            if c.generation != generation {
                return Err(c.interrupted());
            }
            Ok(None)
        })
    }

    /// Sends `requests` back to back and waits for each completion in order.
    pub(super) fn run_requests(
        &mut self,
        requests: Vec<Signal>,
        timeout: Timeout,
    ) -> Result<PhaseOutcome, CellError> {
        if !self.forwards_phases() {
            debug!(requests = requests.len(), "phase kept local");
            return Ok(PhaseOutcome::Local);
        }
        if self.pairing.health != LinkHealth::Handshaked {
            warn!("link not ready, continuing single-side");
            self.degrade();
            return Ok(PhaseOutcome::Local);
        }

        for request in &requests {
            self.forget_resolved(request.key());
        }
        let generation = self.generation;
        for request in &requests {
            self.ledger.append_todo(request.clone());
            self.send(request)?;
            debug!(%request, outstanding = self.ledger.len(), "request sent");
        }

        let mut phase = PhaseOutcome::Completed;
        for request in &requests {
            match self.await_resolution(request.key(), generation, timeout) {
                Ok(Completion {
                    outcome: Outcome::Success,
                    ..
                }) => {}
                // The peer unpaired while the request was in flight.
                Ok(Completion {
                    outcome: Outcome::Failure(_report),
                    ..
                }) if self.pairing.desired == Pairing::Unpaired => {
                    debug!(%request, report = %_report, "peer declined after unpairing");
                    phase = PhaseOutcome::Local;
                }
                Ok(Completion {
                    outcome: Outcome::Failure(report),
                    ..
                }) => return Err(Fault::from(report).into()),
                Err(CellError::Cancelled) => return Err(self.abort()),
                Err(CellError::Fault(fault)) if fault.code == codes::PHASE_TIMEOUT => {
                    warn!(%request, "peer did not complete phase in time");
                    self.discard_outstanding();
                    self.degrade();
                    self.last_fault = Some(fault.clone());
                    return Err(fault.into());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(phase)
    }

    pub fn run_phase(&mut self, request: Signal) -> Result<PhaseOutcome, CellError> {
        let timeout = self.config.link.phase_timeout();
        self.run_requests(vec![request], timeout)
    }

    pub fn start_digitizing(&mut self) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::Start)
    }

    pub fn measure(&mut self, mode: MeasureMode) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::Measure(mode))
    }

    pub fn calibrate(&mut self) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::Measure(MeasureMode::Calibration))
    }

    /// Stores the measurement list on the peer.
    pub fn save(&mut self, measurements: Vec<MeasurementId>) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::Save(measurements))
    }

    /// Announces an exported photogrammetry file to the peer.
    pub fn export_photogrammetry(
        &mut self,
        file: impl Into<String>,
    ) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::ExportedFile(file.into()))
    }

    /// Asks the peer to import a reference file, or to drop its reference.
    pub fn import_reference(&mut self, file: Option<String>) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::RefXml(file))
    }

    pub fn retry_alignment(
        &mut self,
        reference: Option<String>,
    ) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::AlignmentIter(reference))
    }

    pub fn restart(&mut self) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::Restart)
    }

    pub fn open_init(&mut self, plan: PlanRef) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::OpenInit(plan))
    }

    pub fn close_template(&mut self) -> Result<PhaseOutcome, CellError> {
        self.run_phase(Signal::CloseTemplate)
    }

    /// Blocks until no request is outstanding.
    pub fn wait_until_settled(&mut self, timeout: Timeout) -> Result<(), CellError> {
        self.wait_for(timeout, |c| Ok(c.ledger.is_empty().then_some(())))
            .map_err(|e| match e {
                CellError::Cancelled => self.abort(),
                other => other,
            })
    }

    /// Waits until the link is handshaked.
    pub fn await_handshake(&mut self, timeout: Timeout) -> Result<(), CellError> {
        self.wait_for(timeout, |c| {
            Ok((c.pairing.health == LinkHealth::Handshaked).then_some(()))
        })
        .map_err(|e| match e {
            CellError::Fault(f) if f.code == codes::PHASE_TIMEOUT => {
                ProtocolError::HandshakeTimeout.into()
            }
            other => other,
        })
    }

    /// Startup probe bounded by `link.alive_timeout_secs` (60 s unless
    /// configured).
    pub fn probe_alive(&mut self) -> Result<Duration, CellError> {
        let timeout = self.config.link.alive_timeout();
        self.probe_alive_within(timeout)
    }

    /// Checks that the peer application answers, returning the round trip.
    ///
    /// Waits for the handshake first. A peer that stays silent is dropped so
    /// the link reconnects.
    pub fn probe_alive_within(&mut self, timeout: Duration) -> Result<Duration, CellError> {
        self.await_handshake(Timeout::Duration(timeout))?;

        self.forget_resolved(SignalKey::ServerAlive);
        let generation = self.generation;
        let started = Instant::now();
        self.ledger.append_todo(Signal::ServerAlive);
        self.send(&Signal::ServerAlive)?;

        let outcome =
            self.await_resolution(SignalKey::ServerAlive, generation, Timeout::Duration(timeout));
        match outcome {
            Ok(Completion {
                outcome: Outcome::Success,
                ..
            }) => {
                let rtt = started.elapsed();
                debug!(?rtt, "peer alive");
                Ok(rtt)
            }
            Ok(Completion {
                outcome: Outcome::Failure(report),
                ..
            }) => Err(Fault::from(report).into()),
            Err(CellError::Fault(f)) if f.code == codes::PHASE_TIMEOUT => {
                warn!(?timeout, "peer did not answer alive probe, dropping link");
                self.transport.close();
                self.on_link_lost();
                Err(ProtocolError::AliveTimeout(timeout).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Services the peer until the link closes. Used by secondary cells.
    pub fn serve(&mut self) -> Result<(), CellError> {
        self.wait_for(Timeout::Infinite, |c| {
            let closed = c.pairing.health == LinkHealth::Disconnected && c.endpoint.is_none();
            Ok(closed.then_some(()))
        })
    }

    /// True when phases must be mirrored on the peer.
    pub fn forwards_phases(&self) -> bool {
        self.pairing.desired == Pairing::Paired && self.pairing.mode.involves_peer(self.role())
    }
}
