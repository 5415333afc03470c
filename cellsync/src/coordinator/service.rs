//! Servicing requests sent by the peer.
//!
//! Every request-class signal gets exactly one reply: `SUCCESS(key)` or
//! `FAILURE(key, report)`. `SERVER_ALIVE` is answered here; `UNPAIR` and
//! `SINGLE_SIDE` update pairing state before the application handler sees
//! them.

use crate::error::CellError;
use crate::link::Transport;
use crate::protocol::{FailureReport, Signal};
use crate::trace::{info, warn};

use super::pairing::{Pairing, RoleMode};
use super::Coordinator;

/// Application side of a cell: executes requests from the peer.
pub trait RequestHandler {
    fn handle(&mut self, request: &Signal) -> Result<(), FailureReport>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&Signal) -> Result<(), FailureReport>,
{
    fn handle(&mut self, request: &Signal) -> Result<(), FailureReport> {
        self(request)
    }
}

/// Handler that logs and accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptRequests;

impl RequestHandler for AcceptRequests {
    fn handle(&mut self, request: &Signal) -> Result<(), FailureReport> {
        info!(%request, "accepted peer request");
        Ok(())
    }
}

impl<T: Transport, H: RequestHandler> Coordinator<T, H> {
    pub(super) fn service(&mut self, request: Signal) -> Result<(), CellError> {
        let key = request.key();
        match &request {
            Signal::ServerAlive => return self.send(&Signal::Success { key }),
            Signal::Unpair { unpaired } => {
                let desired = Pairing::from_unpaired(*unpaired);
                info!(%desired, "peer changed pairing");
                self.pairing.desired = desired;
                if desired == Pairing::Paired {
                    self.pairing.mode = RoleMode::Dual;
                }
                self.invalidate_display();
            }
            Signal::SingleSide(plan) => {
                info!(%plan, "peer hands plan to this cell alone");
                self.set_mode(RoleMode::alone(self.role()));
            }
            _ => {}
        }

        let reply = match self.handler.handle(&request) {
            Ok(()) => Signal::Success { key },
            Err(report) => {
                warn!(%request, %report, "peer request failed");
                Signal::failure_for(key, report)
            }
        };
        self.send(&reply)
    }
}
