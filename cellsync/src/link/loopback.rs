//! In-process transport whose peer is a callback.
//!
//! Every signal sent is handed to a [`Responder`]; its replies are delivered
//! on the next [`Transport::poll`]. Used for deterministic scenario tests and
//! for dry-running a plan without a second cell.

use std::collections::VecDeque;
use std::time::Duration;

use crate::net::Endpoint;
use crate::protocol::Signal;

use super::transport::{LinkError, LinkState, Transport};

/// Simulated peer behaviour.
pub trait Responder {
    /// Produces the peer's replies to `signal`, in delivery order.
    fn respond(&mut self, signal: &Signal) -> Vec<Signal>;
}

impl<F> Responder for F
where
    F: FnMut(&Signal) -> Vec<Signal>,
{
    fn respond(&mut self, signal: &Signal) -> Vec<Signal> {
        self(signal)
    }
}

/// A peer that answers handshakes and completes every request successfully.
#[derive(Debug, Clone, Copy)]
pub struct AcceptAll {
    /// Process id reported in the peer's handshake.
    pub pid: u32,
}

impl Default for AcceptAll {
    fn default() -> Self {
        Self { pid: 1 }
    }
}

impl Responder for AcceptAll {
    fn respond(&mut self, signal: &Signal) -> Vec<Signal> {
        match signal {
            Signal::Handshake { .. } => vec![Signal::Handshake { pid: self.pid }],
            s if s.is_request() => vec![Signal::Success { key: s.key() }],
            _ => Vec::new(),
        }
    }
}

/// Loopback transport.
pub struct LoopbackTransport<R> {
    responder: R,
    state: LinkState,
    /// Replies produced but not yet delivered by `poll`.
    in_flight: VecDeque<Signal>,
    inbox: Vec<Signal>,
    sent: Vec<Signal>,
    refuse_connect: bool,
}

impl LoopbackTransport<AcceptAll> {
    /// A loopback whose peer accepts everything.
    #[must_use]
    pub fn accepting() -> Self {
        Self::new(AcceptAll::default())
    }
}

impl<R: Responder> LoopbackTransport<R> {
    #[must_use]
    pub fn new(responder: R) -> Self {
        Self {
            responder,
            state: LinkState::Disconnected,
            in_flight: VecDeque::new(),
            inbox: Vec::new(),
            sent: Vec::new(),
            refuse_connect: false,
        }
    }

    /// Makes subsequent `connect` calls fail silently.
    pub fn refuse_connections(&mut self, refuse: bool) {
        self.refuse_connect = refuse;
    }

    /// Delivers a peer-initiated signal on the next poll.
    pub fn inject(&mut self, signal: Signal) {
        self.in_flight.push_back(signal);
    }

    /// Simulates the peer dropping the connection.
    pub fn drop_link(&mut self) {
        self.state = LinkState::Disconnected;
        self.in_flight.clear();
    }

    /// Every signal sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> &[Signal] {
        &self.sent
    }

    /// Forgets the sent log.
    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    pub fn responder_mut(&mut self) -> &mut R {
        &mut self.responder
    }
}

impl<R: Responder> Transport for LoopbackTransport<R> {
    fn connect(&mut self, _endpoint: Endpoint) {
        self.in_flight.clear();
        self.state = if self.refuse_connect {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        };
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn send(&mut self, signal: &Signal) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        self.sent.push(signal.clone());
        let replies = self.responder.respond(signal);
        self.in_flight.extend(replies);
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Result<(), LinkError> {
        if self.state == LinkState::Connected {
            self.inbox.extend(self.in_flight.drain(..));
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.inbox)
    }

    fn close(&mut self) {
        self.state = LinkState::Disconnected;
        self.in_flight.clear();
        self.inbox.clear();
    }
}
