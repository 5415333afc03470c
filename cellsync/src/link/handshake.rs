//! `HANDSHAKE(pid)` exchange that gates use of a freshly connected link.
//!
//! Both sides announce their pid as soon as the transport reports
//! `Connected`. The link is usable once the peer's announcement arrives. A
//! side that receives the peer's handshake before sending its own answers
//! immediately, so the exchange completes regardless of who speaks first.
//! A handshake arriving on a completed link is a resync request from the
//! peer and is answered the same way.

use std::time::Duration;

use minstant::Instant;

use crate::protocol::Signal;
use crate::trace::debug;

use super::transport::{LinkError, Transport};

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Sent { since: Instant },
    Complete { peer_pid: u32 },
}

/// Handshake progress for one connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    pid: u32,
    phase: Phase,
}

impl Handshake {
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self {
            pid,
            phase: Phase::Idle,
        }
    }

    /// Local pid announced to the peer.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends our handshake. No-op once sent or complete.
    pub fn start<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), LinkError> {
        if !matches!(self.phase, Phase::Idle) {
            return Ok(());
        }
        transport.send(&Signal::Handshake { pid: self.pid })?;
        debug!(pid = self.pid, "handshake sent");
        self.phase = Phase::Sent {
            since: Instant::now(),
        };
        Ok(())
    }

    /// Records the peer's handshake, answering unless ours is already on
    /// its way.
    ///
    /// A peer that handshakes again on a completed link gets a fresh answer.
    pub fn on_peer<T: Transport + ?Sized>(
        &mut self,
        peer_pid: u32,
        transport: &mut T,
    ) -> Result<(), LinkError> {
        if !matches!(self.phase, Phase::Sent { .. }) {
            transport.send(&Signal::Handshake { pid: self.pid })?;
        }
        debug!(pid = self.pid, peer_pid, "handshake complete");
        self.phase = Phase::Complete { peer_pid };
        Ok(())
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete { .. })
    }

    /// Pid of the peer once the exchange is complete.
    #[must_use]
    pub const fn peer_pid(&self) -> Option<u32> {
        match self.phase {
            Phase::Complete { peer_pid } => Some(peer_pid),
            _ => None,
        }
    }

    /// True when our handshake has been outstanding longer than `timeout`.
    #[must_use]
    pub fn timed_out(&self, timeout: Duration) -> bool {
        match self.phase {
            Phase::Sent { since } => since.elapsed() > timeout,
            _ => false,
        }
    }

    /// Forgets all progress; called on link loss.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::loopback::LoopbackTransport;
    use crate::link::transport::Transport;
    use crate::net::Endpoint;

    fn connected() -> LoopbackTransport<crate::link::AcceptAll> {
        let mut link = LoopbackTransport::accepting();
        link.connect(Endpoint::localhost(0));
        link
    }

    #[test]
    fn initiator_completes_on_reply() {
        let mut link = connected();
        let mut hs = Handshake::new(42);
        hs.start(&mut link).unwrap();
        hs.start(&mut link).unwrap();
        assert_eq!(link.sent(), &[Signal::Handshake { pid: 42 }]);
        assert!(!hs.is_complete());

        hs.on_peer(7, &mut link).unwrap();
        assert!(hs.is_complete());
        assert_eq!(hs.peer_pid(), Some(7));
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn completed_side_answers_resync() {
        let mut link = connected();
        let mut hs = Handshake::new(5);
        hs.start(&mut link).unwrap();
        hs.on_peer(8, &mut link).unwrap();

        hs.on_peer(8, &mut link).unwrap();
        assert_eq!(
            link.sent(),
            &[Signal::Handshake { pid: 5 }, Signal::Handshake { pid: 5 }]
        );
    }

    #[test]
    fn responder_answers_before_completing() {
        let mut link = connected();
        let mut hs = Handshake::new(3);
        hs.on_peer(9, &mut link).unwrap();
        assert_eq!(hs.peer_pid(), Some(9));
        assert_eq!(link.sent(), &[Signal::Handshake { pid: 3 }]);
    }

    #[test]
    fn timeout_only_while_sent() {
        let mut link = connected();
        let mut hs = Handshake::new(1);
        assert!(!hs.timed_out(Duration::ZERO));
        hs.start(&mut link).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(hs.timed_out(Duration::ZERO));
        hs.reset();
        assert!(!hs.timed_out(Duration::ZERO));
    }
}
