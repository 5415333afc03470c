//! The transport contract consumed by the coordinator.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::net::Endpoint;
use crate::protocol::{CodecError, Signal};

/// Connection state as seen by a transport.
///
/// The application-level `Handshaked` state is tracked above the
/// transport, by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// A non-blocking connect is in flight.
    Connecting,
    Connected,
}

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// `send` was called without an established connection.
    #[error("link is not connected")]
    NotConnected,
    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),
}

/// Non-blocking, message-oriented link to the peer cell.
///
/// All methods are called from the single polling thread. Connection
/// failures are silent: callers observe them through [`Transport::state`].
pub trait Transport {
    /// Starts connecting to `endpoint`, dropping any existing connection.
    /// Never blocks.
    fn connect(&mut self, endpoint: Endpoint);

    fn state(&self) -> LinkState;

    /// Queues `signal` for delivery. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] when no connection is up.
    fn send(&mut self, signal: &Signal) -> Result<(), LinkError>;

    /// Drives I/O once, waiting at most `timeout` for readiness.
    ///
    /// # Errors
    ///
    /// Returns an error only if the poller itself fails; peer resets show
    /// up as a transition to [`LinkState::Disconnected`].
    fn poll(&mut self, timeout: Duration) -> Result<(), LinkError>;

    /// Takes every signal received so far, in arrival order.
    fn drain(&mut self) -> Vec<Signal>;

    /// Drops the connection.
    fn close(&mut self);
}
