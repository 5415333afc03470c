//! Transport adapters for the cell link.
//!
//! - `transport`: the contract the coordinator drives ([`Transport`]).
//! - `tcp`: mio-backed TCP implementation plus the listening side.
//! - `loopback`: in-process transport whose peer is a [`Responder`].
//! - `handshake`: `HANDSHAKE(pid)` exchange that gates link use.

pub mod handshake;
pub mod loopback;
pub mod tcp;
pub mod transport;

pub use handshake::Handshake;
pub use loopback::{AcceptAll, LoopbackTransport, Responder};
pub use tcp::{TcpAcceptor, TcpTransport};
pub use transport::{LinkError, LinkState, Transport};
