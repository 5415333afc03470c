//! Network primitives for the cell link.
//!
//! Thin mio-based wrappers: every operation is non-blocking and readiness
//! is driven by the owner's [`mio::Poll`].

pub mod endpoint;
pub mod stream;

pub use endpoint::Endpoint;
pub use stream::{TcpListener, TcpStream};
