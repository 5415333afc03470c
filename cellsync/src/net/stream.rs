//! Non-blocking TCP stream and listener for mio-based I/O.

use std::io::{self, ErrorKind, Read, Write};

use mio::event::Source;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking TCP stream.
///
/// `connect` returns immediately; the connection is established once the
/// stream reports writable and [`TcpStream::finish_connect`] succeeds.
pub struct TcpStream {
    inner: MioTcpStream,
}

impl TcpStream {
    /// Starts a non-blocking connect.
    ///
    /// # Errors
    ///
    /// Returns an error only if the socket cannot be created; refusals and
    /// resets surface later through [`TcpStream::finish_connect`].
    pub fn connect(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpStream::connect(endpoint.into())?;
        Ok(Self { inner })
    }

    pub(crate) fn from_mio(inner: MioTcpStream) -> Self {
        Self { inner }
    }

    /// Checks whether a pending connect has completed.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` while still in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the connect failed.
    pub fn finish_connect(&self) -> io::Result<bool> {
        if let Some(e) = self.inner.take_error()? {
            return Err(e);
        }
        // Hard failures were reported by `take_error`; anything `peer_addr`
        // says now means the handshake is still in flight.
        Ok(self.inner.peer_addr().is_ok())
    }

    /// Returns the remote address.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is not connected.
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        self.inner.peer_addr().map(Endpoint::from)
    }

    /// Disables Nagle's algorithm; signals are small and latency-bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Attempts to write, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Attempts to read, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// `Ok(Some(0))` means the peer closed the connection.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Shuts down both halves; errors are ignored since the stream is
    /// being discarded.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }
}

impl Source for TcpStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

/// A non-blocking TCP listener.
pub struct TcpListener {
    inner: MioTcpListener,
}

impl TcpListener {
    /// Binds a listener to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is in use or cannot be bound.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpListener::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Accepts one pending connection, returning `Ok(None)` if none is
    /// waiting.
    pub fn try_accept(&self) -> io::Result<Option<(TcpStream, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => Ok(Some((TcpStream::from_mio(stream), Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for TcpListener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
