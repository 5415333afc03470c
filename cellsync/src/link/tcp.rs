//! TCP transport driven by a private mio [`Poll`].

use std::io::{self, ErrorKind};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::net::{Endpoint, TcpListener, TcpStream};
use crate::protocol::{FrameDecoder, Signal, encode_signal};
use crate::trace::{debug, info, trace, warn};

use super::transport::{LinkError, LinkState, Transport};

const STREAM: Token = Token(0);
const LISTENER: Token = Token(1);

/// Bytes read from the socket per `read` call.
const READ_CHUNK: usize = 64 * 1024;

/// Event capacity; a transport owns at most one stream.
const EVENT_CAPACITY: usize = 16;

/// Non-blocking TCP link to the peer cell.
///
/// Outbound frames are buffered and flushed whenever the socket is
/// writable; inbound bytes are reassembled into signals and held until
/// [`Transport::drain`].
pub struct TcpTransport {
    poll: Poll,
    events: Events,
    stream: Option<TcpStream>,
    state: LinkState,
    outbound: Vec<u8>,
    decoder: FrameDecoder,
    inbox: Vec<Signal>,
    read_buf: Vec<u8>,
}

impl TcpTransport {
    /// Creates a disconnected transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            stream: None,
            state: LinkState::Disconnected,
            outbound: Vec::new(),
            decoder: FrameDecoder::new(),
            inbox: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK],
        })
    }

    /// Wraps an already-accepted stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller cannot be created or the stream
    /// cannot be registered.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let mut transport = Self::new()?;
        let _ = stream.set_nodelay(true);
        transport.attach(stream, LinkState::Connected)?;
        Ok(transport)
    }

    fn attach(&mut self, mut stream: TcpStream, state: LinkState) -> io::Result<()> {
        self.poll.registry().register(
            &mut stream,
            STREAM,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.stream = Some(stream);
        self.state = state;
        Ok(())
    }

    /// Drops the stream and every buffered byte.
    fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
            stream.shutdown();
        }
        if self.state != LinkState::Disconnected {
            info!("link down");
        }
        self.state = LinkState::Disconnected;
        self.outbound.clear();
        self.decoder = FrameDecoder::new();
    }

    fn complete_connect(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        match stream.finish_connect() {
            Ok(true) => {
                let _ = stream.set_nodelay(true);
                let _peer = stream.peer_addr().ok();
                info!(peer = ?_peer, "link connected");
                self.state = LinkState::Connected;
            }
            Ok(false) => {}
            Err(_e) => {
                debug!(error = %_e, "connect failed");
                self.teardown();
            }
        }
    }

    /// Reads until the socket would block. Returns `false` if the link
    /// went down.
    fn read_available(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut closed = false;
        loop {
            match stream.try_read(&mut self.read_buf) {
                Ok(Some(0)) => {
                    debug!("peer closed the connection");
                    closed = true;
                    break;
                }
                Ok(Some(n)) => self.decoder.extend(&self.read_buf[..n]),
                Ok(None) => break,
                Err(_e) => {
                    debug!(error = %_e, "read failed");
                    closed = true;
                    break;
                }
            }
        }

        // Frames that arrived ahead of a close are still delivered.
        while let Some(next) = self.decoder.next_signal() {
            match next {
                Ok(signal) => {
                    trace!(signal = %signal, "received");
                    self.inbox.push(signal);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "dropping undecodable frame");
                }
                Err(_e) => {
                    warn!(error = %_e, "stream out of sync, dropping connection");
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.teardown();
        }
        !closed
    }

    /// Writes buffered frames until done or the socket would block.
    fn flush(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut written = 0;
        let mut failed = false;
        while written < self.outbound.len() {
            match stream.try_write(&self.outbound[written..]) {
                Ok(Some(0)) => {
                    debug!("write returned zero bytes");
                    failed = true;
                    break;
                }
                Ok(Some(n)) => written += n,
                Ok(None) => break,
                Err(_e) => {
                    debug!(error = %_e, "write failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.teardown();
        } else {
            self.outbound.drain(..written);
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, endpoint: Endpoint) {
        self.teardown();
        match TcpStream::connect(endpoint) {
            Ok(stream) => {
                if let Err(_e) = self.attach(stream, LinkState::Connecting) {
                    debug!(endpoint = %endpoint, error = %_e, "register failed");
                    return;
                }
                debug!(endpoint = %endpoint, "connecting");
            }
            Err(_e) => {
                debug!(endpoint = %endpoint, error = %_e, "connect failed");
            }
        }
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn send(&mut self, signal: &Signal) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        encode_signal(signal, &mut self.outbound)?;
        trace!(signal = %signal, "sending");
        self.flush();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), LinkError> {
        if self.stream.is_none() {
            // Nothing registered; honour the tick length anyway.
            std::thread::sleep(timeout);
            return Ok(());
        }
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let mut readable = false;
        let mut writable = false;
        for event in &self.events {
            if event.token() == STREAM {
                readable |= event.is_readable() || event.is_read_closed() || event.is_error();
                writable |= event.is_writable() || event.is_error();
            }
        }

        if self.state == LinkState::Connecting && writable {
            self.complete_connect();
        }
        if self.state == LinkState::Connected {
            if readable && !self.read_available() {
                return Ok(());
            }
            if !self.outbound.is_empty() {
                self.flush();
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.inbox)
    }

    fn close(&mut self) {
        self.teardown();
        self.inbox.clear();
    }
}

/// Listening side of the link, used by the secondary cell.
pub struct TcpAcceptor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Binds to `endpoint` and starts listening.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(endpoint)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.listener.local_addr()
    }

    /// Waits up to `timeout` for a primary to connect.
    ///
    /// # Errors
    ///
    /// Returns an error if polling or accepting fails.
    pub fn accept(&mut self, timeout: Duration) -> io::Result<Option<TcpTransport>> {
        if let Some((stream, _from)) = self.listener.try_accept()? {
            info!(from = %_from, "accepted link");
            return TcpTransport::from_stream(stream).map(Some);
        }
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }
        match self.listener.try_accept()? {
            Some((stream, _from)) => {
                info!(from = %_from, "accepted link");
                TcpTransport::from_stream(stream).map(Some)
            }
            None => Ok(None),
        }
    }
}
