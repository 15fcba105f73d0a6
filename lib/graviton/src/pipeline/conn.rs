//! The connection channel shared by the concrete pipeline variants: a
//! non-blocking transport, a pair of byte buffers and the protocol engine
//! advancing against them.

use std::io;
use std::time::Instant;

use mio::net::{TcpStream, UnixStream};
use mio::unix::pipe;
use mio::{Interest, Registry, Token};

use quark::shared::{NetworkError, NetworkResult};

use crate::codec::buffer::Buffer;
use crate::proto::ProtocolEngine;

/// Lifecycle of a connection. `Starting` until the socket reports writable
/// without error, `Inactive` after a loss that may be retried, `Stopped`
/// once the owner gives up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnState {
    Starting,
    Started,
    Inactive,
    Stopped,
}

/// The concrete byte transports a connection can sit on.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Pipe {
        input: pipe::Receiver,
        output: pipe::Sender,
    },
}

impl Transport {
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => {
                registry.register(stream, token, Interest::READABLE | Interest::WRITABLE)
            }
            Transport::Unix(stream) => {
                registry.register(stream, token, Interest::READABLE | Interest::WRITABLE)
            }
            Transport::Pipe { input, output } => {
                registry.register(input, token, Interest::READABLE)?;
                registry.register(output, token, Interest::WRITABLE)
            }
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => registry.deregister(stream),
            Transport::Unix(stream) => registry.deregister(stream),
            Transport::Pipe { input, output } => {
                registry.deregister(input)?;
                registry.deregister(output)
            }
        }
    }

    /// The pending socket error, if the OS reports one. Meaningful for TCP
    /// connects; pipes have nothing to report.
    pub fn take_error(&self) -> Option<io::Error> {
        match self {
            Transport::Tcp(stream) => stream.take_error().ok().flatten(),
            Transport::Unix(stream) => stream.take_error().ok().flatten(),
            Transport::Pipe { .. } => None,
        }
    }

    /// The local bind port of a TCP transport, 0 otherwise.
    pub fn local_port(&self) -> u16 {
        match self {
            Transport::Tcp(stream) => stream.local_addr().map(|a| a.port()).unwrap_or(0),
            _ => 0,
        }
    }

    fn reader(&mut self) -> &mut dyn io::Read {
        match self {
            Transport::Tcp(stream) => stream,
            Transport::Unix(stream) => stream,
            Transport::Pipe { input, .. } => input,
        }
    }

    fn writer(&mut self) -> &mut dyn io::Write {
        match self {
            Transport::Tcp(stream) => stream,
            Transport::Unix(stream) => stream,
            Transport::Pipe { output, .. } => output,
        }
    }
}

pub struct Channel {
    pub transport: Transport,
    pub state: ConnState,
    pub engine: ProtocolEngine,
    pub input: Buffer,
    pub output: Buffer,
    /// When the channel entered its current state.
    pub since: Instant,
}

impl Channel {
    pub fn new(transport: Transport, engine: ProtocolEngine) -> Channel {
        Channel {
            transport,
            state: ConnState::Starting,
            engine,
            input: Buffer::new(),
            output: Buffer::new(),
            since: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            self.state = state;
            self.since = Instant::now();
        }
    }

    /// Read everything available off the transport into the input buffer.
    pub fn fill(&mut self) -> NetworkResult<usize> {
        self.input
            .ingress(self.transport.reader())
            .map_err(NetworkError::from)
    }

    /// Push buffered output to the transport.
    pub fn flush(&mut self) -> NetworkResult<usize> {
        if self.output.is_empty() {
            return Ok(0);
        }
        self.output
            .egress(self.transport.writer())
            .map_err(NetworkError::from)
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.output.is_empty()
    }
}
