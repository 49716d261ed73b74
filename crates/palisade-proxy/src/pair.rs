use std::{
    collections::VecDeque,
    io::{self, Write},
    net::SocketAddr,
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use mio::{net::TcpStream, Interest, Token};
use palisade_http::{RequestBuilder, RequestParser, RequestSummary};

/// Which side of the proxied connection an endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

/// Role-specific endpoint state. Client endpoints parse and buffer the
/// in-flight request; backend endpoints only track connect progress.
pub(crate) enum Role {
    Client {
        peer: SocketAddr,
        parser: RequestParser,
        builder: RequestBuilder,
        /// Raw bytes of the message being parsed, buffered in full before
        /// any forwarding. Buffering is what makes blocking effective.
        message: BytesMut,
    },
    Backend {
        connected: bool,
    },
}

/// One socket side of a proxied connection.
pub(crate) struct Endpoint {
    pub stream: TcpStream,
    pub token: Token,
    pub role: Role,
    /// Once set, reads are drained but discarded until close completes.
    pub cancelled: bool,
    /// EOF observed from the peer.
    pub closed: bool,
    queue: VecDeque<Bytes>,
    queue_offset: usize,
}

impl Endpoint {
    pub fn new(stream: TcpStream, token: Token, role: Role) -> Self {
        Self {
            stream,
            token,
            role,
            cancelled: false,
            closed: false,
            queue: VecDeque::new(),
            queue_offset: 0,
        }
    }

    pub fn queue_write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.queue.push_back(data);
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Whether the socket can accept writes at all yet.
    fn writable_now(&self) -> bool {
        !matches!(self.role, Role::Backend { connected: false })
    }

    /// Flush queued bytes until the queue drains or the socket would
    /// block. Partial writes leave an offset into the front chunk;
    /// [`interest`](Self::interest) reflects whatever remains.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.writable_now() {
            return Ok(());
        }

        while let Some(front) = self.queue.front() {
            match self.stream.write(&front[self.queue_offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ));
                }
                Ok(sent) => {
                    self.queue_offset += sent;
                    if self.queue_offset == front.len() {
                        self.queue.pop_front();
                        self.queue_offset = 0;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    /// Take the finished message off a client endpoint and re-arm its
    /// parser for the next one.
    ///
    /// `None` on backend endpoints or if no request line was ever seen.
    pub fn take_message(&mut self) -> Option<(RequestSummary, Bytes, SocketAddr)> {
        let Role::Client {
            peer,
            parser,
            builder,
            message,
        } = &mut self.role
        else {
            return None;
        };

        let summary = builder.finish()?;
        let raw = message.split().freeze();
        parser.reset();
        Some((summary, raw, *peer))
    }
}

/// The client/backend endpoint pair forwarded through the shim.
///
/// A pair exists iff both endpoints are registered with the reactor;
/// closing either side marks the whole pair for teardown.
pub(crate) struct ConnectionPair {
    pub client: Endpoint,
    pub backend: Endpoint,
    pub last_activity: Instant,
    /// Tear down once the remaining write queues drain.
    pub closing: bool,
}

impl ConnectionPair {
    pub fn new(client: Endpoint, backend: Endpoint) -> Self {
        Self {
            client,
            backend,
            last_activity: Instant::now(),
            closing: false,
        }
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Client => &self.client,
            Side::Backend => &self.backend,
        }
    }

    pub fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Client => &mut self.client,
            Side::Backend => &mut self.backend,
        }
    }

    /// The readiness one endpoint currently needs from the poll.
    ///
    /// An endpoint is read only while its peer's write queue is empty;
    /// queued bytes flush before new bytes are taken in, so a slow peer
    /// stalls the producer instead of growing the queue without bound.
    pub fn interest(&self, side: Side) -> Interest {
        let endpoint = self.endpoint(side);
        let peer = self.endpoint(side.peer());

        let mut interest = if peer.has_pending_writes() {
            None
        } else {
            Some(Interest::READABLE)
        };
        if endpoint.has_pending_writes() || !endpoint.writable_now() {
            interest = Some(match interest {
                Some(interest) => interest | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        // mio has no empty interest; a spurious writable wake flushes
        // nothing and rearms
        interest.unwrap_or(Interest::WRITABLE)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Ready for teardown: marked closing and nothing left to flush.
    pub fn finished(&self) -> bool {
        self.closing
            && !self.client.has_pending_writes()
            && !self.backend.has_pending_writes()
    }
}
