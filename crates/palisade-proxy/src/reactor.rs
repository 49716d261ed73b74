use std::{
    collections::HashMap,
    io::{self, Read},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _, Error};
use bytes::{Bytes, BytesMut};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Token,
};
use palisade_http::{ParserEvent, RequestBuilder, RequestParser};
use palisade_policy::{evaluate, Authenticator, Decision, PolicyTable};
use thunderdome::{Arena, Index};
use tracing::{event, instrument, Level};

use crate::{
    block::BLOCK_RESPONSE,
    pair::{ConnectionPair, Endpoint, Role, Side},
    registry::Registry,
};

/// Upper bound on ready events handled per reactor wake.
const MAX_EVENTS: usize = 256;
/// Read granularity per socket.
const READ_BUF_SIZE: usize = 4096;

/// Reactor tuning knobs.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub backend: SocketAddr,
    /// New accepts are dropped (gracefully) beyond this many live pairs.
    pub max_pairs: usize,
    /// Pairs idle longer than this are reaped. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddr, backend: SocketAddr) -> Self {
        Self {
            listen,
            backend,
            max_pairs: 1024,
            idle_timeout: None,
        }
    }
}

#[derive(Clone, Copy)]
struct PairRef {
    index: Index,
    side: Side,
}

enum Step {
    Parsed,
    Suspend,
    Complete,
    Malformed(palisade_http::ParseError),
}

enum Flow {
    Continue,
    Stop,
}

/// The firewall shim reactor: one thread, one poll, all connections.
pub struct Proxy {
    registry: Registry,
    listener: TcpListener,
    listener_token: Token,
    local_addr: SocketAddr,
    config: ProxyConfig,
    table: Arc<PolicyTable>,
    auth: Box<dyn Authenticator + Send>,
    pairs: Arena<ConnectionPair>,
    tokens: HashMap<Token, PairRef>,
}

impl Proxy {
    /// Bind the listener and set up the poll.
    ///
    /// Failure here is the only fatal error; everything after bind is
    /// isolated per connection.
    #[instrument("proxy::bind", skip_all)]
    pub fn bind(
        config: ProxyConfig,
        table: Arc<PolicyTable>,
        auth: Box<dyn Authenticator + Send>,
    ) -> Result<Self, Error> {
        let mut registry = Registry::new()?;

        let mut listener = TcpListener::bind(config.listen).context("failed to bind listener")?;
        let local_addr = listener.local_addr()?;

        let listener_token = registry.token();
        registry.register(&mut listener, listener_token, Interest::READABLE)?;

        event!(
            Level::INFO,
            addr = ?local_addr,
            backend = ?config.backend,
            "listening"
        );

        Ok(Self {
            registry,
            listener,
            listener_token,
            local_addr,
            config,
            table,
            auth,
            pairs: Arena::new(),
            tokens: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the readiness loop until a fatal reactor error.
    #[instrument("proxy::run", skip_all)]
    pub fn run(mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            self.poll_once(&mut events)?;
        }
    }

    /// One reactor wake: poll, dispatch the ready batch, sweep idle pairs.
    pub fn poll_once(&mut self, events: &mut Events) -> Result<(), Error> {
        self.registry.poll(events, self.config.idle_timeout)?;

        for event in events.iter() {
            let token = event.token();
            if token == self.listener_token {
                self.on_accept();
            } else {
                self.on_connection_event(token, event.is_readable(), event.is_writable());
            }
        }

        self.sweep_idle();
        Ok(())
    }

    /// Accept every pending connection. Accept and per-pair failures are
    /// logged and isolated, never fatal to the reactor.
    fn on_accept(&mut self) {
        loop {
            let (stream, remote_addr) = match check_io(self.listener.accept()) {
                Ok(Some(value)) => value,
                Ok(None) => break,
                // EMFILE and spontaneous aborts; the listener stays up
                Err(error) => {
                    event!(Level::WARN, "accept failed: {:#}", error);
                    break;
                }
            };

            if self.pairs.len() >= self.config.max_pairs {
                event!(Level::WARN, ?remote_addr, "connection limit reached, dropping accept");
                continue;
            }

            if let Err(error) = self.start_pair(stream, remote_addr) {
                event!(Level::ERROR, ?remote_addr, "failed to start pair: {}", error);
            }
        }
    }

    fn start_pair(&mut self, client: TcpStream, remote_addr: SocketAddr) -> Result<(), Error> {
        let backend = TcpStream::connect(self.config.backend)
            .context("failed to open backend connection")?;

        let client_token = self.registry.token();
        let backend_token = self.registry.token();

        let role = Role::Client {
            peer: remote_addr,
            parser: RequestParser::new(self.table.parser_limits()),
            builder: RequestBuilder::default(),
            message: BytesMut::new(),
        };
        let client = Endpoint::new(client, client_token, role);
        let backend = Endpoint::new(backend, backend_token, Role::Backend { connected: false });

        let mut pair = ConnectionPair::new(client, backend);
        let client_interest = pair.interest(Side::Client);
        let backend_interest = pair.interest(Side::Backend);
        self.registry
            .register(&mut pair.client.stream, client_token, client_interest)?;
        self.registry
            .register(&mut pair.backend.stream, backend_token, backend_interest)?;

        let index = self.pairs.insert(pair);
        self.tokens.insert(
            client_token,
            PairRef {
                index,
                side: Side::Client,
            },
        );
        self.tokens.insert(
            backend_token,
            PairRef {
                index,
                side: Side::Backend,
            },
        );

        event!(Level::DEBUG, ?remote_addr, "pair started");
        Ok(())
    }

    fn on_connection_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(PairRef { index, side }) = self.tokens.get(&token).copied() else {
            // Token from a pair already torn down earlier in this batch
            return;
        };

        match self.drive_endpoint(index, side, readable, writable) {
            Ok(()) => {
                let finished = self
                    .pairs
                    .get(index)
                    .map(|pair| pair.finished())
                    .unwrap_or(false);
                if finished {
                    self.teardown(index);
                }
            }
            Err(error) => {
                event!(Level::DEBUG, "connection error: {:#}", error);
                self.teardown(index);
            }
        }
    }

    fn drive_endpoint(
        &mut self,
        index: Index,
        side: Side,
        readable: bool,
        writable: bool,
    ) -> Result<(), Error> {
        // Queued bytes flush before any new read is processed
        if writable {
            self.on_writable(index, side)?;
        }
        if readable {
            self.on_readable(index, side)?;
        }
        Ok(())
    }

    fn on_writable(&mut self, index: Index, side: Side) -> Result<(), Error> {
        {
            let pair = self.pairs.get_mut(index).context("stale pair index")?;
            pair.touch();
            let endpoint = pair.endpoint_mut(side);

            if let Role::Backend { connected } = &mut endpoint.role {
                if !*connected {
                    if let Some(error) = endpoint.stream.take_error()? {
                        return Err(Error::from(error).context("backend connect failed"));
                    }
                    match endpoint.stream.peer_addr() {
                        Ok(addr) => {
                            event!(Level::DEBUG, ?addr, "backend connected");
                            *connected = true;
                        }
                        // Still connecting; wait for the next wake
                        Err(error) if error.kind() == io::ErrorKind::NotConnected => {
                            return Ok(())
                        }
                        Err(error) => return Err(error.into()),
                    }
                }
            }

            endpoint.flush().context("write failed")?;
        }

        self.rearm(index)
    }

    fn on_readable(&mut self, index: Index, side: Side) -> Result<(), Error> {
        let mut chunks = Vec::new();
        let mut eof = false;

        {
            let pair = self.pairs.get_mut(index).context("stale pair index")?;
            pair.touch();
            if pair.endpoint(side).closed {
                return Ok(());
            }
            // Reads pause while the peer's write queue is backed up;
            // draining it rearms this side and re-delivers readiness
            if pair.endpoint(side.peer()).has_pending_writes() {
                return Ok(());
            }
            let endpoint = pair.endpoint_mut(side);

            let mut buffer = [0u8; READ_BUF_SIZE];
            loop {
                match endpoint.stream.read(&mut buffer) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(count) => {
                        // Drain-then-close: a cancelled endpoint keeps
                        // reading so the close completes, but nothing it
                        // sends reaches the policy layer or its peer
                        if endpoint.cancelled {
                            continue;
                        }
                        chunks.push(Bytes::copy_from_slice(&buffer[..count]));
                    }
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => return Err(Error::from(error).context("read failed")),
                }
            }
        }

        for data in chunks {
            match side {
                Side::Client => self.on_client_data(index, data)?,
                Side::Backend => self.on_backend_data(index, data)?,
            }
        }

        if eof {
            self.on_eof(index, side)?;
        }

        Ok(())
    }

    /// Feed client bytes through the parser, buffering the raw message,
    /// and act on every completed message in arrival order.
    fn on_client_data(&mut self, index: Index, mut data: Bytes) -> Result<(), Error> {
        loop {
            let step = {
                let pair = self.pairs.get_mut(index).context("stale pair index")?;
                if pair.client.cancelled {
                    return Ok(());
                }
                let Role::Client {
                    parser,
                    builder,
                    message,
                    ..
                } = &mut pair.client.role
                else {
                    bail!("client event on a backend endpoint");
                };

                let snapshot = data.clone();
                let before = data.len();
                let result = parser.consume(&mut data);
                let consumed = before - data.len();
                message.extend_from_slice(&snapshot[..consumed]);

                match result {
                    Ok(Some(parser_event)) => {
                        builder.apply(&parser_event);
                        if matches!(parser_event, ParserEvent::MessageComplete) {
                            Step::Complete
                        } else {
                            Step::Parsed
                        }
                    }
                    Ok(None) => Step::Suspend,
                    Err(error) => Step::Malformed(error),
                }
            };

            match step {
                Step::Parsed => {}
                Step::Suspend => return Ok(()),
                Step::Complete => {
                    if let Flow::Stop = self.handle_complete(index)? {
                        return Ok(());
                    }
                }
                Step::Malformed(error) => {
                    event!(Level::DEBUG, %error, "malformed request, blocking");
                    self.reject_client(index)?;
                    return Ok(());
                }
            }
        }
    }

    /// Validate a completed message and either forward the buffered bytes
    /// or substitute the block response.
    fn handle_complete(&mut self, index: Index) -> Result<Flow, Error> {
        let pair = self.pairs.get_mut(index).context("stale pair index")?;
        let (summary, raw, peer) = pair
            .client
            .take_message()
            .context("completed message with no request data")?;

        let authenticated = self.auth.is_authenticated(peer);
        let decision = evaluate(&self.table, &summary, authenticated);

        match decision {
            Decision::Allow => {
                event!(
                    Level::DEBUG,
                    method = %summary.method,
                    path = %summary.path,
                    bytes = raw.len(),
                    "request allowed, forwarding"
                );
                pair.backend.queue_write(raw);
                pair.backend.flush().context("backend write failed")?;
                self.rearm(index)?;
                Ok(Flow::Continue)
            }
            Decision::Block(reason) => {
                event!(
                    Level::INFO,
                    method = %summary.method,
                    path = %summary.path,
                    %reason,
                    "request blocked"
                );
                self.reject_client(index)?;
                Ok(Flow::Stop)
            }
        }
    }

    /// Discard the buffered message, send the fixed block response, and
    /// schedule the pair for teardown once it flushes.
    fn reject_client(&mut self, index: Index) -> Result<(), Error> {
        {
            let pair = self.pairs.get_mut(index).context("stale pair index")?;
            if let Role::Client { message, .. } = &mut pair.client.role {
                message.clear();
            }
            pair.client.cancelled = true;
            pair.backend.cancelled = true;
            pair.closing = true;
            pair.client.queue_write(Bytes::from_static(BLOCK_RESPONSE));
            pair.client.flush().context("write failed")?;
        }

        self.rearm(index)
    }

    /// Backend bytes are relayed to the client verbatim.
    fn on_backend_data(&mut self, index: Index, data: Bytes) -> Result<(), Error> {
        {
            let pair = self.pairs.get_mut(index).context("stale pair index")?;
            event!(Level::TRACE, bytes = data.len(), "relaying response data");
            pair.client.queue_write(data);
            pair.client.flush().context("write failed")?;
        }

        self.rearm(index)
    }

    fn on_eof(&mut self, index: Index, side: Side) -> Result<(), Error> {
        {
            let pair = self.pairs.get_mut(index).context("stale pair index")?;
            event!(Level::DEBUG, ?side, "endpoint closed by peer");
            pair.endpoint_mut(side).closed = true;
            pair.closing = true;
            // Give the peer a chance to flush what is still queued
            pair.endpoint_mut(side.peer()).flush().context("write failed")?;
        }

        self.rearm(index)
    }

    /// Re-register both endpoints of a pair for the readiness they
    /// currently need. One side's queue state gates the other side's
    /// reads, so interests always refresh together.
    fn rearm(&mut self, index: Index) -> Result<(), Error> {
        let Some(pair) = self.pairs.get_mut(index) else {
            return Ok(());
        };
        for side in [Side::Client, Side::Backend] {
            let interest = pair.interest(side);
            let endpoint = pair.endpoint_mut(side);
            let token = endpoint.token;
            self.registry
                .reregister(&mut endpoint.stream, token, interest)?;
        }
        Ok(())
    }

    /// Release both endpoints of a pair. Streams close on drop.
    fn teardown(&mut self, index: Index) {
        let Some(mut pair) = self.pairs.remove(index) else {
            return;
        };

        self.tokens.remove(&pair.client.token);
        self.tokens.remove(&pair.backend.token);
        let _ = self.registry.deregister(&mut pair.client.stream);
        let _ = self.registry.deregister(&mut pair.backend.stream);

        event!(Level::DEBUG, "pair torn down");
    }

    fn sweep_idle(&mut self) {
        let Some(limit) = self.config.idle_timeout else {
            return;
        };

        let now = Instant::now();
        let stale: Vec<Index> = self
            .pairs
            .iter()
            .filter(|(_, pair)| now.duration_since(pair.last_activity) > limit)
            .map(|(index, _)| index)
            .collect();

        for index in stale {
            event!(Level::DEBUG, "reaping idle pair");
            self.teardown(index);
        }
    }
}

fn check_io<T>(value: Result<T, io::Error>) -> Result<Option<T>, Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            // WouldBlock just means we've run out of things to handle
            if error.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use palisade_policy::{load_str, AllowAll};

    use super::*;

    fn bind_test_proxy(
        backend: SocketAddr,
        idle_timeout: Option<Duration>,
    ) -> Result<Proxy, Error> {
        let table = Arc::new(load_str(r#"{ "global_config": {} }"#)?);
        let mut config = ProxyConfig::new("127.0.0.1:0".parse()?, backend);
        config.idle_timeout = idle_timeout;
        Proxy::bind(config, table, Box::new(AllowAll))
    }

    #[test]
    fn poll_once_returns_at_the_wait_bound() -> Result<(), Error> {
        let backend = std::net::TcpListener::bind("127.0.0.1:0")?;
        let mut proxy = bind_test_proxy(backend.local_addr()?, Some(Duration::from_millis(10)))?;

        let mut events = Events::with_capacity(MAX_EVENTS);
        proxy.poll_once(&mut events)?;
        assert!(events.is_empty());

        Ok(())
    }

    #[test]
    fn poll_once_accepts_pending_connections() -> Result<(), Error> {
        let backend = std::net::TcpListener::bind("127.0.0.1:0")?;
        let mut proxy = bind_test_proxy(backend.local_addr()?, Some(Duration::from_millis(50)))?;
        let client = std::net::TcpStream::connect(proxy.local_addr())?;

        let mut events = Events::with_capacity(MAX_EVENTS);
        let deadline = Instant::now() + Duration::from_secs(2);
        while proxy.pairs.is_empty() && Instant::now() < deadline {
            proxy.poll_once(&mut events)?;
        }

        assert_eq!(proxy.pairs.len(), 1);
        drop(client);
        Ok(())
    }
}
