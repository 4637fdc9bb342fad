//! The reactor.
//!
//! A single thread owns the `mio` poll, the listening socket and every
//! connection. Other threads (workers, event publishers, the shutdown
//! path) talk to it only through [`ServerHandle`], which queues a message
//! and wakes the poll.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::http::connection::{Connection, Context, Interest};
use crate::http::response::{Response, StreamWaker};
use crate::server::engine::Engine;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) enum ReactorMsg {
    Completed { token: Token, response: Response },
    Resume(Token),
    Shutdown,
}

/// Cross-thread handle to a running reactor.
#[derive(Clone)]
pub struct ServerHandle {
    tx: UnboundedSender<ReactorMsg>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    pub(crate) fn send(&self, msg: ReactorMsg) -> bool {
        if self.tx.send(msg).is_err() {
            debug!("reactor gone, message dropped");
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
        true
    }

    /// Asks the reactor to stop; `Server::run` returns once it has.
    pub fn shutdown(&self) {
        self.send(ReactorMsg::Shutdown);
    }

    pub(crate) fn stream_waker(&self, token: Token) -> StreamWaker {
        let handle = self.clone();
        StreamWaker::new(move || {
            handle.send(ReactorMsg::Resume(token));
        })
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerHandle")
    }
}

struct Slot {
    conn: Connection<TcpStream>,
    /// Interest currently registered with the poll
    armed: Interest,
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    engine: Arc<Engine>,
    connections: HashMap<Token, Slot>,
    next_token: usize,
    rx: UnboundedReceiver<ReactorMsg>,
    handle: ServerHandle,
}

impl Server {
    /// Binds `server.listen_addr` from the engine's configuration.
    pub fn bind(engine: Engine) -> anyhow::Result<Self> {
        let listen_addr = engine.config().server.listen_addr.clone();
        let addr = listen_addr
            .to_socket_addrs()
            .with_context(|| format!("invalid listen address {}", listen_addr))?
            .next()
            .with_context(|| format!("listen address {} did not resolve", listen_addr))?;

        let poll = Poll::new().context("failed to create poll")?;
        let mut listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
        poll.registry()
            .register(&mut listener, LISTENER, mio::Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            poll,
            listener,
            engine: Arc::new(engine),
            connections: HashMap::new(),
            next_token: FIRST_CONN,
            rx,
            handle: ServerHandle { tx, waker },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runs the event loop until [`ServerHandle::shutdown`] is called.
    pub fn run(mut self) -> anyhow::Result<()> {
        info!("Listening on {}", self.local_addr()?);

        let idle_timeout = self.engine.config().server.idle_timeout();
        let poll_timeout = idle_timeout.map(|t| t.min(SWEEP_INTERVAL));
        let mut events = Events::with_capacity(1024);

        loop {
            if let Err(e) = self.poll.poll(&mut events, poll_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed, stopping reactor");
                return Err(e).context("poll failed");
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {
                        if self.drain_messages() {
                            self.shutdown();
                            return Ok(());
                        }
                    }
                    token => {
                        let readable = event.is_readable() || event.is_read_closed();
                        let writable = event.is_writable();
                        self.with_connection(token, |conn, ctx| {
                            if readable {
                                conn.on_readable(ctx)?;
                            }
                            if writable {
                                conn.on_writable(ctx)?;
                            }
                            Ok(())
                        });
                    }
                }
            }

            if let Some(timeout) = idle_timeout {
                self.sweep_idle(timeout);
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "set_nodelay failed");
                    }
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, mio::Interest::READABLE)
                    {
                        warn!(%peer, error = %e, "failed to register connection");
                        continue;
                    }

                    info!(%peer, token = token.0, "Accepted connection");
                    self.connections.insert(
                        token,
                        Slot {
                            conn: Connection::new(stream, Some(peer)),
                            armed: Interest::Read,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Handles queued cross-thread messages. Returns true on shutdown.
    fn drain_messages(&mut self) -> bool {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                ReactorMsg::Completed { token, response } => {
                    if !self.connections.contains_key(&token) {
                        debug!(token = token.0, "worker response for closed connection dropped");
                        continue;
                    }
                    self.with_connection(token, move |conn, ctx| conn.resume(ctx, response));
                }
                ReactorMsg::Resume(token) => {
                    self.with_connection(token, |conn, ctx| conn.wake_stream(ctx));
                }
                ReactorMsg::Shutdown => return true,
            }
        }
        false
    }

    /// Runs `f` against one connection, then re-arms or closes it
    /// according to what it wants next.
    fn with_connection<F>(&mut self, token: Token, f: F)
    where
        F: FnOnce(&mut Connection<TcpStream>, &Context<'_>) -> io::Result<()>,
    {
        let Some(slot) = self.connections.get_mut(&token) else {
            return;
        };
        let conn = &mut slot.conn;
        let ctx = Context {
            engine: &self.engine,
            token,
            reactor: Some(&self.handle),
        };

        let interest = match f(conn, &ctx) {
            Ok(()) => conn.interest(),
            Err(e) => {
                debug!(token = token.0, peer = ?conn.peer(), error = %e, "connection error");
                Interest::Close
            }
        };

        let registry = self.poll.registry();
        let rearmed = match interest {
            // Re-arming a socket already at EOF would report it again at once.
            Interest::Read if slot.armed == Interest::Read => Ok(()),
            Interest::Read => registry.reregister(conn.stream_mut(), token, mio::Interest::READABLE),
            Interest::ReadWrite => registry.reregister(
                conn.stream_mut(),
                token,
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            ),
            Interest::Close => {
                self.close(token);
                return;
            }
        };

        match rearmed {
            Ok(()) => slot.armed = interest,
            Err(e) => {
                warn!(token = token.0, error = %e, "failed to re-arm connection");
                self.close(token);
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut slot) = self.connections.remove(&token) {
            slot.conn.abort();
            if let Err(e) = self.poll.registry().deregister(slot.conn.stream_mut()) {
                debug!(token = token.0, error = %e, "deregister failed");
            }
            debug!(token = token.0, peer = ?slot.conn.peer(), "connection closed");
        }
    }

    fn sweep_idle(&mut self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.conn.is_idle_expired(now, timeout))
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            info!(token = token.0, "closing idle connection");
            self.close(token);
        }
    }

    fn shutdown(&mut self) {
        info!(connections = self.connections.len(), "Shutting down");
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }
}

/// Binds and runs a server on the current thread.
pub fn run(engine: Engine) -> anyhow::Result<()> {
    Server::bind(engine)?.run()
}
