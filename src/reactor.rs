/*!
 * Reactor Event Loop
 *
 * One reactor per worker thread. Each owns its own `mio::Poll`, a bounded
 * event batch and a slab of connections keyed by token. Connections are
 * handed over by the listener through a channel plus a waker and stay with
 * the same reactor until they close, so no connection state is ever shared
 * between threads.
 */

use crate::config::ServerConfig;
use crate::conn::{Connection, Phase};
use crate::router::RouteTable;
use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the cross-thread waker; slab keys never reach it
const WAKER: Token = Token(usize::MAX);

/// Sending side of a reactor, held by the listener
#[derive(Clone)]
pub struct ReactorHandle {
    id: usize,
    tx: Sender<TcpStream>,
    waker: Arc<Waker>,
    assigned: Arc<AtomicUsize>,
}

impl ReactorHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a freshly accepted connection to this reactor
    ///
    /// Returns false if the reactor has already gone away; the stream is
    /// dropped (and closed) in that case.
    pub fn assign(&self, stream: TcpStream) -> bool {
        if self.tx.send(stream).is_err() {
            return false;
        }
        self.assigned.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.waker.wake() {
            warn!("reactor {}: wake failed: {}", self.id, e);
        }
        true
    }

    /// Connections assigned to this reactor so far
    pub fn assigned(&self) -> usize {
        self.assigned.load(Ordering::Relaxed)
    }

    pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
        self.assigned.clone()
    }
}

pub struct Reactor {
    id: usize,
    poll: Poll,
    events: Events,
    conns: Slab<Connection<TcpStream>>,
    incoming: Receiver<TcpStream>,
    routes: Arc<RouteTable>,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
    /// Read buffer shared by every connection on this reactor
    scratch: Vec<u8>,
    nodelay: bool,
}

impl Reactor {
    /// Create a reactor and the handle used to feed it connections
    pub fn new(
        id: usize,
        config: &ServerConfig,
        routes: Arc<RouteTable>,
        running: Arc<AtomicBool>,
    ) -> Result<(Reactor, ReactorHandle)> {
        let poll = Poll::new().context("failed to create poll instance")?;
        let waker = Waker::new(poll.registry(), WAKER).context("failed to create waker")?;
        let (tx, rx) = unbounded();

        let reactor = Reactor {
            id,
            poll,
            events: Events::with_capacity(config.max_events),
            conns: Slab::new(),
            incoming: rx,
            routes,
            running,
            poll_timeout: config.poll_timeout,
            scratch: vec![0u8; config.read_chunk],
            nodelay: config.nodelay,
        };
        let handle = ReactorHandle {
            id,
            tx,
            waker: Arc::new(waker),
            assigned: Arc::new(AtomicUsize::new(0)),
        };
        Ok((reactor, handle))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run until the shared running flag is cleared
    ///
    /// The wait is bounded by the poll timeout, so shutdown is noticed within
    /// one timeout. Every connection still open at exit is deregistered and
    /// closed.
    pub fn run(mut self) -> Result<()> {
        info!("reactor {} started", self.id);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.shutdown();
                return Err(e).with_context(|| format!("reactor {} poll failed", self.id));
            }

            let registry = self.poll.registry();
            for event in self.events.iter() {
                match event.token() {
                    WAKER => {
                        for stream in self.incoming.try_iter() {
                            adopt(self.id, registry, &mut self.conns, stream, self.nodelay);
                        }
                    }
                    _ => drive(registry, &mut self.conns, &self.routes, event, &mut self.scratch),
                }
            }
        }

        self.shutdown();
        info!("reactor {} stopped", self.id);
        Ok(())
    }

    /// Close every connection this reactor still owns, including ones
    /// handed over but never adopted.
    fn shutdown(&mut self) {
        let registry = self.poll.registry();
        let open = self.conns.len();
        for mut conn in self.conns.drain() {
            let _ = registry.deregister(conn.stream_mut());
        }
        let pending = self.incoming.try_iter().count();
        debug!("reactor {}: closed {} connections ({} never adopted)", self.id, open, pending);
    }
}

/// Register a handed-over stream for read readiness and give it a slot
fn adopt(
    id: usize,
    registry: &Registry,
    conns: &mut Slab<Connection<TcpStream>>,
    mut stream: TcpStream,
    nodelay: bool,
) {
    if nodelay {
        stream.set_nodelay(true).ok();
    }
    let entry = conns.vacant_entry();
    let token = Token(entry.key());
    match registry.register(&mut stream, token, Interest::READABLE) {
        Ok(()) => {
            trace!("reactor {}: adopted connection {}", id, token.0);
            entry.insert(Connection::new(stream));
        }
        Err(e) => warn!("reactor {}: failed to register connection: {}", id, e),
    }
}

/// Apply one readiness event to its connection and re-arm interest for the
/// resulting phase.
fn drive(
    registry: &Registry,
    conns: &mut Slab<Connection<TcpStream>>,
    routes: &RouteTable,
    event: &Event,
    scratch: &mut [u8],
) {
    let token = event.token();
    let close = match conns.get_mut(token.0) {
        // already torn down earlier in this batch
        None => return,
        Some(conn) => {
            let hangup = event.is_read_closed() && event.is_write_closed();
            let phase = if event.is_error() || hangup {
                Phase::Closed
            } else if event.is_readable() || event.is_writable() {
                conn.on_ready(event.is_readable(), event.is_writable(), routes, scratch)
            } else {
                Phase::Closed
            };

            match phase {
                Phase::Closed => true,
                Phase::AwaitingRead => registry
                    .reregister(conn.stream_mut(), token, Interest::READABLE)
                    .is_err(),
                Phase::AwaitingWrite => registry
                    .reregister(conn.stream_mut(), token, Interest::WRITABLE)
                    .is_err(),
            }
        }
    };

    if close {
        teardown(registry, conns, token);
    }
}

fn teardown(registry: &Registry, conns: &mut Slab<Connection<TcpStream>>, token: Token) {
    if let Some(mut conn) = conns.try_remove(token.0) {
        let _ = registry.deregister(conn.stream_mut());
        trace!("connection {} closed after {} responses", token.0, conn.served());
    }
}
