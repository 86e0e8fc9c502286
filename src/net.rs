/*!
 * Listening Socket and Accept Loop
 *
 * The listener thread owns the bound socket and its own `mio::Poll`. On
 * every readiness event it accepts until the kernel queue is empty and
 * deals the new connections out to the reactors in round-robin order.
 *
 * An accept that fails for lack of resources (EMFILE, ENFILE, ENOBUFS)
 * leaves the queue non-empty without a fresh edge, so it is retried on the
 * next poll timeout even when no event arrives.
 */

use crate::reactor::ReactorHandle;
use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTENER: Token = Token(0);

/// Bind a non-blocking TCP listener
///
/// Uses socket2 so SO_REUSEADDR / SO_REUSEPORT and the backlog can be set
/// before listen(2).
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create TCP socket")?;

    #[cfg(unix)]
    {
        socket.set_reuse_address(true).context("failed to set SO_REUSEADDR")?;
        socket.set_reuse_port(true).context("failed to set SO_REUSEPORT")?;
    }

    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind to {}", addr))?;
    socket
        .listen(backlog)
        .with_context(|| format!("failed to listen on {}", addr))?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Cyclic index over a fixed number of slots
#[derive(Debug, Clone)]
pub struct RoundRobin {
    next: usize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> Self {
        Self { next: 0, len }
    }

    pub fn next(&mut self) -> usize {
        let current = self.next;
        self.next += 1;
        if self.next == self.len {
            self.next = 0;
        }
        current
    }
}

pub struct Listener {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    reactors: Vec<ReactorHandle>,
    cursor: RoundRobin,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
    /// Last accept batch ended on an error rather than an empty queue
    retry_accept: bool,
}

impl Listener {
    pub fn new(
        mut listener: TcpListener,
        reactors: Vec<ReactorHandle>,
        running: Arc<AtomicBool>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        ensure!(!reactors.is_empty(), "listener needs at least one reactor");

        let poll = Poll::new().context("failed to create listener poll instance")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("failed to register listening socket")?;

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(16),
            cursor: RoundRobin::new(reactors.len()),
            reactors,
            running,
            poll_timeout,
            retry_accept: false,
        })
    }

    /// Accept until the running flag is cleared; the socket is closed on return.
    ///
    /// A poll failure is fatal: the running flag is cleared so the reactors
    /// wind down too, and the error is returned.
    pub fn run(mut self) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("accepting connections on {}", addr);
        }

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll_once() {
                return Err(self.fail(e));
            }
        }

        info!("listener stopped");
        Ok(())
    }

    /// Wait for one batch of readiness and accept whatever is queued
    fn poll_once(&mut self) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e).context("listener poll failed");
        }

        let ready = self.events.iter().any(|ev| ev.token() == LISTENER);
        if ready || self.retry_accept {
            self.accept_pending();
        }
        Ok(())
    }

    /// Clear the running flag and pass the error on; the spawning thread logs it
    fn fail(&self, err: anyhow::Error) -> anyhow::Error {
        self.running.store(false, Ordering::Release);
        err
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let reactor = &self.reactors[self.cursor.next()];
                    debug!("accepted {} -> reactor {}", peer, reactor.id());
                    if !reactor.assign(stream) {
                        warn!("reactor {} is gone, dropping connection from {}", reactor.id(), peer);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.retry_accept = false;
                    break;
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                // Out of descriptors or buffers: retry after the next poll.
                Err(e) => {
                    debug!("accept error, retrying: {}", e);
                    self.retry_accept = true;
                    break;
                }
            }
        }
    }
}
