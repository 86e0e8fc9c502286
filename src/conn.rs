/*!
 * Per-Connection State Machine
 *
 * A connection alternates between reading a request and writing the
 * response to it: AwaitingRead -> AwaitingWrite -> AwaitingRead ... until
 * it reaches Closed, which is terminal. The owning reactor re-arms the
 * socket interest to match the phase returned from each readiness call.
 *
 * A peer that half-closes after sending a request still gets its answer:
 * the close is remembered and takes effect once nothing is left to write.
 *
 * The type is generic over the stream so the state machine can be driven
 * without a socket.
 */

use crate::codec::{encode_response, parse_request};
use crate::message::Method;
use crate::router::RouteTable;
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRead,
    AwaitingWrite,
    Closed,
}

pub struct Connection<S> {
    stream: S,
    phase: Phase,
    /// Received bytes not yet consumed by the parser
    inbound: BytesMut,
    /// Serialized response being written
    buf: BytesMut,
    /// Bytes of `buf` already transmitted
    cursor: usize,
    /// Bytes of `buf` still to transmit
    remaining: usize,
    /// Peer sent EOF; close once the staged response has drained
    peer_closed: bool,
    served: u64,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            phase: Phase::AwaitingRead,
            inbound: BytesMut::new(),
            buf: BytesMut::new(),
            cursor: 0,
            remaining: 0,
            peer_closed: false,
            served: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Number of responses fully written on this connection
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Drive the state machine for one readiness notification
    ///
    /// Readiness that does not match the current phase is ignored. `scratch`
    /// is the reactor's read buffer, shared by all of its connections.
    pub fn on_ready(
        &mut self,
        readable: bool,
        writable: bool,
        routes: &RouteTable,
        scratch: &mut [u8],
    ) -> Phase {
        match self.phase {
            Phase::AwaitingRead if readable => self.on_readable(routes, scratch),
            Phase::AwaitingWrite if writable => self.on_writable(routes),
            phase => phase,
        }
    }

    /// Drain the socket into the inbound buffer and serve a request if a
    /// complete one has arrived.
    pub fn on_readable(&mut self, routes: &RouteTable, scratch: &mut [u8]) -> Phase {
        if self.phase != Phase::AwaitingRead {
            return self.phase;
        }

        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return self.close(),
            }
        }

        self.serve_pending(routes);
        self.settle()
    }

    /// Push the staged response out from the cursor; on completion go back to
    /// reading, serving any request that is already buffered.
    pub fn on_writable(&mut self, routes: &RouteTable) -> Phase {
        if self.phase != Phase::AwaitingWrite {
            return self.phase;
        }

        while self.remaining > 0 {
            let end = self.cursor + self.remaining;
            match self.stream.write(&self.buf[self.cursor..end]) {
                Ok(0) => return self.close(),
                Ok(n) => {
                    self.cursor += n;
                    self.remaining -= n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return self.phase,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return self.close(),
            }
        }

        self.buf.clear();
        self.cursor = 0;
        self.served += 1;
        self.phase = Phase::AwaitingRead;

        self.serve_pending(routes);
        self.settle()
    }

    /// Nothing staged and the peer has gone quiet for good: close.
    fn settle(&mut self) -> Phase {
        if self.phase == Phase::AwaitingRead && self.peer_closed {
            return self.close();
        }
        self.phase
    }

    /// Parse one request out of `inbound`, route it and stage the response.
    /// Stays in AwaitingRead when the request is still incomplete.
    fn serve_pending(&mut self, routes: &RouteTable) {
        let (response, send_body) = match parse_request(&self.inbound) {
            Ok(None) => return,
            Ok(Some((used, request))) => {
                self.inbound.advance(used);
                (routes.dispatch(&request), request.method() != Method::Head)
            }
            Err(e) => {
                // No way to find the next message boundary in a broken stream.
                self.inbound.clear();
                (e.into_response(), true)
            }
        };

        self.buf.clear();
        encode_response(&response, send_body, &mut self.buf);
        self.cursor = 0;
        self.remaining = self.buf.len();
        self.phase = Phase::AwaitingWrite;
    }

    fn close(&mut self) -> Phase {
        self.phase = Phase::Closed;
        self.inbound.clear();
        self.buf.clear();
        self.remaining = 0;
        self.phase
    }
}
