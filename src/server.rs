/*!
 * Server Lifecycle
 *
 * `HttpServer` owns the listening socket, the route table and, while
 * running, one listener thread plus a fixed pool of reactor threads. The
 * socket is bound at construction so address problems surface immediately;
 * `run` starts the threads and `stop` joins them and releases every handle.
 */

use crate::config::ServerConfig;
use crate::message::{Method, Request, Response};
use crate::net::{bind_listener, Listener};
use crate::reactor::{Reactor, ReactorHandle};
use crate::router::RouteTable;
use anyhow::{anyhow, bail, Context, Result};
use log::{error, info};
use mio::net::TcpListener;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct HttpServer {
    host: String,
    port: u16,
    config: ServerConfig,
    local_addr: SocketAddr,
    /// Present until `run` hands it to the listener thread
    listener: Option<TcpListener>,
    routes: Arc<RouteTable>,
    running: Arc<AtomicBool>,
    listener_thread: Option<JoinHandle<()>>,
    reactor_threads: Vec<JoinHandle<()>>,
    assigned: Vec<Arc<AtomicUsize>>,
}

impl HttpServer {
    /// Bind `host:port` with the default configuration
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_config(host, port, ServerConfig::default())
    }

    pub fn with_config(host: &str, port: u16, config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}:{}", host, port))?
            .next()
            .ok_or_else(|| anyhow!("{}:{} resolved to no addresses", host, port))?;
        let listener = bind_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        info!("bound {}", local_addr);

        Ok(Self {
            host: host.to_string(),
            port,
            config,
            local_addr,
            listener: Some(listener),
            routes: Arc::new(RouteTable::new()),
            running: Arc::new(AtomicBool::new(false)),
            listener_thread: None,
            reactor_threads: Vec::new(),
            assigned: Vec::new(),
        })
    }

    /// Bind a handler to (`path`, `method`)
    ///
    /// Only allowed while no reactor holds the route table, i.e. before `run`
    /// or after `stop`.
    pub fn register<F>(&mut self, path: impl Into<String>, method: Method, handler: F) -> Result<()>
    where
        F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
    {
        let routes = Arc::get_mut(&mut self.routes)
            .ok_or_else(|| anyhow!("cannot register routes while the server is running"))?;
        routes.register(path, method, handler);
        Ok(())
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Start the listener thread and the reactor pool
    pub fn run(&mut self) -> Result<()> {
        if self.running() {
            bail!("server is already running");
        }
        if self.listener.is_none() {
            bail!("server has been stopped; its socket is closed");
        }

        let mut reactors = Vec::with_capacity(self.config.reactors);
        let mut handles: Vec<ReactorHandle> = Vec::with_capacity(self.config.reactors);
        for id in 0..self.config.reactors {
            let (reactor, handle) =
                Reactor::new(id, &self.config, self.routes.clone(), self.running.clone())?;
            reactors.push(reactor);
            handles.push(handle);
        }
        self.assigned = handles.iter().map(|h| h.counter()).collect();

        let listener = self.listener.take().context("listening socket missing")?;
        let acceptor = Listener::new(listener, handles, self.running.clone(), self.config.poll_timeout)?;

        self.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("spindle-listener".into())
            .spawn(move || {
                if let Err(e) = acceptor.run() {
                    error!("listener failed, server stopping: {:#}", e);
                }
            });
        match spawned {
            Ok(h) => self.listener_thread = Some(h),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e).context("failed to spawn listener thread");
            }
        }

        for reactor in reactors {
            let id = reactor.id();
            let spawned = thread::Builder::new()
                .name(format!("spindle-reactor-{}", id))
                .spawn(move || {
                    if let Err(e) = reactor.run() {
                        error!("reactor {} failed: {:#}", id, e);
                    }
                });
            match spawned {
                Ok(h) => self.reactor_threads.push(h),
                Err(e) => {
                    self.stop()?;
                    return Err(e).with_context(|| format!("failed to spawn reactor {}", id));
                }
            }
        }

        info!(
            "serving {} on {} reactors",
            self.local_addr,
            self.reactor_threads.len()
        );
        Ok(())
    }

    /// Clear the running flag, join the listener, then every reactor
    ///
    /// Threads notice the flag within one poll timeout. Connections still
    /// open (including half-written responses) are closed by their reactor on
    /// the way out; the listening socket closes with the listener thread.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);

        let mut panicked = 0;
        if let Some(h) = self.listener_thread.take() {
            if h.join().is_err() {
                panicked += 1;
            }
        }
        for h in self.reactor_threads.drain(..) {
            if h.join().is_err() {
                panicked += 1;
            }
        }
        // never ran: close the socket here
        self.listener = None;

        if panicked > 0 {
            bail!("{} server thread(s) panicked", panicked);
        }
        info!("server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Host as configured
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port as configured (0 if an ephemeral port was requested)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connections assigned to each reactor during the current/last run
    pub fn connection_counts(&self) -> Vec<usize> {
        self.assigned.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if self.running() || self.listener_thread.is_some() {
            if let Err(e) = self.stop() {
                error!("error while stopping server: {:#}", e);
            }
        }
    }
}
