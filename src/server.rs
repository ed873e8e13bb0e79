//! Reactor pool and server lifecycle.
//!
//! # Responsibilities
//! - Build the multi-threaded reactor with a floored worker count
//! - Arm the TLS context and listening socket, then spawn the acceptor
//! - Shut down in order: stop accepting, drain sessions, stop workers
//! - Allow `start` again after `shutdown`, on the same port
//!
//! `start` and `shutdown` take `&mut self` and are meant for one control
//! thread. `shutdown` blocks, so it must not be called from async code;
//! dropping a running server inside a runtime abandons the reactor instead
//! of draining it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, ServerConfig};
use crate::lifecycle::Shutdown;
use crate::net::connection::Registry;
use crate::net::handshake::TlsHandshake;
use crate::net::listener::{self, Acceptor};
use crate::net::session::{SessionContext, SessionSettings};
use crate::net::tls::{load_tls_config, TlsError};
use crate::observability::{ErrorEvent, ErrorStage, EventSink, ServerEvent, TracingSink};

/// Error type for server startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("failed to build reactor: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// State that only exists while the server is running.
struct Running {
    runtime: Runtime,
    shutdown: Shutdown,
    acceptor: JoinHandle<()>,
}

/// TLS-terminating echo server.
pub struct TlsServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    sink: Arc<dyn EventSink>,
    /// Address of the first successful bind; restarts reuse its port.
    bound: Option<SocketAddr>,
    running: Option<Running>,
}

impl TlsServer {
    /// Create a server that reports through `tracing`.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: ServerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            sink,
            bound: None,
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the server is (or was last) listening on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        if let Some(bound) = self.bound {
            return Ok(bound);
        }
        let ip: IpAddr = self
            .config
            .server
            .bind_ip
            .parse()
            .map_err(|_| ServerError::InvalidAddress(self.config.server.bind_ip.clone()))?;
        Ok(SocketAddr::new(ip, self.config.server.port))
    }

    /// Start the worker pool and begin accepting. A no-op if already running.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if let (Some(addr), Some(_)) = (self.bound, &self.running) {
            return Ok(addr);
        }
        validate_config(&self.config).map_err(ConfigError::Validation)?;

        let handshake = Arc::new(TlsHandshake::new(load_tls_config(&self.config.tls)?));
        let addr = self.listen_addr()?;
        let workers = self.config.server.effective_worker_threads();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("tls-echo-worker")
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        let listener = {
            let _guard = runtime.enter();
            listener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let shutdown = Shutdown::new();
        let ctx = SessionContext {
            registry: Arc::clone(&self.registry),
            sink: Arc::clone(&self.sink),
            settings: SessionSettings::from_config(&self.config),
            shutdown: shutdown.subscribe(),
        };
        let acceptor = Acceptor::new(
            listener,
            handshake,
            ctx,
            self.config.server.max_connections,
            self.config.server.connection_timeout(),
        );
        let acceptor = runtime.spawn(acceptor.run(shutdown.subscribe()));

        self.bound = Some(local_addr);
        self.running = Some(Running {
            runtime,
            shutdown,
            acceptor,
        });
        self.sink.server_event(ServerEvent::Started {
            workers,
            address: local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, let sessions close, stop every worker thread.
    ///
    /// Sessions still open after the grace period are dropped with the
    /// reactor and their identifiers purged from the registry.
    pub fn shutdown(&mut self) {
        let Some(Running {
            runtime,
            shutdown,
            acceptor,
        }) = self.running.take()
        else {
            return;
        };

        self.sink.server_event(ServerEvent::ShuttingDown);
        shutdown.trigger();

        let grace = self.config.timeouts.shutdown_grace();
        let registry = Arc::clone(&self.registry);
        let sink = Arc::clone(&self.sink);
        runtime.block_on(async move {
            if let Err(e) = acceptor.await {
                sink.error_event(ErrorEvent::message(
                    ErrorStage::Shutdown,
                    None,
                    format!("acceptor task failed: {}", e),
                ));
            }
            if !registry.wait_until_drained(grace).await {
                tracing::warn!(
                    remaining = registry.active_ids(),
                    "Sessions still open after shutdown grace period"
                );
            }
        });
        runtime.shutdown_timeout(grace);

        self.purge_and_report();
    }

    /// Stop without blocking: trigger, drop the reactor in the background,
    /// purge whatever is still registered.
    fn abandon(&mut self) {
        let Some(Running {
            runtime,
            shutdown,
            acceptor,
        }) = self.running.take()
        else {
            return;
        };

        self.sink.server_event(ServerEvent::ShuttingDown);
        shutdown.trigger();
        acceptor.abort();
        runtime.shutdown_background();

        self.purge_and_report();
    }

    fn purge_and_report(&self) {
        let purged = self.registry.purge();
        for id in &purged {
            self.sink.error_event(ErrorEvent::message(
                ErrorStage::Shutdown,
                Some(*id),
                "session dropped by shutdown",
            ));
        }
        self.sink.server_event(ServerEvent::Stopped {
            purged: purged.len(),
        });
    }
}

impl Drop for TlsServer {
    fn drop(&mut self) {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.abandon();
        } else {
            self.shutdown();
        }
    }
}
