//! Relay server lifecycle
//!
//! `RelayServer` (created) → [`RelayServer::listen`] → `ListeningRelay`
//! (listening) → [`ListeningRelay::serve`] (serving, shutting down, stopped).
//!
//! While serving, two tasks report into one buffered conduit: the accept loop
//! (`Listener`) and the shutdown coordinator (`Shutdown`). `serve` waits on
//! that conduit alone. A listener error starts the shutdown and is what `serve`
//! returns; otherwise it returns the shutdown result.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ServerConfig;
use speedy_core::config::normalize_bind_addr;
use speedy_core::MessageBus;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span};
use url::Url;

use crate::address::advertised_url;
use crate::config::RelayConfig;
use crate::engine::{Accept, ConnectionContext, Engine};
use crate::error::{RelayError, RelayResult, ShutdownError, ShutdownFailure};
use crate::handlers::{self, AppState};
use crate::metrics::RelayMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelayState {
    Created,
    Listening,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Listening => "listening",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventSource {
    Listener,
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct ServeEvent {
    source: EventSource,
    result: RelayResult<()>,
}

/// Cloneable control handle, valid for the relay's whole lifetime
#[derive(Clone)]
pub struct RelayHandle {
    state: watch::Receiver<RelayState>,
    shutdown: CancellationToken,
    metrics: RelayMetrics,
}

impl RelayHandle {
    /// Request the same graceful shutdown an interrupt signal triggers
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Wait until the relay has reached `state` (or gone past it)
    pub async fn wait_for(&self, state: RelayState) -> RelayState {
        let mut receiver = self.state.clone();
        let reached = receiver.wait_for(|current| *current >= state).await.map(|s| *s);
        reached.unwrap_or_else(|_| *receiver.borrow())
    }

    #[must_use]
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("state", &self.state())
            .field("shutdown_requested", &self.shutdown.is_cancelled())
            .finish()
    }
}

pub struct RelayServer {
    config: RelayConfig,
    tls: Arc<ServerConfig>,
    span: Span,
    bus: Arc<MessageBus>,
    metrics: RelayMetrics,
    state: Arc<watch::Sender<RelayState>>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Create a relay that logs under `span`
    pub fn new(config: RelayConfig, tls: Arc<ServerConfig>, span: Span) -> RelayResult<Self> {
        let metrics = RelayMetrics::new()?;
        let bus = Arc::new(MessageBus::new(config.bus_capacity));
        let (state, _) = watch::channel(RelayState::Created);

        Ok(Self {
            config,
            tls,
            span,
            bus,
            metrics,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: self.state.subscribe(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Bind the TCP listener
    pub async fn listen(self) -> RelayResult<ListeningRelay> {
        let addr = normalize_bind_addr(&self.config.bind_addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;
        let url = advertised_url(local_addr)?;

        self.state.send_replace(RelayState::Listening);
        tracing::info!(parent: &self.span, %local_addr, "Relay listening");

        Ok(ListeningRelay {
            server: self,
            listener,
            local_addr,
            url,
        })
    }

    /// Listen and serve until shutdown
    pub async fn run(self) -> RelayResult<()> {
        self.listen().await?.serve().await
    }
}

pub struct ListeningRelay {
    server: RelayServer,
    listener: TcpListener,
    local_addr: SocketAddr,
    url: Url,
}

impl ListeningRelay {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Externally reachable URL of the relay
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn handle(&self) -> RelayHandle {
        self.server.handle()
    }

    /// Serve connections until an interrupt signal, a [`RelayHandle::shutdown`]
    /// request or a listener failure, then shut down within the deadline.
    pub async fn serve(self) -> RelayResult<()> {
        let Self {
            server,
            listener,
            url,
            ..
        } = self;
        server.serve_on(listener, &url).await
    }
}

impl RelayServer {
    pub(crate) async fn serve_on<L: Accept>(self, listener: L, url: &Url) -> RelayResult<()> {
        let Self {
            config,
            tls,
            span,
            bus,
            metrics,
            state,
            shutdown: requested,
        } = self;

        let started_at = Instant::now();
        let tracker = TaskTracker::new();
        let stop_accepting = CancellationToken::new();
        let drain = CancellationToken::new();
        let terminate = CancellationToken::new();

        let router = handlers::router(AppState {
            bus: bus.clone(),
            metrics,
            span: span.clone(),
        });
        let engine = Engine {
            listener,
            connections: Arc::new(ConnectionContext {
                acceptor: TlsAcceptor::from(tls),
                router,
                read_header_timeout: config.read_header_timeout,
                idle_timeout: config.idle_timeout,
                drain: drain.clone(),
                terminate: terminate.clone(),
            }),
            stop_accepting: stop_accepting.clone(),
            tracker: tracker.clone(),
        };

        // Set before either task can move the state to ShuttingDown
        state.send_replace(RelayState::Serving);
        tracing::info!(parent: &span, %url, version = speedy_core::VERSION, "Relay serving");

        // Each source reports at most once, so no send can block
        let (events, mut conduit) = mpsc::channel::<ServeEvent>(2);

        let engine_task = tokio::spawn({
            let events = events.clone();
            async move {
                let result = engine.run().await.map_err(RelayError::Listener);
                let _ = events
                    .send(ServeEvent {
                        source: EventSource::Listener,
                        result,
                    })
                    .await;
            }
            .instrument(span.clone())
        });

        let coordinator = ShutdownCoordinator {
            requested,
            deadline: config.shutdown_timeout,
            bus,
            state: state.clone(),
            tracker,
            stop_accepting,
            drain,
            terminate,
        };
        let coordinator_task = tokio::spawn(
            async move {
                let result = coordinator.run(engine_task).await;
                let _ = events
                    .send(ServeEvent {
                        source: EventSource::Shutdown,
                        result,
                    })
                    .await;
            }
            .instrument(span.clone()),
        );

        let mut listener_error = None;
        let mut outcome = None;
        while let Some(event) = conduit.recv().await {
            match (event.source, event.result) {
                (EventSource::Listener, Ok(())) => {
                    tracing::debug!(parent: &span, "Listener stopped for shutdown");
                }
                (EventSource::Listener, Err(e)) => {
                    tracing::error!(parent: &span, error = %e, "Listener exited unexpectedly");
                    listener_error.get_or_insert(e);
                }
                (EventSource::Shutdown, result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }

        if let Err(e) = coordinator_task.await {
            tracing::error!(parent: &span, error = %e, "Shutdown coordinator failed");
        }

        let shutdown_result = outcome.unwrap_or_else(|| {
            Err(ShutdownError::from(ShutdownFailure::Engine(
                "shutdown coordinator ended without reporting".to_string(),
            ))
            .into())
        });

        state.send_replace(RelayState::Stopped);
        tracing::info!(parent: &span, uptime = ?started_at.elapsed(), "Relay stopped");

        match listener_error {
            Some(e) => {
                if let Err(shutdown_err) = shutdown_result {
                    tracing::warn!(parent: &span, error = %shutdown_err, "Shutdown after listener failure also failed");
                }
                Err(e)
            }
            None => shutdown_result,
        }
    }
}

/// Owns everything needed to stop the relay once shutdown is triggered
struct ShutdownCoordinator {
    requested: CancellationToken,
    deadline: Duration,
    bus: Arc<MessageBus>,
    state: Arc<watch::Sender<RelayState>>,
    tracker: TaskTracker,
    stop_accepting: CancellationToken,
    drain: CancellationToken,
    terminate: CancellationToken,
}

impl ShutdownCoordinator {
    async fn run(self, mut engine_task: JoinHandle<()>) -> RelayResult<()> {
        let mut engine_exit = None;
        let trigger = tokio::select! {
            () = shutdown_signal() => "signal",
            () = self.requested.cancelled() => "requested",
            joined = &mut engine_task => {
                engine_exit = Some(joined);
                "listener exited"
            }
        };

        self.state.send_replace(RelayState::ShuttingDown);
        tracing::info!(trigger, deadline = ?self.deadline, "Shutting down relay");
        let deadline = tokio::time::Instant::now() + self.deadline;

        // Wakes every subscriber blocked on an empty bus and every publisher
        // blocked on a full one
        self.bus.close();
        self.stop_accepting.cancel();
        self.drain.cancel();

        let mut failures = Vec::new();

        let joined = match engine_exit {
            Some(joined) => joined,
            None => engine_task.await,
        };
        if let Err(e) = joined {
            failures.push(ShutdownFailure::Engine(format!("accept loop: {e}")));
        }

        self.tracker.close();
        if tokio::time::timeout_at(deadline, self.tracker.wait()).await.is_err() {
            let remaining = self.tracker.len();
            tracing::warn!(remaining, "Shutdown deadline exceeded, closing remaining connections");
            failures.push(ShutdownFailure::DeadlineExceeded { remaining });
            self.terminate.cancel();
            self.tracker.wait().await;
        }

        match ShutdownError::from_failures(failures) {
            Some(e) => Err(e.into()),
            None => {
                tracing::info!("All connections closed");
                Ok(())
            }
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C signal"),
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("Received SIGTERM signal");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use speedy_core::tls::{load_server_config, PemProvider};
    use tokio::net::TcpStream;

    /// Fails every accept after `transient` connection resets
    struct FailingListener {
        transient: usize,
        calls: Arc<AtomicUsize>,
    }

    impl FailingListener {
        fn new(transient: usize) -> Self {
            Self {
                transient,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Accept for FailingListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            tokio::task::yield_now().await;
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.transient {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "listening socket revoked",
            ))
        }
    }

    fn relay() -> RelayServer {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let tls = load_server_config(&PemProvider::new(
            certified.cert.pem(),
            certified.key_pair.serialize_pem(),
        ))
        .unwrap();
        RelayServer::new(RelayConfig::default(), tls, Span::none()).unwrap()
    }

    #[tokio::test]
    async fn test_listener_failure_stops_relay_and_is_returned() {
        let server = relay();
        let handle = server.handle();
        let bus = server.bus.clone();
        let url = Url::parse("https://127.0.0.1:8765/").unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_on(FailingListener::new(0), &url),
        )
        .await
        .expect("serve should return once the listener fails");

        match result {
            Err(RelayError::Listener(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected a listener error, got {other:?}"),
        }
        assert!(bus.is_closed());
        assert_eq!(handle.state(), RelayState::Stopped);
    }

    #[tokio::test]
    async fn test_transient_accept_errors_are_skipped() {
        let server = relay();
        let url = Url::parse("https://127.0.0.1:8765/").unwrap();
        let listener = FailingListener::new(3);
        let calls = listener.calls.clone();

        let result = tokio::time::timeout(Duration::from_secs(5), server.serve_on(listener, &url))
            .await
            .unwrap();

        assert!(matches!(result, Err(RelayError::Listener(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_state_order() {
        assert!(RelayState::Created < RelayState::Listening);
        assert!(RelayState::Serving < RelayState::ShuttingDown);
        assert!(RelayState::ShuttingDown < RelayState::Stopped);
        assert_eq!(RelayState::ShuttingDown.to_string(), "shutting_down");
    }
}
