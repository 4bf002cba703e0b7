//! TLS accept loop and per-connection HTTP serving
//!
//! Connections are served with hyper-util's auto builder so that both HTTP/2
//! and HTTP/1.1 reach the router, where non-HTTP/2 requests are rejected.
//! Every connection task is tracked; shutdown happens in two steps: `drain`
//! asks each connection to finish its in-flight streams, `terminate` drops
//! whatever is still open.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Time allowed for a keep-alive ping to be acknowledged
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Source of inbound TCP connections for the accept loop
pub(crate) trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        Self::accept(self)
    }
}

pub(crate) struct Engine<L = TcpListener> {
    pub(crate) listener: L,
    pub(crate) connections: Arc<ConnectionContext>,
    pub(crate) stop_accepting: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

pub(crate) struct ConnectionContext {
    pub(crate) acceptor: TlsAcceptor,
    pub(crate) router: Router,
    pub(crate) read_header_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) drain: CancellationToken,
    pub(crate) terminate: CancellationToken,
}

impl<L: Accept> Engine<L> {
    /// Accept connections until `stop_accepting` fires
    ///
    /// Returns an error only when the listener itself fails.
    pub(crate) async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                () = self.stop_accepting.cancelled() => {
                    tracing::debug!("Accept loop stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "Transient accept error");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Listener failed");
                        return Err(e);
                    }
                },
            };

            let span = tracing::debug_span!("connection", %peer);
            self.tracker.spawn(
                serve_connection(self.connections.clone(), stream).instrument(span),
            );
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn serve_connection(ctx: Arc<ConnectionContext>, stream: TcpStream) {
    let handshake = tokio::time::timeout(ctx.read_header_timeout, ctx.acceptor.accept(stream));
    let tls_stream = tokio::select! {
        () = ctx.drain.cancelled() => return,
        result = handshake => match result {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!("TLS handshake timed out");
                return;
            }
        },
    };

    let alpn = tls_stream
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned());
    tracing::debug!(alpn = ?alpn, "Connection established");

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(ctx.read_header_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(ctx.idle_timeout)
        .keep_alive_timeout(KEEP_ALIVE_TIMEOUT);

    let service = TowerToHyperService::new(ctx.router.clone());
    let conn = builder.serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = ctx.drain.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                () = ctx.terminate.cancelled() => {
                    tracing::debug!("Connection forcibly closed");
                    return;
                }
            }
        }
    };

    match result {
        Ok(()) => tracing::debug!("Connection closed"),
        Err(e) => tracing::debug!(error = %e, "Connection ended with error"),
    }
}
