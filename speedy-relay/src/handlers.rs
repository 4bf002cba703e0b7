//! Publish and subscribe stream handlers
//!
//! Both bodies are treated as live byte channels: the publish request body is
//! read line by line while the publisher keeps writing, and the subscribe
//! response body stays open while the bus keeps producing.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::{StreamExt, TryStreamExt};
use speedy_core::bus::{DELIMITER, MAX_MESSAGE_LENGTH};
use speedy_core::{Message, MessageBus};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;
use tracing::Span;

use crate::error::AppError;
use crate::metrics::RelayMetrics;
use crate::middleware::require_http2;

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<MessageBus>,
    pub metrics: RelayMetrics,
    pub span: Span,
}

/// Build the relay router, every request gated to HTTP/2
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(publish).get(subscribe))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(require_http2))
        .with_state(state)
}

/// `POST /`: read newline-delimited messages until the publisher closes the body
async fn publish(State(state): State<AppState>, body: Body) -> Result<Response, AppError> {
    let mut session = PublishSession::open(&state);

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let mut lines = FramedRead::new(reader, line_codec());

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| session.read_failed(&e))?;
        if line.is_empty() || &line[..] == b"\r" {
            continue;
        }

        let Ok(message) = Message::from_line(&line) else {
            session.skipped += 1;
            tracing::warn!(parent: &session.span, len = line.len(), "Skipping line with an embedded carriage return");
            continue;
        };
        state.bus.enqueue(message).await.map_err(|e| {
            tracing::warn!(parent: &session.span, received = session.received, "Bus closed during publish");
            AppError::from(e)
        })?;
        session.received += 1;
        state.metrics.message_published();
    }

    tracing::info!(
        parent: &session.span,
        received = session.received,
        skipped = session.skipped,
        "Publisher disconnected"
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("received {} messages\n", session.received),
    )
        .into_response())
}

/// Splits a body on `'\n'` without assuming any text encoding
fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(vec![DELIMITER], Vec::new(), MAX_MESSAGE_LENGTH)
}

/// `GET /`: stream messages from the bus until it is closed and drained
async fn subscribe(State(state): State<AppState>) -> Response {
    let session = SubscribeSession::open(&state);

    let stream = futures::stream::unfold(session, |mut session| async move {
        let message = session.bus.dequeue().await?;
        let frame = message.into_frame();
        session.delivered(frame.len());
        Some((Ok::<_, Infallible>(frame), session))
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// `GET /metrics`: Prometheus text exposition of this relay's registry
async fn metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let text = state
        .metrics
        .encode()
        .map_err(|e| AppError::internal(format!("failed to encode metrics: {e}")))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}

struct PublishSession {
    metrics: RelayMetrics,
    span: Span,
    received: u64,
    skipped: u64,
}

impl PublishSession {
    fn open(state: &AppState) -> Self {
        let span = tracing::info_span!(parent: &state.span, "publish");
        tracing::info!(parent: &span, "Publisher connected");
        state.metrics.publisher_opened();

        Self {
            metrics: state.metrics.clone(),
            span,
            received: 0,
            skipped: 0,
        }
    }

    fn read_failed(&self, err: &AnyDelimiterCodecError) -> AppError {
        tracing::warn!(parent: &self.span, received = self.received, error = %err, "Publish stream aborted");
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                AppError::bad_request(format!("line exceeds {MAX_MESSAGE_LENGTH} bytes"))
            }
            AnyDelimiterCodecError::Io(e) => AppError::bad_request(format!("failed to read body: {e}")),
        }
    }
}

impl Drop for PublishSession {
    fn drop(&mut self) {
        self.metrics.publisher_closed();
    }
}

/// Lives as long as the response body, which hyper drops when the subscriber
/// goes away or the stream ends
struct SubscribeSession {
    bus: Arc<MessageBus>,
    metrics: RelayMetrics,
    span: Span,
    messages: u64,
    bytes: u64,
}

impl SubscribeSession {
    fn open(state: &AppState) -> Self {
        let span = tracing::info_span!(parent: &state.span, "subscribe");
        tracing::info!(parent: &span, "Subscriber connected");
        state.metrics.subscriber_opened();

        Self {
            bus: state.bus.clone(),
            metrics: state.metrics.clone(),
            span,
            messages: 0,
            bytes: 0,
        }
    }

    fn delivered(&mut self, bytes: usize) {
        self.messages += 1;
        self.bytes += bytes as u64;
        self.metrics.message_delivered(bytes);
    }
}

impl Drop for SubscribeSession {
    fn drop(&mut self) {
        self.metrics.subscriber_closed();
        tracing::info!(
            parent: &self.span,
            messages = self.messages,
            bytes = self.bytes,
            bus_closed = self.bus.is_closed(),
            "Subscriber stream ended"
        );
    }
}
