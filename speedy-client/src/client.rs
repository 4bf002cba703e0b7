//! Streaming client
//!
//! `publish` turns a local byte source into the live body of a `POST /`,
//! `subscribe` copies each line of a `GET /` response body to a local sink as
//! soon as it arrives.

use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Identity, StatusCode};
use speedy_core::bus::{DELIMITER, MAX_MESSAGE_LENGTH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Outcome of a finished publish stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub status: StatusCode,
    /// Confirmation sent by the relay
    pub body: String,
    pub bytes_sent: u64,
}

/// Totals of a finished subscribe stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeSummary {
    pub messages: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StreamingClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl StreamingClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .http2_prior_knowledge()
            .connect_timeout(config.connect_timeout);

        if let Some(tls) = &config.tls {
            let cert = std::fs::read(&tls.cert_path)?;
            let key = std::fs::read(&tls.key_path)?;

            let mut identity = cert.clone();
            identity.push(b'\n');
            identity.extend_from_slice(&key);

            builder = builder
                .add_root_certificate(Certificate::from_pem(&cert)?)
                .identity(Identity::from_pem(&identity)?);
        }

        if config.insecure_skip_verify {
            tracing::warn!(
                endpoint = %config.endpoint,
                "TLS certificate verification is disabled, the relay's identity is not checked"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            endpoint: config.endpoint,
        })
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Stream `source` to the relay until it reaches end of file
    pub async fn publish<R>(&self, source: R) -> ClientResult<PublishReceipt>
    where
        R: AsyncRead + Send + 'static,
    {
        let sent = Arc::new(AtomicU64::new(0));
        let body = {
            let sent = sent.clone();
            ReaderStream::new(source).inspect_ok(move |chunk| {
                sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            })
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status { status, body });
        }

        let bytes_sent = sent.load(Ordering::Relaxed);
        tracing::debug!(%status, bytes_sent, "Publish stream finished");

        Ok(PublishReceipt {
            status,
            body,
            bytes_sent,
        })
    }

    /// Copy every message to `sink` until the relay ends the stream
    pub async fn subscribe<W>(&self, sink: &mut W) -> ClientResult<SubscribeSummary>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let response = self.http.get(self.endpoint.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(ClientError::Status { status, body });
        }
        tracing::debug!(%status, "Subscribe stream opened");

        let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let mut lines = pin!(FramedRead::new(
            reader,
            AnyDelimiterCodec::new_with_max_length(vec![DELIMITER], Vec::new(), MAX_MESSAGE_LENGTH),
        ));

        let mut summary = SubscribeSummary::default();
        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| match e {
                AnyDelimiterCodecError::Io(e) => e,
                AnyDelimiterCodecError::MaxChunkLengthExceeded => io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("message exceeds {MAX_MESSAGE_LENGTH} bytes"),
                ),
            })?;

            sink.write_all(&line).await?;
            sink.write_all(&[DELIMITER]).await?;
            sink.flush().await?;

            summary.messages += 1;
            summary.bytes += line.len() as u64 + 1;
        }

        tracing::debug!(
            messages = summary.messages,
            bytes = summary.bytes,
            "Subscribe stream closed by relay"
        );
        Ok(summary)
    }
}
