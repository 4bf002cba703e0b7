//! Message bus
//!
//! A single bounded, ordered conduit between every publish stream and every
//! subscribe stream. Delivery follows competing-consumer semantics: each
//! message is handed to exactly one subscriber, whichever dequeues it first.
//! A full bus blocks publishers until a subscriber frees a slot.
//!
//! The bus has one lifecycle. Once [`MessageBus::close`] is called, enqueueing
//! fails with [`BusError::Closed`] (including calls already waiting for
//! capacity), and dequeueing drains what is still buffered before reporting
//! the end of the bus to every subscriber.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Bus capacity used when none is configured
pub const DEFAULT_CAPACITY: usize = 8;

/// Line delimiter between messages on the wire
pub const DELIMITER: u8 = b'\n';

/// Longest line accepted on either side of the wire
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,

    #[error("message contains a line break")]
    InvalidMessage,
}

/// One line of text, the unit of transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(String);

impl Message {
    pub fn new(text: impl Into<String>) -> Result<Self, BusError> {
        let text = text.into();
        if text.contains(['\n', '\r']) {
            return Err(BusError::InvalidMessage);
        }
        Ok(Self(text))
    }

    /// Build a message from one raw wire line, delimiter already removed
    ///
    /// A trailing `'\r'` is dropped and bytes that are not UTF-8 become
    /// U+FFFD, so any line short of an embedded `'\r'` is carried.
    pub fn from_line(line: &[u8]) -> Result<Self, BusError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Self::new(String::from_utf8_lossy(line))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire form: the text followed by the delimiter
    #[must_use]
    pub fn into_frame(self) -> Bytes {
        let mut frame = self.0.into_bytes();
        frame.push(DELIMITER);
        Bytes::from(frame)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Message {
    type Error = BusError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::new(text)
    }
}

impl TryFrom<&str> for Message {
    type Error = BusError;

    fn try_from(text: &str) -> Result<Self, Self::Error> {
        Self::new(text)
    }
}

pub struct MessageBus {
    sender: mpsc::Sender<Message>,
    // Subscribers queue on the (fair) lock and take turns receiving
    receiver: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
    capacity: usize,
}

impl MessageBus {
    /// Create a bus buffering at most `capacity` messages (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            capacity,
        }
    }

    /// Append a message, waiting for free space while the bus is full
    pub async fn enqueue(&self, message: Message) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(BusError::Closed),
            sent = self.sender.send(message) => sent.map_err(|_| BusError::Closed),
        }
    }

    /// Take the next message, waiting until one is available
    ///
    /// Returns `None` once the bus is closed and drained.
    pub async fn dequeue(&self) -> Option<Message> {
        // Whoever holds the lock returns promptly after close, so waiting on it
        // never outlives the bus
        let mut receiver = self.receiver.lock().await;

        tokio::select! {
            biased;
            message = receiver.recv() => message,
            () = self.closed.cancelled() => receiver.try_recv().ok(),
        }
    }

    /// Close the bus
    ///
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of buffered messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
