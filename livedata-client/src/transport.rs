//! The byte-stream side of a connection.
//!
//! A [`Transport`] only moves text frames and reports lifecycle events; it
//! knows nothing about DDP. Whoever owns the transport feeds its
//! [`TransportEvent`]s into the connection in arrival order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse transport state, as reported by [`Transport::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Connecting,
    Connected,
    /// Disconnected, waiting to retry.
    Waiting,
    /// Disconnected on purpose; will not retry until asked to.
    Offline,
    /// Permanently failed (e.g. version negotiation).
    Failed,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Waiting => "waiting",
            Self::Offline => "offline",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of the transport state, serialized the way DDP clients report
/// it (`{"status": "waiting", "retryCount": 2, ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub status: StatusKind,
    pub retry_count: u32,
    pub reason: Option<String>,
}

impl ConnectionStatus {
    /// Create a status with no retries and no reason.
    pub fn new(status: StatusKind) -> Self {
        Self {
            status,
            retry_count: 0,
            reason: None,
        }
    }

    /// Whether the socket is up.
    pub fn connected(&self) -> bool {
        self.status == StatusKind::Connected
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(StatusKind::Connecting)
    }
}

/// Lifecycle events a transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// A (re)connection completed, including the very first one.
    Reset,
    /// The underlying socket went away.
    Disconnect,
}

/// How a disconnect should behave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Never reconnect again.
    pub permanent: bool,
    /// Reason recorded in the status.
    pub error: Option<String>,
}

/// Frame transport driven by a [`Connection`](crate::Connection).
pub trait Transport: Send {
    /// Queue one frame. Frames go out in call order.
    fn send(&mut self, frame: String);

    /// Reconnect. With `force`, drop a live socket first.
    fn reconnect(&mut self, force: bool);

    /// Close the socket; see [`DisconnectOptions`].
    fn disconnect(&mut self, options: DisconnectOptions);

    fn status(&self) -> ConnectionStatus;
}
