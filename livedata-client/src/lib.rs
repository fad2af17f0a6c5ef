//! # livedata-client: DDP live-data client core
//!
//! Keeps a local cache of server documents in sync over a DDP connection,
//! while letting method stubs write to the cache optimistically.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  TransportEvent   ┌──────────────────────────────┐
//! │  Transport    │ ────────────────► │ Connection                   │
//! │ (WebSocket)   │ ◄──────────────── │  stream router               │
//! └───────────────┘    text frames    │  method pipeline (blocks)    │
//!                                     │  document reconciler         │
//!                                     │  quiescence buffer           │
//!                                     └──────────────┬───────────────┘
//!                                                    │ begin/update/end
//!                                                    ▼
//!                                             ┌─────────────┐
//!                                             │ Store (per  │
//!                                             │ collection) │
//!                                             └─────────────┘
//! ```
//!
//! [`Connection`] is a synchronous state machine. [`LiveClient`] runs one on
//! a tokio task, feeding it transport events and timer ticks.
//!
//! ## Modules
//!
//! - [`protocol`]: DDP envelopes and JSON codec
//! - [`connection`]: the orchestrator and its quiescence/flush logic
//! - [`methods`]: stubs, method blocks, completion tracking
//! - [`subscription`]: subscription records and handles
//! - [`store`]: the cache store trait and an in-memory store
//! - [`transport`] / [`ws`]: transport seam and its WebSocket impl
//! - [`client`]: async driver task

pub mod client;
pub mod config;
pub mod connection;
mod documents;
pub mod error;
pub mod heartbeat;
pub mod methods;
pub mod protocol;
pub mod store;
mod stream;
pub mod subscription;
pub mod transport;
pub mod ws;

pub use client::LiveClient;
pub use config::ConnectionOptions;
pub use connection::{BlockSummary, Connection};
pub use error::{DdpError, ErrorCode, MethodError};
pub use methods::{ApplyOptions, MethodCallback, MethodInvocation, MethodPromise};
pub use protocol::{document, Document, Inbound, Message, SUPPORTED_DDP_VERSIONS};
pub use store::{LocalCollection, Store, StoreUpdate};
pub use subscription::{SubscriptionCallbacks, SubscriptionHandle};
pub use transport::{ConnectionStatus, DisconnectOptions, StatusKind, Transport, TransportEvent};
pub use ws::WebSocketTransport;
