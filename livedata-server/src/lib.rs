//! livedata-server: per-session merge of published documents.
//!
//! A client session may hold several subscriptions that publish the same
//! documents. Publications report what each subscription asserts; the
//! session views merge those assertions and forward a single consistent
//! stream of `added` / `changed` / `removed` to the client.
//!
//! ```text
//! publication(sub A) ─┐
//! publication(sub B) ─┼─► SessionView ─► SessionCollectionView ─► SessionCallbacks
//! publication(sub C) ─┘    (by name)      (LRU of SessionDocumentView)   (to client)
//!                                               ▲
//!                                   spawn_cleanup (TTL sweep)
//! ```

pub mod collection_view;
pub mod config;
pub mod document_view;
pub mod error;
pub mod session;
pub mod sweeper;

use std::collections::BTreeMap;

use serde_json::Value;

/// Field name → value, as published.
pub type Fields = serde_json::Map<String, Value>;

/// Field name → new value; `None` clears the field.
pub type ChangedFields = BTreeMap<String, Option<Value>>;

pub use collection_view::{SessionCallbacks, SessionCollectionView};
pub use config::ViewOptions;
pub use document_view::SessionDocumentView;
pub use error::ViewError;
pub use session::SessionView;
pub use sweeper::{spawn_cleanup, Sweep};
