//! Local cache store capability.
//!
//! The connection never owns document storage itself; it drives a [`Store`]
//! per collection through `begin_update` / `update` / `end_update` batches
//! and asks it for pre-images around stub execution. Members a store does not
//! support keep their default bodies: no-ops for the batch hooks, `None` for
//! the queries, so call sites test for the capability by the return value.
//!
//! [`LocalCollection`] is a small in-memory store used by the probe binary
//! and the tests. Stubs write to it through cloned handles while the
//! connection holds it as a `Box<dyn Store>`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::protocol::Document;

/// Pre-images captured while a stub ran: document id → document as it was
/// before the stub's first write (`None` if it did not exist).
pub type Originals = HashMap<String, Option<Document>>;

/// One update envelope bound for a store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    Added {
        id: String,
        fields: Document,
    },
    Changed {
        id: String,
        fields: Document,
        cleared: Vec<String>,
    },
    Removed {
        id: String,
    },
    /// Synthetic: the server-confirmed state of a document once every stub
    /// that touched it has finished. `None` means the document must not exist.
    Replace {
        id: String,
        replace: Option<Document>,
    },
}

impl StoreUpdate {
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. }
            | Self::Changed { id, .. }
            | Self::Removed { id }
            | Self::Replace { id, .. } => id,
        }
    }
}

/// A collection-level cache adapter.
pub trait Store: Send {
    /// Start a batch of `batch_size` updates. With `reset`, the store must
    /// drop everything it holds first.
    fn begin_update(&mut self, _batch_size: usize, _reset: bool) {}

    fn update(&mut self, update: StoreUpdate);

    fn end_update(&mut self) {}

    /// Begin tracking pre-images of documents written from now on.
    fn save_originals(&mut self) {}

    /// Stop tracking and return the pre-images captured since
    /// [`save_originals`](Store::save_originals). `None` if unsupported.
    fn retrieve_originals(&mut self) -> Option<Originals> {
        None
    }

    /// Current local value of a document, if the store can answer.
    fn get_doc(&self, _id: &str) -> Option<Document> {
        None
    }
}

/// Apply the set/unset parts of a `changed` envelope to a document.
pub fn apply_changes(doc: &mut Document, fields: &Document, cleared: &[String]) {
    for (key, value) in fields {
        if key == "_id" {
            continue;
        }
        doc.insert(key.clone(), value.clone());
    }
    for key in cleared {
        doc.remove(key);
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    docs: BTreeMap<String, Document>,
    originals: Option<Originals>,
    batches: usize,
    resets: usize,
}

impl CollectionState {
    fn remember(&mut self, id: &str) {
        let before = self.docs.get(id).cloned();
        if let Some(originals) = self.originals.as_mut() {
            originals.entry(id.to_string()).or_insert(before);
        }
    }
}

/// In-memory collection with pre-image tracking.
///
/// Cloning yields another handle to the same collection.
#[derive(Debug, Clone, Default)]
pub struct LocalCollection {
    state: Arc<Mutex<CollectionState>>,
}

impl LocalCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A boxed store handle for [`Connection::register_store`].
    ///
    /// [`Connection::register_store`]: crate::connection::Connection::register_store
    pub fn store(&self) -> Box<dyn Store> {
        Box::new(self.clone())
    }

    /// Local write: insert or overwrite a document.
    pub fn insert(&self, id: impl Into<String>, fields: Document) {
        let id = id.into();
        let mut state = self.lock();
        state.remember(&id);
        let mut doc = fields;
        doc.insert("_id".into(), Value::String(id.clone()));
        state.docs.insert(id, doc);
    }

    /// Local write: set fields on an existing document. Returns false if the
    /// document does not exist.
    pub fn update(&self, id: &str, fields: Document) -> bool {
        let mut state = self.lock();
        if !state.docs.contains_key(id) {
            return false;
        }
        state.remember(id);
        if let Some(doc) = state.docs.get_mut(id) {
            apply_changes(doc, &fields, &[]);
        }
        true
    }

    /// Local write: delete a document. Returns false if it did not exist.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock();
        if !state.docs.contains_key(id) {
            return false;
        }
        state.remember(id);
        state.docs.remove(id);
        true
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.lock().docs.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().docs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().docs.is_empty()
    }

    /// Number of completed `begin_update`/`end_update` batches.
    pub fn batch_count(&self) -> usize {
        self.lock().batches
    }

    /// Number of batches that reset the collection.
    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }
}

impl Store for LocalCollection {
    fn begin_update(&mut self, _batch_size: usize, reset: bool) {
        let mut state = self.lock();
        if reset {
            state.docs.clear();
            state.resets += 1;
        }
    }

    fn update(&mut self, update: StoreUpdate) {
        let mut state = self.lock();
        match update {
            StoreUpdate::Added { id, mut fields } => {
                fields.insert("_id".into(), Value::String(id.clone()));
                state.docs.insert(id, fields);
            }
            StoreUpdate::Changed {
                id,
                fields,
                cleared,
            } => match state.docs.get_mut(&id) {
                Some(doc) => apply_changes(doc, &fields, &cleared),
                None => log::warn!("Changed for unknown document {id}"),
            },
            StoreUpdate::Removed { id } => {
                if state.docs.remove(&id).is_none() {
                    log::warn!("Removed for unknown document {id}");
                }
            }
            StoreUpdate::Replace { id, replace } => match replace {
                Some(mut doc) => {
                    doc.insert("_id".into(), Value::String(id.clone()));
                    state.docs.insert(id, doc);
                }
                None => {
                    state.docs.remove(&id);
                }
            },
        }
    }

    fn end_update(&mut self) {
        self.lock().batches += 1;
    }

    fn save_originals(&mut self) {
        let mut state = self.lock();
        if state.originals.is_some() {
            log::warn!("save_originals called twice without retrieve_originals");
        }
        state.originals = Some(Originals::new());
    }

    fn retrieve_originals(&mut self) -> Option<Originals> {
        let mut state = self.lock();
        match state.originals.take() {
            Some(originals) => Some(originals),
            None => {
                log::warn!("retrieve_originals called without save_originals");
                Some(Originals::new())
            }
        }
    }

    fn get_doc(&self, id: &str) -> Option<Document> {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::document;
    use serde_json::json;

    #[test]
    fn test_originals_capture_first_write_only() {
        let coll = LocalCollection::new();
        coll.insert("a", document([("n", json!(1))]));

        let mut store = coll.store();
        store.save_originals();
        coll.update("a", document([("n", json!(2))]));
        coll.update("a", document([("n", json!(3))]));
        coll.insert("b", document([("n", json!(9))]));
        let originals = store.retrieve_originals().unwrap();

        assert_eq!(originals.len(), 2);
        assert_eq!(originals["a"].as_ref().unwrap()["n"], json!(1));
        assert!(originals["b"].is_none());
    }

    #[test]
    fn test_writes_outside_tracking_are_not_recorded() {
        let coll = LocalCollection::new();
        let mut store = coll.store();
        coll.insert("a", Document::new());
        store.save_originals();
        let originals = store.retrieve_originals().unwrap();
        assert!(originals.is_empty());
    }

    #[test]
    fn test_update_batch_applies_envelopes() {
        let coll = LocalCollection::new();
        let mut store = coll.store();
        store.begin_update(3, false);
        store.update(StoreUpdate::Added {
            id: "x".into(),
            fields: document([("a", json!(1)), ("b", json!(2))]),
        });
        store.update(StoreUpdate::Changed {
            id: "x".into(),
            fields: document([("a", json!(10))]),
            cleared: vec!["b".into()],
        });
        store.update(StoreUpdate::Replace {
            id: "y".into(),
            replace: Some(document([("c", json!(3))])),
        });
        store.end_update();

        let x = coll.get("x").unwrap();
        assert_eq!(x["a"], json!(10));
        assert!(x.get("b").is_none());
        assert_eq!(coll.get("y").unwrap()["_id"], json!("y"));
        assert_eq!(coll.batch_count(), 1);
    }

    #[test]
    fn test_reset_clears_collection() {
        let coll = LocalCollection::new();
        coll.insert("a", Document::new());
        let mut store = coll.store();
        store.begin_update(0, true);
        store.end_update();
        assert!(coll.is_empty());
        assert_eq!(coll.reset_count(), 1);
    }

    #[test]
    fn test_replace_none_deletes() {
        let coll = LocalCollection::new();
        coll.insert("a", Document::new());
        let mut store = coll.store();
        store.update(StoreUpdate::Replace {
            id: "a".into(),
            replace: None,
        });
        assert!(coll.get("a").is_none());
    }
}
