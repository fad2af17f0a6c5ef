//! Document reconciler.
//!
//! While a stub has written a document locally, the server's view of that
//! document is kept aside in a [`ServerDoc`] shadow. Server data for the
//! document updates the shadow instead of the store; once every stub that
//! wrote it has been confirmed with `updated`, the shadow replaces whatever
//! the stubs left behind.
//!
//! Documents no stub touched pass straight through as store updates.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::mem;

use serde_json::Value;

use crate::connection::Connection;
use crate::error::{DdpError, Result};
use crate::protocol::{Document, Message};
use crate::store::{apply_changes, StoreUpdate};

/// Server-truth shadow of one stub-written document.
#[derive(Debug, Default)]
pub(crate) struct ServerDoc {
    /// `None` while the server says the document does not exist.
    pub(crate) document: Option<Document>,
    /// Methods whose stubs wrote this document and are not yet `updated`.
    pub(crate) written_by_stubs: HashSet<String>,
    /// Barriers waiting for this document to flush.
    pub(crate) flush_callbacks: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WrittenDoc {
    pub(crate) collection: String,
    pub(crate) id: String,
}

/// Work deferred until after the next store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AfterUpdate {
    SubReady(String),
    DataVisible(String),
}

#[derive(Debug)]
struct Barrier {
    remaining: usize,
    action: AfterUpdate,
}

/// Countdown latches: each fires its action once every shadow document it
/// waits on has been flushed.
#[derive(Debug, Default)]
pub(crate) struct FlushBarriers {
    next_id: u64,
    pending: HashMap<u64, Barrier>,
}

impl FlushBarriers {
    fn reserve(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn arm(&mut self, id: u64, remaining: usize, action: AfterUpdate) {
        self.pending.insert(id, Barrier { remaining, action });
    }

    /// One waited-on document flushed. Returns the action once the count
    /// reaches zero.
    fn complete(&mut self, id: u64) -> Option<AfterUpdate> {
        let barrier = self.pending.get_mut(&id)?;
        barrier.remaining -= 1;
        if barrier.remaining > 0 {
            return None;
        }
        self.pending.remove(&id).map(|b| b.action)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.len()
    }
}

impl Connection {
    pub(crate) fn process_one_data_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Added {
                collection,
                id,
                fields,
            } => self.process_added(&collection, id, fields.unwrap_or_default()),
            Message::Changed {
                collection,
                id,
                fields,
                cleared,
            } => self.process_changed(
                &collection,
                id,
                fields.unwrap_or_default(),
                cleared.unwrap_or_default(),
            ),
            Message::Removed { collection, id } => self.process_removed(&collection, id),
            Message::Ready { subs } => {
                for sub_id in subs {
                    self.run_when_all_server_docs_are_flushed(AfterUpdate::SubReady(sub_id));
                }
                Ok(())
            }
            Message::Updated { methods } => self.process_updated(methods),
            // Quiescence bookkeeping only.
            Message::Nosub { .. } => Ok(()),
            other => {
                log::debug!("Ignoring non-data message '{}' in data path", other.tag());
                Ok(())
            }
        }
    }

    fn server_doc_mut(&mut self, collection: &str, id: &str) -> Option<&mut ServerDoc> {
        self.server_documents.get_mut(collection)?.get_mut(id)
    }

    fn process_added(&mut self, collection: &str, id: String, fields: Document) -> Result<()> {
        let reset = self.reset_stores;
        let Some(server_doc) = self.server_doc_mut(collection, &id) else {
            self.push_update(collection, StoreUpdate::Added { id, fields });
            return Ok(());
        };

        let is_existing = server_doc.document.is_some();
        let mut shadow = fields.clone();
        shadow.insert("_id".into(), Value::String(id.clone()));
        server_doc.document = Some(shadow);

        if reset {
            // The store is about to be wiped. Re-add whatever the stub left
            // locally so the shadow still gets reconciled against it.
            let current = self
                .stores
                .get(collection)
                .and_then(|store| store.get_doc(&id))
                .map(|mut doc| {
                    doc.remove("_id");
                    doc
                })
                .unwrap_or(fields);
            self.push_update(collection, StoreUpdate::Added { id, fields: current });
        } else if is_existing {
            return Err(DdpError::invariant(format!(
                "Server sent add for existing id: {id}"
            )));
        }
        Ok(())
    }

    fn process_changed(
        &mut self,
        collection: &str,
        id: String,
        fields: Document,
        cleared: Vec<String>,
    ) -> Result<()> {
        match self.server_doc_mut(collection, &id) {
            Some(server_doc) => match server_doc.document.as_mut() {
                Some(doc) => {
                    apply_changes(doc, &fields, &cleared);
                    Ok(())
                }
                None => Err(DdpError::invariant(format!(
                    "Server sent changed for nonexisting id: {id}"
                ))),
            },
            None => {
                self.push_update(
                    collection,
                    StoreUpdate::Changed {
                        id,
                        fields,
                        cleared,
                    },
                );
                Ok(())
            }
        }
    }

    fn process_removed(&mut self, collection: &str, id: String) -> Result<()> {
        match self.server_doc_mut(collection, &id) {
            Some(server_doc) => {
                if server_doc.document.take().is_none() {
                    return Err(DdpError::invariant(format!(
                        "Server sent removed for nonexisting id: {id}"
                    )));
                }
                Ok(())
            }
            None => {
                self.push_update(collection, StoreUpdate::Removed { id });
                Ok(())
            }
        }
    }

    fn process_updated(&mut self, methods: Vec<String>) -> Result<()> {
        for method_id in methods {
            self.release_stub_writes(&method_id)?;

            if !self.method_invokers.contains_key(&method_id) {
                return Err(DdpError::invariant(format!(
                    "No callback invoker for method {method_id}"
                )));
            }
            self.run_when_all_server_docs_are_flushed(AfterUpdate::DataVisible(method_id));
        }
        Ok(())
    }

    /// Drop `method_id`'s claim on every document its stub wrote. Documents
    /// left with no claim get their server-truth value written back.
    pub(crate) fn release_stub_writes(&mut self, method_id: &str) -> Result<()> {
        let Some(written) = self.documents_written_by_stub.remove(method_id) else {
            return Ok(());
        };

        for WrittenDoc { collection, id } in written {
            let Some(docs) = self.server_documents.get_mut(&collection) else {
                return Err(DdpError::invariant(format!(
                    "Lost serverDoc for {collection}/{id}"
                )));
            };
            let Some(server_doc) = docs.get_mut(&id) else {
                return Err(DdpError::invariant(format!(
                    "Lost serverDoc for {collection}/{id}"
                )));
            };
            if !server_doc.written_by_stubs.remove(method_id) {
                return Err(DdpError::invariant(format!(
                    "Doc {collection}/{id} not written by method {method_id}"
                )));
            }
            if !server_doc.written_by_stubs.is_empty() {
                continue;
            }

            let Some(server_doc) = docs.remove(&id) else {
                continue;
            };
            if docs.is_empty() {
                self.server_documents.remove(&collection);
            }

            let replace = server_doc.document.map(|mut doc| {
                doc.remove("_id");
                doc
            });
            self.push_update(&collection, StoreUpdate::Replace { id, replace });

            for barrier in server_doc.flush_callbacks {
                if let Some(action) = self.flush_barriers.complete(barrier) {
                    self.after_update_callbacks.push(action);
                }
            }
        }
        Ok(())
    }

    /// Undo a failed stub's local writes at once. The restored documents go
    /// straight to their stores; buffered server data stays queued.
    pub(crate) fn roll_back_stub_writes(&mut self, method_id: &str) -> Result<()> {
        let queued = mem::take(&mut self.buffered_writes);
        let released = self.release_stub_writes(method_id);
        let rollback = mem::replace(&mut self.buffered_writes, queued);
        released?;

        for (collection, updates) in rollback {
            let Some(store) = self.stores.get_mut(&collection) else {
                continue;
            };
            store.begin_update(updates.len(), false);
            for update in updates {
                store.update(update);
            }
            store.end_update();
        }
        Ok(())
    }

    /// Schedule `action` for after the next store write that leaves no shadow
    /// document pending on a sent method.
    pub(crate) fn run_when_all_server_docs_are_flushed(&mut self, action: AfterUpdate) {
        let barrier = self.flush_barriers.reserve();
        let invokers = &self.method_invokers;
        let mut remaining = 0;

        for docs in self.server_documents.values_mut() {
            for server_doc in docs.values_mut() {
                let pending = server_doc.written_by_stubs.iter().any(|method_id| {
                    invokers
                        .get(method_id)
                        .is_some_and(|invoker| invoker.sent_message)
                });
                if pending {
                    remaining += 1;
                    server_doc.flush_callbacks.push(barrier);
                }
            }
        }

        if remaining == 0 {
            self.after_update_callbacks.push(action);
        } else {
            self.flush_barriers.arm(barrier, remaining, action);
        }
    }

    /// Start pre-image tracking on every store ahead of a stub run.
    pub(crate) fn save_originals(&mut self) -> Result<()> {
        // Pending server writes must land first or they'd be captured as
        // stub pre-images.
        if !self.waiting_for_quiescence() {
            self.flush_buffered_writes()?;
        }
        for store in self.stores.values_mut() {
            store.save_originals();
        }
        Ok(())
    }

    /// Collect the stub's pre-images and claim each written document for
    /// `method_id`.
    pub(crate) fn retrieve_and_store_originals(&mut self, method_id: &str) -> Result<()> {
        if self.documents_written_by_stub.contains_key(method_id) {
            return Err(DdpError::invariant(format!("Duplicate methodId {method_id}")));
        }

        let mut written = Vec::new();
        for (collection, store) in self.stores.iter_mut() {
            let Some(originals) = store.retrieve_originals() else {
                continue;
            };
            for (id, original) in originals {
                written.push(WrittenDoc {
                    collection: collection.clone(),
                    id: id.clone(),
                });
                let docs = self.server_documents.entry(collection.clone()).or_default();
                match docs.entry(id) {
                    Entry::Occupied(entry) => {
                        entry.into_mut().written_by_stubs.insert(method_id.to_string());
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(ServerDoc {
                            document: original,
                            written_by_stubs: HashSet::from([method_id.to_string()]),
                            flush_callbacks: Vec::new(),
                        });
                    }
                }
            }
        }

        if !written.is_empty() {
            self.documents_written_by_stub
                .insert(method_id.to_string(), written);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_fires_on_last_completion() {
        let mut barriers = FlushBarriers::default();
        let id = barriers.reserve();
        barriers.arm(id, 2, AfterUpdate::SubReady("s".into()));

        assert_eq!(barriers.complete(id), None);
        assert_eq!(barriers.complete(id), Some(AfterUpdate::SubReady("s".into())));
        assert_eq!(barriers.len(), 0);
        assert_eq!(barriers.complete(id), None);
    }

    #[test]
    fn test_cleared_barriers_never_fire() {
        let mut barriers = FlushBarriers::default();
        let id = barriers.reserve();
        barriers.arm(id, 1, AfterUpdate::DataVisible("1".into()));
        barriers.clear();
        assert_eq!(barriers.complete(id), None);
    }
}
