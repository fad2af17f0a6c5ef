//! One collection as seen by one session.
//!
//! Publications call `added` / `changed` / `removed` with their
//! subscription handle; the view merges the assertions of every
//! subscription (see [`SessionDocumentView`]) and forwards only the
//! client-visible effects to [`SessionCallbacks`].
//!
//! Documents live in an LRU map bounded by [`ViewOptions::max_documents`]
//! and are also dropped by a periodic TTL sweep. Both evictions are silent:
//! no `removed` is emitted, later `changed`/`removed` calls for the document
//! fail with [`ViewError::UnknownDocument`], and a later `added` rebuilds it
//! from scratch.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use log::debug;
use lru::LruCache;

use crate::config::ViewOptions;
use crate::document_view::SessionDocumentView;
use crate::error::ViewError;
use crate::sweeper::Sweep;
use crate::{ChangedFields, Fields};

/// Receiver of the merged, client-visible stream of changes.
pub trait SessionCallbacks {
    fn added(&mut self, collection: &str, id: &str, fields: Fields);
    fn changed(&mut self, collection: &str, id: &str, fields: ChangedFields);
    fn removed(&mut self, collection: &str, id: &str);
}

pub struct SessionCollectionView<C> {
    collection_name: String,
    callbacks: C,
    documents: LruCache<String, SessionDocumentView>,
    options: ViewOptions,
}

impl<C: SessionCallbacks> SessionCollectionView<C> {
    pub fn new(collection_name: impl Into<String>, callbacks: C) -> Self {
        Self::with_options(collection_name, callbacks, ViewOptions::default())
    }

    pub fn with_options(
        collection_name: impl Into<String>,
        callbacks: C,
        options: ViewOptions,
    ) -> Self {
        let capacity = NonZeroUsize::new(options.max_documents).unwrap_or(NonZeroUsize::MIN);
        Self {
            collection_name: collection_name.into(),
            callbacks,
            documents: LruCache::new(capacity),
            options,
        }
    }

    /// Effective fields of a document, refreshing its LRU position and
    /// access time.
    pub fn get_fields(&mut self, id: &str) -> Option<Fields> {
        self.documents.get_mut(id).map(SessionDocumentView::get_fields)
    }

    /// `subscription` publishes `id` with `fields`.
    pub fn added(&mut self, subscription: &str, id: &str, fields: Fields) {
        let now = Instant::now();
        let is_new = !self.documents.contains(id);
        if is_new {
            if let Some((evicted, _)) = self
                .documents
                .push(id.to_owned(), SessionDocumentView::new(now))
            {
                debug!(
                    "Evicted document '{}' from '{}' (capacity {})",
                    evicted, self.collection_name, self.options.max_documents
                );
            }
        }
        let Some(doc) = self.documents.get_mut(id) else {
            return;
        };

        doc.touch(now);
        doc.add_subscription(subscription);
        let mut collector = ChangedFields::new();
        for (key, value) in fields {
            doc.change_field(subscription, &key, value, &mut collector);
        }

        if is_new {
            let fields = collector
                .into_iter()
                .filter_map(|(key, value)| value.map(|value| (key, value)))
                .collect();
            self.callbacks.added(&self.collection_name, id, fields);
        } else if !collector.is_empty() {
            self.callbacks.changed(&self.collection_name, id, collector);
        }
    }

    /// `subscription` changes fields of `id`; a `None` value withdraws its
    /// assertion for that field.
    pub fn changed(
        &mut self,
        subscription: &str,
        id: &str,
        changed: ChangedFields,
    ) -> Result<(), ViewError> {
        let doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| ViewError::unknown_document(&self.collection_name, id))?;
        doc.touch(Instant::now());

        let mut collector = ChangedFields::new();
        for (key, value) in changed {
            match value {
                Some(value) => doc.change_field(subscription, &key, value, &mut collector),
                None => doc.clear_field(subscription, &key, &mut collector),
            }
        }

        if !collector.is_empty() {
            self.callbacks.changed(&self.collection_name, id, collector);
        }
        Ok(())
    }

    /// `subscription` stops publishing `id`.
    pub fn removed(&mut self, subscription: &str, id: &str) -> Result<(), ViewError> {
        let doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| ViewError::unknown_document(&self.collection_name, id))?;

        doc.remove_subscription(subscription);
        if doc.is_orphaned() {
            self.documents.pop(id);
            self.callbacks.removed(&self.collection_name, id);
            return Ok(());
        }

        doc.touch(Instant::now());
        let mut collector = ChangedFields::new();
        for key in doc.keys_asserted_by(subscription) {
            doc.clear_field(subscription, &key, &mut collector);
        }
        if !collector.is_empty() {
            self.callbacks.changed(&self.collection_name, id, collector);
        }
        Ok(())
    }

    /// Emit the callbacks that turn what a client of `previous` sees into
    /// what a client of this view sees.
    pub fn diff<P>(&mut self, previous: &SessionCollectionView<P>) {
        for (id, now) in self.documents.iter() {
            match previous.documents.peek(id) {
                None => self.callbacks.added(&self.collection_name, id, now.fields()),
                Some(before) => {
                    let changes = diff_fields(&before.fields(), &now.fields());
                    if !changes.is_empty() {
                        self.callbacks.changed(&self.collection_name, id, changes);
                    }
                }
            }
        }
        for (id, _) in previous.documents.iter() {
            if !self.documents.contains(id) {
                self.callbacks.removed(&self.collection_name, id);
            }
        }
    }

    /// Forget every document without emitting anything.
    pub fn destroy(&mut self) {
        self.documents.clear();
    }
}

impl<C> SessionCollectionView<C> {
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn options(&self) -> &ViewOptions {
        &self.options
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains(id)
    }
}

impl<C> Sweep for SessionCollectionView<C> {
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let ttl = self.options.document_ttl();
        let expired: Vec<String> = self
            .documents
            .iter()
            .filter(|(_, doc)| now.saturating_duration_since(doc.last_accessed()) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.documents.pop(id);
        }
        if !expired.is_empty() {
            debug!(
                "Swept {} expired documents from '{}'",
                expired.len(),
                self.collection_name
            );
        }
        expired.len()
    }

    fn cleanup_interval(&self) -> Duration {
        self.options.cleanup_interval()
    }
}

/// Field-level difference from `before` to `after`.
fn diff_fields(before: &Fields, after: &Fields) -> ChangedFields {
    let mut changes = BTreeMap::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }
    changes
}
