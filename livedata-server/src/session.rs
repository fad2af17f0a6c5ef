//! Per-session routing by collection name.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::collection_view::{SessionCallbacks, SessionCollectionView};
use crate::config::ViewOptions;
use crate::error::ViewError;
use crate::sweeper::Sweep;
use crate::{ChangedFields, Fields};

/// Every collection view of one client session.
///
/// Views are created on the first `added` for a collection and dropped once
/// a `removed` leaves them empty. Each view gets its own clone of the
/// session's callbacks.
pub struct SessionView<C> {
    callbacks: C,
    options: ViewOptions,
    collections: HashMap<String, SessionCollectionView<C>>,
}

impl<C: SessionCallbacks + Clone> SessionView<C> {
    pub fn new(callbacks: C) -> Self {
        Self::with_options(callbacks, ViewOptions::default())
    }

    pub fn with_options(callbacks: C, options: ViewOptions) -> Self {
        Self {
            callbacks,
            options,
            collections: HashMap::new(),
        }
    }

    pub fn collection(&self, name: &str) -> Option<&SessionCollectionView<C>> {
        self.collections.get(name)
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    fn view_mut(&mut self, name: &str) -> &mut SessionCollectionView<C> {
        self.collections.entry(name.to_owned()).or_insert_with(|| {
            SessionCollectionView::with_options(name, self.callbacks.clone(), self.options.clone())
        })
    }

    pub fn added(&mut self, collection: &str, subscription: &str, id: &str, fields: Fields) {
        self.view_mut(collection).added(subscription, id, fields);
    }

    pub fn changed(
        &mut self,
        collection: &str,
        subscription: &str,
        id: &str,
        changed: ChangedFields,
    ) -> Result<(), ViewError> {
        self.collections
            .get_mut(collection)
            .ok_or_else(|| ViewError::unknown_document(collection, id))?
            .changed(subscription, id, changed)
    }

    pub fn removed(&mut self, collection: &str, subscription: &str, id: &str) -> Result<(), ViewError> {
        let view = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| ViewError::unknown_document(collection, id))?;
        view.removed(subscription, id)?;
        if view.is_empty() {
            self.collections.remove(collection);
        }
        Ok(())
    }

    /// Drop every view without emitting anything.
    pub fn destroy(&mut self) {
        self.collections.clear();
    }
}

impl<C> Sweep for SessionView<C> {
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let swept = self
            .collections
            .values_mut()
            .map(|view| view.sweep_expired(now))
            .sum();
        self.collections.retain(|_, view| !view.is_empty());
        swept
    }

    fn cleanup_interval(&self) -> Duration {
        self.options.cleanup_interval()
    }
}
