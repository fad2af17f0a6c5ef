//! Error types for the session views.

use thiserror::Error;

/// Errors returned by [`SessionCollectionView`](crate::SessionCollectionView)
/// and [`SessionView`](crate::SessionView).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    /// `changed` or `removed` named a document the view does not hold,
    /// either because it was never added or because it was evicted.
    #[error("Could not find document '{id}' in collection '{collection}'")]
    UnknownDocument { collection: String, id: String },
}

impl ViewError {
    pub(crate) fn unknown_document(collection: &str, id: &str) -> Self {
        Self::UnknownDocument {
            collection: collection.to_owned(),
            id: id.to_owned(),
        }
    }
}
