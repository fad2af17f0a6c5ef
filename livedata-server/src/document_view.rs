//! Per-document merge of the values each subscription asserts.
//!
//! Several subscriptions in one session may publish the same document with
//! different field values. For every field the view keeps a precedence list
//! of `(subscription, value)` entries; the client sees the value at the
//! front. Asserting a value moves that subscription's entry to the front,
//! so the most recent assertion wins, and withdrawing the front entry
//! promotes the next one.
//!
//! Mutators never call out themselves. They record client-visible effects
//! into a [`ChangedFields`] collector: `Some(value)` for a new effective
//! value, `None` for a field that no longer exists.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::Value;

use crate::{ChangedFields, Fields};

#[derive(Debug, Clone, PartialEq)]
struct PrecedenceItem {
    subscription: String,
    value: Value,
}

/// One document as seen by one session.
#[derive(Debug, Clone)]
pub struct SessionDocumentView {
    exists_in: HashSet<String>,
    data_by_key: HashMap<String, Vec<PrecedenceItem>>,
    last_accessed: Instant,
}

impl SessionDocumentView {
    pub fn new(now: Instant) -> Self {
        Self {
            exists_in: HashSet::new(),
            data_by_key: HashMap::new(),
            last_accessed: now,
        }
    }

    /// Effective fields, marking the document as recently used.
    pub fn get_fields(&mut self) -> Fields {
        self.last_accessed = Instant::now();
        self.fields()
    }

    /// Effective fields without touching the access time.
    pub fn fields(&self) -> Fields {
        self.data_by_key
            .iter()
            .filter_map(|(key, items)| items.first().map(|front| (key.clone(), front.value.clone())))
            .collect()
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    /// Whether `subscription` currently asserts that the document exists.
    pub fn exists_in(&self, subscription: &str) -> bool {
        self.exists_in.contains(subscription)
    }

    /// No subscription asserts the document anymore.
    pub fn is_orphaned(&self) -> bool {
        self.exists_in.is_empty()
    }

    pub(crate) fn add_subscription(&mut self, subscription: &str) {
        self.exists_in.insert(subscription.to_owned());
    }

    pub(crate) fn remove_subscription(&mut self, subscription: &str) {
        self.exists_in.remove(subscription);
    }

    /// Fields for which `subscription` holds an entry.
    pub(crate) fn keys_asserted_by(&self, subscription: &str) -> Vec<String> {
        self.data_by_key
            .iter()
            .filter(|(_, items)| items.iter().any(|item| item.subscription == subscription))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Record `subscription`'s value for `key` and move it to the front.
    pub fn change_field(
        &mut self,
        subscription: &str,
        key: &str,
        value: Value,
        collector: &mut ChangedFields,
    ) {
        if key == "_id" {
            return;
        }

        let Some(items) = self.data_by_key.get_mut(key) else {
            collector.insert(key.to_owned(), Some(value.clone()));
            self.data_by_key.insert(
                key.to_owned(),
                vec![PrecedenceItem {
                    subscription: subscription.to_owned(),
                    value,
                }],
            );
            return;
        };

        let unchanged = items.first().is_some_and(|front| front.value == value);
        if let Some(pos) = items.iter().position(|item| item.subscription == subscription) {
            items.remove(pos);
        }
        if !unchanged {
            collector.insert(key.to_owned(), Some(value.clone()));
        }
        items.insert(
            0,
            PrecedenceItem {
                subscription: subscription.to_owned(),
                value,
            },
        );
    }

    /// Withdraw `subscription`'s value for `key`.
    pub fn clear_field(&mut self, subscription: &str, key: &str, collector: &mut ChangedFields) {
        if key == "_id" {
            return;
        }
        let Some(items) = self.data_by_key.get_mut(key) else {
            return;
        };
        let Some(pos) = items.iter().position(|item| item.subscription == subscription) else {
            return;
        };

        let removed = items.remove(pos);
        if items.is_empty() {
            self.data_by_key.remove(key);
            collector.insert(key.to_owned(), None);
            return;
        }
        if pos != 0 {
            return;
        }
        if let Some(front) = items.first().filter(|front| front.value != removed.value) {
            collector.insert(key.to_owned(), Some(front.value.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view() -> SessionDocumentView {
        SessionDocumentView::new(Instant::now())
    }

    #[test]
    fn test_first_value_is_emitted() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(1), &mut changes);
        assert_eq!(changes.get("x"), Some(&Some(json!(1))));
        assert_eq!(doc.fields()["x"], json!(1));
    }

    #[test]
    fn test_id_is_never_tracked() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "_id", json!("doc"), &mut changes);
        doc.clear_field("a", "_id", &mut changes);
        assert!(changes.is_empty());
        assert!(doc.fields().is_empty());
    }

    #[test]
    fn test_latest_assertion_wins() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(1), &mut changes);
        doc.change_field("b", "x", json!(2), &mut changes);
        assert_eq!(changes.get("x"), Some(&Some(json!(2))));
        assert_eq!(doc.fields()["x"], json!(2));

        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(3), &mut changes);
        assert_eq!(changes.get("x"), Some(&Some(json!(3))));
    }

    #[test]
    fn test_same_value_from_other_subscription_is_silent() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(1), &mut changes);

        let mut changes = ChangedFields::new();
        doc.change_field("b", "x", json!(1), &mut changes);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_clearing_front_promotes_next() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(1), &mut changes);
        doc.change_field("b", "x", json!(2), &mut changes);

        let mut changes = ChangedFields::new();
        doc.clear_field("b", "x", &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get("x"), Some(&Some(json!(1))));
    }

    #[test]
    fn test_clearing_shadowed_entry_is_silent() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(1), &mut changes);
        doc.change_field("b", "x", json!(2), &mut changes);

        let mut changes = ChangedFields::new();
        doc.clear_field("a", "x", &mut changes);
        assert!(changes.is_empty());
        assert_eq!(doc.fields()["x"], json!(2));
    }

    #[test]
    fn test_clearing_last_entry_removes_field() {
        let mut doc = view();
        let mut changes = ChangedFields::new();
        doc.change_field("a", "x", json!(1), &mut changes);

        let mut changes = ChangedFields::new();
        doc.clear_field("a", "x", &mut changes);
        assert_eq!(changes.get("x"), Some(&None));
        assert!(doc.fields().is_empty());
        assert!(doc.keys_asserted_by("a").is_empty());
    }

    #[test]
    fn test_fields_does_not_touch() {
        let start = Instant::now();
        let mut doc = SessionDocumentView::new(start);
        let _ = doc.fields();
        assert_eq!(doc.last_accessed(), start);
        let _ = doc.get_fields();
        assert!(doc.last_accessed() >= start);
    }
}
