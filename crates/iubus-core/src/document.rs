//! Copy-on-write payload document store.
//!
//! Every top-level payload key owns an independent document behind an
//! [`Arc`]. Writers never mutate a document in place: they clone it, modify
//! the clone, and install the result, so a snapshot taken earlier keeps
//! seeing the old tree.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;
use crate::messages::PayloadDelta;
use crate::value::{materialize, resolve, PathSegment};

/// Immutable view of a payload at one point in time.
pub type PayloadSnapshot = BTreeMap<String, Arc<Value>>;

/// Top-level key → shared document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentStore {
    docs: BTreeMap<String, Arc<Value>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: BTreeMap<String, Value>) -> Self {
        Self {
            docs: items.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }

    /// Shared handle to one document. Missing keys yield `None`.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.docs.get(key).cloned()
    }

    /// Read a nested position; missing keys read as `null`.
    pub fn get_path(&self, key: &str, path: &[PathSegment]) -> Result<Value> {
        match self.docs.get(key) {
            Some(doc) => resolve(doc, path),
            None => Ok(Value::Null),
        }
    }

    /// Compute the document that results from writing `value` at `path`
    /// below `key`, without installing it.
    pub fn with_path_set(&self, key: &str, path: &[PathSegment], value: Value) -> Result<Value> {
        let mut doc = self
            .docs
            .get(key)
            .map(|d| Value::clone(d))
            .unwrap_or(Value::Null);
        *materialize(&mut doc, path)? = value;
        Ok(doc)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.docs.insert(key.into(), Arc::new(value));
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<Value>> {
        self.docs.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.docs.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.docs.keys()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Cheap point-in-time copy: clones the map of `Arc`s, not the trees.
    pub fn snapshot(&self) -> PayloadSnapshot {
        self.docs.clone()
    }

    /// Deep copy into plain values.
    pub fn to_items(&self) -> BTreeMap<String, Value> {
        self.docs
            .iter()
            .map(|(k, v)| (k.clone(), Value::clone(v)))
            .collect()
    }

    pub fn replace_all(&mut self, items: BTreeMap<String, Value>) {
        *self = Self::from_items(items);
    }

    /// Apply an update.
    ///
    /// A full replace makes the store exactly equal to `new_items`. A delta
    /// removes `keys_to_remove` first and then installs `new_items`.
    pub fn apply(&mut self, delta: &PayloadDelta) {
        if !delta.is_delta {
            self.replace_all(delta.new_items.clone());
            return;
        }
        for key in &delta.keys_to_remove {
            self.docs.remove(key);
        }
        for (key, value) in &delta.new_items {
            self.docs.insert(key.clone(), Arc::new(value.clone()));
        }
    }

    /// Apply staged writes on top of this store without modifying it.
    pub fn overlay(&self, new_items: &BTreeMap<String, Value>, removed: &BTreeSet<String>) -> Self {
        let mut merged = self.clone();
        for key in removed {
            merged.docs.remove(key);
        }
        for (key, value) in new_items {
            merged.docs.insert(key.clone(), Arc::new(value.clone()));
        }
        merged
    }
}
