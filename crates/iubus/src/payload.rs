//! Payload access for an IU.
//!
//! Top-level writes go through the IU's mutation path before they are
//! visible locally. Nested writes through a [`PayloadCursor`] rebuild the
//! whole top-level document and install it as one write.
//!
//! A batch ([`Payload::batch`]) collects writes made by the thread that
//! opened it and sends them as a single delta when the outermost
//! [`BatchGuard`] ends. Other threads keep reading and writing the
//! committed state while a batch is open.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use iubus_core::{Coerce, DocumentStore, PathSegment, PayloadDelta, PayloadSnapshot};

use crate::error::{IuError, Result};
use crate::iu::Iu;

/// Writes collected by an open batch.
pub(crate) struct BatchState {
    holder: ThreadId,
    /// Nesting depth beyond the outermost batch on the holder thread.
    depth: usize,
    new_items: BTreeMap<String, Value>,
    removed: BTreeSet<String>,
}

impl BatchState {
    fn new(holder: ThreadId) -> Self {
        Self {
            holder,
            depth: 0,
            new_items: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }

    fn stage_set(&mut self, key: String, value: Value) {
        self.removed.remove(&key);
        self.new_items.insert(key, value);
    }

    fn stage_remove(&mut self, key: String) {
        self.new_items.remove(&key);
        self.removed.insert(key);
    }

    fn into_delta(self) -> PayloadDelta {
        PayloadDelta {
            is_delta: true,
            new_items: self.new_items,
            keys_to_remove: self.removed.into_iter().collect(),
        }
    }
}

/// Handle to an IU's payload.
#[derive(Clone, Copy)]
pub struct Payload<'a> {
    iu: &'a Iu,
}

impl<'a> Payload<'a> {
    pub(crate) fn new(iu: &'a Iu) -> Self {
        Self { iu }
    }

    /// Run `f` on the batch if the current thread holds it.
    fn with_own_batch<R>(&self, f: impl FnOnce(&mut BatchState) -> R) -> Option<R> {
        let me = thread::current().id();
        let mut batch = self.iu.shared().batch.lock();
        match batch.as_mut() {
            Some(state) if state.holder == me => Some(f(state)),
            _ => None,
        }
    }

    /// The payload as seen by the current thread.
    fn view(&self) -> DocumentStore {
        let staged = self.with_own_batch(|s| (s.new_items.clone(), s.removed.clone()));
        let committed = self.iu.with_state(|s| s.payload.clone());
        match staged {
            Some((new_items, removed)) => committed.overlay(&new_items, &removed),
            None => committed,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Value at `key`, or `null` if absent.
    pub fn get(&self, key: &str) -> Value {
        let staged = self.with_own_batch(|s| {
            if s.removed.contains(key) {
                Some(Value::Null)
            } else {
                s.new_items.get(key).cloned()
            }
        });
        if let Some(value) = staged.flatten() {
            return value;
        }
        self.iu
            .with_state(|s| s.payload.get(key))
            .map(|doc| Value::clone(&doc))
            .unwrap_or(Value::Null)
    }

    /// Legacy string view: `""` if absent, strings verbatim, other values
    /// as JSON text.
    pub fn get_str(&self, key: &str) -> String {
        self.get(key).to_string_lossy()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.view().contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.view().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view().is_empty()
    }

    /// Point-in-time view that later writes never modify.
    pub fn snapshot(&self) -> PayloadSnapshot {
        self.view().snapshot()
    }

    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.view().to_items()
    }

    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.view()
            .to_items()
            .into_iter()
            .map(|(k, v)| (k, v.to_string_lossy()))
            .collect()
    }

    /// Cursor for nested reads and writes below `key`.
    pub fn entry(&self, key: impl Into<String>) -> PayloadCursor<'a> {
        PayloadCursor {
            payload: *self,
            key: key.into(),
            path: Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        {
            let me = thread::current().id();
            let mut batch = self.iu.shared().batch.lock();
            if let Some(state) = batch.as_mut().filter(|s| s.holder == me) {
                state.stage_set(key, value);
                return Ok(());
            }
        }
        self.iu.modify_payload(PayloadDelta::set(key, value))
    }

    /// Remove `key`. Removing an absent key is still sent as an update.
    pub fn remove(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        {
            let me = thread::current().id();
            let mut batch = self.iu.shared().batch.lock();
            if let Some(state) = batch.as_mut().filter(|s| s.holder == me) {
                state.stage_remove(key);
                return Ok(());
            }
        }
        self.iu.modify_payload(PayloadDelta::remove(key))
    }

    /// Set several keys as one update.
    pub fn merge<I, K>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let new_items: BTreeMap<String, Value> =
            items.into_iter().map(|(k, v)| (k.into(), v)).collect();
        if new_items.is_empty() {
            return Ok(());
        }
        {
            let me = thread::current().id();
            let mut batch = self.iu.shared().batch.lock();
            if let Some(state) = batch.as_mut().filter(|s| s.holder == me) {
                for (key, value) in new_items {
                    state.stage_set(key, value);
                }
                return Ok(());
            }
        }
        self.iu.modify_payload(PayloadDelta {
            is_delta: true,
            new_items,
            keys_to_remove: Vec::new(),
        })
    }

    /// Replace the whole payload.
    ///
    /// Inside a batch this stages removal of every other key, so the batch
    /// still flushes as a delta.
    pub fn replace(&self, items: BTreeMap<String, Value>) -> Result<()> {
        let committed_keys: Vec<String> = self.iu.with_state(|s| s.payload.keys().cloned().collect());
        {
            let me = thread::current().id();
            let mut batch = self.iu.shared().batch.lock();
            if let Some(state) = batch.as_mut().filter(|s| s.holder == me) {
                let stale: Vec<String> = committed_keys
                    .into_iter()
                    .chain(state.new_items.keys().cloned())
                    .filter(|k| !items.contains_key(k))
                    .collect();
                for key in stale {
                    state.stage_remove(key);
                }
                for (key, value) in items {
                    state.stage_set(key, value);
                }
                return Ok(());
            }
        }
        self.iu.modify_payload(PayloadDelta::replace(items))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Batch scope
    // ─────────────────────────────────────────────────────────────────────

    /// Open a batch, waiting up to the buffer's batch timeout if another
    /// thread holds one.
    pub fn batch(&self) -> Result<BatchGuard> {
        self.batch_with_timeout(self.iu.batch_timeout())
    }

    pub fn batch_with_timeout(&self, timeout: Duration) -> Result<BatchGuard> {
        let me = thread::current().id();
        let shared = self.iu.shared();
        let deadline = Instant::now() + timeout;
        let mut batch = shared.batch.lock();

        loop {
            let holder = batch.as_ref().map(|s| s.holder);
            match holder {
                None => {
                    *batch = Some(BatchState::new(me));
                    break;
                }
                Some(holder) if holder == me => {
                    if let Some(state) = batch.as_mut() {
                        state.depth += 1;
                    }
                    break;
                }
                Some(_) => {
                    let timed_out = shared
                        .batch_released
                        .wait_until(&mut batch, deadline)
                        .timed_out();
                    if timed_out && batch.as_ref().map(|s| s.holder != me).unwrap_or(false) {
                        return Err(IuError::PayloadLockTimeout(self.iu.uid().to_string()));
                    }
                }
            }
        }

        Ok(BatchGuard {
            iu: self.iu.clone(),
            finished: false,
            _not_send: PhantomData,
        })
    }
}

/// Ends a payload batch. The outermost guard flushes collected writes as a
/// single update, when committed explicitly or when dropped.
#[must_use = "dropping the guard immediately ends the batch"]
pub struct BatchGuard {
    iu: Iu,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl BatchGuard {
    /// End the batch and report the outcome of the flush.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        finish_batch(&self.iu)
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = finish_batch(&self.iu) {
            tracing::warn!(uid = self.iu.uid(), error = %e, "payload batch flush failed");
        }
    }
}

fn finish_batch(iu: &Iu) -> Result<()> {
    let shared = iu.shared();
    let state = {
        let mut batch = shared.batch.lock();
        match batch.as_mut() {
            Some(state) if state.depth > 0 => {
                state.depth -= 1;
                return Ok(());
            }
            _ => {}
        }
        match batch.take() {
            Some(state) => state,
            None => return Ok(()),
        }
    };
    shared.batch_released.notify_all();

    let delta = state.into_delta();
    if delta.is_noop() {
        return Ok(());
    }
    iu.modify_payload(delta)
}

/// A position inside a payload document, e.g. `payload["a"]["b"][0]`.
#[derive(Clone)]
pub struct PayloadCursor<'a> {
    payload: Payload<'a>,
    key: String,
    path: Vec<PathSegment>,
}

impl<'a> PayloadCursor<'a> {
    /// Descend into an object member.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.path.push(PathSegment::Key(key.into()));
        self
    }

    /// Descend into an array element.
    pub fn index(mut self, index: usize) -> Self {
        self.path.push(PathSegment::Index(index));
        self
    }

    /// Human-readable address, e.g. `["a"]["b"][0]`.
    pub fn address(&self) -> String {
        let mut address = format!("[{:?}]", self.key);
        for segment in &self.path {
            address.push_str(&segment.to_string());
        }
        address
    }

    /// The value at this position; missing keys read as `null`.
    pub fn value(&self) -> Result<Value> {
        Ok(self.payload.view().get_path(&self.key, &self.path)?)
    }

    /// Shared handle to the whole top-level document.
    pub fn document(&self) -> Option<Arc<Value>> {
        self.payload.view().get(&self.key)
    }

    /// Write `value` here, creating missing objects along the way.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        // Held from the read of the document until the write lands, so a
        // concurrent write to the same key cannot slip in between. On a
        // mirror this also pins the revision sent as the hint.
        let _guard = self.payload.iu.lock_state();
        let doc = self
            .payload
            .view()
            .with_path_set(&self.key, &self.path, value.into())?;
        self.payload.set(self.key.clone(), doc)
    }

    pub fn to_string_lossy(&self) -> Result<String> {
        Ok(self.value()?.to_string_lossy())
    }

    pub fn to_i64(&self) -> Result<i64> {
        Ok(self.value()?.to_i64()?)
    }

    pub fn to_f64(&self) -> Result<f64> {
        Ok(self.value()?.to_f64()?)
    }

    pub fn to_bool(&self) -> Result<bool> {
        Ok(self.value()?.to_bool())
    }

    pub fn to_list(&self) -> Result<Vec<Value>> {
        Ok(self.value()?.to_list()?)
    }

    pub fn to_map(&self) -> Result<Map<String, Value>> {
        Ok(self.value()?.to_map()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    #[test]
    fn test_missing_key_reads_null_and_empty_string() {
        let iu = Iu::new("cat1");
        assert!(iu.payload().get("nope").is_null());
        assert_eq!(iu.payload().get_str("nope"), "");
        assert!(iu.payload().entry("nope").key("deeper").value().unwrap().is_null());
    }

    #[test]
    fn test_set_and_remove() {
        let iu = Iu::new("cat1");
        let payload = iu.payload();
        payload.set("word", "OK").unwrap();
        payload.set("count", 3).unwrap();
        assert_eq!(payload.keys(), vec!["count", "word"]);
        payload.remove("word").unwrap();
        assert!(!payload.contains("word"));
        assert_eq!(iu.revision(), 4);
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let iu = Iu::new("cat1");
        iu.payload().set("doc", json!({"a": 1})).unwrap();
        let snapshot = iu.payload().snapshot();

        iu.payload().entry("doc").key("a").set(2).unwrap();
        iu.payload().set("other", true).unwrap();

        assert_eq!(*snapshot["doc"], json!({"a": 1}));
        assert!(!snapshot.contains_key("other"));
        assert_eq!(iu.payload().get("doc"), json!({"a": 2}));
    }

    #[test]
    fn test_cursor_materializes_path() {
        let iu = Iu::new("cat1");
        let before = iu.revision();
        iu.payload().entry("cfg").key("a").key("b").set("deep").unwrap();
        assert_eq!(iu.payload().get("cfg"), json!({"a": {"b": "deep"}}));
        assert_eq!(iu.revision(), before + 1);
    }

    #[test]
    fn test_cursor_addressing_errors() {
        let iu = Iu::new("cat1");
        iu.payload().set("list", json!([1, 2])).unwrap();
        iu.payload().set("scalar", 5).unwrap();

        let cursor = iu.payload().entry("scalar").index(0);
        assert_eq!(cursor.address(), r#"["scalar"][0]"#);
        assert!(matches!(cursor.value(), Err(IuError::AddressingError(_))));
        assert!(matches!(cursor.set(1), Err(IuError::AddressingError(_))));
        assert!(matches!(
            iu.payload().entry("list").index(5).value(),
            Err(IuError::AddressingError(_))
        ));
        assert_eq!(iu.payload().entry("list").index(1).to_i64().unwrap(), 2);
    }

    #[test]
    fn test_cursor_coercions() {
        let iu = Iu::new("cat1");
        iu.payload()
            .set("v", json!({"num": "1.3", "word": "abc", "flag": "False", "items": [1, 2]}))
            .unwrap();
        let entry = iu.payload().entry("v");
        assert_eq!(entry.clone().key("num").to_f64().unwrap(), 1.3);
        assert!(matches!(
            entry.clone().key("word").to_i64(),
            Err(IuError::TypeConversion { .. })
        ));
        assert!(!entry.clone().key("flag").to_bool().unwrap());
        assert_eq!(entry.clone().key("items").to_list().unwrap().len(), 2);
        assert_eq!(entry.to_map().unwrap().len(), 4);
    }

    #[test]
    fn test_batch_flushes_once() {
        let iu = Iu::new("cat1");
        iu.payload().set("old", 1).unwrap();
        let before = iu.revision();
        {
            let _batch = iu.payload().batch().unwrap();
            iu.payload().set("a", 1).unwrap();
            iu.payload().set("b", 2).unwrap();
            iu.payload().remove("old").unwrap();
            assert_eq!(iu.payload().get("a"), json!(1));
            assert!(!iu.payload().contains("old"));
            assert_eq!(iu.revision(), before);
        }
        assert_eq!(iu.revision(), before + 1);
        assert_eq!(iu.payload().keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let iu = Iu::new("cat1");
        iu.payload().batch().unwrap().commit().unwrap();
        assert_eq!(iu.revision(), 1);
    }

    #[test]
    fn test_nested_batch_joins_outer() {
        let iu = Iu::new("cat1");
        let outer = iu.payload().batch().unwrap();
        iu.payload().set("a", 1).unwrap();
        {
            let inner = iu.payload().batch().unwrap();
            iu.payload().set("b", 2).unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(iu.revision(), 1);
        outer.commit().unwrap();
        assert_eq!(iu.revision(), 2);
        assert_eq!(iu.payload().len(), 2);
    }

    #[test]
    fn test_foreign_thread_sees_committed_state() {
        let iu = Iu::new("cat1");
        iu.payload().set("base", "v0").unwrap();

        let batch = iu.payload().batch().unwrap();
        iu.payload().set("base", "staged").unwrap();

        let other = iu.clone();
        let seen = thread::spawn(move || {
            let seen = other.payload().get_str("base");
            other.payload().set("direct", 1).unwrap();
            seen
        })
        .join()
        .unwrap();
        assert_eq!(seen, "v0");
        // The foreign write landed immediately.
        assert_eq!(iu.revision(), 3);

        batch.commit().unwrap();
        assert_eq!(iu.payload().get_str("base"), "staged");
        assert_eq!(iu.payload().get("direct"), json!(1));
        assert_eq!(iu.revision(), 4);
    }

    #[test]
    fn test_foreign_batch_times_out() {
        let iu = Iu::new("cat1");
        let batch = iu.payload().batch().unwrap();

        let other = iu.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = other
                .payload()
                .batch_with_timeout(Duration::from_millis(20))
                .map(|guard| guard.commit());
            let _ = tx.send(matches!(result, Err(IuError::PayloadLockTimeout(_))));
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        drop(batch);
    }

    #[test]
    fn test_foreign_batch_waits_for_release() {
        let iu = Iu::new("cat1");
        let batch = iu.payload().batch().unwrap();

        let other = iu.clone();
        let handle = thread::spawn(move || {
            let guard = other.payload().batch_with_timeout(Duration::from_secs(5))?;
            other.payload().set("later", 1)?;
            guard.commit()
        });
        thread::sleep(Duration::from_millis(20));
        iu.payload().set("first", 1).unwrap();
        batch.commit().unwrap();

        handle.join().unwrap().unwrap();
        assert_eq!(iu.payload().len(), 2);
        assert_eq!(iu.revision(), 3);
    }

    #[test]
    fn test_concurrent_nested_writes_keep_every_key() {
        let iu = Iu::new("cat1");
        let writers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|prefix| {
                let iu = iu.clone();
                thread::spawn(move || -> Result<()> {
                    for i in 0..500 {
                        iu.payload().entry("doc").key(format!("{}{}", prefix, i)).set(i)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }

        let doc = iu.payload().get("doc");
        assert_eq!(doc.as_object().map(|m| m.len()), Some(1000));
        assert_eq!(doc["a499"], json!(499));
        assert_eq!(doc["b0"], json!(0));
        assert_eq!(iu.revision(), 1001);
    }

    #[test]
    fn test_batch_on_committed_iu_reports_error() {
        let iu = Iu::new("cat1");
        let batch = iu.payload().batch().unwrap();
        iu.payload().set("a", 1).unwrap();
        iu.commit().unwrap();
        assert!(matches!(batch.commit(), Err(IuError::Committed(_))));
        assert!(iu.payload().is_empty());
    }

    #[test]
    fn test_replace_inside_batch() {
        let iu = Iu::new("cat1");
        iu.payload().set("x", 1).unwrap();
        iu.payload().set("y", 2).unwrap();
        {
            let _batch = iu.payload().batch().unwrap();
            let mut items = BTreeMap::new();
            items.insert("y".to_string(), json!(20));
            items.insert("z".to_string(), json!(30));
            iu.payload().replace(items).unwrap();
        }
        assert_eq!(iu.payload().to_map(), {
            let mut expected = BTreeMap::new();
            expected.insert("y".to_string(), json!(20));
            expected.insert("z".to_string(), json!(30));
            expected
        });
    }

    #[test]
    fn test_merge_and_string_map() {
        let iu = Iu::new("cat1");
        iu.payload()
            .merge([("a", json!("text")), ("b", json!({"k": 1}))])
            .unwrap();
        assert_eq!(iu.revision(), 2);
        let strings = iu.payload().to_string_map();
        assert_eq!(strings["a"], "text");
        assert_eq!(strings["b"], r#"{"k":1}"#);
    }
}
