//! deno_core ops backing the in-isolate `android` global.

use std::collections::HashMap;
use std::sync::Arc;

use deno_core::{op2, OpState};
use deno_error::JsErrorBox;
use parking_lot::Mutex;

/// Named byte buffers waiting to be consumed by one isolate.
///
/// Shared between the stdio loop, which registers entries, and the isolate
/// thread, which removes them on consumption.
#[derive(Debug, Clone, Default)]
pub struct NamedDataStore(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl NamedDataStore {
    /// Register `data` under `name`. Returns `false` if the name is taken.
    pub fn provide(&self, name: String, data: Vec<u8>) -> bool {
        let mut entries = self.0.lock();
        if entries.contains_key(&name) {
            return false;
        }
        entries.insert(name, data);
        true
    }

    /// Remove and return the entry for `name`.
    pub fn take(&self, name: &str) -> Option<Vec<u8>> {
        self.0.lock().remove(name)
    }

    /// Drop every unconsumed entry.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Consume the named buffer, or throw if there is none.
#[op2]
#[buffer]
pub fn op_consume_named_data(
    state: &mut OpState,
    #[string] name: String,
) -> Result<Vec<u8>, JsErrorBox> {
    state
        .borrow::<NamedDataStore>()
        .take(&name)
        .ok_or_else(|| JsErrorBox::generic(format!("no named data available for '{name}'")))
}

deno_core::extension!(jsbox_ext, ops = [op_consume_named_data]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_taken_once() {
        let store = NamedDataStore::default();
        assert!(store.provide("id-1".into(), vec![0, 0x61, 0x73, 0x6d]));
        assert_eq!(store.take("id-1"), Some(vec![0, 0x61, 0x73, 0x6d]));
        assert_eq!(store.take("id-1"), None);
    }

    #[test]
    fn names_cannot_be_overwritten() {
        let store = NamedDataStore::default();
        assert!(store.provide("a".into(), vec![1]));
        assert!(!store.provide("a".into(), vec![2]));
        assert_eq!(store.take("a"), Some(vec![1]));
    }

    #[test]
    fn clones_share_entries() {
        let store = NamedDataStore::default();
        let other = store.clone();
        store.provide("x".into(), vec![9]);
        assert_eq!(other.take("x"), Some(vec![9]));
        store.provide("y".into(), vec![]);
        other.clear();
        assert_eq!(store.take("y"), None);
    }
}
