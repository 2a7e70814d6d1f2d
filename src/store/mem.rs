use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use super::ObjectStore;

/// An object store keeping all data in memory, in a BTreeMap.
///
/// This is NOT persistent; it backs the test suite and local tooling. The
/// ordered map gives `list_keys` its lexicographic order for free.
#[derive(Clone, Default)]
pub struct MemStore(Arc<Mutex<BTreeMap<String, Vec<u8>>>>);

impl ObjectStore for MemStore {
    fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.0.lock().unwrap();
        Ok(store.get(key).cloned())
    }

    fn read_part(&self, key: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.0.lock().unwrap();
        let offset = offset as usize;
        let part = store
            .get(key)
            .map(|o| o[o.len().min(offset)..o.len().min(offset + len)].to_owned());
        Ok(part)
    }

    fn object_len(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let store = self.0.lock().unwrap();
        Ok(store.get(key).map(|o| o.len() as u64))
    }

    fn write_object(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut store = self.0.lock().unwrap();
        store.insert(key.to_owned(), data.to_owned());
        Ok(())
    }

    fn list_keys(
        &self,
        prefix: &str,
        start_offset: Option<&str>,
        end_offset: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let store = self.0.lock().unwrap();
        let start = match start_offset {
            Some(key) => Bound::Included(key.to_owned()),
            None => Bound::Unbounded,
        };
        let end = match end_offset {
            Some(key) => Bound::Excluded(key.to_owned()),
            None => Bound::Unbounded,
        };
        let keys = store
            .range((start, end))
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys)
    }

    fn delete_batch(
        &self,
        keys: &[String],
        on_error: &mut dyn FnMut(&str, &StoreError),
    ) -> Result<(), StoreError> {
        let mut store = self.0.lock().unwrap();
        for key in keys {
            if store.remove(key).is_none() {
                on_error(key, &StoreError::NotFound);
            }
        }
        Ok(())
    }
}
