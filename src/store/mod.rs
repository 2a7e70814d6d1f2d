pub mod auth;
pub mod gcs;
pub mod mem;

use crate::error::StoreError;

/// Capability interface onto the object store.
///
/// Every call is synchronous from the caller's viewpoint and may block on
/// network I/O. A missing object is reported as `Ok(None)`, not as an error.
pub trait ObjectStore: Send + Sync {
    /// Reads a whole object.
    fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Reads `len` bytes of an object, starting at `offset`.
    fn read_part(&self, key: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>, StoreError>;

    /// Size of an object in bytes, from metadata only.
    fn object_len(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Writes a whole object, replacing any previous content.
    fn write_object(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Lists keys starting with `prefix` in lexicographic order, bounded by
    /// `start_offset` (inclusive) and `end_offset` (exclusive).
    fn list_keys(
        &self,
        prefix: &str,
        start_offset: Option<&str>,
        end_offset: Option<&str>,
    ) -> Result<Vec<String>, StoreError>;

    /// Deletes a batch of objects. Per-key failures are reported through
    /// `on_error`; deleting an already-absent key is one such failure
    /// (`StoreError::NotFound`) and is expected under concurrent deletion.
    fn delete_batch(
        &self,
        keys: &[String],
        on_error: &mut dyn FnMut(&str, &StoreError),
    ) -> Result<(), StoreError>;
}

/// Exercises the common backend contract. Called from each backend's tests.
#[cfg(test)]
pub(crate) fn test_backend<S: ObjectStore>(storage: S) {
    // Missing objects
    assert_eq!(storage.read_object("no/such/key").unwrap(), None);
    assert_eq!(storage.read_part("no/such/key", 0, 4).unwrap(), None);
    assert_eq!(storage.object_len("no/such/key").unwrap(), None);

    // Write then read back, whole and partial
    storage.write_object("dev0/a", b"hello world").unwrap();
    assert_eq!(
        storage.read_object("dev0/a").unwrap().unwrap(),
        b"hello world",
    );
    assert_eq!(storage.read_part("dev0/a", 6, 5).unwrap().unwrap(), b"world");
    assert_eq!(storage.object_len("dev0/a").unwrap(), Some(11));

    // Overwrite replaces the whole object
    storage.write_object("dev0/a", b"bye").unwrap();
    assert_eq!(storage.read_object("dev0/a").unwrap().unwrap(), b"bye");

    // Bounded listing is lexicographic
    storage.write_object("dev0/b", b"x").unwrap();
    storage.write_object("dev0/c", b"x").unwrap();
    storage.write_object("other/a", b"x").unwrap();
    assert_eq!(
        storage.list_keys("dev0/", None, None).unwrap(),
        vec!["dev0/a", "dev0/b", "dev0/c"],
    );
    assert_eq!(
        storage.list_keys("dev0/", Some("dev0/b"), Some("dev0/c")).unwrap(),
        vec!["dev0/b"],
    );

    // Batch deletion reports missing keys through the callback
    let mut missing = Vec::new();
    storage
        .delete_batch(
            &["dev0/a".to_owned(), "dev0/z".to_owned()],
            &mut |key, _err| missing.push(key.to_owned()),
        )
        .unwrap();
    assert_eq!(missing, vec!["dev0/z"]);
    assert_eq!(storage.read_object("dev0/a").unwrap(), None);
}
