//! Translation between the flat device address space and stored objects.

use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::error::StoreError;
use crate::layout::{block_key, block_spans, Layout};
use crate::multilock::MultiLock;
use crate::store::ObjectStore;

/// Flush deletions in batches of this many keys.
const DELETE_BATCH: usize = 1000;

/// One virtual block device stored as fixed-size objects.
///
/// Every operation is synchronous and may block on the store. Reads need no
/// locking; writes serialise on a per-object-key mutex so that two
/// read-modify-write cycles never interleave on the same object. The lock is
/// shared by every `Device` in the process, whichever connection created it.
pub struct Device<S> {
    store: S,
    key_prefix: String,
    layout: Option<Layout>,
    lock: Arc<MultiLock>,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("device is read-only without `object-size`")]
    ReadOnly,

    #[error("requested {expected} bytes of {key}, got {got}")]
    ShortRead {
        key: String,
        expected: usize,
        got: usize,
    },
}

impl<S: ObjectStore> Device<S> {
    pub fn new(
        store: S,
        key_prefix: String,
        layout: Option<Layout>,
        lock: Arc<MultiLock>,
    ) -> Device<S> {
        Device {
            store,
            key_prefix,
            layout,
            lock,
        }
    }

    /// Device size in bytes: the configured size, or in single-object mode
    /// the current length of the one backing object (0 when absent).
    pub fn size(&self) -> Result<u64, DeviceError> {
        match self.layout {
            Some(layout) => Ok(layout.device_size),
            None => Ok(self.store.object_len(&self.key_prefix)?.unwrap_or(0)),
        }
    }

    /// Fills `buf` from the device, starting at `offset`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<(), DeviceError> {
        if buf.is_empty() {
            return Ok(());
        }

        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                // Single-object mode: the device is the raw object.
                let part = self.read_exact(&self.key_prefix, offset, buf.len())?;
                buf.copy_from_slice(&part);
                return Ok(());
            }
        };

        for span in block_spans(offset, buf.len(), layout.object_size) {
            let key = block_key(&self.key_prefix, span.block_num());
            let part = self.read_exact(&key, span.block_offset(), span.len())?;
            buf[span.buf_start()..span.buf_end()].copy_from_slice(&part);
        }
        Ok(())
    }

    /// Reads `len` bytes of `key` at `offset`, substituting zeros when the
    /// object is absent. Any other length mismatch is an invariant violation.
    fn read_exact(&self, key: &str, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        match self.store.read_part(key, offset, len)? {
            None => Ok(vec![0; len]),
            Some(part) if part.len() == len => Ok(part),
            Some(part) => Err(DeviceError::ShortRead {
                key: key.to_owned(),
                expected: len,
                got: part.len(),
            }),
        }
    }

    /// Writes `buf` at `offset`. Unaligned edges are handled by locked
    /// read-modify-write cycles; whole blocks are overwritten in ascending
    /// order, holding at most one key at a time. FUA needs no handling
    /// because every successful write is already durable.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<(), DeviceError> {
        let layout = self.layout.ok_or(DeviceError::ReadOnly)?;
        if buf.is_empty() {
            return Ok(());
        }
        let object_size = layout.object_size;

        // First block touched and the byte offset inside it.
        let blockno1 = offset / object_size;
        let block_offset1 = offset % object_size;
        // One-past-last block and how many bytes land in it.
        let end = offset + buf.len() as u64;
        let blockno2 = end / object_size;
        let block_len2 = end % object_size;

        // Start and end fall within the same, partially covered block.
        if blockno1 == blockno2 && (block_offset1 != 0 || block_len2 != 0) {
            debug!(
                "pwrite: offset {} covers bytes {} to {} of block {}, rewriting full block",
                offset, block_offset1, block_len2, blockno1,
            );
            let key = block_key(&self.key_prefix, blockno1);
            let _guard = self.lock.lock(&key);
            let mut block = self.read_exact(&key, 0, object_size as usize)?;
            block[block_offset1 as usize..block_len2 as usize].copy_from_slice(buf);
            self.store.write_object(&key, &block)?;
            return Ok(());
        }

        let mut buf = buf;
        let mut blockno1 = blockno1;

        // Head edge: the write starts inside a block.
        if block_offset1 != 0 {
            debug!(
                "pwrite: offset {} starts {} bytes into block {}, rewriting full block",
                offset, block_offset1, blockno1,
            );
            let key = block_key(&self.key_prefix, blockno1);
            let take = (object_size - block_offset1) as usize;
            {
                let _guard = self.lock.lock(&key);
                let mut block = self.read_exact(&key, 0, block_offset1 as usize)?;
                block.extend_from_slice(&buf[..take]);
                self.store.write_object(&key, &block)?;
            }
            buf = &buf[take..];
            blockno1 += 1;
        }

        // Tail edge: the write ends inside a block.
        if block_len2 != 0 {
            debug!(
                "pwrite: write ends {} bytes into block {}, rewriting full block",
                block_len2, blockno2,
            );
            let key = block_key(&self.key_prefix, blockno2);
            let keep = buf.len() - block_len2 as usize;
            {
                let _guard = self.lock.lock(&key);
                let suffix =
                    self.read_exact(&key, block_len2, (object_size - block_len2) as usize)?;
                let mut block = Vec::with_capacity(object_size as usize);
                block.extend_from_slice(&buf[keep..]);
                block.extend_from_slice(&suffix);
                self.store.write_object(&key, &block)?;
            }
            buf = &buf[..keep];
        }

        // Whole blocks in the middle.
        for (blockno, chunk) in (blockno1..blockno2).zip(buf.chunks_exact(object_size as usize)) {
            debug!("pwrite: writing block {}", blockno);
            let key = block_key(&self.key_prefix, blockno);
            let _guard = self.lock.lock(&key);
            self.store.write_object(&key, chunk)?;
        }

        Ok(())
    }

    /// Zeroes `len` bytes at `offset`. Wholly covered blocks are deleted
    /// (a missing object reads back as zeros); partially covered edges are
    /// rewritten through `pwrite`.
    pub fn zero(&self, len: u64, offset: u64) -> Result<(), DeviceError> {
        debug!("zero: len={}, offset={}", len, offset);
        if len == 0 {
            return Ok(());
        }
        let layout = self.layout.ok_or(DeviceError::ReadOnly)?;
        let object_size = layout.object_size;

        let blockno1 = offset / object_size;
        let block_offset1 = offset % object_size;
        let end = offset + len;
        let blockno2 = end / object_size;
        let block_len2 = end % object_size;

        if blockno1 == blockno2 {
            debug!("zero: {} bytes inside block {}", len, blockno1);
            return self.pwrite(&vec![0; len as usize], offset);
        }

        let mut blockno1 = blockno1;
        if block_offset1 != 0 {
            let fill = object_size - block_offset1;
            debug!("zero: last {} bytes of block {}", fill, blockno1);
            self.pwrite(&vec![0; fill as usize], offset)?;
            blockno1 += 1;
        }

        if block_len2 != 0 {
            debug!("zero: first {} bytes of block {}", block_len2, blockno2);
            self.pwrite(&vec![0; block_len2 as usize], object_size * blockno2)?;
        }

        self.delete_blocks(blockno1, blockno2)
    }

    /// Discards `len` bytes at `offset`. NBD semantics permit rounding the
    /// offset up and the length down to block alignment, so only wholly
    /// covered blocks are deleted and the edges keep their contents.
    pub fn trim(&self, len: u64, offset: u64) -> Result<(), DeviceError> {
        debug!("trim: len={}, offset={}", len, offset);
        if len == 0 {
            return Ok(());
        }
        let layout = self.layout.ok_or(DeviceError::ReadOnly)?;
        let object_size = layout.object_size;

        let mut blockno1 = offset / object_size;
        if offset % object_size != 0 {
            blockno1 += 1;
        }
        let blockno2 = (offset + len) / object_size;

        if blockno1 >= blockno2 {
            debug!("trim: nothing to delete");
            return Ok(());
        }

        self.delete_blocks(blockno1, blockno2)
    }

    /// Deletes blocks `first` (inclusive) to `last` (exclusive).
    ///
    /// Listing first avoids issuing deletions for objects that were never
    /// written; the fixed-width hex keys make the lexicographic bounds match
    /// the numeric block range.
    fn delete_blocks(&self, first: u64, last: u64) -> Result<(), DeviceError> {
        debug!("deleting blocks {} (inclusive) to {} (exclusive)", first, last);
        if first >= last {
            return Ok(());
        }

        let first_key = block_key(&self.key_prefix, first);
        let end_key = block_key(&self.key_prefix, last);
        let prefix = format!("{}/", self.key_prefix);

        let mut batch = Vec::new();
        for key in self
            .store
            .list_keys(&prefix, Some(&first_key), Some(&end_key))?
        {
            if key.as_str() >= end_key.as_str() {
                break;
            }
            batch.push(key);
            if batch.len() >= DELETE_BATCH {
                self.store.delete_batch(&batch, &mut ignore_missing)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.store.delete_batch(&batch, &mut ignore_missing)?;
        }
        Ok(())
    }
}

/// Bulk-delete error callback: an object already removed by a concurrent
/// operation is not an error.
fn ignore_missing(key: &str, err: &StoreError) {
    match err {
        StoreError::NotFound => {}
        err => warn!("failed to delete object {}: {}", key, err),
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;
    use std::sync::Arc;

    use crate::layout::Layout;
    use crate::multilock::MultiLock;
    use crate::store::mem::MemStore;
    use crate::store::ObjectStore;
    use super::{Device, DeviceError};

    const OBJECT_SIZE: u64 = 16;
    const DEVICE_SIZE: u64 = 320;
    const PREFIX: &str = "nbdkit_test";

    fn test_device() -> Device<MemStore> {
        Device::new(
            MemStore::default(),
            PREFIX.to_owned(),
            Some(Layout {
                object_size: OBJECT_SIZE,
                device_size: DEVICE_SIZE,
            }),
            Arc::new(MultiLock::new()),
        )
    }

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn object_count(device: &Device<MemStore>) -> usize {
        device
            .store
            .list_keys(&format!("{}/", PREFIX), None, None)
            .unwrap()
            .len()
    }

    /// Writes nonzero data to every block, mirroring it into `reference`.
    fn fill_device(device: &Device<MemStore>, reference: &mut [u8]) {
        for block_start in (0..DEVICE_SIZE).step_by(OBJECT_SIZE as usize) {
            let mut data = random_data(OBJECT_SIZE as usize);
            // Make "all zeros" impossible so zeroing is observable.
            data[0] |= 1;
            device.pwrite(&data, block_start).unwrap();
            let start = block_start as usize;
            reference[start..start + OBJECT_SIZE as usize].copy_from_slice(&data);
        }
    }

    fn compare_to_reference(device: &Device<MemStore>, reference: &[u8]) {
        for block_start in (0..DEVICE_SIZE).step_by(OBJECT_SIZE as usize) {
            let mut buf = vec![0; OBJECT_SIZE as usize];
            device.pread(&mut buf, block_start).unwrap();
            let start = block_start as usize;
            assert_eq!(
                buf,
                &reference[start..start + OBJECT_SIZE as usize],
                "mismatch at offset {} (block {})",
                block_start,
                block_start / OBJECT_SIZE,
            );
        }
    }

    /// Offsets and lengths around the interesting alignment boundaries.
    fn corner_cases() -> Vec<u64> {
        let bl = OBJECT_SIZE;
        vec![
            1,
            2,
            bl - 2,
            bl - 1,
            bl + 2,
            2 * bl - 1,
            2 * bl,
            2 * bl + 1,
            5 * bl - 5,
            5 * bl,
            5 * bl + 5,
        ]
    }

    #[test]
    fn test_single_block_unaligned_write() {
        let device = test_device();
        device.pwrite(b"ABCD", 5).unwrap();

        let mut buf = vec![0; 16];
        device.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, b"\0\0\0\0\0ABCD\0\0\0\0\0\0\0");
        assert_eq!(object_count(&device), 1);
    }

    #[test]
    fn test_head_edge_write() {
        let device = test_device();
        let data = random_data(20);
        device.pwrite(&data, 10).unwrap();

        // Blocks 0 and 1 were touched, nothing else.
        assert_eq!(object_count(&device), 2);

        let mut buf = vec![0; 32];
        device.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf[..10], &[0; 10]);
        assert_eq!(&buf[10..30], &data[..]);
        assert_eq!(&buf[30..], &[0; 2]);
    }

    #[test]
    fn test_head_tail_middle_write() {
        let device = test_device();
        let data = random_data(30);
        device.pwrite(&data, 10).unwrap();

        // Bytes 10..40: partial edges on blocks 0 and 2, block 1 written
        // whole.
        assert_eq!(object_count(&device), 3);

        let mut buf = vec![0; 48];
        device.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf[..10], &[0; 10]);
        assert_eq!(&buf[10..40], &data[..]);
        assert_eq!(&buf[40..], &[0; 8]);
    }

    #[test]
    fn test_sparse_read() {
        let device = test_device();
        let mut buf = vec![1; DEVICE_SIZE as usize];
        device.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![0; DEVICE_SIZE as usize]);
        assert_eq!(object_count(&device), 0);
    }

    #[test]
    fn test_read_after_write() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);
        compare_to_reference(&device, &reference);

        for offset in std::iter::once(0).chain(corner_cases()) {
            for len in corner_cases() {
                let mut buf = vec![0; len as usize];
                device.pread(&mut buf, offset).unwrap();
                assert_eq!(
                    buf,
                    &reference[offset as usize..(offset + len) as usize],
                    "read mismatch at offset={} len={}",
                    offset,
                    len,
                );
            }
        }
    }

    #[test]
    fn test_write_corner_cases() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);

        for offset in std::iter::once(0).chain(corner_cases()) {
            for len in corner_cases() {
                let data = random_data(len as usize);
                device.pwrite(&data, offset).unwrap();
                reference[offset as usize..(offset + len) as usize].copy_from_slice(&data);
                compare_to_reference(&device, &reference);
            }
        }
    }

    #[test]
    fn test_zero_corner_cases() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);

        let mut cases = corner_cases();
        cases.push(OBJECT_SIZE);
        for offset in std::iter::once(0).chain(cases.clone()) {
            for len in cases.clone() {
                device.zero(len, offset).unwrap();
                reference[offset as usize..(offset + len) as usize].fill(0);
                compare_to_reference(&device, &reference);

                // Refill so the next case starts from nonzero data.
                let data = random_data(len as usize);
                device.pwrite(&data, offset).unwrap();
                reference[offset as usize..(offset + len) as usize].copy_from_slice(&data);
            }
        }
    }

    #[test]
    fn test_zero_spanning_blocks() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);
        let before = object_count(&device);

        // Zero bytes 8..40: partial edges on blocks 0 and 2, block 1 wholly
        // covered and therefore deleted.
        device.zero(32, 8).unwrap();
        assert_eq!(object_count(&device), before - 1);

        reference[8..40].fill(0);
        compare_to_reference(&device, &reference);
    }

    #[test]
    fn test_zero_after_write() {
        let device = test_device();
        let data = random_data(40);
        device.pwrite(&data, 7).unwrap();
        device.zero(40, 7).unwrap();

        let mut buf = vec![1; 40];
        device.pread(&mut buf, 7).unwrap();
        assert_eq!(buf, vec![0; 40]);
    }

    #[test]
    fn test_trim_aligned() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);
        let before = object_count(&device);

        // Blocks 2 and 3 are wholly covered and must disappear.
        device.trim(32, 32).unwrap();
        assert_eq!(object_count(&device), before - 2);

        let mut buf = vec![1; 32];
        device.pread(&mut buf, 32).unwrap();
        assert_eq!(buf, vec![0; 32]);

        // Everything outside the trimmed range is untouched.
        reference[32..64].fill(0);
        compare_to_reference(&device, &reference);
    }

    #[test]
    fn test_trim_misaligned_deletes_nothing() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);
        let before = object_count(&device);

        // No block is wholly covered by (offset 1, len 30): the range rounds
        // to the empty block interval, so the contents stay readable.
        device.trim(30, 1).unwrap();
        assert_eq!(object_count(&device), before);
        compare_to_reference(&device, &reference);
    }

    #[test]
    fn test_trim_object_count() {
        let device = test_device();
        let mut reference = vec![0; DEVICE_SIZE as usize];
        fill_device(&device, &mut reference);

        for offset in std::iter::once(0).chain(corner_cases()) {
            for len in corner_cases() {
                let blockno1 = offset / OBJECT_SIZE;
                let block_offset1 = offset % OBJECT_SIZE;
                let blockno2 = (offset + len) / OBJECT_SIZE;

                let mut expected_deletions = blockno2 - blockno1;
                if block_offset1 != 0 && expected_deletions >= 1 {
                    expected_deletions -= 1;
                }

                let before = object_count(&device);
                device.trim(len, offset).unwrap();
                assert_eq!(
                    object_count(&device),
                    before - expected_deletions as usize,
                    "trim offset={} len={}",
                    offset,
                    len,
                );

                // Refill the trimmed range with data.
                let data = random_data(len as usize);
                device.pwrite(&data, offset).unwrap();
                reference[offset as usize..(offset + len) as usize].copy_from_slice(&data);
            }
        }
        compare_to_reference(&device, &reference);
    }

    #[test]
    fn test_whole_device_write() {
        let device = test_device();
        let data = random_data(DEVICE_SIZE as usize);
        device.pwrite(&data, 0).unwrap();
        assert_eq!(object_count(&device), (DEVICE_SIZE / OBJECT_SIZE) as usize);

        let mut buf = vec![0; DEVICE_SIZE as usize];
        device.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_size_configured() {
        assert_eq!(test_device().size().unwrap(), DEVICE_SIZE);
    }

    #[test]
    fn test_single_object_mode() {
        let store = MemStore::default();
        store.write_object(PREFIX, b"raw disk image contents").unwrap();

        let device = Device::new(
            store,
            PREFIX.to_owned(),
            None,
            Arc::new(MultiLock::new()),
        );
        assert_eq!(device.size().unwrap(), 23);

        let mut buf = vec![0; 8];
        device.pread(&mut buf, 4).unwrap();
        assert_eq!(buf, b"disk ima");

        assert!(matches!(
            device.pwrite(b"nope", 0),
            Err(DeviceError::ReadOnly),
        ));
        assert!(matches!(device.zero(4, 0), Err(DeviceError::ReadOnly)));
        assert!(matches!(device.trim(4, 0), Err(DeviceError::ReadOnly)));
    }

    #[test]
    fn test_single_object_mode_absent() {
        let device = Device::new(
            MemStore::default(),
            PREFIX.to_owned(),
            None,
            Arc::new(MultiLock::new()),
        );
        assert_eq!(device.size().unwrap(), 0);

        let mut buf = vec![1; 8];
        device.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![0; 8]);
    }

    #[test]
    fn test_concurrent_writes_same_block() {
        let device = Arc::new(test_device());
        let first = random_data(OBJECT_SIZE as usize);
        let second = random_data(OBJECT_SIZE as usize);

        let threads: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|data| {
                let device = device.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        // Unaligned, so every write is a locked RMW cycle.
                        device.pwrite(&data[1..], 1).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        // Last writer wins; any serial ordering ends on one of the two.
        let mut buf = vec![0; OBJECT_SIZE as usize - 1];
        device.pread(&mut buf, 1).unwrap();
        assert!(buf == first[1..] || buf == second[1..]);
    }
}
