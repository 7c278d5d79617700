//! Object-store backed implementation of the [`Storage`] contract.
//!
//! ## Object Layout
//!
//! ```text
//! segments/{name}    segment bytes, one object per segment
//! sealed/{name}      zero-byte marker, present iff the segment is sealed
//! meta/epoch         decimal container epoch, the fencing marker
//! ```
//!
//! Appends are read-modify-write: the current object is fetched, the new
//! bytes appended, and the whole object put back. That keeps the backend
//! requirements down to plain get/put/delete, which every `ObjectStore`
//! implementation provides. The storage writer batches aggressively before
//! flushing, so the rewrite cost is paid per flush, not per append.
//!
//! ## Fencing
//!
//! `initialize(epoch)` refuses to claim the backend when `meta/epoch` holds
//! a higher epoch, and every mutating call re-reads the marker before
//! touching data. A claim that lands between the marker check and the data
//! put is not detected; the marker narrows the zombie window, it does not
//! close it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode};
use tracing::{debug, info};

use segvault_core::{Error, Result};

use crate::{SegmentWriteHandle, Storage, StorageSegmentInfo};

// ============================================================================
// ObjectStorage
// ============================================================================

/// [`Storage`] over any `object_store::ObjectStore`.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    /// Epoch this instance was initialized with; 0 means not yet initialized.
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn segment_path(name: &str) -> Path {
        Path::from(format!("segments/{name}"))
    }

    fn seal_path(name: &str) -> Path {
        Path::from(format!("sealed/{name}"))
    }

    fn epoch_path() -> Path {
        Path::from("meta/epoch")
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ObjectClosed {
                name: "storage".to_string(),
            });
        }
        Ok(())
    }

    /// Reads the fencing marker, if present.
    async fn stored_epoch(&self) -> Result<Option<u64>> {
        match self.store.get(&Self::epoch_path()).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| Error::Storage(format!("bad epoch marker: {e}")))?;
                let epoch = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| Error::Storage(format!("bad epoch marker: {e}")))?;
                Ok(Some(epoch))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Fails unless this instance has been initialized and still owns the
    /// fencing marker. Called before every mutation.
    async fn check_fenced(&self) -> Result<()> {
        let ours = self.epoch.load(Ordering::Acquire);
        if ours == 0 {
            return Err(Error::InvalidOperation(
                "storage has not been initialized".to_string(),
            ));
        }
        if let Some(stored) = self.stored_epoch().await? {
            if stored > ours {
                return Err(Error::Storage(format!(
                    "storage instance with epoch {ours} fenced out by epoch {stored}"
                )));
            }
        }
        Ok(())
    }

    async fn is_sealed(&self, name: &str) -> Result<bool> {
        match self.store.head(&Self::seal_path(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Fetches the full segment object. `SegmentNotFound` if absent.
    async fn fetch(&self, name: &str) -> Result<Bytes> {
        match self.store.get(&Self::segment_path(name)).await {
            Ok(result) => result.bytes().await.map_err(|e| Error::Storage(e.to_string())),
            Err(object_store::Error::NotFound { .. }) => {
                Err(Error::SegmentNotFound(name.to_string()))
            }
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl Storage for ObjectStorage {
    async fn initialize(&self, epoch: u64) -> Result<()> {
        self.check_closed()?;
        if epoch == 0 {
            return Err(Error::InvalidOperation(
                "storage epoch must be positive".to_string(),
            ));
        }
        if let Some(stored) = self.stored_epoch().await? {
            if stored > epoch {
                return Err(Error::Storage(format!(
                    "storage instance with epoch {epoch} fenced out by epoch {stored}"
                )));
            }
        }
        self.store
            .put(&Self::epoch_path(), epoch.to_string().into_bytes().into())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.epoch.store(epoch, Ordering::Release);
        info!(epoch, "Storage initialized");
        Ok(())
    }

    async fn create(&self, name: &str) -> Result<StorageSegmentInfo> {
        self.check_closed()?;
        self.check_fenced().await?;
        let result = self
            .store
            .put_opts(
                &Self::segment_path(name),
                Bytes::new().into(),
                PutMode::Create.into(),
            )
            .await;
        match result {
            Ok(_) => {
                debug!(segment = %name, "Created storage segment");
                Ok(StorageSegmentInfo {
                    name: name.to_string(),
                    length: 0,
                    sealed: false,
                })
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(Error::SegmentExists(name.to_string()))
            }
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn open_write(&self, name: &str) -> Result<SegmentWriteHandle> {
        self.check_closed()?;
        self.check_fenced().await?;
        if !self.exists(name).await? {
            return Err(Error::SegmentNotFound(name.to_string()));
        }
        Ok(SegmentWriteHandle::new(name))
    }

    async fn write(&self, handle: &SegmentWriteHandle, offset: u64, data: Bytes) -> Result<()> {
        self.check_closed()?;
        self.check_fenced().await?;
        if self.is_sealed(&handle.name).await? {
            return Err(Error::InvalidOperation(format!(
                "segment '{}' is sealed",
                handle.name
            )));
        }
        let existing = self.fetch(&handle.name).await?;
        if existing.len() as u64 != offset {
            return Err(Error::Storage(format!(
                "write offset {offset} does not match length {} of '{}'",
                existing.len(),
                handle.name
            )));
        }
        let mut combined = BytesMut::with_capacity(existing.len() + data.len());
        combined.extend_from_slice(&existing);
        combined.extend_from_slice(&data);
        let new_length = combined.len();
        self.store
            .put(&Self::segment_path(&handle.name), combined.freeze().into())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        debug!(segment = %handle.name, offset, bytes = data.len(), new_length, "Wrote segment bytes");
        Ok(())
    }

    async fn seal(&self, handle: &SegmentWriteHandle) -> Result<()> {
        self.check_closed()?;
        self.check_fenced().await?;
        if !self.exists(&handle.name).await? {
            return Err(Error::SegmentNotFound(handle.name.clone()));
        }
        self.store
            .put(&Self::seal_path(&handle.name), Bytes::new().into())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        debug!(segment = %handle.name, "Sealed storage segment");
        Ok(())
    }

    async fn concat(
        &self,
        target: &SegmentWriteHandle,
        offset: u64,
        source_name: &str,
    ) -> Result<()> {
        self.check_closed()?;
        self.check_fenced().await?;
        if !self.is_sealed(source_name).await? {
            return Err(Error::InvalidOperation(format!(
                "cannot concat unsealed segment '{source_name}'"
            )));
        }
        if self.is_sealed(&target.name).await? {
            return Err(Error::InvalidOperation(format!(
                "cannot concat into sealed segment '{}'",
                target.name
            )));
        }
        let source = self.fetch(source_name).await?;
        let existing = self.fetch(&target.name).await?;
        if existing.len() as u64 != offset {
            return Err(Error::Storage(format!(
                "concat offset {offset} does not match length {} of '{}'",
                existing.len(),
                target.name
            )));
        }
        let mut combined = BytesMut::with_capacity(existing.len() + source.len());
        combined.extend_from_slice(&existing);
        combined.extend_from_slice(&source);
        self.store
            .put(&Self::segment_path(&target.name), combined.freeze().into())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.store
            .delete(&Self::segment_path(source_name))
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match self.store.delete(&Self::seal_path(source_name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
        info!(
            target = %target.name,
            source = %source_name,
            offset,
            bytes = source.len(),
            "Concatenated storage segments"
        );
        Ok(())
    }

    async fn delete(&self, handle: &SegmentWriteHandle) -> Result<()> {
        self.check_closed()?;
        self.check_fenced().await?;
        // Some backends treat deleting a missing key as success; check
        // existence first so a double delete reports the segment missing.
        match self.store.head(&Self::segment_path(&handle.name)).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::SegmentNotFound(handle.name.clone()));
            }
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
        match self.store.delete(&Self::segment_path(&handle.name)).await {
            Ok(()) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::SegmentNotFound(handle.name.clone()));
            }
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
        match self.store.delete(&Self::seal_path(&handle.name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
        debug!(segment = %handle.name, "Deleted storage segment");
        Ok(())
    }

    async fn read_range(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.check_closed()?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        let range = offset as usize..(offset + length) as usize;
        match self.store.get_range(&Self::segment_path(name), range).await {
            Ok(bytes) => Ok(bytes),
            Err(object_store::Error::NotFound { .. }) => {
                Err(Error::SegmentNotFound(name.to_string()))
            }
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn get_info(&self, name: &str) -> Result<StorageSegmentInfo> {
        self.check_closed()?;
        let meta = match self.store.head(&Self::segment_path(name)).await {
            Ok(meta) => meta,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::SegmentNotFound(name.to_string()));
            }
            Err(e) => return Err(Error::Storage(e.to_string())),
        };
        let sealed = self.is_sealed(name).await?;
        Ok(StorageSegmentInfo {
            name: name.to_string(),
            length: meta.size as u64,
            sealed,
        })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        self.check_closed()?;
        match self.store.head(&Self::segment_path(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn storage() -> ObjectStorage {
        ObjectStorage::new(Arc::new(InMemory::new()))
    }

    async fn initialized() -> ObjectStorage {
        let s = storage();
        s.initialize(1).await.unwrap();
        s
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let s = initialized().await;
        let info = s.create("vault/seg-0").await.unwrap();
        assert_eq!(info.length, 0);
        assert!(!info.sealed);

        let handle = s.open_write("vault/seg-0").await.unwrap();
        s.write(&handle, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        s.write(&handle, 6, Bytes::from_static(b"world"))
            .await
            .unwrap();

        let info = s.get_info("vault/seg-0").await.unwrap();
        assert_eq!(info.length, 11);

        let bytes = s.read_range("vault/seg-0", 6, 5).await.unwrap();
        assert_eq!(&bytes[..], b"world");
    }

    #[tokio::test]
    async fn test_create_is_atomic() {
        let s = initialized().await;
        s.create("seg").await.unwrap();
        let err = s.create("seg").await.unwrap_err();
        assert!(matches!(err, Error::SegmentExists(_)));
    }

    #[tokio::test]
    async fn test_write_at_wrong_offset_rejected() {
        let s = initialized().await;
        s.create("seg").await.unwrap();
        let handle = s.open_write("seg").await.unwrap();
        s.write(&handle, 0, Bytes::from_static(b"abc")).await.unwrap();

        let err = s.write(&handle, 1, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        // Nothing was appended.
        assert_eq!(s.get_info("seg").await.unwrap().length, 3);
    }

    #[tokio::test]
    async fn test_seal_blocks_writes() {
        let s = initialized().await;
        s.create("seg").await.unwrap();
        let handle = s.open_write("seg").await.unwrap();
        s.write(&handle, 0, Bytes::from_static(b"data")).await.unwrap();
        s.seal(&handle).await.unwrap();
        // Idempotent.
        s.seal(&handle).await.unwrap();

        assert!(s.get_info("seg").await.unwrap().sealed);
        let err = s
            .write(&handle, 4, Bytes::from_static(b"more"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_concat_moves_source_into_target() {
        let s = initialized().await;
        s.create("target").await.unwrap();
        s.create("source").await.unwrap();
        let target = s.open_write("target").await.unwrap();
        let source = s.open_write("source").await.unwrap();
        s.write(&target, 0, Bytes::from_static(b"left|")).await.unwrap();
        s.write(&source, 0, Bytes::from_static(b"right")).await.unwrap();
        s.seal(&source).await.unwrap();

        s.concat(&target, 5, "source").await.unwrap();

        let info = s.get_info("target").await.unwrap();
        assert_eq!(info.length, 10);
        let bytes = s.read_range("target", 0, 10).await.unwrap();
        assert_eq!(&bytes[..], b"left|right");
        assert!(!s.exists("source").await.unwrap());
    }

    #[tokio::test]
    async fn test_concat_requires_sealed_source() {
        let s = initialized().await;
        s.create("target").await.unwrap();
        s.create("source").await.unwrap();
        let target = s.open_write("target").await.unwrap();

        let err = s.concat(&target, 0, "source").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(s.exists("source").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_segment_and_marker() {
        let s = initialized().await;
        s.create("seg").await.unwrap();
        let handle = s.open_write("seg").await.unwrap();
        s.seal(&handle).await.unwrap();
        s.delete(&handle).await.unwrap();

        assert!(!s.exists("seg").await.unwrap());
        let err = s.get_info("seg").await.unwrap_err();
        assert!(matches!(err, Error::SegmentNotFound(_)));
        // A second delete reports the segment missing.
        let err = s.delete(&handle).await.unwrap_err();
        assert!(matches!(err, Error::SegmentNotFound(_)));
    }

    #[tokio::test]
    async fn test_lower_epoch_is_fenced_out() {
        let backend: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let first = ObjectStorage::new(Arc::clone(&backend));
        let second = ObjectStorage::new(Arc::clone(&backend));

        first.initialize(1).await.unwrap();
        first.create("seg").await.unwrap();
        let handle = first.open_write("seg").await.unwrap();

        // A later instance claims the backend with a higher epoch.
        second.initialize(2).await.unwrap();

        let err = first
            .write(&handle, 0, Bytes::from_static(b"stale"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fenced"));

        // Re-initializing with a stale epoch fails outright.
        let third = ObjectStorage::new(backend);
        let err = third.initialize(1).await.unwrap_err();
        assert!(err.to_string().contains("fenced"));
    }

    #[tokio::test]
    async fn test_mutations_require_initialize() {
        let s = storage();
        let err = s.create("seg").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_reads_work_without_initialize() {
        let backend: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let writer = ObjectStorage::new(Arc::clone(&backend));
        writer.initialize(1).await.unwrap();
        writer.create("seg").await.unwrap();
        let handle = writer.open_write("seg").await.unwrap();
        writer.write(&handle, 0, Bytes::from_static(b"bytes")).await.unwrap();

        // A fresh, uninitialized instance can still serve reads.
        let reader = ObjectStorage::new(backend);
        assert!(reader.exists("seg").await.unwrap());
        assert_eq!(reader.get_info("seg").await.unwrap().length, 5);
        assert_eq!(
            &reader.read_range("seg", 0, 5).await.unwrap()[..],
            b"bytes"
        );
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_everything() {
        let s = initialized().await;
        s.create("seg").await.unwrap();
        s.close();
        let err = s.get_info("seg").await.unwrap_err();
        assert!(matches!(err, Error::ObjectClosed { .. }));
    }
}
