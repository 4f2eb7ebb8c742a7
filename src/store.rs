//! C-STORE receive sinks.
//!
//! Large C-STORE payloads are not buffered in memory: the reassembler asks
//! a [`StoreSinkProvider`] for a sink before the first dataset fragment and
//! streams fragments into it. The default provider stages the object in a
//! named temporary file, writing the synthesized file meta group first so
//! the staged file is a complete PS 3.10 object.
//!
//! Ownership is deliberately split: the temporary file owns the filesystem
//! entry, the sink borrows it for writing, and the finalized
//! [`SpilledObject`] keeps the entry alive until the last dataset clone is
//! dropped, which is after the C-STORE upcall returns.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::{
    dimse::{Dataset, FileMetaInformation},
    error::StoreError,
};

/// A staged object on disk, shared between the request dataset and the
/// upcall's [`DicomFile`].
#[derive(Debug)]
pub struct SpilledObject {
    path: PathBuf,
    dataset_offset: u64,
    _guard: Option<tempfile::TempPath>,
}

impl SpilledObject {
    /// Path of the staged file.
    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    /// Byte offset where the dataset starts, past preamble and file meta.
    #[must_use]
    pub fn dataset_offset(&self) -> u64 { self.dataset_offset }

    /// Read the dataset bytes back from disk.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the staged file.
    pub async fn read_dataset(&self) -> std::io::Result<Bytes> {
        let contents = tokio::fs::read(&self.path).await?;
        let len = contents.len();
        let offset = usize::try_from(self.dataset_offset).unwrap_or(len);
        Ok(Bytes::from(contents).slice(offset.min(len)..))
    }
}

/// A received composite object: synthesized meta plus the dataset payload.
#[derive(Clone, Debug)]
pub struct DicomFile {
    /// File meta information written ahead of the dataset.
    pub meta: FileMetaInformation,
    /// The dataset, readable from its spill file.
    pub dataset: Dataset,
}

impl DicomFile {
    /// Path of the staged file, when the object was spilled to disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> { self.dataset.spill_path() }
}

/// Write side of one in-flight C-STORE reception.
#[async_trait]
pub trait StoreSink: Send {
    /// Append dataset fragment bytes.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Close the sink and produce the received object.
    ///
    /// Returning `Ok(None)` opts out of supplying a parsed file; the
    /// C-STORE upcall then receives the bare request.
    async fn finalize(self: Box<Self>) -> Result<Option<DicomFile>, StoreError>;

    /// Name of the backing file, for the exception hook.
    fn filename(&self) -> Option<PathBuf> { None }
}

/// Factory for C-STORE receive sinks.
#[async_trait]
pub trait StoreSinkProvider: Send + Sync {
    /// Open a sink for one incoming object described by `meta`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the sink cannot be provisioned.
    async fn create_sink(&self, meta: FileMetaInformation) -> Result<Box<dyn StoreSink>, StoreError>;

    /// Called when reception or finalization of an object failed.
    ///
    /// The association stays open; the peer receives a `ProcessingFailure`
    /// C-STORE response.
    async fn on_store_exception(&self, filename: Option<&Path>, error: &StoreError) {
        log::warn!(
            "C-STORE reception failed for {:?}: {error}",
            filename.map(Path::display).map(|d| d.to_string())
        );
    }
}

/// Default provider staging objects in named temporary files.
#[derive(Clone, Debug, Default)]
pub struct TempFileStoreProvider {
    /// Directory for staged files; the system default when `None`.
    pub directory: Option<PathBuf>,
}

#[async_trait]
impl StoreSinkProvider for TempFileStoreProvider {
    async fn create_sink(
        &self,
        meta: FileMetaInformation,
    ) -> Result<Box<dyn StoreSink>, StoreError> {
        let named = match &self.directory {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };
        let (file, path) = named.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let header = meta.encode();
        file.write_all(&header).await?;
        Ok(Box::new(TempFileSink {
            meta,
            file,
            path,
            dataset_offset: header.len() as u64,
        }))
    }
}

struct TempFileSink {
    meta: FileMetaInformation,
    file: tokio::fs::File,
    path: tempfile::TempPath,
    dataset_offset: u64,
}

#[async_trait]
impl StoreSink for TempFileSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.file.write_all(bytes).await?;
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<Option<DicomFile>, StoreError> {
        let Self {
            meta,
            mut file,
            path,
            dataset_offset,
        } = *self;
        file.flush().await?;
        let written = file.metadata().await?.len();
        // The write handle closes here; the TempPath keeps the file alive.
        drop(file);
        if written < dataset_offset {
            return Err(StoreError::Parse {
                reason: "staged object is shorter than its file meta group".to_string(),
            });
        }
        let object = Arc::new(SpilledObject {
            path: path.to_path_buf(),
            dataset_offset,
            _guard: Some(path),
        });
        let transfer_syntax = meta.transfer_syntax_uid.clone();
        Ok(Some(DicomFile {
            meta,
            dataset: Dataset::spilled(transfer_syntax, object),
        }))
    }

    fn filename(&self) -> Option<PathBuf> { Some(self.path.to_path_buf()) }
}
