//! Local filesystem range source.
//!
//! Serves a database file straight from disk via `tokio::fs`. Useful for
//! development and for deployments where the dataset sits on a network mount.

use crate::error::{ErrorKind, Result};
use crate::models::{Descriptor, FileVersion, SourceInfo};
use crate::source::RangeSource;
use async_trait::async_trait;
use bytes::Bytes;
use exn::ResultExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Range source reading from a file on local disk.
///
/// # Examples
///
/// ```no_run
/// use rangedb_fetch::LocalSource;
///
/// let source = LocalSource::new("/srv/data/records.sqlite3");
/// ```
#[derive(Debug, Clone)]
pub struct LocalSource {
    name: String,
    path: PathBuf,
    descriptor: Option<PathBuf>,
}

impl LocalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { name: "local".to_string(), path: path.into(), descriptor: None }
    }

    pub fn with_descriptor(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor = Some(path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_io_error(err: std::io::Error, path: &Path) -> exn::Exn<ErrorKind> {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.display().to_string()),
            std::io::ErrorKind::UnexpectedEof => {
                ErrorKind::Integrity(format!("{} is shorter than expected", path.display()))
            },
            _ => ErrorKind::Network(format!("{}: {err}", path.display())),
        };
        exn::Exn::from(err).raise(kind)
    }

    fn version_of(&self, metadata: &std::fs::Metadata) -> Result<FileVersion> {
        let modified: OffsetDateTime = metadata.modified().map_err(|err| Self::map_io_error(err, &self.path))?.into();
        Ok(FileVersion::new(format!("{}-{}", metadata.len(), modified.unix_timestamp_nanos())))
    }

    async fn check_version(&self, version: &FileVersion) -> Result<()> {
        let metadata = fs::metadata(&self.path).await.map_err(|err| Self::map_io_error(err, &self.path))?;
        let current = self.version_of(&metadata)?;
        // Descriptor-derived versions cannot be recomputed cheaply from
        // metadata, so only reject versions this source would have produced.
        if self.descriptor.is_none() && current != *version {
            exn::bail!(ErrorKind::Integrity(format!("{} changed on disk", self.path.display())));
        }
        Ok(())
    }
}

#[async_trait]
impl RangeSource for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<SourceInfo> {
        let metadata = fs::metadata(&self.path).await.map_err(|err| Self::map_io_error(err, &self.path))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(self.path.display().to_string()));
        }
        let mut version = self.version_of(&metadata)?;
        let descriptor = match &self.descriptor {
            Some(path) => {
                let raw = fs::read(path).await.map_err(|err| Self::map_io_error(err, path))?;
                let descriptor: Descriptor = serde_json::from_slice(&raw)
                    .or_raise(|| ErrorKind::Integrity(format!("malformed descriptor at {}", path.display())))?;
                if let Some(hash) = &descriptor.hash {
                    version = FileVersion::new(hash.clone());
                }
                Some(descriptor)
            },
            None => None,
        };
        Ok(SourceInfo { size: metadata.len(), version, accepts_ranges: true, descriptor })
    }

    async fn read_range(&self, offset: u64, length: u64, version: &FileVersion) -> Result<Bytes> {
        self.check_version(version).await?;
        let mut file = fs::File::open(&self.path).await.map_err(|err| Self::map_io_error(err, &self.path))?;
        file.seek(SeekFrom::Start(offset)).await.map_err(|err| Self::map_io_error(err, &self.path))?;
        let length = usize::try_from(length).or_raise(|| ErrorKind::InvalidRequest(format!("length {length}")))?;
        let mut buffer = vec![0; length];
        file.read_exact(&mut buffer).await.map_err(|err| Self::map_io_error(err, &self.path))?;
        Ok(Bytes::from(buffer))
    }

    async fn read_all(&self, version: &FileVersion) -> Result<Bytes> {
        self.check_version(version).await?;
        let data = fs::read(&self.path).await.map_err(|err| Self::map_io_error(err, &self.path))?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_probe_reports_size_and_ranges() {
        let file = file_with(b"0123456789");
        let info = LocalSource::new(file.path()).probe().await.unwrap();
        assert_eq!(info.size, 10);
        assert!(info.accepts_ranges);
        assert!(info.descriptor.is_none());
    }

    #[tokio::test]
    async fn test_read_range() {
        let file = file_with(b"0123456789");
        let source = LocalSource::new(file.path());
        let info = source.probe().await.unwrap();
        let bytes = source.read_range(3, 4, &info.version).await.unwrap();
        assert_eq!(&bytes[..], b"3456");
    }

    #[tokio::test]
    async fn test_read_past_end_is_integrity_error() {
        let file = file_with(b"0123");
        let source = LocalSource::new(file.path());
        let info = source.probe().await.unwrap();
        let err = source.read_range(2, 8, &info.version).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::Integrity(_)));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalSource::new(dir.path().join("absent.db")).probe().await.unwrap_err();
        assert!(matches!(*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let file = file_with(b"0123456789");
        let source = LocalSource::new(file.path());
        let err = source.read_range(0, 2, &FileVersion::new("10-0")).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::Integrity(_)));
    }

    #[tokio::test]
    async fn test_descriptor_hash_becomes_version() {
        let file = file_with(b"0123456789");
        let descriptor = file_with(br#"{"size": 10, "hash": "feedface", "page_size": 4096}"#);
        let source = LocalSource::new(file.path()).with_descriptor(descriptor.path());
        let info = source.probe().await.unwrap();
        assert_eq!(info.version.as_str(), "feedface");
        assert_eq!(info.descriptor.unwrap().page_size, Some(4096));
        assert_eq!(&source.read_all(&info.version).await.unwrap()[..], b"0123456789");
    }
}
