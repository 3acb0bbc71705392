//! The bytes behind the virtual database file.

use crate::error::{ErrorKind, Result};
use bytes::Bytes;
use rangedb_fetch::FileVersion;
use rangedb_pages::error::ErrorKind as PageErrorKind;
use rangedb_pages::{Lease, PageCache};
use std::cell::RefCell;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Handle;

/// Where the database file's bytes come from.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Pages fetched on demand through the page cache.
    Paged(PageCache),
    /// The complete file, already in memory.
    Whole(Bytes),
}

impl Backing {
    pub fn size(&self) -> u64 {
        match self {
            Self::Paged(cache) => cache.file_size(),
            Self::Whole(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, Self::Paged(_))
    }
}

/// Per-job context for page reads made on a worker thread.
struct JobScope {
    version: FileVersion,
    lease: Option<Lease>,
    failure: Option<PageErrorKind>,
}

thread_local! {
    static SCOPE: RefCell<Option<JobScope>> = const { RefCell::new(None) };
}

/// Installs a [`JobScope`] on the current thread for as long as it lives.
pub(crate) struct ScopeGuard(());

impl ScopeGuard {
    /// The first page failure seen during this job, if any.
    pub(crate) fn take_failure(&self) -> Option<PageErrorKind> {
        SCOPE.with_borrow_mut(|scope| scope.as_mut().and_then(|scope| scope.failure.take()))
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        // Dropping the scope releases the lease and with it every pinned page.
        SCOPE.with_borrow_mut(Option::take);
    }
}

pub(crate) fn record_failure(kind: PageErrorKind) {
    SCOPE.with_borrow_mut(|scope| {
        if let Some(scope) = scope
            && scope.failure.is_none()
        {
            scope.failure = Some(kind);
        }
    });
}

/// Serves reads of the main database file for every connection of one engine.
///
/// Reads happen on SQL worker threads, which block on the async page cache
/// through the runtime handle captured at startup.
pub(crate) struct FileReader {
    backing: RwLock<Backing>,
    version: FileVersion,
    handle: Handle,
}

impl FileReader {
    pub(crate) fn new(backing: Backing, version: FileVersion, handle: Handle) -> Self {
        Self { backing: RwLock::new(backing), version, handle }
    }

    pub(crate) fn backing(&self) -> Backing {
        self.backing.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn size(&self) -> u64 {
        self.backing().size()
    }

    pub(crate) fn swap(&self, backing: Backing) -> Result<()> {
        let mut current = self.backing.write().unwrap_or_else(PoisonError::into_inner);
        if current.size() != backing.size() {
            exn::bail!(ErrorKind::Vfs(format!(
                "replacement backing is {} bytes, database is {} bytes",
                backing.size(),
                current.size()
            )));
        }
        *current = backing;
        Ok(())
    }

    /// Start a job on the current thread. Page reads stop issuing new fetches
    /// once `cancelled` is set.
    pub(crate) fn enter(&self, cancelled: Arc<AtomicBool>) -> ScopeGuard {
        let lease = match self.backing() {
            Backing::Paged(cache) => Some(cache.lease(cancelled)),
            Backing::Whole(_) => None,
        };
        let scope = JobScope { version: self.version.clone(), lease, failure: None };
        SCOPE.with_borrow_mut(|slot| *slot = Some(scope));
        ScopeGuard(())
    }

    /// Fill `buf` from `offset`, returning how many bytes exist there.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> std::result::Result<usize, PageErrorKind> {
        match self.backing() {
            Backing::Whole(bytes) => {
                let start = offset.min(bytes.len() as u64) as usize;
                let available = &bytes[start..];
                let len = available.len().min(buf.len());
                buf[..len].copy_from_slice(&available[..len]);
                Ok(len)
            },
            Backing::Paged(cache) => SCOPE.with_borrow(|scope| {
                let (version, lease) = match scope {
                    Some(scope) => (&scope.version, scope.lease.as_ref()),
                    None => (&self.version, None),
                };
                let data = self
                    .handle
                    .block_on(cache.read(offset, buf.len(), version, lease))
                    .map_err(|err| (*err).clone())?;
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }),
        }
    }
}
