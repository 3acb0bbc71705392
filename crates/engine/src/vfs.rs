//! A SQLite VFS serving one read-only database from a [`FileReader`].
//!
//! Only the main database file is virtual. Anything else SQLite asks for
//! (temporary files for sorting, mostly) is opened through the platform's
//! default VFS, which this one is a copy of.

use crate::error::{ErrorKind, Result};
use crate::reader::{FileReader, record_failure};
use exn::ResultExt;
use rusqlite::ffi;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{mem, ptr, slice};
use tracing::debug;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Reported sector size; the file is never written so only alignment matters.
const SECTOR_SIZE: c_int = 512;

struct VfsState {
    default: *mut ffi::sqlite3_vfs,
    reader: Arc<FileReader>,
}

/// Layout of an open main database file. SQLite allocates `szOsFile` bytes
/// and only ever looks at `base`.
#[repr(C)]
struct MainFile {
    base: ffi::sqlite3_file,
    reader: *const FileReader,
}

/// A registered VFS. Unregistered on drop, so it must outlive every
/// connection opened through it.
pub(crate) struct Registration {
    name: String,
    vfs: Box<ffi::sqlite3_vfs>,
    _c_name: CString,
    _state: Box<VfsState>,
}

// SAFETY: the raw pointers inside are only dereferenced by SQLite, which
// serialises VFS registration internally, and by the callbacks below, which
// only read immutable state or the thread-safe `FileReader`.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Registration {
    pub(crate) fn register(reader: Arc<FileReader>) -> Result<Self> {
        let name = format!("rangedb-{}-{}", std::process::id(), NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let c_name = CString::new(name.clone()).or_raise(|| ErrorKind::Vfs(format!("invalid VFS name {name:?}")))?;

        // SAFETY: a null name asks SQLite for the default VFS.
        let default = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
        if default.is_null() {
            exn::bail!(ErrorKind::Vfs("SQLite has no default VFS".to_string()));
        }
        let state = Box::new(VfsState { default, reader });

        // SAFETY: `default` is non-null and points at a VFS that stays
        // registered for the life of the process.
        let mut vfs = Box::new(unsafe { ptr::read(default) });
        vfs.szOsFile = vfs.szOsFile.max(mem::size_of::<MainFile>() as c_int);
        vfs.pNext = ptr::null_mut();
        vfs.zName = c_name.as_ptr();
        vfs.pAppData = ptr::from_ref::<VfsState>(&*state).cast_mut().cast();
        vfs.xOpen = Some(x_open);
        vfs.xDelete = Some(x_delete);
        vfs.xAccess = Some(x_access);
        vfs.xFullPathname = Some(x_full_pathname);

        // SAFETY: `vfs` and the strings it points to are boxed and live as long
        // as the registration.
        let rc = unsafe { ffi::sqlite3_vfs_register(&mut *vfs, 0) };
        if rc != ffi::SQLITE_OK {
            exn::bail!(ErrorKind::Vfs(format!("registering VFS {name} failed with code {rc}")));
        }
        debug!(vfs = %name, "registered VFS");
        Ok(Self { name, vfs, _c_name: c_name, _state: state })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // SAFETY: registered in `register`, and every connection using it has
        // been closed by now.
        unsafe {
            ffi::sqlite3_vfs_unregister(&mut *self.vfs);
        }
        debug!(vfs = %self.name, "unregistered VFS");
    }
}

// ====================================================================================================================
// VFS methods
// ====================================================================================================================

unsafe fn state<'a>(vfs: *mut ffi::sqlite3_vfs) -> &'a VfsState {
    // SAFETY: `pAppData` was set to a boxed `VfsState` that outlives the VFS.
    unsafe { &*(*vfs).pAppData.cast::<VfsState>() }
}

unsafe extern "C" fn x_open(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    // SAFETY: SQLite hands us our own VFS and a buffer of `szOsFile` bytes.
    unsafe {
        let state = state(vfs);
        if flags & ffi::SQLITE_OPEN_MAIN_DB == 0 {
            let default = state.default;
            return match (*default).xOpen {
                Some(open) => open(default, name, file, flags, out_flags),
                None => ffi::SQLITE_CANTOPEN,
            };
        }
        (*file).pMethods = ptr::null();
        if flags & ffi::SQLITE_OPEN_READWRITE != 0 {
            return ffi::SQLITE_CANTOPEN;
        }
        let main = file.cast::<MainFile>();
        (*main).reader = Arc::into_raw(Arc::clone(&state.reader));
        (*main).base.pMethods = &IO_METHODS;
        if !out_flags.is_null() {
            *out_flags = flags;
        }
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_delete(_vfs: *mut ffi::sqlite3_vfs, _name: *const c_char, _sync_dir: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_access(
    _vfs: *mut ffi::sqlite3_vfs,
    _name: *const c_char,
    _flags: c_int,
    out: *mut c_int,
) -> c_int {
    // No journal, WAL or lock file ever exists next to the virtual database.
    if !out.is_null() {
        // SAFETY: checked for null; SQLite passes a valid out-parameter.
        unsafe { *out = 0 };
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    out_len: c_int,
    out: *mut c_char,
) -> c_int {
    if name.is_null() || out.is_null() {
        return ffi::SQLITE_CANTOPEN;
    }
    // SAFETY: `name` is a NUL-terminated string and `out` holds `out_len` bytes.
    unsafe {
        let bytes = CStr::from_ptr(name).to_bytes_with_nul();
        if bytes.len() > usize::try_from(out_len).unwrap_or(0) {
            return ffi::SQLITE_CANTOPEN;
        }
        ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), out, bytes.len());
    }
    ffi::SQLITE_OK
}

// ====================================================================================================================
// File methods
// ====================================================================================================================

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_lock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

unsafe fn reader<'a>(file: *mut ffi::sqlite3_file) -> &'a FileReader {
    // SAFETY: only files opened by `x_open` use `IO_METHODS`, and their
    // reader stays alive until `x_close`.
    unsafe { &*(*file.cast::<MainFile>()).reader }
}

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    // SAFETY: the pointer came from `Arc::into_raw` in `x_open`.
    unsafe {
        let main = file.cast::<MainFile>();
        if !(*main).reader.is_null() {
            drop(Arc::from_raw((*main).reader));
            (*main).reader = ptr::null();
        }
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_read(file: *mut ffi::sqlite3_file, buf: *mut c_void, amount: c_int, offset: i64) -> c_int {
    let (Ok(len), Ok(offset)) = (usize::try_from(amount), u64::try_from(offset)) else {
        return ffi::SQLITE_IOERR_READ;
    };
    // SAFETY: SQLite provides a writable buffer of `amount` bytes.
    let (reader, out) = unsafe { (reader(file), slice::from_raw_parts_mut(buf.cast::<u8>(), len)) };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| reader.read_at(out, offset)));
    match outcome {
        Ok(Ok(read)) if read == len => ffi::SQLITE_OK,
        Ok(Ok(read)) => {
            // SQLite requires the unread tail to be zeroed.
            out[read..].fill(0);
            ffi::SQLITE_IOERR_SHORT_READ
        },
        Ok(Err(kind)) => {
            record_failure(kind);
            ffi::SQLITE_IOERR_READ
        },
        Err(_) => ffi::SQLITE_IOERR_READ,
    }
}

unsafe extern "C" fn x_write(_file: *mut ffi::sqlite3_file, _buf: *const c_void, _amount: c_int, _offset: i64) -> c_int {
    ffi::SQLITE_READONLY
}

unsafe extern "C" fn x_truncate(_file: *mut ffi::sqlite3_file, _size: i64) -> c_int {
    ffi::SQLITE_READONLY
}

unsafe extern "C" fn x_sync(_file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_size(file: *mut ffi::sqlite3_file, size: *mut i64) -> c_int {
    // SAFETY: see `reader`; `size` is a valid out-parameter.
    unsafe {
        *size = i64::try_from(reader(file).size()).unwrap_or(i64::MAX);
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_lock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_check_reserved_lock(_file: *mut ffi::sqlite3_file, out: *mut c_int) -> c_int {
    if !out.is_null() {
        // SAFETY: checked for null.
        unsafe { *out = 0 };
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_control(_file: *mut ffi::sqlite3_file, _op: c_int, _arg: *mut c_void) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn x_sector_size(_file: *mut ffi::sqlite3_file) -> c_int {
    SECTOR_SIZE
}

unsafe extern "C" fn x_device_characteristics(_file: *mut ffi::sqlite3_file) -> c_int {
    ffi::SQLITE_IOCAP_IMMUTABLE
}
