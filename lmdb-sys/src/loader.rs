//! Discovery and dynamic resolution of `liblmdb`.
//!
//! The LMDB C ABI is never linked at build time. Instead, the shared library is opened
//! with [`libloading`] the first time it is needed and every exported symbol the core
//! uses is resolved once, eagerly, into a function-pointer table. Keeping the [`Library`]
//! alive for the lifetime of the process (inside a `OnceCell`) is what makes it sound to
//! hand out the resolved symbols as plain `'static` function pointers.

use std::env;
use std::ffi::c_int;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use libc::c_char;
use libloading::{Library, Symbol};

use crate::raw::*;

/// The environment variable consulted first when resolving `liblmdb`.
pub const LMDB_LIB_ENV_VAR: &str = "KONSERVE_LMDB_LIB";

/// Conventional per-platform install locations tried after the environment variable and
/// the configured override, before falling back to a bare library name for the OS loader.
#[cfg(target_os = "linux")]
const CONVENTIONAL_PATHS: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/liblmdb.so",
    "/usr/lib/liblmdb.so",
    "/usr/lib64/liblmdb.so",
    "/usr/local/lib/liblmdb.so",
];
#[cfg(target_os = "macos")]
const CONVENTIONAL_PATHS: &[&str] =
    &["/usr/local/lib/liblmdb.dylib", "/opt/homebrew/lib/liblmdb.dylib"];
#[cfg(target_os = "windows")]
const CONVENTIONAL_PATHS: &[&str] = &["C:\\liblmdb\\lmdb.dll"];
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const CONVENTIONAL_PATHS: &[&str] = &[];

#[cfg(target_os = "windows")]
const BARE_LIBRARY_NAME: &str = "lmdb.dll";
#[cfg(target_os = "macos")]
const BARE_LIBRARY_NAME: &str = "liblmdb.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const BARE_LIBRARY_NAME: &str = "liblmdb.so";

/// A configurable override consulted between the environment variable and the
/// conventional paths list, analogous to a system property in the original
/// implementation. Set once via [`set_library_path_override`] before the first call
/// that touches the environment.
static LIBRARY_PATH_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

/// Configure a fallback path consulted before the conventional per-platform paths.
///
/// Has no effect if `liblmdb` was already resolved (or an override was already set) in
/// this process.
pub fn set_library_path_override(path: impl Into<PathBuf>) {
    let _ = LIBRARY_PATH_OVERRIDE.set(path.into());
}

/// Failure to resolve and load `liblmdb` through any of the discovery steps.
#[derive(Debug)]
pub struct LibraryLoadError {
    pub attempted: Vec<PathBuf>,
    pub last_error: String,
}

impl fmt::Display for LibraryLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not load liblmdb; tried {} location(s): {}; last error: {}",
            self.attempted.len(),
            self.attempted.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "),
            self.last_error
        )
    }
}

impl std::error::Error for LibraryLoadError {}

macro_rules! symbol {
    ($lib:expr, $name:literal, $ty:ty, $attempted:expr) => {{
        let sym: Symbol<'_, $ty> = unsafe {
            $lib.get($name).map_err(|e| LibraryLoadError {
                attempted: $attempted.clone(),
                last_error: format!("missing symbol {}: {e}", String::from_utf8_lossy($name)),
            })?
        };
        // `Symbol` borrows from `lib`, which is pinned for the process lifetime inside
        // `LIBRARY`, so copying the raw function pointer out of it is sound.
        *sym
    }};
}

type FnEnvCreate = unsafe extern "C" fn(*mut mdb_env_ptr) -> c_int;
type FnEnvOpen = unsafe extern "C" fn(mdb_env_ptr, *const c_char, u32, mdb_mode_t) -> c_int;
type FnEnvClose = unsafe extern "C" fn(mdb_env_ptr);
type FnEnvSetMapsize = unsafe extern "C" fn(mdb_env_ptr, usize) -> c_int;
type FnEnvSetMaxdbs = unsafe extern "C" fn(mdb_env_ptr, u32) -> c_int;
type FnEnvSetMaxreaders = unsafe extern "C" fn(mdb_env_ptr, u32) -> c_int;
type FnEnvSync = unsafe extern "C" fn(mdb_env_ptr, c_int) -> c_int;
type FnEnvCopyfd2 = unsafe extern "C" fn(mdb_env_ptr, mdb_filehandle_t, u32) -> c_int;
type FnTxnBegin = unsafe extern "C" fn(mdb_env_ptr, mdb_txn_ptr, u32, *mut mdb_txn_ptr) -> c_int;
type FnTxnCommit = unsafe extern "C" fn(mdb_txn_ptr) -> c_int;
type FnTxnAbort = unsafe extern "C" fn(mdb_txn_ptr);
type FnDbiOpen = unsafe extern "C" fn(mdb_txn_ptr, *const c_char, u32, *mut MDB_dbi) -> c_int;
type FnGet = unsafe extern "C" fn(mdb_txn_ptr, MDB_dbi, *const MDB_val, *mut MDB_val) -> c_int;
type FnPut =
    unsafe extern "C" fn(mdb_txn_ptr, MDB_dbi, *const MDB_val, *mut MDB_val, u32) -> c_int;
type FnDel = unsafe extern "C" fn(mdb_txn_ptr, MDB_dbi, *const MDB_val, *const MDB_val) -> c_int;
type FnCursorOpen = unsafe extern "C" fn(mdb_txn_ptr, MDB_dbi, *mut mdb_cursor_ptr) -> c_int;
type FnCursorClose = unsafe extern "C" fn(mdb_cursor_ptr);
type FnCursorGet =
    unsafe extern "C" fn(mdb_cursor_ptr, *mut MDB_val, *mut MDB_val, MDB_cursor_op) -> c_int;
type FnStrerror = unsafe extern "C" fn(c_int) -> *const c_char;

/// The resolved, typed entry points into `liblmdb` that the core calls through.
///
/// Every field is a plain function pointer captured once at load time; none of them
/// borrow the [`Library`] directly, which is what lets [`api`] hand out a `'static`
/// reference while the backing `dlopen` handle lives for the rest of the process.
pub struct LmdbApi {
    pub mdb_env_create: FnEnvCreate,
    pub mdb_env_open: FnEnvOpen,
    pub mdb_env_close: FnEnvClose,
    pub mdb_env_set_mapsize: FnEnvSetMapsize,
    pub mdb_env_set_maxdbs: FnEnvSetMaxdbs,
    pub mdb_env_set_maxreaders: FnEnvSetMaxreaders,
    pub mdb_env_sync: FnEnvSync,
    pub mdb_env_copyfd2: FnEnvCopyfd2,
    pub mdb_txn_begin: FnTxnBegin,
    pub mdb_txn_commit: FnTxnCommit,
    pub mdb_txn_abort: FnTxnAbort,
    pub mdb_dbi_open: FnDbiOpen,
    pub mdb_get: FnGet,
    pub mdb_put: FnPut,
    pub mdb_del: FnDel,
    pub mdb_cursor_open: FnCursorOpen,
    pub mdb_cursor_close: FnCursorClose,
    pub mdb_cursor_get: FnCursorGet,
    pub mdb_strerror: FnStrerror,
}

unsafe impl Send for LmdbApi {}
unsafe impl Sync for LmdbApi {}

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(from_env) = env::var(LMDB_LIB_ENV_VAR) {
        candidates.push(PathBuf::from(from_env));
    }
    if let Some(over) = LIBRARY_PATH_OVERRIDE.get() {
        candidates.push(over.clone());
    }
    candidates.extend(CONVENTIONAL_PATHS.iter().map(PathBuf::from));
    candidates.push(PathBuf::from(BARE_LIBRARY_NAME));
    candidates
}

fn open_library() -> Result<Library, LibraryLoadError> {
    let attempted = candidate_paths();
    let mut last_error = String::from("no candidate paths");

    for path in &attempted {
        match unsafe { Library::new(path) } {
            Ok(lib) => return Ok(lib),
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(LibraryLoadError { attempted, last_error })
}

fn resolve(lib: &Library) -> Result<LmdbApi, LibraryLoadError> {
    let attempted = candidate_paths();
    Ok(LmdbApi {
        mdb_env_create: symbol!(lib, b"mdb_env_create", FnEnvCreate, attempted),
        mdb_env_open: symbol!(lib, b"mdb_env_open", FnEnvOpen, attempted),
        mdb_env_close: symbol!(lib, b"mdb_env_close", FnEnvClose, attempted),
        mdb_env_set_mapsize: symbol!(lib, b"mdb_env_set_mapsize", FnEnvSetMapsize, attempted),
        mdb_env_set_maxdbs: symbol!(lib, b"mdb_env_set_maxdbs", FnEnvSetMaxdbs, attempted),
        mdb_env_set_maxreaders: symbol!(
            lib,
            b"mdb_env_set_maxreaders",
            FnEnvSetMaxreaders,
            attempted
        ),
        mdb_env_sync: symbol!(lib, b"mdb_env_sync", FnEnvSync, attempted),
        mdb_env_copyfd2: symbol!(lib, b"mdb_env_copyfd2", FnEnvCopyfd2, attempted),
        mdb_txn_begin: symbol!(lib, b"mdb_txn_begin", FnTxnBegin, attempted),
        mdb_txn_commit: symbol!(lib, b"mdb_txn_commit", FnTxnCommit, attempted),
        mdb_txn_abort: symbol!(lib, b"mdb_txn_abort", FnTxnAbort, attempted),
        mdb_dbi_open: symbol!(lib, b"mdb_dbi_open", FnDbiOpen, attempted),
        mdb_get: symbol!(lib, b"mdb_get", FnGet, attempted),
        mdb_put: symbol!(lib, b"mdb_put", FnPut, attempted),
        mdb_del: symbol!(lib, b"mdb_del", FnDel, attempted),
        mdb_cursor_open: symbol!(lib, b"mdb_cursor_open", FnCursorOpen, attempted),
        mdb_cursor_close: symbol!(lib, b"mdb_cursor_close", FnCursorClose, attempted),
        mdb_cursor_get: symbol!(lib, b"mdb_cursor_get", FnCursorGet, attempted),
        mdb_strerror: symbol!(lib, b"mdb_strerror", FnStrerror, attempted),
    })
}

static LIBRARY: OnceLock<Library> = OnceLock::new();
static API: OnceLock<LmdbApi> = OnceLock::new();

/// Resolve (on first use) and return the LMDB function table.
///
/// The underlying `dlopen` handle is cached for the lifetime of the process: LMDB
/// environments may outlive any single call site, so there is no safe point at which to
/// `dlclose` it short of process exit.
pub fn api() -> Result<&'static LmdbApi, LibraryLoadError> {
    if let Some(api) = API.get() {
        return Ok(api);
    }

    let lib = match LIBRARY.get() {
        Some(lib) => lib,
        None => {
            let lib = open_library()?;
            LIBRARY.get_or_init(|| lib)
        }
    };

    let resolved = resolve(lib)?;
    Ok(API.get_or_init(|| resolved))
}

/// Translate an LMDB C string (as returned by `mdb_strerror`) into an owned `String`.
///
/// # Safety
/// `ptr` must be a valid, NUL-terminated C string or null.
pub unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::from("unknown error");
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
