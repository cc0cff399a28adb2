use std::error::Error as StdError;
use std::fmt;

use libc::c_int;
use lmdb_sys as ffi;

/// An LMDB error kind, translated from the raw `c_int` every `mdb_*` call returns.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MdbError {
    /// A key/data pair already exists where `MDB_NOOVERWRITE`-style semantics forbid it.
    KeyExist,
    /// A key/data pair was not found.
    NotFound,
    /// Requested page not found; usually indicates corruption.
    PageNotFound,
    /// Located page was the wrong type.
    Corrupted,
    /// Update of the meta page failed, or the environment had a fatal error.
    Panic,
    /// Environment version mismatch.
    VersionMismatch,
    /// File is not a valid LMDB file.
    Invalid,
    /// Environment map size reached.
    MapFull,
    /// Environment `max_dbs` reached.
    DbsFull,
    /// Environment `max_readers` reached.
    ReadersFull,
    /// Too many TLS keys in use (Windows only).
    TlsFull,
    /// Transaction has too many dirty pages.
    TxnFull,
    /// Cursor stack too deep (internal error).
    CursorFull,
    /// Page has insufficient space (internal error).
    PageFull,
    /// Database contents grew beyond the environment's map size.
    MapResized,
    /// Operation incompatible with the database, or the database type changed.
    Incompatible,
    /// Invalid reuse of a reader locktable slot.
    BadRslot,
    /// Transaction cannot recover; it must be aborted.
    BadTxn,
    /// Unsupported size of key/value, or a zero-length key.
    BadValSize,
    /// The specified dbi handle was changed unexpectedly.
    BadDbi,
    /// Unexpected problem; the transaction should abort.
    Problem,
    /// Any raw code LMDB returns that isn't one of the named constants above.
    Other(c_int),
}

impl MdbError {
    /// Whether this is the not-found case, which callers of the store-level API never see
    /// directly (it is translated into an `Option::None` or similar at that boundary).
    pub fn not_found(&self) -> bool {
        matches!(self, MdbError::NotFound)
    }

    pub fn from_err_code(code: c_int) -> MdbError {
        match code {
            ffi::MDB_KEYEXIST => MdbError::KeyExist,
            ffi::MDB_NOTFOUND => MdbError::NotFound,
            ffi::MDB_PAGE_NOTFOUND => MdbError::PageNotFound,
            ffi::MDB_CORRUPTED => MdbError::Corrupted,
            ffi::MDB_PANIC => MdbError::Panic,
            ffi::MDB_VERSION_MISMATCH => MdbError::VersionMismatch,
            ffi::MDB_INVALID => MdbError::Invalid,
            ffi::MDB_MAP_FULL => MdbError::MapFull,
            ffi::MDB_DBS_FULL => MdbError::DbsFull,
            ffi::MDB_READERS_FULL => MdbError::ReadersFull,
            ffi::MDB_TLS_FULL => MdbError::TlsFull,
            ffi::MDB_TXN_FULL => MdbError::TxnFull,
            ffi::MDB_CURSOR_FULL => MdbError::CursorFull,
            ffi::MDB_PAGE_FULL => MdbError::PageFull,
            ffi::MDB_MAP_RESIZED => MdbError::MapResized,
            ffi::MDB_INCOMPATIBLE => MdbError::Incompatible,
            ffi::MDB_BAD_RSLOT => MdbError::BadRslot,
            ffi::MDB_BAD_TXN => MdbError::BadTxn,
            ffi::MDB_BAD_VALSIZE => MdbError::BadValSize,
            ffi::MDB_BAD_DBI => MdbError::BadDbi,
            ffi::MDB_PROBLEM => MdbError::Problem,
            other => MdbError::Other(other),
        }
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn to_err_code(&self) -> c_int {
        match *self {
            MdbError::KeyExist => ffi::MDB_KEYEXIST,
            MdbError::NotFound => ffi::MDB_NOTFOUND,
            MdbError::PageNotFound => ffi::MDB_PAGE_NOTFOUND,
            MdbError::Corrupted => ffi::MDB_CORRUPTED,
            MdbError::Panic => ffi::MDB_PANIC,
            MdbError::VersionMismatch => ffi::MDB_VERSION_MISMATCH,
            MdbError::Invalid => ffi::MDB_INVALID,
            MdbError::MapFull => ffi::MDB_MAP_FULL,
            MdbError::DbsFull => ffi::MDB_DBS_FULL,
            MdbError::ReadersFull => ffi::MDB_READERS_FULL,
            MdbError::TlsFull => ffi::MDB_TLS_FULL,
            MdbError::TxnFull => ffi::MDB_TXN_FULL,
            MdbError::CursorFull => ffi::MDB_CURSOR_FULL,
            MdbError::PageFull => ffi::MDB_PAGE_FULL,
            MdbError::MapResized => ffi::MDB_MAP_RESIZED,
            MdbError::Incompatible => ffi::MDB_INCOMPATIBLE,
            MdbError::BadRslot => ffi::MDB_BAD_RSLOT,
            MdbError::BadTxn => ffi::MDB_BAD_TXN,
            MdbError::BadValSize => ffi::MDB_BAD_VALSIZE,
            MdbError::BadDbi => ffi::MDB_BAD_DBI,
            MdbError::Problem => ffi::MDB_PROBLEM,
            MdbError::Other(code) => code,
        }
    }
}

impl fmt::Display for MdbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lmdb_sys::api() {
            Ok(api) => {
                // Safety: mdb_strerror's return is a static string for any code it recognizes.
                let msg = unsafe { (api.mdb_strerror)(self.to_err_code()) };
                let msg = unsafe { lmdb_sys::cstr_to_string(msg) };
                f.write_str(&msg)
            }
            Err(_) => write!(f, "LMDB error code {}", self.to_err_code()),
        }
    }
}

impl StdError for MdbError {}

/// Turns a raw `mdb_*` return code into a `Result`, `MDB_SUCCESS` (`0`) mapping to `Ok(())`.
pub fn mdb_result(code: c_int) -> Result<(), MdbError> {
    if code == 0 {
        Ok(())
    } else {
        Err(MdbError::from_err_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recognized() {
        assert!(MdbError::NotFound.not_found());
        assert!(!MdbError::KeyExist.not_found());
    }

    #[test]
    fn round_trips_through_raw_codes() {
        for err in [
            MdbError::KeyExist,
            MdbError::NotFound,
            MdbError::MapFull,
            MdbError::Incompatible,
            MdbError::BadValSize,
        ] {
            assert_eq!(MdbError::from_err_code(err.to_err_code()), err);
        }
    }
}
