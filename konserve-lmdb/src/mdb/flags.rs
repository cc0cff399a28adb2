use bitflags::bitflags;
use lmdb_sys as ffi;

bitflags! {
    /// LMDB environment flags (see <http://www.lmdb.tech/doc/group__mdb__env.html>).
    ///
    /// Only the flags a store can legitimately pass to `mdb_env_open` are exposed; LMDB has
    /// a few more that only make sense for the generic-database use case this crate doesn't
    /// offer (custom comparators, `DUPSORT`, ...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[repr(transparent)]
    pub struct EnvFlags: u32 {
        /// No environment directory; the path names the data file directly.
        const NO_SUB_DIR = ffi::MDB_NOSUBDIR;
        /// Don't fsync after commit.
        const NO_SYNC = ffi::MDB_NOSYNC;
        /// Open read-only.
        const READ_ONLY = ffi::MDB_RDONLY;
        /// Don't fsync the metapage after commit.
        const NO_META_SYNC = ffi::MDB_NOMETASYNC;
        /// Use a writable mmap.
        const WRITE_MAP = ffi::MDB_WRITEMAP;
        /// Use asynchronous msync when `WRITE_MAP` is set.
        const MAP_ASYNC = ffi::MDB_MAPASYNC;
        /// Tie reader locktable slots to `MDB_txn` objects instead of threads, letting a
        /// read transaction be moved between threads.
        const NO_TLS = ffi::MDB_NOTLS;
        /// Don't do any locking; the caller must serialize access itself.
        const NO_LOCK = ffi::MDB_NOLOCK;
        /// Don't do readahead (no effect on Windows).
        const NO_READ_AHEAD = ffi::MDB_NORDAHEAD;
        /// Don't zero malloc'd memory before writing to the data file.
        const NO_MEM_INIT = ffi::MDB_NOMEMINIT;
    }
}
