//! C type definitions mirroring the subset of `lmdb.h` this crate resolves at runtime.
//!
//! These are hand-written rather than bindgen-generated: the crate never links against
//! `liblmdb` at build time, so there is no header to generate bindings from. Layouts come
//! straight from the upstream LMDB header and must stay in sync with it.

use libc::{c_int, c_void};

#[cfg(unix)]
pub type mdb_mode_t = libc::mode_t;
#[cfg(windows)]
pub type mdb_mode_t = c_int;

#[cfg(unix)]
pub type mdb_filehandle_t = c_int;
#[cfg(windows)]
pub type mdb_filehandle_t = *mut c_void;

/// Opaque LMDB environment handle.
#[repr(C)]
pub struct MDB_env {
    _private: [u8; 0],
}

/// Opaque LMDB transaction handle.
#[repr(C)]
pub struct MDB_txn {
    _private: [u8; 0],
}

/// Opaque LMDB cursor handle.
#[repr(C)]
pub struct MDB_cursor {
    _private: [u8; 0],
}

pub type MDB_dbi = u32;

/// A generic descriptor used to pass a key or a value across the FFI boundary.
///
/// Mirrors `MDB_val` exactly: a length-prefixed pointer into either caller-owned or
/// LMDB-owned memory. `mv_data` must be valid for `mv_size` bytes whenever passed to or
/// received from LMDB.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MDB_val {
    pub mv_size: usize,
    pub mv_data: *mut c_void,
}

impl MDB_val {
    pub const fn zeroed() -> MDB_val {
        MDB_val { mv_size: 0, mv_data: std::ptr::null_mut() }
    }
}

pub type MDB_cursor_op = c_int;

pub const MDB_FIRST: MDB_cursor_op = 0;
pub const MDB_FIRST_DUP: MDB_cursor_op = 1;
pub const MDB_GET_CURRENT: MDB_cursor_op = 4;
pub const MDB_LAST: MDB_cursor_op = 6;
pub const MDB_NEXT: MDB_cursor_op = 8;
pub const MDB_PREV: MDB_cursor_op = 12;
pub const MDB_SET: MDB_cursor_op = 15;
pub const MDB_SET_RANGE: MDB_cursor_op = 17;

// Environment flags, see <http://www.lmdb.tech/doc/group__mdb__env.html>.
pub const MDB_FIXEDMAP: u32 = 0x01;
pub const MDB_NOSUBDIR: u32 = 0x4000;
pub const MDB_NOSYNC: u32 = 0x10000;
pub const MDB_RDONLY: u32 = 0x20000;
pub const MDB_NOMETASYNC: u32 = 0x40000;
pub const MDB_WRITEMAP: u32 = 0x80000;
pub const MDB_MAPASYNC: u32 = 0x100000;
pub const MDB_NOTLS: u32 = 0x200000;
pub const MDB_NOLOCK: u32 = 0x400000;
pub const MDB_NORDAHEAD: u32 = 0x800000;
pub const MDB_NOMEMINIT: u32 = 0x1000000;

// Database flags.
pub const MDB_CREATE: u32 = 0x40000;

// Write flags, see <http://www.lmdb.tech/doc/group__mdb.html>.
pub const MDB_CURRENT: u32 = 0x40;
pub const MDB_APPEND: u32 = 0x20000;

pub const MDB_CP_COMPACT: u32 = 0x01;

/// Return codes LMDB is documented to produce. `MDB_SUCCESS` (0) is not listed; the core
/// distinguishes success from failure on the raw `c_int`, not through this table.
pub const MDB_NOTFOUND: c_int = -30798;
pub const MDB_KEYEXIST: c_int = -30799;
pub const MDB_PAGE_NOTFOUND: c_int = -30797;
pub const MDB_CORRUPTED: c_int = -30796;
pub const MDB_PANIC: c_int = -30795;
pub const MDB_VERSION_MISMATCH: c_int = -30794;
pub const MDB_INVALID: c_int = -30793;
pub const MDB_MAP_FULL: c_int = -30792;
pub const MDB_DBS_FULL: c_int = -30791;
pub const MDB_READERS_FULL: c_int = -30790;
pub const MDB_TLS_FULL: c_int = -30789;
pub const MDB_TXN_FULL: c_int = -30788;
pub const MDB_CURSOR_FULL: c_int = -30787;
pub const MDB_PAGE_FULL: c_int = -30786;
pub const MDB_MAP_RESIZED: c_int = -30785;
pub const MDB_INCOMPATIBLE: c_int = -30784;
pub const MDB_BAD_RSLOT: c_int = -30783;
pub const MDB_BAD_TXN: c_int = -30782;
pub const MDB_BAD_VALSIZE: c_int = -30781;
pub const MDB_BAD_DBI: c_int = -30780;
pub const MDB_PROBLEM: c_int = -30779;

pub type mdb_env_ptr = *mut MDB_env;
pub type mdb_txn_ptr = *mut MDB_txn;
pub type mdb_cursor_ptr = *mut MDB_cursor;
