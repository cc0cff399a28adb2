//! Thin bridge between the dynamically-resolved [`lmdb_sys`] function table and the
//! pointer/slice conventions the rest of this crate is written against.

pub use lmdb_sys::{
    mdb_filehandle_t, MDB_cursor, MDB_cursor_op, MDB_dbi, MDB_env, MDB_txn, MDB_val, MDB_APPEND,
    MDB_CP_COMPACT, MDB_CREATE, MDB_CURRENT, MDB_RDONLY,
};

/// Cursor positioning operations used by `mdb_cursor_get`.
pub mod cursor_op {
    use lmdb_sys::MDB_cursor_op;

    pub const MDB_FIRST: MDB_cursor_op = lmdb_sys::MDB_FIRST;
    pub const MDB_LAST: MDB_cursor_op = lmdb_sys::MDB_LAST;
    pub const MDB_SET_RANGE: MDB_cursor_op = lmdb_sys::MDB_SET_RANGE;
    pub const MDB_NEXT: MDB_cursor_op = lmdb_sys::MDB_NEXT;
    pub const MDB_GET_CURRENT: MDB_cursor_op = lmdb_sys::MDB_GET_CURRENT;
}

/// Borrow a byte slice as an `MDB_val` pointing straight at it.
///
/// # Safety
/// The returned `MDB_val` is only valid for as long as `value` is not moved or dropped.
pub unsafe fn into_val(value: &[u8]) -> MDB_val {
    MDB_val { mv_data: value.as_ptr() as *mut libc::c_void, mv_size: value.len() }
}

/// Borrow LMDB-owned memory described by an `MDB_val` as a byte slice.
///
/// # Safety
/// `value` must describe memory valid for reads of `mv_size` bytes, and the borrow must
/// not outlive the transaction that produced it (LMDB may reuse the page on commit/abort).
pub unsafe fn from_val<'a>(value: MDB_val) -> &'a [u8] {
    std::slice::from_raw_parts(value.mv_data as *const u8, value.mv_size)
}
