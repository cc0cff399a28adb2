//! Read-only and read-write transaction handles.
//!
//! Every operation the store exposes runs inside one of these. `RwTxn` additionally
//! carries the read-modify-write helper the atomic store operations (`update-in`,
//! `multi-assoc`, `dissoc`, ...) are built on: one LMDB write transaction serializes with
//! every other writer, so a read followed by a write inside the same `RwTxn` is atomic
//! with respect to other writers by construction.

use std::ops::Deref;
use std::ptr;

use crate::env::Env;
use crate::mdb::error::mdb_result;
use crate::mdb::ffi;
use crate::{Error, Result};

/// A read-only transaction.
pub struct RoTxn<'e> {
    pub(crate) txn: *mut ffi::MDB_txn,
    pub(crate) env: &'e Env,
}

impl<'e> RoTxn<'e> {
    pub(crate) fn new(env: &'e Env) -> Result<RoTxn<'e>> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        unsafe {
            mdb_result((api.mdb_txn_begin)(
                env.env_mut_ptr(),
                ptr::null_mut(),
                ffi::MDB_RDONLY,
                &mut txn,
            ))?
        };
        Ok(RoTxn { txn, env })
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDB_txn {
        self.txn
    }

    /// Release the reader slot this transaction held. Dropping without calling this also
    /// releases it (via abort), so calling it is an optimization, not a correctness
    /// requirement.
    pub fn commit(mut self) -> Result<()> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let result = unsafe { mdb_result((api.mdb_txn_commit)(self.txn)) };
        self.txn = ptr::null_mut();
        result.map_err(Into::into)
    }
}

impl Drop for RoTxn<'_> {
    fn drop(&mut self) {
        if !self.txn.is_null() {
            if let Ok(api) = lmdb_sys::api() {
                unsafe { (api.mdb_txn_abort)(self.txn) };
            }
        }
    }
}

/// A read-write transaction. Only one may be open at a time per environment; LMDB
/// serializes writers by blocking a second `RwTxn::new` call until the first commits or
/// aborts.
pub struct RwTxn<'e> {
    pub(crate) txn: RoTxn<'e>,
}

impl<'e> RwTxn<'e> {
    pub(crate) fn new(env: &'e Env) -> Result<RwTxn<'e>> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        unsafe { mdb_result((api.mdb_txn_begin)(env.env_mut_ptr(), ptr::null_mut(), 0, &mut txn))? };
        Ok(RwTxn { txn: RoTxn { txn, env } })
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDB_txn {
        self.txn.txn
    }

    /// Commit every write issued through this transaction, making them visible to
    /// subsequent read transactions.
    pub fn commit(mut self) -> Result<()> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let result = unsafe { mdb_result((api.mdb_txn_commit)(self.txn.txn)) };
        self.txn.txn = ptr::null_mut();
        result.map_err(Into::into)
    }

    /// Discard every write issued through this transaction.
    pub fn abort(mut self) {
        if let Ok(api) = lmdb_sys::api() {
            unsafe { (api.mdb_txn_abort)(self.txn.txn) };
        }
        self.txn.txn = ptr::null_mut();
    }
}

impl<'e> Deref for RwTxn<'e> {
    type Target = RoTxn<'e>;

    fn deref(&self) -> &Self::Target {
        &self.txn
    }
}
