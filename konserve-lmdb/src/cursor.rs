//! A read-only, forward-only cursor, just enough to support `keys-enum`'s full scan over
//! a database. Neither database this crate opens uses `DUPSORT`, so there is no dup-key
//! positioning to support.

use std::marker::PhantomData;
use std::ptr;

use crate::env::Env;
use crate::mdb::error::mdb_result;
use crate::mdb::ffi;
use crate::txn::RoTxn;
use crate::Result;

pub struct RoCursor<'txn> {
    cursor: *mut ffi::MDB_cursor,
    env: &'txn Env,
    _marker: PhantomData<&'txn ()>,
}

impl<'txn> RoCursor<'txn> {
    pub(crate) fn new(txn: &'txn RoTxn, dbi: ffi::MDB_dbi) -> Result<RoCursor<'txn>> {
        let api = lmdb_sys::api().map_err(crate::Error::LibraryLoad)?;
        let mut cursor: *mut ffi::MDB_cursor = ptr::null_mut();
        unsafe { mdb_result((api.mdb_cursor_open)(txn.raw(), dbi, &mut cursor))? }
        Ok(RoCursor { cursor, env: txn.env, _marker: PhantomData })
    }

    pub fn move_on_first(&mut self) -> Result<Option<(&'txn [u8], &'txn [u8])>> {
        self.move_to(ffi::cursor_op::MDB_FIRST)
    }

    pub fn move_on_next(&mut self) -> Result<Option<(&'txn [u8], &'txn [u8])>> {
        self.move_to(ffi::cursor_op::MDB_NEXT)
    }

    fn move_to(&mut self, op: ffi::MDB_cursor_op) -> Result<Option<(&'txn [u8], &'txn [u8])>> {
        let api = lmdb_sys::api().map_err(crate::Error::LibraryLoad)?;
        let mut key_val = self.env.descriptors().acquire();
        let mut data_val = self.env.descriptors().acquire();

        let result = unsafe {
            mdb_result((api.mdb_cursor_get)(self.cursor, &mut *key_val, &mut *data_val, op))
        };

        match result {
            // Safety: the slices borrow the cursor's transaction lifetime (`'txn`), not the
            // pooled descriptor, so handing the descriptors back below doesn't affect them.
            Ok(()) => {
                let key = unsafe { ffi::from_val(*key_val) };
                let data = unsafe { ffi::from_val(*data_val) };
                Ok(Some((key, data)))
            }
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RoCursor<'_> {
    fn drop(&mut self) {
        if let Ok(api) = lmdb_sys::api() {
            unsafe { (api.mdb_cursor_close)(self.cursor) };
        }
    }
}
