//! The LMDB environment: one memory-mapped data file backing both the wrapped and raw
//! databases a [`crate::Store`] opens inside it.

use std::collections::hash_map::{Entry, HashMap};
use std::ffi::CString;
use std::fmt;
use std::io;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, RwLock, Weak};

use once_cell::sync::Lazy;

use crate::descriptors::DescriptorPool;
use crate::mdb::error::mdb_result;
use crate::mdb::ffi;
use crate::mdb::flags::EnvFlags;
use crate::{Error, Result};

/// The environments currently open in this process, keyed by canonicalized path.
///
/// Mirrors a single data file to a single [`Env`] handle: two stores pointed at the same
/// path within one process share the memory map instead of each mapping it separately,
/// which LMDB does not support safely. Holds only a [`Weak`] reference: the map must never
/// be the thing keeping an [`EnvInner`] alive, or the last [`Store`](crate::Store) dropping
/// its [`Env`] would never actually close it (the registry's own strong reference would
/// keep the refcount above zero forever). Once the last strong `Env` is dropped,
/// [`EnvInner`]'s `Drop` impl removes the now-dangling entry.
static OPENED_ENV: Lazy<RwLock<HashMap<PathBuf, Weak<EnvInner>>>> = Lazy::new(RwLock::default);

fn canonicalize_path(path: &Path) -> io::Result<PathBuf> {
    path.canonicalize()
}

/// Options controlling how an [`Env`] is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvOpenOptions {
    pub map_size: Option<usize>,
    pub max_readers: Option<u32>,
    pub max_dbs: Option<u32>,
    pub flags: EnvFlags,
}

impl Default for EnvOpenOptions {
    fn default() -> Self {
        EnvOpenOptions { map_size: None, max_readers: None, max_dbs: Some(1), flags: EnvFlags::empty() }
    }
}

impl EnvOpenOptions {
    pub fn new() -> EnvOpenOptions {
        EnvOpenOptions::default()
    }

    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = Some(size);
        self
    }

    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = Some(readers);
        self
    }

    pub fn max_dbs(mut self, dbs: u32) -> Self {
        self.max_dbs = Some(dbs);
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Open (or join an already-open) environment at `path`.
    ///
    /// Two calls with the same canonical path but different options return
    /// [`Error::BadOpenOptions`] rather than silently honoring whichever options came
    /// first, since the mismatch almost always indicates two stores disagreeing about
    /// the same file.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Env> {
        let mut lock = OPENED_ENV.write().unwrap();

        let path = match canonicalize_path(path.as_ref()) {
            Err(err) => return Err(Error::Io(err)),
            Ok(path) => path,
        };

        // Drop an entry whose environment has already been closed (its last strong `Env`
        // went away) before deciding whether this is a fresh open or a join.
        if matches!(lock.get(path.as_ref()), Some(weak) if weak.upgrade().is_none()) {
            lock.remove(path.as_ref());
        }

        match lock.entry(path) {
            Entry::Occupied(entry) => {
                let inner = entry.get().upgrade().expect("dangling entries are pruned above");
                if inner.options == *self {
                    Ok(Env(inner))
                } else {
                    Err(Error::BadOpenOptions)
                }
            }
            Entry::Vacant(entry) => {
                let path = entry.key().clone();
                #[cfg(unix)]
                let path_str = CString::new(path.as_os_str().as_bytes())
                    .map_err(|_| Error::InvalidPath)?;
                #[cfg(not(unix))]
                let path_str = CString::new(path.to_string_lossy().as_bytes())
                    .map_err(|_| Error::InvalidPath)?;

                let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;

                let env = unsafe {
                    let mut raw_env: *mut ffi::MDB_env = ptr::null_mut();
                    mdb_result((api.mdb_env_create)(&mut raw_env))?;

                    if let Some(size) = self.map_size {
                        if size % page_size::get() != 0 {
                            (api.mdb_env_close)(raw_env);
                            let msg = format!(
                                "map size ({}) must be a multiple of the system page size ({})",
                                size,
                                page_size::get()
                            );
                            return Err(Error::Io(io::Error::new(io::ErrorKind::InvalidInput, msg)));
                        }
                        if let Err(e) = mdb_result((api.mdb_env_set_mapsize)(raw_env, size)) {
                            (api.mdb_env_close)(raw_env);
                            return Err(e.into());
                        }
                    }

                    if let Some(readers) = self.max_readers {
                        if let Err(e) = mdb_result((api.mdb_env_set_maxreaders)(raw_env, readers)) {
                            (api.mdb_env_close)(raw_env);
                            return Err(e.into());
                        }
                    }

                    if let Some(dbs) = self.max_dbs {
                        if let Err(e) = mdb_result((api.mdb_env_set_maxdbs)(raw_env, dbs)) {
                            (api.mdb_env_close)(raw_env);
                            return Err(e.into());
                        }
                    }

                    match mdb_result((api.mdb_env_open)(raw_env, path_str.as_ptr(), self.flags.bits(), 0o600)) {
                        Ok(()) => raw_env,
                        Err(e) => {
                            (api.mdb_env_close)(raw_env);
                            return Err(e.into());
                        }
                    }
                };

                let inner = Arc::new(EnvInner {
                    env,
                    path: path.clone(),
                    options: *self,
                    descriptors: DescriptorPool::new(),
                });
                entry.insert(Arc::downgrade(&inner));
                Ok(Env(inner))
            }
        }
    }
}

/// A handle to an opened LMDB environment, cheaply cloneable and shared process-wide per
/// canonical path.
#[derive(Clone)]
pub struct Env(Arc<EnvInner>);

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Env").field("path", &self.0.path.display()).finish_non_exhaustive()
    }
}

struct EnvInner {
    env: *mut ffi::MDB_env,
    path: PathBuf,
    options: EnvOpenOptions,
    /// This environment's own descriptor pool: never shared with any other `Env`, so
    /// dropping this `EnvInner` drops every descriptor it ever pooled along with the
    /// environment itself.
    descriptors: DescriptorPool,
}

unsafe impl Send for EnvInner {}
unsafe impl Sync for EnvInner {}

impl Drop for EnvInner {
    fn drop(&mut self) {
        {
            let mut lock = OPENED_ENV.write().unwrap();
            // Only remove the registry entry if it's still dangling (points at this
            // instance, now at refcount zero) rather than one a racing `open()` call
            // already replaced with a fresh environment at the same path.
            if matches!(lock.get(&self.path), Some(weak) if weak.upgrade().is_none()) {
                lock.remove(&self.path);
            }
        }
        if let Ok(api) = lmdb_sys::api() {
            unsafe { (api.mdb_env_close)(self.env) };
        }
    }
}

impl Env {
    pub(crate) fn env_mut_ptr(&self) -> *mut ffi::MDB_env {
        self.0.env
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// This environment's own bounded descriptor pool; never shared with any other [`Env`].
    pub(crate) fn descriptors(&self) -> &DescriptorPool {
        &self.0.descriptors
    }

    /// Opens (creating if `create` is set) the dbi backing a database within a write
    /// transaction, returning its handle. `name: None` opens LMDB's default, unnamed
    /// database — the only database this crate ever opens.
    pub(crate) fn raw_open_dbi(
        &self,
        raw_txn: *mut ffi::MDB_txn,
        name: Option<&str>,
        create: bool,
    ) -> Result<ffi::MDB_dbi> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let mut dbi: ffi::MDB_dbi = 0;
        let cname = name.map(CString::new).transpose().map_err(|_| Error::InvalidPath)?;
        let name_ptr = cname.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        let flags = if create { ffi::MDB_CREATE } else { 0 };
        unsafe {
            mdb_result((api.mdb_dbi_open)(raw_txn, name_ptr, flags, &mut dbi))?;
        }
        Ok(dbi)
    }

    /// Flush buffered writes to disk immediately, regardless of the `NO_SYNC`/
    /// `NO_META_SYNC` flags the environment was opened with.
    pub fn force_sync(&self) -> Result<()> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        unsafe { mdb_result((api.mdb_env_sync)(self.env_mut_ptr(), 1))? };
        Ok(())
    }
}
