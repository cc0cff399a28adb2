//! [`Store`]: the public surface tying the environment, codec, registry, buffer pool and
//! write-hooks table together into the wrapped and raw operation families.
//!
//! A [`Store`] always opens exactly one database inside its [`Env`](crate::env::Env): LMDB's
//! default, unnamed one. The wrapped API (`assoc_in`/`get_in`/`update_in`/...) and the raw
//! API (`raw_put`/`raw_get`/...) read and write the very same keyspace; what distinguishes
//! a wrapped record from a raw one is purely its on-disk shape (`{meta, value}` versus a
//! bare encoded value), detected structurally by [`crate::codec::decode_record`] failing
//! with a [`crate::codec::NotWrappedError`]. Reading one API's writes through the other
//! surfaces as [`Error::CrossApiMisuse`].

use std::any::Any;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use konserve_traits::{Keyword, Value};

use crate::codec;
use crate::cursor::RoCursor;
use crate::env::{Env, EnvOpenOptions};
use crate::hooks::WriteHooks;
use crate::mdb::error::mdb_result;
use crate::mdb::ffi;
use crate::mdb::flags::EnvFlags;
use crate::path::{self, CloneValue};
use crate::pool::BufferPool;
use crate::registry::TypeRegistry;
use crate::txn::{RoTxn, RwTxn};
use crate::{Error, Result};

/// The tag a wrapped record's `meta` map carries under the `:type` field for an EDN value.
const TYPE_EDN: &str = "edn";
/// The tag carried under `:type` for a value written by [`Store::bassoc`].
const TYPE_BINARY: &str = "binary";

/// Default number of idle scratch buffers a [`Store`]'s [`BufferPool`] holds onto.
const DEFAULT_POOL_CAPACITY: usize = 64;
/// Default LMDB map size: 1 GiB.
const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// A transform applied to the (possibly absent) old value at an `update-in` path, producing
/// the new value to store there.
pub type Transformer<'a> = dyn Fn(Option<Value>) -> Value + 'a;

/// Produces the new metadata map for a single-key wrapped write (`assoc-in`/`update-in`/
/// `bassoc`), given the old metadata (`None` if the key was absent). When no updater is
/// supplied the store computes a default metadata map itself (see [`Store::default_meta`]).
pub type MetaUpdater<'a> = dyn Fn(Option<Value>) -> Value + 'a;

/// Like [`MetaUpdater`], but for `multi-assoc`: also given the key being written and its
/// value's type tag (`"edn"` or `"binary"`), since a single call writes more than one key.
pub type MultiMetaUpdater<'a> = dyn Fn(&Value, &str, Option<Value>) -> Value + 'a;

/// The shapes [`Store::bassoc`] accepts as a binary value, coerced to bytes before writing.
pub enum BinaryInput<'a> {
    /// Bytes to store verbatim.
    Bytes(Vec<u8>),
    /// A UTF-8 string, stored as its byte representation.
    Str(String),
    /// An open reader, fully drained into the stored value.
    Reader(&'a mut dyn std::io::Read),
    /// A filesystem path whose contents are read in full and stored.
    Path(PathBuf),
}

impl BinaryInput<'_> {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            BinaryInput::Bytes(b) => Ok(b),
            BinaryInput::Str(s) => Ok(s.into_bytes()),
            BinaryInput::Reader(r) => {
                let mut buf = Vec::new();
                std::io::Read::read_to_end(r, &mut buf)?;
                Ok(buf)
            }
            BinaryInput::Path(p) => Ok(std::fs::read(p)?),
        }
    }
}

/// One entry of a [`Store::keys_enum`] scan: a stored key plus the fragment of its metadata
/// that is cheap to surface without decoding the associated value.
#[derive(Debug)]
pub struct KeyEntry {
    /// The stored key.
    pub key: Value,
    /// The `:type` field of the record's metadata (`"edn"` or `"binary"`), if present.
    pub type_tag: Option<Value>,
    /// The `:last-write` field of the record's metadata, if present.
    pub last_write: Option<Value>,
}

/// Options controlling how a [`Store`] is opened.
pub struct StoreOptions {
    /// Environment-level options (map size, max readers, flags, ...).
    pub env: EnvOpenOptions,
    /// The type-handler registry consulted for every [`Value::Custom`]. Defaults to
    /// [`TypeRegistry::empty`], under which no custom type can be encoded or decoded.
    pub registry: Arc<TypeRegistry>,
    /// Capacity of the store's encode scratch-buffer pool.
    pub buffer_pool_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            env: EnvOpenOptions::new().map_size(DEFAULT_MAP_SIZE),
            registry: Arc::new(TypeRegistry::empty()),
            buffer_pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl StoreOptions {
    /// Open with a given type registry, everything else default.
    pub fn with_registry(registry: Arc<TypeRegistry>) -> StoreOptions {
        StoreOptions { registry, ..StoreOptions::default() }
    }
}

/// An open key-value store: one LMDB environment, one (the default) database, and the
/// codec/registry/pool/hooks state a [`Store`]'s operations share.
pub struct Store {
    env: Env,
    dbi: ffi::MDB_dbi,
    registry: Arc<TypeRegistry>,
    pool: BufferPool,
    hooks: WriteHooks,
    path: PathBuf,
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn open_dbi(env: &Env, flags: EnvFlags) -> Result<ffi::MDB_dbi> {
    if flags.contains(EnvFlags::READ_ONLY) {
        let rtxn = RoTxn::new(env)?;
        let dbi = env.raw_open_dbi(rtxn.raw(), None, false)?;
        rtxn.commit()?;
        Ok(dbi)
    } else {
        let wtxn = RwTxn::new(env)?;
        let dbi = env.raw_open_dbi(wtxn.raw(), None, true)?;
        wtxn.commit()?;
        Ok(dbi)
    }
}

impl Store {
    fn open_internal(path: &Path, opts: StoreOptions) -> Result<Store> {
        let env = opts.env.open(path)?;
        let dbi = open_dbi(&env, opts.env.flags)?;
        Ok(Store {
            env,
            dbi,
            registry: opts.registry,
            pool: BufferPool::new(opts.buffer_pool_capacity),
            hooks: WriteHooks::new(),
            path: path.to_path_buf(),
        })
    }

    /// Open the store at `path`, creating the on-disk directory (and database) if absent.
    /// Unlike [`Store::create`], an already-existing directory is not an error.
    pub fn connect(path: impl AsRef<Path>, opts: StoreOptions) -> Result<Store> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        Store::open_internal(path, opts)
    }

    /// Create a brand new store at `path`, failing with [`Error::StoreExists`] if the
    /// directory is already there.
    pub fn create(path: impl AsRef<Path>, opts: StoreOptions) -> Result<Store> {
        let path = path.as_ref();
        if path.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }
        std::fs::create_dir_all(path)?;
        Store::open_internal(path, opts)
    }

    /// The on-disk directory this store was opened against.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The registered write hooks. The store never invokes these itself: this table is a
    /// pure extension point for a caller-supplied observability layer.
    pub fn hooks(&self) -> &WriteHooks {
        &self.hooks
    }

    /// Close the store. Consuming `self` is the whole mechanism: once this returns, no
    /// further operation can be attempted on this handle (the Rust borrow checker enforces
    /// the closed→open→closed state machine at compile time rather than with a runtime
    /// flag).
    pub fn release(self) -> Result<()> {
        Ok(())
    }

    /// Remove a store's on-disk directory and its contents. Only valid while no [`Store`]
    /// handle for `path` is open; if one is, LMDB's memory map will outlive the deletion and
    /// further I/O through it is undefined (the caller is responsible for having released
    /// every handle first, which the type system cannot check across process boundaries).
    pub fn delete(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::StoreMissing(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ctx(&self) -> &(dyn Any + Send + Sync) {
        self.registry.context()
    }

    fn encode_key(&self, key: &Value) -> Result<Vec<u8>> {
        codec::encode(key, &self.registry, self.ctx(), &self.pool).map_err(Error::Encoding)
    }

    fn cross_api_or_decoding(&self, key: &Value, err: konserve_traits::BoxedError) -> Error {
        match err.downcast::<codec::NotWrappedError>() {
            Ok(not_wrapped) => {
                Error::CrossApiMisuse { key: format!("{key:?}"), fields: not_wrapped.observed_fields }
            }
            Err(err) => Error::Decoding(err),
        }
    }

    fn default_meta(&self, key: &Value, type_tag: &str) -> Value {
        Value::Map(vec![
            (Value::Keyword(Keyword::plain("type")), Value::Keyword(Keyword::plain(type_tag))),
            (Value::Keyword(Keyword::plain("last-write")), Value::Instant(now_millis())),
            (Value::Keyword(Keyword::plain("key")), CloneValue::clone(key)),
        ])
    }

    // -- low-level byte access --------------------------------------------------------

    fn get_bytes<'t>(&self, txn: &'t RoTxn, key: &[u8]) -> Result<Option<&'t [u8]>> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let mut key_val = self.env.descriptors().acquire();
        *key_val = unsafe { ffi::into_val(key) };
        let mut data_val = self.env.descriptors().acquire();
        let result = unsafe {
            mdb_result((api.mdb_get)(txn.raw(), self.dbi, &*key_val, &mut *data_val))
        };
        match result {
            // Safety: the returned descriptor points into the transaction's page cache;
            // the view borrows `txn`'s lifetime, not the pooled descriptor's, so returning
            // it to the pool right after this match does not shorten its validity.
            Ok(()) => Ok(Some(unsafe { ffi::from_val(*data_val) })),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_bytes(&self, txn: &RwTxn, key: &[u8], value: &[u8]) -> Result<()> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let mut key_val = self.env.descriptors().acquire();
        *key_val = unsafe { ffi::into_val(key) };
        let mut data_val = self.env.descriptors().acquire();
        *data_val = unsafe { ffi::into_val(value) };
        unsafe { mdb_result((api.mdb_put)(txn.raw(), self.dbi, &*key_val, &mut *data_val, 0))? };
        Ok(())
    }

    fn del_bytes(&self, txn: &RwTxn, key: &[u8]) -> Result<bool> {
        let api = lmdb_sys::api().map_err(Error::LibraryLoad)?;
        let mut key_val = self.env.descriptors().acquire();
        *key_val = unsafe { ffi::into_val(key) };
        let result = unsafe { mdb_result((api.mdb_del)(txn.raw(), self.dbi, &*key_val, ptr::null())) };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // -- wrapped API --------------------------------------------------------------

    /// Whether `key` has a record at all, wrapped or raw.
    pub fn exists(&self, key: &Value) -> Result<bool> {
        let rtxn = RoTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        Ok(self.get_bytes(&rtxn, &key_bytes)?.is_some())
    }

    /// Read just the metadata of `key`'s record, without decoding its value. `None` if the
    /// key is absent. A record whose metadata field is itself an empty map is distinct from
    /// that: it returns `Some(Value::Map(vec![]))`; only a missing key, or a wholly empty
    /// outer record, produces `None`.
    pub fn get_meta(&self, key: &Value) -> Result<Option<Value>> {
        let rtxn = RoTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        match self.get_bytes(&rtxn, &key_bytes)? {
            None => Ok(None),
            Some(bytes) => codec::decode_meta_only(bytes, &self.registry, self.ctx())
                .map_err(|e| self.cross_api_or_decoding(key, e)),
        }
    }

    /// Read the whole value stored at `key`, or `None` if absent.
    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        let rtxn = RoTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        match self.get_bytes(&rtxn, &key_bytes)? {
            None => Ok(None),
            Some(bytes) => {
                let (_, value) = codec::decode_record(bytes, &self.registry, self.ctx())
                    .map_err(|e| self.cross_api_or_decoding(key, e))?;
                Ok(Some(value))
            }
        }
    }

    /// Navigate into the value at `keys[0]` along `keys[1..]`, returning `default` if any
    /// segment along the way (including the store key itself) is missing.
    pub fn get_in(&self, keys: &[Value], default: Value) -> Result<Value> {
        let (store_key, rest) =
            keys.split_first().expect("get_in requires a non-empty key path");
        let rtxn = RoTxn::new(&self.env)?;
        let key_bytes = self.encode_key(store_key)?;
        let bytes = match self.get_bytes(&rtxn, &key_bytes)? {
            None => return Ok(default),
            Some(b) => b,
        };
        let (_, value) = codec::decode_record(bytes, &self.registry, self.ctx())
            .map_err(|e| self.cross_api_or_decoding(store_key, e))?;
        if rest.is_empty() {
            // The whole decoded value is the answer; move it rather than cloning, since a
            // `Value::Custom` can't be cloned in general.
            return Ok(value);
        }
        Ok(path::take_path(value, rest).1.unwrap_or(default))
    }

    /// Read-modify-write a single key: `transform` receives the old nested value at `keys`
    /// (`None` if absent) and returns the new one, which is spliced back into the stored
    /// value via [`path::assoc_path`], building any missing intermediate maps. Returns the
    /// whole record's value before and after the write (`Value::Nil` if it didn't exist).
    /// Runs inside one LMDB write transaction, so this is atomic with respect to every other
    /// writer.
    fn rmw_single(
        &self,
        keys: &[Value],
        meta_updater: Option<&MetaUpdater>,
        type_tag: &str,
        needs_old_nested: bool,
        transform: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<(Value, Value)> {
        let (store_key, rest) =
            keys.split_first().expect("assoc_in/update_in require a non-empty key path");
        let wtxn = RwTxn::new(&self.env)?;
        let key_bytes = self.encode_key(store_key)?;

        let existing = self.get_bytes(&wtxn, &key_bytes)?;

        // `Value` has no general `Clone` (a `Value::Custom` payload can only be duplicated
        // by asking its `TypeHandler` to decode it again), so every independent owned copy
        // this function needs of the old record comes from decoding `existing`'s bytes
        // afresh rather than cloning a previously decoded tree.
        let decode_old = |bytes: &[u8]| -> Result<(Value, Value)> {
            codec::decode_record(bytes, &self.registry, self.ctx())
                .map_err(|e| self.cross_api_or_decoding(store_key, e))
        };

        let (old_meta, mut old_root) = match existing {
            None => (None, None),
            Some(bytes) => {
                let (meta, root) = decode_old(bytes)?;
                (Some(meta), Some(root))
            }
        };
        let old_reported = match existing {
            None => Value::Nil,
            Some(bytes) => decode_old(bytes)?.1,
        };

        // `assoc_in` passes `false` here: its transform ignores the old nested value outright
        // (`move |_old| new_value`), and `assoc_path` below ignores `old_root`'s nested
        // content at the write path too, so walking down to it would be pure waste.
        let old_nested = if !needs_old_nested {
            None
        } else if rest.is_empty() {
            // The nested value *is* the whole record, and `assoc_path` below ignores
            // `old_root` entirely once `rest` is empty, so decode a third independent copy
            // rather than cloning `old_root`.
            match existing {
                None => None,
                Some(bytes) => Some(decode_old(bytes)?.1),
            }
        } else {
            // Move the leaf out of `old_root` rather than cloning it — `Value::Custom` can't
            // be cloned in general, and `assoc_path` is about to overwrite this exact spot
            // with whatever `transform` returns, so leaving a `Value::Nil` placeholder behind
            // is harmless.
            match old_root.take() {
                None => None,
                Some(root) => {
                    let (rebuilt, taken) = path::take_path(root, rest);
                    old_root = Some(rebuilt);
                    taken
                }
            }
        };

        let new_nested = transform(old_nested);
        let new_root = path::assoc_path(old_root, rest, new_nested);

        let new_meta = match meta_updater {
            Some(updater) => updater(old_meta),
            None => self.default_meta(store_key, type_tag),
        };

        let encoded =
            codec::encode_record(&new_meta, &new_root, &self.registry, self.ctx(), &self.pool)
                .map_err(Error::Encoding)?;
        self.put_bytes(&wtxn, &key_bytes, &encoded)?;
        wtxn.commit()?;

        Ok((old_reported, new_root))
    }

    /// Replace the whole value at `keys[0]`, nested along `keys[1..]`, with `new_value`.
    /// When `keys` has a single element, `new_value` replaces the entire stored value.
    /// Returns `(old_value, new_value)` for the whole record, `Value::Nil` standing in for
    /// "didn't exist".
    pub fn assoc_in(
        &self,
        keys: &[Value],
        meta_updater: Option<&MetaUpdater>,
        new_value: Value,
    ) -> Result<(Value, Value)> {
        self.rmw_single(keys, meta_updater, TYPE_EDN, false, move |_old| new_value)
    }

    /// Convenience wrapper over [`Store::assoc_in`] for a non-nested single-key write,
    /// returning just the new whole-record value.
    pub fn assoc(&self, key: &Value, value: Value) -> Result<Value> {
        let (_, new_value) = self.assoc_in(std::slice::from_ref(key), None, value)?;
        Ok(new_value)
    }

    /// Apply `transform` to the (possibly absent) value at `keys[0]`, nested along
    /// `keys[1..]`, atomically. Returns `(old_value, new_value)` for the whole record.
    pub fn update_in(
        &self,
        keys: &[Value],
        meta_updater: Option<&MetaUpdater>,
        transform: &Transformer,
    ) -> Result<(Value, Value)> {
        self.rmw_single(keys, meta_updater, TYPE_EDN, true, |old| transform(old))
    }

    /// Remove `key`'s record entirely (wrapped or raw), returning whether it existed.
    pub fn dissoc(&self, key: &Value) -> Result<bool> {
        let wtxn = RwTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        let existed = self.del_bytes(&wtxn, &key_bytes)?;
        wtxn.commit()?;
        Ok(existed)
    }

    /// Read several keys at once inside a single read transaction. The returned list
    /// contains only the keys that were present, each paired with its decoded value.
    pub fn multi_get(&self, keys: &[Value]) -> Result<Vec<(Value, Value)>> {
        let rtxn = RoTxn::new(&self.env)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let key_bytes = self.encode_key(key)?;
            if let Some(bytes) = self.get_bytes(&rtxn, &key_bytes)? {
                let (_, value) = codec::decode_record(bytes, &self.registry, self.ctx())
                    .map_err(|e| self.cross_api_or_decoding(key, e))?;
                out.push((CloneValue::clone(key), value));
            }
        }
        Ok(out)
    }

    /// Write several `(key, value)` pairs inside a single write transaction, returning the
    /// keys that were written (in order). `meta_updater`, if given, is called once per key
    /// with that key, its type tag (always `"edn"` here), and its old metadata.
    pub fn multi_assoc(
        &self,
        kvs: Vec<(Value, Value)>,
        meta_updater: Option<&MultiMetaUpdater>,
    ) -> Result<Vec<Value>> {
        let wtxn = RwTxn::new(&self.env)?;
        let mut written = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            let key_bytes = self.encode_key(&key)?;
            let old_meta = match self.get_bytes(&wtxn, &key_bytes)? {
                None => None,
                Some(bytes) => {
                    let (meta, _) = codec::decode_record(bytes, &self.registry, self.ctx())
                        .map_err(|e| self.cross_api_or_decoding(&key, e))?;
                    Some(meta)
                }
            };
            let new_meta = match meta_updater {
                Some(updater) => updater(&key, TYPE_EDN, old_meta),
                None => self.default_meta(&key, TYPE_EDN),
            };
            let bytes = codec::encode_record(&new_meta, &value, &self.registry, self.ctx(), &self.pool)
                .map_err(Error::Encoding)?;
            self.put_bytes(&wtxn, &key_bytes, &bytes)?;
            // `key` is no longer needed for encoding at this point; move it rather than
            // cloning, since a `Value::Custom` key couldn't be cloned in general.
            written.push(key);
        }
        wtxn.commit()?;
        Ok(written)
    }

    /// Remove several keys inside a single write transaction, returning, per key, whether it
    /// existed.
    pub fn multi_dissoc(&self, keys: &[Value]) -> Result<Vec<(Value, bool)>> {
        let wtxn = RwTxn::new(&self.env)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let key_bytes = self.encode_key(key)?;
            let existed = self.del_bytes(&wtxn, &key_bytes)?;
            out.push((CloneValue::clone(key), existed));
        }
        wtxn.commit()?;
        Ok(out)
    }

    /// Enumerate every key in the store along with the parts of its metadata cheap to
    /// surface without decoding its value. Records written through the raw API (no `meta`
    /// field) are skipped rather than failing the whole scan.
    ///
    /// With the `append-log-filter` feature enabled, entries whose key is a
    /// [`Value::Uuid`] and whose `:type` metadata field is the keyword `:append-log` are
    /// excluded — an opt-in filter for callers layering an append-log convention on top of
    /// this store.
    pub fn keys_enum(&self) -> Result<Vec<KeyEntry>> {
        let rtxn = RoTxn::new(&self.env)?;
        let mut cursor = RoCursor::new(&rtxn, self.dbi)?;
        let mut out = Vec::new();

        let mut entry = cursor.move_on_first()?;
        while let Some((key_bytes, value_bytes)) = entry {
            let key =
                codec::decode(key_bytes, &self.registry, self.ctx()).map_err(Error::Decoding)?;

            match codec::decode_meta_only(value_bytes, &self.registry, self.ctx()) {
                Ok(meta) => {
                    let type_tag = meta.as_ref().and_then(|m| meta_field(m, "type"));
                    let last_write = meta.as_ref().and_then(|m| meta_field(m, "last-write"));

                    #[cfg(feature = "append-log-filter")]
                    if is_append_log_entry(&key, &type_tag) {
                        entry = cursor.move_on_next()?;
                        continue;
                    }

                    out.push(KeyEntry { key, type_tag, last_write });
                }
                Err(_) => {
                    // A raw-API record: no `meta` field to report, and not wrapped-API data
                    // in the first place, so it is left out of this enumeration.
                }
            }
            entry = cursor.move_on_next()?;
        }
        Ok(out)
    }

    /// Read `key`'s stored value as raw bytes and invoke `callback` on them synchronously,
    /// without ever copying them into an owned buffer. `None` if `key` is absent.
    /// [`Error::UnsupportedBinaryInput`] if the stored value isn't [`Value::Bytes`].
    pub fn bget<R>(&self, key: &Value, callback: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        let rtxn = RoTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        let bytes = match self.get_bytes(&rtxn, &key_bytes)? {
            None => return Ok(None),
            Some(b) => b,
        };
        let (_, value) = codec::decode_record(bytes, &self.registry, self.ctx())
            .map_err(|e| self.cross_api_or_decoding(key, e))?;
        match value {
            Value::Bytes(bytes) => Ok(Some(callback(&bytes))),
            _ => Err(Error::UnsupportedBinaryInput),
        }
    }

    /// Coerce `input` to bytes and store it at `key` (type tag `"binary"`), atomically, the
    /// same way [`Store::assoc_in`] does for a single key.
    pub fn bassoc(
        &self,
        key: &Value,
        meta_updater: Option<&MetaUpdater>,
        input: BinaryInput<'_>,
    ) -> Result<(Value, Value)> {
        let bytes = input.into_bytes()?;
        self.rmw_single(std::slice::from_ref(key), meta_updater, TYPE_BINARY, false, move |_old| {
            Value::Bytes(bytes)
        })
    }

    // -- raw API --------------------------------------------------------------

    /// Write `value` at `key` with no metadata wrapper at all.
    pub fn raw_put(&self, key: &Value, value: &Value) -> Result<()> {
        let wtxn = RwTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        let value_bytes =
            codec::encode(value, &self.registry, self.ctx(), &self.pool).map_err(Error::Encoding)?;
        self.put_bytes(&wtxn, &key_bytes, &value_bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Read the bare, unwrapped value stored at `key`, or `None` if absent.
    pub fn raw_get(&self, key: &Value) -> Result<Option<Value>> {
        let rtxn = RoTxn::new(&self.env)?;
        let key_bytes = self.encode_key(key)?;
        match self.get_bytes(&rtxn, &key_bytes)? {
            None => Ok(None),
            Some(bytes) => {
                codec::decode(bytes, &self.registry, self.ctx()).map(Some).map_err(Error::Decoding)
            }
        }
    }

    /// Remove `key`'s raw record, returning whether it existed. Identical to
    /// [`Store::dissoc`]; provided under the raw-API name for symmetry.
    pub fn raw_del(&self, key: &Value) -> Result<bool> {
        self.dissoc(key)
    }

    /// Read several bare values inside one read transaction, in the same present-keys-only
    /// shape as [`Store::multi_get`].
    pub fn raw_multi_get(&self, keys: &[Value]) -> Result<Vec<(Value, Value)>> {
        let rtxn = RoTxn::new(&self.env)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let key_bytes = self.encode_key(key)?;
            if let Some(bytes) = self.get_bytes(&rtxn, &key_bytes)? {
                let value = codec::decode(bytes, &self.registry, self.ctx()).map_err(Error::Decoding)?;
                out.push((CloneValue::clone(key), value));
            }
        }
        Ok(out)
    }

    /// Write several bare `(key, value)` pairs inside one write transaction.
    pub fn raw_multi_put(&self, kvs: &[(Value, Value)]) -> Result<()> {
        let wtxn = RwTxn::new(&self.env)?;
        for (key, value) in kvs {
            let key_bytes = self.encode_key(key)?;
            let value_bytes = codec::encode(value, &self.registry, self.ctx(), &self.pool)
                .map_err(Error::Encoding)?;
            self.put_bytes(&wtxn, &key_bytes, &value_bytes)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Flush buffered writes to disk immediately, bypassing any `NO_SYNC`/`NO_META_SYNC`
    /// flags the environment was opened with.
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()
    }
}

fn meta_field(meta: &Value, name: &str) -> Option<Value> {
    match meta {
        Value::Map(pairs) => pairs
            .iter()
            .find(|(k, _)| matches!(k, Value::Keyword(kw) if kw.namespace.is_none() && kw.name == name))
            .map(|(_, v)| CloneValue::clone(v)),
        _ => None,
    }
}

#[cfg(feature = "append-log-filter")]
fn is_append_log_entry(key: &Value, type_tag: &Option<Value>) -> bool {
    let is_uuid_key = matches!(key, Value::Uuid(_, _));
    let is_append_log_type =
        matches!(type_tag, Some(Value::Keyword(kw)) if kw.namespace.is_none() && kw.name == "append-log");
    is_uuid_key && is_append_log_type
}

#[cfg(test)]
mod tests {
    use konserve_traits::{Keyword, TypeHandler};
    use tempfile::tempdir;

    use super::*;

    fn kw(name: &str) -> Value {
        Value::Keyword(Keyword::plain(name))
    }

    #[test]
    fn create_fails_if_directory_exists() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("store")).unwrap();
        let err = Store::create(dir.path().join("store"), StoreOptions::default()).unwrap_err();
        assert!(matches!(err, Error::StoreExists(_)));
    }

    #[test]
    fn connect_creates_directory_if_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = Store::connect(&path, StoreOptions::default()).unwrap();
        assert!(path.is_dir());
        store.release().unwrap();
    }

    #[test]
    fn assoc_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("foo"), Value::Int64(42)).unwrap();
        assert!(matches!(store.get(&kw("foo")).unwrap(), Some(Value::Int64(42))));
        assert!(store.exists(&kw("foo")).unwrap());
        assert!(store.get(&kw("missing")).unwrap().is_none());
    }

    #[test]
    fn update_in_increments_a_nested_counter() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("counter"), Value::Int64(0)).unwrap();
        for _ in 0..3 {
            store
                .update_in(
                    std::slice::from_ref(&kw("counter")),
                    None,
                    &|old| match old {
                        Some(Value::Int64(n)) => Value::Int64(n + 1),
                        _ => Value::Int64(1),
                    },
                )
                .unwrap();
        }
        assert!(matches!(store.get(&kw("counter")).unwrap(), Some(Value::Int64(3))));
    }

    #[test]
    fn assoc_in_builds_missing_nested_structure() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        let path = vec![kw("config"), kw("db"), kw("host")];
        store.assoc_in(&path, None, Value::Str("localhost".into())).unwrap();
        let value = store.get_in(&path, Value::Nil).unwrap();
        assert!(matches!(value, Value::Str(s) if s == "localhost"));
        assert!(matches!(
            store.get_in(&[kw("config"), kw("db"), kw("missing")], Value::Nil).unwrap(),
            Value::Nil
        ));
    }

    #[test]
    fn dissoc_removes_and_reports_prior_existence() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("foo"), Value::Int64(1)).unwrap();
        assert!(store.dissoc(&kw("foo")).unwrap());
        assert!(!store.dissoc(&kw("foo")).unwrap());
        assert!(!store.exists(&kw("foo")).unwrap());
    }

    #[test]
    fn multi_assoc_then_multi_get_then_multi_dissoc() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        let kvs = vec![(kw("a"), Value::Int64(1)), (kw("b"), Value::Int64(2))];
        let written = store.multi_assoc(kvs, None).unwrap();
        assert_eq!(written.len(), 2);

        let got = store.multi_get(&[kw("a"), kw("b"), kw("missing")]).unwrap();
        assert_eq!(got.len(), 2);

        let results = store.multi_dissoc(&[kw("a"), kw("missing")]).unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0], (Value::Keyword(k), true) if k.name == "a"));
        assert!(matches!(&results[1], (Value::Keyword(k), false) if k.name == "missing"));
    }

    #[test]
    fn keys_enum_reports_every_wrapped_key() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("a"), Value::Int64(1)).unwrap();
        store.assoc(&kw("b"), Value::Int64(2)).unwrap();

        let entries = store.keys_enum().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| matches!(&e.type_tag, Some(Value::Keyword(kw)) if kw.name == "edn")));
    }

    #[test]
    fn keys_enum_skips_raw_records() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("wrapped"), Value::Int64(1)).unwrap();
        store.raw_put(&kw("raw"), &Value::Int64(2)).unwrap();

        let entries = store.keys_enum().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(&entries[0].key, Value::Keyword(k) if k.name == "wrapped"));
    }

    #[test]
    fn bassoc_then_bget_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.bassoc(&kw("blob"), None, BinaryInput::Bytes(vec![1, 2, 3])).unwrap();
        let seen = store.bget(&kw("blob"), |bytes| bytes.to_vec()).unwrap();
        assert_eq!(seen, Some(vec![1, 2, 3]));
    }

    #[test]
    fn bget_rejects_a_non_binary_value() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("not-bytes"), Value::Int64(1)).unwrap();
        let err = store.bget(&kw("not-bytes"), |_| ()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBinaryInput));
    }

    #[test]
    fn wrapped_read_of_a_raw_write_is_cross_api_misuse() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.raw_put(&kw("k"), &Value::Int64(1)).unwrap();
        let err = store.get(&kw("k")).unwrap_err();
        assert!(matches!(err, Error::CrossApiMisuse { .. }));
    }

    #[test]
    fn raw_read_of_a_wrapped_write_sees_the_literal_record_shape() {
        // The raw API has no notion of `meta`/`value` at all: it decodes whatever bytes
        // are there structurally, so reading a wrapped-API write back through `raw_get`
        // succeeds and simply surfaces the `{meta, value}` map as an ordinary value,
        // unlike the other direction which is a hard error.
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.assoc(&kw("j"), Value::Int64(1)).unwrap();
        let value = store.raw_get(&kw("j")).unwrap().unwrap();
        assert!(matches!(value, Value::Map(pairs) if pairs.len() == 2));
    }

    #[test]
    fn raw_multi_put_then_raw_multi_get() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path(), StoreOptions::default()).unwrap();

        store.raw_multi_put(&[(kw("a"), Value::Int64(1)), (kw("b"), Value::Int64(2))]).unwrap();
        let got = store.raw_multi_get(&[kw("a"), kw("b")]).unwrap();
        assert_eq!(got.len(), 2);
    }

    struct Point {
        x: i32,
        y: i32,
    }

    struct PointHandler;

    impl TypeHandler for PointHandler {
        fn tag(&self) -> u8 {
            crate::codec::CUSTOM_TAG_MIN
        }

        fn type_id(&self) -> std::any::TypeId {
            std::any::TypeId::of::<Point>()
        }

        fn handles(&self, item: &(dyn std::any::Any + Send + Sync)) -> bool {
            item.downcast_ref::<Point>().is_some()
        }

        fn encode(
            &self,
            item: &(dyn std::any::Any + Send + Sync),
            _ctx: &(dyn std::any::Any + Send + Sync),
            encode_nested: &konserve_traits::NestedEncode<'_>,
        ) -> std::result::Result<Vec<u8>, konserve_traits::BoxedError> {
            let point = item.downcast_ref::<Point>().unwrap();
            let mut out = encode_nested(&Value::Int32(point.x))?;
            out.extend(encode_nested(&Value::Int32(point.y))?);
            Ok(out)
        }

        fn decode(
            &self,
            bytes: &[u8],
            _ctx: &(dyn std::any::Any + Send + Sync),
            decode_nested: &konserve_traits::NestedDecode<'_>,
        ) -> std::result::Result<Box<dyn std::any::Any + Send + Sync>, konserve_traits::BoxedError> {
            let (x, used) = decode_nested(bytes)?;
            let (y, _) = decode_nested(&bytes[used..])?;
            let (Value::Int32(x), Value::Int32(y)) = (x, y) else {
                return Err("expected two int32 fields".into());
            };
            Ok(Box::new(Point { x, y }))
        }
    }

    fn point_store(dir: &tempfile::TempDir) -> Store {
        let registry =
            TypeRegistry::new(vec![Box::new(PointHandler)], Box::new(())).unwrap();
        Store::create(dir.path(), StoreOptions::with_registry(Arc::new(registry))).unwrap()
    }

    #[test]
    fn assoc_then_get_round_trips_a_custom_value() {
        let dir = tempdir().unwrap();
        let store = point_store(&dir);

        store.assoc(&kw("p"), Value::Custom(konserve_traits::Custom::new(Point { x: 100, y: 200 }))).unwrap();

        let value = store.get(&kw("p")).unwrap().unwrap();
        let Value::Custom(custom) = value else { panic!("expected a custom value back") };
        let point = custom.downcast::<Point>().unwrap();
        assert_eq!((point.x, point.y), (100, 200));
    }

    #[test]
    fn assoc_then_get_round_trips_a_list_of_custom_values() {
        let dir = tempdir().unwrap();
        let store = point_store(&dir);

        let points = Value::Seq(vec![
            Value::Custom(konserve_traits::Custom::new(Point { x: 1, y: 2 })),
            Value::Custom(konserve_traits::Custom::new(Point { x: 3, y: 4 })),
        ]);
        store.assoc(&kw("ps"), points).unwrap();

        let Value::Seq(items) = store.get(&kw("ps")).unwrap().unwrap() else {
            panic!("expected a seq back")
        };
        assert_eq!(items.len(), 2);
        let coords: Vec<(i32, i32)> = items
            .into_iter()
            .map(|v| {
                let Value::Custom(c) = v else { panic!("expected a custom value") };
                let p = c.downcast::<Point>().unwrap();
                (p.x, p.y)
            })
            .collect();
        assert_eq!(coords, vec![(1, 2), (3, 4)]);
    }

    #[test]
    fn update_in_replaces_a_custom_value_without_cloning_the_old_one() {
        let dir = tempdir().unwrap();
        let store = point_store(&dir);

        store.assoc(&kw("p"), Value::Custom(konserve_traits::Custom::new(Point { x: 1, y: 1 }))).unwrap();
        store
            .update_in(std::slice::from_ref(&kw("p")), None, &|_old| {
                Value::Custom(konserve_traits::Custom::new(Point { x: 9, y: 9 }))
            })
            .unwrap();

        let Value::Custom(custom) = store.get(&kw("p")).unwrap().unwrap() else {
            panic!("expected a custom value back")
        };
        let point = custom.downcast::<Point>().unwrap();
        assert_eq!((point.x, point.y), (9, 9));
    }

    #[test]
    fn get_in_reaches_a_nested_custom_leaf_without_panicking() {
        let dir = tempdir().unwrap();
        let store = point_store(&dir);

        store
            .assoc(
                &kw("rec"),
                Value::Map(vec![(kw("a"), Value::Custom(konserve_traits::Custom::new(Point { x: 7, y: 8 })))]),
            )
            .unwrap();

        let value = store.get_in(&[kw("rec"), kw("a")], Value::Nil).unwrap();
        let Value::Custom(custom) = value else { panic!("expected a custom value back") };
        let point = custom.downcast::<Point>().unwrap();
        assert_eq!((point.x, point.y), (7, 8));
    }

    #[test]
    fn assoc_in_overwrites_a_sibling_of_a_nested_custom_leaf_without_panicking() {
        let dir = tempdir().unwrap();
        let store = point_store(&dir);

        store
            .assoc(
                &kw("rec"),
                Value::Map(vec![(kw("a"), Value::Custom(konserve_traits::Custom::new(Point { x: 7, y: 8 })))]),
            )
            .unwrap();

        // `assoc_in` discards whatever used to be at the path, so it must never need to
        // clone the nested custom value it's about to overwrite.
        store.assoc_in(&[kw("rec"), kw("a")], None, Value::Int64(5)).unwrap();

        let value = store.get_in(&[kw("rec"), kw("a")], Value::Nil).unwrap();
        assert!(matches!(value, Value::Int64(5)));
    }

    #[test]
    fn update_in_reads_a_nested_custom_leaf_without_panicking() {
        let dir = tempdir().unwrap();
        let store = point_store(&dir);

        store
            .assoc(
                &kw("rec"),
                Value::Map(vec![(kw("a"), Value::Custom(konserve_traits::Custom::new(Point { x: 7, y: 8 })))]),
            )
            .unwrap();

        store
            .update_in(&[kw("rec"), kw("a")], None, &|old| {
                let Some(Value::Custom(custom)) = old else { panic!("expected the old custom value") };
                let point = custom.downcast::<Point>().unwrap();
                Value::Custom(konserve_traits::Custom::new(Point { x: point.x + 1, y: point.y + 1 }))
            })
            .unwrap();

        let value = store.get_in(&[kw("rec"), kw("a")], Value::Nil).unwrap();
        let Value::Custom(custom) = value else { panic!("expected a custom value back") };
        let point = custom.downcast::<Point>().unwrap();
        assert_eq!((point.x, point.y), (8, 9));
    }
}
