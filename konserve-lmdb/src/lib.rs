//! `konserve-lmdb` is an embedded key-value store built on top of [LMDB].
//!
//! It exposes two interoperable-free API surfaces over a single LMDB environment: a rich,
//! metadata-carrying "wrapped" API (see [`Store`]'s `assoc_in`/`get_in`/... family) and a
//! "raw" API for callers that don't need per-entry metadata (`put`/`get`/`del`/...).
//!
//! [LMDB]: https://en.wikipedia.org/wiki/Lightning_Memory-Mapped_Database
//!
//! # Example
//!
//! ```
//! use konserve_lmdb::Store;
//! use konserve_traits::{Keyword, Value};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let store = Store::create(dir.path(), Default::default())?;
//!
//! store.assoc(&Value::Keyword(Keyword::plain("foo")), Value::Int64(42))?;
//! let value = store.get(&Value::Keyword(Keyword::plain("foo")))?;
//! assert!(matches!(value, Some(Value::Int64(42))));
//! # Ok(()) }
//! ```
#![warn(missing_docs)]

pub mod codec;
mod cursor;
pub mod descriptors;
mod env;
mod hooks;
mod mdb;
mod path;
pub mod pool;

pub mod registry;
mod store;
mod txn;

use std::path::PathBuf;
use std::{error, fmt, io, result};

pub use self::descriptors::DescriptorPool;
pub use self::env::EnvOpenOptions;
pub use self::hooks::{WriteHook, WriteHooks};
pub use self::mdb::error::MdbError;
pub use self::mdb::flags::EnvFlags;
pub use self::pool::BufferPool;
pub use self::registry::{RegistryConflictError, TypeRegistry};
pub use self::store::{
    BinaryInput, KeyEntry, MetaUpdater, MultiMetaUpdater, Store, StoreOptions, Transformer,
};
pub use self::txn::{RoTxn, RwTxn};

pub use konserve_traits::{BoxedError, Custom, Keyword, TypeHandler, Value};

/// Every error kind the core distinguishes. `MDB_NOTFOUND` is deliberately absent: it never
/// surfaces past the store boundary, and is instead translated to `None`, a caller-supplied
/// default, or an omitted map entry at the point the miss is observed.
#[derive(Debug)]
pub enum Error {
    /// A plain I/O failure — opening the store directory, reading a `bassoc` source path,
    /// or a filesystem error surfaced while opening the LMDB environment.
    Io(io::Error),
    /// Any nonzero LMDB return code other than `MDB_NOTFOUND`.
    Mdb(MdbError),
    /// Encoding a value failed: either it overflowed the 256 MiB ceiling, or no built-in
    /// case and no registered [`TypeHandler`] could represent it.
    Encoding(BoxedError),
    /// Decoding a value failed: a short buffer, invalid UTF-8, or an unknown tag with no
    /// matching registered handler.
    Decoding(BoxedError),
    /// A wrapped-API read landed on a record with no `meta` field, meaning it was written
    /// through the raw API. `key` is a debug rendering of the offending key; `fields` is a
    /// debug rendering of whatever top-level field names were actually observed (empty if
    /// the stored bytes weren't even a mapping).
    CrossApiMisuse {
        /// Debug rendering of the key that was read.
        key: String,
        /// Debug rendering of the top-level field names actually found in the record.
        fields: Vec<String>,
    },
    /// `bassoc` was given a value that is not bytes, a UTF-8 string, a byte stream, or a
    /// filesystem path.
    UnsupportedBinaryInput,
    /// `liblmdb` could not be resolved through any of the documented discovery steps.
    LibraryLoad(lmdb_sys::LibraryLoadError),
    /// `Store::create` found a directory already present at the target path.
    StoreExists(PathBuf),
    /// `Store::connect` found no directory at the target path.
    StoreMissing(PathBuf),
    /// The target path is not representable as a platform path string (contains an
    /// embedded NUL).
    InvalidPath,
    /// Two opens of the same canonical path disagreed about environment options.
    BadOpenOptions,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{e}"),
            Error::Mdb(e) => write!(f, "{e}"),
            Error::Encoding(e) => write!(f, "error while encoding: {e}"),
            Error::Decoding(e) => write!(f, "error while decoding: {e}"),
            Error::CrossApiMisuse { key, fields } => {
                write!(
                    f,
                    "key {key} was written through the raw API; wrapped reads require a `meta` \
                     field (found fields {fields:?})"
                )
            }
            Error::UnsupportedBinaryInput => {
                f.write_str("bassoc expects bytes, a UTF-8 string, a byte stream, or a filesystem path")
            }
            Error::LibraryLoad(e) => write!(f, "{e}"),
            Error::StoreExists(path) => write!(f, "store already exists at {}", path.display()),
            Error::StoreMissing(path) => write!(f, "no store found at {}", path.display()),
            Error::InvalidPath => f.write_str("path is not representable (contains an embedded NUL)"),
            Error::BadOpenOptions => {
                f.write_str("an environment at this path is already open with different options")
            }
        }
    }
}

impl error::Error for Error {}

impl From<MdbError> for Error {
    fn from(error: MdbError) -> Error {
        Error::Mdb(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

/// Either a success or an [`Error`].
pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn give_me_send_sync<T: Send + Sync>(_: T) {}
        give_me_send_sync(Error::Encoding(Box::from("oops")));
    }
}
