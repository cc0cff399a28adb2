//! Minimal, dynamically-loaded bindings to the LMDB C ABI.
//!
//! Unlike a conventional `-sys` crate this does not link `liblmdb` at build time: no
//! `build.rs`, no vendored C sources, no bindgen. The shared library is resolved at
//! runtime (see [`loader`]) through an explicit discovery order, which lets a single
//! compiled binary be pointed at whichever `liblmdb` is installed on the host.

mod loader;
mod raw;

pub use loader::{
    api, cstr_to_string, set_library_path_override, LibraryLoadError, LmdbApi, LMDB_LIB_ENV_VAR,
};
pub use raw::*;
