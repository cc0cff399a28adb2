//! The write-hooks table.
//!
//! This is purely an observability extension point: the core never invokes a hook itself,
//! it only holds the table so a caller (or a higher-level framework layered on top of this
//! store) can register named callbacks and look them up later. The table is a single cell
//! swapped atomically under a lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A write hook: an opaque callback invoked (by some caller, not by this crate) with the
/// key that was just written.
pub type WriteHook = Arc<dyn Fn(&crate::Value) + Send + Sync>;

/// The store's table of named write hooks.
#[derive(Default)]
pub struct WriteHooks {
    table: RwLock<HashMap<String, WriteHook>>,
}

impl WriteHooks {
    /// An empty table.
    pub fn new() -> WriteHooks {
        WriteHooks::default()
    }

    /// Look up a hook by name.
    pub fn get(&self, name: &str) -> Option<WriteHook> {
        self.table.read().unwrap().get(name).cloned()
    }

    /// Register or replace a single named hook.
    pub fn set(&self, name: impl Into<String>, hook: WriteHook) {
        self.table.write().unwrap().insert(name.into(), hook);
    }

    /// Remove a named hook, returning it if it was present.
    pub fn remove(&self, name: &str) -> Option<WriteHook> {
        self.table.write().unwrap().remove(name)
    }

    /// Atomically replace the entire table.
    pub fn replace_all(&self, hooks: HashMap<String, WriteHook>) {
        *self.table.write().unwrap() = hooks;
    }

    /// A snapshot of every currently registered hook name.
    pub fn names(&self) -> Vec<String> {
        self.table.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn set_get_remove_round_trip() {
        let hooks = WriteHooks::new();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        hooks.set("audit", Arc::new(move |key: &Value| {
            seen2.lock().unwrap().push(format!("{key:?}"));
        }));

        assert_eq!(hooks.names(), vec!["audit".to_string()]);
        let hook = hooks.get("audit").expect("hook was just registered");
        hook(&Value::Int64(1));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(hooks.remove("audit").is_some());
        assert!(hooks.get("audit").is_none());
    }
}
