use std::sync::Arc;

use logvol_error::{LogVolResult, logvol_bail};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// The set of containers a process currently has open.
///
/// A registry belongs to whatever session object the embedding application owns, and is
/// passed to [`LogFile::create`](crate::LogFile::create) and
/// [`LogFile::open`](crate::LogFile::open). Opening the same physical container twice through
/// one registry fails with `AlreadyOpen`. Clones share the same set.
#[derive(Clone, Default)]
pub struct FileRegistry {
    open: Arc<Mutex<FxHashSet<String>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, identity: &str) -> bool {
        self.open.lock().contains(identity)
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(&self, identity: &str) -> LogVolResult<RegistryGuard> {
        if !self.open.lock().insert(identity.to_string()) {
            logvol_bail!(AlreadyOpen: "{} is already open", identity);
        }
        Ok(RegistryGuard {
            registry: self.clone(),
            identity: identity.to_string(),
        })
    }
}

/// Keeps a container registered until dropped.
pub(crate) struct RegistryGuard {
    registry: FileRegistry,
    identity: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.open.lock().remove(&self.identity);
    }
}
