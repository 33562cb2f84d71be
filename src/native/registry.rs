//! Process-wide record of open read handles, keyed by path.
//!
//! Replacing a file that another handle still has open fails on some
//! platforms. The exporter asks the registry to close every handle on the
//! destination before it retries a delete or rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError, Weak};

use tracing::debug;

/// Something the registry can close on request.
pub trait ForceClose: Send + Sync {
    fn force_close(&self);
}

type Registry = Mutex<HashMap<PathBuf, Vec<Weak<dyn ForceClose>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Record a handle open on `path`. Dead entries are pruned on the way.
///
/// Returns the key the handle is recorded under, for [`release`].
pub fn register<H: ForceClose + 'static>(path: &Path, handle: Weak<H>) -> PathBuf {
    let handle: Weak<dyn ForceClose> = handle;
    let key = key(path);
    let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    let entries = map.entry(key.clone()).or_default();
    entries.retain(|w| w.strong_count() > 0);
    entries.push(handle);
    key
}

/// Prune dead handles under `key` and forget the path once none is left.
/// Called when a registered handle goes away.
pub fn release(key: &Path) {
    let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    let Some(entries) = map.get_mut(key) else {
        return;
    };
    entries.retain(|w| w.strong_count() > 0);
    if entries.is_empty() {
        map.remove(key);
    }
}

/// Close every live handle on `path` and forget them.
///
/// Returns the number of handles closed.
pub fn force_close(path: &Path) -> usize {
    let handles: Vec<_> = {
        let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(&key(path))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|w| w.upgrade())
            .collect()
    };
    // Closed outside the registry lock: disposal can take the handle lock.
    for handle in &handles {
        handle.force_close();
    }
    if !handles.is_empty() {
        debug!(path = %path.display(), count = handles.len(), "force-closed open handles");
    }
    handles.len()
}

/// Number of live handles registered on `path`.
pub fn open_handle_count(path: &Path) -> usize {
    let map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    map.get(&key(path))
        .map_or(0, |v| v.iter().filter(|w| w.strong_count() > 0).count())
}

#[cfg(test)]
pub(crate) fn is_tracked(path: &Path) -> bool {
    let map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    map.contains_key(&key(path))
}
