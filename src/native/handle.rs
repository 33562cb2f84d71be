use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::error::{CodecError, NativeError};

use super::registry::{self, ForceClose};
use super::NativeSession;

/// Owns exactly one codec session.
///
/// Every entry point goes through [`with_session`](Self::with_session),
/// which holds the handle's lock for the duration of the call: concurrent
/// callers reading different tiles of the same file are serialized here.
///
/// [`dispose`](Self::dispose) is idempotent. Dropping the handle disposes
/// it if nobody did.
pub struct NativeCodecHandle<S: NativeSession> {
    path: PathBuf,
    session: Mutex<Option<S>>,
    registry_key: OnceLock<PathBuf>,
}

impl<S: NativeSession> NativeCodecHandle<S> {
    pub fn new(path: impl Into<PathBuf>, session: S) -> Self {
        let path = path.into();
        debug!(path = %path.display(), "codec session opened");
        Self {
            path,
            session: Mutex::new(Some(session)),
            registry_key: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the session under the handle lock.
    ///
    /// # Errors
    /// Returns `NativeError::Disposed` once the handle has been disposed,
    /// otherwise whatever `f` returns.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut S) -> Result<T, CodecError>,
    ) -> Result<T, CodecError> {
        let mut guard = self.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| NativeError::Disposed(self.path.display().to_string()))?;
        f(session)
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().is_none()
    }

    /// Close the session if it is still open.
    ///
    /// After a cancelled operation the session is usually incomplete; the
    /// resulting `TooFewScanlines` is expected and swallowed. Every other
    /// close failure is returned.
    pub fn dispose(&self, cancelled: bool) -> Result<(), CodecError> {
        let Some(mut session) = self.lock().take() else {
            return Ok(());
        };
        let result = session.close();
        debug!(path = %self.path.display(), cancelled, ok = result.is_ok(), "codec session disposed");

        match result {
            Err(CodecError::Native(NativeError::TooFewScanlines {
                processed,
                expected,
            })) if cancelled => {
                debug!(processed, expected, "ignoring incomplete session after cancel");
                Ok(())
            }
            other => other,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<S>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: NativeSession + 'static> NativeCodecHandle<S> {
    /// Wrap `session` and record the handle in the open-handle registry, so
    /// an export replacing `path` can close it.
    pub fn open_registered(path: impl Into<PathBuf>, session: S) -> Arc<Self> {
        let handle = Arc::new(Self::new(path, session));
        let weak = Arc::downgrade(&handle);
        let key = registry::register(handle.path(), weak);
        let _ = handle.registry_key.set(key);
        handle
    }
}

impl<S: NativeSession> ForceClose for NativeCodecHandle<S> {
    fn force_close(&self) {
        if let Err(e) = self.dispose(true) {
            warn!(path = %self.path.display(), error = %e, "error closing handle on request");
        }
    }
}

impl<S: NativeSession> Drop for NativeCodecHandle<S> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose(false) {
            warn!(path = %self.path.display(), error = %e, "error disposing codec session on drop");
        }
        if let Some(key) = self.registry_key.get() {
            registry::release(key);
        }
    }
}
