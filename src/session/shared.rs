//! Thread-safe wrapper around [`Session`].

use std::sync::Arc;

use parking_lot::Mutex;

use super::Session;
use crate::session::types::SessionSetup;

/// A cloneable, mutex-guarded handle to a [`Session`].
///
/// The core session takes `&mut self` and belongs to one owner. Callers
/// that need the same activation from multiple threads go through this
/// wrapper instead; every access runs under the lock, so signature counter
/// updates never interleave.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Session>>,
}

impl SharedSession {
    /// Create a new shared session from its setup.
    pub fn new(setup: SessionSetup) -> Self {
        Self::from_session(Session::new(setup))
    }

    /// Wrap an existing session.
    pub fn from_session(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Run `operation` with exclusive access to the session.
    pub fn with<R>(&self, operation: impl FnOnce(&mut Session) -> R) -> R {
        let mut guard = self.inner.lock();
        operation(&mut guard)
    }
}
