//! Token sessions and exclusive access to them.
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use log::trace;

use crate::error::{DataResult, Error};
use crate::provider::Connection;

mod pool;
pub use self::pool::{SessionPool, SessionResolver};

//------------ TokenId -------------------------------------------------------

/// The caller visible name of a token.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TokenId(Arc<str>);

impl TokenId {
    pub fn new(name: &str) -> Self {
        TokenId(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TokenId {
    fn from(name: &str) -> Self {
        TokenId::new(name)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//------------ TokenSession --------------------------------------------------

/// One connection to a token together with the lock that serializes its
/// use.
///
/// Sessions are owned by a [`SessionPool`]; operations only borrow them
/// for the duration of a single call.
pub struct TokenSession<C> {
    token: TokenId,
    valid: AtomicBool,
    conn: Mutex<C>,
}

impl<C: Connection> TokenSession<C> {
    pub fn new(token: TokenId, conn: C) -> Self {
        TokenSession {
            token,
            valid: AtomicBool::new(true),
            conn: Mutex::new(conn),
        }
    }

    pub fn token(&self) -> &TokenId {
        &self.token
    }

    /// Marks the session as dead, e.g. after the token was removed.
    ///
    /// Current and future borrowers will get [`Error::SessionInvalid`].
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn is_marked_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Blocks until the session lock is acquired, then checks that the
    /// session is still alive.
    ///
    /// The lock is released when the returned guard is dropped, also when
    /// the validity check fails.
    pub fn lock(&self) -> DataResult<SessionGuard<'_, C>> {
        let conn = self.conn.lock().map_err(|_| Error::SessionInvalid)?;
        trace!("Locked session for token '{}'", self.token);

        let mut guard = SessionGuard {
            session: self,
            conn,
        };
        guard.validate()?;
        Ok(guard)
    }
}

impl<C> fmt::Debug for TokenSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSession")
            .field("token", &self.token)
            .field("valid", &self.valid)
            .finish()
    }
}

//------------ SessionGuard --------------------------------------------------

/// Exclusive access to the connection of a [`TokenSession`].
///
/// Note that the lock is held for the whole duration of an operation,
/// including any interactive credential prompt caused by logging in again.
/// Other callers for the same token wait meanwhile.
pub struct SessionGuard<'a, C> {
    session: &'a TokenSession<C>,
    conn: MutexGuard<'a, C>,
}

impl<C: Connection> SessionGuard<'_, C> {
    pub fn token(&self) -> &TokenId {
        &self.session.token
    }

    /// Checks that the session has not been invalidated since it was
    /// obtained.
    pub fn validate(&mut self) -> DataResult<()> {
        if self.session.is_marked_valid() && self.conn.is_valid() {
            Ok(())
        } else {
            self.session.invalidate();
            Err(Error::SessionInvalid)
        }
    }

    /// Marks the session as dead, e.g. after the provider said so.
    pub fn invalidate(&self) {
        self.session.invalidate();
    }
}

impl<C> Deref for SessionGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for SessionGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for SessionGuard<'_, C> {
    fn drop(&mut self) {
        trace!("Releasing session for token '{}'", self.session.token);
    }
}

//------------ Tests ---------------------------------------------------------
