use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::{debug, info};

use crate::error::{DataResult, Error};
use crate::provider::Connection;

use super::{TokenId, TokenSession};

//------------ SessionResolver -----------------------------------------------

/// Maps a token identity to its live session.
///
/// Every successful `resolve` hands out one reference to the session which
/// is released by dropping it. The session itself stays owned by the
/// resolver.
pub trait SessionResolver<C: Connection>: Send + Sync {
    fn resolve(&self, token: &TokenId) -> DataResult<Arc<TokenSession<C>>>;
}

//------------ SessionPool ---------------------------------------------------

/// Keeps exactly one session per registered token.
pub struct SessionPool<C> {
    sessions: RwLock<HashMap<TokenId, Arc<TokenSession<C>>>>,
}

impl<C: Connection> Default for SessionPool<C> {
    fn default() -> Self {
        SessionPool {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Connection> SessionPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session for the token, replacing and invalidating any
    /// previous one.
    pub fn register(&self, token: TokenId, conn: C) {
        let session = Arc::new(TokenSession::new(token.clone(), conn));
        let previous = self.write_sessions().insert(token.clone(), session);
        if let Some(previous) = previous {
            previous.invalidate();
            info!("Replaced session for token '{}'", token);
        } else {
            debug!("Registered session for token '{}'", token);
        }
    }

    /// Forgets the session for the token and marks it invalid so that
    /// callers still holding it fail instead of using a dead session.
    pub fn remove(&self, token: &TokenId) -> bool {
        match self.write_sessions().remove(token) {
            Some(session) => {
                session.invalidate();
                debug!("Removed session for token '{}'", token);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_sessions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<TokenId, Arc<TokenSession<C>>>>
    {
        // The map is never left in an inconsistent state, so a poisoned
        // lock can still be used.
        self.sessions.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<TokenId, Arc<TokenSession<C>>>>
    {
        self.sessions.write().unwrap_or_else(|err| err.into_inner())
    }
}

impl<C: Connection> SessionResolver<C> for SessionPool<C> {
    fn resolve(&self, token: &TokenId) -> DataResult<Arc<TokenSession<C>>> {
        self.read_sessions()
            .get(token)
            .cloned()
            .ok_or_else(|| Error::TokenUnknown(token.clone()))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryConnection, MemoryToken};

    #[test]
    fn resolve_registered_token() {
        let pool = SessionPool::new();
        let token = MemoryToken::new();
        pool.register(TokenId::new("a"), token.connect());

        let session = pool.resolve(&TokenId::new("a")).unwrap();
        assert_eq!(session.token().as_str(), "a");
        assert_eq!(pool.len(), 1);

        // Each resolve is one reference, released on drop.
        let again = pool.resolve(&TokenId::new("a")).unwrap();
        assert_eq!(Arc::strong_count(&again), 3);
        drop(session);
        assert_eq!(Arc::strong_count(&again), 2);
    }

    #[test]
    fn resolve_unknown_token() {
        let pool: SessionPool<MemoryConnection> = SessionPool::new();
        assert_eq!(
            pool.resolve(&TokenId::new("nope")).err(),
            Some(Error::TokenUnknown(TokenId::new("nope")))
        );
    }

    #[test]
    fn removed_session_is_invalid_for_borrowers() {
        let pool = SessionPool::new();
        let token = MemoryToken::new();
        pool.register(TokenId::new("a"), token.connect());

        let borrowed = pool.resolve(&TokenId::new("a")).unwrap();
        assert!(pool.remove(&TokenId::new("a")));
        assert!(!pool.remove(&TokenId::new("a")));
        assert!(pool.is_empty());
        assert_eq!(borrowed.lock().err(), Some(Error::SessionInvalid));
    }

    #[test]
    fn register_replaces_previous_session() {
        let pool = SessionPool::new();
        let token = MemoryToken::new();
        pool.register(TokenId::new("a"), token.connect());
        let old = pool.resolve(&TokenId::new("a")).unwrap();

        pool.register(TokenId::new("a"), token.connect());
        assert!(!old.is_marked_valid());
        assert!(pool.resolve(&TokenId::new("a")).unwrap().lock().is_ok());
    }
}
