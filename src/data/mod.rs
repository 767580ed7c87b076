//! Reading, writing, deleting and listing data objects on tokens.
//!
//! Every operation resolves the session of the token, takes the session
//! lock for the whole operation, and runs the actual provider calls under
//! [`with_login_retry`], so a first failure leads to one login and one
//! more attempt.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, trace};

use crate::error::{DataResult, Error};
use crate::login::{Login, LoginRequest, PromptMask, UserContext};
use crate::provider::{Attribute, AttributeKind, Connection, ObjectClass};
use crate::session::{SessionResolver, TokenId};

mod list;
mod locate;
mod marshal;
mod retry;

pub use self::list::{DataId, DataIdList, build_list};
pub use self::locate::{find_all, locate};
pub use self::marshal::{AttributeValue, fetch_value};
pub use self::retry::with_login_retry;

//------------ Access --------------------------------------------------------

/// How the caller wants to access a token.
///
/// None of this is interpreted by the operations themselves. It is handed
/// to the login collaborator when a login becomes necessary, except for
/// `is_public` which also decides whether new objects are private.
#[derive(Clone, Debug)]
pub struct Access {
    pub is_public: bool,
    pub user_context: UserContext,
    pub prompt_mask: PromptMask,
}

impl Access {
    /// Access to private objects, prompting allowed.
    pub fn private() -> Self {
        Access {
            is_public: false,
            user_context: UserContext::none(),
            prompt_mask: PromptMask::ALL,
        }
    }

    /// Access to public objects, prompting allowed.
    pub fn public() -> Self {
        Access {
            is_public: true,
            ..Self::private()
        }
    }

    pub fn with_user_context(mut self, user_context: UserContext) -> Self {
        self.user_context = user_context;
        self
    }

    pub fn with_prompt_mask(mut self, prompt_mask: PromptMask) -> Self {
        self.prompt_mask = prompt_mask;
        self
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::private()
    }
}

//------------ DataContext ---------------------------------------------------

/// The handle through which all data object operations are made.
///
/// A context is live from [`DataContext::initialize`] until
/// [`DataContext::terminate`]. Calls on a terminated context fail with
/// [`Error::NotInitialized`]. The context can be shared between threads.
/// Operations for different tokens run in parallel, operations for the
/// same token are serialized by the session lock.
pub struct DataContext<C: Connection> {
    sessions: Arc<dyn SessionResolver<C>>,
    login: Arc<dyn Login<C>>,
    live: AtomicBool,
}

impl<C: Connection> DataContext<C> {
    pub fn initialize(
        sessions: Arc<dyn SessionResolver<C>>,
        login: Arc<dyn Login<C>>,
    ) -> Self {
        debug!("Data object context initialized");
        DataContext {
            sessions,
            login,
            live: AtomicBool::new(true),
        }
    }

    /// Ends the context. Operations already running are not affected.
    pub fn terminate(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("Data object context terminated");
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Reads the value of a data object.
    ///
    /// Returns the size of the value. If `out` is given, the value is
    /// copied into it, unless it is too small in which case
    /// [`Error::BufferTooSmall`] reports the size needed. Passing `None`
    /// just asks for the size.
    pub fn get(
        &self,
        token: &TokenId,
        access: &Access,
        id: &DataId,
        out: Option<&mut [u8]>,
    ) -> DataResult<usize> {
        let value = self.fetch(token, access, id)?;
        let size = value.len();

        if let Some(out) = out {
            if out.len() < size {
                debug!(
                    "Buffer of {} bytes too small for value of {} bytes",
                    out.len(),
                    size
                );
                return Err(Error::BufferTooSmall { required: size });
            }
            out[..size].copy_from_slice(value.as_slice());
        }
        Ok(size)
    }

    /// Reads the value of a data object into a new vec.
    pub fn get_value(
        &self,
        token: &TokenId,
        access: &Access,
        id: &DataId,
    ) -> DataResult<Vec<u8>> {
        self.fetch(token, access, id).map(AttributeValue::into_vec)
    }

    /// Creates a data object.
    ///
    /// No check is made whether an object with the same application and
    /// label exists already. Whether duplicates are allowed is up to the
    /// token.
    pub fn put(
        &self,
        token: &TokenId,
        access: &Access,
        id: &DataId,
        value: &[u8],
    ) -> DataResult<()> {
        trace!(
            "Putting data object {}/{} ({} bytes) on token '{}'",
            id.application,
            id.label,
            value.len(),
            token
        );
        let template = [
            Attribute::Class(ObjectClass::DATA),
            Attribute::Token(true),
            Attribute::Private(!access.is_public),
            Attribute::Application(id.application.as_bytes().to_vec()),
            Attribute::Label(id.label.as_bytes().to_vec()),
            Attribute::Value(value.to_vec()),
        ];

        self.run(token, access, false, "Put", |conn| {
            conn.create_object(&template)?;
            Ok(())
        })
    }

    /// Destroys a data object.
    pub fn delete(
        &self,
        token: &TokenId,
        access: &Access,
        id: &DataId,
    ) -> DataResult<()> {
        trace!(
            "Deleting data object {}/{} on token '{}'",
            id.application, id.label, token
        );
        self.run(token, access, false, "Delete", |conn| {
            let object = locate_data(conn, id)?;
            conn.destroy_object(object)?;
            Ok(())
        })
    }

    /// Lists the application and label of all data objects that are
    /// visible on the token.
    pub fn enumerate(
        &self,
        token: &TokenId,
        access: &Access,
    ) -> DataResult<DataIdList> {
        trace!("Enumerating data objects on token '{}'", token);
        let list = self.run(token, access, true, "Enumerate", build_list)?;
        trace!("Enumerated {} data objects on token '{}'", list.len(), token);
        Ok(list)
    }

    fn fetch(
        &self,
        token: &TokenId,
        access: &Access,
        id: &DataId,
    ) -> DataResult<AttributeValue> {
        trace!(
            "Getting data object {}/{} on token '{}'",
            id.application, id.label, token
        );
        let value = self.run(token, access, true, "Get", |conn| {
            let object = locate_data(conn, id)?;
            fetch_value(conn, object, AttributeKind::Value)
        })?;
        trace!("Got {} bytes from token '{}'", value.len(), token);
        Ok(value)
    }

    /// Runs one operation on the session of a token.
    fn run<T>(
        &self,
        token: &TokenId,
        access: &Access,
        allow_prompt_cache: bool,
        desc: &str,
        op: impl FnMut(&mut C) -> DataResult<T>,
    ) -> DataResult<T> {
        if !self.is_live() {
            return Err(Error::NotInitialized);
        }

        // The session reference is released when it goes out of scope,
        // after the guard has released the lock.
        let session = self.sessions.resolve(token)?;
        let mut guard = session.lock()?;

        let request = LoginRequest {
            token,
            is_public: access.is_public,
            allow_prompt_cache,
            user_context: &access.user_context,
            prompt_mask: access.prompt_mask,
        };
        with_login_retry(&mut guard, self.login.as_ref(), &request, desc, op)
    }
}

fn locate_data<C: Connection>(conn: &mut C, id: &DataId) -> DataResult<C::Object> {
    locate(
        conn,
        ObjectClass::DATA,
        Some(&id.application),
        Some(&id.label),
    )
}

//------------ Tests ---------------------------------------------------------
