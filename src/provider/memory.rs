//! A software token that keeps its objects in memory.
//!
//! It follows the PKCS#11 rules that matter for data objects: private
//! objects can neither be seen nor created before the user logged in, the
//! login state is shared by all sessions of the token, a session supports
//! one search at a time, and a removed token invalidates its sessions.
//!
//! For testing, calls can be made to fail with a chosen return value and
//! the token keeps track of how many callers were inside it at once.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use secrecy::{ExposeSecret, SecretString};

use super::{
    Attribute, AttributeFilter, AttributeKind, Connection, ProviderError, Rv,
};

//------------ MemoryToken ---------------------------------------------------

/// A handle to an in-memory token. Clones refer to the same token.
#[derive(Clone, Debug, Default)]
pub struct MemoryToken {
    state: Arc<Mutex<TokenState>>,
    calls: Arc<CallTracker>,
}

#[derive(Debug)]
struct TokenState {
    present: bool,
    epoch: u64,
    user_pin: Option<SecretString>,
    logged_in: bool,
    login_count: usize,
    login_required: bool,
    objects: BTreeMap<u64, Vec<Attribute>>,
    next_handle: u64,
    faults: VecDeque<Fault>,
}

/// A call to `function` that fails with `rv` once `skip` earlier calls of
/// it went through.
#[derive(Debug)]
struct Fault {
    function: &'static str,
    skip: usize,
    rv: Rv,
}

impl Default for TokenState {
    fn default() -> Self {
        TokenState {
            present: true,
            epoch: 0,
            user_pin: None,
            logged_in: false,
            login_count: 0,
            login_required: true,
            objects: BTreeMap::new(),
            next_handle: 1,
            faults: VecDeque::new(),
        }
    }
}

impl MemoryToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token whose user logs in with the given PIN.
    pub fn with_user_pin(pin: &str) -> Self {
        let token = Self::default();
        token.state().user_pin = Some(SecretString::new(pin.to_string()));
        token
    }

    /// Opens a new session with this token.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            token: self.clone(),
            epoch: self.state().epoch,
            search: None,
        }
    }

    /// Pulls the token out of its slot. All open sessions become invalid
    /// and the login state is lost.
    pub fn remove(&self) {
        let mut state = self.state();
        state.present = false;
        state.logged_in = false;
        state.epoch += 1;
    }

    /// Puts the token back. Sessions opened before removal stay invalid.
    pub fn insert(&self) {
        self.state().present = true;
    }

    pub fn logout(&self) {
        self.state().logged_in = false;
    }

    pub fn is_logged_in(&self) -> bool {
        self.state().logged_in
    }

    /// The number of successful C_Login calls so far.
    pub fn login_count(&self) -> usize {
        self.state().login_count
    }

    /// The number of objects stored, visible or not.
    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    /// Sets whether the token asks for a login before any object can be
    /// used. Tokens require it by default.
    pub fn set_login_required(&self, required: bool) {
        self.state().login_required = required;
    }

    /// Makes the next call of `function` (e.g. "C_CreateObject") fail with
    /// `rv`. Faults queue up, each is used once.
    pub fn fail_next(&self, function: &'static str, rv: Rv) {
        self.fail_nth(function, 1, rv);
    }

    /// Makes the `n`th call of `function` from now on fail with `rv`,
    /// counting from one. Each fault is used once.
    pub fn fail_nth(&self, function: &'static str, n: usize, rv: Rv) {
        self.state().faults.push_back(Fault {
            function,
            skip: n.saturating_sub(1),
            rv,
        });
    }

    /// Makes every provider call take at least this long.
    pub fn set_call_delay(&self, delay: Duration) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.calls.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// The highest number of callers that were inside the token at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.calls.max.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

//------------ CallTracker ---------------------------------------------------

#[derive(Debug, Default)]
struct CallTracker {
    current: AtomicUsize,
    max: AtomicUsize,
    delay_ms: AtomicU64,
}

struct CallGuard<'a>(&'a CallTracker);

impl CallTracker {
    fn enter(&self) -> CallGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        CallGuard(self)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

//------------ MemoryConnection ----------------------------------------------

/// A session with a [`MemoryToken`].
#[derive(Debug)]
pub struct MemoryConnection {
    token: MemoryToken,
    epoch: u64,
    search: Option<VecDeque<u64>>,
}

impl MemoryConnection {
    /// Locks the token state for one provider call, after checking the
    /// session and any queued fault for `function`.
    fn begin(
        &self,
        function: &'static str,
    ) -> Result<MutexGuard<'_, TokenState>, ProviderError> {
        let mut state = self.token.state();
        if !state.present {
            return Err(ProviderError::new(function, Rv::DEVICE_REMOVED));
        }
        if state.epoch != self.epoch {
            return Err(ProviderError::new(function, Rv::SESSION_HANDLE_INVALID));
        }
        let mut due = None;
        for (pos, fault) in state.faults.iter_mut().enumerate() {
            if fault.function != function {
                continue;
            }
            match fault.skip {
                0 if due.is_none() => due = Some(pos),
                0 => {}
                _ => fault.skip -= 1,
            }
        }
        if let Some(fault) = due.and_then(|pos| state.faults.remove(pos)) {
            return Err(ProviderError::new(function, fault.rv));
        }
        Ok(state)
    }
}

impl TokenState {
    fn is_visible(&self, attributes: &[Attribute]) -> bool {
        self.logged_in || !attributes.contains(&Attribute::Private(true))
    }

    fn visible_object(
        &self,
        function: &'static str,
        handle: u64,
    ) -> Result<&Vec<Attribute>, ProviderError> {
        self.objects
            .get(&handle)
            .filter(|attributes| self.is_visible(attributes))
            .ok_or_else(|| ProviderError::new(function, Rv::OBJECT_HANDLE_INVALID))
    }
}

fn encode(attribute: &Attribute) -> Vec<u8> {
    match attribute {
        Attribute::Class(class) => class.value().to_ne_bytes().to_vec(),
        Attribute::Token(flag) | Attribute::Private(flag) => vec![u8::from(*flag)],
        Attribute::Application(bytes)
        | Attribute::Label(bytes)
        | Attribute::Value(bytes) => bytes.clone(),
    }
}

fn find_attribute(
    attributes: &[Attribute],
    kind: AttributeKind,
) -> Option<&Attribute> {
    attributes.iter().find(|attribute| attribute.kind() == kind)
}

impl Connection for MemoryConnection {
    type Object = u64;

    fn is_valid(&mut self) -> bool {
        let state = self.token.state();
        state.present && state.epoch == self.epoch
    }

    fn create_object(
        &mut self,
        template: &[Attribute],
    ) -> Result<u64, ProviderError> {
        const F: &str = "C_CreateObject";
        let _call = self.token.calls.enter();
        let mut state = self.begin(F)?;

        if find_attribute(template, AttributeKind::Class).is_none() {
            return Err(ProviderError::new(F, Rv::TEMPLATE_INCOMPLETE));
        }
        if !state.is_visible(template) {
            return Err(ProviderError::new(F, Rv::USER_NOT_LOGGED_IN));
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(handle, template.to_vec());
        Ok(handle)
    }

    fn destroy_object(&mut self, object: u64) -> Result<(), ProviderError> {
        const F: &str = "C_DestroyObject";
        let _call = self.token.calls.enter();
        let mut state = self.begin(F)?;

        state.visible_object(F, object)?;
        state.objects.remove(&object);
        Ok(())
    }

    fn find_objects_init(
        &mut self,
        filter: &AttributeFilter,
    ) -> Result<(), ProviderError> {
        const F: &str = "C_FindObjectsInit";
        let _call = self.token.calls.enter();
        let state = self.begin(F)?;

        if self.search.is_some() {
            return Err(ProviderError::new(F, Rv::OPERATION_ACTIVE));
        }
        let found = state
            .objects
            .iter()
            .filter(|(_, attributes)| state.is_visible(attributes))
            .filter(|(_, attributes)| filter.matches(attributes))
            .map(|(handle, _)| *handle)
            .collect();
        drop(state);

        self.search = Some(found);
        Ok(())
    }

    fn find_objects(
        &mut self,
        max_count: usize,
    ) -> Result<Vec<u64>, ProviderError> {
        const F: &str = "C_FindObjects";
        let _call = self.token.calls.enter();
        drop(self.begin(F)?);

        let search = self
            .search
            .as_mut()
            .ok_or_else(|| ProviderError::new(F, Rv::OPERATION_NOT_INITIALIZED))?;
        let count = max_count.min(search.len());
        Ok(search.drain(..count).collect())
    }

    fn find_objects_final(&mut self) -> Result<(), ProviderError> {
        const F: &str = "C_FindObjectsFinal";
        let _call = self.token.calls.enter();
        let result = self.begin(F).map(drop);

        // The search ends even when the call fails, the session must not
        // be stuck with an active operation.
        match self.search.take() {
            Some(_) => result,
            None => result.and(Err(ProviderError::new(
                F,
                Rv::OPERATION_NOT_INITIALIZED,
            ))),
        }
    }

    fn attribute_len(
        &mut self,
        object: u64,
        kind: AttributeKind,
    ) -> Result<Option<usize>, ProviderError> {
        const F: &str = "C_GetAttributeValue";
        let _call = self.token.calls.enter();
        let state = self.begin(F)?;

        let attributes = state.visible_object(F, object)?;
        Ok(find_attribute(attributes, kind).map(|a| encode(a).len()))
    }

    fn attribute_value(
        &mut self,
        object: u64,
        kind: AttributeKind,
        buf: &mut [u8],
    ) -> Result<usize, ProviderError> {
        const F: &str = "C_GetAttributeValue";
        let _call = self.token.calls.enter();
        let state = self.begin(F)?;

        let attributes = state.visible_object(F, object)?;
        let value = find_attribute(attributes, kind)
            .map(encode)
            .ok_or_else(|| ProviderError::new(F, Rv::ATTRIBUTE_TYPE_INVALID))?;
        if buf.len() < value.len() {
            return Err(ProviderError::new(F, Rv::BUFFER_TOO_SMALL));
        }
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    }

    fn login(&mut self, pin: Option<&SecretString>) -> Result<(), ProviderError> {
        const F: &str = "C_Login";
        let _call = self.token.calls.enter();
        let mut state = self.begin(F)?;

        if state.logged_in {
            return Err(ProviderError::new(F, Rv::USER_ALREADY_LOGGED_IN));
        }
        let accepted = match (&state.user_pin, pin) {
            (None, _) => {
                return Err(ProviderError::new(F, Rv::USER_PIN_NOT_INITIALIZED));
            }
            (Some(_), None) => false,
            (Some(expected), Some(given)) => {
                expected.expose_secret() == given.expose_secret()
            }
        };
        if !accepted {
            return Err(ProviderError::new(F, Rv::PIN_INCORRECT));
        }

        state.logged_in = true;
        state.login_count += 1;
        Ok(())
    }

    fn login_required(&mut self) -> bool {
        self.token.state().login_required
    }
}

//------------ Tests ---------------------------------------------------------
