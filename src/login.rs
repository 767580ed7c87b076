//! Logging in to a token when an operation asks for it.
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use log::{debug, warn};
use secrecy::SecretString;

use crate::config::Config;
use crate::error::{DataResult, Error};
use crate::provider::{Connection, Rv};
use crate::session::TokenId;

//------------ PromptMask ----------------------------------------------------

/// Which kinds of interactive prompts a login may show.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PromptMask(u32);

impl PromptMask {
    pub const NONE: PromptMask = PromptMask(0);
    pub const PIN: PromptMask = PromptMask(1 << 0);
    pub const TOKEN: PromptMask = PromptMask(1 << 1);
    pub const ALL: PromptMask = PromptMask(Self::PIN.0 | Self::TOKEN.0);

    pub const fn from_bits(bits: u32) -> Self {
        PromptMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn allows(self, other: PromptMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for PromptMask {
    fn default() -> Self {
        PromptMask::ALL
    }
}

impl fmt::Display for PromptMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

//------------ UserContext ---------------------------------------------------

/// Caller data handed through untouched to the login collaborator.
#[derive(Clone, Default)]
pub struct UserContext(Option<Arc<dyn Any + Send + Sync>>);

impl UserContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        UserContext(Some(Arc::new(value)))
    }

    pub fn none() -> Self {
        UserContext(None)
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("UserContext(..)"),
            None => f.write_str("UserContext(None)"),
        }
    }
}

//------------ LoginRequest --------------------------------------------------

/// Everything a login collaborator gets to know about the login.
#[derive(Clone, Copy, Debug)]
pub struct LoginRequest<'a> {
    pub token: &'a TokenId,
    pub is_public: bool,
    pub allow_prompt_cache: bool,
    pub user_context: &'a UserContext,
    pub prompt_mask: PromptMask,
}

//------------ Login ---------------------------------------------------------

/// Authenticates a session, possibly by asking a person for a PIN.
///
/// Called with the session lock held, so it has the session to itself for
/// as long as it takes.
pub trait Login<C: Connection>: Send + Sync {
    fn login(&self, conn: &mut C, request: &LoginRequest<'_>) -> DataResult<()>;
}

//------------ PinLogin ------------------------------------------------------

/// Asks a person for the PIN of a token. `None` cancels the login.
pub type PinPrompt =
    dyn Fn(&TokenId, &UserContext) -> Option<SecretString> + Send + Sync;

/// Logs in as the normal user using a PIN.
///
/// Public access only logs in if the token requires a login at all.
/// The PIN comes from, in that order: the configured PINs, the cache of
/// earlier prompted PINs (when the request allows it), or the prompt (when
/// the prompt mask allows PIN prompts).
#[derive(Default)]
pub struct PinLogin {
    pins: HashMap<TokenId, SecretString>,
    prompt: Option<Box<PinPrompt>>,
    cache: Mutex<HashMap<TokenId, SecretString>>,
}

impl PinLogin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the user PINs of the configured tokens.
    pub fn from_config(config: &Config) -> Self {
        let mut login = Self::default();
        for token in &config.tokens {
            if let Some(pin) = &token.user_pin {
                login.pins.insert(TokenId::new(&token.name), pin.clone());
            }
        }
        login
    }

    pub fn with_pin(mut self, token: TokenId, pin: SecretString) -> Self {
        self.pins.insert(token, pin);
        self
    }

    pub fn with_prompt(mut self, prompt: Box<PinPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    fn cached_pin(&self, token: &TokenId) -> Option<SecretString> {
        self.cache
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(token)
            .cloned()
    }

    fn cache_pin(&self, token: &TokenId, pin: SecretString) {
        self.cache
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(token.clone(), pin);
    }

    fn forget_pin(&self, token: &TokenId) {
        self.cache
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(token);
    }

    /// Tries a single PIN. `Ok(false)` means the PIN was wrong.
    fn try_pin<C: Connection>(
        conn: &mut C,
        token: &TokenId,
        pin: Option<&SecretString>,
    ) -> DataResult<bool> {
        match conn.login(pin) {
            Ok(()) => Ok(true),
            Err(err) if err.rv() == Rv::USER_ALREADY_LOGGED_IN => {
                debug!("Token '{}' was already logged in", token);
                Ok(true)
            }
            Err(err) if err.rv() == Rv::PIN_INCORRECT => {
                warn!("Incorrect PIN for token '{}'", token);
                Ok(false)
            }
            Err(err) if err.rv().is_session_lost() => {
                warn!("Lost session with token '{}' during login: {}", token, err);
                Err(Error::SessionInvalid)
            }
            Err(err) if err.rv().is_credential_failure() => {
                Err(Error::authentication_failed(err))
            }
            Err(err) => Err(Error::Provider(err)),
        }
    }
}

impl<C: Connection> Login<C> for PinLogin {
    fn login(&self, conn: &mut C, request: &LoginRequest<'_>) -> DataResult<()> {
        let token = request.token;
        debug!(
            "Login to token '{}' requested (public: {}, mask: {})",
            token, request.is_public, request.prompt_mask
        );

        if request.is_public && !conn.login_required() {
            debug!(
                "Token '{}' does not require login for public access",
                token
            );
            return Ok(());
        }

        if let Some(pin) = self.pins.get(token) {
            debug!("Logging in to token '{}' with configured PIN", token);
            if Self::try_pin(conn, token, Some(pin))? {
                return Ok(());
            }
            return Err(Error::authentication_failed(
                "configured PIN was rejected",
            ));
        }

        if request.allow_prompt_cache {
            if let Some(pin) = self.cached_pin(token) {
                debug!("Logging in to token '{}' with cached PIN", token);
                if Self::try_pin(conn, token, Some(&pin))? {
                    return Ok(());
                }
                self.forget_pin(token);
            }
        }

        let prompt = match &self.prompt {
            Some(prompt) if request.prompt_mask.allows(PromptMask::PIN) => prompt,
            _ => {
                return Err(Error::authentication_failed(format!(
                    "no PIN available for token '{}' and prompting is not allowed",
                    token
                )));
            }
        };

        // One prompted PIN per login. A wrong PIN fails the login, the
        // caller's retry budget decides whether there is another chance.
        let pin = prompt(token, request.user_context).ok_or_else(|| {
            Error::authentication_failed("PIN prompt was cancelled")
        })?;
        if Self::try_pin(conn, token, Some(&pin))? {
            self.cache_pin(token, pin);
            Ok(())
        } else {
            Err(Error::authentication_failed("prompted PIN was rejected"))
        }
    }
}

impl fmt::Debug for PinLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinLogin")
            .field("tokens", &self.pins.keys().collect::<Vec<_>>())
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::provider::memory::MemoryToken;

    fn pin(pin: &str) -> SecretString {
        SecretString::new(pin.to_string())
    }

    fn request<'a>(
        token: &'a TokenId,
        user_context: &'a UserContext,
        allow_prompt_cache: bool,
        prompt_mask: PromptMask,
    ) -> LoginRequest<'a> {
        LoginRequest {
            token,
            is_public: false,
            allow_prompt_cache,
            user_context,
            prompt_mask,
        }
    }

    #[test]
    fn prompt_mask_bits() {
        assert!(PromptMask::ALL.allows(PromptMask::PIN));
        assert!(PromptMask::ALL.allows(PromptMask::TOKEN));
        assert!(!PromptMask::TOKEN.allows(PromptMask::PIN));
        assert!(PromptMask::NONE.allows(PromptMask::NONE));
        assert_eq!(PromptMask::from_bits(3), PromptMask::ALL);
    }

    #[test]
    fn user_context_is_passed_through() {
        let ctx = UserContext::new(17u32);
        assert_eq!(ctx.get::<u32>(), Some(&17));
        assert_eq!(ctx.get::<String>(), None);
        assert!(UserContext::none().get::<u32>().is_none());
    }

    #[test]
    fn configured_pin() {
        let token = MemoryToken::with_user_pin("1234");
        let id = TokenId::new("t");
        let ctx = UserContext::none();

        let login = PinLogin::new().with_pin(id.clone(), pin("1234"));
        login
            .login(&mut token.connect(), &request(&id, &ctx, false, PromptMask::NONE))
            .unwrap();
        assert!(token.is_logged_in());

        // Logging in again while logged in is fine.
        login
            .login(&mut token.connect(), &request(&id, &ctx, false, PromptMask::NONE))
            .unwrap();

        token.logout();
        let wrong = PinLogin::new().with_pin(id.clone(), pin("0000"));
        assert!(matches!(
            wrong.login(&mut token.connect(), &request(&id, &ctx, false, PromptMask::NONE)),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn no_prompt_when_mask_forbids_it() {
        let token = MemoryToken::with_user_pin("1234");
        let id = TokenId::new("t");
        let ctx = UserContext::none();
        let prompted = Arc::new(AtomicUsize::new(0));
        let counter = prompted.clone();

        let login = PinLogin::new().with_prompt(Box::new(move |_: &TokenId, _: &UserContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(pin("1234"))
        }));

        let res = login.login(
            &mut token.connect(),
            &request(&id, &ctx, true, PromptMask::TOKEN),
        );
        assert!(matches!(res, Err(Error::AuthenticationFailed(_))));
        assert_eq!(prompted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn prompted_pin_is_cached_when_allowed() {
        let token = MemoryToken::with_user_pin("1234");
        let id = TokenId::new("t");
        let ctx = UserContext::new("caller state".to_string());
        let prompted = Arc::new(AtomicUsize::new(0));
        let counter = prompted.clone();

        let login = PinLogin::new().with_prompt(Box::new(move |_: &TokenId, ctx: &UserContext| {
            assert_eq!(ctx.get::<String>().map(String::as_str), Some("caller state"));
            counter.fetch_add(1, Ordering::SeqCst);
            Some(pin("1234"))
        }));

        login
            .login(&mut token.connect(), &request(&id, &ctx, true, PromptMask::ALL))
            .unwrap();
        token.logout();
        login
            .login(&mut token.connect(), &request(&id, &ctx, true, PromptMask::ALL))
            .unwrap();
        assert_eq!(prompted.load(Ordering::SeqCst), 1);

        // Without the cache the prompt is shown again.
        token.logout();
        login
            .login(&mut token.connect(), &request(&id, &ctx, false, PromptMask::ALL))
            .unwrap();
        assert_eq!(prompted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn login_errors_keep_their_kind() {
        let id = TokenId::new("t");
        let ctx = UserContext::none();
        let login = PinLogin::new().with_pin(id.clone(), pin("1234"));
        let req = request(&id, &ctx, false, PromptMask::NONE);

        let token = MemoryToken::with_user_pin("1234");
        let mut conn = token.connect();
        token.remove();
        assert_eq!(login.login(&mut conn, &req), Err(Error::SessionInvalid));

        let token = MemoryToken::with_user_pin("1234");
        token.fail_next("C_Login", Rv::DEVICE_ERROR);
        assert!(matches!(
            login.login(&mut token.connect(), &req),
            Err(Error::Provider(ref err)) if err.rv() == Rv::DEVICE_ERROR
        ));

        token.fail_next("C_Login", Rv::PIN_LOCKED);
        assert!(matches!(
            login.login(&mut token.connect(), &req),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn public_login_only_when_required() {
        let token = MemoryToken::with_user_pin("1234");
        let id = TokenId::new("t");
        let ctx = UserContext::none();
        let login = PinLogin::new().with_pin(id.clone(), pin("1234"));
        let public = LoginRequest {
            is_public: true,
            ..request(&id, &ctx, false, PromptMask::NONE)
        };

        token.set_login_required(false);
        login.login(&mut token.connect(), &public).unwrap();
        assert!(!token.is_logged_in());

        token.set_login_required(true);
        login.login(&mut token.connect(), &public).unwrap();
        assert!(token.is_logged_in());
    }

    #[test]
    fn cancelled_prompt_fails() {
        let token = MemoryToken::with_user_pin("1234");
        let id = TokenId::new("t");
        let ctx = UserContext::none();

        let login = PinLogin::new().with_prompt(Box::new(|_: &TokenId, _: &UserContext| None));
        assert!(matches!(
            login.login(&mut token.connect(), &request(&id, &ctx, true, PromptMask::ALL)),
            Err(Error::AuthenticationFailed(_))
        ));
    }
}
