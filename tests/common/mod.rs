//! Shared set up for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use pkcs11_data::provider::memory::{MemoryConnection, MemoryToken};
use pkcs11_data::{DataContext, PinLogin, SessionPool, TokenId};
use secrecy::SecretString;

pub const USER_PIN: &str = "1234";

/// A memory token registered under a name, with a context using it.
pub struct TestToken {
    pub token: MemoryToken,
    pub id: TokenId,
    pub pool: Arc<SessionPool<MemoryConnection>>,
    pub context: DataContext<MemoryConnection>,
}

/// Sets up a token whose user PIN is configured for the login.
pub fn token_with_pin(name: &str) -> TestToken {
    let token = MemoryToken::with_user_pin(USER_PIN);
    let id = TokenId::new(name);
    let pool = Arc::new(SessionPool::new());
    pool.register(id.clone(), token.connect());

    let login = PinLogin::new().with_pin(id.clone(), SecretString::new(USER_PIN.to_string()));
    let context = DataContext::<MemoryConnection>::initialize(pool.clone(), Arc::new(login));
    TestToken {
        token,
        id,
        pool,
        context,
    }
}
