//! Test the data object operations through the public API.

use std::sync::Arc;

use pkcs11_data::provider::{Rv, memory::MemoryConnection};
use pkcs11_data::{Access, DataContext, DataId, Error, PinLogin, PromptMask, UserContext};
use secrecy::SecretString;

mod common;

#[test]
fn functional_data_objects() {
    let t = common::token_with_pin("functional");
    let private = Access::private();
    let public = Access::public();

    // Nothing there yet.
    assert!(t.context.enumerate(&t.id, &public).unwrap().is_empty());

    // Store a public and a private value for the same application.
    let config_id = DataId::new("A", "L1");
    let secret_id = DataId::new("A", "L2");
    t.context.put(&t.id, &public, &config_id, b"config").unwrap();
    assert_eq!(t.token.login_count(), 0);
    t.context.put(&t.id, &private, &secret_id, b"secret").unwrap();
    assert_eq!(t.token.login_count(), 1);

    // Both are listed, in no particular order.
    let list = t.context.enumerate(&t.id, &private).unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.contains(&config_id));
    assert!(list.contains(&secret_id));
    list.free();

    // Read the size first, then the value.
    let size = t.context.get(&t.id, &private, &secret_id, None).unwrap();
    let mut buf = vec![0; size];
    t.context.get(&t.id, &private, &secret_id, Some(&mut buf)).unwrap();
    assert_eq!(buf, b"secret");

    // Delete both, leaving an empty token.
    t.context.delete(&t.id, &private, &secret_id).unwrap();
    t.context.delete(&t.id, &public, &config_id).unwrap();
    assert!(t.context.enumerate(&t.id, &public).unwrap().is_empty());
    assert_eq!(t.token.object_count(), 0);
    assert_eq!(t.token.login_count(), 1);
}

#[test]
fn functional_relogin_after_logout() {
    let t = common::token_with_pin("relogin");
    let access = Access::private().with_user_context(UserContext::new(42u32));
    let id = DataId::new("app", "value");

    t.context.put(&t.id, &access, &id, b"v1").unwrap();
    t.token.logout();

    // Reading a private object after logout finds nothing and does not
    // cause a login.
    assert_eq!(t.context.get(&t.id, &access, &id, None), Err(Error::ObjectNotFound));
    assert_eq!(t.token.login_count(), 1);

    // A provider failure does.
    t.token.fail_next("C_FindObjectsInit", Rv::USER_NOT_LOGGED_IN);
    assert_eq!(t.context.get_value(&t.id, &access, &id).unwrap(), b"v1");
    assert_eq!(t.token.login_count(), 2);
}

#[test]
fn functional_wrong_pin() {
    let t = common::token_with_pin("wrong");
    let id = DataId::new("app", "value");
    let access = Access::private().with_prompt_mask(PromptMask::NONE);

    // A login with the correct configured PIN works regardless of the mask.
    t.context.put(&t.id, &access, &id, b"v").unwrap();

    // Replace the login with one that knows a wrong PIN.
    let login = PinLogin::new().with_pin(t.id.clone(), SecretString::new("0000".to_string()));
    let context = DataContext::<MemoryConnection>::initialize(t.pool.clone(), Arc::new(login));
    t.token.logout();
    t.token.fail_next("C_FindObjectsInit", Rv::USER_NOT_LOGGED_IN);

    let err = context.get(&t.id, &access, &id, None).unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{}", err);
}

#[test]
fn functional_token_removal() {
    let t = common::token_with_pin("removal");
    let access = Access::public();
    let id = DataId::new("app", "value");
    t.context.put(&t.id, &access, &id, b"v").unwrap();

    t.token.remove();
    assert_eq!(t.context.get(&t.id, &access, &id, None), Err(Error::SessionInvalid));
    assert_eq!(t.context.enumerate(&t.id, &access), Err(Error::SessionInvalid));

    // The session stays dead, even once the token is back, until the pool
    // holds a new one.
    t.token.insert();
    assert_eq!(t.context.get(&t.id, &access, &id, None), Err(Error::SessionInvalid));
    t.pool.register(t.id.clone(), t.token.connect());
    assert_eq!(t.context.get(&t.id, &access, &id, None), Ok(1));

    assert!(t.pool.remove(&t.id));
    assert_eq!(
        t.context.get(&t.id, &access, &id, None),
        Err(Error::TokenUnknown(t.id.clone()))
    );
}
