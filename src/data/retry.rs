//! Retrying an operation once after logging in again.
//!
//! A session can be valid and still not be authenticated for what an
//! operation touches. The first failure of an operation is therefore taken
//! as the signal to log in, after which the operation is tried exactly
//! once more. Logging in only once bounds the time an operation can take
//! and avoids prompting forever when the credentials are simply wrong.
use log::{debug, warn};

use crate::error::{DataResult, Error};
use crate::login::{Login, LoginRequest};
use crate::provider::Connection;
use crate::session::SessionGuard;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Attempt {
    First,
    Retried,
}

/// Runs `op`, and if it fails with an error that logging in may cure, logs
/// in and runs it once more.
///
/// The session is validated before every attempt, as logging in may take
/// long enough for the token to disappear. Failures that say nothing about
/// credentials are returned immediately. A failing login ends the
/// operation with the login's error as it is, a lost session during login
/// also invalidates the session. Whatever the retried attempt returns is
/// final.
pub fn with_login_retry<C, T, F>(
    guard: &mut SessionGuard<'_, C>,
    login: &dyn Login<C>,
    request: &LoginRequest<'_>,
    desc: &str,
    mut op: F,
) -> DataResult<T>
where
    C: Connection,
    F: FnMut(&mut C) -> DataResult<T>,
{
    let mut attempt = Attempt::First;
    loop {
        guard.validate()?;
        let err = match op(&mut **guard) {
            Ok(res) => return Ok(res),
            Err(err) => err,
        };

        if !err.is_login_retry_candidate() {
            return Err(err);
        }

        match attempt {
            Attempt::First => {
                debug!(
                    "{} on token '{}' failed, logging in and retrying: {}",
                    desc, request.token, err
                );
                attempt = Attempt::Retried;
                if let Err(login_err) = login.login(&mut **guard, request) {
                    warn!(
                        "{} on token '{}' failed, login failed: {}",
                        desc, request.token, login_err
                    );
                    if login_err == Error::SessionInvalid {
                        guard.invalidate();
                    }
                    return Err(login_err);
                }
            }
            Attempt::Retried => {
                let err = err.into_terminal();
                warn!(
                    "{} on token '{}' failed after logging in: {}",
                    desc, request.token, err
                );
                return Err(err);
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------
