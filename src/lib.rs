//! Session scoped access to PKCS#11 data objects.
//!
//! Data objects are small opaque values stored on a token under an
//! application name and a label. This crate reads, writes, deletes and
//! lists them through a [`DataContext`], taking care of serializing access
//! to each token session and of logging in once when the token asks for it.
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod login;
pub mod provider;
pub mod session;

pub use self::data::{Access, DataContext, DataId, DataIdList};
pub use self::error::{DataResult, Error};
pub use self::login::{Login, LoginRequest, PinLogin, PromptMask, UserContext};
pub use self::session::{SessionPool, SessionResolver, TokenId};
