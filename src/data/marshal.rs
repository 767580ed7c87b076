//! Reading attribute values in the provider's two-phase idiom.
//!
//! PKCS#11 has no way to read a value of unknown length in one call. The
//! first C_GetAttributeValue call passes no buffer and learns the length,
//! the second passes a buffer of exactly that length to be filled. Both
//! calls are always made, even for empty values.
use log::trace;

use crate::error::{DataResult, Error};
use crate::provider::{AttributeKind, Connection};

//------------ AttributeValue ------------------------------------------------

/// A value fetched from the token. Owns its buffer, which is released
/// when the value is dropped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValue {
    kind: AttributeKind,
    bytes: Vec<u8>,
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// The value as text. Bytes that are not valid UTF-8 are replaced.
    pub fn into_string(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

//------------ fetch_value ---------------------------------------------------

/// Reads one attribute of an object.
///
/// Provider errors from either phase are returned as they are. An
/// attribute the object does not have results in
/// [`Error::AttributeUnavailable`], while an empty value is returned as
/// such.
pub fn fetch_value<C: Connection>(
    conn: &mut C,
    object: C::Object,
    kind: AttributeKind,
) -> DataResult<AttributeValue> {
    let announced = conn
        .attribute_len(object, kind)?
        .ok_or(Error::AttributeUnavailable(kind))?;
    trace!("{} of object {:?} has {} bytes", kind, object, announced);

    let mut bytes = Vec::new();
    bytes.try_reserve_exact(announced)?;
    bytes.resize(announced, 0);

    let returned = conn.attribute_value(object, kind, &mut bytes)?;
    if returned != announced {
        return Err(Error::AttributeLengthMismatch {
            kind,
            announced,
            returned,
        });
    }

    Ok(AttributeValue { kind, bytes })
}

//------------ Tests ---------------------------------------------------------
