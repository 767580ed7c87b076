//! The token provider call surface.
//!
//! Everything this crate asks of a PKCS#11 provider goes through the
//! [`Connection`] trait: creating and destroying objects, the
//! begin/continue/end object search and the two-phase attribute read. A
//! connection stands for one open session with one token. It is never used
//! by more than one caller at a time, which is why all calls take
//! `&mut self`.
use std::fmt;

use secrecy::SecretString;

#[cfg(feature = "hsm")]
pub mod cryptoki;
pub mod memory;

//------------ Connection ----------------------------------------------------

pub trait Connection: Send {
    /// A session scoped reference to a token resident object.
    type Object: Copy + fmt::Debug + Send;

    /// Is the underlying provider session still usable?
    ///
    /// Returns false once the token was removed or the provider was shut
    /// down since the session was opened.
    fn is_valid(&mut self) -> bool;

    /// C_CreateObject
    fn create_object(
        &mut self,
        template: &[Attribute],
    ) -> Result<Self::Object, ProviderError>;

    /// C_DestroyObject
    fn destroy_object(
        &mut self,
        object: Self::Object,
    ) -> Result<(), ProviderError>;

    /// C_FindObjectsInit
    ///
    /// A session can have at most one active search. A search must be
    /// initialized, its results fetched, and then finalized before the
    /// session can start another one.
    fn find_objects_init(
        &mut self,
        filter: &AttributeFilter,
    ) -> Result<(), ProviderError>;

    /// C_FindObjects, returns at most `max_count` handles. An empty result
    /// means the search is exhausted.
    fn find_objects(
        &mut self,
        max_count: usize,
    ) -> Result<Vec<Self::Object>, ProviderError>;

    /// C_FindObjectsFinal
    fn find_objects_final(&mut self) -> Result<(), ProviderError>;

    /// C_GetAttributeValue without a value buffer.
    ///
    /// Returns the length in bytes of the attribute value, or `None` when
    /// the provider answered with the "invalid length" sentinel, i.e. the
    /// object has no such attribute or it cannot be revealed.
    fn attribute_len(
        &mut self,
        object: Self::Object,
        kind: AttributeKind,
    ) -> Result<Option<usize>, ProviderError>;

    /// C_GetAttributeValue with a value buffer.
    ///
    /// Fills `buf` and returns the number of bytes the provider reports
    /// for the value.
    fn attribute_value(
        &mut self,
        object: Self::Object,
        kind: AttributeKind,
        buf: &mut [u8],
    ) -> Result<usize, ProviderError>;

    /// C_Login as the normal user. A `None` PIN means the token has a
    /// protected authentication path (e.g. a PIN pad).
    fn login(&mut self, pin: Option<&SecretString>)
    -> Result<(), ProviderError>;

    /// Does the token need a login before any object can be used?
    ///
    /// This is the CKF_LOGIN_REQUIRED flag of the token.
    fn login_required(&mut self) -> bool;
}

//------------ ObjectClass ---------------------------------------------------

/// The CKA_CLASS of a token object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectClass(u64);

impl ObjectClass {
    pub const DATA: ObjectClass = ObjectClass(0x0000_0000);
    pub const CERTIFICATE: ObjectClass = ObjectClass(0x0000_0001);
    pub const PUBLIC_KEY: ObjectClass = ObjectClass(0x0000_0002);
    pub const PRIVATE_KEY: ObjectClass = ObjectClass(0x0000_0003);
    pub const SECRET_KEY: ObjectClass = ObjectClass(0x0000_0004);

    pub const fn new(value: u64) -> Self {
        ObjectClass(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ObjectClass::DATA => write!(f, "CKO_DATA"),
            ObjectClass::CERTIFICATE => write!(f, "CKO_CERTIFICATE"),
            ObjectClass::PUBLIC_KEY => write!(f, "CKO_PUBLIC_KEY"),
            ObjectClass::PRIVATE_KEY => write!(f, "CKO_PRIVATE_KEY"),
            ObjectClass::SECRET_KEY => write!(f, "CKO_SECRET_KEY"),
            ObjectClass(other) => write!(f, "CKO_{:#010x}", other),
        }
    }
}

//------------ AttributeKind -------------------------------------------------

/// The attribute types this crate reads or writes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeKind {
    Class,
    Token,
    Private,
    Application,
    Label,
    Value,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AttributeKind::Class => "CKA_CLASS",
            AttributeKind::Token => "CKA_TOKEN",
            AttributeKind::Private => "CKA_PRIVATE",
            AttributeKind::Application => "CKA_APPLICATION",
            AttributeKind::Label => "CKA_LABEL",
            AttributeKind::Value => "CKA_VALUE",
        };
        f.write_str(name)
    }
}

//------------ Attribute -----------------------------------------------------

/// A typed attribute as passed to the provider in templates and filters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    Token(bool),
    Private(bool),
    Application(Vec<u8>),
    Label(Vec<u8>),
    Value(Vec<u8>),
}

impl Attribute {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Attribute::Class(_) => AttributeKind::Class,
            Attribute::Token(_) => AttributeKind::Token,
            Attribute::Private(_) => AttributeKind::Private,
            Attribute::Application(_) => AttributeKind::Application,
            Attribute::Label(_) => AttributeKind::Label,
            Attribute::Value(_) => AttributeKind::Value,
        }
    }
}

//------------ AttributeFilter -----------------------------------------------

/// The search template for C_FindObjectsInit.
///
/// The object class is always present. Application and label are only
/// part of the filter when given; an absent entry matches any value while
/// an empty string only matches an empty value. All entries must match.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeFilter {
    entries: Vec<Attribute>,
}

impl AttributeFilter {
    pub fn class(class: ObjectClass) -> Self {
        AttributeFilter {
            entries: vec![Attribute::Class(class)],
        }
    }

    pub fn with_application(mut self, application: Option<&str>) -> Self {
        if let Some(application) = application {
            self.entries
                .push(Attribute::Application(application.as_bytes().to_vec()));
        }
        self
    }

    pub fn with_label(mut self, label: Option<&str>) -> Self {
        if let Some(label) = label {
            self.entries.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        self
    }

    pub fn entries(&self) -> &[Attribute] {
        &self.entries
    }

    /// Does an object with the given attributes satisfy every entry?
    pub fn matches(&self, attributes: &[Attribute]) -> bool {
        self.entries.iter().all(|entry| attributes.contains(entry))
    }
}

//------------ Rv ------------------------------------------------------------

/// A PKCS#11 CK_RV return value.
///
/// Only the codes this crate gives a meaning to have a name, all others are
/// passed through unchanged.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Rv(u64);

impl Rv {
    pub const OK: Rv = Rv(0x0000_0000);
    pub const HOST_MEMORY: Rv = Rv(0x0000_0002);
    pub const GENERAL_ERROR: Rv = Rv(0x0000_0005);
    pub const FUNCTION_FAILED: Rv = Rv(0x0000_0006);
    pub const ARGUMENTS_BAD: Rv = Rv(0x0000_0007);
    pub const ATTRIBUTE_SENSITIVE: Rv = Rv(0x0000_0011);
    pub const ATTRIBUTE_TYPE_INVALID: Rv = Rv(0x0000_0012);
    pub const ATTRIBUTE_VALUE_INVALID: Rv = Rv(0x0000_0013);
    pub const ACTION_PROHIBITED: Rv = Rv(0x0000_001B);
    pub const DEVICE_ERROR: Rv = Rv(0x0000_0030);
    pub const DEVICE_REMOVED: Rv = Rv(0x0000_0032);
    pub const OBJECT_HANDLE_INVALID: Rv = Rv(0x0000_0082);
    pub const OPERATION_ACTIVE: Rv = Rv(0x0000_0090);
    pub const OPERATION_NOT_INITIALIZED: Rv = Rv(0x0000_0091);
    pub const PIN_INCORRECT: Rv = Rv(0x0000_00A0);
    pub const PIN_INVALID: Rv = Rv(0x0000_00A1);
    pub const PIN_EXPIRED: Rv = Rv(0x0000_00A3);
    pub const PIN_LOCKED: Rv = Rv(0x0000_00A4);
    pub const SESSION_CLOSED: Rv = Rv(0x0000_00B0);
    pub const SESSION_HANDLE_INVALID: Rv = Rv(0x0000_00B3);
    pub const SESSION_READ_ONLY: Rv = Rv(0x0000_00B5);
    pub const TEMPLATE_INCOMPLETE: Rv = Rv(0x0000_00D0);
    pub const TOKEN_NOT_PRESENT: Rv = Rv(0x0000_00E0);
    pub const TOKEN_WRITE_PROTECTED: Rv = Rv(0x0000_00E2);
    pub const USER_ALREADY_LOGGED_IN: Rv = Rv(0x0000_0100);
    pub const USER_NOT_LOGGED_IN: Rv = Rv(0x0000_0101);
    pub const USER_PIN_NOT_INITIALIZED: Rv = Rv(0x0000_0102);
    pub const BUFFER_TOO_SMALL: Rv = Rv(0x0000_0150);
    pub const FUNCTION_REJECTED: Rv = Rv(0x0000_0200);

    pub const fn new(value: u64) -> Self {
        Rv(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Does this code say the caller lacks, or gave wrong, credentials?
    pub fn is_credential_failure(self) -> bool {
        matches!(
            self,
            Rv::USER_NOT_LOGGED_IN
                | Rv::PIN_INCORRECT
                | Rv::PIN_INVALID
                | Rv::PIN_EXPIRED
                | Rv::PIN_LOCKED
                | Rv::USER_PIN_NOT_INITIALIZED
        )
    }

    /// Does this code say the session or the token is gone?
    pub fn is_session_lost(self) -> bool {
        matches!(
            self,
            Rv::DEVICE_REMOVED
                | Rv::SESSION_HANDLE_INVALID
                | Rv::SESSION_CLOSED
                | Rv::TOKEN_NOT_PRESENT
        )
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Rv::OK => "CKR_OK",
            Rv::HOST_MEMORY => "CKR_HOST_MEMORY",
            Rv::GENERAL_ERROR => "CKR_GENERAL_ERROR",
            Rv::FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
            Rv::ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
            Rv::ATTRIBUTE_SENSITIVE => "CKR_ATTRIBUTE_SENSITIVE",
            Rv::ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
            Rv::ATTRIBUTE_VALUE_INVALID => "CKR_ATTRIBUTE_VALUE_INVALID",
            Rv::ACTION_PROHIBITED => "CKR_ACTION_PROHIBITED",
            Rv::DEVICE_ERROR => "CKR_DEVICE_ERROR",
            Rv::DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
            Rv::OBJECT_HANDLE_INVALID => "CKR_OBJECT_HANDLE_INVALID",
            Rv::OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
            Rv::OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
            Rv::PIN_INCORRECT => "CKR_PIN_INCORRECT",
            Rv::PIN_INVALID => "CKR_PIN_INVALID",
            Rv::PIN_EXPIRED => "CKR_PIN_EXPIRED",
            Rv::PIN_LOCKED => "CKR_PIN_LOCKED",
            Rv::SESSION_CLOSED => "CKR_SESSION_CLOSED",
            Rv::SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
            Rv::SESSION_READ_ONLY => "CKR_SESSION_READ_ONLY",
            Rv::TEMPLATE_INCOMPLETE => "CKR_TEMPLATE_INCOMPLETE",
            Rv::TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
            Rv::TOKEN_WRITE_PROTECTED => "CKR_TOKEN_WRITE_PROTECTED",
            Rv::USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
            Rv::USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
            Rv::USER_PIN_NOT_INITIALIZED => "CKR_USER_PIN_NOT_INITIALIZED",
            Rv::BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
            Rv::FUNCTION_REJECTED => "CKR_FUNCTION_REJECTED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Rv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#x})", name, self.0),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

//------------ ProviderError -------------------------------------------------

/// A failed provider call: the function that failed and its return value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderError {
    function: &'static str,
    rv: Rv,
    detail: Option<String>,
}

impl ProviderError {
    pub fn new(function: &'static str, rv: Rv) -> Self {
        ProviderError {
            function,
            rv,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn rv(&self) -> Rv {
        self.rv
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}() failed: {}", self.function, self.rv)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {}

//------------ Tests ---------------------------------------------------------
