//! Connections to real tokens through a PKCS#11 module.
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
};

use cryptoki::{
    context::{CInitializeArgs, CInitializeFlags, Pkcs11},
    error::{Error as CkError, RvError},
    object::{
        Attribute as CkAttribute, AttributeInfo, AttributeType, ObjectClass as CkClass,
        ObjectHandle,
    },
    session::{Session, UserType},
    slot::Slot,
    types::AuthPin,
};
use log::{debug, info, trace};
use secrecy::{ExposeSecret, SecretString};

use crate::config::{Config, ConfigError, SlotIdOrLabel, TokenConfig};
use crate::session::{SessionPool, TokenId};

use super::{
    Attribute, AttributeFilter, AttributeKind, Connection, ObjectClass, ProviderError, Rv,
};

//------------ CryptokiConnection --------------------------------------------

/// A read/write session with a token in a PKCS#11 module.
///
/// The session is closed when the connection is dropped. The module is
/// finalized once its last session is gone.
pub struct CryptokiConnection {
    session: Session,
    search: Option<VecDeque<ObjectHandle>>,
    login_required: bool,
}

impl CryptokiConnection {
    /// Opens a session with the token in `slot` of a loaded module.
    pub fn open(module: &Pkcs11, slot: Slot) -> Result<Self, ProviderError> {
        let login_required = module
            .get_token_info(slot)
            .map_err(|err| provider_error("C_GetTokenInfo", err))?
            .login_required();
        let session = module
            .open_rw_session(slot)
            .map_err(|err| provider_error("C_OpenSession", err))?;
        Ok(CryptokiConnection {
            session,
            search: None,
            login_required,
        })
    }
}

impl Connection for CryptokiConnection {
    type Object = ObjectHandle;

    fn is_valid(&mut self) -> bool {
        self.session.get_session_info().is_ok()
    }

    fn create_object(
        &mut self,
        template: &[Attribute],
    ) -> Result<ObjectHandle, ProviderError> {
        const F: &str = "C_CreateObject";
        let template = to_template(F, template)?;
        self.session
            .create_object(&template)
            .map_err(|err| provider_error(F, err))
    }

    fn destroy_object(&mut self, object: ObjectHandle) -> Result<(), ProviderError> {
        self.session
            .destroy_object(object)
            .map_err(|err| provider_error("C_DestroyObject", err))
    }

    fn find_objects_init(
        &mut self,
        filter: &AttributeFilter,
    ) -> Result<(), ProviderError> {
        const F: &str = "C_FindObjectsInit";
        if self.search.is_some() {
            return Err(ProviderError::new(F, Rv::OPERATION_ACTIVE));
        }

        // The session runs a complete search itself, so the results are
        // kept here and handed out in batches.
        let template = to_template(F, filter.entries())?;
        let found = self
            .session
            .find_objects(&template)
            .map_err(|err| provider_error(F, err))?;
        trace!("C_FindObjects found {} objects", found.len());
        self.search = Some(found.into());
        Ok(())
    }

    fn find_objects(
        &mut self,
        max_count: usize,
    ) -> Result<Vec<ObjectHandle>, ProviderError> {
        let search = self.search.as_mut().ok_or_else(|| {
            ProviderError::new("C_FindObjects", Rv::OPERATION_NOT_INITIALIZED)
        })?;
        let count = max_count.min(search.len());
        Ok(search.drain(..count).collect())
    }

    fn find_objects_final(&mut self) -> Result<(), ProviderError> {
        match self.search.take() {
            Some(_) => Ok(()),
            None => Err(ProviderError::new(
                "C_FindObjectsFinal",
                Rv::OPERATION_NOT_INITIALIZED,
            )),
        }
    }

    fn attribute_len(
        &mut self,
        object: ObjectHandle,
        kind: AttributeKind,
    ) -> Result<Option<usize>, ProviderError> {
        const F: &str = "C_GetAttributeValue";
        let info = self
            .session
            .get_attribute_info(object, &[attribute_type(kind)])
            .map_err(|err| provider_error(F, err))?;
        match info.first() {
            Some(AttributeInfo::Available(len)) => Ok(Some(*len)),
            Some(_) => Ok(None),
            None => Err(ProviderError::new(F, Rv::GENERAL_ERROR)
                .with_detail("no attribute information returned")),
        }
    }

    fn attribute_value(
        &mut self,
        object: ObjectHandle,
        kind: AttributeKind,
        buf: &mut [u8],
    ) -> Result<usize, ProviderError> {
        const F: &str = "C_GetAttributeValue";
        let attributes = self
            .session
            .get_attributes(object, &[attribute_type(kind)])
            .map_err(|err| provider_error(F, err))?;
        let value = match attributes.first() {
            Some(attribute) => attribute_bytes(F, attribute)?,
            None => return Err(ProviderError::new(F, Rv::ATTRIBUTE_TYPE_INVALID)),
        };
        let dest = buf
            .get_mut(..value.len())
            .ok_or_else(|| ProviderError::new(F, Rv::BUFFER_TOO_SMALL))?;
        dest.copy_from_slice(&value);
        Ok(value.len())
    }

    fn login(&mut self, pin: Option<&SecretString>) -> Result<(), ProviderError> {
        let pin = pin.map(|pin| AuthPin::new(pin.expose_secret().as_str().into()));
        self.session
            .login(UserType::User, pin.as_ref())
            .map_err(|err| provider_error("C_Login", err))
    }

    fn login_required(&mut self) -> bool {
        self.login_required
    }
}

//------------ Conversions ---------------------------------------------------

fn attribute_type(kind: AttributeKind) -> AttributeType {
    match kind {
        AttributeKind::Class => AttributeType::Class,
        AttributeKind::Token => AttributeType::Token,
        AttributeKind::Private => AttributeType::Private,
        AttributeKind::Application => AttributeType::Application,
        AttributeKind::Label => AttributeType::Label,
        AttributeKind::Value => AttributeType::Value,
    }
}

const CLASSES: [(ObjectClass, CkClass); 5] = [
    (ObjectClass::DATA, CkClass::DATA),
    (ObjectClass::CERTIFICATE, CkClass::CERTIFICATE),
    (ObjectClass::PUBLIC_KEY, CkClass::PUBLIC_KEY),
    (ObjectClass::PRIVATE_KEY, CkClass::PRIVATE_KEY),
    (ObjectClass::SECRET_KEY, CkClass::SECRET_KEY),
];

fn to_template(
    function: &'static str,
    attributes: &[Attribute],
) -> Result<Vec<CkAttribute>, ProviderError> {
    attributes
        .iter()
        .map(|attribute| {
            Ok(match attribute {
                Attribute::Class(class) => {
                    let class = CLASSES
                        .iter()
                        .find(|(ours, _)| ours == class)
                        .map(|(_, theirs)| *theirs)
                        .ok_or_else(|| {
                            ProviderError::new(function, Rv::ATTRIBUTE_VALUE_INVALID)
                                .with_detail(class)
                        })?;
                    CkAttribute::Class(class)
                }
                Attribute::Token(flag) => CkAttribute::Token(*flag),
                Attribute::Private(flag) => CkAttribute::Private(*flag),
                Attribute::Application(bytes) => CkAttribute::Application(bytes.clone()),
                Attribute::Label(bytes) => CkAttribute::Label(bytes.clone()),
                Attribute::Value(bytes) => CkAttribute::Value(bytes.clone()),
            })
        })
        .collect()
}

/// Returns the value of an attribute in the same encoding as the token.
fn attribute_bytes(
    function: &'static str,
    attribute: &CkAttribute,
) -> Result<Vec<u8>, ProviderError> {
    match attribute {
        CkAttribute::Application(bytes)
        | CkAttribute::Label(bytes)
        | CkAttribute::Value(bytes) => Ok(bytes.clone()),
        CkAttribute::Token(flag) | CkAttribute::Private(flag) => Ok(vec![u8::from(*flag)]),
        CkAttribute::Class(class) => CLASSES
            .iter()
            .find(|(_, theirs)| theirs == class)
            .map(|(ours, _)| ours.value().to_ne_bytes().to_vec())
            .ok_or_else(|| {
                ProviderError::new(function, Rv::ATTRIBUTE_VALUE_INVALID)
                    .with_detail(class)
            }),
        other => Err(ProviderError::new(function, Rv::ATTRIBUTE_TYPE_INVALID)
            .with_detail(format!("{:?}", other.attribute_type()))),
    }
}

fn provider_error(function: &'static str, err: CkError) -> ProviderError {
    match err {
        CkError::Pkcs11(rv, _) => {
            let code = rv_code(rv);
            match code {
                Some(code) => ProviderError::new(function, code),
                None => ProviderError::new(function, Rv::FUNCTION_FAILED)
                    .with_detail(format!("{:?}", rv)),
            }
        }
        other => ProviderError::new(function, Rv::GENERAL_ERROR).with_detail(other),
    }
}

fn rv_code(rv: RvError) -> Option<Rv> {
    let code = match rv {
        RvError::HostMemory => Rv::HOST_MEMORY,
        RvError::GeneralError => Rv::GENERAL_ERROR,
        RvError::FunctionFailed => Rv::FUNCTION_FAILED,
        RvError::ArgumentsBad => Rv::ARGUMENTS_BAD,
        RvError::AttributeSensitive => Rv::ATTRIBUTE_SENSITIVE,
        RvError::AttributeTypeInvalid => Rv::ATTRIBUTE_TYPE_INVALID,
        RvError::AttributeValueInvalid => Rv::ATTRIBUTE_VALUE_INVALID,
        RvError::ActionProhibited => Rv::ACTION_PROHIBITED,
        RvError::DeviceError => Rv::DEVICE_ERROR,
        RvError::DeviceRemoved => Rv::DEVICE_REMOVED,
        RvError::ObjectHandleInvalid => Rv::OBJECT_HANDLE_INVALID,
        RvError::OperationActive => Rv::OPERATION_ACTIVE,
        RvError::OperationNotInitialized => Rv::OPERATION_NOT_INITIALIZED,
        RvError::PinIncorrect => Rv::PIN_INCORRECT,
        RvError::PinInvalid => Rv::PIN_INVALID,
        RvError::PinExpired => Rv::PIN_EXPIRED,
        RvError::PinLocked => Rv::PIN_LOCKED,
        RvError::SessionClosed => Rv::SESSION_CLOSED,
        RvError::SessionHandleInvalid => Rv::SESSION_HANDLE_INVALID,
        RvError::SessionReadOnly => Rv::SESSION_READ_ONLY,
        RvError::TemplateIncomplete => Rv::TEMPLATE_INCOMPLETE,
        RvError::TokenNotPresent => Rv::TOKEN_NOT_PRESENT,
        RvError::TokenWriteProtected => Rv::TOKEN_WRITE_PROTECTED,
        RvError::UserAlreadyLoggedIn => Rv::USER_ALREADY_LOGGED_IN,
        RvError::UserNotLoggedIn => Rv::USER_NOT_LOGGED_IN,
        RvError::UserPinNotInitialized => Rv::USER_PIN_NOT_INITIALIZED,
        RvError::BufferTooSmall => Rv::BUFFER_TOO_SMALL,
        RvError::FunctionRejected => Rv::FUNCTION_REJECTED,
        _ => return None,
    };
    Some(code)
}

//------------ Module loading ------------------------------------------------

/// Loads and initializes a PKCS#11 module.
pub fn load_module(lib_path: &Path) -> Result<Pkcs11, ConfigError> {
    let module = Pkcs11::new(lib_path).map_err(|err| {
        ConfigError::Other(format!(
            "Failed to load PKCS#11 module '{}': {}",
            lib_path.display(),
            err
        ))
    })?;
    match module.initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK)) {
        Ok(()) | Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
        Err(err) => {
            return Err(ConfigError::Other(format!(
                "Failed to initialize PKCS#11 module '{}': {}",
                lib_path.display(),
                err
            )));
        }
    }
    if let Ok(info) = module.get_library_info() {
        info!(
            "Loaded PKCS#11 module '{}' from {}",
            info.library_description(),
            lib_path.display()
        );
    }
    Ok(module)
}

/// Finds the slot of a token by slot id or token label.
pub fn find_slot(module: &Pkcs11, slot: &SlotIdOrLabel) -> Result<Slot, ConfigError> {
    let slots = module.get_slots_with_token().map_err(|err| {
        ConfigError::Other(format!("Failed to enumerate slots: {}", err))
    })?;

    let found = slots.into_iter().find(|candidate| match slot {
        SlotIdOrLabel::Id(id) => candidate.id() == *id,
        SlotIdOrLabel::Label(label) => module
            .get_token_info(*candidate)
            .map(|info| info.label() == label)
            .unwrap_or(false),
    });
    found.ok_or_else(|| ConfigError::Other(format!("No token found for {}", slot)))
}

/// Opens a session with the configured token.
pub fn connect(
    module: &Pkcs11,
    token: &TokenConfig,
) -> Result<CryptokiConnection, ConfigError> {
    let slot = find_slot(module, &token.slot)?;
    debug!(
        "Opening session with token '{}' in slot {}",
        token.name,
        slot.id()
    );
    CryptokiConnection::open(module, slot).map_err(|err| {
        ConfigError::Other(format!(
            "Failed to open session with token '{}': {}",
            token.name, err
        ))
    })
}

impl SessionPool<CryptokiConnection> {
    /// Opens one session for every configured token.
    ///
    /// Tokens served by the same module share the loaded module.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let pool = SessionPool::new();
        let mut modules: HashMap<PathBuf, Pkcs11> = HashMap::new();

        for token in &config.tokens {
            let module = match modules.get(&token.lib_path) {
                Some(module) => module.clone(),
                None => {
                    let module = load_module(&token.lib_path)?;
                    modules.insert(token.lib_path.clone(), module.clone());
                    module
                }
            };
            let conn = connect(&module, token)?;
            pool.register(TokenId::new(&token.name), conn);
        }
        Ok(pool)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_return_codes() {
        let err = provider_error(
            "C_Login",
            CkError::Pkcs11(RvError::PinIncorrect, cryptoki::error::Function::Login),
        );
        assert_eq!(err.rv(), Rv::PIN_INCORRECT);
        assert!(err.rv().is_credential_failure());

        let err = provider_error(
            "C_FindObjectsInit",
            CkError::Pkcs11(
                RvError::UserNotLoggedIn,
                cryptoki::error::Function::FindObjectsInit,
            ),
        );
        assert_eq!(err.rv(), Rv::USER_NOT_LOGGED_IN);
    }

    #[test]
    fn converts_templates() {
        let template = to_template(
            "C_CreateObject",
            &[
                Attribute::Class(ObjectClass::DATA),
                Attribute::Private(true),
                Attribute::Label(b"l".to_vec()),
            ],
        )
        .unwrap();
        assert_eq!(template.len(), 3);
        assert_eq!(
            attribute_bytes("C_GetAttributeValue", &template[0]).unwrap(),
            ObjectClass::DATA.value().to_ne_bytes().to_vec()
        );
        assert_eq!(
            attribute_bytes("C_GetAttributeValue", &template[1]).unwrap(),
            vec![1]
        );

        let err = to_template("C_CreateObject", &[Attribute::Class(ObjectClass::new(0x99))])
            .unwrap_err();
        assert_eq!(err.rv(), Rv::ATTRIBUTE_VALUE_INVALID);
    }

    /// Runs against SoftHSM with a token labelled "My token 1" and user
    /// PIN 1234.
    #[test]
    #[cfg(feature = "hsm-tests-pkcs11")]
    fn softhsm_round_trip() {
        use std::sync::Arc;

        use crate::data::{Access, DataContext, DataId};
        use crate::login::PinLogin;

        let config = Config::parse_str(
            r#"
            [[tokens]]
            name = "softhsm"
            lib_path = "/usr/lib/softhsm/libsofthsm2.so"
            slot = "My token 1"
            user_pin = "1234"
            "#,
        )
        .unwrap();
        let pool = Arc::new(SessionPool::from_config(&config).unwrap());
        let login = Arc::new(PinLogin::from_config(&config));
        let context = DataContext::<CryptokiConnection>::initialize(pool, login);

        let token = TokenId::new("softhsm");
        let access = Access::private();
        let id = DataId::new("pkcs11-data", "softhsm_round_trip");

        context.put(&token, &access, &id, b"some value").unwrap();
        assert_eq!(context.get_value(&token, &access, &id).unwrap(), b"some value");
        assert!(context.enumerate(&token, &access).unwrap().contains(&id));
        context.delete(&token, &access, &id).unwrap();
    }
}
