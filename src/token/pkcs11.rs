//! A [`Token`] backed by a PKCS#11 library loaded with the `cryptoki` crate.
//!
//! A PKCS#11 library must be initialized only once per process, however many contexts use it. Loaded libraries are
//! therefore kept in a process wide registry keyed by library file name (not the full path), so that two copies of the
//! same library at different locations are never both loaded into the process.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, PoisonError, RwLock},
};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CryptokiError, RvError},
    mechanism::{
        Mechanism as CkMechanism, MechanismType,
        rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource, PkcsPssParams},
    },
    object::{
        Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType,
        ObjectClass as CkObjectClass, ObjectHandle as CkObjectHandle,
    },
    session::{Session, UserType},
    slot::Slot,
    types::AuthPin,
};
use lazy_static::lazy_static;
use log::{debug, error, info};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::Error,
    keys::HashAlgorithm,
    token::{
        Attribute, AttributeType, KeyType, Mechanism, ObjectClass, ObjectHandle, SlotId, SlotIdOrLabel, Token,
        TokenError, TokenSession,
    },
};

lazy_static! {
    static ref LIBRARIES: RwLock<HashMap<String, Pkcs11>> = RwLock::new(HashMap::new());
}

//------------ Pkcs11Token -------------------------------------------------------------------------------------------

pub struct Pkcs11Token {
    lib_file_name: String,
    pkcs11: Pkcs11,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl Pkcs11Token {
    /// Load and initialize the library at the given path, or reuse it if a library with the same file name was
    /// loaded before.
    pub fn load(lib_path: &Path) -> Result<Self, Error> {
        let lib_file_name = lib_path
            .file_name()
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "PKCS#11 library path '{}' does not point to a file",
                    lib_path.display()
                ))
            })?
            .to_string_lossy()
            .to_string();

        let mut libraries = LIBRARIES.write().unwrap_or_else(PoisonError::into_inner);
        let pkcs11 = match libraries.get(&lib_file_name) {
            Some(pkcs11) => pkcs11.clone(),
            None => {
                let pkcs11 = Pkcs11::new(lib_path).map_err(|err| {
                    error!("Failed to load PKCS#11 library '{}': {}", lib_path.display(), err);
                    Error::ModuleFatal(format!("cannot load PKCS#11 library '{}': {}", lib_path.display(), err))
                })?;

                match pkcs11.initialize(CInitializeArgs::OsThreads) {
                    Ok(()) | Err(CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, ..)) => {}
                    Err(err) => {
                        error!("Failed to initialize PKCS#11 library '{}': {}", lib_path.display(), err);
                        return Err(Error::token("C_Initialize", classify(err)));
                    }
                }

                info!("Loaded PKCS#11 library '{}'", lib_path.display());
                libraries.insert(lib_file_name.clone(), pkcs11.clone());
                pkcs11
            }
        };

        Ok(Pkcs11Token {
            lib_file_name,
            pkcs11,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slot(&self, slot: SlotId) -> Result<Slot, TokenError> {
        if let Some(found) = self.slots.lock().unwrap_or_else(PoisonError::into_inner).get(&slot.0) {
            return Ok(*found);
        }
        let found = self
            .pkcs11
            .get_slots_with_token()
            .map_err(classify)?
            .into_iter()
            .find(|candidate| candidate.id() == slot.0)
            .ok_or_else(|| TokenError::Fatal(format!("no token present in slot {}", slot)))?;
        self.remember(found);
        Ok(found)
    }

    fn remember(&self, slot: Slot) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot.id(), slot);
    }
}

impl Token for Pkcs11Token {
    fn info(&self) -> String {
        format!("PKCS#11 library '{}'", self.lib_file_name)
    }

    fn find_slot(&self, selector: &SlotIdOrLabel) -> Result<SlotId, TokenError> {
        let slots = self.pkcs11.get_slots_with_token().map_err(classify)?;

        let found = match selector {
            SlotIdOrLabel::Id(id) => slots.into_iter().find(|slot| slot.id() == *id),
            SlotIdOrLabel::Label(label) => {
                let mut found = None;
                for slot in slots {
                    let token_info = self.pkcs11.get_token_info(slot).map_err(classify)?;
                    if token_info.label().trim_end() == label {
                        found = Some(slot);
                        break;
                    }
                }
                found
            }
        };

        match found {
            Some(slot) => {
                debug!("Using slot {} of {} for {}", slot.id(), self.info(), selector);
                self.remember(slot);
                Ok(SlotId(slot.id()))
            }
            None => Err(TokenError::Fatal(format!("no token found for {}", selector))),
        }
    }

    fn open_session(&self, slot: SlotId) -> Result<Box<dyn TokenSession>, TokenError> {
        let slot = self.slot(slot)?;
        let session = self.pkcs11.open_rw_session(slot).map_err(classify)?;
        Ok(Box::new(Pkcs11Session {
            session,
            handles: Mutex::new(HandleTable::default()),
        }))
    }
}

//------------ HandleTable -------------------------------------------------------------------------------------------

/// Maps the handles the library hands out onto our own, per session. Raw handles are keyed by their
/// CK_OBJECT_HANDLE value.
#[derive(Default)]
struct HandleTable {
    next: u64,
    by_id: HashMap<u64, CkObjectHandle>,
    ids: HashMap<u64, u64>,
}

impl HandleTable {
    fn register(&mut self, handle: CkObjectHandle) -> ObjectHandle {
        let raw = u64::from(handle.handle());
        if let Some(id) = self.ids.get(&raw) {
            return ObjectHandle(*id);
        }
        self.next += 1;
        self.by_id.insert(self.next, handle);
        self.ids.insert(raw, self.next);
        ObjectHandle(self.next)
    }

    fn resolve(&self, handle: ObjectHandle) -> Result<CkObjectHandle, TokenError> {
        self.by_id
            .get(&handle.0)
            .copied()
            .ok_or_else(|| TokenError::ObjectHandleInvalid(format!("unknown object handle {}", handle)))
    }

    fn forget(&mut self, handle: ObjectHandle) {
        if let Some(ck) = self.by_id.remove(&handle.0) {
            self.ids.remove(&u64::from(ck.handle()));
        }
    }
}

//------------ Pkcs11Session -----------------------------------------------------------------------------------------

struct Pkcs11Session {
    session: Session,
    handles: Mutex<HandleTable>,
}

impl Pkcs11Session {
    fn register(&self, handle: CkObjectHandle) -> ObjectHandle {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(handle)
    }

    fn resolve(&self, handle: ObjectHandle) -> Result<CkObjectHandle, TokenError> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).resolve(handle)
    }
}

impl TokenSession for Pkcs11Session {
    fn login(&self, pin: Option<&SecretString>) -> Result<(), TokenError> {
        let pin = pin.map(|pin| AuthPin::new(pin.expose_secret().clone()));
        match self.session.login(UserType::User, pin.as_ref()) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, ..)) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, TokenError> {
        let template = to_cryptoki_attributes(template);
        let found = self.session.find_objects(&template).map_err(classify)?;
        Ok(found.into_iter().map(|handle| self.register(handle)).collect())
    }

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
        let (public, private) = self
            .session
            .generate_key_pair(
                &to_cryptoki_mechanism(mechanism),
                &to_cryptoki_attributes(public_template),
                &to_cryptoki_attributes(private_template),
            )
            .map_err(classify)?;
        Ok((self.register(public), self.register(private)))
    }

    fn generate_key(&self, mechanism: &Mechanism, template: &[Attribute]) -> Result<ObjectHandle, TokenError> {
        let key = self
            .session
            .generate_key(&to_cryptoki_mechanism(mechanism), &to_cryptoki_attributes(template))
            .map_err(classify)?;
        Ok(self.register(key))
    }

    fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let key = self.resolve(key)?;
        self.session
            .sign(&to_cryptoki_mechanism(mechanism), key, data)
            .map_err(classify)
    }

    fn decrypt(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let key = self.resolve(key)?;
        self.session
            .decrypt(&to_cryptoki_mechanism(mechanism), key, data)
            .map_err(classify)
    }

    fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Vec<Attribute>, TokenError> {
        let handle = self.resolve(object)?;
        let ck_types: Vec<CkAttributeType> = types.iter().map(|t| to_cryptoki_attribute_type(*t)).collect();
        let attributes: Vec<Attribute> = self
            .session
            .get_attributes(handle, &ck_types)
            .map_err(classify)?
            .iter()
            .filter_map(from_cryptoki_attribute)
            .collect();

        // unavailable attributes are silently left out by cryptoki
        if let Some(missing) = types
            .iter()
            .find(|t| !attributes.iter().any(|attr| attr.attribute_type() == **t))
        {
            return Err(TokenError::Rejected(format!(
                "attribute {:?} of object {} is not available",
                missing, object
            )));
        }
        Ok(attributes)
    }

    fn destroy_object(&self, object: ObjectHandle) -> Result<(), TokenError> {
        let handle = self.resolve(object)?;
        self.session.destroy_object(handle).map_err(classify)?;
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).forget(object);
        Ok(())
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, TokenError> {
        let len = u32::try_from(len)
            .map_err(|_| TokenError::Rejected(format!("cannot request {} random bytes in one call", len)))?;
        self.session.generate_random_vec(len).map_err(classify)
    }
}

//------------ Conversions -------------------------------------------------------------------------------------------

fn to_cryptoki_attributes(template: &[Attribute]) -> Vec<CkAttribute> {
    template.iter().map(to_cryptoki_attribute).collect()
}

fn to_cryptoki_attribute(attr: &Attribute) -> CkAttribute {
    match attr {
        Attribute::Class(class) => CkAttribute::Class(match class {
            ObjectClass::PublicKey => CkObjectClass::PUBLIC_KEY,
            ObjectClass::PrivateKey => CkObjectClass::PRIVATE_KEY,
            ObjectClass::SecretKey => CkObjectClass::SECRET_KEY,
        }),
        Attribute::KeyType(key_type) => CkAttribute::KeyType(match key_type {
            KeyType::Rsa => CkKeyType::RSA,
            KeyType::Dsa => CkKeyType::DSA,
            KeyType::Ec => CkKeyType::EC,
            KeyType::Aes => CkKeyType::AES,
        }),
        Attribute::Id(v) => CkAttribute::Id(v.clone()),
        Attribute::Label(v) => CkAttribute::Label(v.clone()),
        Attribute::Token(b) => CkAttribute::Token(*b),
        Attribute::Private(b) => CkAttribute::Private(*b),
        Attribute::Sensitive(b) => CkAttribute::Sensitive(*b),
        Attribute::Extractable(b) => CkAttribute::Extractable(*b),
        Attribute::Sign(b) => CkAttribute::Sign(*b),
        Attribute::Verify(b) => CkAttribute::Verify(*b),
        Attribute::Encrypt(b) => CkAttribute::Encrypt(*b),
        Attribute::Decrypt(b) => CkAttribute::Decrypt(*b),
        Attribute::ModulusBits(n) => CkAttribute::ModulusBits((*n).into()),
        Attribute::Modulus(v) => CkAttribute::Modulus(v.clone()),
        Attribute::PublicExponent(v) => CkAttribute::PublicExponent(v.clone()),
        Attribute::Prime(v) => CkAttribute::Prime(v.clone()),
        Attribute::Subprime(v) => CkAttribute::Subprime(v.clone()),
        Attribute::Base(v) => CkAttribute::Base(v.clone()),
        Attribute::Value(v) => CkAttribute::Value(v.clone()),
        Attribute::ValueLen(n) => CkAttribute::ValueLen((*n).into()),
        Attribute::EcParams(v) => CkAttribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => CkAttribute::EcPoint(v.clone()),
    }
}

fn to_cryptoki_attribute_type(attr_type: AttributeType) -> CkAttributeType {
    match attr_type {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::Id => CkAttributeType::Id,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Token => CkAttributeType::Token,
        AttributeType::Private => CkAttributeType::Private,
        AttributeType::Sensitive => CkAttributeType::Sensitive,
        AttributeType::Extractable => CkAttributeType::Extractable,
        AttributeType::Sign => CkAttributeType::Sign,
        AttributeType::Verify => CkAttributeType::Verify,
        AttributeType::Encrypt => CkAttributeType::Encrypt,
        AttributeType::Decrypt => CkAttributeType::Decrypt,
        AttributeType::ModulusBits => CkAttributeType::ModulusBits,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::PublicExponent => CkAttributeType::PublicExponent,
        AttributeType::Prime => CkAttributeType::Prime,
        AttributeType::Subprime => CkAttributeType::Subprime,
        AttributeType::Base => CkAttributeType::Base,
        AttributeType::Value => CkAttributeType::Value,
        AttributeType::ValueLen => CkAttributeType::ValueLen,
        AttributeType::EcParams => CkAttributeType::EcParams,
        AttributeType::EcPoint => CkAttributeType::EcPoint,
    }
}

fn from_cryptoki_attribute(attr: &CkAttribute) -> Option<Attribute> {
    let attr = match attr {
        CkAttribute::Class(class) if *class == CkObjectClass::PUBLIC_KEY => Attribute::Class(ObjectClass::PublicKey),
        CkAttribute::Class(class) if *class == CkObjectClass::PRIVATE_KEY => Attribute::Class(ObjectClass::PrivateKey),
        CkAttribute::Class(class) if *class == CkObjectClass::SECRET_KEY => Attribute::Class(ObjectClass::SecretKey),
        CkAttribute::KeyType(key_type) if *key_type == CkKeyType::RSA => Attribute::KeyType(KeyType::Rsa),
        CkAttribute::KeyType(key_type) if *key_type == CkKeyType::DSA => Attribute::KeyType(KeyType::Dsa),
        CkAttribute::KeyType(key_type) if *key_type == CkKeyType::EC => Attribute::KeyType(KeyType::Ec),
        CkAttribute::KeyType(key_type) if *key_type == CkKeyType::AES => Attribute::KeyType(KeyType::Aes),
        CkAttribute::Id(v) => Attribute::Id(v.clone()),
        CkAttribute::Label(v) => Attribute::Label(v.clone()),
        CkAttribute::Token(b) => Attribute::Token(*b),
        CkAttribute::Private(b) => Attribute::Private(*b),
        CkAttribute::Sensitive(b) => Attribute::Sensitive(*b),
        CkAttribute::Extractable(b) => Attribute::Extractable(*b),
        CkAttribute::Sign(b) => Attribute::Sign(*b),
        CkAttribute::Verify(b) => Attribute::Verify(*b),
        CkAttribute::Encrypt(b) => Attribute::Encrypt(*b),
        CkAttribute::Decrypt(b) => Attribute::Decrypt(*b),
        CkAttribute::ModulusBits(n) => Attribute::ModulusBits(u64::from(*n)),
        CkAttribute::Modulus(v) => Attribute::Modulus(v.clone()),
        CkAttribute::PublicExponent(v) => Attribute::PublicExponent(v.clone()),
        CkAttribute::Prime(v) => Attribute::Prime(v.clone()),
        CkAttribute::Subprime(v) => Attribute::Subprime(v.clone()),
        CkAttribute::Base(v) => Attribute::Base(v.clone()),
        CkAttribute::Value(v) => Attribute::Value(v.clone()),
        CkAttribute::ValueLen(n) => Attribute::ValueLen(u64::from(*n)),
        CkAttribute::EcParams(v) => Attribute::EcParams(v.clone()),
        CkAttribute::EcPoint(v) => Attribute::EcPoint(v.clone()),
        _ => return None,
    };
    Some(attr)
}

fn hash_mechanism_type(hash: HashAlgorithm) -> MechanismType {
    match hash {
        HashAlgorithm::Sha1 => MechanismType::SHA1,
        HashAlgorithm::Sha224 => MechanismType::SHA224,
        HashAlgorithm::Sha256 => MechanismType::SHA256,
        HashAlgorithm::Sha384 => MechanismType::SHA384,
        HashAlgorithm::Sha512 => MechanismType::SHA512,
    }
}

fn mgf1(hash: HashAlgorithm) -> PkcsMgfType {
    match hash {
        HashAlgorithm::Sha1 => PkcsMgfType::MGF1_SHA1,
        HashAlgorithm::Sha224 => PkcsMgfType::MGF1_SHA224,
        HashAlgorithm::Sha256 => PkcsMgfType::MGF1_SHA256,
        HashAlgorithm::Sha384 => PkcsMgfType::MGF1_SHA384,
        HashAlgorithm::Sha512 => PkcsMgfType::MGF1_SHA512,
    }
}

fn to_cryptoki_mechanism(mechanism: &Mechanism) -> CkMechanism<'static> {
    match *mechanism {
        Mechanism::RsaPkcsKeyPairGen => CkMechanism::RsaPkcsKeyPairGen,
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::RsaPkcsPss { hash, salt_len } => CkMechanism::RsaPkcsPss(PkcsPssParams {
            hash_alg: hash_mechanism_type(hash),
            mgf: mgf1(hash),
            s_len: salt_len.into(),
        }),
        Mechanism::RsaPkcsOaep { hash } => CkMechanism::RsaPkcsOaep(PkcsOaepParams::new(
            hash_mechanism_type(hash),
            mgf1(hash),
            PkcsOaepSource::empty(),
        )),
        Mechanism::DsaKeyPairGen => CkMechanism::DsaKeyPairGen,
        Mechanism::Dsa => CkMechanism::Dsa,
        Mechanism::EccKeyPairGen => CkMechanism::EccKeyPairGen,
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
        Mechanism::AesKeyGen => CkMechanism::AesKeyGen,
    }
}

//------------ Error classification ----------------------------------------------------------------------------------

/// Map a cryptoki error onto the class that decides whether the session is dropped and the call may be retried.
fn classify(err: CryptokiError) -> TokenError {
    let rv = match &err {
        CryptokiError::Pkcs11(rv, ..) => *rv,
        CryptokiError::LibraryLoading(_) => return TokenError::Fatal(err.to_string()),
        _ => return TokenError::Rejected(err.to_string()),
    };

    classify_rv(rv, err.to_string())
}

fn classify_rv(rv: RvError, msg: String) -> TokenError {
    match rv {
        RvError::SessionHandleInvalid | RvError::SessionClosed => TokenError::SessionInvalid(msg),

        // retrying later may succeed once the module has recovered or other sessions have finished
        RvError::HostMemory
        | RvError::DeviceMemory
        | RvError::DeviceError
        | RvError::SessionCount
        | RvError::OperationActive
        | RvError::FunctionFailed
        | RvError::GeneralError
        | RvError::SessionReadOnlyExists
        | RvError::SessionReadWriteSoExists
        | RvError::UserAnotherAlreadyLoggedIn
        | RvError::UserTooManyTypes => TokenError::Unavailable(msg),

        RvError::ObjectHandleInvalid | RvError::KeyHandleInvalid => TokenError::ObjectHandleInvalid(msg),

        RvError::DeviceRemoved
        | RvError::TokenNotPresent
        | RvError::TokenNotRecognized
        | RvError::PinIncorrect
        | RvError::PinLocked
        | RvError::PinExpired
        | RvError::CryptokiNotInitialized => TokenError::Fatal(msg),

        _ => TokenError::Rejected(msg),
    }
}
