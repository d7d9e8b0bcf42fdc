//! The capability interface to a security module.
//!
//! Everything the rest of the crate knows about a security module goes through the [`Token`] and [`TokenSession`]
//! traits defined here. They mirror the subset of the PKCS#11 v2.40 function list that we need: opening and closing
//! sessions, logging in, searching for objects, generating keys, signing, decrypting, reading attributes, destroying
//! objects and generating random bytes. Each call is a single blocking round trip to the module.
//!
//! Two implementations are provided:
//!   - `pkcs11`: a binding to a real PKCS#11 library via the `cryptoki` crate (requires the `hsm` feature).
//!   - `soft`: an in-process software token backed by OpenSSL.
//!
//! The attribute, mechanism and handle types are our own rather than those of the `cryptoki` crate so that the pool,
//! resolver and key algorithm code can be exercised against any implementation.
use std::fmt;

use secrecy::SecretString;
use serde::Deserialize;

use crate::keys::HashAlgorithm;

#[cfg(feature = "hsm")]
pub mod pkcs11;
pub mod soft;

//------------ SlotId ------------------------------------------------------------------------------------------------

/// The identifier of a slot as assigned by the module.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How to select the slot to use.
///
/// For some PKCS#11 libraries it is easy, or only possible, to connect by slot ID. With others using the token label
/// is easier (e.g. with SoftHSMv2 the slot id is randomly generated when the token is initialized).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum SlotIdOrLabel {
    Id(u64),
    Label(String),
}

impl fmt::Display for SlotIdOrLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlotIdOrLabel::Id(id) => write!(f, "slot id {}", id),
            SlotIdOrLabel::Label(label) => write!(f, "token label '{}'", label),
        }
    }
}

//------------ ObjectHandle ------------------------------------------------------------------------------------------

/// A module assigned reference to a stored object.
///
/// Handles are only meaningful within the session that resolved them and must not be cached beyond a single
/// operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//------------ Object classes and key types --------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
    SecretKey,
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectClass::PublicKey => write!(f, "public key"),
            ObjectClass::PrivateKey => write!(f, "private key"),
            ObjectClass::SecretKey => write!(f, "secret key"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ec,
    Aes,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
            KeyType::Dsa => write!(f, "DSA"),
            KeyType::Ec => write!(f, "EC"),
            KeyType::Aes => write!(f, "AES"),
        }
    }
}

//------------ Attribute ---------------------------------------------------------------------------------------------

/// An attribute value, as used in templates and as returned by [`TokenSession::get_attributes`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Id(Vec<u8>),
    Label(Vec<u8>),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Sign(bool),
    Verify(bool),
    Encrypt(bool),
    Decrypt(bool),
    ModulusBits(u64),
    Modulus(Vec<u8>),
    PublicExponent(Vec<u8>),
    Prime(Vec<u8>),
    Subprime(Vec<u8>),
    Base(Vec<u8>),
    Value(Vec<u8>),
    ValueLen(u64),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Private(_) => AttributeType::Private,
            Attribute::Sensitive(_) => AttributeType::Sensitive,
            Attribute::Extractable(_) => AttributeType::Extractable,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Verify(_) => AttributeType::Verify,
            Attribute::Encrypt(_) => AttributeType::Encrypt,
            Attribute::Decrypt(_) => AttributeType::Decrypt,
            Attribute::ModulusBits(_) => AttributeType::ModulusBits,
            Attribute::Modulus(_) => AttributeType::Modulus,
            Attribute::PublicExponent(_) => AttributeType::PublicExponent,
            Attribute::Prime(_) => AttributeType::Prime,
            Attribute::Subprime(_) => AttributeType::Subprime,
            Attribute::Base(_) => AttributeType::Base,
            Attribute::Value(_) => AttributeType::Value,
            Attribute::ValueLen(_) => AttributeType::ValueLen,
            Attribute::EcParams(_) => AttributeType::EcParams,
            Attribute::EcPoint(_) => AttributeType::EcPoint,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeType {
    Class,
    KeyType,
    Id,
    Label,
    Token,
    Private,
    Sensitive,
    Extractable,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    ModulusBits,
    Modulus,
    PublicExponent,
    Prime,
    Subprime,
    Base,
    Value,
    ValueLen,
    EcParams,
    EcPoint,
}

/// Helpers for picking values out of a [`TokenSession::get_attributes`] response.
pub(crate) trait AttributesExt {
    fn bytes_of(&self, attr_type: AttributeType) -> Option<&[u8]>;
    fn key_type(&self) -> Option<KeyType>;
    fn ulong_of(&self, attr_type: AttributeType) -> Option<u64>;
}

impl AttributesExt for [Attribute] {
    fn bytes_of(&self, attr_type: AttributeType) -> Option<&[u8]> {
        self.iter().find_map(|attr| match (attr_type, attr) {
            (AttributeType::Id, Attribute::Id(v))
            | (AttributeType::Label, Attribute::Label(v))
            | (AttributeType::Modulus, Attribute::Modulus(v))
            | (AttributeType::PublicExponent, Attribute::PublicExponent(v))
            | (AttributeType::Prime, Attribute::Prime(v))
            | (AttributeType::Subprime, Attribute::Subprime(v))
            | (AttributeType::Base, Attribute::Base(v))
            | (AttributeType::Value, Attribute::Value(v))
            | (AttributeType::EcParams, Attribute::EcParams(v))
            | (AttributeType::EcPoint, Attribute::EcPoint(v)) => Some(v.as_slice()),
            _ => None,
        })
    }

    fn key_type(&self) -> Option<KeyType> {
        self.iter().find_map(|attr| match attr {
            Attribute::KeyType(key_type) => Some(*key_type),
            _ => None,
        })
    }

    fn ulong_of(&self, attr_type: AttributeType) -> Option<u64> {
        self.iter().find_map(|attr| match (attr_type, attr) {
            (AttributeType::ModulusBits, Attribute::ModulusBits(v)) | (AttributeType::ValueLen, Attribute::ValueLen(v)) => {
                Some(*v)
            }
            _ => None,
        })
    }
}

//------------ Mechanism ---------------------------------------------------------------------------------------------

/// A mechanism, i.e. an algorithm plus its parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mechanism {
    RsaPkcsKeyPairGen,

    /// Raw PKCS#1 v1.5 signing/decryption. When signing the caller supplies the DER DigestInfo.
    RsaPkcs,

    /// PKCS#1 PSS over a pre-computed digest, MGF1 uses the same hash.
    RsaPkcsPss { hash: HashAlgorithm, salt_len: u64 },

    /// PKCS#1 OAEP without a label, MGF1 uses the same hash.
    RsaPkcsOaep { hash: HashAlgorithm },

    DsaKeyPairGen,
    Dsa,
    EccKeyPairGen,
    Ecdsa,
    AesKeyGen,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mechanism::RsaPkcsKeyPairGen => write!(f, "CKM_RSA_PKCS_KEY_PAIR_GEN"),
            Mechanism::RsaPkcs => write!(f, "CKM_RSA_PKCS"),
            Mechanism::RsaPkcsPss { hash, salt_len } => write!(f, "CKM_RSA_PKCS_PSS({}, salt {})", hash, salt_len),
            Mechanism::RsaPkcsOaep { hash } => write!(f, "CKM_RSA_PKCS_OAEP({})", hash),
            Mechanism::DsaKeyPairGen => write!(f, "CKM_DSA_KEY_PAIR_GEN"),
            Mechanism::Dsa => write!(f, "CKM_DSA"),
            Mechanism::EccKeyPairGen => write!(f, "CKM_EC_KEY_PAIR_GEN"),
            Mechanism::Ecdsa => write!(f, "CKM_ECDSA"),
            Mechanism::AesKeyGen => write!(f, "CKM_AES_KEY_GEN"),
        }
    }
}

//------------ TokenError --------------------------------------------------------------------------------------------

/// The classified outcome of a failed module call.
///
/// Implementations map their native return values onto these classes. The class determines what the pool and the
/// context do with the session and whether the operation may be retried.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenError {
    /// The session is no longer usable (e.g. CKR_SESSION_HANDLE_INVALID, CKR_SESSION_CLOSED).
    SessionInvalid(String),

    /// The module is temporarily unable to serve the request (e.g. CKR_DEVICE_MEMORY, CKR_SESSION_COUNT).
    Unavailable(String),

    /// An object handle no longer refers to an object (e.g. CKR_OBJECT_HANDLE_INVALID).
    ObjectHandleInvalid(String),

    /// The module or token cannot be used (e.g. CKR_DEVICE_REMOVED, CKR_PIN_INCORRECT).
    Fatal(String),

    /// The module refused this particular request (e.g. CKR_MECHANISM_INVALID, CKR_DATA_LEN_RANGE).
    Rejected(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::SessionInvalid(e) => write!(f, "session invalid: {}", e),
            TokenError::Unavailable(e) => write!(f, "token unavailable: {}", e),
            TokenError::ObjectHandleInvalid(e) => write!(f, "object handle invalid: {}", e),
            TokenError::Fatal(e) => write!(f, "token unusable: {}", e),
            TokenError::Rejected(e) => write!(f, "request rejected: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

//------------ Token and TokenSession --------------------------------------------------------------------------------

/// A loaded security module.
pub trait Token: Send + Sync + 'static {
    /// A human readable description of the module, used in log messages.
    fn info(&self) -> String;

    /// Resolve the configured slot selector to a slot that has a token present.
    fn find_slot(&self, slot: &SlotIdOrLabel) -> Result<SlotId, TokenError>;

    /// Open a new read/write session to the token in the given slot.
    fn open_session(&self, slot: SlotId) -> Result<Box<dyn TokenSession>, TokenError>;
}

/// A single conversation with the token.
///
/// Sessions are not safe for concurrent use: the pool hands each session to at most one operation at a time, which is
/// why this trait only requires `Send`. Dropping a session closes it.
pub trait TokenSession: Send {
    /// Log the user in. All sessions of an application share one login state so this is only needed once per token.
    fn login(&self, pin: Option<&SecretString>) -> Result<(), TokenError>;

    /// Find all objects matching the template (C_FindObjectsInit, C_FindObjects, C_FindObjectsFinal).
    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, TokenError>;

    /// Generate a key pair, returning the (public, private) handles.
    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), TokenError>;

    fn generate_key(&self, mechanism: &Mechanism, template: &[Attribute]) -> Result<ObjectHandle, TokenError>;

    /// Sign data in a single part (C_SignInit followed by C_Sign).
    fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError>;

    /// Decrypt data in a single part (C_DecryptInit followed by C_Decrypt).
    fn decrypt(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError>;

    fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Vec<Attribute>, TokenError>;

    fn destroy_object(&self, object: ObjectHandle) -> Result<(), TokenError>;

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, TokenError>;
}
