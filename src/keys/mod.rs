//! Keys stored in a token and the algorithms that use them.
//!
//! A [`KeyPair`] or [`SecretKey`] is a description of token objects, never a handle to them. Every operation finds the
//! objects again by identifier and label through a session taken from the pool of the [`Context`] it came from. Keys
//! hold a weak reference to that context: once the context is closed or dropped every operation fails with
//! [`Error::Closed`].
//!
//! [`Context`]: crate::Context
use std::{fmt, sync::Weak};

use log::debug;
use openssl::pkey::{PKey, Public};

use crate::{
    context::Inner,
    error::Error,
    resolver::{KeyQuery, ObjectResolver},
    token::{Attribute, AttributeType, AttributesExt, KeyType, Mechanism, ObjectClass, ObjectHandle},
};

pub mod aes;
pub mod dsa;
pub mod ecdsa;
mod hash;
pub mod rsa;
mod signature;

pub use self::{
    aes::SymmetricCipher,
    dsa::{DsaParameterSize, DsaParameters, DsaPublicKey},
    ecdsa::{Curve, EcPublicKey},
    hash::HashAlgorithm,
    rsa::RsaPublicKey,
    signature::RsSignature,
};

//------------ KeyIdentity -------------------------------------------------------------------------------------------

/// The identifier and label (CKA_ID and CKA_LABEL) by which a key is found.
///
/// An empty value is treated the same as an absent one.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct KeyIdentity {
    id: Option<Vec<u8>>,
    label: Option<Vec<u8>>,
}

impl KeyIdentity {
    pub fn new(id: Option<&[u8]>, label: Option<&[u8]>) -> Self {
        let non_empty = |v: Option<&[u8]>| v.filter(|v| !v.is_empty()).map(|v| v.to_vec());
        KeyIdentity {
            id: non_empty(id),
            label: non_empty(label),
        }
    }

    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    pub fn label(&self) -> Option<&[u8]> {
        self.label.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.label.is_none()
    }

    pub(crate) fn require_id(&self) -> Result<(), Error> {
        if self.id.is_none() {
            return Err(Error::invalid_argument("a non-empty key identifier is required"));
        }
        Ok(())
    }

    pub(crate) fn require_id_and_label(&self) -> Result<(), Error> {
        self.require_id()?;
        if self.label.is_none() {
            return Err(Error::invalid_argument("a non-empty key label is required"));
        }
        Ok(())
    }

    pub(crate) fn template(&self) -> Vec<Attribute> {
        let mut template = Vec::with_capacity(2);
        if let Some(id) = &self.id {
            template.push(Attribute::Id(id.clone()));
        }
        if let Some(label) = &self.label {
            template.push(Attribute::Label(label.clone()));
        }
        template
    }

    fn from_attributes(attrs: &[Attribute]) -> Self {
        KeyIdentity::new(attrs.bytes_of(AttributeType::Id), attrs.bytes_of(AttributeType::Label))
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.id, &self.label) {
            (Some(id), Some(label)) => write!(f, "id={} label={}", hex::encode(id), hex::encode(label)),
            (Some(id), None) => write!(f, "id={}", hex::encode(id)),
            (None, Some(label)) => write!(f, "label={}", hex::encode(label)),
            (None, None) => write!(f, "<no id or label>"),
        }
    }
}

//------------ Signing and decryption options ------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PssSaltLength {
    /// The salt is as long as the digest. This is what most verifiers expect.
    EqualsHash,

    /// The largest salt that fits the key.
    Max,

    Fixed(usize),
}

/// RSA signature padding. Ignored by DSA and ECDSA keys, except that PSS is refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RsaPadding {
    Pkcs1v15,
    Pss(PssSaltLength),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignOptions {
    pub hash: HashAlgorithm,
    pub padding: RsaPadding,
}

impl SignOptions {
    /// Sign a digest made with `hash`, using PKCS#1 v1.5 padding for RSA keys.
    pub fn new(hash: HashAlgorithm) -> Self {
        SignOptions {
            hash,
            padding: RsaPadding::Pkcs1v15,
        }
    }

    pub fn pss(hash: HashAlgorithm, salt_len: PssSaltLength) -> Self {
        SignOptions {
            hash,
            padding: RsaPadding::Pss(salt_len),
        }
    }
}

/// RSA decryption padding. OAEP uses MGF1 with the same hash and no label.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecryptOptions {
    Pkcs1v15,
    Oaep(HashAlgorithm),
}

//------------ PublicKeyMaterial -------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyPairAlgorithm {
    Rsa,
    Dsa,
    Ecdsa,
}

impl KeyPairAlgorithm {
    fn from_key_type(key_type: KeyType) -> Option<Self> {
        match key_type {
            KeyType::Rsa => Some(KeyPairAlgorithm::Rsa),
            KeyType::Dsa => Some(KeyPairAlgorithm::Dsa),
            KeyType::Ec => Some(KeyPairAlgorithm::Ecdsa),
            KeyType::Aes => None,
        }
    }

    fn key_type(self) -> KeyType {
        match self {
            KeyPairAlgorithm::Rsa => KeyType::Rsa,
            KeyPairAlgorithm::Dsa => KeyType::Dsa,
            KeyPairAlgorithm::Ecdsa => KeyType::Ec,
        }
    }

    fn public_attributes(self) -> &'static [AttributeType] {
        match self {
            KeyPairAlgorithm::Rsa => rsa::PUBLIC_ATTRIBUTES,
            KeyPairAlgorithm::Dsa => dsa::PUBLIC_ATTRIBUTES,
            KeyPairAlgorithm::Ecdsa => ecdsa::PUBLIC_ATTRIBUTES,
        }
    }
}

impl fmt::Display for KeyPairAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyPairAlgorithm::Rsa => write!(f, "RSA"),
            KeyPairAlgorithm::Dsa => write!(f, "DSA"),
            KeyPairAlgorithm::Ecdsa => write!(f, "ECDSA"),
        }
    }
}

/// The public half of a key pair as read from the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublicKeyMaterial {
    Rsa(RsaPublicKey),
    Dsa(DsaPublicKey),
    Ec(EcPublicKey),
}

impl PublicKeyMaterial {
    pub fn algorithm(&self) -> KeyPairAlgorithm {
        match self {
            PublicKeyMaterial::Rsa(_) => KeyPairAlgorithm::Rsa,
            PublicKeyMaterial::Dsa(_) => KeyPairAlgorithm::Dsa,
            PublicKeyMaterial::Ec(_) => KeyPairAlgorithm::Ecdsa,
        }
    }

    /// Convert to an OpenSSL public key, e.g. to verify signatures.
    pub fn to_pkey(&self) -> Result<PKey<Public>, Error> {
        let pkey = match self {
            PublicKeyMaterial::Rsa(key) => PKey::from_rsa(key.to_openssl()?)?,
            PublicKeyMaterial::Dsa(key) => PKey::from_dsa(key.to_openssl()?)?,
            PublicKeyMaterial::Ec(key) => PKey::from_ec_key(key.to_openssl()?)?,
        };
        Ok(pkey)
    }

    fn read(resolver: &ObjectResolver, handle: ObjectHandle, algorithm: KeyPairAlgorithm) -> Result<Self, Error> {
        let attrs = resolver
            .session()
            .get_attributes(handle, algorithm.public_attributes())
            .map_err(|err| Error::token(format!("read {} public key attributes", algorithm), err))?;

        match algorithm {
            KeyPairAlgorithm::Rsa => RsaPublicKey::from_attributes(&attrs).map(PublicKeyMaterial::Rsa),
            KeyPairAlgorithm::Dsa => DsaPublicKey::from_attributes(&attrs).map(PublicKeyMaterial::Dsa),
            KeyPairAlgorithm::Ecdsa => EcPublicKey::from_attributes(&attrs).map(PublicKeyMaterial::Ec),
        }
    }
}

//------------ KeyPair -----------------------------------------------------------------------------------------------

/// An asymmetric key pair stored in the token.
///
/// The public key material is read once, when the key pair is generated or found, and kept here.
#[derive(Clone, Debug)]
pub struct KeyPair {
    context: Weak<Inner>,
    identity: KeyIdentity,
    public_key: PublicKeyMaterial,
}

impl KeyPair {
    pub(crate) fn new(context: Weak<Inner>, identity: KeyIdentity, public_key: PublicKeyMaterial) -> Self {
        KeyPair {
            context,
            identity,
            public_key,
        }
    }

    /// Build a key pair from a private key object found by the resolver, finding its public half by the identifier
    /// and label of the private key.
    pub(crate) fn load(context: Weak<Inner>, resolver: &mut ObjectResolver, private: ObjectHandle) -> Result<Self, Error> {
        let attrs = resolver
            .session()
            .get_attributes(
                private,
                &[AttributeType::KeyType, AttributeType::Id, AttributeType::Label],
            )
            .map_err(|err| Error::token("read private key attributes", err))?;

        let identity = KeyIdentity::from_attributes(&attrs);
        let algorithm = attrs
            .key_type()
            .and_then(KeyPairAlgorithm::from_key_type)
            .ok_or_else(|| Error::Module(format!("private key {} has an unsupported key type", identity)))?;

        let public_query = KeyQuery::new(identity.clone(), ObjectClass::PublicKey)?.with_key_type(algorithm.key_type());
        let public = resolver.find_one(&public_query)?;
        let public_key = PublicKeyMaterial::read(resolver, public, algorithm)?;

        debug!("Loaded {} key pair {}", algorithm, identity);
        Ok(KeyPair::new(context, identity, public_key))
    }

    /// Generate a key pair from the given templates and read back its public key.
    pub(crate) fn generate(
        context: Weak<Inner>,
        resolver: &ObjectResolver,
        identity: &KeyIdentity,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
        algorithm: KeyPairAlgorithm,
    ) -> Result<Self, Error> {
        let (public, _) = resolver
            .session()
            .generate_key_pair(mechanism, public_template, private_template)
            .map_err(|err| Error::token(format!("generate {} key pair {}", algorithm, identity), err))?;

        let public_key = PublicKeyMaterial::read(resolver, public, algorithm)?;
        Ok(KeyPair::new(context, identity.clone(), public_key))
    }

    pub fn identity(&self) -> &KeyIdentity {
        &self.identity
    }

    pub fn id(&self) -> Option<&[u8]> {
        self.identity.id()
    }

    pub fn label(&self) -> Option<&[u8]> {
        self.identity.label()
    }

    pub fn algorithm(&self) -> KeyPairAlgorithm {
        self.public_key.algorithm()
    }

    pub fn public_key(&self) -> &PublicKeyMaterial {
        &self.public_key
    }

    fn private_query(&self) -> Result<KeyQuery, Error> {
        Ok(KeyQuery::new(self.identity.clone(), ObjectClass::PrivateKey)?.with_key_type(self.algorithm().key_type()))
    }

    /// Sign a pre-computed digest.
    ///
    /// RSA keys return the raw signature. DSA and ECDSA keys return the DER encoding of (r, s). The digest is handed
    /// to the module as is, so a digest of the wrong length is reported by the module.
    pub fn sign(&self, digest: &[u8], opts: &SignOptions) -> Result<Vec<u8>, Error> {
        let inner = Inner::upgrade(&self.context)?;

        let (mechanism, data) = match &self.public_key {
            PublicKeyMaterial::Rsa(key) => rsa::sign_mechanism(opts, key, digest)?,
            PublicKeyMaterial::Dsa(_) => dsa::sign_mechanism(opts, digest)?,
            PublicKeyMaterial::Ec(_) => ecdsa::sign_mechanism(opts, digest)?,
        };
        let query = self.private_query()?;
        let desc = format!("sign with {} using {}", query, mechanism);

        let raw = inner.with_session(&desc, false, |resolver| {
            resolver.with_object(&desc, &query, |session, handle| session.sign(&mechanism, handle, &data))
        })?;

        match self.public_key {
            PublicKeyMaterial::Rsa(_) => Ok(raw),
            PublicKeyMaterial::Dsa(_) | PublicKeyMaterial::Ec(_) => RsSignature::from_raw(&raw)?.to_der(),
        }
    }

    /// Decrypt data encrypted to the public key of an RSA key pair.
    pub fn decrypt(&self, ciphertext: &[u8], opts: &DecryptOptions) -> Result<Vec<u8>, Error> {
        let inner = Inner::upgrade(&self.context)?;

        if self.algorithm() != KeyPairAlgorithm::Rsa {
            return Err(Error::invalid_argument(format!("cannot decrypt with a {} key", self.algorithm())));
        }
        let mechanism = rsa::decrypt_mechanism(opts);
        let query = self.private_query()?;
        let desc = format!("decrypt with {} using {}", query, mechanism);

        inner.with_session(&desc, false, |resolver| {
            resolver.with_object(&desc, &query, |session, handle| {
                session.decrypt(&mechanism, handle, ciphertext)
            })
        })
    }

    /// Destroy both halves of the key pair in the token.
    pub fn delete(self) -> Result<(), Error> {
        let inner = Inner::upgrade(&self.context)?;

        let private = self.private_query()?;
        let public = KeyQuery::new(self.identity.clone(), ObjectClass::PublicKey)?.with_key_type(self.algorithm().key_type());
        let desc = format!("delete {} key pair {}", self.algorithm(), self.identity);

        inner.with_session(&desc, false, |resolver| {
            for query in [&private, &public] {
                resolver.with_object(&desc, query, |session, handle| session.destroy_object(handle))?;
                resolver.invalidate(query);
            }
            Ok(())
        })
    }
}

//------------ SecretKey ---------------------------------------------------------------------------------------------

/// A symmetric key stored in the token.
#[derive(Clone, Debug)]
pub struct SecretKey {
    context: Weak<Inner>,
    identity: KeyIdentity,
    cipher: SymmetricCipher,
    bits: u32,
}

impl SecretKey {
    pub(crate) fn new(context: Weak<Inner>, identity: KeyIdentity, cipher: SymmetricCipher, bits: u32) -> Self {
        SecretKey {
            context,
            identity,
            cipher,
            bits,
        }
    }

    pub(crate) fn load(context: Weak<Inner>, resolver: &ObjectResolver, handle: ObjectHandle) -> Result<Self, Error> {
        let attrs = resolver
            .session()
            .get_attributes(
                handle,
                &[
                    AttributeType::KeyType,
                    AttributeType::ValueLen,
                    AttributeType::Id,
                    AttributeType::Label,
                ],
            )
            .map_err(|err| Error::token("read secret key attributes", err))?;

        let identity = KeyIdentity::from_attributes(&attrs);
        let cipher = attrs
            .key_type()
            .and_then(SymmetricCipher::from_key_type)
            .ok_or_else(|| Error::Module(format!("secret key {} has an unsupported key type", identity)))?;
        let len = attrs
            .ulong_of(AttributeType::ValueLen)
            .ok_or_else(|| Error::Module(format!("secret key {} lacks CKA_VALUE_LEN", identity)))?;
        let bits = key_bits(len)
            .ok_or_else(|| Error::Module(format!("secret key {} has an invalid CKA_VALUE_LEN {}", identity, len)))?;

        Ok(SecretKey::new(context, identity, cipher, bits))
    }

    pub fn identity(&self) -> &KeyIdentity {
        &self.identity
    }

    pub fn id(&self) -> Option<&[u8]> {
        self.identity.id()
    }

    pub fn label(&self) -> Option<&[u8]> {
        self.identity.label()
    }

    pub fn cipher(&self) -> SymmetricCipher {
        self.cipher
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Destroy the key in the token.
    pub fn delete(self) -> Result<(), Error> {
        let inner = Inner::upgrade(&self.context)?;

        let query = KeyQuery::new(self.identity.clone(), ObjectClass::SecretKey)?.with_key_type(self.cipher.key_type());
        let desc = format!("delete {}", query);

        inner.with_session(&desc, false, |resolver| {
            resolver.with_object(&desc, &query, |session, handle| session.destroy_object(handle))
        })
    }
}

/// Key size in bits for a CKA_VALUE_LEN in bytes, if it fits.
fn key_bits(value_len: u64) -> Option<u32> {
    value_len.checked_mul(8).and_then(|bits| u32::try_from(bits).ok())
}
