use std::fmt;

use crate::{
    error::Error,
    keys::KeyIdentity,
    token::{Attribute, KeyType, Mechanism, ObjectClass},
};

/// The symmetric ciphers secret keys can be generated for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SymmetricCipher {
    Aes,
}

impl SymmetricCipher {
    pub fn key_type(self) -> KeyType {
        match self {
            SymmetricCipher::Aes => KeyType::Aes,
        }
    }

    pub fn from_key_type(key_type: KeyType) -> Option<Self> {
        match key_type {
            KeyType::Aes => Some(SymmetricCipher::Aes),
            _ => None,
        }
    }

    pub fn supports_bits(self, bits: u32) -> bool {
        match self {
            SymmetricCipher::Aes => matches!(bits, 128 | 192 | 256),
        }
    }

    pub(crate) fn generation_mechanism(self) -> Mechanism {
        match self {
            SymmetricCipher::Aes => Mechanism::AesKeyGen,
        }
    }
}

impl fmt::Display for SymmetricCipher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SymmetricCipher::Aes => write!(f, "AES"),
        }
    }
}

pub(crate) fn key_template(identity: &KeyIdentity, cipher: SymmetricCipher, bits: u32) -> Result<Vec<Attribute>, Error> {
    if !cipher.supports_bits(bits) {
        return Err(Error::invalid_argument(format!("{} keys of {} bits are not supported", cipher, bits)));
    }

    let mut template = vec![
        Attribute::Class(ObjectClass::SecretKey),
        Attribute::KeyType(cipher.key_type()),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
        Attribute::ValueLen(u64::from(bits / 8)),
    ];
    template.extend(identity.template());
    Ok(template)
}
