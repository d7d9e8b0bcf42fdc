//! RSA key pairs: generation templates, mechanism selection for signing and decryption, public key material.
use openssl::{bn::BigNum, pkey::Public, rsa::Rsa};

use crate::{
    error::Error,
    keys::{DecryptOptions, KeyIdentity, PssSaltLength, RsaPadding, SignOptions},
    token::{Attribute, AttributeType, AttributesExt, KeyType, Mechanism, ObjectClass},
};

/// Public exponent of every generated key: 65537.
const PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Smaller moduli are refused before asking the module.
pub const MIN_MODULUS_BITS: u32 = 1024;

pub(crate) const PUBLIC_ATTRIBUTES: &[AttributeType] = &[AttributeType::Modulus, AttributeType::PublicExponent];

//------------ RsaPublicKey ------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RsaPublicKey {
    modulus: Vec<u8>,
    public_exponent: Vec<u8>,
}

impl RsaPublicKey {
    pub(crate) fn from_attributes(attrs: &[Attribute]) -> Result<Self, Error> {
        let modulus = attrs
            .bytes_of(AttributeType::Modulus)
            .ok_or_else(|| Error::Module("RSA public key lacks CKA_MODULUS".to_string()))?;
        let public_exponent = attrs
            .bytes_of(AttributeType::PublicExponent)
            .ok_or_else(|| Error::Module("RSA public key lacks CKA_PUBLIC_EXPONENT".to_string()))?;

        Ok(RsaPublicKey {
            modulus: strip_leading_zeroes(modulus).to_vec(),
            public_exponent: strip_leading_zeroes(public_exponent).to_vec(),
        })
    }

    /// The big-endian modulus without leading zero bytes.
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    pub fn public_exponent(&self) -> &[u8] {
        &self.public_exponent
    }

    /// The size of the modulus in bits.
    pub fn bits(&self) -> usize {
        match self.modulus.first() {
            Some(first) => self.modulus.len() * 8 - first.leading_zeros() as usize,
            None => 0,
        }
    }

    pub fn to_openssl(&self) -> Result<Rsa<Public>, Error> {
        let n = BigNum::from_slice(&self.modulus)?;
        let e = BigNum::from_slice(&self.public_exponent)?;
        Ok(Rsa::from_public_components(n, e)?)
    }
}

fn strip_leading_zeroes(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

//------------ Generation --------------------------------------------------------------------------------------------

/// The public and private key templates for a new token resident key pair.
///
/// The private key can sign and decrypt but never leaves the token.
pub(crate) fn key_pair_templates(identity: &KeyIdentity, bits: u32) -> Result<(Vec<Attribute>, Vec<Attribute>), Error> {
    if bits < MIN_MODULUS_BITS {
        return Err(Error::invalid_argument(format!(
            "RSA modulus of {} bits is too small, at least {} bits are required",
            bits, MIN_MODULUS_BITS
        )));
    }

    let mut public_template = vec![
        Attribute::Class(ObjectClass::PublicKey),
        Attribute::KeyType(KeyType::Rsa),
        Attribute::Token(true),
        Attribute::Verify(true),
        Attribute::Encrypt(true),
        Attribute::ModulusBits(u64::from(bits)),
        Attribute::PublicExponent(PUBLIC_EXPONENT.to_vec()),
    ];
    public_template.extend(identity.template());

    let mut private_template = vec![
        Attribute::Class(ObjectClass::PrivateKey),
        Attribute::KeyType(KeyType::Rsa),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sign(true),
        Attribute::Decrypt(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
    ];
    private_template.extend(identity.template());

    Ok((public_template, private_template))
}

//------------ Signing and decryption --------------------------------------------------------------------------------

/// Select the signing mechanism and build the data to hand to the module.
///
/// PKCS#1 v1.5 uses the raw CKM_RSA_PKCS mechanism, so the module needs the DigestInfo structure rather than the bare
/// digest. PSS takes the digest as is.
pub(crate) fn sign_mechanism(
    opts: &SignOptions,
    public_key: &RsaPublicKey,
    digest: &[u8],
) -> Result<(Mechanism, Vec<u8>), Error> {
    match opts.padding {
        RsaPadding::Pkcs1v15 => {
            let prefix = opts.hash.digest_info_prefix();
            let mut data = Vec::with_capacity(prefix.len() + digest.len());
            data.extend_from_slice(prefix);
            data.extend_from_slice(digest);
            Ok((Mechanism::RsaPkcs, data))
        }
        RsaPadding::Pss(salt_len) => {
            let hash_len = opts.hash.digest_len();

            // RFC 8017 9.1.1: emLen = ceil((modBits - 1) / 8) and sLen <= emLen - hLen - 2
            let em_len = public_key.bits().saturating_sub(1).div_ceil(8);
            let max_salt_len = em_len.checked_sub(hash_len + 2).ok_or_else(|| {
                Error::invalid_argument(format!(
                    "RSA key of {} bits is too small for PSS with {}",
                    public_key.bits(),
                    opts.hash
                ))
            })?;

            let salt_len = match salt_len {
                PssSaltLength::EqualsHash => hash_len,
                PssSaltLength::Max => max_salt_len,
                PssSaltLength::Fixed(len) => len,
            };
            if salt_len > max_salt_len {
                return Err(Error::invalid_argument(format!(
                    "PSS salt length {} exceeds the maximum of {} for this key and hash",
                    salt_len, max_salt_len
                )));
            }

            let mechanism = Mechanism::RsaPkcsPss {
                hash: opts.hash,
                salt_len: salt_len as u64,
            };
            Ok((mechanism, digest.to_vec()))
        }
    }
}

pub(crate) fn decrypt_mechanism(opts: &DecryptOptions) -> Mechanism {
    match opts {
        DecryptOptions::Pkcs1v15 => Mechanism::RsaPkcs,
        DecryptOptions::Oaep(hash) => Mechanism::RsaPkcsOaep { hash: *hash },
    }
}
