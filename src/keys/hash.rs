use std::fmt;

use openssl::{
    hash::{MessageDigest, hash},
    md::{Md, MdRef},
};

use crate::error::Error;

/// The hash algorithm that produced a digest handed to a signing operation.
///
/// Signing always operates on a pre-computed digest. The hash algorithm selects the mechanism parameters (PSS, OAEP)
/// or the DigestInfo prefix (PKCS#1 v1.5) but the digest length is not checked against it: a mismatch is left for the
/// module to report.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 5] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha224,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// The length in bytes of a digest produced by this algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// The DER encoded DigestInfo header that precedes the digest in a PKCS#1 v1.5 signature (RFC 8017 section 9.2).
    pub fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
            ],
            HashAlgorithm::Sha224 => &[
                0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x04, 0x05, 0x00,
                0x04, 0x1c,
            ],
            HashAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00,
                0x04, 0x20,
            ],
            HashAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00,
                0x04, 0x30,
            ],
            HashAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00,
                0x04, 0x40,
            ],
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            HashAlgorithm::Sha1 => MessageDigest::sha1(),
            HashAlgorithm::Sha224 => MessageDigest::sha224(),
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
            HashAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    /// The same algorithm for use with an `openssl::pkey_ctx::PkeyCtx`.
    pub fn md(self) -> &'static MdRef {
        match self {
            HashAlgorithm::Sha1 => Md::sha1(),
            HashAlgorithm::Sha224 => Md::sha224(),
            HashAlgorithm::Sha256 => Md::sha256(),
            HashAlgorithm::Sha384 => Md::sha384(),
            HashAlgorithm::Sha512 => Md::sha512(),
        }
    }

    /// Hash the given data locally.
    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(hash(self.message_digest(), data)?.to_vec())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HashAlgorithm::Sha1 => write!(f, "SHA-1"),
            HashAlgorithm::Sha224 => write!(f, "SHA-224"),
            HashAlgorithm::Sha256 => write!(f, "SHA-256"),
            HashAlgorithm::Sha384 => write!(f, "SHA-384"),
            HashAlgorithm::Sha512 => write!(f, "SHA-512"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_info_prefix_announces_digest_len() {
        for alg in HashAlgorithm::ALL {
            let prefix = alg.digest_info_prefix();
            // the last byte of the prefix is the length of the OCTET STRING holding the digest
            assert_eq!(*prefix.last().unwrap() as usize, alg.digest_len());
            // and the outer SEQUENCE covers the rest of the prefix plus the digest
            assert_eq!(prefix[1] as usize, prefix.len() - 2 + alg.digest_len());
        }
    }

    #[test]
    fn local_digest_has_expected_len() {
        for alg in HashAlgorithm::ALL {
            assert_eq!(alg.digest(b"some data").unwrap().len(), alg.digest_len());
        }
    }
}
