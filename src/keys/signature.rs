use openssl::{
    bn::{BigNum, BigNumRef},
    dsa::DsaSig,
};

use crate::error::Error;

/// A DSA or ECDSA signature as the pair of integers (r, s).
///
/// PKCS#11 modules return these signatures as the big-endian concatenation r‖s with both halves padded to the same
/// length. Callers get the DER encoding SEQUENCE { r INTEGER, s INTEGER } used by X.509 and friends.
#[derive(Debug)]
pub struct RsSignature {
    r: BigNum,
    s: BigNum,
}

impl RsSignature {
    /// Split a module produced r‖s signature.
    pub(crate) fn from_raw(raw: &[u8]) -> Result<Self, Error> {
        if raw.is_empty() || raw.len() % 2 != 0 {
            return Err(Error::Module(format!(
                "module returned a {} byte signature, expected an even, non-zero length",
                raw.len()
            )));
        }
        let (r, s) = raw.split_at(raw.len() / 2);
        Ok(RsSignature {
            r: BigNum::from_slice(r)?,
            s: BigNum::from_slice(s)?,
        })
    }

    /// Decode a DER encoded signature.
    ///
    /// Input that is not exactly one canonical SEQUENCE of two INTEGERs is rejected.
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let sig = DsaSig::from_der(der).map_err(|err| Error::MalformedSignature(err.to_string()))?;
        if sig.to_der()? != der {
            return Err(Error::MalformedSignature(
                "signature is not canonically DER encoded or has trailing data".to_string(),
            ));
        }
        Ok(RsSignature {
            r: sig.r().to_owned()?,
            s: sig.s().to_owned()?,
        })
    }

    pub fn to_der(&self) -> Result<Vec<u8>, Error> {
        let sig = DsaSig::from_private_components(self.r.to_owned()?, self.s.to_owned()?)?;
        Ok(sig.to_der()?)
    }

    pub fn r(&self) -> &BigNumRef {
        &self.r
    }

    pub fn s(&self) -> &BigNumRef {
        &self.s
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;

    use super::*;

    #[test]
    fn raw_halves_become_r_and_s() {
        let sig = RsSignature::from_raw(&[0x00, 0x01, 0x02, 0x80, 0x00, 0x03]).unwrap();
        assert_eq!(sig.r().to_vec(), vec![0x01, 0x02]);
        assert_eq!(sig.s().to_vec(), vec![0x80, 0x00, 0x03]);

        // 0x80 has its high bit set so s needs a leading zero byte to stay positive
        let der = sig.to_der().unwrap();
        assert_eq!(der, vec![0x30, 0x0a, 0x02, 0x02, 0x01, 0x02, 0x02, 0x04, 0x00, 0x80, 0x00, 0x03]);

        let decoded = RsSignature::from_der(&der).unwrap();
        assert_eq!(decoded.r().to_vec(), sig.r().to_vec());
        assert_eq!(decoded.s().to_vec(), sig.s().to_vec());
    }

    #[test]
    fn odd_or_empty_raw_signature_is_a_module_error() {
        assert_eq!(RsSignature::from_raw(&[]).unwrap_err().kind(), ErrorKind::Module);
        assert_eq!(RsSignature::from_raw(&[1, 2, 3]).unwrap_err().kind(), ErrorKind::Module);
    }

    #[test]
    fn malformed_der_is_rejected() {
        let valid = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02];
        assert!(RsSignature::from_der(&valid).is_ok());

        let mut trailing = valid.clone();
        trailing.push(0x00);

        let mut wrong_tag = valid.clone();
        wrong_tag[0] = 0x31;

        for bad in [vec![], valid[..5].to_vec(), trailing, wrong_tag, vec![0x30, 0x00]] {
            let err = RsSignature::from_der(&bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedSignature, "input {:02x?}", bad);
        }
    }
}
