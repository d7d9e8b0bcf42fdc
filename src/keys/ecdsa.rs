use std::fmt;

use openssl::{
    bn::BigNumContext,
    ec::{EcGroup, EcKey, EcPoint},
    nid::Nid,
    pkey::Public,
};

use crate::{
    error::Error,
    keys::{KeyIdentity, RsaPadding, SignOptions},
    token::{Attribute, AttributeType, AttributesExt, KeyType, Mechanism, ObjectClass},
};

pub(crate) const PUBLIC_ATTRIBUTES: &[AttributeType] = &[AttributeType::EcParams, AttributeType::EcPoint];

//------------ Curve -------------------------------------------------------------------------------------------------

/// The NIST prime curves supported for ECDSA key pairs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Curve {
    P224,
    P256,
    P384,
    P521,
}

impl Curve {
    pub const ALL: [Curve; 4] = [Curve::P224, Curve::P256, Curve::P384, Curve::P521];

    /// The DER encoded OBJECT IDENTIFIER used as CKA_EC_PARAMS.
    pub fn oid_der(self) -> &'static [u8] {
        match self {
            // 1.3.132.0.33
            Curve::P224 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x21],
            // 1.2.840.10045.3.1.7
            Curve::P256 => &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07],
            // 1.3.132.0.34
            Curve::P384 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22],
            // 1.3.132.0.35
            Curve::P521 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23],
        }
    }

    pub fn from_oid_der(der: &[u8]) -> Option<Curve> {
        Curve::ALL.into_iter().find(|curve| curve.oid_der() == der)
    }

    pub fn nid(self) -> Nid {
        match self {
            Curve::P224 => Nid::SECP224R1,
            Curve::P256 => Nid::X9_62_PRIME256V1,
            Curve::P384 => Nid::SECP384R1,
            Curve::P521 => Nid::SECP521R1,
        }
    }

    /// Length in bytes of a field element, and so of each half of a raw r‖s signature.
    pub fn field_len(self) -> usize {
        match self {
            Curve::P224 => 28,
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    pub fn group(self) -> Result<EcGroup, Error> {
        Ok(EcGroup::from_curve_name(self.nid())?)
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Curve::P224 => write!(f, "P-224"),
            Curve::P256 => write!(f, "P-256"),
            Curve::P384 => write!(f, "P-384"),
            Curve::P521 => write!(f, "P-521"),
        }
    }
}

//------------ EcPublicKey -------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EcPublicKey {
    curve: Curve,
    point: Vec<u8>,
}

impl EcPublicKey {
    pub(crate) fn from_attributes(attrs: &[Attribute]) -> Result<Self, Error> {
        let params = attrs
            .bytes_of(AttributeType::EcParams)
            .ok_or_else(|| Error::Module("EC public key lacks CKA_EC_PARAMS".to_string()))?;
        let curve = Curve::from_oid_der(params)
            .ok_or_else(|| Error::Module(format!("EC public key uses unsupported curve {}", hex::encode(params))))?;
        let point = attrs
            .bytes_of(AttributeType::EcPoint)
            .ok_or_else(|| Error::Module("EC public key lacks CKA_EC_POINT".to_string()))?;

        Ok(EcPublicKey {
            curve,
            point: unwrap_point(curve, point)?.to_vec(),
        })
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// The uncompressed point 0x04‖x‖y.
    pub fn point(&self) -> &[u8] {
        &self.point
    }

    pub fn to_openssl(&self) -> Result<EcKey<Public>, Error> {
        let group = self.curve.group()?;
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&group, &self.point, &mut ctx)?;
        Ok(EcKey::from_public_key(&group, &point)?)
    }
}

/// CKA_EC_POINT should hold the point wrapped in a DER OCTET STRING but some modules return the bare point.
fn unwrap_point(curve: Curve, value: &[u8]) -> Result<&[u8], Error> {
    let bare_len = 1 + 2 * curve.field_len();
    if value.len() == bare_len && value[0] == 0x04 {
        return Ok(value);
    }
    match unwrap_octet_string(value) {
        Some(point) if point.len() == bare_len && point[0] == 0x04 => Ok(point),
        _ => Err(Error::Module(format!(
            "CKA_EC_POINT is not an uncompressed {} point: {}",
            curve,
            hex::encode(value)
        ))),
    }
}

fn unwrap_octet_string(der: &[u8]) -> Option<&[u8]> {
    let (&tag, rest) = der.split_first()?;
    if tag != 0x04 {
        return None;
    }
    let (&first, rest) = rest.split_first()?;
    let (len, content) = match first {
        0x00..=0x7f => (first as usize, rest),
        0x81 => (*rest.first()? as usize, &rest[1..]),
        0x82 => (u16::from_be_bytes([*rest.first()?, *rest.get(1)?]) as usize, rest.get(2..)?),
        _ => return None,
    };
    if content.len() != len {
        return None;
    }
    Some(content)
}

/// Wrap a point as DER OCTET STRING, the canonical CKA_EC_POINT encoding.
pub(crate) fn wrap_point(point: &[u8]) -> Vec<u8> {
    let mut der = vec![0x04];
    match point.len() {
        len @ 0..=0x7f => der.push(len as u8),
        len @ 0x80..=0xff => der.extend_from_slice(&[0x81, len as u8]),
        len => {
            der.push(0x82);
            der.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    der.extend_from_slice(point);
    der
}

//------------ Generation and signing --------------------------------------------------------------------------------

pub(crate) fn key_pair_templates(identity: &KeyIdentity, curve: Curve) -> (Vec<Attribute>, Vec<Attribute>) {
    let mut public_template = vec![
        Attribute::Class(ObjectClass::PublicKey),
        Attribute::KeyType(KeyType::Ec),
        Attribute::Token(true),
        Attribute::Verify(true),
        Attribute::EcParams(curve.oid_der().to_vec()),
    ];
    public_template.extend(identity.template());

    let mut private_template = vec![
        Attribute::Class(ObjectClass::PrivateKey),
        Attribute::KeyType(KeyType::Ec),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sign(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
    ];
    private_template.extend(identity.template());

    (public_template, private_template)
}

pub(crate) fn sign_mechanism(opts: &SignOptions, digest: &[u8]) -> Result<(Mechanism, Vec<u8>), Error> {
    if let RsaPadding::Pss(_) = opts.padding {
        return Err(Error::invalid_argument("PSS padding cannot be used with an ECDSA key"));
    }
    Ok((Mechanism::Ecdsa, digest.to_vec()))
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;

    use super::*;

    #[test]
    fn should_find_curve_by_oid() {
        for curve in Curve::ALL {
            assert_eq!(Curve::from_oid_der(curve.oid_der()), Some(curve));
            // the group openssl knows by this nid has the field size we pad signatures to
            let group = curve.group().unwrap();
            assert_eq!((group.degree() as usize).div_ceil(8), curve.field_len());
        }
        assert_eq!(Curve::from_oid_der(&[0x06, 0x01, 0x00]), None);
    }

    #[test]
    fn should_accept_wrapped_and_bare_points() {
        let mut bare = vec![0x04];
        bare.extend_from_slice(&[0x11; 64]);
        let wrapped = wrap_point(&bare);
        assert_eq!(&wrapped[..2], &[0x04, 0x41]);

        assert_eq!(unwrap_point(Curve::P256, &bare).unwrap(), bare.as_slice());
        assert_eq!(unwrap_point(Curve::P256, &wrapped).unwrap(), bare.as_slice());

        // P-521 points are long enough to need the long length form
        let mut bare = vec![0x04];
        bare.extend_from_slice(&[0x22; 132]);
        let wrapped = wrap_point(&bare);
        assert_eq!(&wrapped[..3], &[0x04, 0x81, 0x85]);
        assert_eq!(unwrap_point(Curve::P521, &wrapped).unwrap(), bare.as_slice());
    }

    #[test]
    fn should_reject_points_of_wrong_size() {
        let err = unwrap_point(Curve::P384, &wrap_point(&[0x04; 65])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Module);
    }
}
