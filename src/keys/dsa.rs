//! DSA key pairs.
//!
//! PKCS#11 modules generate DSA key pairs from domain parameters supplied in the public key template. The parameters
//! are either supplied by the caller or generated locally for one of the FIPS 186-4 (L, N) size classes.
use std::fmt;

use openssl::{
    bn::{BigNum, BigNumContext, MsbOption},
    dsa::Dsa,
    pkey::Public,
};

use crate::{
    error::Error,
    keys::{KeyIdentity, RsaPadding, SignOptions},
    token::{Attribute, AttributeType, AttributesExt, KeyType, Mechanism, ObjectClass},
};

pub(crate) const PUBLIC_ATTRIBUTES: &[AttributeType] = &[
    AttributeType::Prime,
    AttributeType::Subprime,
    AttributeType::Base,
    AttributeType::Value,
];

/// Miller-Rabin rounds used when testing candidate primes.
const PRIMALITY_CHECKS: i32 = 64;

//------------ DsaParameterSize --------------------------------------------------------------------------------------

/// A FIPS 186-4 size class: L is the bit length of the prime p, N that of the subprime q.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DsaParameterSize {
    L1024N160,
    L2048N224,
    L2048N256,
    L3072N256,
}

impl DsaParameterSize {
    pub const ALL: [DsaParameterSize; 4] = [
        DsaParameterSize::L1024N160,
        DsaParameterSize::L2048N224,
        DsaParameterSize::L2048N256,
        DsaParameterSize::L3072N256,
    ];

    pub fn l_bits(self) -> u32 {
        match self {
            DsaParameterSize::L1024N160 => 1024,
            DsaParameterSize::L2048N224 | DsaParameterSize::L2048N256 => 2048,
            DsaParameterSize::L3072N256 => 3072,
        }
    }

    pub fn n_bits(self) -> u32 {
        match self {
            DsaParameterSize::L1024N160 => 160,
            DsaParameterSize::L2048N224 => 224,
            DsaParameterSize::L2048N256 | DsaParameterSize::L3072N256 => 256,
        }
    }
}

impl fmt::Display for DsaParameterSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}N{}", self.l_bits(), self.n_bits())
    }
}

//------------ DsaParameters -----------------------------------------------------------------------------------------

/// DSA domain parameters (p, q, g) as big-endian byte strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DsaParameters {
    p: Vec<u8>,
    q: Vec<u8>,
    g: Vec<u8>,
}

impl DsaParameters {
    pub fn new(p: Vec<u8>, q: Vec<u8>, g: Vec<u8>) -> Result<Self, Error> {
        if p.is_empty() || q.is_empty() || g.is_empty() {
            return Err(Error::invalid_argument("DSA domain parameters p, q and g must all be non-empty"));
        }
        Ok(DsaParameters { p, q, g })
    }

    /// Generate fresh domain parameters for the given size class.
    ///
    /// Follows the shape of FIPS 186-4 A.1.1: pick a prime q of N bits, then search for an L bit prime p with
    /// q | p - 1, then derive a generator g of the order q subgroup. This is CPU intensive for the larger classes.
    pub fn generate(size: DsaParameterSize) -> Result<Self, Error> {
        let l = size.l_bits() as i32;
        let n = size.n_bits() as i32;
        let mut ctx = BigNumContext::new()?;
        let one = BigNum::from_u32(1)?;

        loop {
            let mut q = BigNum::new()?;
            q.generate_prime(n, false, None, None)?;
            let mut two_q = BigNum::new()?;
            two_q.checked_add(&q, &q)?;

            for _ in 0..4 * l {
                let mut x = BigNum::new()?;
                x.rand(l, MsbOption::ONE, false)?;

                // p = x - ((x mod 2q) - 1), so that p = 1 mod 2q
                let mut c = BigNum::new()?;
                c.checked_rem(&x, &two_q, &mut ctx)?;
                let mut c_minus_one = BigNum::new()?;
                c_minus_one.checked_sub(&c, &one)?;
                let mut p = BigNum::new()?;
                p.checked_sub(&x, &c_minus_one)?;

                if p.num_bits() < l {
                    continue;
                }
                if p.is_prime_fasttest(PRIMALITY_CHECKS, &mut ctx, true)? {
                    let g = Self::find_generator(&p, &q, &mut ctx)?;
                    return Ok(DsaParameters {
                        p: p.to_vec(),
                        q: q.to_vec(),
                        g: g.to_vec(),
                    });
                }
            }
        }
    }

    fn find_generator(p: &BigNum, q: &BigNum, ctx: &mut BigNumContext) -> Result<BigNum, Error> {
        let one = BigNum::from_u32(1)?;
        let mut p_minus_one = BigNum::new()?;
        p_minus_one.checked_sub(p, &one)?;
        let mut e = BigNum::new()?;
        e.checked_div(&p_minus_one, q, ctx)?;

        let mut h = BigNum::from_u32(2)?;
        loop {
            let mut g = BigNum::new()?;
            g.mod_exp(&h, &e, p, ctx)?;
            if g.num_bits() > 1 {
                return Ok(g);
            }
            h.add_word(1)?;
        }
    }

    pub fn p(&self) -> &[u8] {
        &self.p
    }

    pub fn q(&self) -> &[u8] {
        &self.q
    }

    pub fn g(&self) -> &[u8] {
        &self.g
    }
}

//------------ DsaPublicKey ------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DsaPublicKey {
    parameters: DsaParameters,
    y: Vec<u8>,
}

impl DsaPublicKey {
    pub(crate) fn from_attributes(attrs: &[Attribute]) -> Result<Self, Error> {
        let get = |attr_type: AttributeType| {
            attrs
                .bytes_of(attr_type)
                .map(|v| v.to_vec())
                .ok_or_else(|| Error::Module(format!("DSA public key lacks {:?} attribute", attr_type)))
        };

        Ok(DsaPublicKey {
            parameters: DsaParameters {
                p: get(AttributeType::Prime)?,
                q: get(AttributeType::Subprime)?,
                g: get(AttributeType::Base)?,
            },
            y: get(AttributeType::Value)?,
        })
    }

    pub fn parameters(&self) -> &DsaParameters {
        &self.parameters
    }

    pub fn y(&self) -> &[u8] {
        &self.y
    }

    pub fn to_openssl(&self) -> Result<Dsa<Public>, Error> {
        Ok(Dsa::from_public_components(
            BigNum::from_slice(&self.parameters.p)?,
            BigNum::from_slice(&self.parameters.q)?,
            BigNum::from_slice(&self.parameters.g)?,
            BigNum::from_slice(&self.y)?,
        )?)
    }
}

//------------ Generation and signing --------------------------------------------------------------------------------

pub(crate) fn key_pair_templates(
    identity: &KeyIdentity,
    parameters: &DsaParameters,
) -> (Vec<Attribute>, Vec<Attribute>) {
    let mut public_template = vec![
        Attribute::Class(ObjectClass::PublicKey),
        Attribute::KeyType(KeyType::Dsa),
        Attribute::Token(true),
        Attribute::Verify(true),
        Attribute::Prime(parameters.p.clone()),
        Attribute::Subprime(parameters.q.clone()),
        Attribute::Base(parameters.g.clone()),
    ];
    public_template.extend(identity.template());

    let mut private_template = vec![
        Attribute::Class(ObjectClass::PrivateKey),
        Attribute::KeyType(KeyType::Dsa),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sign(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
    ];
    private_template.extend(identity.template());

    (public_template, private_template)
}

/// CKM_DSA signs the digest as given. Only the hash selects anything, padding does not apply.
pub(crate) fn sign_mechanism(opts: &SignOptions, digest: &[u8]) -> Result<(Mechanism, Vec<u8>), Error> {
    if let RsaPadding::Pss(_) = opts.padding {
        return Err(Error::invalid_argument("PSS padding cannot be used with a DSA key"));
    }
    Ok((Mechanism::Dsa, digest.to_vec()))
}
