//! An in-process token that keeps keys in memory and does its cryptography with OpenSSL.
//!
//! Behaves like a single slot PKCS#11 token as far as the [`Token`] interface can tell: handles are never reused,
//! sessions can be invalidated from outside, the login state is shared by all sessions and lost when the last one
//! closes, and random requests are capped per call. Every call is counted so that callers can check that no module
//! round trip happened.
use std::{
    collections::HashMap,
    sync::{
        Arc, Condvar, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use log::trace;
use openssl::{
    bn::{BigNum, BigNumContext, BigNumRef, MsbOption},
    dsa::{Dsa, DsaSig},
    ec::{EcKey, PointConversionForm},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    pkey::{PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
    sign::RsaPssSaltlen,
};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    keys::{Curve, ecdsa::wrap_point},
    token::{
        Attribute, AttributeType, AttributesExt, KeyType, Mechanism, ObjectClass, ObjectHandle, SlotId, SlotIdOrLabel,
        Token, TokenError, TokenSession,
    },
};

/// The one slot of every soft token.
pub const SOFT_TOKEN_SLOT: SlotId = SlotId(1);

/// Cap on a single random request unless changed with [`SoftToken::set_max_random_len`].
pub const DEFAULT_MAX_RANDOM_LEN: usize = 1024;

//------------ SoftOp ------------------------------------------------------------------------------------------------

/// The calls a soft token counts and can be told to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SoftOp {
    FindSlot,
    OpenSession,
    Login,
    FindObjects,
    GenerateKeyPair,
    GenerateKey,
    Sign,
    Decrypt,
    GetAttributes,
    DestroyObject,
    GenerateRandom,
    Count,
}

#[derive(Debug)]
struct SoftCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl SoftCallCounts {
    fn new() -> Self {
        SoftCallCounts {
            call_counts: RwLock::new(vec![0; SoftOp::Count as usize]),
        }
    }

    fn get(&self, op: SoftOp) -> u32 {
        self.call_counts.read().unwrap_or_else(PoisonError::into_inner)[op as usize]
    }

    fn total(&self) -> u32 {
        self.call_counts.read().unwrap_or_else(PoisonError::into_inner).iter().sum()
    }

    fn inc(&self, op: SoftOp) {
        self.call_counts.write().unwrap_or_else(PoisonError::into_inner)[op as usize] += 1;
    }
}

struct Fault {
    op: SoftOp,
    successes_left: usize,
    err: TokenError,
}

//------------ Stored objects ----------------------------------------------------------------------------------------

enum KeyMaterial {
    Rsa(Rsa<Private>),
    Dsa(Dsa<Private>),
    Ec(EcKey<Private>, Curve),
    Secret(#[allow(dead_code)] Vec<u8>),
}

struct StoredObject {
    attributes: Vec<Attribute>,
    material: Option<KeyMaterial>,
}

impl StoredObject {
    fn matches(&self, template: &[Attribute]) -> bool {
        template.iter().all(|attr| self.attributes.contains(attr))
    }

    fn allows(&self, usage: Attribute) -> Result<(), TokenError> {
        if self.attributes.contains(&usage) {
            Ok(())
        } else {
            Err(TokenError::Rejected("CKR_KEY_FUNCTION_NOT_PERMITTED".to_string()))
        }
    }
}

/// Add class and key type to a template when the caller left them out. CKA_ID and CKA_LABEL exist on every key and
/// default to empty.
fn complete_template(template: &[Attribute], class: ObjectClass, key_type: KeyType) -> Vec<Attribute> {
    let mut attributes = template.to_vec();
    if !attributes.iter().any(|attr| matches!(attr, Attribute::Class(_))) {
        attributes.push(Attribute::Class(class));
    }
    if attributes.key_type().is_none() {
        attributes.push(Attribute::KeyType(key_type));
    }
    if attributes.bytes_of(AttributeType::Id).is_none() {
        attributes.push(Attribute::Id(Vec::new()));
    }
    if attributes.bytes_of(AttributeType::Label).is_none() {
        attributes.push(Attribute::Label(Vec::new()));
    }
    attributes
}

fn function_failed(err: ErrorStack) -> TokenError {
    TokenError::Rejected(format!("CKR_FUNCTION_FAILED: {}", err))
}

fn template_incomplete(what: &str) -> TokenError {
    TokenError::Rejected(format!("CKR_TEMPLATE_INCOMPLETE: {}", what))
}

/// Left pad each half to `len` bytes and concatenate, the PKCS#11 encoding of DSA and ECDSA signatures.
fn raw_signature(r: &BigNumRef, s: &BigNumRef, len: usize) -> Result<Vec<u8>, TokenError> {
    let mut raw = r.to_vec_padded(len as i32).map_err(function_failed)?;
    raw.extend(s.to_vec_padded(len as i32).map_err(function_failed)?);
    Ok(raw)
}

//------------ SoftToken ---------------------------------------------------------------------------------------------

struct State {
    label: String,
    user_pin: Option<SecretString>,
    objects: RwLock<HashMap<u64, StoredObject>>,
    next_handle: AtomicU64,
    logged_in: AtomicBool,
    open_sessions: AtomicUsize,
    session_generation: AtomicU64,
    max_random_len: AtomicUsize,
    calls: SoftCallCounts,
    faults: Mutex<Vec<Fault>>,
    holds: Mutex<Vec<SoftOp>>,
    released: Condvar,
}

impl State {
    /// Count the call, block while the operation is held and return an injected failure if one is due.
    fn enter(&self, op: SoftOp) -> Result<(), TokenError> {
        self.calls.inc(op);

        let mut holds = self.holds.lock().unwrap_or_else(PoisonError::into_inner);
        while holds.contains(&op) {
            holds = self.released.wait(holds).unwrap_or_else(PoisonError::into_inner);
        }
        drop(holds);

        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = faults.iter().position(|fault| fault.op == op) {
            if faults[pos].successes_left == 0 {
                let fault = faults.remove(pos);
                trace!("Soft token injecting {} for {:?}", fault.err, op);
                return Err(fault.err);
            }
            faults[pos].successes_left -= 1;
        }
        Ok(())
    }

    fn store(&self, object: StoredObject) -> ObjectHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, object);
        ObjectHandle(handle)
    }
}

/// An in-memory token with a single slot, labelled as given.
#[derive(Clone)]
pub struct SoftToken {
    state: Arc<State>,
}

impl SoftToken {
    /// A token that does not require login.
    pub fn new(label: &str) -> Self {
        Self::build(label, None)
    }

    /// A token whose private keys can only be used after logging in with the given PIN.
    pub fn with_user_pin(label: &str, pin: &str) -> Self {
        Self::build(label, Some(SecretString::new(pin.to_string())))
    }

    fn build(label: &str, user_pin: Option<SecretString>) -> Self {
        SoftToken {
            state: Arc::new(State {
                label: label.to_string(),
                user_pin,
                objects: RwLock::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                logged_in: AtomicBool::new(false),
                open_sessions: AtomicUsize::new(0),
                session_generation: AtomicU64::new(0),
                max_random_len: AtomicUsize::new(DEFAULT_MAX_RANDOM_LEN),
                calls: SoftCallCounts::new(),
                faults: Mutex::new(Vec::new()),
                holds: Mutex::new(Vec::new()),
                released: Condvar::new(),
            }),
        }
    }

    /// The selector that finds this token's slot by label.
    pub fn slot_selector(&self) -> SlotIdOrLabel {
        SlotIdOrLabel::Label(self.state.label.clone())
    }

    /// Total number of calls made to the token and its sessions.
    pub fn call_count(&self) -> u32 {
        self.state.calls.total()
    }

    pub fn calls(&self, op: SoftOp) -> u32 {
        self.state.calls.get(op)
    }

    pub fn open_session_count(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.state.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.logged_in.load(Ordering::SeqCst)
    }

    pub fn set_max_random_len(&self, len: usize) {
        self.state.max_random_len.store(len, Ordering::SeqCst);
    }

    /// Make every currently open session fail with CKR_SESSION_HANDLE_INVALID, as after a token reset.
    pub fn invalidate_sessions(&self) {
        self.state.session_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Let `successes` calls of `op` succeed, then fail the next one with `err`.
    pub fn fail_after(&self, op: SoftOp, successes: usize, err: TokenError) {
        self.state
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                op,
                successes_left: successes,
                err,
            });
    }

    pub fn fail_next(&self, op: SoftOp, err: TokenError) {
        self.fail_after(op, 0, err)
    }

    /// Block every call of `op` until the returned hold is dropped. Blocked calls are already counted.
    pub fn hold(&self, op: SoftOp) -> SoftHold {
        self.state.holds.lock().unwrap_or_else(PoisonError::into_inner).push(op);
        SoftHold {
            state: self.state.clone(),
            op,
        }
    }
}

/// Releases the calls blocked by [`SoftToken::hold`] when dropped.
pub struct SoftHold {
    state: Arc<State>,
    op: SoftOp,
}

impl Drop for SoftHold {
    fn drop(&mut self) {
        let mut holds = self.state.holds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = holds.iter().position(|op| *op == self.op) {
            holds.remove(pos);
        }
        self.state.released.notify_all();
    }
}

impl Token for SoftToken {
    fn info(&self) -> String {
        format!("soft token '{}'", self.state.label)
    }

    fn find_slot(&self, slot: &SlotIdOrLabel) -> Result<SlotId, TokenError> {
        self.state.enter(SoftOp::FindSlot)?;
        match slot {
            SlotIdOrLabel::Id(id) if *id == SOFT_TOKEN_SLOT.0 => Ok(SOFT_TOKEN_SLOT),
            SlotIdOrLabel::Label(label) if *label == self.state.label => Ok(SOFT_TOKEN_SLOT),
            _ => Err(TokenError::Fatal(format!("no token present for {}", slot))),
        }
    }

    fn open_session(&self, slot: SlotId) -> Result<Box<dyn TokenSession>, TokenError> {
        self.state.enter(SoftOp::OpenSession)?;
        if slot != SOFT_TOKEN_SLOT {
            return Err(TokenError::Fatal("CKR_SLOT_ID_INVALID".to_string()));
        }
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SoftSession {
            state: self.state.clone(),
            generation: self.state.session_generation.load(Ordering::SeqCst),
        }))
    }
}

//------------ SoftSession -------------------------------------------------------------------------------------------

struct SoftSession {
    state: Arc<State>,
    generation: u64,
}

impl SoftSession {
    fn enter(&self, op: SoftOp) -> Result<(), TokenError> {
        self.state.enter(op)?;
        if self.generation != self.state.session_generation.load(Ordering::SeqCst) {
            return Err(TokenError::SessionInvalid("CKR_SESSION_HANDLE_INVALID".to_string()));
        }
        Ok(())
    }

    fn require_login(&self) -> Result<(), TokenError> {
        if self.state.user_pin.is_some() && !self.state.logged_in.load(Ordering::SeqCst) {
            return Err(TokenError::Rejected("CKR_USER_NOT_LOGGED_IN".to_string()));
        }
        Ok(())
    }

    fn with_object<T>(
        &self,
        handle: ObjectHandle,
        op: impl FnOnce(&StoredObject) -> Result<T, TokenError>,
    ) -> Result<T, TokenError> {
        let objects = self.state.objects.read().unwrap_or_else(PoisonError::into_inner);
        let object = objects
            .get(&handle.0)
            .ok_or_else(|| TokenError::ObjectHandleInvalid(format!("CKR_OBJECT_HANDLE_INVALID: {}", handle)))?;
        op(object)
    }

    fn generate_rsa(&self, public: &[Attribute], private: &[Attribute]) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
        let bits = public
            .ulong_of(AttributeType::ModulusBits)
            .ok_or_else(|| template_incomplete("CKA_MODULUS_BITS"))?;
        let e = match public.bytes_of(AttributeType::PublicExponent) {
            Some(e) => BigNum::from_slice(e).map_err(function_failed)?,
            None => BigNum::from_u32(65537).map_err(function_failed)?,
        };
        let key = Rsa::generate_with_e(bits as u32, &e).map_err(function_failed)?;

        let components = [
            Attribute::Modulus(key.n().to_vec()),
            Attribute::PublicExponent(key.e().to_vec()),
        ];
        let mut public_attrs = complete_template(public, ObjectClass::PublicKey, KeyType::Rsa);
        public_attrs.retain(|attr| !matches!(attr, Attribute::PublicExponent(_)));
        public_attrs.extend(components.iter().cloned());
        let mut private_attrs = complete_template(private, ObjectClass::PrivateKey, KeyType::Rsa);
        private_attrs.extend(components);

        Ok(self.store_pair(public_attrs, private_attrs, KeyMaterial::Rsa(key)))
    }

    fn generate_dsa(&self, public: &[Attribute], private: &[Attribute]) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
        let param = |attr_type: AttributeType, name: &str| {
            public
                .bytes_of(attr_type)
                .ok_or_else(|| template_incomplete(name))
                .and_then(|v| BigNum::from_slice(v).map_err(function_failed))
        };
        let p = param(AttributeType::Prime, "CKA_PRIME")?;
        let q = param(AttributeType::Subprime, "CKA_SUBPRIME")?;
        let g = param(AttributeType::Base, "CKA_BASE")?;

        let key = Self::dsa_key(p, q, g).map_err(function_failed)?;
        let domain = [
            Attribute::Prime(key.p().to_vec()),
            Attribute::Subprime(key.q().to_vec()),
            Attribute::Base(key.g().to_vec()),
        ];

        let mut public_attrs = complete_template(public, ObjectClass::PublicKey, KeyType::Dsa);
        public_attrs.push(Attribute::Value(key.pub_key().to_vec()));
        let mut private_attrs = complete_template(private, ObjectClass::PrivateKey, KeyType::Dsa);
        private_attrs.extend(domain);

        Ok(self.store_pair(public_attrs, private_attrs, KeyMaterial::Dsa(key)))
    }

    /// x uniformly from [1, q - 1] and y = g^x mod p.
    fn dsa_key(p: BigNum, q: BigNum, g: BigNum) -> Result<Dsa<Private>, ErrorStack> {
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        loop {
            x.rand(q.num_bits(), MsbOption::MAYBE_ZERO, false)?;
            if x.num_bits() > 0 && x < q {
                break;
            }
        }
        let mut y = BigNum::new()?;
        y.mod_exp(&g, &x, &p, &mut ctx)?;
        Dsa::from_private_components(p, q, g, x, y)
    }

    fn generate_ec(&self, public: &[Attribute], private: &[Attribute]) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
        let params = public
            .bytes_of(AttributeType::EcParams)
            .ok_or_else(|| template_incomplete("CKA_EC_PARAMS"))?;
        let curve = Curve::from_oid_der(params)
            .ok_or_else(|| TokenError::Rejected("CKR_CURVE_NOT_SUPPORTED".to_string()))?;

        let group = curve.group().map_err(|err| TokenError::Rejected(err.to_string()))?;
        let key = EcKey::generate(&group).map_err(function_failed)?;
        let mut ctx = BigNumContext::new().map_err(function_failed)?;
        let point = key
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
            .map_err(function_failed)?;

        let mut public_attrs = complete_template(public, ObjectClass::PublicKey, KeyType::Ec);
        public_attrs.push(Attribute::EcPoint(wrap_point(&point)));
        let mut private_attrs = complete_template(private, ObjectClass::PrivateKey, KeyType::Ec);
        private_attrs.push(Attribute::EcParams(params.to_vec()));

        Ok(self.store_pair(public_attrs, private_attrs, KeyMaterial::Ec(key, curve)))
    }

    fn store_pair(
        &self,
        public_attrs: Vec<Attribute>,
        private_attrs: Vec<Attribute>,
        material: KeyMaterial,
    ) -> (ObjectHandle, ObjectHandle) {
        let public = self.state.store(StoredObject {
            attributes: public_attrs,
            material: None,
        });
        let private = self.state.store(StoredObject {
            attributes: private_attrs,
            material: Some(material),
        });
        (public, private)
    }

    fn sign_rsa_pss(key: &Rsa<Private>, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let (hash, salt_len) = match mechanism {
            Mechanism::RsaPkcsPss { hash, salt_len } => (*hash, *salt_len),
            _ => return Err(TokenError::Rejected("CKR_MECHANISM_INVALID".to_string())),
        };
        if data.len() != hash.digest_len() {
            return Err(TokenError::Rejected("CKR_DATA_LEN_RANGE".to_string()));
        }

        let run = || -> Result<Vec<u8>, ErrorStack> {
            let pkey = PKey::from_rsa(key.clone())?;
            let mut ctx = PkeyCtx::new(&pkey)?;
            ctx.sign_init()?;
            ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
            ctx.set_signature_md(hash.md())?;
            ctx.set_rsa_mgf1_md(hash.md())?;
            ctx.set_rsa_pss_saltlen(RsaPssSaltlen::custom(salt_len as i32))?;
            let mut sig = vec![];
            ctx.sign_to_vec(data, &mut sig)?;
            Ok(sig)
        };
        run().map_err(function_failed)
    }

    fn sign_rsa_pkcs(key: &Rsa<Private>, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        if data.len() + 11 > key.size() as usize {
            return Err(TokenError::Rejected("CKR_DATA_LEN_RANGE".to_string()));
        }
        let mut sig = vec![0; key.size() as usize];
        let len = key
            .private_encrypt(data, &mut sig, Padding::PKCS1)
            .map_err(function_failed)?;
        sig.truncate(len);
        Ok(sig)
    }

    fn sign_dsa(key: &Dsa<Private>, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let run = || -> Result<DsaSig, ErrorStack> {
            let pkey = PKey::from_dsa(key.clone())?;
            let mut ctx = PkeyCtx::new(&pkey)?;
            ctx.sign_init()?;
            let mut der = vec![];
            ctx.sign_to_vec(data, &mut der)?;
            DsaSig::from_der(&der)
        };
        let sig = run().map_err(function_failed)?;
        let q_len = key.q().num_bytes() as usize;
        raw_signature(sig.r(), sig.s(), q_len)
    }

    fn sign_ecdsa(key: &EcKey<Private>, curve: Curve, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let sig = EcdsaSig::sign(data, key).map_err(function_failed)?;
        raw_signature(sig.r(), sig.s(), curve.field_len())
    }

    fn decrypt_rsa(key: &Rsa<Private>, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        match mechanism {
            Mechanism::RsaPkcs => {
                let mut plain = vec![0; key.size() as usize];
                let len = key
                    .private_decrypt(data, &mut plain, Padding::PKCS1)
                    .map_err(|_| TokenError::Rejected("CKR_ENCRYPTED_DATA_INVALID".to_string()))?;
                plain.truncate(len);
                Ok(plain)
            }
            Mechanism::RsaPkcsOaep { hash } => {
                let run = || -> Result<Vec<u8>, ErrorStack> {
                    let pkey = PKey::from_rsa(key.clone())?;
                    let mut ctx = PkeyCtx::new(&pkey)?;
                    ctx.decrypt_init()?;
                    ctx.set_rsa_padding(Padding::PKCS1_OAEP)?;
                    ctx.set_rsa_oaep_md(hash.md())?;
                    ctx.set_rsa_mgf1_md(hash.md())?;
                    let mut plain = vec![];
                    ctx.decrypt_to_vec(data, &mut plain)?;
                    Ok(plain)
                };
                run().map_err(|_| TokenError::Rejected("CKR_ENCRYPTED_DATA_INVALID".to_string()))
            }
            _ => Err(TokenError::Rejected("CKR_MECHANISM_INVALID".to_string())),
        }
    }
}

impl Drop for SoftSession {
    fn drop(&mut self) {
        // the login state of a token ends with its last session
        if self.state.open_sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.logged_in.store(false, Ordering::SeqCst);
        }
    }
}

impl TokenSession for SoftSession {
    fn login(&self, pin: Option<&SecretString>) -> Result<(), TokenError> {
        self.enter(SoftOp::Login)?;
        if let Some(expected) = &self.state.user_pin {
            match pin {
                Some(pin) if pin.expose_secret() == expected.expose_secret() => {}
                _ => return Err(TokenError::Fatal("CKR_PIN_INCORRECT".to_string())),
            }
        }
        self.state.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, TokenError> {
        self.enter(SoftOp::FindObjects)?;
        let objects = self.state.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<_> = objects
            .iter()
            .filter(|(_, object)| object.matches(template))
            .map(|(handle, _)| ObjectHandle(*handle))
            .collect();
        handles.sort_by_key(|handle| handle.0);
        Ok(handles)
    }

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
        self.enter(SoftOp::GenerateKeyPair)?;
        self.require_login()?;
        match mechanism {
            Mechanism::RsaPkcsKeyPairGen => self.generate_rsa(public_template, private_template),
            Mechanism::DsaKeyPairGen => self.generate_dsa(public_template, private_template),
            Mechanism::EccKeyPairGen => self.generate_ec(public_template, private_template),
            _ => Err(TokenError::Rejected(format!("CKR_MECHANISM_INVALID: {}", mechanism))),
        }
    }

    fn generate_key(&self, mechanism: &Mechanism, template: &[Attribute]) -> Result<ObjectHandle, TokenError> {
        self.enter(SoftOp::GenerateKey)?;
        self.require_login()?;
        if *mechanism != Mechanism::AesKeyGen {
            return Err(TokenError::Rejected(format!("CKR_MECHANISM_INVALID: {}", mechanism)));
        }
        let len = template
            .ulong_of(AttributeType::ValueLen)
            .ok_or_else(|| template_incomplete("CKA_VALUE_LEN"))?;
        if !matches!(len, 16 | 24 | 32) {
            return Err(TokenError::Rejected("CKR_TEMPLATE_INCONSISTENT: CKA_VALUE_LEN".to_string()));
        }

        let mut value = vec![0; len as usize];
        openssl::rand::rand_bytes(&mut value).map_err(function_failed)?;
        Ok(self.state.store(StoredObject {
            attributes: complete_template(template, ObjectClass::SecretKey, KeyType::Aes),
            material: Some(KeyMaterial::Secret(value)),
        }))
    }

    fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.enter(SoftOp::Sign)?;
        self.require_login()?;
        self.with_object(key, |object| {
            object.allows(Attribute::Sign(true))?;
            match (mechanism, &object.material) {
                (Mechanism::RsaPkcs, Some(KeyMaterial::Rsa(key))) => Self::sign_rsa_pkcs(key, data),
                (Mechanism::RsaPkcsPss { .. }, Some(KeyMaterial::Rsa(key))) => Self::sign_rsa_pss(key, mechanism, data),
                (Mechanism::Dsa, Some(KeyMaterial::Dsa(key))) => Self::sign_dsa(key, data),
                (Mechanism::Ecdsa, Some(KeyMaterial::Ec(key, curve))) => Self::sign_ecdsa(key, *curve, data),
                _ => Err(TokenError::Rejected(format!("CKR_KEY_TYPE_INCONSISTENT: {}", mechanism))),
            }
        })
    }

    fn decrypt(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.enter(SoftOp::Decrypt)?;
        self.require_login()?;
        self.with_object(key, |object| {
            object.allows(Attribute::Decrypt(true))?;
            match &object.material {
                Some(KeyMaterial::Rsa(key)) => Self::decrypt_rsa(key, mechanism, data),
                _ => Err(TokenError::Rejected(format!("CKR_KEY_TYPE_INCONSISTENT: {}", mechanism))),
            }
        })
    }

    fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Vec<Attribute>, TokenError> {
        self.enter(SoftOp::GetAttributes)?;
        self.with_object(object, |object| {
            types
                .iter()
                .map(|attr_type| {
                    object
                        .attributes
                        .iter()
                        .find(|attr| attr.attribute_type() == *attr_type)
                        .cloned()
                        .ok_or_else(|| TokenError::Rejected(format!("CKR_ATTRIBUTE_TYPE_INVALID: {:?}", attr_type)))
                })
                .collect()
        })
    }

    fn destroy_object(&self, object: ObjectHandle) -> Result<(), TokenError> {
        self.enter(SoftOp::DestroyObject)?;
        self.state
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object.0)
            .map(|_| ())
            .ok_or_else(|| TokenError::ObjectHandleInvalid(format!("CKR_OBJECT_HANDLE_INVALID: {}", object)))
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, TokenError> {
        self.enter(SoftOp::GenerateRandom)?;
        if len > self.state.max_random_len.load(Ordering::SeqCst) {
            return Err(TokenError::Rejected("CKR_DATA_LEN_RANGE".to_string()));
        }
        let mut buf = vec![0; len];
        openssl::rand::rand_bytes(&mut buf).map_err(function_failed)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_find_slot_by_label_or_id() {
        let token = SoftToken::new("soft");
        assert_eq!(token.find_slot(&token.slot_selector()).unwrap(), SOFT_TOKEN_SLOT);
        assert_eq!(token.find_slot(&SlotIdOrLabel::Id(1)).unwrap(), SOFT_TOKEN_SLOT);
        assert!(matches!(
            token.find_slot(&SlotIdOrLabel::Label("other".into())),
            Err(TokenError::Fatal(_))
        ));
    }

    #[test]
    fn should_forget_login_when_last_session_closes() {
        let token = SoftToken::with_user_pin("soft", "1234");
        let first = token.open_session(SOFT_TOKEN_SLOT).unwrap();
        let second = token.open_session(SOFT_TOKEN_SLOT).unwrap();

        let wrong = SecretString::new("0000".to_string());
        assert!(matches!(first.login(Some(&wrong)), Err(TokenError::Fatal(_))));
        first.login(Some(&SecretString::new("1234".to_string()))).unwrap();
        assert!(token.is_logged_in());

        drop(first);
        assert!(token.is_logged_in());
        drop(second);
        assert!(!token.is_logged_in());
        assert_eq!(token.open_session_count(), 0);
    }

    #[test]
    fn should_fail_invalidated_sessions() {
        let token = SoftToken::new("soft");
        let old = token.open_session(SOFT_TOKEN_SLOT).unwrap();
        token.invalidate_sessions();
        let new = token.open_session(SOFT_TOKEN_SLOT).unwrap();

        assert!(matches!(old.generate_random(8), Err(TokenError::SessionInvalid(_))));
        assert_eq!(new.generate_random(8).unwrap().len(), 8);
    }

    #[test]
    fn should_inject_failures_after_successes() {
        let token = SoftToken::new("soft");
        let session = token.open_session(SOFT_TOKEN_SLOT).unwrap();
        token.fail_after(SoftOp::GenerateRandom, 1, TokenError::Unavailable("CKR_DEVICE_MEMORY".into()));

        assert!(session.generate_random(4).is_ok());
        assert!(matches!(session.generate_random(4), Err(TokenError::Unavailable(_))));
        assert!(session.generate_random(4).is_ok());
        assert_eq!(token.calls(SoftOp::GenerateRandom), 3);
    }

    #[test]
    fn should_give_every_key_an_id_and_label() {
        let token = SoftToken::new("soft");
        let session = token.open_session(SOFT_TOKEN_SLOT).unwrap();
        let key = session
            .generate_key(
                &Mechanism::AesKeyGen,
                &[Attribute::Id(b"bare".to_vec()), Attribute::ValueLen(16)],
            )
            .unwrap();

        let attrs = session
            .get_attributes(key, &[AttributeType::Id, AttributeType::Label])
            .unwrap();
        assert_eq!(attrs, vec![Attribute::Id(b"bare".to_vec()), Attribute::Label(Vec::new())]);
    }

    #[test]
    fn should_block_held_operations_until_released() {
        let token = SoftToken::new("soft");
        let hold = token.hold(SoftOp::GenerateRandom);

        let blocked = {
            let token = token.clone();
            std::thread::spawn(move || {
                let session = token.open_session(SOFT_TOKEN_SLOT).unwrap();
                session.generate_random(8).map(|bytes| bytes.len())
            })
        };
        while token.calls(SoftOp::GenerateRandom) == 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!blocked.is_finished());

        drop(hold);
        assert_eq!(blocked.join().unwrap(), Ok(8));
    }

    #[test]
    fn should_cap_random_requests() {
        let token = SoftToken::new("soft");
        token.set_max_random_len(16);
        let session = token.open_session(SOFT_TOKEN_SLOT).unwrap();
        assert_eq!(session.generate_random(16).unwrap().len(), 16);
        assert!(matches!(session.generate_random(17), Err(TokenError::Rejected(_))));
    }
}
