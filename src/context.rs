//! The entry point: a context owns the connection to one token and hands out keys and random readers.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use backoff::ExponentialBackoff;
use log::{debug, error, info, warn};

use crate::{
    config::{Config, LoginMode},
    error::Error,
    keys::{
        Curve, DsaParameterSize, DsaParameters, KeyIdentity, KeyPair, KeyPairAlgorithm, SecretKey, SymmetricCipher,
        aes, dsa, ecdsa, rsa,
    },
    pool::SessionPool,
    random::RandomReader,
    resolver::{KeyQuery, ObjectResolver},
    token::{Attribute, Mechanism, ObjectClass, SlotId, Token, TokenSession},
};

//------------ Context -----------------------------------------------------------------------------------------------

/// A handle to a token, shared by cloning.
///
/// Once [`Context::close`] has been called, or the last clone has been dropped, every operation on the context and on
/// the keys and readers obtained from it fails with [`Error::Closed`] without calling the token.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Load the PKCS#11 library named in the configuration and open a context on the configured slot.
    #[cfg(feature = "hsm")]
    pub fn configure(config: &Config) -> Result<Context, Error> {
        let lib_path = config
            .lib_path
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("lib_path must be set to load a PKCS#11 library"))?;
        let token = crate::token::pkcs11::Pkcs11Token::load(lib_path)?;
        Context::open(Arc::new(token), config)
    }

    /// Read a TOML configuration file and [`Context::configure`] from it.
    #[cfg(feature = "hsm")]
    pub fn configure_from_file(path: &std::path::Path) -> Result<Context, Error> {
        let config = Config::read_config(path)
            .map_err(|err| Error::invalid_argument(format!("cannot use config file '{}': {}", path.display(), err)))?;
        Context::configure(&config)
    }

    /// Open a context on an already loaded token, e.g. a [`SoftToken`](crate::token::soft::SoftToken).
    pub fn open(token: Arc<dyn Token>, config: &Config) -> Result<Context, Error> {
        config.verify().map_err(Error::invalid_argument)?;

        let slot = token
            .find_slot(&config.slot)
            .map_err(|err| Error::token(format!("find {}", config.slot), err))?;

        // All sessions share the login state of the token, and that state ends when the last session closes. So one
        // session is kept open for as long as the context lives, outside of the pool.
        let login_session = match config.login_mode {
            LoginMode::LoginRequired => {
                let session = token
                    .open_session(slot)
                    .map_err(|err| Error::token("open login session", err))?;
                session
                    .login(config.user_pin.as_ref())
                    .map_err(|err| Error::token(format!("login to slot {}", slot), err))?;
                Some(session)
            }
            LoginMode::LoginNotRequired => None,
        };

        let pool = SessionPool::new(token.clone(), slot, config.max_sessions, config.acquire_timeout())?;

        info!(
            "Using slot {} of {} with at most {} sessions",
            slot,
            token.info(),
            config.max_sessions
        );

        Ok(Context {
            inner: Arc::new(Inner {
                token,
                slot,
                pool,
                login_session: Mutex::new(login_session),
                max_random_bytes_per_call: config.max_random_bytes_per_call,
                retry_initial_interval: config.retry_initial_interval(),
                retry_multiplier: config.retry_multiplier,
                retry_max_elapsed: config.retry_max_elapsed(),
            }),
        })
    }

    pub fn slot(&self) -> SlotId {
        self.inner.slot
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Close all sessions. Closing a closed context does nothing.
    pub fn close(&self) -> Result<(), Error> {
        self.inner.close();
        Ok(())
    }

    //--- RSA

    pub fn generate_rsa_key_pair(&self, id: &[u8], bits: u32) -> Result<KeyPair, Error> {
        self.generate_rsa(KeyIdentity::new(Some(id), None), bits, false)
    }

    pub fn generate_rsa_key_pair_with_label(&self, id: &[u8], label: &[u8], bits: u32) -> Result<KeyPair, Error> {
        self.generate_rsa(KeyIdentity::new(Some(id), Some(label)), bits, true)
    }

    fn generate_rsa(&self, identity: KeyIdentity, bits: u32, with_label: bool) -> Result<KeyPair, Error> {
        self.inner.check_open()?;
        Self::require_identity(&identity, with_label)?;
        let (public, private) = rsa::key_pair_templates(&identity, bits)?;
        self.generate_key_pair(identity, KeyPairAlgorithm::Rsa, Mechanism::RsaPkcsKeyPairGen, public, private)
    }

    //--- DSA

    /// Generate a DSA key pair with fresh domain parameters of the given size.
    pub fn generate_dsa_key_pair(&self, id: &[u8], size: DsaParameterSize) -> Result<KeyPair, Error> {
        self.generate_dsa(KeyIdentity::new(Some(id), None), size, false)
    }

    pub fn generate_dsa_key_pair_with_label(
        &self,
        id: &[u8],
        label: &[u8],
        size: DsaParameterSize,
    ) -> Result<KeyPair, Error> {
        self.generate_dsa(KeyIdentity::new(Some(id), Some(label)), size, true)
    }

    /// Generate a DSA key pair with the given domain parameters. The label is optional.
    pub fn generate_dsa_key_pair_with_parameters(
        &self,
        id: &[u8],
        label: Option<&[u8]>,
        parameters: &DsaParameters,
    ) -> Result<KeyPair, Error> {
        self.inner.check_open()?;
        let identity = KeyIdentity::new(Some(id), label);
        identity.require_id()?;
        let (public, private) = dsa::key_pair_templates(&identity, parameters);
        self.generate_key_pair(identity, KeyPairAlgorithm::Dsa, Mechanism::DsaKeyPairGen, public, private)
    }

    fn generate_dsa(&self, identity: KeyIdentity, size: DsaParameterSize, with_label: bool) -> Result<KeyPair, Error> {
        self.inner.check_open()?;
        Self::require_identity(&identity, with_label)?;
        debug!("Generating {} DSA domain parameters for {}", size, identity);
        let parameters = DsaParameters::generate(size)?;
        let (public, private) = dsa::key_pair_templates(&identity, &parameters);
        self.generate_key_pair(identity, KeyPairAlgorithm::Dsa, Mechanism::DsaKeyPairGen, public, private)
    }

    //--- ECDSA

    pub fn generate_ecdsa_key_pair(&self, id: &[u8], curve: Curve) -> Result<KeyPair, Error> {
        self.generate_ecdsa(KeyIdentity::new(Some(id), None), curve, false)
    }

    pub fn generate_ecdsa_key_pair_with_label(&self, id: &[u8], label: &[u8], curve: Curve) -> Result<KeyPair, Error> {
        self.generate_ecdsa(KeyIdentity::new(Some(id), Some(label)), curve, true)
    }

    fn generate_ecdsa(&self, identity: KeyIdentity, curve: Curve, with_label: bool) -> Result<KeyPair, Error> {
        self.inner.check_open()?;
        Self::require_identity(&identity, with_label)?;
        let (public, private) = ecdsa::key_pair_templates(&identity, curve);
        self.generate_key_pair(identity, KeyPairAlgorithm::Ecdsa, Mechanism::EccKeyPairGen, public, private)
    }

    fn generate_key_pair(
        &self,
        identity: KeyIdentity,
        algorithm: KeyPairAlgorithm,
        mechanism: Mechanism,
        public_template: Vec<Attribute>,
        private_template: Vec<Attribute>,
    ) -> Result<KeyPair, Error> {
        let desc = format!("generate {} key pair {}", algorithm, identity);
        let weak = Arc::downgrade(&self.inner);
        let key_pair = self.inner.with_session(&desc, false, |resolver| {
            KeyPair::generate(
                weak.clone(),
                resolver,
                &identity,
                &mechanism,
                &public_template,
                &private_template,
                algorithm,
            )
        })?;
        info!("Generated {} key pair {}", algorithm, identity);
        Ok(key_pair)
    }

    //--- Secret keys

    pub fn generate_secret_key(&self, id: &[u8], bits: u32, cipher: SymmetricCipher) -> Result<SecretKey, Error> {
        self.generate_secret(KeyIdentity::new(Some(id), None), bits, cipher, false)
    }

    pub fn generate_secret_key_with_label(
        &self,
        id: &[u8],
        label: &[u8],
        bits: u32,
        cipher: SymmetricCipher,
    ) -> Result<SecretKey, Error> {
        self.generate_secret(KeyIdentity::new(Some(id), Some(label)), bits, cipher, true)
    }

    fn generate_secret(
        &self,
        identity: KeyIdentity,
        bits: u32,
        cipher: SymmetricCipher,
        with_label: bool,
    ) -> Result<SecretKey, Error> {
        self.inner.check_open()?;
        Self::require_identity(&identity, with_label)?;
        let template = aes::key_template(&identity, cipher, bits)?;
        let mechanism = cipher.generation_mechanism();

        let desc = format!("generate {} secret key {}", cipher, identity);
        self.inner.with_session(&desc, false, |resolver| {
            resolver
                .session()
                .generate_key(&mechanism, &template)
                .map_err(|err| Error::token(&desc, err))
        })?;

        info!("Generated {}-bit {} key {}", bits, cipher, identity);
        Ok(SecretKey::new(Arc::downgrade(&self.inner), identity, cipher, bits))
    }

    fn require_identity(identity: &KeyIdentity, with_label: bool) -> Result<(), Error> {
        if with_label {
            identity.require_id_and_label()
        } else {
            identity.require_id()
        }
    }

    //--- Lookup

    /// Find the one key pair with the given identifier and/or label.
    pub fn find_key_pair(&self, id: Option<&[u8]>, label: Option<&[u8]>) -> Result<KeyPair, Error> {
        self.inner.check_open()?;
        let query = KeyQuery::new(KeyIdentity::new(id, label), ObjectClass::PrivateKey)?;
        let weak = Arc::downgrade(&self.inner);

        self.inner.with_session(&format!("find key pair {}", query), true, |resolver| {
            let handle = resolver.find_one(&query)?;
            KeyPair::load(weak.clone(), resolver, handle)
        })
    }

    /// Find all key pairs with the given identifier and/or label.
    pub fn find_key_pairs(&self, id: Option<&[u8]>, label: Option<&[u8]>) -> Result<Vec<KeyPair>, Error> {
        self.inner.check_open()?;
        let query = KeyQuery::new(KeyIdentity::new(id, label), ObjectClass::PrivateKey)?;
        let weak = Arc::downgrade(&self.inner);

        self.inner.with_session(&format!("find key pairs {}", query), true, |resolver| {
            resolver
                .find_all(&query)?
                .into_iter()
                .map(|handle| KeyPair::load(weak.clone(), resolver, handle))
                .collect()
        })
    }

    /// Find the one secret key with the given identifier and/or label.
    pub fn find_key(&self, id: Option<&[u8]>, label: Option<&[u8]>) -> Result<SecretKey, Error> {
        self.inner.check_open()?;
        let query = KeyQuery::new(KeyIdentity::new(id, label), ObjectClass::SecretKey)?;
        let weak = Arc::downgrade(&self.inner);

        self.inner.with_session(&format!("find {}", query), true, |resolver| {
            let handle = resolver.find_one(&query)?;
            SecretKey::load(weak.clone(), resolver, handle)
        })
    }

    pub fn find_keys(&self, id: Option<&[u8]>, label: Option<&[u8]>) -> Result<Vec<SecretKey>, Error> {
        self.inner.check_open()?;
        let query = KeyQuery::new(KeyIdentity::new(id, label), ObjectClass::SecretKey)?;
        let weak = Arc::downgrade(&self.inner);

        self.inner.with_session(&format!("find all {}", query), true, |resolver| {
            resolver
                .find_all(&query)?
                .into_iter()
                .map(|handle| SecretKey::load(weak.clone(), resolver, handle))
                .collect()
        })
    }

    //--- Random

    pub fn new_random_reader(&self) -> Result<RandomReader, Error> {
        self.inner.check_open()?;
        Ok(RandomReader::new(Arc::downgrade(&self.inner)))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("token", &self.inner.token.info())
            .field("slot", &self.inner.slot)
            .field("closed", &self.inner.pool.is_closed())
            .finish()
    }
}

//------------ Inner -------------------------------------------------------------------------------------------------

pub(crate) struct Inner {
    token: Arc<dyn Token>,
    slot: SlotId,
    pool: SessionPool,
    login_session: Mutex<Option<Box<dyn TokenSession>>>,
    max_random_bytes_per_call: usize,
    retry_initial_interval: Duration,
    retry_multiplier: f64,
    retry_max_elapsed: Duration,
}

impl Inner {
    /// Get at the context from a key or reader, failing if it was dropped or closed.
    pub(crate) fn upgrade(context: &Weak<Inner>) -> Result<Arc<Inner>, Error> {
        let inner = context.upgrade().ok_or(Error::Closed)?;
        inner.check_open()?;
        Ok(inner)
    }

    pub(crate) fn check_open(&self) -> Result<(), Error> {
        if self.pool.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn max_random_bytes_per_call(&self) -> usize {
        self.max_random_bytes_per_call
    }

    /// Perform an operation using a pooled session.
    ///
    /// A session that fails with a transient error is discarded. If the operation is idempotent, i.e. only reads from
    /// the token, it is then retried with backoff on a fresh session. Generating keys, signing, decrypting and reading
    /// random bytes are never repeated.
    pub(crate) fn with_session<T, F>(&self, desc: &str, idempotent: bool, mut op: F) -> Result<T, Error>
    where
        F: FnMut(&mut ObjectResolver) -> Result<T, Error>,
    {
        self.check_open()?;

        let mut attempt = || -> Result<T, Error> {
            let mut guard = self.pool.acquire()?;
            let res = {
                let mut resolver = ObjectResolver::new(&*guard, self.slot);
                op(&mut resolver)
            };
            if let Err(err) = &res {
                if err.is_transient() {
                    warn!("Discarding session after {} failed: {}", desc, err);
                    guard.invalidate();
                }
            }
            res
        };

        if !idempotent {
            return attempt();
        }

        let backoff_policy = ExponentialBackoff {
            current_interval: self.retry_initial_interval,
            initial_interval: self.retry_initial_interval,
            multiplier: self.retry_multiplier,
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        };

        let notify = |err, next: Duration| {
            warn!("{} failed, retrying in {} ms: {}", desc, next.as_millis(), err);
        };

        let operation = || {
            attempt().map_err(|err| {
                if err.is_transient() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        };

        backoff::retry_notify(backoff_policy, operation, notify).map_err(|err| {
            let err = Error::from(err);
            if err.is_transient() {
                error!("{} failed, retries exhausted: {}", desc, err);
            }
            err
        })
    }

    fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.pool.close_all();
        if self
            .login_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Closed login session to slot {}", self.slot);
        }
        info!("Closed context for slot {} of {}", self.slot, self.token.info());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}
