#![allow(dead_code)] // Different tests use different parts.

use std::sync::Arc;

use openssl::{
    pkey::{Id, PKey, Public},
    pkey_ctx::PkeyCtx,
    rsa::Padding,
    sign::RsaPssSaltlen,
};
use p11keys::{Config, Context, KeyPair, PssSaltLength, RsaPadding, SignOptions, token::soft::SoftToken};
use secrecy::SecretString;

pub const PIN: &str = "1234";

pub fn init_logging() {
    let _ = stderrlog::new().verbosity(2).init();
}

/// A configuration for the given soft token with short timeouts and retries.
pub fn config(token: &SoftToken) -> Config {
    let mut config = Config::new(token.slot_selector());
    config.max_sessions = 4;
    config.acquire_timeout_secs = 5;
    config.retry_initial_interval_ms = 5;
    config.retry_max_elapsed_ms = 2000;
    config
}

/// A token that needs a login with [`PIN`] and a context that is logged in to it.
pub fn open_context() -> (SoftToken, Context) {
    init_logging();
    let token = SoftToken::with_user_pin("test token", PIN);
    let context = open_context_on(&token);
    (token, context)
}

pub fn open_context_on(token: &SoftToken) -> Context {
    let mut config = config(token);
    config.user_pin = Some(SecretString::new(PIN.to_string()));
    Context::open(Arc::new(token.clone()), &config).unwrap()
}

/// Verify a signature over a pre-computed digest.
pub fn verify(public_key: &PKey<Public>, digest: &[u8], signature: &[u8], opts: &SignOptions) -> bool {
    let mut ctx = PkeyCtx::new(public_key).unwrap();
    ctx.verify_init().unwrap();
    ctx.set_signature_md(opts.hash.md()).unwrap();
    if public_key.id() == Id::RSA {
        match opts.padding {
            RsaPadding::Pkcs1v15 => ctx.set_rsa_padding(Padding::PKCS1).unwrap(),
            RsaPadding::Pss(salt_len) => {
                ctx.set_rsa_padding(Padding::PKCS1_PSS).unwrap();
                ctx.set_rsa_mgf1_md(opts.hash.md()).unwrap();
                let salt_len = match salt_len {
                    PssSaltLength::EqualsHash => RsaPssSaltlen::DIGEST_LENGTH,
                    PssSaltLength::Max => RsaPssSaltlen::MAXIMUM_LENGTH,
                    PssSaltLength::Fixed(len) => RsaPssSaltlen::custom(len as i32),
                };
                ctx.set_rsa_pss_saltlen(salt_len).unwrap();
            }
        }
    }
    ctx.verify(digest, signature).unwrap_or(false)
}

/// Sign a digest of `data` with the key and check it against the public key that came with it.
pub fn sign_and_verify(key: &KeyPair, data: &[u8], opts: &SignOptions) {
    let digest = opts.hash.digest(data).unwrap();
    let signature = key.sign(&digest, opts).unwrap();
    let public_key = key.public_key().to_pkey().unwrap();
    assert!(
        verify(&public_key, &digest, &signature, opts),
        "{:?} signature by {} does not verify",
        opts,
        key.identity()
    );
}

