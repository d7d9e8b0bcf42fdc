//! Pooled sessions and key operations for PKCS#11 security modules.
//!
//! A [`Context`] binds one slot of a loaded module. It owns a bounded pool of sessions and, when the module requires
//! it, a login session that keeps the user logged in for as long as the context is open. Keys generated or found
//! through the context are handed out as [`KeyPair`] and [`SecretKey`] values which hold no session or object handle
//! of their own: every operation borrows a session from the pool and looks the key up again by its identity.
//!
//! The `hsm` feature (on by default) adds the binding to real PKCS#11 libraries. Without it only the in-process
//! [`SoftToken`](token::soft::SoftToken) is available.

pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub(crate) mod pool;
pub mod random;
pub(crate) mod resolver;
pub mod token;

pub use self::{
    config::{Config, ConfigError, LoginMode},
    context::Context,
    error::{Error, ErrorKind},
    keys::{
        Curve, DecryptOptions, DsaParameterSize, DsaParameters, HashAlgorithm, KeyIdentity, KeyPair,
        KeyPairAlgorithm, PssSaltLength, PublicKeyMaterial, RsaPadding, RsSignature, SecretKey, SignOptions,
        SymmetricCipher,
    },
    random::RandomReader,
    token::SlotIdOrLabel,
};
