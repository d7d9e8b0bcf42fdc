mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use p11keys::{
    Context, Curve, ErrorKind, HashAlgorithm, LoginMode, SignOptions,
    token::{TokenError, soft::{SoftOp, SoftToken}},
};

use crate::common::{open_context, sign_and_verify};

fn unavailable() -> TokenError {
    TokenError::Unavailable("CKR_DEVICE_MEMORY".to_string())
}

#[test]
fn lookups_survive_a_session_reset() {
    let (token, context) = open_context();
    context.generate_ecdsa_key_pair(b"reset", Curve::P256).unwrap();

    token.invalidate_sessions();
    let key = context.find_key_pair(Some(b"reset"), None).unwrap();
    sign_and_verify(&key, b"after reset", &SignOptions::new(HashAlgorithm::Sha256));
}

#[test]
fn lookups_are_retried_while_the_token_is_busy() {
    let (token, context) = open_context();
    context.generate_ecdsa_key_pair(b"busy", Curve::P256).unwrap();

    token.fail_next(SoftOp::FindObjects, unavailable());
    token.fail_next(SoftOp::FindObjects, unavailable());
    let calls = token.calls(SoftOp::FindObjects);
    context.find_key_pair(Some(b"busy"), None).unwrap();
    assert!(token.calls(SoftOp::FindObjects) - calls >= 3);
}

#[test]
fn lookups_give_up_on_fatal_errors() {
    let (token, context) = open_context();
    token.fail_next(SoftOp::FindObjects, TokenError::Fatal("CKR_DEVICE_REMOVED".to_string()));
    let calls = token.calls(SoftOp::FindObjects);

    let err = context.find_key_pair(Some(b"anything"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleFatal);
    assert_eq!(token.calls(SoftOp::FindObjects) - calls, 1);
}

#[test]
fn lookups_give_up_when_retries_run_out() {
    common::init_logging();
    let token = SoftToken::new("always busy");
    let mut config = common::config(&token);
    config.login_mode = LoginMode::LoginNotRequired;
    config.retry_max_elapsed_ms = 50;
    let context = Context::open(Arc::new(token.clone()), &config).unwrap();

    for _ in 0..1000 {
        token.fail_next(SoftOp::FindObjects, unavailable());
    }
    let err = context.find_key_pair(Some(b"anything"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleTransient);
}

#[test]
fn generation_is_not_retried() {
    let (token, context) = open_context();
    context.generate_ecdsa_key_pair(b"warm up", Curve::P256).unwrap();
    token.invalidate_sessions();

    let calls = token.calls(SoftOp::GenerateKeyPair);
    let err = context.generate_ecdsa_key_pair(b"once", Curve::P256).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleTransient);
    assert_eq!(token.calls(SoftOp::GenerateKeyPair) - calls, 1);

    // the broken session was discarded, the next attempt gets a fresh one
    context.generate_ecdsa_key_pair(b"once", Curve::P256).unwrap();
}

#[test]
fn signing_is_not_retried() {
    let (token, context) = open_context();
    let key = context.generate_ecdsa_key_pair(b"sign-once", Curve::P256).unwrap();
    let digest = HashAlgorithm::Sha256.digest(b"data").unwrap();

    token.fail_next(SoftOp::Sign, unavailable());
    let calls = token.calls(SoftOp::Sign);
    let err = key.sign(&digest, &SignOptions::new(HashAlgorithm::Sha256)).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(token.calls(SoftOp::Sign) - calls, 1);

    key.sign(&digest, &SignOptions::new(HashAlgorithm::Sha256)).unwrap();
}

#[test]
fn pool_exhaustion_times_out() {
    common::init_logging();
    let token = SoftToken::new("exhausted");
    let mut config = common::config(&token);
    config.login_mode = LoginMode::LoginNotRequired;
    config.max_sessions = 1;
    config.acquire_timeout_secs = 1;
    let context = Context::open(Arc::new(token.clone()), &config).unwrap();
    context.generate_ecdsa_key_pair(b"waiting", Curve::P256).unwrap();

    // the reader keeps the only session until the hold is released
    let hold = token.hold(SoftOp::GenerateRandom);
    let reader = context.new_random_reader().unwrap();
    let hog = std::thread::spawn(move || {
        let mut buf = [0; 16];
        reader.fill(&mut buf)
    });
    while token.calls(SoftOp::GenerateRandom) == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }

    let started = Instant::now();
    let err = context.find_key_pair(Some(b"waiting"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(1));

    drop(hold);
    hog.join().unwrap().unwrap();
    context.find_key_pair(Some(b"waiting"), None).unwrap();
}
