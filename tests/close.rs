mod common;

use std::{sync::Arc, thread, time::Duration};

use p11keys::{
    Context, Curve, DsaParameterSize, ErrorKind, HashAlgorithm, LoginMode, SignOptions, SymmetricCipher,
    token::soft::SoftToken,
};

use crate::common::open_context;

#[test]
fn every_operation_fails_after_close_without_calling_the_token() {
    let (token, context) = open_context();
    let key_pair = context.generate_ecdsa_key_pair(b"closing", Curve::P256).unwrap();
    let secret_key = context.generate_secret_key(b"closing-aes", 128, SymmetricCipher::Aes).unwrap();
    let reader = context.new_random_reader().unwrap();
    let digest = HashAlgorithm::Sha256.digest(b"data").unwrap();

    context.close().unwrap();
    assert!(context.is_closed());
    assert_eq!(token.open_session_count(), 0);
    assert!(!token.is_logged_in());
    let calls = token.call_count();

    let closed = |kind: ErrorKind| assert_eq!(kind, ErrorKind::Closed);
    closed(context.generate_rsa_key_pair(b"x", 2048).unwrap_err().kind());
    closed(context.generate_rsa_key_pair_with_label(b"x", b"y", 2048).unwrap_err().kind());
    closed(context.generate_dsa_key_pair(b"x", DsaParameterSize::L1024N160).unwrap_err().kind());
    closed(context.generate_dsa_key_pair_with_label(b"x", b"y", DsaParameterSize::L1024N160).unwrap_err().kind());
    closed(context.generate_ecdsa_key_pair(b"x", Curve::P256).unwrap_err().kind());
    closed(context.generate_ecdsa_key_pair_with_label(b"x", b"y", Curve::P256).unwrap_err().kind());
    closed(context.generate_secret_key(b"x", 128, SymmetricCipher::Aes).unwrap_err().kind());
    closed(context.generate_secret_key_with_label(b"x", b"y", 128, SymmetricCipher::Aes).unwrap_err().kind());
    closed(context.find_key_pair(Some(b"closing"), None).unwrap_err().kind());
    closed(context.find_key_pairs(Some(b"closing"), None).unwrap_err().kind());
    closed(context.find_key(Some(b"closing-aes"), None).unwrap_err().kind());
    closed(context.find_keys(Some(b"closing-aes"), None).unwrap_err().kind());
    closed(context.new_random_reader().unwrap_err().kind());
    closed(key_pair.sign(&digest, &SignOptions::new(HashAlgorithm::Sha256)).unwrap_err().kind());
    closed(key_pair.clone().delete().unwrap_err().kind());
    closed(secret_key.delete().unwrap_err().kind());
    closed(reader.fill(&mut [0; 16]).unwrap_err().kind());

    // closed takes precedence over invalid arguments
    closed(context.generate_rsa_key_pair(b"", 1).unwrap_err().kind());
    closed(context.find_key_pair(None, None).unwrap_err().kind());

    assert_eq!(token.call_count(), calls);
    context.close().unwrap();
}

#[test]
fn dropping_the_context_closes_it() {
    let (token, context) = open_context();
    let key = context.generate_ecdsa_key_pair(b"dropped", Curve::P256).unwrap();
    drop(context);

    assert_eq!(token.open_session_count(), 0);
    let digest = HashAlgorithm::Sha256.digest(b"data").unwrap();
    let err = key.sign(&digest, &SignOptions::new(HashAlgorithm::Sha256)).unwrap_err();
    assert!(err.is_closed());
}

#[test]
fn session_in_use_during_close_is_closed_on_release() {
    common::init_logging();
    let token = SoftToken::new("busy token");
    let mut config = common::config(&token);
    config.login_mode = LoginMode::LoginNotRequired;
    config.max_random_bytes_per_call = 1;
    let context = Context::open(Arc::new(token.clone()), &config).unwrap();
    let reader = context.new_random_reader().unwrap();

    let worker = {
        let reader = reader.clone();
        thread::spawn(move || {
            let mut buf = vec![0; 20_000];
            reader.fill(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(20));
    context.close().unwrap();

    // the read in progress either finished or failed, but its session does not survive
    let _ = worker.join().unwrap();
    assert_eq!(token.open_session_count(), 0);
    assert_eq!(reader.fill(&mut [0; 4]).unwrap_err().kind(), ErrorKind::Closed);
}

#[test]
fn clones_share_the_closed_state() {
    let (_token, context) = open_context();
    let other = Arc::new(context.clone());
    other.close().unwrap();
    assert!(context.is_closed());
    assert_eq!(
        context.generate_ecdsa_key_pair(b"late", Curve::P256).unwrap_err().kind(),
        ErrorKind::Closed
    );
}
