mod common;

use std::sync::Arc;

use p11keys::{Context, Curve, ErrorKind, HashAlgorithm, LoginMode, SignOptions, token::soft::SoftToken};

use crate::common::{PIN, config, open_context, open_context_on, sign_and_verify, verify};

#[test]
fn key_pair_found_by_id_or_label_alone() {
    let (_token, context) = open_context();
    let generated = context
        .generate_ecdsa_key_pair_with_label(b"find-me", b"find label", Curve::P256)
        .unwrap();

    let by_id = context.find_key_pair(Some(b"find-me"), None).unwrap();
    let by_label = context.find_key_pair(None, Some(b"find label")).unwrap();
    let by_both = context.find_key_pair(Some(b"find-me"), Some(b"find label")).unwrap();

    for key in [&by_id, &by_label, &by_both] {
        assert_eq!(key.identity(), generated.identity());
        assert_eq!(key.public_key(), generated.public_key());
        sign_and_verify(key, b"found", &SignOptions::new(HashAlgorithm::Sha256));
    }
}

#[test]
fn lookups_report_missing_and_ambiguous_keys() {
    let (_token, context) = open_context();
    context
        .generate_ecdsa_key_pair_with_label(b"one", b"twins", Curve::P256)
        .unwrap();
    context
        .generate_ecdsa_key_pair_with_label(b"two", b"twins", Curve::P256)
        .unwrap();

    assert_eq!(
        context.find_key_pair(Some(b"three"), None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        context.find_key_pair(Some(b"one"), Some(b"other")).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        context.find_key_pair(None, Some(b"twins")).unwrap_err().kind(),
        ErrorKind::AmbiguousMatch
    );
    assert_eq!(
        context.find_key_pair(None, None).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let mut ids: Vec<_> = context
        .find_key_pairs(None, Some(b"twins"))
        .unwrap()
        .iter()
        .map(|key| key.id().unwrap().to_vec())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![b"one".to_vec(), b"two".to_vec()]);
    assert!(context.find_key_pairs(Some(b"three"), None).unwrap().is_empty());
}

#[test]
fn keys_generated_without_label_can_be_found() {
    let (_token, context) = open_context();
    let generated = context.generate_ecdsa_key_pair(b"bare", Curve::P256).unwrap();
    let secret = context
        .generate_secret_key(b"bare secret", 192, p11keys::SymmetricCipher::Aes)
        .unwrap();

    let found = context.find_key_pair(Some(b"bare"), None).unwrap();
    assert_eq!(found.identity(), generated.identity());
    assert_eq!(found.label(), None);
    assert_eq!(found.public_key(), generated.public_key());
    sign_and_verify(&found, b"bare", &SignOptions::new(HashAlgorithm::Sha256));

    let found = context.find_key(Some(b"bare secret"), None).unwrap();
    assert_eq!(found.identity(), secret.identity());
    assert_eq!(found.label(), None);
    assert_eq!(found.bits(), 192);
}

#[test]
fn secret_keys_are_not_key_pairs() {
    let (_token, context) = open_context();
    context
        .generate_secret_key(b"mixed", 128, p11keys::SymmetricCipher::Aes)
        .unwrap();
    assert_eq!(
        context.find_key_pair(Some(b"mixed"), None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn reopened_context_finds_key_and_old_public_key_verifies() {
    let (token, context) = open_context();
    let key = context.generate_rsa_key_pair(b"persistent", 2048).unwrap();
    let cached_public_key = key.public_key().to_pkey().unwrap();
    context.close().unwrap();
    drop(context);
    assert!(!token.is_logged_in());

    let context = open_context_on(&token);
    let found = context.find_key_pair(Some(b"persistent"), None).unwrap();
    let opts = SignOptions::new(HashAlgorithm::Sha384);
    let digest = opts.hash.digest(b"after reopen").unwrap();
    let signature = found.sign(&digest, &opts).unwrap();
    assert!(verify(&cached_public_key, &digest, &signature, &opts));
}

#[test]
fn login_is_needed_to_use_private_keys() {
    common::init_logging();
    let token = SoftToken::with_user_pin("login token", PIN);

    let mut wrong_pin = config(&token);
    wrong_pin.user_pin = Some(secrecy::SecretString::new("0000".to_string()));
    let err = Context::open(Arc::new(token.clone()), &wrong_pin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleFatal);

    let mut no_login = config(&token);
    no_login.login_mode = LoginMode::LoginNotRequired;
    let context = Context::open(Arc::new(token.clone()), &no_login).unwrap();
    let err = context.generate_rsa_key_pair(b"no-login", 1024).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Module);

    let context = open_context_on(&token);
    assert!(token.is_logged_in());
    context.generate_rsa_key_pair(b"logged-in", 1024).unwrap();
}

#[test]
fn unknown_slot_is_fatal() {
    common::init_logging();
    let token = SoftToken::new("present");
    let mut config = config(&token);
    config.slot = p11keys::SlotIdOrLabel::Label("absent".to_string());
    config.login_mode = LoginMode::LoginNotRequired;

    let err = Context::open(Arc::new(token), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleFatal);
}
