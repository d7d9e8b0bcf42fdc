mod common;

use openssl::{encrypt::Encrypter, rsa::Padding};
use p11keys::{DecryptOptions, ErrorKind, HashAlgorithm, KeyPairAlgorithm, PssSaltLength, SignOptions};

use crate::common::{open_context, sign_and_verify};

#[test]
fn rsa_pkcs1_signatures_verify_for_every_hash() {
    let (_token, context) = open_context();
    let key = context.generate_rsa_key_pair(b"rsa-pkcs1", 2048).unwrap();
    assert_eq!(key.algorithm(), KeyPairAlgorithm::Rsa);
    assert_eq!(key.id(), Some(b"rsa-pkcs1".as_ref()));
    assert_eq!(key.label(), None);

    for hash in HashAlgorithm::ALL {
        sign_and_verify(&key, b"sign me", &SignOptions::new(hash));
    }
}

#[test]
fn rsa_pss_signatures_verify_for_every_salt_length() {
    let (_token, context) = open_context();
    let key = context
        .generate_rsa_key_pair_with_label(b"rsa-pss", b"pss label", 2048)
        .unwrap();

    for hash in HashAlgorithm::ALL {
        for salt_len in [PssSaltLength::EqualsHash, PssSaltLength::Max, PssSaltLength::Fixed(0)] {
            sign_and_verify(&key, b"sign me with pss", &SignOptions::pss(hash, salt_len));
        }
    }
}

#[test]
fn rsa_pss_rejects_oversized_salt() {
    let (token, context) = open_context();
    let key = context.generate_rsa_key_pair(b"rsa-salt", 1024).unwrap();
    let digest = HashAlgorithm::Sha512.digest(b"data").unwrap();

    let calls = token.call_count();
    let err = key
        .sign(&digest, &SignOptions::pss(HashAlgorithm::Sha512, PssSaltLength::Fixed(128)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(token.call_count(), calls);
}

#[test]
fn rsa_decrypts_what_was_encrypted_to_the_public_key() {
    let (_token, context) = open_context();
    let key = context.generate_rsa_key_pair(b"rsa-decrypt", 2048).unwrap();
    let public_key = key.public_key().to_pkey().unwrap();
    let plain = b"attack at dawn";

    let mut encrypter = Encrypter::new(&public_key).unwrap();
    encrypter.set_rsa_padding(Padding::PKCS1).unwrap();
    let mut ciphertext = vec![0; encrypter.encrypt_len(plain).unwrap()];
    let len = encrypter.encrypt(plain, &mut ciphertext).unwrap();
    ciphertext.truncate(len);
    assert_eq!(key.decrypt(&ciphertext, &DecryptOptions::Pkcs1v15).unwrap(), plain);

    let mut encrypter = Encrypter::new(&public_key).unwrap();
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
    encrypter.set_rsa_oaep_md(HashAlgorithm::Sha256.message_digest()).unwrap();
    encrypter.set_rsa_mgf1_md(HashAlgorithm::Sha256.message_digest()).unwrap();
    let mut ciphertext = vec![0; encrypter.encrypt_len(plain).unwrap()];
    let len = encrypter.encrypt(plain, &mut ciphertext).unwrap();
    ciphertext.truncate(len);
    assert_eq!(
        key.decrypt(&ciphertext, &DecryptOptions::Oaep(HashAlgorithm::Sha256)).unwrap(),
        plain
    );
}

#[test]
fn rsa_generation_validates_arguments_before_calling_the_token() {
    let (token, context) = open_context();
    let calls = token.call_count();

    assert_eq!(
        context.generate_rsa_key_pair(b"", 2048).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        context.generate_rsa_key_pair_with_label(b"id", b"", 2048).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        context.generate_rsa_key_pair_with_label(b"", b"label", 2048).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        context.generate_rsa_key_pair(b"id", 512).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(token.call_count(), calls);
}

#[test]
fn deleted_key_pair_is_gone() {
    let (token, context) = open_context();
    let objects = token.object_count();
    let key = context.generate_rsa_key_pair(b"rsa-delete", 1024).unwrap();
    assert_eq!(token.object_count(), objects + 2);

    key.delete().unwrap();
    assert_eq!(token.object_count(), objects);
    assert_eq!(
        context.find_key_pair(Some(b"rsa-delete"), None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}
