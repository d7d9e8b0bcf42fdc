mod common;

use p11keys::{
    DsaParameterSize, DsaParameters, ErrorKind, HashAlgorithm, KeyPairAlgorithm, PssSaltLength, PublicKeyMaterial,
    RsSignature, SignOptions,
};

use crate::common::{open_context, sign_and_verify};

#[test]
fn dsa_signatures_are_der_and_verify_for_every_hash() {
    let (_token, context) = open_context();
    let key = context
        .generate_dsa_key_pair(b"dsa-1024", DsaParameterSize::L1024N160)
        .unwrap();
    assert_eq!(key.algorithm(), KeyPairAlgorithm::Dsa);

    for hash in HashAlgorithm::ALL {
        let opts = SignOptions::new(hash);
        sign_and_verify(&key, b"sign me", &opts);

        let digest = hash.digest(b"sign me").unwrap();
        let signature = key.sign(&digest, &opts).unwrap();
        RsSignature::from_der(&signature).unwrap();
    }
}

#[test]
fn dsa_uses_requested_parameter_size() {
    let (_token, context) = open_context();
    let key = context
        .generate_dsa_key_pair_with_label(b"dsa-2048", b"dsa label", DsaParameterSize::L2048N224)
        .unwrap();
    assert_eq!(key.label(), Some(b"dsa label".as_ref()));

    match key.public_key() {
        PublicKeyMaterial::Dsa(public_key) => {
            assert_eq!(public_key.parameters().p().len(), 256);
            assert_eq!(public_key.parameters().q().len(), 28);
        }
        other => panic!("unexpected public key {:?}", other),
    }
    sign_and_verify(&key, b"sign me", &SignOptions::new(HashAlgorithm::Sha224));
}

#[test]
fn dsa_key_pairs_can_share_parameters() {
    let (_token, context) = open_context();
    let parameters = DsaParameters::generate(DsaParameterSize::L1024N160).unwrap();

    let first = context
        .generate_dsa_key_pair_with_parameters(b"dsa-shared-1", None, &parameters)
        .unwrap();
    let second = context
        .generate_dsa_key_pair_with_parameters(b"dsa-shared-2", Some(b"second"), &parameters)
        .unwrap();

    for key in [&first, &second] {
        match key.public_key() {
            PublicKeyMaterial::Dsa(public_key) => assert_eq!(public_key.parameters(), &parameters),
            other => panic!("unexpected public key {:?}", other),
        }
        sign_and_verify(key, b"shared", &SignOptions::new(HashAlgorithm::Sha256));
    }
    assert_ne!(first.public_key(), second.public_key());
}

#[test]
fn dsa_refuses_pss_and_empty_identity() {
    let (token, context) = open_context();
    let key = context
        .generate_dsa_key_pair(b"dsa-pss", DsaParameterSize::L1024N160)
        .unwrap();
    let digest = HashAlgorithm::Sha256.digest(b"data").unwrap();

    let calls = token.call_count();
    let err = key
        .sign(&digest, &SignOptions::pss(HashAlgorithm::Sha256, PssSaltLength::EqualsHash))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = context
        .generate_dsa_key_pair_with_label(b"dsa", b"", DsaParameterSize::L1024N160)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(token.call_count(), calls);
}
