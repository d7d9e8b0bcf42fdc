mod common;

use std::io::Read;

use p11keys::{Error, ErrorKind, token::TokenError, token::soft::SoftOp};
use rand::TryRngCore;

use crate::common::open_context;

#[test]
fn reads_of_any_size_fill_the_buffer() {
    let (token, context) = open_context();
    let reader = context.new_random_reader().unwrap();

    for size in [1, 16, 32, 256, 347, 4096, 32768] {
        let calls = token.calls(SoftOp::GenerateRandom);
        let mut buf = vec![0; size];
        assert_eq!(reader.fill(&mut buf).unwrap(), size);
        assert_eq!(token.calls(SoftOp::GenerateRandom) - calls, size.div_ceil(1024) as u32);
        if size >= 32 {
            assert!(buf.iter().any(|b| *b != 0));
        }
    }
}

#[test]
fn reader_works_as_io_read_and_rng() {
    let (_token, context) = open_context();
    let mut reader = context.new_random_reader().unwrap();

    let mut buf = [0; 64];
    reader.read_exact(&mut buf).unwrap();

    let a = reader.try_next_u64().unwrap();
    let b = reader.try_next_u64().unwrap();
    assert_ne!(a, b);

    let mut bytes = [0; 40];
    reader.try_fill_bytes(&mut bytes).unwrap();
}

#[test]
fn failure_midway_reports_bytes_written() {
    let (token, context) = open_context();
    let mut reader = context.new_random_reader().unwrap();

    token.fail_after(SoftOp::GenerateRandom, 2, TokenError::Unavailable("CKR_DEVICE_MEMORY".to_string()));
    let mut buf = vec![0; 4000];
    match reader.fill(&mut buf) {
        Err(Error::Incomplete { written, cause }) => {
            assert_eq!(written, 2048);
            assert_eq!(cause.kind(), ErrorKind::ModuleTransient);
        }
        other => panic!("expected an incomplete read, got {:?}", other),
    }

    // not retried: the failing call was the only one after the two that succeeded
    token.fail_after(SoftOp::GenerateRandom, 1, TokenError::Unavailable("CKR_DEVICE_MEMORY".to_string()));
    let calls = token.calls(SoftOp::GenerateRandom);
    assert_eq!(reader.read(&mut buf).unwrap(), 1024);
    assert_eq!(token.calls(SoftOp::GenerateRandom) - calls, 2);

    token.fail_next(SoftOp::GenerateRandom, TokenError::Fatal("CKR_DEVICE_REMOVED".to_string()));
    assert_eq!(reader.fill(&mut buf).unwrap_err().kind(), ErrorKind::ModuleFatal);
    assert!(reader.read(&mut [0; 8]).is_ok());
}

#[test]
fn per_call_limit_follows_configuration() {
    common::init_logging();
    let token = p11keys::token::soft::SoftToken::new("small random");
    token.set_max_random_len(100);

    let mut config = common::config(&token);
    config.login_mode = p11keys::LoginMode::LoginNotRequired;
    config.max_random_bytes_per_call = 64;
    let context = p11keys::Context::open(std::sync::Arc::new(token.clone()), &config).unwrap();

    let mut buf = vec![0; 1000];
    assert_eq!(context.new_random_reader().unwrap().fill(&mut buf).unwrap(), 1000);
    assert_eq!(token.calls(SoftOp::GenerateRandom), 16);
}
