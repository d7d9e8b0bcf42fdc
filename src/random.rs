//! Reading random bytes from the token's generator.
use std::{io, sync::Weak};

use rand::{TryCryptoRng, TryRngCore};

use crate::{context::Inner, error::Error};

/// Random bytes generated by the token.
///
/// Modules limit how many bytes one C_GenerateRandom call may return, so larger reads are split into calls of at
/// most `max_random_bytes_per_call` bytes, all made on the same session. Reads are never retried: on failure the
/// bytes written so far are reported through [`Error::Incomplete`].
#[derive(Clone, Debug)]
pub struct RandomReader {
    context: Weak<Inner>,
}

impl RandomReader {
    pub(crate) fn new(context: Weak<Inner>) -> Self {
        RandomReader { context }
    }

    /// Fill the whole buffer, returning its length.
    pub fn fill(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let inner = Inner::upgrade(&self.context)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let max_per_call = inner.max_random_bytes_per_call();
        let desc = format!("generate {} random bytes", buf.len());

        inner.with_session(&desc, false, |resolver| {
            let session = resolver.session();
            let mut written = 0;
            while written < buf.len() {
                let len = max_per_call.min(buf.len() - written);
                let cause = match session.generate_random(len) {
                    Ok(bytes) if bytes.len() == len => {
                        buf[written..written + len].copy_from_slice(&bytes);
                        written += len;
                        continue;
                    }
                    Ok(bytes) => Error::Module(format!(
                        "{} returned {} bytes instead of {}",
                        desc,
                        bytes.len(),
                        len
                    )),
                    Err(err) => Error::token(&desc, err),
                };

                return Err(match written {
                    0 => cause,
                    written => Error::Incomplete {
                        written,
                        cause: Box::new(cause),
                    },
                });
            }
            Ok(written)
        })
    }
}

/// A failed read that got some bytes out of the token returns those as a short read.
impl io::Read for RandomReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.fill(buf) {
            Ok(written) => Ok(written),
            Err(Error::Incomplete { written, .. }) => Ok(written),
            Err(err) => Err(io::Error::other(err)),
        }
    }
}

impl TryRngCore for RandomReader {
    type Error = Error;

    fn try_next_u32(&mut self) -> Result<u32, Error> {
        let mut buf = [0; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn try_next_u64(&mut self) -> Result<u64, Error> {
        let mut buf = [0; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn try_fill_bytes(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        self.fill(dst).map(|_| ())
    }
}

impl TryCryptoRng for RandomReader {}
