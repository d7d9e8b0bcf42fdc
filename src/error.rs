use std::fmt;

use openssl::error::ErrorStack;

use crate::token::TokenError;

//------------ ErrorKind ---------------------------------------------------------------------------------------------

/// The class of an [`Error`], for callers that want to branch on what went wrong without matching on messages.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    Closed,
    InvalidArgument,
    NotFound,
    AmbiguousMatch,
    ModuleTransient,
    ModuleFatal,
    Module,
    MalformedSignature,
    Timeout,
    Incomplete,
    OpenSsl,
}

//------------ Error -------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// The context was closed. Every operation fails with this once `Context::close` has been called.
    Closed,

    /// A required argument was missing or malformed. Never the result of a module call.
    InvalidArgument(String),

    /// No object matched the lookup.
    NotFound(String),

    /// More than one object matched a lookup that requires a unique match.
    AmbiguousMatch(String),

    /// The session or token was temporarily unusable.
    ModuleTransient(String),

    /// The token cannot be used, e.g. because it was removed or login failed.
    ModuleFatal(String),

    /// The module refused the request.
    Module(String),

    /// A DSA or ECDSA signature could not be decoded.
    MalformedSignature(String),

    /// No session became available within the configured acquire timeout.
    Timeout(String),

    /// A random read stopped before the buffer was full.
    Incomplete { written: usize, cause: Box<Error> },

    OpenSsl(ErrorStack),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Closed => ErrorKind::Closed,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AmbiguousMatch(_) => ErrorKind::AmbiguousMatch,
            Error::ModuleTransient(_) => ErrorKind::ModuleTransient,
            Error::ModuleFatal(_) => ErrorKind::ModuleFatal,
            Error::Module(_) => ErrorKind::Module,
            Error::MalformedSignature(_) => ErrorKind::MalformedSignature,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Incomplete { .. } => ErrorKind::Incomplete,
            Error::OpenSsl(_) => ErrorKind::OpenSsl,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Did a session or the token become temporarily unusable? Such errors end the use of the session involved.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ModuleTransient(_) => true,
            Error::Incomplete { cause, .. } => cause.is_transient(),
            _ => false,
        }
    }

    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    /// Wrap a module error with a description of the operation that failed.
    pub fn token(op: impl fmt::Display, err: TokenError) -> Self {
        let msg = format!("{} failed: {}", op, err);
        match err {
            TokenError::SessionInvalid(_) | TokenError::Unavailable(_) => Error::ModuleTransient(msg),
            TokenError::Fatal(_) => Error::ModuleFatal(msg),
            TokenError::ObjectHandleInvalid(_) | TokenError::Rejected(_) => Error::Module(msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "Context is closed"),
            Error::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::AmbiguousMatch(e) => write!(f, "Ambiguous match: {}", e),
            Error::ModuleTransient(e) => write!(f, "Security module temporarily unavailable: {}", e),
            Error::ModuleFatal(e) => write!(f, "Security module unusable: {}", e),
            Error::Module(e) => write!(f, "Security module error: {}", e),
            Error::MalformedSignature(e) => write!(f, "Malformed signature: {}", e),
            Error::Timeout(e) => write!(f, "Timed out waiting for a session: {}", e),
            Error::Incomplete { written, cause } => {
                write!(f, "Incomplete read after {} bytes: {}", written, cause)
            }
            Error::OpenSsl(e) => write!(f, "OpenSSL error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Incomplete { cause, .. } => Some(cause.as_ref()),
            Error::OpenSsl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSsl(e)
    }
}

impl From<backoff::Error<Error>> for Error {
    fn from(err: backoff::Error<Error>) -> Self {
        match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_map_to_kinds() {
        let cases = [
            (TokenError::SessionInvalid("x".into()), ErrorKind::ModuleTransient),
            (TokenError::Unavailable("x".into()), ErrorKind::ModuleTransient),
            (TokenError::Fatal("x".into()), ErrorKind::ModuleFatal),
            (TokenError::Rejected("x".into()), ErrorKind::Module),
            (TokenError::ObjectHandleInvalid("x".into()), ErrorKind::Module),
        ];
        for (token_err, kind) in cases {
            assert_eq!(Error::token("sign", token_err).kind(), kind);
        }
    }

    #[test]
    fn token_error_message_names_operation() {
        let err = Error::token("sign with key id=01", TokenError::Rejected("CKR_DATA_LEN_RANGE".into()));
        assert_eq!(
            err.to_string(),
            "Security module error: sign with key id=01 failed: request rejected: CKR_DATA_LEN_RANGE"
        );
    }

    #[test]
    fn closed_is_a_kind_comparable_sentinel() {
        assert_eq!(Error::Closed.kind(), ErrorKind::Closed);
        assert!(Error::Closed.is_closed());
        assert!(!Error::Timeout("x".into()).is_closed());
    }
}
