//! Error types and the numeric reply codes carried back over a driver's control pipe.
//!
//! `vocket` follows `uflow`'s habit of forwarding I/O errors as-is and using
//! `assert!` for programmer errors; the one addition here is [`Error`], which exists because
//! the engine boundary (`§4.7`/`§6`) must carry a numeric reply code that a bare
//! [`std::io::Error`] cannot.

use std::fmt;
use std::io;

/// The reply codes returned by [`crate::Engine`] operations, matching the wire-level contract
/// a driver's control pipe uses to answer BIND/CONNECT/CLOSE requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyCode {
    /// The operation succeeded.
    Ok,
    /// The endpoint string was malformed (missing `scheme://` separator, empty host, etc).
    Einval,
    /// No driver is registered for the requested scheme.
    Enoprotoopt,
    /// The socket is already bound or connected to a driver and cannot be rebound.
    Enotsup,
    /// A driver is already registered for this scheme.
    Enotuniq,
    /// A transport-level failure occurred; see the wrapped error for detail.
    Generic,
}

impl ReplyCode {
    /// Returns the raw numeric value of the reply code, as sent over the control pipe.
    pub fn as_i32(&self) -> i32 {
        match self {
            ReplyCode::Ok => 0,
            ReplyCode::Einval => 1,
            ReplyCode::Enoprotoopt => 2,
            ReplyCode::Enotsup => 3,
            ReplyCode::Enotuniq => 4,
            ReplyCode::Generic => 5,
        }
    }
}

/// The kind of configuration mistake that produced a [`ConfigError`](Error::Config).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// The endpoint string had no `scheme://` separator, or an empty host/port.
    MalformedEndpoint(String),
    /// No driver is registered for the given scheme.
    UnknownScheme(String),
    /// A driver is already registered under this scheme.
    DuplicateDriver(String),
    /// The socket already has a bound/connected driver and cannot be rebound.
    AlreadyBound,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigErrorKind::MalformedEndpoint(s) => write!(f, "malformed endpoint: {:?}", s),
            ConfigErrorKind::UnknownScheme(s) => write!(f, "no driver registered for scheme {:?}", s),
            ConfigErrorKind::DuplicateDriver(s) => write!(f, "driver already registered for scheme {:?}", s),
            ConfigErrorKind::AlreadyBound => write!(f, "socket already bound to a driver"),
        }
    }
}

/// The error type returned by fallible [`crate::Engine`] and driver operations.
///
/// Corresponds to the `ConfigError`/`TransientIOError`/`PeerGoneError` error kinds of the
/// design's error-handling section; `CapacityError` and `ProtocolError` are not represented
/// here; they never reach the application, they're absorbed by the reactor as a logged
/// warning and a dropped/rejected message (see `peering` and `driver`).
#[derive(Debug)]
pub enum Error {
    /// A configuration mistake: malformed endpoint, unknown scheme, or duplicate registration.
    Config(ConfigErrorKind),
    /// An I/O failure forwarded from the underlying transport.
    Io(io::Error),
}

impl Error {
    /// Maps this error onto the reply code an engine control-pipe handler sends back.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Error::Config(ConfigErrorKind::MalformedEndpoint(_)) => ReplyCode::Einval,
            Error::Config(ConfigErrorKind::UnknownScheme(_)) => ReplyCode::Enoprotoopt,
            Error::Config(ConfigErrorKind::AlreadyBound) => ReplyCode::Enotsup,
            Error::Config(ConfigErrorKind::DuplicateDriver(_)) => ReplyCode::Enotuniq,
            Error::Io(_) => ReplyCode::Generic,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(kind) => write!(f, "{}", kind),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(_) => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_match_spec() {
        assert_eq!(Error::Config(ConfigErrorKind::MalformedEndpoint("x".into())).reply_code().as_i32(), 1);
        assert_eq!(Error::Config(ConfigErrorKind::UnknownScheme("x".into())).reply_code().as_i32(), 2);
        assert_eq!(Error::Config(ConfigErrorKind::AlreadyBound).reply_code().as_i32(), 3);
        assert_eq!(Error::Config(ConfigErrorKind::DuplicateDriver("x".into())).reply_code().as_i32(), 4);
        assert_eq!(Error::Io(io::Error::new(io::ErrorKind::Other, "boom")).reply_code().as_i32(), 5);
    }
}
