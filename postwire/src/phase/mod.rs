//! Connection phases before the connection is ready for query.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use std::{borrow::Cow, fmt};

mod startup;
pub mod sasl;

pub use startup::{StartupConfig, StartupResponse, startup};
pub use sasl::{SaslError, ScramSha256};

/// An error during authentication.
pub enum AuthError {
    /// SCRAM exchange failed.
    Sasl(SaslError),
    /// Server sent authentication request other than expected in the current step.
    UnexpectedAuthCode {
        expected: u32,
        found: u32,
    },
    /// Authentication method is not supported.
    Unsupported(Cow<'static, str>),
}

impl From<SaslError> for AuthError {
    fn from(value: SaslError) -> Self {
        Self::Sasl(value)
    }
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sasl(e) => e.fmt(f),
            Self::UnexpectedAuthCode { expected, found } => {
                write!(f, "unexpected authentication request {found}, expected {expected}")
            },
            Self::Unsupported(method) => write!(f, "authentication method not supported: {method}"),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
