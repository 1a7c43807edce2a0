//! LDAP errors

use std::{error, fmt, io};

use futures::channel::mpsc::SendError;

use crate::{
    ber::BerError,
    channel::ChannelError,
    filter::Rule,
    model::SearchResult,
    proto::{BindResponse, LdapResult, ResultCode},
};

/// LDAP operation error: a response with a non-zero result code. Receiving
/// one is a normal protocol exchange and leaves the connection usable.
#[derive(Debug)]
pub struct OperationError {
    /// Result code
    pub result_code: ResultCode,
    /// Matched DN
    pub matched_dn: String,
    /// Diagnostic message
    pub diagnostic_message: String,
}

impl From<LdapResult> for OperationError {
    fn from(r: LdapResult) -> Self {
        OperationError {
            result_code: r.result_code,
            matched_dn: r.matched_dn,
            diagnostic_message: r.diagnostic_message,
        }
    }
}

impl From<BindResponse> for OperationError {
    fn from(r: BindResponse) -> Self {
        r.result.into()
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.result_code, self.diagnostic_message)
    }
}

/// LDAP errors
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    Io(io::Error),
    Ber(BerError),
    Channel(ChannelError),
    Tls(native_tls::Error),
    Send(SendError),
    Protocol(&'static str),
    UnsupportedOp { message_id: i32, tag: u32 },
    OperationFailed(OperationError),
    InvalidFilter(pest::error::Error<Rule>),
    InvalidDn(String),
    InvalidResponse,
    ConnectionClosed,
    MessageIdsExhausted,
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<BerError> for Error {
    fn from(e: BerError) -> Self {
        Error::Ber(e)
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        Error::Channel(e)
    }
}

impl From<native_tls::Error> for Error {
    fn from(e: native_tls::Error) -> Self {
        Error::Tls(e)
    }
}

impl From<SendError> for Error {
    fn from(e: SendError) -> Self {
        Error::Send(e)
    }
}

impl From<pest::error::Error<Rule>> for Error {
    fn from(e: pest::error::Error<Rule>) -> Self {
        Error::InvalidFilter(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{e}"),
            Error::Ber(e) => write!(f, "{e}"),
            Error::Channel(e) => write!(f, "{e}"),
            Error::Tls(e) => write!(f, "{e}"),
            Error::Send(e) => write!(f, "{e}"),
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::UnsupportedOp { message_id, tag } => {
                write!(f, "unsupported operation tag {tag} in message {message_id}")
            }
            Error::OperationFailed(e) => write!(f, "LDAP operation failed: {e}"),
            Error::InvalidFilter(e) => write!(f, "{e}"),
            Error::InvalidDn(e) => write!(f, "invalid DN: {e}"),
            Error::InvalidResponse => write!(f, "invalid response"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::MessageIdsExhausted => write!(f, "message ids exhausted"),
        }
    }
}

/// Failure during a paged search, carrying the pages collected before the
/// fault.
#[derive(Debug)]
pub struct PagedSearchError {
    /// Entries and references received before the failing page.
    pub partial: SearchResult,
    pub source: Error,
}

impl error::Error for PagedSearchError {}

impl fmt::Display for PagedSearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "paged search failed after {} entries: {}",
            self.partial.entries.len(),
            self.source
        )
    }
}
