use std::fmt;

/// Reasons a flow summary line could not be turned into a record.
///
/// The parser never builds a partial record, whether a bad line is skipped
/// or aborts the run is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Malformed(String),
    Endpoint(String),
    Address(String),
    OctetOutOfRange(String),
    Number(String),
    Overflow(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(m) => write!(f, "malformed flow line: {m}"),
            Self::Endpoint(e) => write!(f, "invalid endpoint: {e}"),
            Self::Address(a) => write!(f, "invalid ipv4 address: {a}"),
            Self::OctetOutOfRange(a) => write!(f, "octet out of range in address: {a}"),
            Self::Number(n) => write!(f, "invalid numeric field: {n}"),
            Self::Overflow(n) => write!(f, "numeric field overflows: {n}"),
        }
    }
}

impl std::error::Error for ParseError {}
