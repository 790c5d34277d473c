use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("input truncated inside a CBOR item")]
    Truncated,

    #[error("unsupported CBOR item (only unsigned ints, strings and arrays are valid)")]
    UnsupportedItem,

    #[error("non-canonical CBOR length encoding")]
    NonCanonical,

    #[error("CBOR text string is not valid UTF-8")]
    InvalidUtf8,

    #[error("value does not fit the 32-bit unsigned range")]
    IntOutOfRange,

    #[error("macaroon must carry at least one caveat")]
    EmptyCaveats,

    #[error("caveat type {0} is not recognized")]
    UnknownCaveatType(u32),

    #[error("caveat value has the wrong type")]
    CaveatValueType,

    #[error("macaroon tag has the wrong length")]
    BadTagLength,

    #[error("invalid token encoding")]
    InvalidTokenEncoding,

    #[error("access token failed verification")]
    InvalidToken,

    #[error("access token has expired")]
    TokenExpired,

    #[error("revocation entry is already expired")]
    EntryExpired,

    #[error("stored revocation list is malformed: {0}")]
    BadRevocationList(String),
}
