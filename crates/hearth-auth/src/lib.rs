//! Capability tokens and local access control: the CBOR-subset codec,
//! HMAC-chained macaroons, access-token minting and the bounded revocation
//! store.

pub mod cbor;
mod error;
mod macaroon;
mod revocation;
mod token;

pub use error::AuthError;
pub use macaroon::{Caveat, CaveatType, Macaroon, MAC_LEN};
pub use revocation::{
    from_j2000, to_j2000, AccessRevocationManager, RevocationEntry, DEFAULT_CAPACITY,
};
pub use token::{
    access_token_ttl, hmac_sha256, AuthManager, UserInfo, ACCESS_TOKEN_TTL_SECONDS,
};
