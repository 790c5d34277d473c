//! HMAC-chained capability tokens.
//!
//! A macaroon is a 16-byte MAC tag over an ordered caveat list:
//! `tag = HMAC(…HMAC(HMAC(root_key, c0), c1)…, cn)`, each HMAC also covering
//! a per-caveat-type context string. Extending appends a caveat and re-keys
//! with the previous tag, so holders can only ever narrow a token.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::cbor;
use crate::error::AuthError;

/// Truncated MAC tag length.
pub const MAC_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Caveat type codes. `SessionIdentifier` is reserved for binding a token
/// to the active pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaveatType {
    Stop,
    Scope,
    Identifier,
    Issued,
    Ttl,
    Expiration,
    SessionIdentifier,
}

impl CaveatType {
    pub fn code(&self) -> u32 {
        match self {
            CaveatType::Stop => 0,
            CaveatType::Scope => 1,
            CaveatType::Identifier => 2,
            CaveatType::Issued => 3,
            CaveatType::Ttl => 4,
            CaveatType::Expiration => 5,
            CaveatType::SessionIdentifier => 16,
        }
    }

    pub fn from_code(code: u32) -> Result<CaveatType, AuthError> {
        match code {
            0 => Ok(CaveatType::Stop),
            1 => Ok(CaveatType::Scope),
            2 => Ok(CaveatType::Identifier),
            3 => Ok(CaveatType::Issued),
            4 => Ok(CaveatType::Ttl),
            5 => Ok(CaveatType::Expiration),
            16 => Ok(CaveatType::SessionIdentifier),
            other => Err(AuthError::UnknownCaveatType(other)),
        }
    }

    fn takes_uint(&self) -> bool {
        matches!(
            self,
            CaveatType::Scope | CaveatType::Issued | CaveatType::Ttl | CaveatType::Expiration
        )
    }
}

/// A single encoded caveat: `uint(type) || encoded(value)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    bytes: Vec<u8>,
}

impl Caveat {
    pub fn stop() -> Caveat {
        Self::without_value(CaveatType::Stop)
    }

    pub fn session_identifier() -> Caveat {
        Self::without_value(CaveatType::SessionIdentifier)
    }

    pub fn scope(scope: u32) -> Caveat {
        Self::with_uint(CaveatType::Scope, scope)
    }

    pub fn issued(unix_time: u32) -> Caveat {
        Self::with_uint(CaveatType::Issued, unix_time)
    }

    pub fn ttl(seconds: u32) -> Caveat {
        Self::with_uint(CaveatType::Ttl, seconds)
    }

    pub fn expiration(unix_time: u32) -> Caveat {
        Self::with_uint(CaveatType::Expiration, unix_time)
    }

    pub fn identifier(id: &str) -> Caveat {
        let mut bytes = Vec::new();
        cbor::encode_uint(CaveatType::Identifier.code(), &mut bytes);
        cbor::encode_text_str(id, &mut bytes);
        Caveat { bytes }
    }

    fn without_value(caveat_type: CaveatType) -> Caveat {
        let mut bytes = Vec::new();
        cbor::encode_uint(caveat_type.code(), &mut bytes);
        Caveat { bytes }
    }

    fn with_uint(caveat_type: CaveatType, value: u32) -> Caveat {
        let mut bytes = Vec::new();
        cbor::encode_uint(caveat_type.code(), &mut bytes);
        cbor::encode_uint(value, &mut bytes);
        Caveat { bytes }
    }

    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Result<Caveat, AuthError> {
        let caveat = Caveat { bytes };
        caveat.caveat_type()?;
        Ok(caveat)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn caveat_type(&self) -> Result<CaveatType, AuthError> {
        let (code, _) = cbor::decode_uint(&self.bytes)?;
        CaveatType::from_code(code)
    }

    pub fn value_uint(&self) -> Result<u32, AuthError> {
        let caveat_type = self.caveat_type()?;
        if !caveat_type.takes_uint() {
            return Err(AuthError::CaveatValueType);
        }
        let offset = cbor::item_len(&self.bytes)?;
        let (value, _) = cbor::decode_uint(&self.bytes[offset..])?;
        Ok(value)
    }

    pub fn value_str(&self) -> Result<&str, AuthError> {
        if self.caveat_type()? != CaveatType::Identifier {
            return Err(AuthError::CaveatValueType);
        }
        let offset = cbor::item_len(&self.bytes)?;
        let (text, _) = cbor::decode_text_str(&self.bytes[offset..])?;
        Ok(text)
    }

    /// One link of the HMAC chain: tag over the caveat bytes plus the
    /// per-type context string.
    fn sign(&self, key: &[u8]) -> Result<[u8; MAC_LEN], AuthError> {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::BadTagLength)?;
        mac.update(&self.bytes);
        let context = caveat_context(self.caveat_type()?);
        if !context.is_empty() {
            mac.update(context);
        }
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(&digest[..MAC_LEN]);
        Ok(tag)
    }
}

/// Context string mixed into the MAC per caveat type. Empty for every type
/// today; the session-identifier slot will carry the active pairing session
/// once tokens are bound to it.
fn caveat_context(_caveat_type: CaveatType) -> &'static [u8] {
    &[]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    tag: [u8; MAC_LEN],
    caveats: Vec<Caveat>,
}

impl Macaroon {
    /// Mint a macaroon from the root key. The caveat list must not be
    /// empty.
    pub fn from_root_key(root_key: &[u8], caveats: Vec<Caveat>) -> Result<Macaroon, AuthError> {
        let tag = chain_tag(root_key, &caveats)?;
        Ok(Macaroon { tag, caveats })
    }

    /// Append `caveat`, re-keying the chain with the previous tag.
    pub fn extend(&self, caveat: Caveat) -> Result<Macaroon, AuthError> {
        let tag = caveat.sign(&self.tag)?;
        let mut caveats = self.caveats.clone();
        caveats.push(caveat);
        Ok(Macaroon { tag, caveats })
    }

    /// Recompute the chain from `root_key` and compare tags in constant
    /// time.
    pub fn verify(&self, root_key: &[u8]) -> bool {
        let Ok(expected) = chain_tag(root_key, &self.caveats) else {
            return false;
        };
        constant_time_eq(&expected, &self.tag)
    }

    pub fn tag(&self) -> &[u8; MAC_LEN] {
        &self.tag
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    /// Wire form: CBOR array `[tag, [caveat, …]]`, each caveat a byte
    /// string.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        cbor::encode_array_header(2, &mut out);
        cbor::encode_byte_str(&self.tag, &mut out);
        cbor::encode_array_header(self.caveats.len() as u32, &mut out);
        for caveat in &self.caveats {
            cbor::encode_byte_str(caveat.as_bytes(), &mut out);
        }
        out
    }

    pub fn parse(input: &[u8]) -> Result<Macaroon, AuthError> {
        let mut offset = 0;
        let (outer, n) = cbor::decode_array_header(&input[offset..])?;
        offset += n;
        if outer != 2 {
            return Err(AuthError::UnsupportedItem);
        }

        let (tag_bytes, n) = cbor::decode_byte_str(&input[offset..])?;
        offset += n;
        let tag: [u8; MAC_LEN] = tag_bytes.try_into().map_err(|_| AuthError::BadTagLength)?;

        let (count, n) = cbor::decode_array_header(&input[offset..])?;
        offset += n;
        let mut caveats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (bytes, n) = cbor::decode_byte_str(&input[offset..])?;
            offset += n;
            caveats.push(Caveat::from_bytes(bytes.to_vec())?);
        }
        if caveats.is_empty() {
            return Err(AuthError::EmptyCaveats);
        }
        Ok(Macaroon { tag, caveats })
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

fn chain_tag(root_key: &[u8], caveats: &[Caveat]) -> Result<[u8; MAC_LEN], AuthError> {
    let first = caveats.first().ok_or(AuthError::EmptyCaveats)?;
    if root_key.is_empty() {
        return Err(AuthError::BadTagLength);
    }
    let mut tag = first.sign(root_key)?;
    for caveat in &caveats[1..] {
        tag = caveat.sign(&tag)?;
    }
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = &[11u8; 32];

    fn token() -> Macaroon {
        Macaroon::from_root_key(
            KEY,
            vec![Caveat::scope(2), Caveat::identifier("user-7"), Caveat::issued(1_000)],
        )
        .unwrap()
    }

    #[test]
    fn verifies_with_the_right_key_only() {
        let m = token();
        assert!(m.verify(KEY));
        assert!(!m.verify(&[12u8; 32]));
        assert!(!m.verify(&[]));
    }

    #[test]
    fn empty_caveat_list_is_rejected() {
        assert!(matches!(
            Macaroon::from_root_key(KEY, vec![]),
            Err(AuthError::EmptyCaveats)
        ));
    }

    #[test]
    fn extend_preserves_verifiability() {
        let m = token();
        let extended = m.extend(Caveat::ttl(60)).unwrap();
        assert!(extended.verify(KEY));
        assert_eq!(extended.caveats().len(), m.caveats().len() + 1);

        // The extension chain is append-only: the tag of the extended token
        // is the previous tag re-keyed, so an equivalent token built from
        // the full list matches.
        let rebuilt = Macaroon::from_root_key(
            KEY,
            vec![
                Caveat::scope(2),
                Caveat::identifier("user-7"),
                Caveat::issued(1_000),
                Caveat::ttl(60),
            ],
        )
        .unwrap();
        assert_eq!(extended.tag(), rebuilt.tag());
    }

    #[test]
    fn tampered_caveat_fails_verification() {
        let m = token();
        let mut wire = m.serialize();
        let len = wire.len();
        wire[len - 1] ^= 0x01;
        let parsed = Macaroon::parse(&wire).unwrap();
        assert!(!parsed.verify(KEY));
    }

    #[test]
    fn wire_round_trip() {
        let m = token();
        let parsed = Macaroon::parse(&m.serialize()).unwrap();
        assert_eq!(parsed, m);
        assert!(parsed.verify(KEY));
    }

    #[test]
    fn caveat_values_decode() {
        assert_eq!(Caveat::scope(3).value_uint().unwrap(), 3);
        assert_eq!(Caveat::identifier("abc").value_str().unwrap(), "abc");
        assert_eq!(
            Caveat::stop().caveat_type().unwrap(),
            CaveatType::Stop
        );
        assert!(Caveat::stop().value_uint().is_err());
        assert!(Caveat::scope(1).value_str().is_err());
    }

    #[test]
    fn session_identifier_type_code_is_reserved_slot() {
        assert_eq!(Caveat::session_identifier().caveat_type().unwrap().code(), 16);
    }
}
