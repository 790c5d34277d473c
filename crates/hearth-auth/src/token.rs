use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::AuthError;
use crate::macaroon::constant_time_eq;

/// Fixed lifetime of a local access token, in seconds.
pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 3600;

/// Fixed lifetime of a local access token.
pub fn access_token_ttl() -> Duration {
    Duration::seconds(ACCESS_TOKEN_TTL_SECONDS)
}

const HMAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller a token stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub scope: hearth_domain::Role,
    pub user_id: String,
}

/// Mints and verifies local access tokens keyed off the device's 32-byte
/// root secret.
///
/// Token layout: `HMAC(secret, "scope:user:time") || "scope:user:time"`,
/// base64-encoded at the Privet layer.
pub struct AuthManager {
    secret: Vec<u8>,
    certificate_fingerprint: Vec<u8>,
}

impl AuthManager {
    /// A secret of the wrong size is replaced with a freshly generated one;
    /// callers should persist [`AuthManager::secret`] when that happens.
    pub fn new(secret: Vec<u8>, certificate_fingerprint: Vec<u8>) -> AuthManager {
        let secret = if secret.len() == HMAC_LEN {
            secret
        } else {
            let mut fresh = vec![0u8; HMAC_LEN];
            rand::thread_rng().fill_bytes(&mut fresh);
            fresh
        };
        AuthManager {
            secret,
            certificate_fingerprint,
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn certificate_fingerprint(&self) -> &[u8] {
        &self.certificate_fingerprint
    }

    pub fn set_certificate_fingerprint(&mut self, fingerprint: Vec<u8>) {
        self.certificate_fingerprint = fingerprint;
    }

    /// Returns `[hmac] scope:user:time` for the given user at `issued`.
    pub fn create_access_token(&self, user: &UserInfo, issued: DateTime<Utc>) -> Vec<u8> {
        let data = format!(
            "{}:{}:{}",
            user.scope.as_index(),
            user.user_id,
            issued.timestamp()
        );
        let mut token = hmac_sha256(&self.secret, data.as_bytes());
        token.extend_from_slice(data.as_bytes());
        token
    }

    /// Verify a raw token and split it back into the user and issue time.
    pub fn parse_access_token(&self, token: &[u8]) -> Result<(UserInfo, DateTime<Utc>), AuthError> {
        if token.len() <= HMAC_LEN {
            return Err(AuthError::InvalidToken);
        }
        let (mac, data) = token.split_at(HMAC_LEN);
        if !constant_time_eq(&hmac_sha256(&self.secret, data), mac) {
            return Err(AuthError::InvalidToken);
        }

        let data = std::str::from_utf8(data).map_err(|_| AuthError::InvalidToken)?;
        let mut parts = data.splitn(3, ':');
        let (Some(scope), Some(user_id), Some(timestamp)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidToken);
        };

        let scope = scope
            .parse::<u8>()
            .ok()
            .and_then(hearth_domain::Role::from_index)
            .ok_or(AuthError::InvalidToken)?;
        let timestamp = timestamp.parse::<i64>().map_err(|_| AuthError::InvalidToken)?;
        let issued = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or(AuthError::InvalidToken)?;

        Ok((
            UserInfo {
                scope,
                user_id: user_id.to_string(),
            },
            issued,
        ))
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::Role;

    fn manager() -> AuthManager {
        AuthManager::new(vec![5u8; 32], vec![0xfe; 32])
    }

    #[test]
    fn token_round_trips() {
        let manager = manager();
        let user = UserInfo {
            scope: Role::Owner,
            user_id: "2/7".to_string(),
        };
        let issued = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let token = manager.create_access_token(&user, issued);

        let (parsed, parsed_issued) = manager.parse_access_token(&token).unwrap();
        assert_eq!(parsed, user);
        assert_eq!(parsed_issued, issued);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let user = UserInfo {
            scope: Role::User,
            user_id: "1".to_string(),
        };
        let token = manager().create_access_token(&user, Utc::now());
        let other = AuthManager::new(vec![6u8; 32], vec![]);
        assert!(matches!(
            other.parse_access_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let user = UserInfo {
            scope: Role::User,
            user_id: "1".to_string(),
        };
        let mut token = manager().create_access_token(&user, Utc::now());
        let len = token.len();
        token[len - 1] ^= 0x01;
        assert!(manager().parse_access_token(&token).is_err());
    }

    #[test]
    fn short_tokens_are_rejected() {
        assert!(manager().parse_access_token(&[0u8; 32]).is_err());
        assert!(manager().parse_access_token(&[]).is_err());
    }

    #[test]
    fn undersized_secret_is_replaced() {
        let manager = AuthManager::new(vec![1, 2, 3], vec![]);
        assert_eq!(manager.secret().len(), 32);
        assert_ne!(manager.secret(), &[1, 2, 3]);
    }
}
