use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use hearth_auth::{access_token_ttl, hmac_sha256, AuthManager, UserInfo};
use hearth_config::{Config, PairingType};
use hearth_domain::{ObserverList, Role, Subscription};
use hearth_provider::{TaskRunner, TaskRunnerExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

use crate::error::PrivetError;
use crate::exchange::{InsecureExchanger, KeyExchanger, Spake2Exchanger};

const SESSION_EXPIRATION: std::time::Duration = std::time::Duration::from_secs(5 * 60);
const MAX_PAIRING_ATTEMPTS: u32 = 3;
const PAIRING_BLOCK_SECONDS: i64 = 60;

/// How a local client authenticates to `/privet/v3/auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Anonymous,
    Pairing,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Anonymous => "anonymous",
            AuthType::Pairing => "pairing",
        }
    }

    fn index(&self) -> u8 {
        match self {
            AuthType::Anonymous => 0,
            AuthType::Pairing => 1,
        }
    }
}

/// Key-agreement algorithm for a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoType {
    Spake2P224,
    /// Identity exchange; only valid when security is disabled.
    None,
}

impl CryptoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoType::Spake2P224 => "spake2-p224",
            CryptoType::None => "none",
        }
    }
}

/// Payload of the pairing-started callback, so the host can display the
/// code.
#[derive(Clone)]
pub struct PairingStart {
    pub session_id: String,
    pub mode: PairingType,
    pub code: String,
}

struct SecurityInner {
    pending: HashMap<String, Box<dyn KeyExchanger>>,
    confirmed: HashMap<String, Vec<u8>>,
    pairing_attempts: u32,
    block_pairing_until: Option<DateTime<Utc>>,
    last_user_id: u64,
}

/// Pairing sessions, brute-force throttling, and the pairing → access-token
/// exchange.
pub struct SecurityManager {
    auth: Mutex<AuthManager>,
    config: Arc<Config>,
    task_runner: Arc<dyn TaskRunner>,
    inner: Mutex<SecurityInner>,
    on_pairing_start: ObserverList<PairingStart>,
    on_pairing_end: ObserverList<String>,
}

impl SecurityManager {
    pub fn new(config: Arc<Config>, task_runner: Arc<dyn TaskRunner>) -> Arc<SecurityManager> {
        let settings = config.settings();
        let auth = AuthManager::new(settings.secret.clone(), Vec::new());
        if settings.secret != auth.secret() {
            // First start: persist the generated root secret.
            let mut tx = config.edit();
            tx.set_secret(auth.secret().to_vec());
            tx.commit();
        }

        Arc::new(SecurityManager {
            auth: Mutex::new(auth),
            config,
            task_runner,
            inner: Mutex::new(SecurityInner {
                pending: HashMap::new(),
                confirmed: HashMap::new(),
                pairing_attempts: 0,
                block_pairing_until: None,
                last_user_id: 0,
            }),
            on_pairing_start: ObserverList::new(),
            on_pairing_end: ObserverList::new(),
        })
    }

    pub fn set_certificate_fingerprint(&self, fingerprint: Vec<u8>) {
        self.auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_certificate_fingerprint(fingerprint);
    }

    pub fn pairing_types(&self) -> Vec<PairingType> {
        self.config.settings().pairing_modes.into_iter().collect()
    }

    pub fn crypto_types(&self) -> Vec<CryptoType> {
        let mut out = vec![CryptoType::Spake2P224];
        if self.config.settings().disable_security {
            out.push(CryptoType::None);
        }
        out
    }

    pub fn on_pairing_start(
        &self,
        callback: impl Fn(&PairingStart) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_pairing_start.add(callback)
    }

    pub fn on_pairing_end(
        &self,
        callback: impl Fn(&String) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_pairing_end.add(callback)
    }

    /// Open a pairing session: pick a code for `mode`, start a key
    /// exchange, and return `(session_id, base64 device commitment)`.
    pub fn start_pairing(
        self: &Arc<Self>,
        mode: PairingType,
        crypto: CryptoType,
    ) -> Result<(String, String), PrivetError> {
        self.check_pairing_allowed()?;

        let settings = self.config.settings();
        if !settings.pairing_modes.contains(&mode) {
            return Err(PrivetError::InvalidParams(format!(
                "pairing mode '{mode}' is not enabled"
            )));
        }

        let code = match mode {
            PairingType::EmbeddedCode => {
                if settings.embedded_code.is_empty() {
                    return Err(PrivetError::InvalidParams(
                        "no embedded code configured".to_string(),
                    ));
                }
                settings.embedded_code.clone()
            }
            PairingType::PinCode => format!("{:04}", rand::thread_rng().gen_range(0..10_000)),
        };

        let exchanger: Box<dyn KeyExchanger> = match crypto {
            CryptoType::Spake2P224 => Box::new(Spake2Exchanger::new(&code)),
            CryptoType::None if settings.disable_security => {
                Box::new(InsecureExchanger::new(&code))
            }
            CryptoType::None => {
                return Err(PrivetError::InvalidParams(
                    "unsupported crypto".to_string(),
                ))
            }
        };

        // Only a single pending session at a time.
        let stale: Vec<String> = {
            let inner = self.lock();
            inner.pending.keys().cloned().collect()
        };
        for session_id in stale {
            self.close_pending_session(&session_id);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let commitment = BASE64_STANDARD.encode(exchanger.message());
        self.lock().pending.insert(session_id.clone(), exchanger);

        let weak = Arc::downgrade(self);
        let expiring = session_id.clone();
        self.task_runner.post_after(SESSION_EXPIRATION, move || {
            if let Some(manager) = Weak::upgrade(&weak) {
                manager.close_pending_session(&expiring);
            }
        });

        info!(session = %session_id, %mode, "pairing session started");
        self.on_pairing_start.notify(&PairingStart {
            session_id: session_id.clone(),
            mode,
            code,
        });
        Ok((session_id, commitment))
    }

    /// Process the client commitment, promote the session to confirmed, and
    /// return the base64 HTTPS certificate fingerprint plus
    /// `HMAC(K, fingerprint)`.
    pub fn confirm_pairing(
        self: &Arc<Self>,
        session_id: &str,
        client_commitment: &str,
    ) -> Result<(String, String), PrivetError> {
        if !self.lock().pending.contains_key(session_id) {
            return Err(PrivetError::UnknownSession(session_id.to_string()));
        }

        let commitment = match BASE64_STANDARD.decode(client_commitment) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.close_pending_session(session_id);
                return Err(PrivetError::InvalidFormat(format!(
                    "invalid commitment string '{client_commitment}'"
                )));
            }
        };

        let key = {
            let mut inner = self.lock();
            let Some(exchanger) = inner.pending.get_mut(session_id) else {
                return Err(PrivetError::UnknownSession(session_id.to_string()));
            };
            match exchanger
                .process_message(&commitment)
                .and_then(|_| exchanger.key())
            {
                Ok(key) => key,
                Err(_) => {
                    drop(inner);
                    self.close_pending_session(session_id);
                    return Err(PrivetError::CommitmentMismatch);
                }
            }
        };

        let fingerprint = self
            .auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .certificate_fingerprint()
            .to_vec();
        let signature = hmac_sha256(&key, &fingerprint);

        {
            let mut inner = self.lock();
            inner.confirmed.insert(session_id.to_string(), key);
            inner.pairing_attempts = 0;
            inner.block_pairing_until = None;
        }

        let weak = Arc::downgrade(self);
        let expiring = session_id.to_string();
        self.task_runner.post_after(SESSION_EXPIRATION, move || {
            if let Some(manager) = Weak::upgrade(&weak) {
                manager.close_confirmed_session(&expiring);
            }
        });
        self.close_pending_session(session_id);

        Ok((
            BASE64_STANDARD.encode(&fingerprint),
            BASE64_STANDARD.encode(&signature),
        ))
    }

    /// Drop a session in either stage. Cancelling a pending session undoes
    /// its contribution to the brute-force throttle.
    pub fn cancel_pairing(&self, session_id: &str) -> Result<(), PrivetError> {
        let confirmed = self.close_confirmed_session(session_id);
        let pending = self.close_pending_session(session_id);
        if pending {
            let mut inner = self.lock();
            inner.pairing_attempts = inner.pairing_attempts.saturating_sub(1);
        }
        if confirmed || pending {
            Ok(())
        } else {
            Err(PrivetError::UnknownSession(session_id.to_string()))
        }
    }

    /// Exchange pairing or anonymous credentials for a local access token.
    /// Returns `(base64 token, granted scope, ttl seconds)`.
    pub fn create_access_token(
        &self,
        auth_type: AuthType,
        auth_code: &str,
        desired_scope: Role,
    ) -> Result<(String, Role, i64), PrivetError> {
        let granted = match auth_type {
            AuthType::Anonymous => {
                let cap = self.config.settings().local_anonymous_access_role;
                desired_scope.min(cap)
            }
            AuthType::Pairing => {
                if !self.is_valid_pairing_code(auth_code) {
                    return Err(PrivetError::InvalidAuthCode);
                }
                desired_scope
            }
        };

        let user_id = {
            let mut inner = self.lock();
            inner.last_user_id += 1;
            format!("{}/{}", auth_type.index(), inner.last_user_id)
        };

        let token = self
            .auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .create_access_token(
                &UserInfo {
                    scope: granted,
                    user_id,
                },
                Utc::now(),
            );
        Ok((
            BASE64_STANDARD.encode(token),
            granted,
            access_token_ttl().num_seconds(),
        ))
    }

    /// Verify a base64 access token, including its TTL.
    pub fn parse_access_token(&self, token: &str) -> Result<UserInfo, PrivetError> {
        let decoded = BASE64_STANDARD.decode(token).map_err(|_| {
            PrivetError::InvalidAuthorization(format!("invalid token encoding '{token}'"))
        })?;
        let (user, issued) = self
            .auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .parse_access_token(&decoded)
            .map_err(|_| {
                PrivetError::InvalidAuthorization("token failed verification".to_string())
            })?;
        if issued + access_token_ttl() < Utc::now() {
            return Err(PrivetError::AuthorizationExpired);
        }
        Ok(user)
    }

    fn is_valid_pairing_code(&self, auth_code: &str) -> bool {
        if self.config.settings().disable_security {
            return true;
        }
        let Ok(decoded) = BASE64_STANDARD.decode(auth_code) else {
            return false;
        };
        let mut inner = self.lock();
        let matched = inner
            .confirmed
            .iter()
            .any(|(id, key)| hmac_sha256(key, id.as_bytes()) == decoded);
        if matched {
            inner.pairing_attempts = 0;
            inner.block_pairing_until = None;
        } else {
            warn!("attempt to authenticate with an invalid pairing code");
        }
        matched
    }

    fn check_pairing_allowed(&self) -> Result<(), PrivetError> {
        if self.config.settings().disable_security {
            return Ok(());
        }
        let mut inner = self.lock();
        if inner
            .block_pairing_until
            .is_some_and(|until| until > Utc::now())
        {
            return Err(PrivetError::DeviceBusy);
        }
        inner.pairing_attempts += 1;
        if inner.pairing_attempts >= MAX_PAIRING_ATTEMPTS {
            info!("pairing blocked for one minute");
            inner.block_pairing_until = Some(Utc::now() + Duration::seconds(PAIRING_BLOCK_SECONDS));
        }
        Ok(())
    }

    fn close_pending_session(&self, session_id: &str) -> bool {
        let removed = self.lock().pending.remove(session_id).is_some();
        if removed {
            self.on_pairing_end.notify(&session_id.to_string());
        }
        removed
    }

    fn close_confirmed_session(&self, session_id: &str) -> bool {
        self.lock().confirmed.remove(session_id).is_some()
    }

    /// HMAC of the session id under the session key: what a paired client
    /// presents as `authCode`.
    #[cfg(test)]
    pub(crate) fn auth_code_for_session(&self, session_id: &str) -> Option<String> {
        let inner = self.lock();
        let key = inner.confirmed.get(session_id)?;
        Some(BASE64_STANDARD.encode(hmac_sha256(key, session_id.as_bytes())))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SecurityInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Spake2Exchanger;
    use std::time::Duration as StdDuration;

    struct ManualTaskRunner;

    impl TaskRunner for ManualTaskRunner {
        fn post_delayed(&self, _delay: StdDuration, _task: Box<dyn FnOnce() + Send>) {}
    }

    fn manager() -> Arc<SecurityManager> {
        let config = Arc::new(Config::new(None));
        config.load().unwrap();
        let mut tx = config.edit();
        tx.set_secret(vec![9u8; 32]);
        tx.commit();
        SecurityManager::new(config, Arc::new(ManualTaskRunner))
    }

    fn pair(manager: &Arc<SecurityManager>) -> (String, Vec<u8>) {
        // The host learns the code through the pairing-start callback; the
        // test client does the same.
        let code = Arc::new(Mutex::new(String::new()));
        let code2 = code.clone();
        let _sub = manager.on_pairing_start(move |start| {
            *code2.lock().unwrap() = start.code.clone();
        });

        let (session_id, device_commitment) = manager
            .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
            .unwrap();
        let code = code.lock().unwrap().clone();

        let mut client = Spake2Exchanger::new(&code);
        let client_commitment = BASE64_STANDARD.encode(client.message());
        let (fingerprint, signature) = manager
            .confirm_pairing(&session_id, &client_commitment)
            .unwrap();

        // Client verifies the certificate attestation.
        let device_msg = BASE64_STANDARD.decode(device_commitment).unwrap();
        client.process_message(&device_msg).unwrap();
        let key = client.key().unwrap();
        let fingerprint_bytes = BASE64_STANDARD.decode(fingerprint).unwrap();
        assert_eq!(
            BASE64_STANDARD.decode(signature).unwrap(),
            hmac_sha256(&key, &fingerprint_bytes)
        );

        (session_id, key)
    }

    #[test]
    fn pairing_round_trip_mints_owner_token() {
        let manager = manager();
        let (session_id, key) = pair(&manager);

        let auth_code = BASE64_STANDARD.encode(hmac_sha256(&key, session_id.as_bytes()));
        assert_eq!(
            manager.auth_code_for_session(&session_id).as_deref(),
            Some(auth_code.as_str())
        );

        let before = Utc::now();
        let (token, scope, ttl) = manager
            .create_access_token(AuthType::Pairing, &auth_code, Role::Owner)
            .unwrap();
        assert_eq!(scope, Role::Owner);
        assert_eq!(ttl, 3600);

        let user = manager.parse_access_token(&token).unwrap();
        assert_eq!(user.scope, Role::Owner);
        // Issued within a second of now.
        assert!(Utc::now() - before < Duration::seconds(2));
    }

    #[test]
    fn wrong_auth_code_is_rejected() {
        let manager = manager();
        let _ = pair(&manager);
        let err = manager
            .create_access_token(
                AuthType::Pairing,
                &BASE64_STANDARD.encode([0u8; 32]),
                Role::Owner,
            )
            .unwrap_err();
        assert!(matches!(err, PrivetError::InvalidAuthCode));
    }

    #[test]
    fn anonymous_scope_is_capped() {
        let manager = manager();
        // Default anonymous cap is viewer.
        let (_, granted, _) = manager
            .create_access_token(AuthType::Anonymous, "", Role::Owner)
            .unwrap();
        assert_eq!(granted, Role::Viewer);

        let (_, granted, _) = manager
            .create_access_token(AuthType::Anonymous, "", Role::None)
            .unwrap();
        assert_eq!(granted, Role::None);
    }

    #[test]
    fn three_failed_pairings_block_the_fourth() {
        let manager = manager();
        for _ in 0..3 {
            manager
                .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
                .unwrap();
        }
        let err = manager
            .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
            .unwrap_err();
        assert!(matches!(err, PrivetError::DeviceBusy));
    }

    #[test]
    fn successful_confirmation_resets_the_throttle() {
        let manager = manager();
        let _ = pair(&manager); // uses one attempt, then resets on confirm
        // A full budget of three attempts is available again.
        for _ in 0..3 {
            manager
                .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
                .unwrap();
        }
        assert!(matches!(
            manager
                .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
                .unwrap_err(),
            PrivetError::DeviceBusy
        ));
    }

    #[test]
    fn bad_commitment_closes_the_session() {
        let manager = manager();
        let (session_id, _) = manager
            .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
            .unwrap();
        let err = manager
            .confirm_pairing(&session_id, "!!!not-base64!!!")
            .unwrap_err();
        assert!(matches!(err, PrivetError::InvalidFormat(_)));
        assert!(matches!(
            manager.confirm_pairing(&session_id, "aaaa").unwrap_err(),
            PrivetError::UnknownSession(_)
        ));
    }

    #[test]
    fn cancel_pending_decrements_attempts() {
        let manager = manager();
        let (session_id, _) = manager
            .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
            .unwrap();
        manager.cancel_pairing(&session_id).unwrap();
        // Cancelling returned the attempt, so three more are possible.
        for _ in 0..2 {
            manager
                .start_pairing(PairingType::PinCode, CryptoType::Spake2P224)
                .unwrap();
        }
        assert!(matches!(
            manager.cancel_pairing("no-such-session"),
            Err(PrivetError::UnknownSession(_))
        ));
    }

    #[test]
    fn crypto_none_requires_disabled_security() {
        let manager = manager();
        let err = manager
            .start_pairing(PairingType::PinCode, CryptoType::None)
            .unwrap_err();
        assert!(matches!(err, PrivetError::InvalidParams(_)));
    }
}
