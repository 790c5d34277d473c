use base64::prelude::*;
use chrono::Utc;
use hearth_auth::UserInfo;
use hearth_config::{Config, PairingType};
use hearth_domain::{DeviceModel, Origin, Role};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::PrivetError;
use crate::security::{AuthType, CryptoType, SecurityManager};
use crate::wifi::{WifiBootstrapManager, WifiSetupState};

/// What the local handler needs to know about the cloud engine. Implemented
/// by the registration/sync engine; kept as a trait so the local surface
/// works on cloud-less devices too.
pub trait CloudDelegate: Send + Sync {
    fn cloud_id(&self) -> String;

    /// Status string for the `gcd` sections: `unconfigured`, `connecting`,
    /// `online`, `invalidCredentials` or `offline`.
    fn connection_status(&self) -> String;

    fn register(&self, ticket_id: &str, done: Box<dyn FnOnce(Result<(), String>) + Send>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GcdSetupState {
    Idle,
    InProgress,
    Success,
    Error(String),
}

/// Maps the Privet v3 endpoints onto the device model, the security
/// manager, Wi-Fi bootstrapping and the cloud delegate.
pub struct PrivetHandler {
    model: Arc<DeviceModel>,
    config: Arc<Config>,
    security: Arc<SecurityManager>,
    wifi: Option<Arc<WifiBootstrapManager>>,
    cloud: Option<Arc<dyn CloudDelegate>>,
    http_port: AtomicU16,
    https_port: AtomicU16,
    gcd_setup: Mutex<GcdSetupState>,
    started_at: chrono::DateTime<Utc>,
}

impl PrivetHandler {
    pub fn new(
        model: Arc<DeviceModel>,
        config: Arc<Config>,
        security: Arc<SecurityManager>,
        wifi: Option<Arc<WifiBootstrapManager>>,
        cloud: Option<Arc<dyn CloudDelegate>>,
    ) -> Arc<PrivetHandler> {
        Arc::new(PrivetHandler {
            model,
            config,
            security,
            wifi,
            cloud,
            http_port: AtomicU16::new(0),
            https_port: AtomicU16::new(0),
            gcd_setup: Mutex::new(GcdSetupState::Idle),
            started_at: Utc::now(),
        })
    }

    pub fn set_ports(&self, http: u16, https: u16) {
        self.http_port.store(http, Ordering::SeqCst);
        self.https_port.store(https, Ordering::SeqCst);
    }

    /// Dispatch one request. Returns `(http_status, body)`.
    pub fn handle(self: &Arc<Self>, path: &str, auth_header: &str, input: &Value) -> (u16, Value) {
        debug!(path, "privet request");
        match self.dispatch(path, auth_header, input) {
            Ok(body) => (200, body),
            Err(e) => (
                e.http_status(),
                json!({"error": {"code": e.code(), "message": e.to_string()}}),
            ),
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        path: &str,
        auth_header: &str,
        input: &Value,
    ) -> Result<Value, PrivetError> {
        match path {
            "/privet/info" => return Ok(self.info()),
            "/privet/v3/auth" => return self.auth(input),
            "/privet/v3/pairing/start" => return self.pairing_start(input),
            "/privet/v3/pairing/confirm" => return self.pairing_confirm(input),
            "/privet/v3/pairing/cancel" => return self.pairing_cancel(input),
            _ => {}
        }

        let user = self.authenticate(auth_header)?;
        match path {
            "/privet/v3/state" => self.require(&user, Role::Viewer).map(|_| {
                let state = self.model.state_json();
                json!({"state": state, "fingerprint": fingerprint(&state)})
            }),
            "/privet/v3/commandDefs" => self.require(&user, Role::Viewer).map(|_| {
                let defs = self.model.traits_json();
                json!({"commandDefs": defs, "fingerprint": fingerprint(&defs)})
            }),
            "/privet/v3/checkForUpdates" => self.require(&user, Role::Viewer).map(|_| {
                json!({
                    "stateFingerprint": fingerprint(&self.model.state_json()),
                    "commandDefsFingerprint": fingerprint(&self.model.traits_json()),
                })
            }),
            "/privet/v3/setup/start" => {
                self.require(&user, Role::Owner)?;
                self.setup_start(input)
            }
            "/privet/v3/setup/status" => {
                self.require(&user, Role::Viewer)?;
                Ok(self.setup_status())
            }
            "/privet/v3/commands/execute" => self.commands_execute(input, &user),
            "/privet/v3/commands/status" => {
                self.require(&user, Role::Viewer)?;
                self.commands_status(input)
            }
            "/privet/v3/commands/cancel" => {
                self.require(&user, Role::User)?;
                self.commands_cancel(input)
            }
            "/privet/v3/commands/list" => {
                self.require(&user, Role::Viewer)?;
                Ok(self.commands_list())
            }
            _ => Err(PrivetError::NotFound),
        }
    }

    // ── Auth plumbing ─────────────────────────────────────────────────────

    fn authenticate(&self, auth_header: &str) -> Result<UserInfo, PrivetError> {
        let header = if auth_header.is_empty() && self.config.settings().disable_security {
            "Privet anonymous"
        } else {
            auth_header
        };
        let token = header.strip_prefix("Privet ").ok_or_else(|| {
            PrivetError::InvalidAuthorization("missing Privet authorization".to_string())
        })?;
        if token == "anonymous" {
            return Ok(UserInfo {
                scope: self.config.settings().local_anonymous_access_role,
                user_id: String::new(),
            });
        }
        self.security.parse_access_token(token)
    }

    fn require(&self, user: &UserInfo, minimum: Role) -> Result<(), PrivetError> {
        if user.scope < minimum {
            return Err(PrivetError::AccessDenied);
        }
        Ok(())
    }

    // ── Endpoints ─────────────────────────────────────────────────────────

    fn info(&self) -> Value {
        let settings = self.config.settings();
        let mut out = json!({
            "version": "3.0",
            "id": settings.device_id,
            "name": settings.name,
            "modelManifestId": settings.model_id,
            "uptime": (Utc::now() - self.started_at).num_seconds(),
            "api": [
                "/privet/info",
                "/privet/v3/auth",
                "/privet/v3/pairing/start",
                "/privet/v3/pairing/confirm",
                "/privet/v3/pairing/cancel",
                "/privet/v3/setup/start",
                "/privet/v3/setup/status",
                "/privet/v3/state",
                "/privet/v3/commandDefs",
                "/privet/v3/checkForUpdates",
                "/privet/v3/commands/execute",
                "/privet/v3/commands/status",
                "/privet/v3/commands/cancel",
                "/privet/v3/commands/list",
            ],
            "authentication": {
                "mode": ["anonymous", "pairing"],
                "pairing": self
                    .security
                    .pairing_types()
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>(),
                "crypto": self
                    .security
                    .crypto_types()
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>(),
                "anonymousMaxScope": settings.local_anonymous_access_role.as_str(),
            },
            "endpoints": {
                "httpPort": self.http_port.load(Ordering::SeqCst),
                "httpsPort": self.https_port.load(Ordering::SeqCst),
            },
            "gcd": {
                "id": self.cloud.as_ref().map(|c| c.cloud_id()).unwrap_or_default(),
                "status": self
                    .cloud
                    .as_ref()
                    .map(|c| c.connection_status())
                    .unwrap_or_else(|| "disabled".to_string()),
            },
        });
        if !settings.description.is_empty() {
            out["description"] = json!(settings.description);
        }
        if !settings.location.is_empty() {
            out["location"] = json!(settings.location);
        }
        if let Some(wifi) = &self.wifi {
            out["wifi"] = json!({
                "ssid": wifi.connected_ssid(),
                "hostedSsid": wifi.hosted_ssid(),
                "status": wifi.setup_state().as_status_str(),
            });
        }
        out
    }

    fn auth(&self, input: &Value) -> Result<Value, PrivetError> {
        let mode = input.get("mode").and_then(Value::as_str).unwrap_or_default();
        let auth_type = match mode {
            "anonymous" => AuthType::Anonymous,
            "pairing" => AuthType::Pairing,
            _ => return Err(PrivetError::InvalidAuthMode),
        };
        let auth_code = input
            .get("authCode")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let requested = input
            .get("requestedScope")
            .and_then(Value::as_str)
            .unwrap_or("auto");
        let desired = match requested {
            "auto" => Role::Owner,
            other => Role::from_str(other).map_err(|_| {
                PrivetError::InvalidParams(format!("unknown requestedScope '{other}'"))
            })?,
        };

        let (token, granted, ttl) = self
            .security
            .create_access_token(auth_type, auth_code, desired)?;
        // An explicit request for more than was granted is a refusal, not a
        // silent downgrade.
        if requested != "auto" && granted < desired {
            return Err(PrivetError::AccessDenied);
        }
        Ok(json!({
            "accessToken": token,
            "tokenType": "Privet",
            "scope": granted.as_str(),
            "expiresIn": ttl,
        }))
    }

    fn pairing_start(self: &Arc<Self>, input: &Value) -> Result<Value, PrivetError> {
        if !self.config.settings().local_pairing_enabled {
            return Err(PrivetError::SetupUnavailable);
        }
        let mode = match input.get("pairing").and_then(Value::as_str) {
            Some("pinCode") => PairingType::PinCode,
            Some("embeddedCode") => PairingType::EmbeddedCode,
            other => {
                return Err(PrivetError::InvalidParams(format!(
                    "unknown pairing mode {other:?}"
                )))
            }
        };
        let crypto = match input.get("crypto").and_then(Value::as_str) {
            Some("spake2-p224") => CryptoType::Spake2P224,
            Some("none") => CryptoType::None,
            other => {
                return Err(PrivetError::InvalidParams(format!(
                    "unknown crypto {other:?}"
                )))
            }
        };
        let (session_id, device_commitment) = self.security.start_pairing(mode, crypto)?;
        Ok(json!({
            "sessionId": session_id,
            "deviceCommitment": device_commitment,
        }))
    }

    fn pairing_confirm(self: &Arc<Self>, input: &Value) -> Result<Value, PrivetError> {
        let session_id = require_str(input, "sessionId")?;
        let client_commitment = require_str(input, "clientCommitment")?;
        let (fingerprint, signature) = self
            .security
            .confirm_pairing(session_id, client_commitment)?;
        Ok(json!({
            "certFingerprint": fingerprint,
            "certSignature": signature,
        }))
    }

    fn pairing_cancel(&self, input: &Value) -> Result<Value, PrivetError> {
        let session_id = require_str(input, "sessionId")?;
        self.security.cancel_pairing(session_id)?;
        Ok(json!({}))
    }

    fn setup_start(self: &Arc<Self>, input: &Value) -> Result<Value, PrivetError> {
        if let Some(wifi_input) = input.get("wifi") {
            let wifi = self.wifi.as_ref().ok_or(PrivetError::SetupUnavailable)?;
            let ssid = require_str(wifi_input, "ssid")?;
            let passphrase = wifi_input
                .get("passphrase")
                .and_then(Value::as_str)
                .unwrap_or_default();
            wifi.configure_credentials(ssid, passphrase);
        }

        if let Some(gcd_input) = input.get("gcd") {
            let cloud = self.cloud.as_ref().ok_or(PrivetError::SetupUnavailable)?;
            let ticket_id = require_str(gcd_input, "ticketId")?;
            *self.lock_gcd() = GcdSetupState::InProgress;
            let this = Arc::downgrade(self);
            cloud.register(
                ticket_id,
                Box::new(move |result| {
                    if let Some(handler) = this.upgrade() {
                        *handler.lock_gcd() = match result {
                            Ok(()) => GcdSetupState::Success,
                            Err(message) => GcdSetupState::Error(message),
                        };
                    }
                }),
            );
        }

        Ok(self.setup_status())
    }

    fn setup_status(&self) -> Value {
        let mut out = Map::new();
        if let Some(wifi) = &self.wifi {
            let mut section = json!({"status": wifi.setup_state().as_status_str()});
            match wifi.setup_state() {
                WifiSetupState::Success => {
                    section["ssid"] = json!(self.config.settings().last_configured_ssid);
                }
                WifiSetupState::Error(message) => {
                    section["error"] = json!({"code": "invalidState", "message": message});
                }
                _ => {}
            }
            out.insert("wifi".to_string(), section);
        }
        let gcd = self.lock_gcd().clone();
        let mut section = json!({"status": match &gcd {
            GcdSetupState::Idle => "idle",
            GcdSetupState::InProgress => "inProgress",
            GcdSetupState::Success => "success",
            GcdSetupState::Error(_) => "error",
        }});
        if let GcdSetupState::Success = gcd {
            section["id"] = json!(self.config.settings().cloud_id);
        }
        if let GcdSetupState::Error(message) = &gcd {
            section["error"] = json!({"code": "invalidState", "message": message});
        }
        out.insert("gcd".to_string(), section);
        Value::Object(out)
    }

    fn commands_execute(&self, input: &Value, user: &UserInfo) -> Result<Value, PrivetError> {
        let id = self.model.add_command(input, Origin::Local, user.scope)?;
        let command = self
            .model
            .find_command(&id)
            .ok_or(PrivetError::Domain(hearth_domain::DomainError::CommandDestroyed))?;
        Ok(command.to_json())
    }

    fn commands_status(&self, input: &Value) -> Result<Value, PrivetError> {
        let id = require_str(input, "id")?;
        let command = self
            .model
            .find_command(id)
            .ok_or_else(|| PrivetError::InvalidParams(format!("unknown command '{id}'")))?;
        Ok(command.to_json())
    }

    fn commands_cancel(&self, input: &Value) -> Result<Value, PrivetError> {
        let id = require_str(input, "id")?;
        let command = self
            .model
            .find_command(id)
            .ok_or_else(|| PrivetError::InvalidParams(format!("unknown command '{id}'")))?;
        command.cancel().map_err(PrivetError::Domain)?;
        Ok(command.to_json())
    }

    fn commands_list(&self) -> Value {
        let commands: Vec<Value> = self.model.commands().iter().map(|c| c.to_json()).collect();
        json!({"commands": commands})
    }

    fn lock_gcd(&self) -> std::sync::MutexGuard<'_, GcdSetupState> {
        self.gcd_setup.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn require_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, PrivetError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PrivetError::InvalidParams(format!("missing '{key}'")))
}

fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    BASE64_STANDARD_NO_PAD.encode(hasher.finalize())
}
