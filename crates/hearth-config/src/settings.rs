use hearth_domain::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a local client may pair with the device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PairingType {
    /// Device shows a freshly generated 4-digit code.
    PinCode,
    /// Device ships with a static code printed on it.
    EmbeddedCode,
}

impl PairingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingType::PinCode => "pinCode",
            PairingType::EmbeddedCode => "embeddedCode",
        }
    }
}

impl std::fmt::Display for PairingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device's persistent configuration.
///
/// Factory constants (model identity, OAuth client, pairing modes) come from
/// the host's `load_defaults`; the remaining fields are written back to the
/// config store as the device is provisioned.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    // Identity.
    pub name: String,
    pub description: String,
    pub location: String,
    pub firmware_version: String,
    pub oem_name: String,
    pub model_name: String,
    /// Five-character model manifest id.
    pub model_id: String,
    pub serial_number: String,
    /// Local hardware id, generated on first start when empty.
    pub device_id: String,

    // Cloud.
    pub cloud_id: String,
    pub refresh_token: String,
    pub robot_account: String,
    pub oauth_url: String,
    pub service_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,

    // Local access.
    pub embedded_code: String,
    pub pairing_modes: BTreeSet<PairingType>,
    pub local_anonymous_access_role: Role,
    pub local_access_enabled: bool,
    pub local_discovery_enabled: bool,
    pub local_pairing_enabled: bool,
    /// 32-byte root secret for access tokens; generated when empty.
    pub secret: Vec<u8>,

    // Wi-Fi.
    pub wifi_auto_setup_enabled: bool,
    pub last_configured_ssid: String,

    /// Development escape hatch: permits the identity key exchanger and
    /// anonymous Privet requests without an Authorization header.
    pub disable_security: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: String::new(),
            description: String::new(),
            location: String::new(),
            firmware_version: String::new(),
            oem_name: String::new(),
            model_name: String::new(),
            model_id: String::new(),
            serial_number: String::new(),
            device_id: String::new(),
            cloud_id: String::new(),
            refresh_token: String::new(),
            robot_account: String::new(),
            oauth_url: "https://accounts.google.com/o/oauth2/".to_string(),
            service_url: "https://www.googleapis.com/clouddevices/v1/".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            api_key: String::new(),
            embedded_code: String::new(),
            pairing_modes: BTreeSet::from([PairingType::PinCode]),
            local_anonymous_access_role: Role::Viewer,
            local_access_enabled: true,
            local_discovery_enabled: true,
            local_pairing_enabled: true,
            secret: Vec::new(),
            wifi_auto_setup_enabled: true,
            last_configured_ssid: String::new(),
            disable_security: false,
        }
    }
}

/// The subset of [`Settings`] written back to the config store. Everything
/// absent from the blob keeps its default (or host-provided) value on load.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct PersistedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_anonymous_access_role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_access_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_discovery_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_pairing_enabled: Option<bool>,
    /// Base64 of the 32-byte root secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_configured_ssid: Option<String>,
}
