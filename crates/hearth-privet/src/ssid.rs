use base64::prelude::*;

/// Discovery inputs encoded into the bootstrap SSID and the DNS-SD `flags`
/// TXT field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryFlags {
    /// The device still needs Wi-Fi credentials.
    pub needs_wifi: bool,
    /// The device is not registered with the cloud yet.
    pub needs_registration: bool,
}

impl DiscoveryFlags {
    /// Two-character base64 code carried by both surfaces.
    pub fn encode(&self) -> String {
        let byte = (self.needs_wifi as u8) | ((self.needs_registration as u8) << 1);
        BASE64_STANDARD_NO_PAD.encode([byte])
    }
}

/// Bootstrap access-point SSID: `{name}.{model_id}{flags}prv`, with the
/// device name truncated to keep the whole SSID within 32 octets.
pub fn generate_ssid(name: &str, model_id: &str, flags: DiscoveryFlags) -> String {
    const MAX_SSID: usize = 32;
    let suffix = format!(".{}{}prv", model_id, flags.encode());
    let budget = MAX_SSID.saturating_sub(suffix.len());
    let name: String = name.chars().take(budget).collect();
    format!("{name}{suffix}")
}
