use hearth_config::Config;
use hearth_domain::DeviceModel;
use hearth_provider::DnsServiceDiscovery;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::ssid::DiscoveryFlags;

const PRIVET_SERVICE_TYPE: &str = "_privet._tcp";

/// Advertises the Privet endpoint over DNS-SD with the TXT record clients
/// use to discover and filter devices.
pub struct Publisher {
    dns_sd: Arc<dyn DnsServiceDiscovery>,
    config: Arc<Config>,
    model: Arc<DeviceModel>,
    http_port: AtomicU16,
    publishing: AtomicBool,
}

impl Publisher {
    pub fn new(
        dns_sd: Arc<dyn DnsServiceDiscovery>,
        config: Arc<Config>,
        model: Arc<DeviceModel>,
    ) -> Publisher {
        Publisher {
            dns_sd,
            config,
            model,
            http_port: AtomicU16::new(0),
            publishing: AtomicBool::new(false),
        }
    }

    pub fn set_http_port(&self, port: u16) {
        self.http_port.store(port, Ordering::SeqCst);
    }

    /// Re-publish the service to reflect current settings, or withdraw it
    /// when there is no HTTP endpoint or discovery is disabled.
    pub fn update(&self, flags: DiscoveryFlags) {
        let port = self.http_port.load(Ordering::SeqCst);
        let settings = self.config.settings();
        if port == 0 || !settings.local_discovery_enabled {
            self.remove();
            return;
        }

        let mut txt = vec![
            "txtvers=3".to_string(),
            format!("ty={}", settings.name),
            format!("services={}", self.service_list()),
            format!("id={}", self.dns_sd.id()),
            format!("mmid={}", settings.model_id),
            format!("flags={}", flags.encode()),
        ];
        if !settings.cloud_id.is_empty() {
            txt.push(format!("gcd_id={}", settings.cloud_id));
        }
        if !settings.description.is_empty() {
            txt.push(format!("note={}", settings.description));
        }

        debug!(port, "publishing privet service");
        self.publishing.store(true, Ordering::SeqCst);
        self.dns_sd.publish_service(PRIVET_SERVICE_TYPE, port, &txt);
    }

    pub fn remove(&self) {
        if self.publishing.swap(false, Ordering::SeqCst) {
            debug!("withdrawing privet service");
            self.dns_sd.stop_publishing(PRIVET_SERVICE_TYPE);
        }
    }

    /// Comma-separated trait list of the root components, each prefixed
    /// with an underscore.
    fn service_list(&self) -> String {
        let components = self.model.components_json();
        let mut services: Vec<String> = Vec::new();
        if let Value::Object(roots) = components {
            for component in roots.values() {
                for trait_name in component
                    .get("traits")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                {
                    let entry = format!("_{trait_name}");
                    if !services.contains(&entry) {
                        services.push(entry);
                    }
                }
            }
        }
        services.join(",")
    }
}
