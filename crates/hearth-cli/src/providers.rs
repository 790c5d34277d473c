use async_trait::async_trait;
use hearth_provider::{ConnectionState, DnsServiceDiscovery, Network, ProviderError, TlsStream};
use std::sync::Mutex;
use tracing::info;

/// Network provider for hosts with a fixed wired connection. Always online,
/// never changes, no raw TLS sockets (the engine falls back to polling).
pub struct StaticNetwork;

#[async_trait]
impl Network for StaticNetwork {
    fn add_connection_changed_callback(&self, _callback: Box<dyn Fn() + Send + Sync>) {}

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn open_ssl_socket(
        &self,
        _host: &str,
        _port: u16,
    ) -> Result<Box<dyn TlsStream>, ProviderError> {
        Err(ProviderError::NotSupported("raw tls sockets"))
    }
}

/// DNS-SD provider that logs what a real responder would publish. Useful
/// for demos on machines without an mDNS daemon.
pub struct LoggingDnsSd {
    id: String,
    published: Mutex<bool>,
}

impl LoggingDnsSd {
    pub fn new() -> Self {
        LoggingDnsSd {
            id: uuid::Uuid::new_v4().to_string(),
            published: Mutex::new(false),
        }
    }
}

impl Default for LoggingDnsSd {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsServiceDiscovery for LoggingDnsSd {
    fn publish_service(&self, service_type: &str, port: u16, txt_records: &[String]) {
        *self.published.lock().unwrap_or_else(|e| e.into_inner()) = true;
        info!(service_type, port, txt = ?txt_records, "would advertise service");
    }

    fn stop_publishing(&self, service_type: &str) {
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        if *published {
            *published = false;
            info!(service_type, "would withdraw service");
        }
    }

    fn id(&self) -> String {
        self.id.clone()
    }
}
