use hearth_config::Config;
use hearth_domain::DeviceModel;
use hearth_provider::{
    DnsServiceDiscovery, HttpServer, IncomingRequest, Network, RequestReply, TaskRunner, Wifi,
};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::info;

use crate::handler::{CloudDelegate, PrivetHandler};
use crate::publisher::Publisher;
use crate::security::SecurityManager;
use crate::ssid::DiscoveryFlags;
use crate::wifi::WifiBootstrapManager;

/// Wires the local surface together: security manager, Wi-Fi bootstrap,
/// DNS-SD advertisement and the `/privet/` HTTP routes.
pub struct PrivetManager {
    config: Arc<Config>,
    security: Arc<SecurityManager>,
    handler: Arc<PrivetHandler>,
    publisher: Option<Arc<Publisher>>,
    wifi_bootstrap: Option<Arc<WifiBootstrapManager>>,
}

impl PrivetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        model: Arc<DeviceModel>,
        config: Arc<Config>,
        task_runner: Arc<dyn TaskRunner>,
        network: Arc<dyn Network>,
        http_server: Arc<dyn HttpServer>,
        dns_sd: Option<Arc<dyn DnsServiceDiscovery>>,
        wifi: Option<Arc<dyn Wifi>>,
        cloud: Option<Arc<dyn CloudDelegate>>,
    ) -> Arc<PrivetManager> {
        let security = SecurityManager::new(config.clone(), task_runner.clone());
        security.set_certificate_fingerprint(http_server.certificate_fingerprint());

        let wifi_bootstrap = wifi.and_then(|wifi| {
            if !config.settings().wifi_auto_setup_enabled {
                return None;
            }
            info!("enabling wi-fi bootstrapping");
            let manager = WifiBootstrapManager::new(
                config.clone(),
                task_runner.clone(),
                network.clone(),
                wifi,
            );
            manager.start();
            Some(manager)
        });

        let handler = PrivetHandler::new(
            model.clone(),
            config.clone(),
            security.clone(),
            wifi_bootstrap.clone(),
            cloud,
        );
        handler.set_ports(http_server.http_port(), http_server.https_port());

        let publisher = dns_sd.map(|dns_sd| {
            let publisher = Arc::new(Publisher::new(dns_sd, config.clone(), model.clone()));
            publisher.set_http_port(http_server.http_port());
            publisher
        });

        let manager = Arc::new(PrivetManager {
            config: config.clone(),
            security,
            handler: handler.clone(),
            publisher,
            wifi_bootstrap,
        });

        // The public pairing subset and /privet/info answer on plain HTTP;
        // everything answers on HTTPS.
        let route = request_route(&handler);
        http_server.add_http_request_handler("/privet/", route.clone());
        http_server.add_https_request_handler("/privet/", route);

        // Advertisement follows settings, connectivity and tree changes.
        {
            let weak = Arc::downgrade(&manager);
            config
                .on_changed(move |_| {
                    if let Some(manager) = Weak::upgrade(&weak) {
                        manager.update_discovery();
                    }
                })
                .detach();
        }
        {
            let weak = Arc::downgrade(&manager);
            network.add_connection_changed_callback(Box::new(move || {
                if let Some(manager) = Weak::upgrade(&weak) {
                    manager.update_discovery();
                }
            }));
        }
        {
            let weak = Arc::downgrade(&manager);
            model
                .on_tree_changed(move |_| {
                    if let Some(manager) = Weak::upgrade(&weak) {
                        manager.update_discovery();
                    }
                })
                .detach();
        }

        manager.update_discovery();
        manager
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn handler(&self) -> &Arc<PrivetHandler> {
        &self.handler
    }

    pub fn wifi_bootstrap(&self) -> Option<&Arc<WifiBootstrapManager>> {
        self.wifi_bootstrap.as_ref()
    }

    pub fn update_discovery(&self) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let needs_wifi = self
            .wifi_bootstrap
            .as_ref()
            .map(|w| !w.hosted_ssid().is_empty())
            .unwrap_or(false);
        publisher.update(DiscoveryFlags {
            needs_wifi,
            needs_registration: self.config.settings().cloud_id.is_empty(),
        });
    }
}

fn request_route(
    handler: &Arc<PrivetHandler>,
) -> hearth_provider::RequestHandler {
    let handler = handler.clone();
    Arc::new(move |request: IncomingRequest, reply: RequestReply| {
        let input: Value = if request
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            == "application/json"
        {
            serde_json::from_slice(&request.data).unwrap_or(Value::Object(Default::default()))
        } else {
            Value::Object(Default::default())
        };
        let (status, body) = handler.handle(&request.path, &request.auth_header, &input);
        reply(status, body);
    })
}
