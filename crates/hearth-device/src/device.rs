use hearth_auth::AccessRevocationManager;
use hearth_cloud::{CloudEngine, CloudError, GcdState, RegistrationData};
use hearth_config::{Config, ConfigStore, Settings};
use hearth_domain::{
    Command, CommandHandle, DeviceModel, DomainError, Origin, Role, Subscription,
};
use hearth_privet::{CloudDelegate, PairingStart, PrivetManager};
use hearth_provider::{
    DnsServiceDiscovery, HttpClient, HttpServer, Network, TaskRunner, TaskRunnerExt, Wifi,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

use crate::access_api::AccessApiHandler;
use crate::base_api::{BaseApiHandler, DEVICE_COMPONENT};
use crate::error::DeviceError;

/// How often terminal commands past their grace period are reaped.
const COMMAND_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// The pluggable host integrations. `task_runner` and `http_client` are
/// mandatory; everything else degrades gracefully when absent.
pub struct Providers {
    pub task_runner: Arc<dyn TaskRunner>,
    pub http_client: Arc<dyn HttpClient>,
    pub config_store: Option<Arc<dyn ConfigStore>>,
    pub network: Option<Arc<dyn Network>>,
    pub http_server: Option<Arc<dyn HttpServer>>,
    pub dns_sd: Option<Arc<dyn DnsServiceDiscovery>>,
    pub wifi: Option<Arc<dyn Wifi>>,
}

/// The embedding API: owns the model, settings, cloud engine and local
/// surface, and exposes the operations an application needs to describe its
/// hardware and react to commands.
pub struct Device {
    model: Arc<DeviceModel>,
    config: Arc<Config>,
    cloud: Arc<CloudEngine>,
    privet: Option<Arc<PrivetManager>>,
    revocation: Arc<AccessRevocationManager>,
    _base_api: Arc<BaseApiHandler>,
    _access_api: Arc<AccessApiHandler>,
}

impl Device {
    /// Build and start a device instance. Must be called from within a
    /// tokio runtime.
    pub fn create(providers: Providers) -> Result<Arc<Device>, DeviceError> {
        let config = Arc::new(Config::new(providers.config_store.clone()));
        config.load()?;

        let model = DeviceModel::new();
        model.load_traits(&BaseApiHandler::trait_definitions())?;
        model.load_traits(&AccessApiHandler::trait_definitions())?;
        model.add_component(
            "",
            DEVICE_COMPONENT,
            vec![
                "device".to_string(),
                "privet".to_string(),
                "_accessRevocationList".to_string(),
            ],
        )?;

        let cloud = CloudEngine::new(
            model.clone(),
            config.clone(),
            providers.http_client.clone(),
            providers.network.clone(),
        );
        let revocation = Arc::new(AccessRevocationManager::new(providers.config_store.clone()));
        let base_api = BaseApiHandler::start(model.clone(), config.clone(), Some(cloud.clone()))?;
        let access_api = AccessApiHandler::start(model.clone(), revocation.clone())?;

        cloud.start();

        let privet = match (&providers.http_server, &providers.network) {
            (Some(http_server), Some(network)) => Some(PrivetManager::start(
                model.clone(),
                config.clone(),
                providers.task_runner.clone(),
                network.clone(),
                http_server.clone(),
                providers.dns_sd.clone(),
                providers.wifi.clone(),
                Some(cloud.clone() as Arc<dyn CloudDelegate>),
            )),
            _ => None,
        };

        schedule_command_cleanup(providers.task_runner.clone(), Arc::downgrade(&model));

        info!(device_id = %config.settings().device_id, "device started");
        Ok(Arc::new(Device {
            model,
            config,
            cloud,
            privet,
            revocation,
            _base_api: base_api,
            _access_api: access_api,
        }))
    }

    // ── Model ─────────────────────────────────────────────────────────────

    pub fn model(&self) -> &Arc<DeviceModel> {
        &self.model
    }

    pub fn add_trait_definitions(&self, dict: &Value) -> Result<(), DomainError> {
        self.model.load_traits(dict)
    }

    pub fn add_trait_definitions_json(&self, json: &str) -> Result<(), DomainError> {
        self.model.load_traits_json(json)
    }

    pub fn add_component(
        &self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<(), DomainError> {
        self.model.add_component(parent_path, name, traits)
    }

    pub fn add_component_array_item(
        &self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<String, DomainError> {
        self.model.add_component_array_item(parent_path, name, traits)
    }

    pub fn add_command_handler(
        &self,
        component_path: &str,
        command_name: &str,
        handler: impl Fn(CommandHandle) + Send + Sync + 'static,
    ) -> Result<(), DomainError> {
        self.model
            .add_command_handler(component_path, command_name, handler)
    }

    pub fn add_default_command_handler(
        &self,
        handler: impl Fn(CommandHandle) + Send + Sync + 'static,
    ) -> Result<(), DomainError> {
        self.model.add_default_command_handler(handler)
    }

    /// Queue a host-initiated command.
    pub fn add_command(&self, command: &Value) -> Result<String, DomainError> {
        self.model.add_command(command, Origin::Local, Role::Owner)
    }

    pub fn find_command(&self, id: &str) -> Option<Arc<Command>> {
        self.model.find_command(id)
    }

    pub fn set_state_properties(
        &self,
        component_path: &str,
        patch: &Map<String, Value>,
    ) -> Result<u64, DomainError> {
        self.model.set_state_properties(component_path, patch)
    }

    pub fn set_state_property(
        &self,
        component_path: &str,
        name: &str,
        value: Value,
    ) -> Result<u64, DomainError> {
        self.model.set_state_property(component_path, name, value)
    }

    pub fn get_state_property(
        &self,
        component_path: &str,
        name: &str,
    ) -> Result<Value, DomainError> {
        self.model.get_state_property(component_path, name)
    }

    pub fn traits(&self) -> Value {
        self.model.traits_json()
    }

    pub fn components(&self) -> Value {
        self.model.components_json()
    }

    // ── Settings ──────────────────────────────────────────────────────────

    pub fn settings(&self) -> Settings {
        self.config.settings()
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn on_settings_changed(
        &self,
        callback: impl Fn(&Settings) + Send + Sync + 'static,
    ) -> Subscription {
        self.config.on_changed(callback)
    }

    // ── Cloud ─────────────────────────────────────────────────────────────

    pub async fn register(&self, data: RegistrationData) -> Result<(), CloudError> {
        self.cloud.register(data).await
    }

    pub fn gcd_state(&self) -> GcdState {
        self.cloud.gcd_state()
    }

    pub fn on_gcd_state_changed(
        &self,
        callback: impl Fn(&GcdState) + Send + Sync + 'static,
    ) -> Subscription {
        self.cloud.on_gcd_state_changed(callback)
    }

    pub fn cloud(&self) -> &Arc<CloudEngine> {
        &self.cloud
    }

    // ── Local access ──────────────────────────────────────────────────────

    pub fn privet(&self) -> Option<&Arc<PrivetManager>> {
        self.privet.as_ref()
    }

    pub fn revocation_manager(&self) -> &Arc<AccessRevocationManager> {
        &self.revocation
    }

    /// Observe pairing sessions opening and closing, e.g. to display the
    /// code. No-ops on devices without a local surface.
    pub fn on_pairing_changed(
        &self,
        on_start: impl Fn(&PairingStart) + Send + Sync + 'static,
        on_end: impl Fn(&String) + Send + Sync + 'static,
    ) -> Vec<Subscription> {
        match &self.privet {
            Some(privet) => vec![
                privet.security().on_pairing_start(on_start),
                privet.security().on_pairing_end(on_end),
            ],
            None => Vec::new(),
        }
    }
}

fn schedule_command_cleanup(runner: Arc<dyn TaskRunner>, model: Weak<DeviceModel>) {
    let runner2 = runner.clone();
    runner.post_after(COMMAND_CLEANUP_INTERVAL, move || {
        if let Some(live) = model.upgrade() {
            live.cleanup_commands();
            schedule_command_cleanup(runner2, model);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::prelude::*;
    use hearth_domain::CommandState;
    use hearth_provider::{HttpMethod, HttpResponse, MemoryConfigStore, ProviderError};
    use serde_json::json;

    struct ManualTaskRunner;

    impl TaskRunner for ManualTaskRunner {
        fn post_delayed(&self, _delay: Duration, _task: Box<dyn FnOnce() + Send>) {}
    }

    struct NoHttpClient;

    #[async_trait]
    impl HttpClient for NoHttpClient {
        async fn send_request(
            &self,
            _method: HttpMethod,
            _url: &str,
            _headers: &[(String, String)],
            _body: Option<Vec<u8>>,
        ) -> Result<HttpResponse, ProviderError> {
            Err(ProviderError::Offline)
        }
    }

    fn device() -> Arc<Device> {
        Device::create(Providers {
            task_runner: Arc::new(ManualTaskRunner),
            http_client: Arc::new(NoHttpClient),
            config_store: Some(Arc::new(MemoryConfigStore::new())),
            network: None,
            http_server: None,
            dns_sd: None,
            wifi: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn startup_seeds_builtin_traits_and_state() {
        let device = device();
        assert!(!device.settings().device_id.is_empty());

        let components = device.components();
        let traits = components["device"]["traits"].as_array().unwrap();
        for name in ["device", "privet", "_accessRevocationList"] {
            assert!(traits.contains(&json!(name)), "missing {name}");
        }

        assert_eq!(
            device.get_state_property("device", "privet.apiVersion").unwrap(),
            json!("3")
        );
        assert_eq!(
            device
                .get_state_property("device", "_accessRevocationList.capacity")
                .unwrap(),
            json!(1024)
        );
        assert_eq!(
            device
                .get_state_property("device", "privet.maxRoleForAnonymousAccess")
                .unwrap(),
            json!("viewer")
        );
        assert_eq!(device.gcd_state(), GcdState::Unconfigured);
    }

    #[tokio::test]
    async fn set_config_command_updates_settings_and_state() {
        let device = device();
        let id = device
            .add_command(&json!({
                "name": "device.setConfig",
                "parameters": {"name": "Kettle", "location": "kitchen"},
            }))
            .unwrap();

        let command = device.find_command(&id).unwrap();
        assert_eq!(command.state(), CommandState::Done);
        assert_eq!(device.settings().name, "Kettle");
        assert_eq!(device.settings().location, "kitchen");
        assert_eq!(
            device.get_state_property("device", "device.name").unwrap(),
            json!("Kettle")
        );
    }

    #[tokio::test]
    async fn privet_set_config_validates_the_role_enum() {
        let device = device();
        // "owner" is outside the allowed anonymous roles.
        let err = device
            .add_command(&json!({
                "name": "privet.setConfig",
                "parameters": {"maxRoleForAnonymousAccess": "owner"},
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotInEnum { .. }));

        device
            .add_command(&json!({
                "name": "privet.setConfig",
                "parameters": {"maxRoleForAnonymousAccess": "none", "isLocalAccessEnabled": false},
            }))
            .unwrap();
        assert_eq!(device.settings().local_anonymous_access_role, Role::None);
        assert!(!device.settings().local_access_enabled);
    }

    #[tokio::test]
    async fn revocation_commands_round_trip() {
        let device = device();
        let user = BASE64_STANDARD.encode(b"user-1");
        let app = BASE64_STANDARD.encode(b"app-1");

        // Revocation/expiration are J2000 seconds; far future expiration.
        let id = device
            .add_command(&json!({
                "name": "_accessRevocationList.add",
                "parameters": {
                    "userId": user,
                    "applicationId": app,
                    "revocationTimestamp": 900_000_000,
                    "expirationTime": 2_000_000_000,
                },
            }))
            .unwrap();
        assert_eq!(device.find_command(&id).unwrap().state(), CommandState::Done);
        assert_eq!(device.revocation_manager().len(), 1);

        let id = device
            .add_command(&json!({"name": "_accessRevocationList.list"}))
            .unwrap();
        let command = device.find_command(&id).unwrap();
        assert_eq!(command.state(), CommandState::Done);
        let results = command.results();
        let list = results["revocationList"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["userId"], json!(user));
    }

    #[tokio::test]
    async fn bad_ids_abort_the_add_command() {
        let device = device();
        let id = device
            .add_command(&json!({
                "name": "_accessRevocationList.add",
                "parameters": {
                    "userId": "!!!not-base64!!!",
                    "applicationId": "",
                    "revocationTimestamp": 1,
                    "expirationTime": 2_000_000_000,
                },
            }))
            .unwrap();
        let command = device.find_command(&id).unwrap();
        assert_eq!(command.state(), CommandState::Aborted);
        assert!(command.error().is_some());
    }

    #[tokio::test]
    async fn app_traits_compose_with_builtins() {
        let device = device();
        device
            .add_trait_definitions(&json!({
                "onOff": {
                    "commands": {
                        "setState": {
                            "minimalRole": "user",
                            "parameters": {"state": {"type": "string", "enum": ["on", "off"]}}
                        }
                    },
                    "state": {"state": {"type": "string"}}
                }
            }))
            .unwrap();
        device.add_component("", "light", vec!["onOff".into()]).unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        device
            .add_command_handler("light", "onOff.setState", move |cmd| {
                let command = cmd.upgrade().unwrap();
                let state = command.parameters()["state"].clone();
                command.set_progress(Map::new()).unwrap();
                command.complete(Map::new()).unwrap();
                assert_eq!(state, json!("on"));
                fired2.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .unwrap();

        device
            .add_command(&json!({"name": "onOff.setState", "parameters": {"state": "on"}}))
            .unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
