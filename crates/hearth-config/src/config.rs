use base64::prelude::*;
use hearth_domain::{ObserverList, Subscription};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::settings::{PersistedState, Settings};

/// Storage key for the settings blob.
const SETTINGS_KEY: &str = "config";

/// Host-supplied persistence for opaque settings blobs. Encryption of the
/// stored bytes is the provider's responsibility.
pub trait ConfigStore: Send + Sync {
    /// Overlay factory defaults onto the built-in defaults.
    fn load_defaults(&self, _settings: &mut Settings) {}

    /// Load the blob stored under `key`, if any.
    fn load_settings(&self, key: &str) -> Option<String>;

    /// Persist the blob stored under `key`.
    fn save_settings(&self, key: &str, value: &str);
}

/// Owns the live [`Settings`] and writes every committed change through the
/// config store. Mutation goes through [`Config::edit`].
pub struct Config {
    store: Option<Arc<dyn ConfigStore>>,
    settings: Mutex<Settings>,
    on_changed: ObserverList<Settings>,
}

impl Config {
    pub fn new(store: Option<Arc<dyn ConfigStore>>) -> Self {
        Config {
            store,
            settings: Mutex::new(Settings::default()),
            on_changed: ObserverList::new(),
        }
    }

    /// Apply host defaults, overlay the persisted blob, and generate the
    /// device id on first start.
    pub fn load(&self) -> Result<(), ConfigError> {
        let mut settings = Settings::default();
        if let Some(store) = &self.store {
            store.load_defaults(&mut settings);
            if let Some(blob) = store.load_settings(SETTINGS_KEY) {
                let state: PersistedState = serde_json::from_str(&blob)?;
                apply_persisted(&mut settings, state)?;
            }
        }

        let mut save_needed = false;
        if settings.device_id.is_empty() {
            settings.device_id = uuid::Uuid::new_v4().to_string();
            info!(device_id = %settings.device_id, "generated device id");
            save_needed = true;
        }

        *self.lock() = settings.clone();
        if save_needed {
            self.save(&settings);
        }
        self.on_changed.notify(&settings);
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        self.lock().clone()
    }

    /// Begin a settings transaction. Changes take effect on
    /// [`SettingsTransaction::commit`].
    pub fn edit(&self) -> SettingsTransaction<'_> {
        SettingsTransaction {
            config: self,
            settings: self.settings(),
        }
    }

    /// Invoked immediately with the current settings, then after each
    /// commit.
    pub fn on_changed(
        &self,
        callback: impl Fn(&Settings) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&self.settings());
        self.on_changed.add(callback)
    }

    fn commit(&self, settings: Settings) {
        let changed = {
            let mut current = self.lock();
            if *current == settings {
                false
            } else {
                *current = settings.clone();
                true
            }
        };
        if !changed {
            return;
        }
        self.save(&settings);
        self.on_changed.notify(&settings);
    }

    fn save(&self, settings: &Settings) {
        let Some(store) = &self.store else { return };
        let state = to_persisted(settings);
        match serde_json::to_string(&state) {
            Ok(blob) => store.save_settings(SETTINGS_KEY, &blob),
            Err(e) => warn!(error = %e, "failed to serialize settings"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn apply_persisted(settings: &mut Settings, state: PersistedState) -> Result<(), ConfigError> {
    macro_rules! overlay {
        ($($field:ident),* $(,)?) => {
            $(if let Some(value) = state.$field {
                settings.$field = value;
            })*
        };
    }
    overlay!(
        name,
        description,
        location,
        device_id,
        cloud_id,
        refresh_token,
        robot_account,
        oauth_url,
        service_url,
        client_id,
        client_secret,
        api_key,
        local_anonymous_access_role,
        local_access_enabled,
        local_discovery_enabled,
        local_pairing_enabled,
        last_configured_ssid,
    );
    if let Some(secret) = state.secret {
        settings.secret =
            BASE64_STANDARD
                .decode(&secret)
                .map_err(|_| ConfigError::InvalidValue {
                    name: "secret".to_string(),
                    message: "invalid base64".to_string(),
                })?;
    }
    Ok(())
}

fn to_persisted(settings: &Settings) -> PersistedState {
    PersistedState {
        name: Some(settings.name.clone()),
        description: Some(settings.description.clone()),
        location: Some(settings.location.clone()),
        device_id: Some(settings.device_id.clone()),
        cloud_id: Some(settings.cloud_id.clone()),
        refresh_token: Some(settings.refresh_token.clone()),
        robot_account: Some(settings.robot_account.clone()),
        oauth_url: Some(settings.oauth_url.clone()),
        service_url: Some(settings.service_url.clone()),
        client_id: Some(settings.client_id.clone()),
        client_secret: Some(settings.client_secret.clone()),
        api_key: Some(settings.api_key.clone()),
        local_anonymous_access_role: Some(settings.local_anonymous_access_role),
        local_access_enabled: Some(settings.local_access_enabled),
        local_discovery_enabled: Some(settings.local_discovery_enabled),
        local_pairing_enabled: Some(settings.local_pairing_enabled),
        secret: (!settings.secret.is_empty())
            .then(|| BASE64_STANDARD.encode(&settings.secret)),
        last_configured_ssid: Some(settings.last_configured_ssid.clone()),
    }
}

/// A pending edit of the settings. Nothing is visible, persisted, or
/// announced until `commit`.
pub struct SettingsTransaction<'a> {
    config: &'a Config,
    settings: Settings,
}

impl SettingsTransaction<'_> {
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.settings.name = name.into();
        self
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.settings.description = description.into();
        self
    }

    pub fn set_location(&mut self, location: impl Into<String>) -> &mut Self {
        self.settings.location = location.into();
        self
    }

    pub fn set_cloud_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.settings.cloud_id = id.into();
        self
    }

    pub fn set_refresh_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.settings.refresh_token = token.into();
        self
    }

    pub fn set_robot_account(&mut self, account: impl Into<String>) -> &mut Self {
        self.settings.robot_account = account.into();
        self
    }

    pub fn set_oauth_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.settings.oauth_url = url.into();
        self
    }

    pub fn set_service_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.settings.service_url = url.into();
        self
    }

    pub fn set_client_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.settings.client_id = id.into();
        self
    }

    pub fn set_client_secret(&mut self, secret: impl Into<String>) -> &mut Self {
        self.settings.client_secret = secret.into();
        self
    }

    pub fn set_api_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.settings.api_key = key.into();
        self
    }

    pub fn set_local_anonymous_access_role(&mut self, role: hearth_domain::Role) -> &mut Self {
        self.settings.local_anonymous_access_role = role;
        self
    }

    pub fn set_local_access_enabled(&mut self, enabled: bool) -> &mut Self {
        self.settings.local_access_enabled = enabled;
        self
    }

    pub fn set_local_discovery_enabled(&mut self, enabled: bool) -> &mut Self {
        self.settings.local_discovery_enabled = enabled;
        self
    }

    pub fn set_local_pairing_enabled(&mut self, enabled: bool) -> &mut Self {
        self.settings.local_pairing_enabled = enabled;
        self
    }

    pub fn set_secret(&mut self, secret: Vec<u8>) -> &mut Self {
        self.settings.secret = secret;
        self
    }

    pub fn set_last_configured_ssid(&mut self, ssid: impl Into<String>) -> &mut Self {
        self.settings.last_configured_ssid = ssid.into();
        self
    }

    /// Persist the edit and fire change callbacks. A commit with no actual
    /// change is a no-op.
    pub fn commit(&mut self) {
        self.config.commit(self.settings.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::Role;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemoryStore {
        blobs: Mutex<HashMap<String, String>>,
        defaults: Option<Box<dyn Fn(&mut Settings) + Send + Sync>>,
    }

    impl ConfigStore for MemoryStore {
        fn load_defaults(&self, settings: &mut Settings) {
            if let Some(defaults) = &self.defaults {
                defaults(settings);
            }
        }

        fn load_settings(&self, key: &str) -> Option<String> {
            self.blobs.lock().unwrap().get(key).cloned()
        }

        fn save_settings(&self, key: &str, value: &str) {
            self.blobs
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
    }

    #[test]
    fn defaults_match_the_record() {
        let settings = Settings::default();
        assert_eq!(settings.oauth_url, "https://accounts.google.com/o/oauth2/");
        assert_eq!(
            settings.service_url,
            "https://www.googleapis.com/clouddevices/v1/"
        );
        assert_eq!(settings.local_anonymous_access_role, Role::Viewer);
        assert!(settings.local_access_enabled);
        assert!(settings.local_pairing_enabled);
        assert!(!settings.disable_security);
        assert!(settings
            .pairing_modes
            .contains(&crate::settings::PairingType::PinCode));
    }

    #[test]
    fn no_store_still_works() {
        let config = Config::new(None);
        config.load().unwrap();
        config.edit().set_name("lamp").commit();
        assert_eq!(config.settings().name, "lamp");
    }

    #[test]
    fn commit_persists_and_reloads() {
        let store = Arc::new(MemoryStore::default());
        let config = Config::new(Some(store.clone()));
        config.load().unwrap();

        let mut tx = config.edit();
        tx.set_name("lamp").set_cloud_id("CLOUD_ID").set_secret(vec![7; 32]);
        tx.commit();

        let reloaded = Config::new(Some(store));
        reloaded.load().unwrap();
        assert_eq!(reloaded.settings().name, "lamp");
        assert_eq!(reloaded.settings().cloud_id, "CLOUD_ID");
        assert_eq!(reloaded.settings().secret, vec![7; 32]);
    }

    #[test]
    fn device_id_is_generated_once() {
        let store = Arc::new(MemoryStore::default());
        let config = Config::new(Some(store.clone()));
        config.load().unwrap();
        let id = config.settings().device_id;
        assert!(!id.is_empty());

        let again = Config::new(Some(store));
        again.load().unwrap();
        assert_eq!(again.settings().device_id, id);
    }

    #[test]
    fn change_callbacks_fire_on_commit_only_when_changed() {
        let config = Config::new(None);
        config.load().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _sub = config.on_changed(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1); // immediate

        config.edit().set_name("lamp").commit();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Same value again: no callback.
        config.edit().set_name("lamp").commit();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn host_defaults_survive_reload() {
        let store = Arc::new(MemoryStore {
            defaults: Some(Box::new(|s: &mut Settings| {
                s.model_id = "AB123".to_string();
                s.embedded_code = "1234".to_string();
            })),
            ..MemoryStore::default()
        });
        let config = Config::new(Some(store));
        config.load().unwrap();
        assert_eq!(config.settings().model_id, "AB123");
        assert_eq!(config.settings().embedded_code, "1234");
    }
}
