use hearth_cloud::CloudEngine;
use hearth_config::Config;
use hearth_domain::{CommandHandle, CommandState, DeviceModel, DomainError, Role};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Component hosting the built-in traits.
pub const DEVICE_COMPONENT: &str = "device";

const TRAIT_DEFS: &str = r#"{
  "device": {
    "commands": {
      "setConfig": {
        "minimalRole": "user",
        "parameters": {
          "name": {"type": "string"},
          "description": {"type": "string"},
          "location": {"type": "string"}
        }
      }
    },
    "state": {
      "name": {"isRequired": true, "type": "string"},
      "description": {"isRequired": true, "type": "string"},
      "location": {"type": "string"},
      "hardwareId": {"isRequired": true, "type": "string"},
      "serialNumber": {"isRequired": true, "type": "string"},
      "firmwareVersion": {"isRequired": true, "type": "string"}
    }
  },
  "privet": {
    "commands": {
      "setConfig": {
        "minimalRole": "manager",
        "parameters": {
          "isLocalAccessEnabled": {"type": "boolean"},
          "maxRoleForAnonymousAccess": {
            "type": "string",
            "enum": ["none", "viewer", "user", "manager"]
          }
        }
      }
    },
    "state": {
      "apiVersion": {"isRequired": true, "type": "string"},
      "isLocalAccessEnabled": {"isRequired": true, "type": "boolean"},
      "maxRoleForAnonymousAccess": {
        "isRequired": true,
        "type": "string",
        "enum": ["none", "viewer", "user", "manager"]
      }
    }
  }
}"#;

/// Implements the `device` and `privet` traits on top of the settings
/// transaction layer.
pub struct BaseApiHandler {
    model: Arc<DeviceModel>,
    config: Arc<Config>,
}

impl BaseApiHandler {
    /// Loads the trait definitions and wires the command handlers. The
    /// hosting component must already exist.
    pub fn start(
        model: Arc<DeviceModel>,
        config: Arc<Config>,
        cloud: Option<Arc<CloudEngine>>,
    ) -> Result<Arc<BaseApiHandler>, DomainError> {
        let handler = Arc::new(BaseApiHandler {
            model: model.clone(),
            config: config.clone(),
        });

        // Constant state, set once.
        let settings = config.settings();
        set_state(
            &model,
            json!({
                "device": {
                    "firmwareVersion": settings.firmware_version,
                    "hardwareId": settings.device_id,
                    "serialNumber": settings.serial_number,
                },
                "privet": {"apiVersion": "3"},
            }),
        )?;

        // Mutable state follows every settings commit.
        {
            let weak = Arc::downgrade(&handler);
            config
                .on_changed(move |settings| {
                    let Some(handler) = weak.upgrade() else { return };
                    let result = set_state(
                        &handler.model,
                        json!({
                            "device": {
                                "name": settings.name,
                                "description": settings.description,
                                "location": settings.location,
                            },
                            "privet": {
                                "isLocalAccessEnabled": settings.local_access_enabled,
                                "maxRoleForAnonymousAccess":
                                    settings.local_anonymous_access_role.as_str(),
                            },
                        }),
                    );
                    if let Err(e) = result {
                        warn!(error = %e, "failed to mirror settings into state");
                    }
                })
                .detach();
        }

        {
            let weak = Arc::downgrade(&handler);
            let cloud = cloud.clone();
            model.add_command_handler(DEVICE_COMPONENT, "device.setConfig", move |cmd| {
                if let Some(handler) = weak.upgrade() {
                    handler.device_set_config(cmd, cloud.as_ref());
                }
            })?;
        }
        {
            let weak = Arc::downgrade(&handler);
            model.add_command_handler(DEVICE_COMPONENT, "privet.setConfig", move |cmd| {
                if let Some(handler) = weak.upgrade() {
                    handler.privet_set_config(cmd);
                }
            })?;
        }

        Ok(handler)
    }

    pub fn trait_definitions() -> Value {
        serde_json::from_str(TRAIT_DEFS).unwrap_or(Value::Null)
    }

    fn device_set_config(&self, cmd: CommandHandle, cloud: Option<&Arc<CloudEngine>>) {
        let Some(command) = cmd.upgrade() else { return };
        debug_assert_eq!(command.state(), CommandState::Queued);
        if command.set_progress(Map::new()).is_err() {
            return;
        }

        let settings = self.config.settings();
        let parameters = command.parameters();
        let field = |key: &str, current: &str| {
            parameters
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(current)
                .to_string()
        };
        let name = field("name", &settings.name);
        let description = field("description", &settings.description);
        let location = field("location", &settings.location);

        let mut tx = self.config.edit();
        tx.set_name(name).set_description(description).set_location(location);
        tx.commit();

        if let Some(cloud) = cloud {
            if cloud.have_registration_credentials() {
                cloud.update_device_resource_deferred();
            }
        }
        let _ = command.complete(Map::new());
    }

    fn privet_set_config(&self, cmd: CommandHandle) {
        let Some(command) = cmd.upgrade() else { return };
        if command.set_progress(Map::new()).is_err() {
            return;
        }

        let settings = self.config.settings();
        let parameters = command.parameters();
        let enabled = parameters
            .get("isLocalAccessEnabled")
            .and_then(Value::as_bool)
            .unwrap_or(settings.local_access_enabled);
        // The schema's enum constraint already vetted the value.
        let role = parameters
            .get("maxRoleForAnonymousAccess")
            .and_then(Value::as_str)
            .and_then(|s| Role::from_str(s).ok())
            .unwrap_or(settings.local_anonymous_access_role);

        let mut tx = self.config.edit();
        tx.set_local_access_enabled(enabled)
            .set_local_anonymous_access_role(role);
        tx.commit();

        let _ = command.complete(Map::new());
    }
}

fn set_state(model: &Arc<DeviceModel>, value: Value) -> Result<u64, DomainError> {
    let patch = value.as_object().cloned().unwrap_or_default();
    model.set_state_properties(DEVICE_COMPONENT, &patch)
}
