use anyhow::Context;
use hearth_device::Device;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

const LIGHT_COMPONENT: &str = "light";

const TRAIT_DEFS: &str = r#"{
  "onOff": {
    "commands": {
      "setState": {
        "minimalRole": "user",
        "parameters": {
          "state": {"type": "string", "enum": ["on", "standby"]}
        }
      }
    },
    "state": {
      "state": {"isRequired": true, "type": "string", "enum": ["on", "standby"]}
    }
  },
  "brightness": {
    "commands": {
      "setConfig": {
        "minimalRole": "user",
        "parameters": {
          "brightness": {"type": "integer", "minimum": 0, "maximum": 100}
        }
      }
    },
    "state": {
      "brightness": {"isRequired": true, "type": "integer", "minimum": 0, "maximum": 100}
    }
  }
}"#;

/// Declares the demo light and keeps its state in sync with incoming
/// commands.
pub fn install(device: &Arc<Device>) -> anyhow::Result<()> {
    device
        .add_trait_definitions_json(TRAIT_DEFS)
        .context("loading light traits")?;
    device
        .add_component("", LIGHT_COMPONENT, vec!["onOff".into(), "brightness".into()])
        .context("adding light component")?;

    let mut initial = Map::new();
    initial.insert("onOff".to_string(), json!({"state": "standby"}));
    initial.insert("brightness".to_string(), json!({"brightness": 100}));
    device.set_state_properties(LIGHT_COMPONENT, &initial)?;

    {
        let device2 = device.clone();
        device.add_command_handler(LIGHT_COMPONENT, "onOff.setState", move |cmd| {
            let Some(command) = cmd.upgrade() else { return };
            let state = command
                .parameters()
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or("standby")
                .to_string();
            if command.set_progress(Map::new()).is_err() {
                return;
            }
            info!(state, "light switched");
            let _ = device2.set_state_property(LIGHT_COMPONENT, "onOff.state", json!(state));
            let _ = command.complete(Map::new());
        })?;
    }
    {
        let device2 = device.clone();
        device.add_command_handler(LIGHT_COMPONENT, "brightness.setConfig", move |cmd| {
            let Some(command) = cmd.upgrade() else { return };
            let brightness = command
                .parameters()
                .get("brightness")
                .and_then(Value::as_i64)
                .unwrap_or(100);
            if command.set_progress(Map::new()).is_err() {
                return;
            }
            info!(brightness, "brightness changed");
            let _ = device2.set_state_property(
                LIGHT_COMPONENT,
                "brightness.brightness",
                json!(brightness),
            );
            let _ = command.complete(Map::new());
        })?;
    }

    Ok(())
}
