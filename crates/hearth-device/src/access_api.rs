use base64::prelude::*;
use hearth_auth::{from_j2000, AccessRevocationManager, RevocationEntry};
use hearth_domain::{CommandHandle, DeviceModel, DomainError, ErrorInfo};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::base_api::DEVICE_COMPONENT;

const TRAIT_DEFS: &str = r#"{
  "_accessRevocationList": {
    "commands": {
      "add": {
        "minimalRole": "owner",
        "parameters": {
          "userId": {"type": "string"},
          "applicationId": {"type": "string"},
          "revocationTimestamp": {"type": "integer"},
          "expirationTime": {"type": "integer"}
        }
      },
      "list": {
        "minimalRole": "owner",
        "parameters": {},
        "results": {
          "revocationList": {
            "type": "array",
            "items": {
              "type": "object",
              "properties": {
                "userId": {"type": "string"},
                "applicationId": {"type": "string"},
                "revocationTimestamp": {"type": "integer"},
                "expirationTime": {"type": "integer"}
              }
            }
          }
        }
      }
    },
    "state": {
      "capacity": {"type": "integer", "isRequired": true}
    }
  }
}"#;

/// Implements the `_accessRevocationList` trait over the revocation store.
pub struct AccessApiHandler {
    model: Arc<DeviceModel>,
    manager: Arc<AccessRevocationManager>,
}

impl AccessApiHandler {
    pub fn start(
        model: Arc<DeviceModel>,
        manager: Arc<AccessRevocationManager>,
    ) -> Result<Arc<AccessApiHandler>, DomainError> {
        let handler = Arc::new(AccessApiHandler {
            model: model.clone(),
            manager,
        });

        handler.update_state();

        {
            let weak = Arc::downgrade(&handler);
            model.add_command_handler(DEVICE_COMPONENT, "_accessRevocationList.add", move |cmd| {
                if let Some(handler) = weak.upgrade() {
                    handler.block(cmd);
                }
            })?;
        }
        {
            let weak = Arc::downgrade(&handler);
            model.add_command_handler(DEVICE_COMPONENT, "_accessRevocationList.list", move |cmd| {
                if let Some(handler) = weak.upgrade() {
                    handler.list(cmd);
                }
            })?;
        }

        Ok(handler)
    }

    pub fn trait_definitions() -> Value {
        serde_json::from_str(TRAIT_DEFS).unwrap_or(Value::Null)
    }

    fn block(&self, cmd: CommandHandle) {
        let Some(command) = cmd.upgrade() else { return };
        if command.set_progress(Map::new()).is_err() {
            return;
        }

        let parameters = command.parameters().clone();
        let abort = |command: &Arc<hearth_domain::Command>, message: String| {
            let _ = command.abort(Some(ErrorInfo::new(
                "commands",
                "invalidParameterValue",
                message,
            )));
        };

        let decode_id = |key: &str| -> Result<Vec<u8>, String> {
            let text = parameters
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default();
            BASE64_STANDARD
                .decode(text)
                .map_err(|_| format!("invalid {key} '{text}'"))
        };
        let read_time = |key: &str| -> Result<chrono::DateTime<chrono::Utc>, String> {
            parameters
                .get(key)
                .and_then(Value::as_i64)
                .map(from_j2000)
                .ok_or_else(|| format!("{key} is missing"))
        };

        let entry = (|| {
            Ok::<RevocationEntry, String>(RevocationEntry {
                user_id: decode_id("userId")?,
                app_id: decode_id("applicationId")?,
                revocation: read_time("revocationTimestamp")?,
                expiration: read_time("expirationTime")?,
            })
        })();

        match entry {
            Ok(entry) => {
                if let Err(e) = self.manager.block(entry) {
                    abort(&command, e.to_string());
                    return;
                }
                self.update_state();
                let _ = command.complete(Map::new());
            }
            Err(message) => abort(&command, message),
        }
    }

    fn list(&self, cmd: CommandHandle) {
        let Some(command) = cmd.upgrade() else { return };
        if command.set_progress(Map::new()).is_err() {
            return;
        }

        let entries: Vec<Value> = self
            .manager
            .entries()
            .iter()
            .map(|e| {
                json!({
                    "userId": BASE64_STANDARD.encode(&e.user_id),
                    "applicationId": BASE64_STANDARD.encode(&e.app_id),
                })
            })
            .collect();

        let mut results = Map::new();
        results.insert("revocationList".to_string(), Value::Array(entries));
        let _ = command.complete(results);
    }

    fn update_state(&self) {
        let mut patch = Map::new();
        patch.insert(
            "_accessRevocationList".to_string(),
            json!({"capacity": self.manager.capacity()}),
        );
        if let Err(e) = self.model.set_state_properties(DEVICE_COMPONENT, &patch) {
            warn!(error = %e, "failed to publish revocation capacity");
        }
    }
}
