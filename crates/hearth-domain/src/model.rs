use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::command::{parse_command, Command, Origin};
use crate::component::ComponentTree;
use crate::error::DomainError;
use crate::observer::{ObserverList, Subscription};
use crate::queue::{CommandHandle, CommandQueue};
use crate::role::Role;
use crate::schema::{validate_object, TraitRegistry};
use crate::state_log::{StateChange, StateChangeLog};

/// The device model: trait registry, component tree, command queue and
/// state-change log behind one façade. This is the object every other
/// subsystem talks to.
pub struct DeviceModel {
    registry: Mutex<TraitRegistry>,
    tree: Mutex<ComponentTree>,
    queue: CommandQueue,
    state_log: StateChangeLog,
    next_command_id: AtomicU64,
    on_trait_defs_changed: ObserverList<()>,
    on_tree_changed: ObserverList<()>,
    on_state_changed: ObserverList<()>,
}

impl Default for DeviceModel {
    fn default() -> Self {
        DeviceModel {
            registry: Mutex::new(TraitRegistry::new()),
            tree: Mutex::new(ComponentTree::new()),
            queue: CommandQueue::new(),
            state_log: StateChangeLog::new(),
            next_command_id: AtomicU64::new(0),
            on_trait_defs_changed: ObserverList::new(),
            on_tree_changed: ObserverList::new(),
            on_state_changed: ObserverList::new(),
        }
    }
}

impl DeviceModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ── Traits ────────────────────────────────────────────────────────────

    pub fn load_traits(&self, dict: &Value) -> Result<(), DomainError> {
        let modified = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .load_traits(dict)?;
        if modified {
            self.on_trait_defs_changed.notify(&());
        }
        Ok(())
    }

    pub fn load_traits_json(&self, json: &str) -> Result<(), DomainError> {
        let value: Value =
            serde_json::from_str(json).map_err(|_| DomainError::ObjectExpected)?;
        self.load_traits(&value)
    }

    pub fn find_trait(&self, name: &str) -> Option<Value> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find_trait(name)
            .cloned()
    }

    pub fn traits_json(&self) -> Value {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).to_json()
    }

    pub fn minimal_role(&self, command_name: &str) -> Result<Role, DomainError> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .minimal_role(command_name)
    }

    /// Invoked once on subscription, then after each trait-definition
    /// change.
    pub fn on_trait_defs_changed(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&());
        self.on_trait_defs_changed.add(callback)
    }

    // ── Components ────────────────────────────────────────────────────────

    pub fn add_component(
        &self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<(), DomainError> {
        self.check_traits_known(&traits)?;
        self.tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_component(parent_path, name, traits)?;
        self.on_tree_changed.notify(&());
        Ok(())
    }

    pub fn add_component_array_item(
        &self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<String, DomainError> {
        self.check_traits_known(&traits)?;
        let path = self
            .tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_component_array_item(parent_path, name, traits)?;
        self.on_tree_changed.notify(&());
        Ok(path)
    }

    pub fn component_json(&self, path: &str) -> Result<Value, DomainError> {
        Ok(self
            .tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find(path)?
            .to_json())
    }

    pub fn components_json(&self) -> Value {
        self.tree.lock().unwrap_or_else(|e| e.into_inner()).to_json()
    }

    pub fn find_component_with_trait(&self, trait_name: &str) -> Option<String> {
        self.tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find_with_trait(trait_name)
    }

    pub fn has_component(&self, path: &str) -> bool {
        self.tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find(path)
            .is_ok()
    }

    pub fn on_tree_changed(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&());
        self.on_tree_changed.add(callback)
    }

    // ── Commands ──────────────────────────────────────────────────────────

    /// Parse, validate, route and enqueue a command from JSON. Returns the
    /// assigned id.
    pub fn add_command(
        &self,
        value: &Value,
        origin: Origin,
        role: Role,
    ) -> Result<String, DomainError> {
        let parsed = parse_command(value)?;

        let (minimal_role, parameters_schema, progress_schema, results_schema) = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let def = registry
                .find_command(&parsed.name)
                .ok_or_else(|| DomainError::UnknownCommand(parsed.name.clone()))?;
            let section = |name: &str| -> Map<String, Value> {
                def.get(name)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default()
            };
            (
                registry.minimal_role(&parsed.name)?,
                section("parameters"),
                section("progress"),
                section("results"),
            )
        };

        if role < minimal_role {
            return Err(DomainError::AccessDenied {
                actual: role.to_string(),
                required: minimal_role.to_string(),
            });
        }

        validate_object(&parsed.parameters, &parameters_schema)?;

        let trait_name = parsed
            .name
            .split_once('.')
            .map(|(t, _)| t.to_string())
            .unwrap_or_default();

        let component_path = if parsed.component.is_empty() {
            self.find_component_with_trait(&trait_name).ok_or_else(|| {
                DomainError::UnroutedCommand {
                    command: parsed.name.clone(),
                    trait_name: trait_name.clone(),
                }
            })?
        } else {
            parsed.component.clone()
        };

        {
            let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            let component = tree.find(&component_path)?;
            if !component.has_trait(&trait_name) {
                return Err(DomainError::TraitNotSupported {
                    path: component_path,
                    trait_name,
                });
            }
        }

        let id = match origin {
            // Local command ids are process-local and monotonic; any id in
            // the request is ignored.
            Origin::Local => (self.next_command_id.fetch_add(1, Ordering::SeqCst) + 1).to_string(),
            Origin::Cloud => parsed
                .id
                .clone()
                .ok_or_else(|| DomainError::InvalidValue {
                    name: "id".to_string(),
                    message: "cloud command without an id".to_string(),
                })?,
        };

        let command = Arc::new(Command::new(
            id.clone(),
            parsed.name,
            component_path,
            origin,
            parsed.parameters,
            progress_schema,
            results_schema,
        ));
        info!(id = %id, name = command.name(), component = command.component(), "command queued");
        self.queue.add(command)?;
        Ok(id)
    }

    pub fn find_command(&self, id: &str) -> Option<Arc<Command>> {
        self.queue.find(id)
    }

    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.queue.commands()
    }

    pub fn add_command_handler(
        &self,
        component_path: &str,
        command_name: &str,
        handler: impl Fn(CommandHandle) + Send + Sync + 'static,
    ) -> Result<(), DomainError> {
        self.queue.add_handler(component_path, command_name, handler)
    }

    pub fn add_default_command_handler(
        &self,
        handler: impl Fn(CommandHandle) + Send + Sync + 'static,
    ) -> Result<(), DomainError> {
        self.queue.add_default_handler(handler)
    }

    pub fn on_command_added(
        &self,
        callback: impl Fn(&Arc<Command>) + Send + Sync + 'static,
    ) -> Subscription {
        self.queue.on_command_added(callback)
    }

    pub fn on_command_removed(
        &self,
        callback: impl Fn(&Arc<Command>) + Send + Sync + 'static,
    ) -> Subscription {
        self.queue.on_command_removed(callback)
    }

    /// Reap terminal commands whose removal grace period has elapsed.
    pub fn cleanup_commands(&self) {
        self.queue.cleanup();
    }

    // ── State ─────────────────────────────────────────────────────────────

    /// Deep-merge `patch` into the component's state, record the delta and
    /// bump the update id.
    pub fn set_state_properties(
        &self,
        component_path: &str,
        patch: &Map<String, Value>,
    ) -> Result<u64, DomainError> {
        self.set_state_properties_at(component_path, Utc::now(), patch)
    }

    pub fn set_state_properties_at(
        &self,
        component_path: &str,
        timestamp: DateTime<Utc>,
        patch: &Map<String, Value>,
    ) -> Result<u64, DomainError> {
        self.tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge_state(component_path, patch)?;
        let id = self.state_log.record(component_path, timestamp, patch.clone());
        debug!(component = component_path, update_id = id, "state updated");
        self.on_state_changed.notify(&());
        Ok(id)
    }

    /// Set a single `trait.property` value on a component.
    pub fn set_state_property(
        &self,
        component_path: &str,
        name: &str,
        value: Value,
    ) -> Result<u64, DomainError> {
        let (trait_name, prop) = name.split_once('.').ok_or_else(|| {
            DomainError::InvalidValue {
                name: name.to_string(),
                message: "expected 'trait.property'".to_string(),
            }
        })?;
        let mut patch = Map::new();
        let mut inner = Map::new();
        inner.insert(prop.to_string(), value);
        patch.insert(trait_name.to_string(), Value::Object(inner));
        self.set_state_properties(component_path, &patch)
    }

    pub fn get_state_property(
        &self,
        component_path: &str,
        name: &str,
    ) -> Result<Value, DomainError> {
        let (trait_name, prop) = name.split_once('.').ok_or_else(|| {
            DomainError::InvalidValue {
                name: name.to_string(),
                message: "expected 'trait.property'".to_string(),
            }
        })?;
        let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
        let component = tree.find(component_path)?;
        component
            .state
            .get(trait_name)
            .and_then(|v| v.get(prop))
            .cloned()
            .ok_or_else(|| DomainError::InvalidValue {
                name: name.to_string(),
                message: format!("state property not found in component '{component_path}'"),
            })
    }

    /// State of every component, keyed by path. Used for the device
    /// resource and the local state endpoint.
    pub fn state_json(&self) -> Value {
        self.tree.lock().unwrap_or_else(|e| e.into_inner()).state_json()
    }

    pub fn on_state_changed(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&());
        self.on_state_changed.add(callback)
    }

    pub fn drain_state_changes(&self) -> (u64, Vec<StateChange>) {
        self.state_log.drain()
    }

    pub fn last_update_id(&self) -> u64 {
        self.state_log.last_update_id()
    }

    pub fn notify_state_updated_on_server(&self, update_id: u64) {
        self.state_log.notify_updated_on_server(update_id);
    }

    pub fn on_server_state_ack(
        &self,
        callback: impl Fn(&u64) + Send + Sync + 'static,
    ) -> Subscription {
        self.state_log.on_server_ack(callback)
    }

    fn check_traits_known(&self, traits: &[String]) -> Result<(), DomainError> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        for name in traits {
            if registry.find_trait(name).is_none() {
                return Err(DomainError::UnknownTrait(name.clone()));
            }
        }
        Ok(())
    }
}
