use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::DomainError;
use crate::role::Role;

/// Registry of trait definitions.
///
/// A trait is a JSON object with optional `commands` and `state`
/// sub-dictionaries. Once loaded, a trait may only be re-loaded with
/// byte-identical contents.
#[derive(Debug, Default)]
pub struct TraitRegistry {
    traits: BTreeMap<String, Value>,
}

impl TraitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a dictionary of trait definitions into the registry.
    ///
    /// Returns `true` if anything new was added. A conflicting redefinition
    /// aborts the load without mutating the registry.
    pub fn load_traits(&mut self, dict: &Value) -> Result<bool, DomainError> {
        let Some(map) = dict.as_object() else {
            return Err(DomainError::ObjectExpected);
        };

        // Validate the whole batch before inserting anything.
        for (name, def) in map {
            let Some(def_map) = def.as_object() else {
                return Err(DomainError::TraitNotObject(name.clone()));
            };
            if let Some(existing) = self.traits.get(name) {
                if existing != def {
                    return Err(DomainError::TraitConflict(name.clone()));
                }
                continue;
            }
            validate_trait_definition(name, def_map)?;
        }

        let mut modified = false;
        for (name, def) in map {
            if !self.traits.contains_key(name) {
                self.traits.insert(name.clone(), def.clone());
                modified = true;
            }
        }
        Ok(modified)
    }

    pub fn find_trait(&self, name: &str) -> Option<&Value> {
        self.traits.get(name)
    }

    /// Look up the definition of `trait.command`.
    pub fn find_command(&self, command_name: &str) -> Option<&Map<String, Value>> {
        let (trait_name, command) = command_name.split_once('.')?;
        self.traits
            .get(trait_name)?
            .get("commands")?
            .get(command)?
            .as_object()
    }

    /// The minimal role required to run `command_name`.
    pub fn minimal_role(&self, command_name: &str) -> Result<Role, DomainError> {
        let def = self
            .find_command(command_name)
            .ok_or_else(|| DomainError::UnknownCommand(command_name.to_string()))?;
        let role = def
            .get("minimalRole")
            .and_then(Value::as_str)
            .and_then(|s| Role::from_str(s).ok());
        // load_traits validated this, so absence means the command came from
        // a trait loaded before the role was introduced.
        role.ok_or_else(|| DomainError::UnknownCommand(command_name.to_string()))
    }

    /// All definitions as one JSON object, keyed by trait name.
    pub fn to_json(&self) -> Value {
        Value::Object(self.traits.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }
}

fn validate_trait_definition(name: &str, def: &Map<String, Value>) -> Result<(), DomainError> {
    if let Some(commands) = def.get("commands") {
        let Some(commands) = commands.as_object() else {
            return Err(DomainError::TraitNotObject(name.to_string()));
        };
        for (command, command_def) in commands {
            let Some(command_def) = command_def.as_object() else {
                return Err(DomainError::TraitNotObject(format!("{name}.{command}")));
            };
            let role = command_def.get("minimalRole").and_then(Value::as_str);
            match role.and_then(|s| Role::from_str(s).ok()) {
                Some(role) if role > Role::None => {}
                _ => {
                    return Err(DomainError::InvalidValue {
                        name: format!("{name}.{command}.minimalRole"),
                        message: "expected one of viewer|user|manager|owner".to_string(),
                    })
                }
            }
            for section in ["parameters", "progress", "results"] {
                if let Some(schema) = command_def.get(section) {
                    if !schema.is_object() {
                        return Err(DomainError::TraitNotObject(format!(
                            "{name}.{command}.{section}"
                        )));
                    }
                }
            }
        }
    }
    if let Some(state) = def.get("state") {
        if !state.is_object() {
            return Err(DomainError::TraitNotObject(format!("{name}.state")));
        }
    }
    Ok(())
}

/// Validate a JSON object against a schema dictionary mapping property names
/// to property schemas. Properties not named in the schema are rejected.
pub fn validate_object(
    object: &Map<String, Value>,
    properties: &Map<String, Value>,
) -> Result<(), DomainError> {
    for (key, value) in object {
        let schema = properties
            .get(key)
            .ok_or_else(|| DomainError::UndefinedProperty(key.clone()))?;
        validate_value(key, value, schema)?;
    }
    for (key, schema) in properties {
        let required = schema
            .get("isRequired")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if required && !object.contains_key(key) {
            return Err(DomainError::RequiredMissing(key.clone()));
        }
    }
    Ok(())
}

/// Validate a single value against its property schema. This is the
/// JSON-schema subset used by trait definitions: `type`, `minimum`,
/// `maximum`, `enum`, `isRequired`, `properties`, `items`,
/// `additionalProperties`.
pub fn validate_value(name: &str, value: &Value, schema: &Value) -> Result<(), DomainError> {
    let Some(schema) = schema.as_object() else {
        return Err(DomainError::InvalidValue {
            name: name.to_string(),
            message: "property schema must be an object".to_string(),
        });
    };

    if let Some(type_name) = schema.get("type").and_then(Value::as_str) {
        check_type(name, value, type_name)?;
        match type_name {
            "integer" => check_int_range(name, value, schema)?,
            "number" => check_number_range(name, value, schema)?,
            "object" => {
                let empty = Map::new();
                let properties = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .unwrap_or(&empty);
                let additional = schema
                    .get("additionalProperties")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let object = value.as_object().ok_or(DomainError::ObjectExpected)?;
                if additional {
                    // Only validate the declared subset.
                    for (key, item) in object {
                        if let Some(item_schema) = properties.get(key) {
                            validate_value(key, item, item_schema)?;
                        }
                    }
                    for (key, item_schema) in properties {
                        let required = item_schema
                            .get("isRequired")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if required && !object.contains_key(key) {
                            return Err(DomainError::RequiredMissing(key.clone()));
                        }
                    }
                } else {
                    validate_object(object, properties)?;
                }
            }
            "array" => {
                if let Some(items_schema) = schema.get("items") {
                    for (i, item) in value.as_array().into_iter().flatten().enumerate() {
                        validate_value(&format!("{name}[{i}]"), item, items_schema)?;
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(DomainError::NotInEnum {
                name: name.to_string(),
            });
        }
    }

    Ok(())
}

fn check_type(name: &str, value: &Value, type_name: &str) -> Result<(), DomainError> {
    let ok = match type_name {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => {
            return Err(DomainError::InvalidValue {
                name: name.to_string(),
                message: format!("unknown type '{type_name}' in schema"),
            })
        }
    };
    if !ok {
        return Err(DomainError::InvalidValue {
            name: name.to_string(),
            message: format!("expected {type_name}"),
        });
    }
    Ok(())
}

fn check_int_range(
    name: &str,
    value: &Value,
    schema: &Map<String, Value>,
) -> Result<(), DomainError> {
    let v = value.as_i64().unwrap_or(i64::MAX);
    if let Some(min) = schema.get("minimum").and_then(Value::as_i64) {
        if v < min {
            return Err(DomainError::InvalidValue {
                name: name.to_string(),
                message: format!("{v} is below minimum {min}"),
            });
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_i64) {
        if v > max {
            return Err(DomainError::InvalidValue {
                name: name.to_string(),
                message: format!("{v} is above maximum {max}"),
            });
        }
    }
    Ok(())
}

fn check_number_range(
    name: &str,
    value: &Value,
    schema: &Map<String, Value>,
) -> Result<(), DomainError> {
    let v = value.as_f64().unwrap_or(f64::MAX);
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if v < min {
            return Err(DomainError::InvalidValue {
                name: name.to_string(),
                message: format!("{v} is below minimum {min}"),
            });
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if v > max {
            return Err(DomainError::InvalidValue {
                name: name.to_string(),
                message: format!("{v} is above maximum {max}"),
            });
        }
    }
    Ok(())
}
