use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::error::DomainError;
use crate::path::{parse_path, PathSegment};

/// A node of the device tree. Claims a set of traits, carries per-trait
/// state, and may contain named children or named arrays of children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Component {
    pub traits: Vec<String>,
    pub state: Map<String, Value>,
    pub components: BTreeMap<String, Child>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    Single(Component),
    Array(Vec<Component>),
}

impl Component {
    fn new(traits: Vec<String>) -> Self {
        Component {
            traits,
            state: Map::new(),
            components: BTreeMap::new(),
        }
    }

    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.iter().any(|t| t == name)
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("traits".to_string(), json!(self.traits));
        if !self.state.is_empty() {
            out.insert("state".to_string(), Value::Object(self.state.clone()));
        }
        if !self.components.is_empty() {
            let mut children = Map::new();
            for (name, child) in &self.components {
                let value = match child {
                    Child::Single(c) => c.to_json(),
                    Child::Array(items) => {
                        Value::Array(items.iter().map(Component::to_json).collect())
                    }
                };
                children.insert(name.clone(), value);
            }
            out.insert("components".to_string(), Value::Object(children));
        }
        Value::Object(out)
    }
}

/// The named tree of components under an implicit root.
#[derive(Debug, Default)]
pub struct ComponentTree {
    roots: BTreeMap<String, Child>,
}

impl ComponentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child component under `parent_path` (empty path = root).
    pub fn add_component(
        &mut self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<(), DomainError> {
        let node = self.graft_node(parent_path)?;
        if node.contains_key(name) {
            return Err(DomainError::ComponentExists {
                path: parent_path.to_string(),
                name: name.to_string(),
            });
        }
        node.insert(name.to_string(), Child::Single(Component::new(traits)));
        Ok(())
    }

    /// Append an entry to the component array `name` under `parent_path`,
    /// creating the array on first use. Returns the path of the new entry.
    pub fn add_component_array_item(
        &mut self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<String, DomainError> {
        let node = self.graft_node(parent_path)?;
        let child = node
            .entry(name.to_string())
            .or_insert_with(|| Child::Array(Vec::new()));
        let Child::Array(items) = child else {
            return Err(DomainError::ComponentExists {
                path: parent_path.to_string(),
                name: name.to_string(),
            });
        };
        items.push(Component::new(traits));
        let index = items.len() - 1;
        Ok(if parent_path.is_empty() {
            format!("{name}[{index}]")
        } else {
            format!("{parent_path}.{name}[{index}]")
        })
    }

    pub fn find(&self, path: &str) -> Result<&Component, DomainError> {
        let segments = parse_path(path)?;
        if segments.is_empty() {
            return Err(DomainError::BadPath {
                path: path.to_string(),
                message: "empty path".to_string(),
            });
        }
        let mut children = &self.roots;
        let mut current: Option<&Component> = None;
        let mut walked = String::new();
        for segment in &segments {
            if let Some(component) = current {
                children = &component.components;
            }
            current = Some(resolve_child(children, segment, &walked)?);
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(&segment.name);
        }
        current.ok_or_else(|| DomainError::BadPath {
            path: path.to_string(),
            message: "empty path".to_string(),
        })
    }

    pub fn find_mut(&mut self, path: &str) -> Result<&mut Component, DomainError> {
        // Validate with the immutable walk first, then repeat mutably.
        self.find(path)?;
        let segments = parse_path(path)?;
        let mut iter = segments.iter();
        let first = iter.next().ok_or_else(|| DomainError::BadPath {
            path: path.to_string(),
            message: "empty path".to_string(),
        })?;
        let mut current = resolve_child_mut(&mut self.roots, first)?;
        for segment in iter {
            current = resolve_child_mut(&mut current.components, segment)?;
        }
        Ok(current)
    }

    /// Depth-first search for the first component claiming `trait_name`.
    /// Returns its path, or `None`.
    pub fn find_with_trait(&self, trait_name: &str) -> Option<String> {
        fn search(
            children: &BTreeMap<String, Child>,
            prefix: &str,
            trait_name: &str,
        ) -> Option<String> {
            for (name, child) in children {
                let components: Vec<(String, &Component)> = match child {
                    Child::Single(c) => vec![(join(prefix, name), c)],
                    Child::Array(items) => items
                        .iter()
                        .enumerate()
                        .map(|(i, c)| (join(prefix, &format!("{name}[{i}]")), c))
                        .collect(),
                };
                for (path, component) in components {
                    if component.has_trait(trait_name) {
                        return Some(path);
                    }
                    if let Some(found) = search(&component.components, &path, trait_name) {
                        return Some(found);
                    }
                }
            }
            None
        }
        fn join(prefix: &str, name: &str) -> String {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            }
        }
        search(&self.roots, "", trait_name)
    }

    /// Deep-merge `patch` into the component's per-trait state.
    pub fn merge_state(&mut self, path: &str, patch: &Map<String, Value>) -> Result<(), DomainError> {
        let component = self.find_mut(path)?;
        merge_dict(&mut component.state, patch);
        Ok(())
    }

    /// The whole tree as JSON, arrays of children rendered as JSON arrays.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (name, child) in &self.roots {
            let value = match child {
                Child::Single(c) => c.to_json(),
                Child::Array(items) => {
                    Value::Array(items.iter().map(Component::to_json).collect())
                }
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }

    /// State of every component, keyed by component path.
    pub fn state_json(&self) -> Value {
        fn collect(children: &BTreeMap<String, Child>, prefix: &str, out: &mut Map<String, Value>) {
            for (name, child) in children {
                let items: Vec<(String, &Component)> = match child {
                    Child::Single(c) => {
                        vec![(format!("{prefix}{name}"), c)]
                    }
                    Child::Array(array) => array
                        .iter()
                        .enumerate()
                        .map(|(i, c)| (format!("{prefix}{name}[{i}]"), c))
                        .collect(),
                };
                for (path, component) in items {
                    if !component.state.is_empty() {
                        out.insert(path.clone(), Value::Object(component.state.clone()));
                    }
                    collect(&component.components, &format!("{path}."), out);
                }
            }
        }
        let mut out = Map::new();
        collect(&self.roots, "", &mut out);
        Value::Object(out)
    }

    fn graft_node(
        &mut self,
        parent_path: &str,
    ) -> Result<&mut BTreeMap<String, Child>, DomainError> {
        if parent_path.is_empty() {
            Ok(&mut self.roots)
        } else {
            Ok(&mut self.find_mut(parent_path)?.components)
        }
    }
}

fn resolve_child<'a>(
    children: &'a BTreeMap<String, Child>,
    segment: &PathSegment,
    walked: &str,
) -> Result<&'a Component, DomainError> {
    let child = children
        .get(&segment.name)
        .ok_or_else(|| DomainError::ComponentNotFound {
            path: walked.to_string(),
            name: segment.name.clone(),
        })?;
    match (child, segment.index) {
        (Child::Single(component), None) => Ok(component),
        (Child::Single(_), Some(_)) => Err(DomainError::NotAnArray(segment.name.clone())),
        (Child::Array(_), None) => Err(DomainError::IndexRequired(segment.name.clone())),
        (Child::Array(items), Some(index)) => {
            items.get(index).ok_or(DomainError::BadIndex {
                name: segment.name.clone(),
                index,
            })
        }
    }
}

fn resolve_child_mut<'a>(
    children: &'a mut BTreeMap<String, Child>,
    segment: &PathSegment,
) -> Result<&'a mut Component, DomainError> {
    let child = children
        .get_mut(&segment.name)
        .ok_or_else(|| DomainError::ComponentNotFound {
            path: String::new(),
            name: segment.name.clone(),
        })?;
    match (child, segment.index) {
        (Child::Single(component), None) => Ok(component),
        (Child::Single(_), Some(_)) => Err(DomainError::NotAnArray(segment.name.clone())),
        (Child::Array(_), None) => Err(DomainError::IndexRequired(segment.name.clone())),
        (Child::Array(items), Some(index)) => {
            items.get_mut(index).ok_or(DomainError::BadIndex {
                name: segment.name.clone(),
                index,
            })
        }
    }
}

/// Recursive dictionary merge: object values merge key-wise, everything else
/// is replaced.
pub fn merge_dict(dest: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Object(d)), Value::Object(s)) => merge_dict(d, s),
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}
