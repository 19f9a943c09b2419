//! KL-005: Definition registry.
//!
//! Definitions, parameters, named pipelines and route collections live here
//! and are mutated only while extensions register and boot. `freeze` ends
//! that window; executors only ever see a frozen registry.

use super::collection::CollectionAssembler;
use super::node::{MethodCall, Node};
use super::parameters::{ParameterError, Parameters};
use super::pipeline::Pipeline;
use super::value::Value;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Registry mutation and lookup failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{id}' is already defined")]
    DuplicateService { id: String },

    #[error("service '{id}' not found")]
    UnknownService { id: String },

    #[error("registry is frozen; cannot {action}")]
    Frozen { action: String },

    #[error("multiple services of type '{type_name}' found: {}", .ids.join(", "))]
    AmbiguousCapability { type_name: String, ids: Vec<String> },

    #[error("no service of type '{type_name}' found")]
    MissingCapability { type_name: String },

    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

/// A named recipe for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub id: String,
    pub root: Node,
    /// Evaluated at most once per container.
    pub shared: bool,
    /// Capability types, drives `find_by`.
    pub types: BTreeSet<String>,
    /// Tag name → attributes, drives `tagged`.
    pub tags: IndexMap<String, Value>,
    pub public: bool,
    /// Post-construction calls; results are discarded.
    pub setup: Vec<MethodCall>,
    /// Alias of the extension that registered it.
    pub origin: Option<String>,
}

impl Definition {
    pub fn new(id: impl Into<String>, root: Node) -> Self {
        Self {
            id: id.into(),
            root,
            shared: true,
            types: BTreeSet::new(),
            tags: IndexMap::new(),
            public: true,
            setup: Vec::new(),
            origin: None,
        }
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn private(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.types.insert(type_name.into());
        self
    }

    pub fn tag(mut self, name: impl Into<String>, attrs: Value) -> Self {
        self.tags.insert(name.into(), attrs);
        self
    }

    pub fn setup(mut self, method: impl Into<String>, args: Vec<Node>) -> Self {
        self.setup.push(MethodCall::new(method, args));
        self
    }

    /// Every id this definition depends on, including setup arguments.
    pub fn references(&self) -> Vec<&str> {
        let mut out = self.root.references();
        for call in &self.setup {
            for arg in &call.args {
                out.extend(arg.references());
            }
        }
        out
    }
}

/// The mutable graph description handed to every extension.
#[derive(Debug, Default)]
pub struct Registry {
    definitions: IndexMap<String, Definition>,
    parameters: Parameters,
    pipelines: IndexMap<String, Pipeline>,
    collections: CollectionAssembler,
    origin: Option<String>,
    extension_order: Vec<String>,
    frozen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters(parameters: Parameters) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    fn ensure_open(&self, action: &str) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen {
                action: action.to_string(),
            });
        }
        Ok(())
    }

    /// Alias stamped on definitions added from now on.
    pub(crate) fn set_origin(&mut self, alias: Option<&str>) {
        self.origin = alias.map(str::to_string);
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub(crate) fn set_extension_order(&mut self, order: Vec<String>) {
        self.extension_order = order;
    }

    /// Aliases of the extensions populating this registry, in boot order.
    pub fn extension_order(&self) -> &[String] {
        &self.extension_order
    }

    /// Add a definition. Ids are unique.
    pub fn add(&mut self, mut definition: Definition) -> Result<&mut Definition, RegistryError> {
        self.ensure_open(&format!("add '{}'", definition.id))?;
        if self.definitions.contains_key(&definition.id) {
            return Err(RegistryError::DuplicateService {
                id: definition.id,
            });
        }
        if definition.origin.is_none() {
            definition.origin = self.origin.clone();
        }
        let id = definition.id.clone();
        let entry = self.definitions.entry(id).or_insert(definition);
        Ok(entry)
    }

    pub fn has(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    pub fn definition(&self, id: &str) -> Option<&Definition> {
        self.definitions.get(id)
    }

    /// Mutable access, e.g. to add setup calls during boot.
    pub fn definition_mut(&mut self, id: &str) -> Result<&mut Definition, RegistryError> {
        self.ensure_open(&format!("modify '{}'", id))?;
        self.definitions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownService { id: id.to_string() })
    }

    /// Swap in parameter-substituted nodes. Allowed on a frozen registry.
    pub(crate) fn replace_nodes(&mut self, id: &str, root: Node, setup: Vec<MethodCall>) {
        if let Some(definition) = self.definitions.get_mut(id) {
            definition.root = root;
            definition.setup = setup;
        }
    }

    pub fn remove(&mut self, id: &str) -> Result<Definition, RegistryError> {
        self.ensure_open(&format!("remove '{}'", id))?;
        self.definitions
            .shift_remove(id)
            .ok_or_else(|| RegistryError::UnknownService { id: id.to_string() })
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// `(id, attrs)` of every definition carrying `tag`, in registration order.
    pub fn tagged(&self, tag: &str) -> Vec<(String, Value)> {
        self.definitions
            .values()
            .filter_map(|d| d.tags.get(tag).map(|attrs| (d.id.clone(), attrs.clone())))
            .collect()
    }

    /// Ids of every definition declaring `type_name`.
    pub fn by_type(&self, type_name: &str) -> Vec<String> {
        self.definitions
            .values()
            .filter(|d| d.types.contains(type_name))
            .map(|d| d.id.clone())
            .collect()
    }

    /// The single definition declaring `type_name`.
    pub fn unique_by_type(&self, type_name: &str) -> Result<String, RegistryError> {
        let mut ids = self.by_type(type_name);
        match ids.len() {
            0 => Err(RegistryError::MissingCapability {
                type_name: type_name.to_string(),
            }),
            1 => Ok(ids.remove(0)),
            _ => Err(RegistryError::AmbiguousCapability {
                type_name: type_name.to_string(),
                ids,
            }),
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> Result<&mut Parameters, RegistryError> {
        self.ensure_open("change parameters")?;
        Ok(&mut self.parameters)
    }

    /// Expanded parameter value.
    pub fn parameter(&self, key: &str) -> Result<Value, RegistryError> {
        Ok(self.parameters.get(key)?)
    }

    /// Named pipeline, created on first access.
    pub fn pipeline(&mut self, name: &str) -> Result<&mut Pipeline, RegistryError> {
        self.ensure_open(&format!("change pipeline '{}'", name))?;
        Ok(self
            .pipelines
            .entry(name.to_string())
            .or_insert_with(|| Pipeline::new(name)))
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    pub fn collections(&self) -> &CollectionAssembler {
        &self.collections
    }

    pub fn collections_mut(&mut self) -> Result<&mut CollectionAssembler, RegistryError> {
        self.ensure_open("change route collections")?;
        Ok(&mut self.collections)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Expand parameters to a fixed point and stop accepting changes.
    pub fn freeze(&mut self) -> Result<(), RegistryError> {
        if self.frozen {
            return Ok(());
        }
        self.parameters = self.parameters.resolve()?;
        self.frozen = true;
        self.origin = None;
        Ok(())
    }
}
