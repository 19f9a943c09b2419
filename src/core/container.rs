//! KL-008: Interpreting executor.
//!
//! Walks definition nodes against a frozen registry and produces live values.
//! Shared definitions are memoized; a resolution stack of in-flight ids turns
//! self-referencing graphs into `CircularDependency` instead of unbounded
//! recursion.

use super::factory::{Arity, Factories};
use super::node::{Callable, MethodCall, Node};
use super::parameters::ParameterError;
use super::registry::{Definition, Registry, RegistryError};
use super::value::Value;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use thiserror::Error;

/// Tag marking console commands.
pub const COMMAND_TAG: &str = "console.command";

/// Failures while building services.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("service '{id}' not found")]
    UnknownService { id: String },

    #[error("circular dependency: {}", .path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("multiple services of type '{type_name}' found: {}", .ids.join(", "))]
    AmbiguousCapability { type_name: String, ids: Vec<String> },

    #[error("no service of type '{type_name}' found")]
    MissingCapability { type_name: String },

    #[error("callable '{name}' is not registered")]
    UnknownCallable { name: String },

    #[error("callable '{callable}' expects {expected} arguments, got {got}")]
    ArityMismatch {
        callable: String,
        expected: Arity,
        got: usize,
    },

    #[error("'{type_name}' has no method '{method}'")]
    UnknownMethod { type_name: String, method: String },

    #[error("cannot call '{method}' on a {found} value")]
    NotAService { method: String, found: &'static str },

    #[error("'{method}' re-entered an object that is already being called")]
    ReentrantCall { method: String },

    #[error("invalid argument for '{callable}': {message}")]
    InvalidArgument { callable: String, message: String },

    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

impl From<RegistryError> for ContainerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownService { id } => Self::UnknownService { id },
            RegistryError::AmbiguousCapability { type_name, ids } => {
                Self::AmbiguousCapability { type_name, ids }
            }
            RegistryError::MissingCapability { type_name } => Self::MissingCapability { type_name },
            RegistryError::Parameter(e) => Self::Parameter(e),
            other => Self::InvalidArgument {
                callable: "registry".to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Registry access surface shared by the interpreter and compiled containers.
pub trait Lookup {
    fn get(&self, id: &str) -> Result<Value, ContainerError>;

    fn has(&self, id: &str) -> bool;

    /// `(id, attrs)` for every public service carrying `tag`.
    fn tagged(&self, tag: &str) -> Vec<(String, Value)>;

    /// Ids of public services declaring `type_name`.
    fn ids_by_type(&self, type_name: &str) -> Vec<String>;

    fn parameter(&self, key: &str) -> Result<Value, ContainerError>;

    /// The only public service declaring `type_name`.
    fn unique_by_type(&self, type_name: &str) -> Result<String, ContainerError> {
        let mut ids = self.ids_by_type(type_name);
        match ids.len() {
            0 => Err(ContainerError::MissingCapability {
                type_name: type_name.to_string(),
            }),
            1 => Ok(ids.remove(0)),
            _ => Err(ContainerError::AmbiguousCapability {
                type_name: type_name.to_string(),
                ids,
            }),
        }
    }

    /// Ids tagged as console commands, in registration order.
    fn commands(&self) -> Vec<String> {
        self.tagged(COMMAND_TAG).into_iter().map(|(id, _)| id).collect()
    }

    fn get_by_type(&self, type_name: &str) -> Result<Value, ContainerError> {
        let id = self.unique_by_type(type_name)?;
        self.get(&id)
    }

    /// Map every service declaring `type_name` through `f`.
    fn find_by<T, F>(&self, type_name: &str, f: F) -> Vec<T>
    where
        Self: Sized,
        F: FnMut(&str) -> T,
    {
        let ids = self.ids_by_type(type_name);
        ids.iter().map(|id| id.as_str()).map(f).collect()
    }
}

/// Ids currently being built, innermost last.
#[derive(Debug, Default)]
pub struct ResolutionStack {
    ids: RefCell<Vec<String>>,
}

/// Pops its id from the stack when dropped.
pub struct StackGuard<'a> {
    stack: &'a ResolutionStack,
}

impl ResolutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `id`, failing with the full cycle path if it is already in flight.
    pub fn enter(&self, id: &str) -> Result<StackGuard<'_>, ContainerError> {
        let mut ids = self.ids.borrow_mut();
        if let Some(start) = ids.iter().position(|x| x == id) {
            let mut path: Vec<String> = ids[start..].to_vec();
            path.push(id.to_string());
            return Err(ContainerError::CircularDependency { path });
        }
        ids.push(id.to_string());
        Ok(StackGuard { stack: self })
    }

    pub fn depth(&self) -> usize {
        self.ids.borrow().len()
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.stack.ids.borrow_mut().pop();
    }
}

/// Live-instance container over a frozen registry.
pub struct Container {
    registry: Registry,
    factories: Factories,
    instances: RefCell<FxHashMap<String, Value>>,
    stack: ResolutionStack,
}

impl Container {
    /// Freeze `registry` (if needed) and substitute parameters in every node.
    pub fn new(mut registry: Registry, factories: Factories) -> Result<Self, ContainerError> {
        registry.freeze()?;
        let ids: Vec<String> = registry.definitions().map(|d| d.id.clone()).collect();
        let parameters = registry.parameters().clone();
        for id in ids {
            if let Some(definition) = registry.definition(&id) {
                let root = definition.root.substitute(&parameters)?;
                let setup = definition
                    .setup
                    .iter()
                    .map(|call| {
                        Ok(MethodCall::new(
                            call.method.clone(),
                            super::node::substitute_all(&call.args, &parameters)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, ParameterError>>()?;
                registry.replace_nodes(&id, root, setup);
            }
        }
        Ok(Self {
            registry,
            factories,
            instances: RefCell::new(FxHashMap::default()),
            stack: ResolutionStack::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn public_definition(&self, id: &str) -> Option<&Definition> {
        self.registry.definition(id).filter(|d| d.public)
    }

    /// Build `id` regardless of visibility.
    fn resolve(&self, id: &str) -> Result<Value, ContainerError> {
        if let Some(value) = self.instances.borrow().get(id) {
            return Ok(value.clone());
        }
        let definition = self
            .registry
            .definition(id)
            .ok_or_else(|| ContainerError::UnknownService { id: id.to_string() })?;

        let _guard = self.stack.enter(id)?;
        tracing::debug!(service = id, "building service");
        let value = self.evaluate(&definition.root)?;
        for call in &definition.setup {
            let args = self.evaluate_all(&call.args)?;
            value.invoke(&call.method, args)?;
        }
        if definition.shared {
            self.instances
                .borrow_mut()
                .insert(id.to_string(), value.clone());
        }
        Ok(value)
    }

    fn evaluate_all(&self, nodes: &[Node]) -> Result<Vec<Value>, ContainerError> {
        nodes.iter().map(|n| self.evaluate(n)).collect()
    }

    /// Evaluate one node to a value.
    pub fn evaluate(&self, node: &Node) -> Result<Value, ContainerError> {
        match node {
            Node::Literal(value) => Ok(value.clone()),
            Node::Parameter(key) => Ok(self.registry.parameters().get(key)?),
            Node::Reference { id, optional } => {
                if *optional && !self.registry.has(id) {
                    Ok(Value::Null)
                } else {
                    self.resolve(id)
                }
            }
            Node::Statement(statement) => {
                let args = self.evaluate_all(&statement.args)?;
                let mut value = match &statement.callable {
                    Callable::Named(name) => self.factories.invoke(self, name, args)?,
                    Callable::Method(target, method) => {
                        self.evaluate(target)?.invoke(method, args)?
                    }
                    Callable::Array => Value::List(args),
                    Callable::Record(keys) => {
                        Value::Map(keys.iter().cloned().zip(args).collect::<IndexMap<_, _>>())
                    }
                };
                for call in &statement.calls {
                    let args = self.evaluate_all(&call.args)?;
                    value = value.fluent(&call.method, args)?;
                }
                Ok(value)
            }
        }
    }
}

impl Lookup for Container {
    fn get(&self, id: &str) -> Result<Value, ContainerError> {
        if self.public_definition(id).is_none() {
            return Err(ContainerError::UnknownService { id: id.to_string() });
        }
        self.resolve(id)
    }

    fn has(&self, id: &str) -> bool {
        self.public_definition(id).is_some()
    }

    fn tagged(&self, tag: &str) -> Vec<(String, Value)> {
        self.registry
            .tagged(tag)
            .into_iter()
            .filter(|(id, _)| self.has(id))
            .collect()
    }

    fn ids_by_type(&self, type_name: &str) -> Vec<String> {
        self.registry
            .by_type(type_name)
            .into_iter()
            .filter(|id| self.has(id))
            .collect()
    }

    fn parameter(&self, key: &str) -> Result<Value, ContainerError> {
        Ok(self.registry.parameters().get(key)?)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("services", &self.registry.len())
            .field("instantiated", &self.instances.borrow().len())
            .finish()
    }
}
