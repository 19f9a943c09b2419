//! KL-002: Callable table for `Statement` nodes.
//!
//! A callable is any name an extension chooses (`"Router"`,
//! `"Router::create"`, `"mailer.smtp"`). Each maps to a Rust closure that
//! receives the registry access surface and the evaluated arguments, so a
//! constructor may look up other services while it runs.

use super::container::{ContainerError, Lookup};
use super::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

/// Constructor signature.
pub type FactoryFn = dyn Fn(&dyn Lookup, Vec<Value>) -> Result<Value, ContainerError>;

/// Number of arguments a callable accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Any,
    Exact(usize),
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Self::Any => true,
            Self::Exact(k) => n == k,
            Self::Range(lo, hi) => n >= lo && n <= hi,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any number of"),
            Self::Exact(k) => write!(f, "{}", k),
            Self::Range(lo, hi) => write!(f, "{}..={}", lo, hi),
        }
    }
}

#[derive(Clone)]
struct Entry {
    arity: Arity,
    build: Rc<FactoryFn>,
}

/// Named constructors available to both executors.
#[derive(Clone, Default)]
pub struct Factories {
    table: IndexMap<String, Entry>,
}

impl Factories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable accepting any number of arguments.
    pub fn register<F>(&mut self, name: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(&dyn Lookup, Vec<Value>) -> Result<Value, ContainerError> + 'static,
    {
        self.register_with_arity(name, Arity::Any, build)
    }

    /// Register a callable with an argument count check.
    pub fn register_with_arity<F>(
        &mut self,
        name: impl Into<String>,
        arity: Arity,
        build: F,
    ) -> &mut Self
    where
        F: Fn(&dyn Lookup, Vec<Value>) -> Result<Value, ContainerError> + 'static,
    {
        self.table.insert(
            name.into(),
            Entry {
                arity,
                build: Rc::new(build),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn arity(&self, name: &str) -> Option<Arity> {
        self.table.get(name).map(|e| e.arity)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    /// Call `name` with already evaluated arguments.
    pub fn invoke(
        &self,
        lookup: &dyn Lookup,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ContainerError> {
        let entry = self
            .table
            .get(name)
            .ok_or_else(|| ContainerError::UnknownCallable {
                name: name.to_string(),
            })?;
        if !entry.arity.accepts(args.len()) {
            return Err(ContainerError::ArityMismatch {
                callable: name.to_string(),
                expected: entry.arity,
                got: args.len(),
            });
        }
        (entry.build)(lookup, args)
    }

    /// Re-create a service from its exported structure by calling the
    /// constructor registered under its type name.
    pub fn revive(
        &self,
        lookup: &dyn Lookup,
        type_name: &str,
        state: Value,
    ) -> Result<Value, ContainerError> {
        self.invoke(lookup, type_name, vec![state])
    }
}

impl fmt::Debug for Factories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.table.keys()).finish()
    }
}
