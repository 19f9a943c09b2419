//! KL-001: Runtime values produced by both executors.
//!
//! Plain data (scalars, lists, maps) round-trips through YAML. Live objects
//! are wrapped in [`Value::Service`] and compared by identity, so a shared
//! definition resolved twice yields two `Value`s that are `==`.

use super::container::ContainerError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A live object constructed by a factory.
///
/// `call` backs fluent `Statement` calls and `setup` bindings. `export`
/// returns the structural state used when a service has to be rendered as a
/// literal in generated source.
pub trait Service: Any {
    /// Name used for error messages and for `Factories::revive`.
    fn type_name(&self) -> &str;

    /// Invoke a method by name.
    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ContainerError> {
        let _ = args;
        Err(ContainerError::UnknownMethod {
            type_name: self.type_name().to_string(),
            method: method.to_string(),
        })
    }

    /// Structural state of this object.
    fn export(&self) -> Value {
        Value::Null
    }

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a live object.
pub type ServiceRef = Rc<RefCell<dyn Service>>;

/// A value built from a node tree.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    #[serde(skip)]
    Service(ServiceRef),
}

impl Value {
    /// Wrap a concrete object.
    pub fn service<T: Service>(object: T) -> Self {
        Self::Service(Rc::new(RefCell::new(object)))
    }

    /// Build a map value from key/value pairs, preserving order.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn empty_map() -> Self {
        Self::Map(IndexMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Field of a map value, `None` for anything else.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Short label of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Service(_) => "service",
        }
    }

    /// String form used when a scalar is interpolated into a larger string.
    /// Lists, maps and services have none.
    pub fn to_interpolated(&self) -> Option<String> {
        match self {
            Self::Null => Some(String::new()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(n) => Some(n.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Str(s) => Some(s.clone()),
            Self::List(_) | Self::Map(_) | Self::Service(_) => None,
        }
    }

    /// True when both values hold the very same live object.
    pub fn same_instance(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Service(a), Self::Service(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            _ => false,
        }
    }

    /// Borrow the wrapped object as `T`, if it is one.
    pub fn with_service<T: Service, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match self {
            Self::Service(object) => {
                let guard = object.try_borrow().ok()?;
                guard.as_any().downcast_ref::<T>().map(f)
            }
            _ => None,
        }
    }

    /// Call `method` on the wrapped object and return its result.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ContainerError> {
        let object = match self {
            Self::Service(object) => object,
            other => {
                return Err(ContainerError::NotAService {
                    method: method.to_string(),
                    found: other.kind(),
                })
            }
        };
        let mut guard = object.try_borrow_mut().map_err(|_| ContainerError::ReentrantCall {
            method: method.to_string(),
        })?;
        guard.call(method, args)
    }

    /// Builder-style call: the result becomes the next receiver unless the
    /// method returned `Null`, in which case the receiver is kept.
    pub fn fluent(self, method: &str, args: Vec<Value>) -> Result<Value, ContainerError> {
        let result = self.invoke(method, args)?;
        if result.is_null() {
            Ok(self)
        } else {
            Ok(result)
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Service(_), Self::Service(_)) => self.same_instance(other),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Int(n) => write!(f, "Int({})", n),
            Self::Float(x) => write!(f, "Float({:?})", x),
            Self::Str(s) => write!(f, "Str({:?})", s),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(map) => f.debug_map().entries(map).finish(),
            Self::Service(object) => match object.try_borrow() {
                Ok(guard) => write!(f, "Service({})", guard.type_name()),
                Err(_) => write!(f, "Service(<borrowed>)"),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self::Map(map)
    }
}
