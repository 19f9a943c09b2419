//! KL-004: Expression nodes describing how to build a value.
//!
//! Pure data shared by the interpreting and the compiling executor. The tag
//! set is closed: literal, parameter, reference, statement. Composite values
//! holding references (`[@a, @b]`) are statements with the built-in
//! [`Callable::Array`] / [`Callable::Record`] callables.

use super::parameters::{ParameterError, Parameters};
use super::value::Value;

/// What a statement invokes.
#[derive(Debug, Clone, PartialEq)]
pub enum Callable {
    /// A constructor or function registered in `Factories`.
    Named(String),
    /// A method on another evaluated node (`@factory::create`).
    Method(Box<Node>, String),
    /// Collect the arguments into a list.
    Array,
    /// Zip the given keys with the arguments into a map.
    Record(Vec<String>),
}

/// One method call applied after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub args: Vec<Node>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Vec<Node>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Invocation with evaluated arguments, optionally followed by fluent calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub callable: Callable,
    pub args: Vec<Node>,
    pub calls: Vec<MethodCall>,
}

impl Statement {
    pub fn new(callable: impl Into<String>, args: Vec<Node>) -> Self {
        Self {
            callable: Callable::Named(callable.into()),
            args,
            calls: Vec::new(),
        }
    }

    /// Append a fluent call.
    pub fn call(mut self, method: impl Into<String>, args: Vec<Node>) -> Self {
        self.calls.push(MethodCall::new(method, args));
        self
    }
}

/// A buildable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Value),
    Parameter(String),
    Reference { id: String, optional: bool },
    Statement(Box<Statement>),
}

impl Node {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn parameter(key: impl Into<String>) -> Self {
        Self::Parameter(key.into())
    }

    pub fn reference(id: impl Into<String>) -> Self {
        Self::Reference {
            id: id.into(),
            optional: false,
        }
    }

    /// Reference that yields `Null` when the id is absent.
    pub fn optional(id: impl Into<String>) -> Self {
        Self::Reference {
            id: id.into(),
            optional: true,
        }
    }

    pub fn statement(statement: Statement) -> Self {
        Self::Statement(Box::new(statement))
    }

    /// Shorthand for `Statement::new(callable, args)`.
    pub fn create(callable: impl Into<String>, args: Vec<Node>) -> Self {
        Self::statement(Statement::new(callable, args))
    }

    pub fn array(items: Vec<Node>) -> Self {
        Self::statement(Statement {
            callable: Callable::Array,
            args: items,
            calls: Vec::new(),
        })
    }

    pub fn record(entries: Vec<(String, Node)>) -> Self {
        let (keys, args): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        Self::statement(Statement {
            callable: Callable::Record(keys),
            args,
            calls: Vec::new(),
        })
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Replace every `Parameter` node by the literal it resolves to and
    /// expand `%key%` references embedded in literal strings.
    pub fn substitute(&self, parameters: &Parameters) -> Result<Node, ParameterError> {
        match self {
            Self::Literal(value) => Ok(Self::Literal(parameters.expand(value)?)),
            Self::Parameter(key) => Ok(Self::Literal(parameters.get(key)?)),
            Self::Reference { .. } => Ok(self.clone()),
            Self::Statement(statement) => {
                let callable = match &statement.callable {
                    Callable::Method(target, method) => {
                        Callable::Method(Box::new(target.substitute(parameters)?), method.clone())
                    }
                    other => other.clone(),
                };
                Ok(Self::statement(Statement {
                    callable,
                    args: substitute_all(&statement.args, parameters)?,
                    calls: statement
                        .calls
                        .iter()
                        .map(|call| {
                            Ok(MethodCall {
                                method: call.method.clone(),
                                args: substitute_all(&call.args, parameters)?,
                            })
                        })
                        .collect::<Result<Vec<_>, ParameterError>>()?,
                }))
            }
        }
    }

    /// Ids of every definition this node refers to, in visit order.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Literal(_) | Self::Parameter(_) => {}
            Self::Reference { id, .. } => out.push(id),
            Self::Statement(statement) => {
                if let Callable::Method(target, _) = &statement.callable {
                    target.collect_references(out);
                }
                for arg in &statement.args {
                    arg.collect_references(out);
                }
                for call in &statement.calls {
                    for arg in &call.args {
                        arg.collect_references(out);
                    }
                }
            }
        }
    }
}

pub(crate) fn substitute_all(
    nodes: &[Node],
    parameters: &Parameters,
) -> Result<Vec<Node>, ParameterError> {
    nodes.iter().map(|n| n.substitute(parameters)).collect()
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}
