//! KL-016: YAML application config loading and validation.
//!
//! An application file carries `parameters`, `includes` (glob patterns
//! relative to the file) and one block per extension alias. Included files
//! are merged first in sorted order; the including file overrides them.
//!
//! Strings inside service declarations follow a small convention:
//! - `@id` references a service, `@?id` references it optionally
//! - `@@text` is the literal `@text`
//! - `%key%` (the whole string) is a parameter lookup
//! - `@id::method` as `create` calls `method` on another service

use super::node::{Callable, MethodCall, Node, Statement};
use super::parameters::deep_merge;
use super::registry::Definition;
use super::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config loading failures.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error in {origin}: {message}")]
    Yaml { origin: String, message: String },

    #[error("invalid include pattern '{pattern}': {message}")]
    Glob { pattern: String, message: String },

    #[error("include cycle through {}", .path.display())]
    IncludeCycle { path: PathBuf },

    #[error("service '{id}': {message}")]
    InvalidService { id: String, message: String },
}

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parsed application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    /// Extension blocks keyed by alias.
    #[serde(flatten)]
    pub sections: IndexMap<String, Value>,
    /// Files that contributed, in load order.
    #[serde(skip)]
    pub sources: Vec<PathBuf>,
}

impl AppConfig {
    /// Merge `other` over `self`.
    pub fn merge(&mut self, other: AppConfig) {
        deep_merge(&mut self.parameters, other.parameters);
        deep_merge(&mut self.sections, other.sections);
        self.sources.extend(other.sources);
    }

    pub fn section(&self, alias: &str) -> Option<&Value> {
        self.sections.get(alias)
    }
}

/// Parse a config from a string. `includes` are not expanded.
pub fn parse_config(yaml: &str) -> Result<AppConfig, LoadError> {
    parse_named(yaml, "<string>")
}

fn parse_named(yaml: &str, origin: &str) -> Result<AppConfig, LoadError> {
    if yaml.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| LoadError::Yaml {
        origin: origin.to_string(),
        message: e.to_string(),
    })
}

/// Load a config file and everything it includes.
pub fn load_config(path: &Path) -> Result<AppConfig, LoadError> {
    let mut stack = HashSet::new();
    load_recursive(path, &mut stack)
}

fn load_recursive(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<AppConfig, LoadError> {
    let canonical = path.canonicalize().map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !stack.insert(canonical.clone()) {
        return Err(LoadError::IncludeCycle { path: canonical });
    }
    let content = std::fs::read_to_string(&canonical).map_err(|source| LoadError::Io {
        path: canonical.clone(),
        source,
    })?;
    let mut own = parse_named(&content, &canonical.display().to_string())?;
    own.sources.push(canonical.clone());

    let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut merged = AppConfig::default();
    for pattern in std::mem::take(&mut own.includes) {
        let full = base.join(&pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full).map_err(|e| LoadError::Glob {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        let mut files = paths
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LoadError::Glob {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        files.sort();
        for file in files {
            tracing::debug!(include = %file.display(), "loading include");
            merged.merge(load_recursive(&file, stack)?);
        }
    }
    merged.merge(own);
    stack.remove(&canonical);
    Ok(merged)
}

/// Turn a config value into a node.
pub fn value_to_node(value: &Value) -> Node {
    match value {
        Value::Str(s) => string_to_node(s),
        Value::List(items) => {
            let nodes: Vec<Node> = items.iter().map(value_to_node).collect();
            if nodes.iter().all(Node::is_literal) {
                Node::Literal(Value::List(nodes.into_iter().map(literal_of).collect()))
            } else {
                Node::array(nodes)
            }
        }
        Value::Map(map) => {
            let entries: Vec<(String, Node)> = map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_node(v)))
                .collect();
            if entries.iter().all(|(_, n)| n.is_literal()) {
                Node::Literal(Value::Map(
                    entries.into_iter().map(|(k, n)| (k, literal_of(n))).collect(),
                ))
            } else {
                Node::record(entries)
            }
        }
        other => Node::Literal(other.clone()),
    }
}

fn literal_of(node: Node) -> Value {
    match node {
        Node::Literal(value) => value,
        _ => Value::Null,
    }
}

fn whole_parameter(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('%')?.strip_suffix('%')?;
    let valid = !inner.is_empty()
        && inner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    valid.then_some(inner)
}

fn string_to_node(s: &str) -> Node {
    if let Some(rest) = s.strip_prefix("@@") {
        return Node::literal(format!("@{}", rest));
    }
    if let Some(id) = s.strip_prefix("@?") {
        return Node::optional(id);
    }
    if let Some(id) = s.strip_prefix('@') {
        if !id.is_empty() {
            return Node::reference(id);
        }
    }
    if let Some(key) = whole_parameter(s) {
        return Node::parameter(key);
    }
    Node::literal(s)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CallDecl {
    method: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TagDecl {
    Name(String),
    WithAttrs(IndexMap<String, Value>),
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceDecl {
    #[serde(default)]
    create: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    /// Fluent calls whose results replace the receiver.
    #[serde(default)]
    calls: Vec<CallDecl>,
    /// Calls on the finished instance; results are discarded.
    #[serde(default)]
    setup: Vec<CallDecl>,
    #[serde(default, rename = "type")]
    types: Vec<String>,
    #[serde(default)]
    tags: Vec<TagDecl>,
    #[serde(default = "yes")]
    shared: bool,
    #[serde(default = "yes")]
    public: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ServiceEntry {
    /// `id: Callable` shorthand.
    Short(String),
    Full(ServiceDecl),
}

fn calls_of(decls: &[CallDecl]) -> Vec<MethodCall> {
    decls
        .iter()
        .map(|c| MethodCall::new(c.method.clone(), c.arguments.iter().map(value_to_node).collect()))
        .collect()
}

fn build_definition(id: &str, decl: ServiceDecl) -> Result<Definition, LoadError> {
    let invalid = |message: &str| LoadError::InvalidService {
        id: id.to_string(),
        message: message.to_string(),
    };
    let create = decl.create.as_deref().unwrap_or(id);
    let args: Vec<Node> = decl.arguments.iter().map(value_to_node).collect();
    let calls = calls_of(&decl.calls);

    let root = match create.strip_prefix('@') {
        Some(target) => match target.split_once("::") {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                let receiver = Box::new(Node::reference(service));
                Node::statement(Statement {
                    callable: Callable::Method(receiver, method.to_string()),
                    args,
                    calls,
                })
            }
            Some(_) => return Err(invalid("'create' must be '@service::method'")),
            None if args.is_empty() && calls.is_empty() && !target.is_empty() => {
                Node::reference(target)
            }
            None => return Err(invalid("an alias ('@id') takes no arguments or calls")),
        },
        None if create.is_empty() => return Err(invalid("'create' must not be empty")),
        None => Node::statement(Statement {
            callable: Callable::Named(create.to_string()),
            args,
            calls,
        }),
    };

    let mut definition = Definition::new(id, root).shared(decl.shared);
    definition.public = decl.public;
    definition.setup = calls_of(&decl.setup);
    for type_name in decl.types {
        definition.types.insert(type_name);
    }
    for tag in decl.tags {
        match tag {
            TagDecl::Name(name) => {
                definition.tags.insert(name, Value::Null);
            }
            TagDecl::WithAttrs(map) => {
                for (name, attrs) in map {
                    definition.tags.insert(name, attrs);
                }
            }
        }
    }
    Ok(definition)
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, String> {
    let yaml = serde_yaml_ng::to_value(value).map_err(|e| e.to_string())?;
    serde_yaml_ng::from_value(yaml).map_err(|e| e.to_string())
}

/// Definitions declared in a `services` block, in declaration order.
pub fn service_definitions(section: &Value) -> Result<Vec<Definition>, LoadError> {
    let map = match section {
        Value::Null => return Ok(Vec::new()),
        Value::Map(map) => map,
        other => {
            return Err(LoadError::InvalidService {
                id: "services".to_string(),
                message: format!("expected a map of service declarations, found {}", other.kind()),
            })
        }
    };
    let mut out = Vec::with_capacity(map.len());
    for (id, raw) in map {
        let entry: ServiceEntry = decode(raw).map_err(|message| LoadError::InvalidService {
            id: id.clone(),
            message,
        })?;
        let decl = match entry {
            ServiceEntry::Short(create) => ServiceDecl {
                create: Some(create),
                arguments: Vec::new(),
                calls: Vec::new(),
                setup: Vec::new(),
                types: Vec::new(),
                tags: Vec::new(),
                shared: true,
                public: true,
            },
            ServiceEntry::Full(decl) => decl,
        };
        out.push(build_definition(id, decl)?);
    }
    Ok(out)
}

/// Validate a parsed config without assembling it. Returns a list of errors
/// (empty = valid).
pub fn validate_config(config: &AppConfig, known_sections: &[&str]) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for alias in config.sections.keys() {
        if !known_sections.contains(&alias.as_str()) {
            errors.push(ValidationError {
                message: format!("unknown section '{}'", alias),
            });
        }
    }

    let definitions = match config.section("services").map(service_definitions) {
        Some(Ok(definitions)) => definitions,
        Some(Err(e)) => {
            errors.push(ValidationError {
                message: e.to_string(),
            });
            Vec::new()
        }
        None => Vec::new(),
    };
    let ids: HashSet<&str> = definitions.iter().map(|d| d.id.as_str()).collect();
    for definition in &definitions {
        for reference in definition_required_refs(definition) {
            if !ids.contains(reference) {
                errors.push(ValidationError {
                    message: format!(
                        "service '{}' references unknown service '{}'",
                        definition.id, reference
                    ),
                });
            }
        }
    }

    let parameters = super::parameters::Parameters::new(config.parameters.clone());
    if let Err(e) = parameters.resolve() {
        errors.push(ValidationError {
            message: format!("parameters: {}", e),
        });
    }

    errors
}

fn definition_required_refs(definition: &Definition) -> Vec<&str> {
    fn walk<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
        match node {
            Node::Reference { id, optional: false } => out.push(id),
            Node::Statement(st) => {
                if let Callable::Method(target, _) = &st.callable {
                    walk(target, out);
                }
                st.args.iter().for_each(|a| walk(a, out));
                st.calls.iter().flat_map(|c| &c.args).for_each(|a| walk(a, out));
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(&definition.root, &mut out);
    definition.setup.iter().flat_map(|c| &c.args).for_each(|a| walk(a, &mut out));
    out
}
