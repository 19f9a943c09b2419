//! KL-010: Extension resolver and two-phase lifecycle.
//!
//! Extensions name their dependencies by alias only. The resolver orders them
//! depth-first (dependencies before dependents, otherwise input order), pulling
//! in missing dependencies from an [`ExtensionCatalog`]. Every `register` runs
//! before the first `boot`, both in that fixed order.

use super::loader::LoadError;
use super::parameters::ParameterError;
use super::pipeline::PipelineError;
use super::registry::{Registry, RegistryError};
use super::schema::{ConfigSchema, SchemaError};
use super::value::Value;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt;
use thiserror::Error;

/// Lifecycle phase, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Register,
    Boot,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => f.write_str("register"),
            Self::Boot => f.write_str("boot"),
        }
    }
}

/// Extension resolution and lifecycle failures.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("cyclic extension dependency: {}", .cycle.join(" -> "))]
    CyclicExtensionDependency { cycle: Vec<String> },

    #[error("extension '{required_by}' depends on '{alias}', which is not available")]
    MissingExtension { alias: String, required_by: String },

    #[error("extension '{alias}' is listed more than once")]
    DuplicateExtension { alias: String },

    #[error("invalid configuration for '{alias}': {source}")]
    InvalidConfig {
        alias: String,
        #[source]
        source: SchemaError,
    },

    #[error("configuration section '{alias}' has no matching extension")]
    UnknownSection { alias: String },

    #[error("cannot {attempted} while the lifecycle is {state}")]
    OutOfPhase {
        attempted: &'static str,
        state: &'static str,
    },

    #[error("extension '{alias}' failed during {phase}: {source}")]
    Failed {
        alias: String,
        phase: Phase,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("{0}")]
    Custom(String),
}

impl ExtensionError {
    /// Alias of the extension that raised this error, if known.
    pub fn alias(&self) -> Option<&str> {
        match self {
            Self::Failed { alias, .. } | Self::InvalidConfig { alias, .. } => Some(alias),
            Self::MissingExtension { required_by, .. } => Some(required_by),
            _ => None,
        }
    }
}

/// A dependency on another extension.
#[derive(Debug, Clone, PartialEq)]
pub enum Dependency {
    Alias(String),
    /// Instantiate from the catalog with these constructor arguments if the
    /// extension was not supplied.
    WithArgs { alias: String, args: Value },
}

impl Dependency {
    pub fn alias(&self) -> &str {
        match self {
            Self::Alias(alias) | Self::WithArgs { alias, .. } => alias,
        }
    }

    fn args(&self) -> Value {
        match self {
            Self::Alias(_) => Value::Null,
            Self::WithArgs { args, .. } => args.clone(),
        }
    }
}

impl From<&str> for Dependency {
    fn from(alias: &str) -> Self {
        Self::Alias(alias.to_string())
    }
}

/// A self-contained configuration module.
pub trait Extension {
    fn alias(&self) -> &str;

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Shape of this extension's configuration block.
    fn config_schema(&self) -> Option<ConfigSchema> {
        None
    }

    /// Create definitions, pipeline entries and group references.
    fn register(&mut self, registry: &mut Registry, config: &Value) -> Result<(), ExtensionError>;

    /// Runs after every extension has registered.
    fn boot(&mut self, registry: &mut Registry) -> Result<(), ExtensionError> {
        let _ = registry;
        Ok(())
    }
}

impl fmt::Debug for dyn Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extension({})", self.alias())
    }
}

pub type ExtensionCtor = dyn Fn(Value) -> Result<Box<dyn Extension>, ExtensionError>;

/// Constructors for extensions that may be pulled in as dependencies.
#[derive(Default)]
pub struct ExtensionCatalog {
    ctors: IndexMap<String, Box<ExtensionCtor>>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, alias: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Box<dyn Extension>, ExtensionError> + 'static,
    {
        self.ctors.insert(alias.into(), Box::new(ctor));
        self
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.ctors.contains_key(alias)
    }

    pub fn instantiate(
        &self,
        alias: &str,
        args: Value,
    ) -> Option<Result<Box<dyn Extension>, ExtensionError>> {
        self.ctors.get(alias).map(|ctor| ctor(args))
    }
}

impl fmt::Debug for ExtensionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ctors.keys()).finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Sorter<'a> {
    catalog: &'a ExtensionCatalog,
    pool: IndexMap<String, Box<dyn Extension>>,
    marks: FxHashMap<String, Mark>,
    path: Vec<String>,
    order: Vec<String>,
}

impl Sorter<'_> {
    fn visit(&mut self, alias: &str) -> Result<(), ExtensionError> {
        match self.marks.get(alias) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.path.iter().position(|a| a == alias).unwrap_or(0);
                let mut cycle = self.path[start..].to_vec();
                cycle.push(alias.to_string());
                return Err(ExtensionError::CyclicExtensionDependency { cycle });
            }
            None => {}
        }
        self.marks.insert(alias.to_string(), Mark::Visiting);
        self.path.push(alias.to_string());

        let dependencies = self
            .pool
            .get(alias)
            .map(|ext| ext.dependencies())
            .unwrap_or_default();
        for dependency in dependencies {
            let dep = dependency.alias();
            if !self.pool.contains_key(dep) {
                let ext = self
                    .catalog
                    .instantiate(dep, dependency.args())
                    .ok_or_else(|| ExtensionError::MissingExtension {
                        alias: dep.to_string(),
                        required_by: alias.to_string(),
                    })??;
                tracing::debug!(extension = dep, required_by = alias, "instantiated dependency");
                self.pool.insert(dep.to_string(), ext);
            }
            self.visit(dep)?;
        }

        self.path.pop();
        self.marks.insert(alias.to_string(), Mark::Done);
        self.order.push(alias.to_string());
        Ok(())
    }
}

/// Order `extensions` so every dependency precedes its dependents.
pub fn resolve_order(
    extensions: Vec<Box<dyn Extension>>,
    catalog: &ExtensionCatalog,
) -> Result<Vec<Box<dyn Extension>>, ExtensionError> {
    let mut pool: IndexMap<String, Box<dyn Extension>> = IndexMap::with_capacity(extensions.len());
    for ext in extensions {
        let alias = ext.alias().to_string();
        if pool.contains_key(&alias) {
            return Err(ExtensionError::DuplicateExtension { alias });
        }
        pool.insert(alias, ext);
    }
    let roots: Vec<String> = pool.keys().cloned().collect();

    let mut sorter = Sorter {
        catalog,
        pool,
        marks: FxHashMap::default(),
        path: Vec::new(),
        order: Vec::new(),
    };
    for alias in &roots {
        sorter.visit(alias)?;
    }

    let Sorter {
        mut pool, order, ..
    } = sorter;
    Ok(order
        .iter()
        .filter_map(|alias| pool.shift_remove(alias))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Resolved,
    Registered,
    Booted,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Registered => "registered",
            Self::Booted => "booted",
        }
    }
}

/// Ordered extensions driven through `register` then `boot`.
#[derive(Debug)]
pub struct Lifecycle {
    extensions: Vec<Box<dyn Extension>>,
    state: State,
}

impl Lifecycle {
    pub fn resolve(
        extensions: Vec<Box<dyn Extension>>,
        catalog: &ExtensionCatalog,
    ) -> Result<Self, ExtensionError> {
        let extensions = resolve_order(extensions, catalog)?;
        tracing::info!(
            order = %extensions.iter().map(|e| e.alias()).collect::<Vec<_>>().join(", "),
            "resolved extension order"
        );
        Ok(Self {
            extensions,
            state: State::Resolved,
        })
    }

    /// Aliases in resolved order.
    pub fn order(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.alias().to_string()).collect()
    }

    fn expect(&self, state: State, attempted: &'static str) -> Result<(), ExtensionError> {
        if self.state != state {
            return Err(ExtensionError::OutOfPhase {
                attempted,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Run `register` on every extension. `configs` maps alias to its raw
    /// configuration block; each block is normalized through the extension's
    /// schema first.
    pub fn register_all(
        &mut self,
        registry: &mut Registry,
        configs: &IndexMap<String, Value>,
    ) -> Result<(), ExtensionError> {
        self.expect(State::Resolved, "register")?;
        if let Some(alias) = configs
            .keys()
            .find(|alias| !self.extensions.iter().any(|e| e.alias() == alias.as_str()))
        {
            return Err(ExtensionError::UnknownSection {
                alias: alias.clone(),
            });
        }

        registry.set_extension_order(self.order());
        for ext in &mut self.extensions {
            let alias = ext.alias().to_string();
            let raw = configs.get(&alias).cloned().unwrap_or_default();
            let config = match ext.config_schema() {
                Some(schema) => schema
                    .normalize(&raw)
                    .map_err(|source| ExtensionError::InvalidConfig {
                        alias: alias.clone(),
                        source,
                    })?,
                None => raw,
            };
            tracing::debug!(extension = %alias, "register");
            registry.set_origin(Some(&alias));
            let result = ext.register(registry, &config);
            registry.set_origin(None);
            result.map_err(|source| ExtensionError::Failed {
                alias,
                phase: Phase::Register,
                source: Box::new(source),
            })?;
        }
        self.state = State::Registered;
        Ok(())
    }

    /// Run `boot` on every extension, then require every deferred group
    /// reference to have been consumed.
    pub fn boot_all(&mut self, registry: &mut Registry) -> Result<(), ExtensionError> {
        self.expect(State::Registered, "boot")?;
        for ext in &mut self.extensions {
            let alias = ext.alias().to_string();
            tracing::debug!(extension = %alias, "boot");
            registry.set_origin(Some(&alias));
            let result = ext.boot(registry);
            registry.set_origin(None);
            result.map_err(|source| ExtensionError::Failed {
                alias,
                phase: Phase::Boot,
                source: Box::new(source),
            })?;
        }
        registry.collections().check_consumed()?;
        self.state = State::Booted;
        Ok(())
    }

    pub fn is_booted(&self) -> bool {
        self.state == State::Booted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collection::GroupAttrs;
    use crate::core::node::Node;
    use crate::core::registry::Definition;
    use crate::core::schema::Field;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Probe {
        alias: String,
        deps: Vec<Dependency>,
        log: Log,
        fail_boot: bool,
    }

    impl Probe {
        fn boxed(alias: &str, deps: &[&str], log: &Log) -> Box<dyn Extension> {
            Box::new(Self {
                alias: alias.to_string(),
                deps: deps.iter().map(|d| Dependency::from(*d)).collect(),
                log: log.clone(),
                fail_boot: false,
            })
        }
    }

    impl Extension for Probe {
        fn alias(&self) -> &str {
            &self.alias
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.deps.clone()
        }

        fn register(
            &mut self,
            registry: &mut Registry,
            config: &Value,
        ) -> Result<(), ExtensionError> {
            self.log.borrow_mut().push(format!("register:{}", self.alias));
            if let Some(id) = config.get("service").and_then(Value::as_str) {
                registry.add(Definition::new(id, Node::literal(1)))?;
            }
            Ok(())
        }

        fn boot(&mut self, _registry: &mut Registry) -> Result<(), ExtensionError> {
            self.log.borrow_mut().push(format!("boot:{}", self.alias));
            if self.fail_boot {
                return Err(ExtensionError::Custom("boom".into()));
            }
            Ok(())
        }
    }

    fn aliases(exts: &[Box<dyn Extension>]) -> Vec<&str> {
        exts.iter().map(|e| e.alias()).collect()
    }

    #[test]
    fn test_kl010_dependency_first() {
        let log = Log::default();
        let exts = vec![
            Probe::boxed("core", &["config"], &log),
            Probe::boxed("config", &[], &log),
        ];
        let ordered = resolve_order(exts, &ExtensionCatalog::new()).unwrap();
        assert_eq!(aliases(&ordered), vec!["config", "core"]);
    }

    #[test]
    fn test_kl010_input_order_kept_without_edges() {
        let log = Log::default();
        let exts = vec![
            Probe::boxed("b", &[], &log),
            Probe::boxed("a", &[], &log),
            Probe::boxed("c", &["a"], &log),
        ];
        let ordered = resolve_order(exts, &ExtensionCatalog::new()).unwrap();
        assert_eq!(aliases(&ordered), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_kl010_cycle_reported_with_path() {
        let log = Log::default();
        let exts = vec![
            Probe::boxed("a", &["b"], &log),
            Probe::boxed("b", &["c"], &log),
            Probe::boxed("c", &["a"], &log),
        ];
        let err = resolve_order(exts, &ExtensionCatalog::new()).unwrap_err();
        assert_eq!(err.to_string(), "cyclic extension dependency: a -> b -> c -> a");
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_kl010_missing_dependency() {
        let log = Log::default();
        let web = Probe::boxed("web", &["http"], &log);
        let err = resolve_order(vec![web], &ExtensionCatalog::new()).unwrap_err();
        assert!(matches!(
            err,
            ExtensionError::MissingExtension { ref alias, ref required_by }
                if alias == "http" && required_by == "web"
        ));
    }

    #[test]
    fn test_kl010_catalog_instantiates_with_args() {
        let log = Log::default();
        let seen: Rc<RefCell<Option<Value>>> = Rc::default();
        let mut catalog = ExtensionCatalog::new();
        let (catalog_log, catalog_seen) = (log.clone(), seen.clone());
        catalog.add("http", move |args| {
            *catalog_seen.borrow_mut() = Some(args);
            Ok(Probe::boxed("http", &[], &catalog_log))
        });
        let web: Box<dyn Extension> = Box::new(Probe {
            alias: "web".into(),
            deps: vec![Dependency::WithArgs {
                alias: "http".into(),
                args: Value::from("fast"),
            }],
            log: log.clone(),
            fail_boot: false,
        });
        let ordered = resolve_order(vec![web], &catalog).unwrap();
        assert_eq!(aliases(&ordered), vec!["http", "web"]);
        assert_eq!(*seen.borrow(), Some(Value::from("fast")));
    }

    #[test]
    fn test_kl010_duplicate_alias() {
        let log = Log::default();
        let err = resolve_order(
            vec![Probe::boxed("a", &[], &log), Probe::boxed("a", &[], &log)],
            &ExtensionCatalog::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtensionError::DuplicateExtension { .. }));
    }

    #[test]
    fn test_kl010_all_register_before_any_boot() {
        let log = Log::default();
        let mut lifecycle = Lifecycle::resolve(
            vec![
                Probe::boxed("core", &["config"], &log),
                Probe::boxed("config", &[], &log),
            ],
            &ExtensionCatalog::new(),
        )
        .unwrap();
        let mut registry = Registry::new();
        lifecycle.register_all(&mut registry, &IndexMap::new()).unwrap();
        lifecycle.boot_all(&mut registry).unwrap();
        assert!(lifecycle.is_booted());
        assert_eq!(
            *log.borrow(),
            vec!["register:config", "register:core", "boot:config", "boot:core"]
        );
    }

    #[test]
    fn test_kl010_origin_and_config_passed() {
        let log = Log::default();
        let probe = Probe::boxed("db", &[], &log);
        let mut lifecycle = Lifecycle::resolve(vec![probe], &ExtensionCatalog::new()).unwrap();
        let mut registry = Registry::new();
        let mut configs = IndexMap::new();
        configs.insert("db".to_string(), Value::map([("service", Value::from("db.pool"))]));
        lifecycle.register_all(&mut registry, &configs).unwrap();
        assert_eq!(
            registry.definition("db.pool").unwrap().origin.as_deref(),
            Some("db")
        );
        assert_eq!(registry.origin(), None);
    }

    #[test]
    fn test_kl010_unknown_section_rejected() {
        let log = Log::default();
        let probe = Probe::boxed("db", &[], &log);
        let mut lifecycle = Lifecycle::resolve(vec![probe], &ExtensionCatalog::new()).unwrap();
        let mut configs = IndexMap::new();
        configs.insert("dbb".to_string(), Value::Null);
        let err = lifecycle
            .register_all(&mut Registry::new(), &configs)
            .unwrap_err();
        assert!(matches!(err, ExtensionError::UnknownSection { .. }));
    }

    #[test]
    fn test_kl010_boot_failure_carries_alias() {
        let log = Log::default();
        let failing: Box<dyn Extension> = Box::new(Probe {
            alias: "mailer".into(),
            deps: vec![],
            log: log.clone(),
            fail_boot: true,
        });
        let mut lifecycle = Lifecycle::resolve(vec![failing], &ExtensionCatalog::new()).unwrap();
        let mut registry = Registry::new();
        lifecycle.register_all(&mut registry, &IndexMap::new()).unwrap();
        let err = lifecycle.boot_all(&mut registry).unwrap_err();
        assert_eq!(err.alias(), Some("mailer"));
        assert_eq!(err.to_string(), "extension 'mailer' failed during boot: boom");
    }

    #[test]
    fn test_kl010_phase_enforced() {
        let log = Log::default();
        let probe = Probe::boxed("a", &[], &log);
        let mut lifecycle = Lifecycle::resolve(vec![probe], &ExtensionCatalog::new()).unwrap();
        let mut registry = Registry::new();
        assert!(matches!(
            lifecycle.boot_all(&mut registry),
            Err(ExtensionError::OutOfPhase { .. })
        ));
        lifecycle.register_all(&mut registry, &IndexMap::new()).unwrap();
        assert!(matches!(
            lifecycle.register_all(&mut registry, &IndexMap::new()),
            Err(ExtensionError::OutOfPhase { .. })
        ));
    }

    #[test]
    fn test_kl010_unconsumed_group_fails_boot() {
        let log = Log::default();
        let probe = Probe::boxed("a", &[], &log);
        let mut lifecycle = Lifecycle::resolve(vec![probe], &ExtensionCatalog::new()).unwrap();
        let mut registry = Registry::new();
        lifecycle.register_all(&mut registry, &IndexMap::new()).unwrap();
        registry
            .collections_mut()
            .unwrap()
            .configure("@admin", GroupAttrs::default().prefix("/admin"), Some("a"))
            .unwrap();
        let err = lifecycle.boot_all(&mut registry).unwrap_err();
        assert!(matches!(
            err,
            ExtensionError::Pipeline(PipelineError::UnconsumedGroupReference { .. })
        ));
    }

    struct Schemed;

    impl Extension for Schemed {
        fn alias(&self) -> &str {
            "http"
        }

        fn config_schema(&self) -> Option<ConfigSchema> {
            Some(ConfigSchema::new().field("port", Field::int().default(80)))
        }

        fn register(
            &mut self,
            registry: &mut Registry,
            config: &Value,
        ) -> Result<(), ExtensionError> {
            let port = config.get("port").cloned().unwrap_or_default();
            registry.add(Definition::new("http.port", Node::literal(port)))?;
            Ok(())
        }
    }

    fn schemed() -> Lifecycle {
        let schemed: Box<dyn Extension> = Box::new(Schemed);
        Lifecycle::resolve(vec![schemed], &ExtensionCatalog::new()).unwrap()
    }

    #[test]
    fn test_kl010_config_normalized_through_schema() {
        let mut lifecycle = schemed();
        let mut registry = Registry::new();
        lifecycle.register_all(&mut registry, &IndexMap::new()).unwrap();
        assert_eq!(
            registry.definition("http.port").unwrap().root,
            Node::literal(80)
        );

        let mut lifecycle = schemed();
        let mut configs = IndexMap::new();
        configs.insert("http".to_string(), Value::map([("port", Value::from("x"))]));
        let err = lifecycle
            .register_all(&mut Registry::new(), &configs)
            .unwrap_err();
        assert!(matches!(err, ExtensionError::InvalidConfig { .. }));
    }
}
