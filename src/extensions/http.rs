//! KL-019: The `http` extension, middleware pipeline and route collections.
//!
//! ```yaml
//! http:
//!   middleware: ["@cors", {anchor: security}, {key: log, service: "@logger"}]
//!   anchors:
//!     security: ["@auth", "@csrf"]
//!   routes:
//!     - {path: /, handler: "@home", methods: [GET]}
//!   groups:
//!     admin: {prefix: /admin, routes: [{path: users, handler: "@users"}]}
//!   configure:
//!     "@admin": {domain: admin.example.com}
//! ```
//!
//! Register contributes entries; boot assembles `http.middleware` (list) and
//! `http.router` (a route collection built by the `router` callable). Other
//! extensions contribute through `Registry::pipeline(MIDDLEWARE)` and
//! `Registry::collections_mut()` during their register phase.

use crate::core::collection::{GroupAttrs, Route};
use crate::core::container::ContainerError;
use crate::core::extension::{Extension, ExtensionError};
use crate::core::factory::{Arity, Factories};
use crate::core::loader::value_to_node;
use crate::core::node::Node;
use crate::core::registry::{Definition, Registry};
use crate::core::schema::{ConfigSchema, Field};
use crate::core::value::{Service, Value};
use indexmap::IndexMap;
use std::any::Any;

pub const ALIAS: &str = "http";
pub const MIDDLEWARE: &str = "http.middleware";
pub const ROUTER: &str = "http.router";
pub const ROUTE_COLLECTION: &str = "RouteCollection";

#[derive(Debug, Default)]
pub struct HttpExtension {
    router: String,
}

fn invalid(message: impl Into<String>) -> ExtensionError {
    ExtensionError::Custom(message.into())
}

fn route_from(value: &Value) -> Result<Route, ExtensionError> {
    let path = value
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("route needs a string 'path'"))?;
    let handler = value
        .get("handler")
        .ok_or_else(|| invalid(format!("route '{}' needs a 'handler'", path)))?;
    let mut route = Route::new(path, value_to_node(handler));
    if let Some(methods) = value.get("methods").and_then(Value::as_list) {
        let names: Vec<&str> = methods.iter().filter_map(Value::as_str).collect();
        route = route.methods(&names);
    }
    if let Some(defaults) = value.get("defaults").and_then(Value::as_map) {
        route.defaults = defaults.clone();
    }
    Ok(route)
}

fn routes_from(value: Option<&Value>) -> Result<Vec<Route>, ExtensionError> {
    value
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .map(route_from)
        .collect()
}

fn middleware_entry(registry: &mut Registry, entry: &Value) -> Result<(), ExtensionError> {
    let pipeline = registry.pipeline(MIDDLEWARE)?;
    if let Some(name) = entry.get("anchor").and_then(Value::as_str) {
        pipeline.anchor(name)?;
    } else if let Some(key) = entry.get("key").and_then(Value::as_str) {
        let service = entry
            .get("service")
            .ok_or_else(|| invalid(format!("keyed middleware '{}' needs a 'service'", key)))?;
        pipeline.append_keyed(key, value_to_node(service))?;
    } else {
        pipeline.append(value_to_node(entry))?;
    }
    Ok(())
}

impl Extension for HttpExtension {
    fn alias(&self) -> &str {
        ALIAS
    }

    fn config_schema(&self) -> Option<ConfigSchema> {
        Some(
            ConfigSchema::new()
                .field(
                    "router",
                    Field::string()
                        .default(ROUTE_COLLECTION)
                        .describe("callable building the route collection"),
                )
                .field("middleware", Field::list().default(Value::List(Vec::new())))
                .field("anchors", Field::map().default(Value::empty_map()))
                .field("routes", Field::list().default(Value::List(Vec::new())))
                .field("groups", Field::map().default(Value::empty_map()))
                .field("configure", Field::map().default(Value::empty_map())),
        )
    }

    fn register(&mut self, registry: &mut Registry, config: &Value) -> Result<(), ExtensionError> {
        self.router = config
            .get("router")
            .and_then(Value::as_str)
            .unwrap_or(ROUTE_COLLECTION)
            .to_string();

        registry.pipeline(MIDDLEWARE)?;
        for entry in config.get("middleware").and_then(Value::as_list).unwrap_or_default() {
            middleware_entry(registry, entry)?;
        }
        for (name, content) in config.get("anchors").and_then(Value::as_map).into_iter().flatten() {
            let nodes = content
                .as_list()
                .ok_or_else(|| invalid(format!("anchor '{}' must be a list", name)))?
                .iter()
                .map(value_to_node)
                .collect();
            registry.pipeline(MIDDLEWARE)?.resolve_anchor(name.as_str(), nodes)?;
        }

        for route in routes_from(config.get("routes"))? {
            registry.collections_mut()?.add_root(route)?;
        }
        for (id, group) in config.get("groups").and_then(Value::as_map).into_iter().flatten() {
            let parent = group.get("parent").and_then(Value::as_str);
            let routes = routes_from(group.get("routes"))?;
            let collection = registry
                .collections_mut()?
                .create(id, ALIAS, parent, GroupAttrs::from_value(group))?;
            for route in routes {
                collection.add(route);
            }
        }
        let configure = config.get("configure").and_then(Value::as_map);
        for (reference, attrs) in configure.into_iter().flatten() {
            registry
                .collections_mut()?
                .configure(reference, GroupAttrs::from_value(attrs), Some(ALIAS))?;
        }
        Ok(())
    }

    fn boot(&mut self, registry: &mut Registry) -> Result<(), ExtensionError> {
        let middleware = registry.pipeline(MIDDLEWARE)?.assemble()?;
        registry.add(Definition::new(MIDDLEWARE, Node::array(middleware)))?;

        let order = registry.extension_order().to_vec();
        let table = registry.collections_mut()?.flatten(&order)?;
        tracing::info!(routes = table.routes.len(), "route table assembled");
        registry.add(Definition::new(ROUTER, table.to_node(&self.router)).with_type("Router"))?;
        Ok(())
    }
}

/// One entry of a live [`RouteCollection`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub methods: Vec<String>,
    pub path: String,
    pub handler: Value,
    pub defaults: IndexMap<String, Value>,
    pub domain: Option<String>,
}

impl RouteEntry {
    fn from_args(args: &[Value]) -> Result<Self, ContainerError> {
        let bad = |reason: &str| ContainerError::InvalidArgument {
            callable: format!("{}::add", ROUTE_COLLECTION),
            message: reason.to_string(),
        };
        let [methods, path, handler, defaults, domain] = args else {
            return Err(bad("expected (methods, path, handler, defaults, domain)"));
        };
        Ok(Self {
            methods: methods
                .as_list()
                .ok_or_else(|| bad("methods must be a list"))?
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            path: path.as_str().ok_or_else(|| bad("path must be a string"))?.to_string(),
            handler: handler.clone(),
            defaults: defaults.as_map().cloned().unwrap_or_default(),
            domain: domain.as_str().map(str::to_string),
        })
    }

    fn to_args(&self) -> Vec<Value> {
        vec![
            Value::List(self.methods.iter().map(|m| Value::from(m.as_str())).collect()),
            Value::from(self.path.as_str()),
            self.handler.clone(),
            Value::Map(self.defaults.clone()),
            self.domain.clone().map(Value::Str).unwrap_or_default(),
        ]
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        self.path == path
            && (self.methods.is_empty()
                || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
    }
}

/// Default route collection service: an ordered table with exact-path lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteCollection {
    pub routes: Vec<RouteEntry>,
}

impl Service for RouteCollection {
    fn type_name(&self) -> &str {
        ROUTE_COLLECTION
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ContainerError> {
        match method {
            "add" => {
                self.routes.push(RouteEntry::from_args(&args)?);
                Ok(Value::Null)
            }
            "paths" => Ok(Value::List(
                self.routes.iter().map(|r| Value::from(r.path.as_str())).collect(),
            )),
            "match" => {
                let method = args.first().and_then(Value::as_str).unwrap_or_default();
                let path = args.get(1).and_then(Value::as_str).unwrap_or_default();
                Ok(self
                    .routes
                    .iter()
                    .find(|r| r.matches(method, path))
                    .map(|r| r.handler.clone())
                    .unwrap_or_default())
            }
            _ => Err(ContainerError::UnknownMethod {
                type_name: ROUTE_COLLECTION.to_string(),
                method: method.to_string(),
            }),
        }
    }

    fn export(&self) -> Value {
        Value::List(self.routes.iter().map(|r| Value::List(r.to_args())).collect())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Register the `RouteCollection` callable. With no argument it builds an
/// empty collection; with one it revives an exported table.
pub fn register_factories(factories: &mut Factories) {
    factories.register_with_arity(ROUTE_COLLECTION, Arity::Range(0, 1), |_, args| {
        let mut collection = RouteCollection::default();
        if let Some(exported) = args.first() {
            for entry in exported.as_list().unwrap_or_default() {
                collection.call("add", entry.as_list().unwrap_or_default().to_vec())?;
            }
        }
        Ok(Value::service(collection))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::container::{Container, Lookup};
    use crate::core::extension::{ExtensionCatalog, Lifecycle};
    use crate::core::pipeline::PipelineError;

    fn run(yaml: &str, extra: Vec<Box<dyn Extension>>) -> Result<Registry, ExtensionError> {
        let config: Value = serde_yaml_ng::from_str(yaml).unwrap();
        let mut configs = IndexMap::new();
        configs.insert(ALIAS.to_string(), config);
        let mut exts: Vec<Box<dyn Extension>> = vec![Box::new(HttpExtension::default())];
        exts.extend(extra);
        let mut lifecycle = Lifecycle::resolve(exts, &ExtensionCatalog::new())?;
        let mut registry = Registry::new();
        lifecycle.register_all(&mut registry, &configs)?;
        lifecycle.boot_all(&mut registry)?;
        Ok(registry)
    }

    fn services() -> Registry {
        let mut r = Registry::new();
        for id in ["cors", "auth", "csrf", "logger", "home", "users"] {
            r.add(Definition::new(id, Node::literal(id))).unwrap();
        }
        r
    }

    fn container(registry: Registry) -> Container {
        let mut merged = services();
        for definition in registry.definitions() {
            merged.add(definition.clone()).unwrap();
        }
        let mut factories = Factories::new();
        register_factories(&mut factories);
        Container::new(merged, factories).unwrap()
    }

    const APP: &str = r#"
middleware: ["@cors", {anchor: security}, {key: log, service: "@logger"}]
anchors:
  security: ["@auth", "@csrf"]
routes:
  - {path: /, handler: "@home", methods: [get]}
groups:
  admin:
    prefix: /admin
    routes:
      - {path: users, handler: "@users", defaults: {page: 1}}
configure:
  "@admin": {domain: admin.example.com}
"#;

    #[test]
    fn test_kl019_middleware_order() {
        let registry = run(APP, vec![]).unwrap();
        let c = container(registry);
        let middleware = c.get(MIDDLEWARE).unwrap();
        let names: Vec<_> = middleware
            .as_list()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["cors", "auth", "csrf", "logger"]);
    }

    #[test]
    fn test_kl019_router_routes() {
        let registry = run(APP, vec![]).unwrap();
        let c = container(registry);
        let router = c.get(ROUTER).unwrap();
        assert_eq!(
            router.invoke("paths", vec![]).unwrap(),
            Value::List(vec![Value::from("/"), Value::from("/admin/users")])
        );
        assert_eq!(
            router.invoke("match", vec!["GET".into(), "/".into()]).unwrap(),
            Value::from("home")
        );
        assert!(router.invoke("match", vec!["POST".into(), "/".into()]).unwrap().is_null());
        let domain = router
            .with_service(|rc: &RouteCollection| rc.routes[1].domain.clone())
            .unwrap();
        assert_eq!(domain.as_deref(), Some("admin.example.com"));
        assert!(c.get_by_type("Router").unwrap().same_instance(&router));
    }

    #[test]
    fn test_kl019_unresolved_anchor_fails_boot() {
        let err = run("middleware: [{anchor: missing}]\n", vec![]).unwrap_err();
        match err {
            ExtensionError::Failed { alias, source, .. } => {
                assert_eq!(alias, "http");
                assert!(matches!(
                    *source,
                    ExtensionError::Pipeline(PipelineError::UnresolvedAnchor { .. })
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_kl019_unconsumed_group_reference() {
        let err = run("configure:\n  \"@nowhere\": {prefix: /x}\n", vec![]).unwrap_err();
        assert!(err.to_string().contains("nowhere"), "{}", err);
    }

    #[test]
    fn test_kl019_contribution_from_dependent_extension() {
        struct Admin;
        impl Extension for Admin {
            fn alias(&self) -> &str {
                "admin"
            }
            fn dependencies(&self) -> Vec<crate::core::extension::Dependency> {
                vec![ALIAS.into()]
            }
            fn register(
                &mut self,
                registry: &mut Registry,
                _config: &Value,
            ) -> Result<(), ExtensionError> {
                registry.pipeline(MIDDLEWARE)?.append(Node::reference("auth"))?;
                registry
                    .collections_mut()?
                    .configure("@dash", GroupAttrs::default().prefix("/dash"), Some("admin"))?;
                registry
                    .collections_mut()?
                    .create("dash", "admin", None, GroupAttrs::default())?
                    .add(Route::new("/", Node::reference("home")));
                Ok(())
            }
        }
        let registry = run("middleware: ['@cors']\n", vec![Box::new(Admin)]).unwrap();
        let c = container(registry);
        let router = c.get(ROUTER).unwrap();
        assert_eq!(
            router.invoke("paths", vec![]).unwrap(),
            Value::List(vec![Value::from("/dash")])
        );
        assert_eq!(c.get(MIDDLEWARE).unwrap().as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_kl019_bad_route_rejected() {
        let err = run("routes: [{handler: '@home'}]\n", vec![]).unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_kl019_revive_from_export() {
        let mut factories = Factories::new();
        register_factories(&mut factories);
        let c = Container::new(Registry::new(), Factories::new()).unwrap();
        let mut original = RouteCollection::default();
        original
            .call(
                "add",
                vec![
                    Value::List(vec!["GET".into()]),
                    "/a".into(),
                    "h".into(),
                    Value::empty_map(),
                    Value::Null,
                ],
            )
            .unwrap();
        let revived = factories.revive(&c, ROUTE_COLLECTION, original.export()).unwrap();
        let routes = revived.with_service(|rc: &RouteCollection| rc.routes.clone()).unwrap();
        assert_eq!(routes, original.routes);
    }
}
