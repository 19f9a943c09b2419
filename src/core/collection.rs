//! KL-007: Route collections and deferred `@group` configuration.
//!
//! Extensions may configure a collection (`@admin`) before any extension has
//! created it. Such configuration is buffered per group and merged into the
//! collection when it is created. Anything still buffered at boot
//! finalization is an error.
//!
//! `flatten` combines root routes and named collections into one table:
//! root routes first in declaration order, then each top-level collection
//! (children recursively after their parent's own routes), ordered by the
//! position of the owning extension in boot order.

use super::node::{Node, Statement};
use super::pipeline::PipelineError;
use super::value::Value;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Attributes a collection shares with all of its routes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupAttrs {
    pub prefix: Option<String>,
    pub domain: Option<String>,
    pub args: IndexMap<String, Value>,
}

impl GroupAttrs {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Read `{prefix, domain, args}` from a config block.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            prefix: text("prefix"),
            domain: text("domain"),
            args: value
                .get("args")
                .and_then(Value::as_map)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// One declared route.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub methods: Vec<String>,
    pub path: String,
    pub handler: Node,
    pub defaults: IndexMap<String, Value>,
}

impl Route {
    pub fn new(path: impl Into<String>, handler: Node) -> Self {
        Self {
            methods: Vec::new(),
            path: path.into(),
            handler,
            defaults: IndexMap::new(),
        }
    }

    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    pub fn default_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }
}

/// A named group of routes.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub id: String,
    pub owner: String,
    pub parent: Option<String>,
    pub attrs: GroupAttrs,
    pub routes: Vec<Route>,
}

impl Collection {
    pub fn add(&mut self, route: Route) -> &mut Self {
        self.routes.push(route);
        self
    }

    fn apply(&mut self, attrs: GroupAttrs) {
        if attrs.prefix.is_some() {
            self.attrs.prefix = attrs.prefix;
        }
        if attrs.domain.is_some() {
            self.attrs.domain = attrs.domain;
        }
        self.attrs.args.extend(attrs.args);
    }
}

/// A route with every collection attribute applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub methods: Vec<String>,
    pub path: String,
    pub domain: Option<String>,
    pub handler: Node,
    pub defaults: IndexMap<String, Value>,
    pub collection: Option<String>,
}

/// Final, ordered route table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    pub routes: Vec<ResolvedRoute>,
}

impl RouteTable {
    pub fn paths(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.path.as_str()).collect()
    }

    /// Node building a route collection service: `callable()` followed by
    /// one `add(methods, path, handler, defaults, domain)` per route.
    pub fn to_node(&self, callable: &str) -> Node {
        let mut statement = Statement::new(callable, Vec::new());
        for route in &self.routes {
            statement = statement.call(
                "add",
                vec![
                    Node::literal(Value::List(
                        route.methods.iter().map(|m| Value::from(m.as_str())).collect(),
                    )),
                    Node::literal(route.path.as_str()),
                    route.handler.clone(),
                    Node::literal(Value::Map(route.defaults.clone())),
                    Node::literal(route.domain.clone().map(Value::Str).unwrap_or_default()),
                ],
            );
        }
        Node::statement(statement)
    }
}

#[derive(Debug, Clone)]
struct Deferred {
    attrs: GroupAttrs,
    origin: Option<String>,
}

/// Collects root routes, named collections, and deferred group configuration.
#[derive(Debug, Default)]
pub struct CollectionAssembler {
    roots: Vec<Route>,
    collections: IndexMap<String, Collection>,
    deferred: IndexMap<String, Vec<Deferred>>,
    assembled: bool,
}

/// Strip the `@` from a group reference.
pub fn group_id(reference: &str) -> &str {
    reference.strip_prefix('@').unwrap_or(reference)
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", path),
        (false, true) => ensure_leading_slash(prefix),
        (false, false) => format!("{}/{}", ensure_leading_slash(prefix), path),
    }
}

fn ensure_leading_slash(s: &str) -> String {
    if s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{}", s)
    }
}

struct Scope<'a> {
    prefix: String,
    domain: Option<&'a str>,
    args: IndexMap<String, Value>,
}

impl CollectionAssembler {
    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.assembled {
            return Err(PipelineError::AlreadyAssembled {
                name: "route collections".to_string(),
            });
        }
        Ok(())
    }

    /// Add a route outside any collection.
    pub fn add_root(&mut self, route: Route) -> Result<(), PipelineError> {
        self.ensure_open()?;
        self.roots.push(route);
        Ok(())
    }

    /// Configure `@group`. Applied now if the collection exists, otherwise
    /// buffered until it is created.
    pub fn configure(
        &mut self,
        reference: &str,
        attrs: GroupAttrs,
        origin: Option<&str>,
    ) -> Result<(), PipelineError> {
        self.ensure_open()?;
        let id = group_id(reference);
        if let Some(collection) = self.collections.get_mut(id) {
            collection.apply(attrs);
            return Ok(());
        }
        tracing::debug!(group = id, "deferring group configuration");
        self.deferred.entry(id.to_string()).or_default().push(Deferred {
            attrs,
            origin: origin.map(str::to_string),
        });
        Ok(())
    }

    /// Create a collection owned by extension `owner`. Buffered `@id`
    /// configuration is merged in immediately, in the order it arrived.
    pub fn create(
        &mut self,
        id: &str,
        owner: &str,
        parent: Option<&str>,
        attrs: GroupAttrs,
    ) -> Result<&mut Collection, PipelineError> {
        self.ensure_open()?;
        if self.collections.contains_key(id) {
            return Err(PipelineError::DuplicateCollection { id: id.to_string() });
        }
        let mut collection = Collection {
            id: id.to_string(),
            owner: owner.to_string(),
            parent: parent.map(str::to_string),
            attrs,
            routes: Vec::new(),
        };
        for deferred in self.deferred.shift_remove(id).unwrap_or_default() {
            collection.apply(deferred.attrs);
        }
        Ok(self.collections.entry(id.to_string()).or_insert(collection))
    }

    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.get(id)
    }

    pub fn collection_mut(&mut self, id: &str) -> Option<&mut Collection> {
        self.collections.get_mut(id)
    }

    /// Groups configured but not (yet) created.
    pub fn pending_groups(&self) -> Vec<&str> {
        self.deferred.keys().map(String::as_str).collect()
    }

    /// Fail on the first buffered `@group` that no collection consumed.
    pub fn check_consumed(&self) -> Result<(), PipelineError> {
        match self.deferred.iter().next() {
            Some((group, entries)) => Err(PipelineError::UnconsumedGroupReference {
                group: group.clone(),
                origin: entries.first().and_then(|d| d.origin.clone()),
            }),
            None => Ok(()),
        }
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    /// Build the final route table. Runs once.
    pub fn flatten(&mut self, boot_order: &[String]) -> Result<RouteTable, PipelineError> {
        self.ensure_open()?;
        self.check_consumed()?;

        for collection in self.collections.values() {
            if let Some(parent) = &collection.parent {
                if !self.collections.contains_key(parent) {
                    return Err(PipelineError::UnknownParent {
                        id: collection.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        let mut table = RouteTable::default();
        let root = Scope {
            prefix: String::new(),
            domain: None,
            args: IndexMap::new(),
        };
        for route in &self.roots {
            table.routes.push(resolve_route(route, &root, None));
        }

        let mut visited = HashSet::new();
        for id in self.children_of(None, boot_order) {
            self.populate(id, &root, boot_order, &mut visited, &mut table)?;
        }
        if visited.len() != self.collections.len() {
            let stray = self
                .collections
                .keys()
                .find(|id| !visited.contains(id.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(PipelineError::CollectionCycle { id: stray });
        }

        self.assembled = true;
        tracing::debug!(routes = table.routes.len(), "route table flattened");
        Ok(table)
    }

    /// Collections directly under `parent`, ordered by owner boot position,
    /// then declaration order.
    fn children_of(&self, parent: Option<&str>, boot_order: &[String]) -> Vec<&str> {
        let rank = |owner: &str| {
            boot_order
                .iter()
                .position(|alias| alias == owner)
                .unwrap_or(boot_order.len())
        };
        let mut children: Vec<&Collection> = self
            .collections
            .values()
            .filter(|c| c.parent.as_deref() == parent)
            .collect();
        children.sort_by_key(|c| rank(&c.owner));
        children.into_iter().map(|c| c.id.as_str()).collect()
    }

    fn populate<'a>(
        &'a self,
        id: &'a str,
        outer: &Scope<'a>,
        boot_order: &[String],
        visited: &mut HashSet<&'a str>,
        table: &mut RouteTable,
    ) -> Result<(), PipelineError> {
        if !visited.insert(id) {
            return Err(PipelineError::CollectionCycle { id: id.to_string() });
        }
        let collection = &self.collections[id];
        let mut args = outer.args.clone();
        args.extend(collection.attrs.args.clone());
        let scope = Scope {
            prefix: match &collection.attrs.prefix {
                Some(prefix) => join_path(&outer.prefix, prefix),
                None => outer.prefix.clone(),
            },
            domain: collection.attrs.domain.as_deref().or(outer.domain),
            args,
        };
        for route in &collection.routes {
            table.routes.push(resolve_route(route, &scope, Some(id)));
        }
        for child in self.children_of(Some(id), boot_order) {
            self.populate(child, &scope, boot_order, visited, table)?;
        }
        Ok(())
    }
}

fn resolve_route(route: &Route, scope: &Scope<'_>, collection: Option<&str>) -> ResolvedRoute {
    let mut defaults = scope.args.clone();
    defaults.extend(route.defaults.clone());
    ResolvedRoute {
        methods: route.methods.clone(),
        path: join_path(&scope.prefix, &route.path),
        domain: scope.domain.map(str::to_string),
        handler: route.handler.clone(),
        defaults,
        collection: collection.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Route {
        Route::new(path, Node::reference(format!("handler{}", path.replace('/', "."))))
    }

    fn order(aliases: &[&str]) -> Vec<String> {
        aliases.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_kl007_deferred_group_applied_on_create() {
        let mut a = CollectionAssembler::default();
        a.configure(
            "@admin",
            GroupAttrs::default().prefix("/admin").arg("secure", Value::Bool(true)),
            Some("security"),
        )
        .unwrap();
        assert_eq!(a.pending_groups(), vec!["admin"]);

        a.create("admin", "backend", None, GroupAttrs::default())
            .unwrap()
            .add(route("/users"));
        assert!(a.pending_groups().is_empty());

        let table = a.flatten(&order(&["security", "backend"])).unwrap();
        assert_eq!(table.paths(), vec!["/admin/users"]);
        assert_eq!(table.routes[0].defaults.get("secure"), Some(&Value::Bool(true)));
        assert_eq!(table.routes[0].collection.as_deref(), Some("admin"));
    }

    #[test]
    fn test_kl007_configure_existing_applies_now() {
        let mut a = CollectionAssembler::default();
        a.create("api", "http", None, GroupAttrs::default().prefix("/v1"))
            .unwrap()
            .add(route("/ping"));
        a.configure("@api", GroupAttrs::default().domain("api.example.com"), None)
            .unwrap();
        let table = a.flatten(&order(&["http"])).unwrap();
        assert_eq!(table.routes[0].path, "/v1/ping");
        assert_eq!(table.routes[0].domain.as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_kl007_unconsumed_group_reference() {
        let mut a = CollectionAssembler::default();
        a.configure("@ghost", GroupAttrs::default().prefix("/g"), Some("security"))
            .unwrap();
        let err = a.flatten(&[]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::UnconsumedGroupReference {
                group: "ghost".to_string(),
                origin: Some("security".to_string()),
            }
        );
        assert!(err.to_string().contains("from 'security'"));
    }

    #[test]
    fn test_kl007_roots_first_then_boot_order() {
        let mut a = CollectionAssembler::default();
        a.create("blog", "blog", None, GroupAttrs::default().prefix("/blog"))
            .unwrap()
            .add(route("/posts"));
        a.create("shop", "shop", None, GroupAttrs::default().prefix("/shop"))
            .unwrap()
            .add(route("/cart"));
        a.add_root(route("/")).unwrap();
        a.add_root(route("/about")).unwrap();

        let table = a.flatten(&order(&["shop", "blog"])).unwrap();
        assert_eq!(
            table.paths(),
            vec!["/", "/about", "/shop/cart", "/blog/posts"]
        );
    }

    #[test]
    fn test_kl007_nested_collections_recursive() {
        let mut a = CollectionAssembler::default();
        let attrs = GroupAttrs::default().prefix("/admin").domain("admin.local");
        a.create("admin", "backend", None, attrs)
            .unwrap()
            .add(route("/"));
        a.create("admin.reports", "reports", Some("admin"), GroupAttrs::default().prefix("reports"))
            .unwrap()
            .add(route("/daily"));
        a.create("public", "web", None, GroupAttrs::default())
            .unwrap()
            .add(route("/home"));

        let table = a
            .flatten(&order(&["backend", "reports", "web"]))
            .unwrap();
        assert_eq!(
            table.paths(),
            vec!["/admin", "/admin/reports/daily", "/home"]
        );
        assert_eq!(table.routes[1].domain.as_deref(), Some("admin.local"));
    }

    #[test]
    fn test_kl007_unknown_parent() {
        let mut a = CollectionAssembler::default();
        a.create("child", "x", Some("nowhere"), GroupAttrs::default())
            .unwrap();
        assert!(matches!(
            a.flatten(&[]),
            Err(PipelineError::UnknownParent { .. })
        ));
    }

    #[test]
    fn test_kl007_flatten_once() {
        let mut a = CollectionAssembler::default();
        a.flatten(&[]).unwrap();
        assert!(matches!(
            a.flatten(&[]),
            Err(PipelineError::AlreadyAssembled { .. })
        ));
        assert!(a.add_root(route("/late")).is_err());
    }

    #[test]
    fn test_kl007_duplicate_collection() {
        let mut a = CollectionAssembler::default();
        a.create("x", "a", None, GroupAttrs::default()).unwrap();
        assert!(matches!(
            a.create("x", "b", None, GroupAttrs::default()),
            Err(PipelineError::DuplicateCollection { .. })
        ));
    }

    #[test]
    fn test_kl007_group_attrs_from_value() {
        let v: Value = serde_yaml_ng::from_str("prefix: /api\nargs:\n  lang: en\n").unwrap();
        let attrs = GroupAttrs::from_value(&v);
        assert_eq!(attrs.prefix.as_deref(), Some("/api"));
        assert_eq!(attrs.args.get("lang"), Some(&Value::from("en")));
    }

    #[test]
    fn test_kl007_route_table_node() {
        let table = RouteTable {
            routes: vec![ResolvedRoute {
                methods: vec!["GET".into()],
                path: "/x".into(),
                domain: None,
                handler: Node::reference("h"),
                defaults: IndexMap::new(),
                collection: None,
            }],
        };
        match table.to_node("RouteCollection") {
            Node::Statement(st) => {
                assert_eq!(st.calls.len(), 1);
                assert_eq!(st.calls[0].method, "add");
                assert_eq!(st.calls[0].args[2], Node::reference("h"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_kl007_join_path() {
        assert_eq!(join_path("", ""), "/");
        assert_eq!(join_path("/admin/", "/users"), "/admin/users");
        assert_eq!(join_path("api", "v1"), "/api/v1");
        assert_eq!(join_path("/admin", "/"), "/admin");
    }
}
