//! KL-012: Compiling executor.
//!
//! Renders a frozen registry as a Rust module defining a pre-wired container
//! whose public surface mirrors [`Lookup`](super::container::Lookup). Every
//! definition becomes one private method; shared definitions memoize through
//! a `OnceCell` field. Output is a pure function of the registry, so two
//! compilations of the same input are byte-identical.

use super::factory::{Arity, Factories};
use super::node::{Callable, MethodCall, Node, Statement};
use super::parameters::{ParameterError, Parameters};
use super::registry::{Definition, Registry};
use super::template::{fill, string_literal, Code, Fragment, TemplateError};
use super::value::Value;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt::Write as _;
use thiserror::Error;

/// Generator version stamped into the header.
pub const GENERATOR: &str = concat!("kiln ", env!("CARGO_PKG_VERSION"));

/// Compilation failures.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("registry must be frozen before it is compiled")]
    NotFrozen,

    #[error("service '{referenced_by}' references unknown service '{id}'")]
    UnknownService { id: String, referenced_by: String },

    #[error("service '{service}' uses unregistered callable '{name}'")]
    UnknownCallable { name: String, service: String },

    #[error("service '{service}' calls '{callable}' with {got} arguments, expected {expected}")]
    ArityMismatch {
        callable: String,
        expected: Arity,
        got: usize,
        service: String,
    },

    #[error("'{key}' holds a live service and cannot be compiled into a static table")]
    UnrepresentableStatic { key: String },

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Naming of the generated module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Path the generated code uses to reach this crate.
    pub crate_path: String,
    pub struct_name: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            crate_path: "::kiln".to_string(),
            struct_name: "CompiledContainer".to_string(),
        }
    }
}

/// Compile with default options.
pub fn compile(registry: &Registry, factories: Option<&Factories>) -> Result<String, CompileError> {
    Compiler::new(registry, factories, CompileOptions::default())?.compile()
}

/// `service_<id>` with every non-identifier character replaced.
fn method_base(id: &str) -> String {
    let mut out = String::from("service_");
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}

/// Renders one registry.
pub struct Compiler<'a> {
    registry: &'a Registry,
    factories: Option<&'a Factories>,
    options: CompileOptions,
    methods: IndexMap<String, String>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        registry: &'a Registry,
        factories: Option<&'a Factories>,
        options: CompileOptions,
    ) -> Result<Self, CompileError> {
        if !registry.is_frozen() {
            return Err(CompileError::NotFrozen);
        }
        let mut taken = HashSet::new();
        let mut methods = IndexMap::with_capacity(registry.len());
        for definition in registry.definitions() {
            let base = method_base(&definition.id);
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            methods.insert(definition.id.clone(), name);
        }
        Ok(Self {
            registry,
            factories,
            options,
            methods,
        })
    }

    fn parameters(&self) -> &Parameters {
        self.registry.parameters()
    }

    /// Fill `template`; fragment `$0` is always the crate path.
    fn emit(&self, template: &str, fragments: Vec<Fragment>) -> Result<Code, CompileError> {
        let mut all = Vec::with_capacity(fragments.len() + 1);
        all.push(Fragment::Code(Code::new(self.options.crate_path.as_str())));
        all.extend(fragments);
        Ok(fill(template, &all)?)
    }

    /// Render a plain value. Live services are re-created at runtime from
    /// their exported structure.
    fn value(&self, value: &Value) -> Result<Code, CompileError> {
        match value {
            Value::Null => self.emit("$0::Value::Null", vec![]),
            Value::Bool(b) => {
                self.emit("$0::Value::Bool($1)", vec![Code::new(b.to_string()).into()])
            }
            Value::Int(n) => {
                let literal = if *n == i64::MIN {
                    "i64::MIN".to_string()
                } else {
                    n.to_string()
                };
                self.emit("$0::Value::Int($1)", vec![Code::new(literal).into()])
            }
            Value::Float(x) => {
                let literal = if x.is_nan() {
                    "f64::NAN".to_string()
                } else if x.is_infinite() && *x > 0.0 {
                    "f64::INFINITY".to_string()
                } else if x.is_infinite() {
                    "f64::NEG_INFINITY".to_string()
                } else {
                    format!("{:?}_f64", x)
                };
                self.emit("$0::Value::Float($1)", vec![Code::new(literal).into()])
            }
            Value::Str(s) => self.emit("$0::Value::from($1)", vec![Fragment::Str(s.clone())]),
            Value::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.emit("$0::Value::List(vec![$*1])", vec![items.into()])
            }
            Value::Map(map) => self.map(map.iter().map(|(k, v)| -> Result<_, CompileError> {
                Ok((k.as_str(), self.value(v)?))
            })),
            Value::Service(object) => {
                let (type_name, state) = match object.try_borrow() {
                    Ok(guard) => (guard.type_name().to_string(), guard.export()),
                    Err(_) => (String::new(), Value::Null),
                };
                let state = self.value(&state)?;
                self.emit(
                    "self.factories.revive(self, $1, $2)?",
                    vec![Fragment::Str(type_name), state.into()],
                )
            }
        }
    }

    fn map<'k, I>(&self, entries: I) -> Result<Code, CompileError>
    where
        I: Iterator<Item = Result<(&'k str, Code), CompileError>>,
    {
        let mut pairs = Vec::new();
        for entry in entries {
            let (key, code) = entry?;
            pairs.push(fill("($0, $1)", &[Fragment::Str(key.to_string()), code.into()])?);
        }
        if pairs.is_empty() {
            self.emit("$0::Value::empty_map()", vec![])
        } else {
            self.emit("$0::Value::map([$*1])", vec![pairs.into()])
        }
    }

    /// Render a value that must not depend on `self` (parameter table).
    fn static_value(&self, key: &str, value: &Value) -> Result<Code, CompileError> {
        match value {
            Value::Service(_) => Err(CompileError::UnrepresentableStatic {
                key: key.to_string(),
            }),
            Value::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.static_value(key, item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.emit("$0::Value::List(vec![$*1])", vec![items.into()])
            }
            Value::Map(map) => self.map(map.iter().map(|(k, v)| -> Result<_, CompileError> {
                Ok((k.as_str(), self.static_value(&format!("{}.{}", key, k), v)?))
            })),
            scalar => self.value(scalar),
        }
    }

    fn nodes(&self, nodes: &[Node], service: &str) -> Result<Vec<Code>, CompileError> {
        nodes.iter().map(|n| self.node(n, service)).collect()
    }

    /// Render a node as an expression of type `Value` inside a method
    /// returning `Result<Value, ContainerError>`.
    fn node(&self, node: &Node, service: &str) -> Result<Code, CompileError> {
        match node {
            Node::Literal(value) => self.value(&self.parameters().expand(value)?),
            Node::Parameter(key) => {
                self.parameters().get(key)?;
                self.emit("self.parameters.get($1)?", vec![Fragment::Str(key.clone())])
            }
            Node::Reference { id, optional } => match self.methods.get(id) {
                Some(method) => self.emit("self.$1()?", vec![Code::new(method.as_str()).into()]),
                None if *optional => self.emit("$0::Value::Null", vec![]),
                None => Err(CompileError::UnknownService {
                    id: id.clone(),
                    referenced_by: service.to_string(),
                }),
            },
            Node::Statement(statement) => self.statement(statement, service),
        }
    }

    fn check_callable(&self, name: &str, argc: usize, service: &str) -> Result<(), CompileError> {
        let factories = match self.factories {
            Some(factories) => factories,
            None => return Ok(()),
        };
        match factories.arity(name) {
            None => Err(CompileError::UnknownCallable {
                name: name.to_string(),
                service: service.to_string(),
            }),
            Some(arity) if !arity.accepts(argc) => Err(CompileError::ArityMismatch {
                callable: name.to_string(),
                expected: arity,
                got: argc,
                service: service.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn statement(&self, statement: &Statement, service: &str) -> Result<Code, CompileError> {
        let args = self.nodes(&statement.args, service)?;
        let mut code = match &statement.callable {
            Callable::Named(name) => {
                self.check_callable(name, args.len(), service)?;
                self.emit(
                    "self.factories.invoke(self, $1, vec![$*2])?",
                    vec![Fragment::Str(name.clone()), args.into()],
                )?
            }
            Callable::Method(target, method) => {
                let target = self.node(target, service)?;
                self.emit(
                    "$1.invoke($2, vec![$*3])?",
                    vec![target.into(), Fragment::Str(method.clone()), args.into()],
                )?
            }
            Callable::Array => self.emit("$0::Value::List(vec![$*1])", vec![args.into()])?,
            Callable::Record(keys) => self.map(
                keys.iter()
                    .zip(args)
                    .map(|(k, code)| Ok::<_, CompileError>((k.as_str(), code))),
            )?,
        };
        for call in &statement.calls {
            let args = self.nodes(&call.args, service)?;
            code = self.emit(
                "$1.fluent($2, vec![$*3])?",
                vec![code.into(), Fragment::Str(call.method.clone()), args.into()],
            )?;
        }
        Ok(code)
    }

    fn setup(&self, call: &MethodCall, service: &str) -> Result<Code, CompileError> {
        let args = self.nodes(&call.args, service)?;
        self.emit(
            "        value.invoke($1, vec![$*2])?;\n",
            vec![Fragment::Str(call.method.clone()), args.into()],
        )
    }

    fn method(&self, definition: &Definition) -> Result<Code, CompileError> {
        let id = &definition.id;
        let name = Code::new(self.methods.get(id).map(String::as_str).unwrap_or_default());
        let body = self.node(&definition.root, id)?;
        let mut setup = String::new();
        for call in &definition.setup {
            setup.push_str(self.setup(call, id)?.as_str());
        }
        let template = if definition.shared {
            concat!(
                "    fn $1(&self) -> Result<$0::Value, $0::ContainerError> {\n",
                "        if let Some(value) = self.cell_$1.get() {\n",
                "            return Ok(value.clone());\n",
                "        }\n",
                "        let _guard = self.stack.enter($2)?;\n",
                "        let value = $3;\n",
                "$4",
                "        let _ = self.cell_$1.set(value.clone());\n",
                "        Ok(value)\n",
                "    }\n",
            )
        } else {
            concat!(
                "    fn $1(&self) -> Result<$0::Value, $0::ContainerError> {\n",
                "        let _guard = self.stack.enter($2)?;\n",
                "        let value = $3;\n",
                "$4",
                "        Ok(value)\n",
                "    }\n",
            )
        };
        self.emit(
            template,
            vec![
                name.into(),
                Fragment::Str(id.clone()),
                body.into(),
                Code::new(setup).into(),
            ],
        )
    }

    fn public(&self) -> impl Iterator<Item = &Definition> {
        self.registry.definitions().filter(|d| d.public)
    }

    fn string_list(&self, ids: &[String]) -> Result<Code, CompileError> {
        let items: Vec<Code> = ids
            .iter()
            .map(|id| fill("$0.to_string()", &[Fragment::Str(id.clone())]))
            .collect::<Result<_, _>>()?;
        Ok(fill("vec![$*0]", &[items.into()])?)
    }

    fn lookup_impl(&self) -> Result<String, CompileError> {
        let krate = &self.options.crate_path;
        let name = &self.options.struct_name;
        let mut out = String::new();
        let _ = writeln!(out, "impl {}::Lookup for {} {{", krate, name);

        let _ = writeln!(
            out,
            "    fn get(&self, id: &str) -> Result<{0}::Value, {0}::ContainerError> {{",
            krate
        );
        out.push_str("        match id {\n");
        for definition in self.public() {
            let arm = self.emit(
                "            $1 => self.$2(),\n",
                vec![
                    Fragment::Str(definition.id.clone()),
                    Code::new(self.methods[&definition.id].as_str()).into(),
                ],
            )?;
            out.push_str(arm.as_str());
        }
        let _ = writeln!(
            out,
            "            _ => Err({}::ContainerError::UnknownService {{ id: id.to_string() }}),",
            krate
        );
        out.push_str("        }\n    }\n\n");

        let ids: Vec<Code> = self.public().map(|d| string_literal(&d.id)).collect();
        out.push_str("    fn has(&self, id: &str) -> bool {\n");
        if ids.is_empty() {
            out.push_str("        let _ = id;\n        false\n");
        } else {
            let pattern = ids
                .iter()
                .map(Code::as_str)
                .collect::<Vec<_>>()
                .join(" | ");
            let _ = writeln!(out, "        matches!(id, {})", pattern);
        }
        out.push_str("    }\n\n");

        let mut tags: IndexMap<&str, Vec<(&str, &Value)>> = IndexMap::new();
        let mut types: IndexMap<&str, Vec<String>> = IndexMap::new();
        for definition in self.public() {
            for (tag, attrs) in &definition.tags {
                tags.entry(tag.as_str())
                    .or_default()
                    .push((definition.id.as_str(), attrs));
            }
            for type_name in &definition.types {
                types
                    .entry(type_name.as_str())
                    .or_default()
                    .push(definition.id.clone());
            }
        }

        let _ = writeln!(
            out,
            "    fn tagged(&self, tag: &str) -> Vec<(String, {}::Value)> {{",
            krate
        );
        out.push_str("        match tag {\n");
        for (tag, entries) in &tags {
            let mut pairs = Vec::with_capacity(entries.len());
            for (id, attrs) in entries {
                let attrs = self.static_value(tag, attrs)?;
                pairs.push(fill(
                    "($0.to_string(), $1)",
                    &[Fragment::Str(id.to_string()), attrs.into()],
                )?);
            }
            let arm = fill(
                "            $0 => vec![$*1],\n",
                &[Fragment::Str(tag.to_string()), pairs.into()],
            )?;
            out.push_str(arm.as_str());
        }
        out.push_str("            _ => Vec::new(),\n        }\n    }\n\n");

        out.push_str("    fn ids_by_type(&self, type_name: &str) -> Vec<String> {\n");
        out.push_str("        match type_name {\n");
        for (type_name, ids) in &types {
            let arm = fill(
                "            $0 => $1,\n",
                &[Fragment::Str(type_name.to_string()), self.string_list(ids)?.into()],
            )?;
            out.push_str(arm.as_str());
        }
        out.push_str("            _ => Vec::new(),\n        }\n    }\n\n");

        let _ = writeln!(
            out,
            "    fn parameter(&self, key: &str) -> Result<{0}::Value, {0}::ContainerError> {{",
            krate
        );
        out.push_str("        Ok(self.parameters.get(key)?)\n    }\n}\n");
        Ok(out)
    }

    fn body(&self) -> Result<String, CompileError> {
        let krate = &self.options.crate_path;
        let name = &self.options.struct_name;
        let shared: Vec<&str> = self
            .registry
            .definitions()
            .filter(|d| d.shared)
            .map(|d| self.methods[&d.id].as_str())
            .collect();

        let mut table = Vec::new();
        for (key, value) in self.parameters().tree() {
            let code = self.static_value(key, value)?;
            table.push(fill("($0, $1)", &[Fragment::Str(key.clone()), code.into()])?);
        }
        let table = if table.is_empty() {
            self.emit("$0::Value::empty_map()", vec![])?
        } else {
            self.emit("$0::Value::map([$*1])", vec![table.into()])?
        };

        let mut out = String::new();
        let _ = writeln!(out, "pub struct {} {{", name);
        let _ = writeln!(out, "    factories: {}::Factories,", krate);
        let _ = writeln!(out, "    parameters: {}::Parameters,", krate);
        let _ = writeln!(out, "    stack: {}::ResolutionStack,", krate);
        for method in &shared {
            let _ = writeln!(out, "    cell_{}: ::std::cell::OnceCell<{}::Value>,", method, krate);
        }
        out.push_str("}\n\n");

        let _ = writeln!(out, "impl {} {{", name);
        let _ = writeln!(out, "    pub fn new(factories: {}::Factories) -> Self {{", krate);
        out.push_str("        Self {\n            factories,\n");
        let _ = writeln!(
            out,
            "            parameters: {}::Parameters::from_resolved(Self::parameter_table()),",
            krate
        );
        let _ = writeln!(out, "            stack: {}::ResolutionStack::new(),", krate);
        for method in &shared {
            let _ = writeln!(out, "            cell_{}: ::std::cell::OnceCell::new(),", method);
        }
        out.push_str("        }\n    }\n\n");
        let _ = writeln!(out, "    fn parameter_table() -> {}::Value {{", krate);
        let _ = writeln!(out, "        {}", table);
        out.push_str("    }\n");
        for definition in self.registry.definitions() {
            out.push('\n');
            out.push_str(self.method(definition)?.as_str());
        }
        out.push_str("}\n\n");
        out.push_str(&self.lookup_impl()?);
        Ok(out)
    }

    /// Full module source, header included.
    pub fn compile(&self) -> Result<String, CompileError> {
        let body = self.body()?;
        let digest = crate::cache::hasher::hash_string(&body);
        tracing::info!(services = self.registry.len(), %digest, "compiled container");
        Ok(format!(
            "// @generated by {}. Do not edit.\n// digest: {}\n\n{}",
            GENERATOR, digest, body
        ))
    }
}

/// The digest line of a generated module, if present.
pub fn artifact_digest(source: &str) -> Option<&str> {
    source
        .lines()
        .take(3)
        .find_map(|line| line.strip_prefix("// digest: "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Service;
    use proptest::prelude::*;
    use std::any::Any;

    fn frozen(mut r: Registry) -> Registry {
        r.freeze().unwrap();
        r
    }

    fn sample() -> Registry {
        let mut r = Registry::new();
        r.parameters_mut()
            .unwrap()
            .set("db.dsn", Value::from("pg://localhost"));
        r.parameters_mut().unwrap().set("app.name", Value::from("shop"));
        r.add(
            Definition::new("db", Node::create("Pool", vec![Node::parameter("db.dsn")]))
                .with_type("Pool"),
        )
        .unwrap();
        r.add(
            Definition::new(
                "http.router",
                Node::statement(
                    Statement::new("Router", vec![Node::reference("db")])
                        .call("route", vec![Node::literal("/%app.name%")]),
                ),
            )
            .tag("console.command", Value::map([("name", Value::from("routes"))])),
        )
        .unwrap();
        r.add(Definition::new("tmp", Node::create("Scratch", vec![])).shared(false).private())
            .unwrap();
        frozen(r)
    }

    #[test]
    fn test_kl012_requires_frozen() {
        assert!(matches!(
            compile(&Registry::new(), None),
            Err(CompileError::NotFrozen)
        ));
    }

    #[test]
    fn test_kl012_deterministic() {
        let a = compile(&sample(), None).unwrap();
        let b = compile(&sample(), None).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("// @generated by kiln "));
        assert_eq!(artifact_digest(&a), artifact_digest(&b));
        assert!(artifact_digest(&a).unwrap().starts_with("blake3:"));
    }

    #[test]
    fn test_kl012_digest_covers_body() {
        let src = compile(&sample(), None).unwrap();
        let (_, body) = src.split_once("\n\n").unwrap();
        assert!(body.starts_with("pub struct CompiledContainer {"));
        let expected = crate::cache::hasher::hash_string(body);
        assert_eq!(artifact_digest(&src), Some(expected.as_str()));

        let mut r = Registry::new();
        r.add(Definition::new("db", Node::create("Pool", vec![]))).unwrap();
        let other = compile(&frozen(r), None).unwrap();
        assert_ne!(artifact_digest(&other), artifact_digest(&src));
    }

    #[test]
    fn test_kl012_methods_and_cells() {
        let src = compile(&sample(), None).unwrap();
        assert!(src.contains("fn service_http_router(&self)"));
        assert!(src.contains("cell_service_http_router: ::std::cell::OnceCell<::kiln::Value>"));
        assert!(src.contains("fn service_tmp(&self)"));
        assert!(!src.contains("cell_service_tmp"));
        assert!(src.contains("let _guard = self.stack.enter(\"http.router\")?;"));
    }

    #[test]
    fn test_kl012_statement_rendering() {
        let src = compile(&sample(), None).unwrap();
        assert!(src.contains(concat!(
            "self.factories.invoke(self, \"Router\", vec![self.service_db()?])?",
            ".fluent(\"route\", vec![::kiln::Value::from(\"/shop\")])?"
        )));
        assert!(src.contains(
            "self.factories.invoke(self, \"Pool\", vec![self.parameters.get(\"db.dsn\")?])?"
        ));
    }

    #[test]
    fn test_kl012_public_surface() {
        let src = compile(&sample(), None).unwrap();
        assert!(src.contains("impl ::kiln::Lookup for CompiledContainer"));
        assert!(src.contains("\"db\" => self.service_db(),"));
        assert!(!src.contains("\"tmp\" => self.service_tmp(),"));
        assert!(src.contains("matches!(id, \"db\" | \"http.router\")"));
        assert!(src.contains(concat!(
            "\"console.command\" => vec![(\"http.router\".to_string(), ",
            "::kiln::Value::map([(\"name\", ::kiln::Value::from(\"routes\"))]))],"
        )));
        assert!(src.contains("\"Pool\" => vec![\"db\".to_string()],"));
    }

    #[test]
    fn test_kl012_parameter_table() {
        let src = compile(&sample(), None).unwrap();
        assert!(src.contains("::kiln::Parameters::from_resolved(Self::parameter_table())"));
        assert!(src.contains(
            "(\"db\", ::kiln::Value::map([(\"dsn\", ::kiln::Value::from(\"pg://localhost\"))]))"
        ));
    }

    #[test]
    fn test_kl012_unknown_reference() {
        let mut r = Registry::new();
        r.add(Definition::new("a", Node::reference("ghost"))).unwrap();
        r.add(Definition::new("b", Node::optional("ghost"))).unwrap();
        let err = compile(&frozen(r), None).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnknownService { ref id, ref referenced_by }
                if id == "ghost" && referenced_by == "a"
        ));

        let mut r = Registry::new();
        r.add(Definition::new("b", Node::optional("ghost"))).unwrap();
        let src = compile(&frozen(r), None).unwrap();
        assert!(src.contains("let value = ::kiln::Value::Null;"));
    }

    #[test]
    fn test_kl012_callables_checked_against_factories() {
        let mut factories = Factories::new();
        factories.register_with_arity("Pool", Arity::Exact(1), |_, _| Ok(Value::Null));
        factories.register("Router", |_, _| Ok(Value::Null));
        let err = compile(&sample(), Some(&factories)).unwrap_err();
        assert!(matches!(err, CompileError::UnknownCallable { ref name, .. } if name == "Scratch"));

        factories.register_with_arity("Scratch", Arity::Exact(2), |_, _| Ok(Value::Null));
        let err = compile(&sample(), Some(&factories)).unwrap_err();
        assert!(matches!(err, CompileError::ArityMismatch { got: 0, .. }));
    }

    #[test]
    fn test_kl012_method_names_deduplicated() {
        let mut r = Registry::new();
        r.add(Definition::new("a.b", Node::literal(1))).unwrap();
        r.add(Definition::new("a_b", Node::literal(2))).unwrap();
        r.add(Definition::new("A-B", Node::literal(3))).unwrap();
        let src = compile(&frozen(r), None).unwrap();
        assert!(src.contains("fn service_a_b(&self)"));
        assert!(src.contains("fn service_a_b_2(&self)"));
        assert!(src.contains("fn service_a_b_3(&self)"));
    }

    #[test]
    fn test_kl012_literal_encoding() {
        let mut r = Registry::new();
        r.add(Definition::new(
            "lits",
            Node::literal(Value::List(vec![
                Value::Int(i64::MIN),
                Value::Float(f64::NAN),
                Value::Float(f64::NEG_INFINITY),
                Value::Float(1.5),
                Value::from("quote \" and \\ and $1"),
                Value::empty_map(),
            ])),
        ))
        .unwrap();
        let src = compile(&frozen(r), None).unwrap();
        assert!(src.contains("::kiln::Value::Int(i64::MIN)"));
        assert!(src.contains("::kiln::Value::Float(f64::NAN)"));
        assert!(src.contains("::kiln::Value::Float(f64::NEG_INFINITY)"));
        assert!(src.contains("::kiln::Value::Float(1.5_f64)"));
        assert!(src.contains(r#"::kiln::Value::from("quote \" and \\ and $1")"#));
        assert!(src.contains("::kiln::Value::empty_map()"));
    }

    #[derive(Debug)]
    struct Endpoint {
        url: String,
    }

    impl Service for Endpoint {
        fn type_name(&self) -> &str {
            "Endpoint"
        }

        fn export(&self) -> Value {
            Value::map([("url", Value::from(self.url.as_str()))])
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_kl012_service_literal_revived() {
        let mut r = Registry::new();
        r.add(Definition::new(
            "client",
            Node::create(
                "Client",
                vec![Node::literal(Value::service(Endpoint {
                    url: "https://api".into(),
                }))],
            ),
        ))
        .unwrap();
        let src = compile(&frozen(r), None).unwrap();
        assert!(src.contains(concat!(
            "self.factories.revive(self, \"Endpoint\", ",
            "::kiln::Value::map([(\"url\", ::kiln::Value::from(\"https://api\"))]))?"
        )));
    }

    #[test]
    fn test_kl012_setup_and_method_callable() {
        let mut r = Registry::new();
        r.add(Definition::new("factory", Node::create("Factory", vec![]))).unwrap();
        r.add(
            Definition::new(
                "made",
                Node::statement(Statement {
                    callable: Callable::Method(
                        Box::new(Node::reference("factory")),
                        "make".into(),
                    ),
                    args: vec![Node::literal(1)],
                    calls: vec![],
                }),
            )
            .setup("warm", vec![]),
        )
        .unwrap();
        let src = compile(&frozen(r), None).unwrap();
        assert!(src.contains(
            "let value = self.service_factory()?.invoke(\"make\", vec![::kiln::Value::Int(1)])?;"
        ));
        assert!(src.contains("value.invoke(\"warm\", vec![])?;"));
    }

    #[test]
    fn test_kl012_custom_crate_path() {
        let options = CompileOptions {
            crate_path: "crate".into(),
            struct_name: "AppContainer".into(),
        };
        let r = sample();
        let src = Compiler::new(&r, None, options).unwrap().compile().unwrap();
        assert!(src.contains("pub struct AppContainer {"));
        assert!(src.contains("impl crate::Lookup for AppContainer"));
        assert!(!src.contains("::kiln::"));
    }

    proptest! {
        #[test]
        fn prop_kl012_compile_is_deterministic(
            ids in proptest::collection::btree_set("[a-z]{1,6}(\\.[a-z]{1,4})?", 1..8)
        ) {
            let build = || {
                let mut r = Registry::new();
                let ids: Vec<&String> = ids.iter().collect();
                for (i, id) in ids.iter().enumerate() {
                    let root = match i.checked_sub(1) {
                        Some(prev) => {
                            Node::create("Wrap", vec![Node::reference(ids[prev].as_str())])
                        }
                        None => Node::literal(Value::Int(i as i64)),
                    };
                    r.add(Definition::new(id.as_str(), root)).unwrap();
                }
                frozen(r)
            };
            prop_assert_eq!(compile(&build(), None).unwrap(), compile(&build(), None).unwrap());
        }
    }
}
