//! KL-003: Parameter tree and `%key%` interpolation.
//!
//! Keys are dotted paths into a nested map (`database.host`). Inside strings:
//! - `%key%` interpolates; a string that is a single reference keeps the
//!   referenced value's type
//! - `%%` is a literal percent sign
//! - `%outer.%inner%%` resolves `inner` first and splices it into the key
//! - a `%` that does not start a well-formed reference is kept verbatim
//!
//! Expansion depth is capped at the number of declared leaves + 1; hitting the
//! cap means the references never reach a fixed point.

use super::value::Value;
use indexmap::IndexMap;
use thiserror::Error;

/// Parameter resolution failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParameterError {
    /// Referenced key is not declared.
    #[error("unknown parameter '{key}'")]
    UnknownParameter { key: String },

    /// References do not converge.
    #[error("parameter cycle detected: {chain}")]
    ParameterCycle { chain: String },

    /// A list or map was interpolated into a longer string.
    #[error("parameter '{key}' is a {kind} and cannot be interpolated into '{template}'")]
    NonScalarInterpolation {
        key: String,
        kind: &'static str,
        template: String,
    },
}

/// Nested configuration parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    tree: IndexMap<String, Value>,
    /// Leaves are already expanded; lookups return them as stored.
    resolved: bool,
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn count_leaves(value: &Value) -> usize {
    match value {
        Value::Map(map) => map.values().map(count_leaves).sum::<usize>().max(1),
        _ => 1,
    }
}

/// Recursively merge `incoming` into `base`; maps merge, everything else
/// is replaced.
pub fn deep_merge(base: &mut IndexMap<String, Value>, incoming: IndexMap<String, Value>) {
    for (key, value) in incoming {
        match (base.get_mut(&key), value) {
            (Some(Value::Map(existing)), Value::Map(next)) => deep_merge(existing, next),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

enum Segment {
    Text(String),
    Ref(String),
}

impl Parameters {
    pub fn new(tree: IndexMap<String, Value>) -> Self {
        Self {
            tree,
            resolved: false,
        }
    }

    /// Build from a map value; any other value yields an empty tree.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Map(tree) => Self::new(tree),
            _ => Self::default(),
        }
    }

    /// Wrap a tree that was already expanded by [`Parameters::resolve`].
    pub fn from_resolved(value: Value) -> Self {
        let mut parameters = Self::from_value(value);
        parameters.resolved = true;
        parameters
    }

    pub fn tree(&self) -> &IndexMap<String, Value> {
        &self.tree
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Set a dotted key, creating intermediate maps.
    pub fn set(&mut self, key: &str, value: Value) {
        self.resolved = false;
        let mut parts: Vec<&str> = key.split('.').collect();
        let last = parts.pop().unwrap_or(key);
        let mut node = &mut self.tree;
        for part in parts {
            let slot = node
                .entry(part.to_string())
                .or_insert_with(Value::empty_map);
            if !matches!(slot, Value::Map(_)) {
                *slot = Value::empty_map();
            }
            node = match slot {
                Value::Map(map) => map,
                _ => return,
            };
        }
        node.insert(last.to_string(), value);
    }

    /// Deep-merge another tree over this one.
    pub fn merge(&mut self, incoming: IndexMap<String, Value>) {
        self.resolved = false;
        deep_merge(&mut self.tree, incoming);
    }

    /// Unexpanded value at a dotted key.
    pub fn raw(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.tree.get(key) {
            return Some(v);
        }
        let mut parts = key.split('.');
        let mut current = self.tree.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn depth_cap(&self) -> usize {
        self.tree.values().map(count_leaves).sum::<usize>() + 1
    }

    /// Fully expanded value at a key. The key may itself contain nested
    /// references (`db.%env%.host`).
    pub fn get(&self, key: &str) -> Result<Value, ParameterError> {
        let mut chain = Vec::new();
        let key = self.resolve_key(key, 0, &mut chain)?;
        self.lookup(&key, 0, &mut chain)
    }

    /// Expand every string inside `value`.
    pub fn expand(&self, value: &Value) -> Result<Value, ParameterError> {
        self.expand_at(value, 0, &mut Vec::new())
    }

    /// Expand a single string.
    pub fn expand_str(&self, template: &str) -> Result<Value, ParameterError> {
        self.interpolate(template, 0, &mut Vec::new())
    }

    /// Expand the whole tree so later reads need no interpolation.
    pub fn resolve(&self) -> Result<Parameters, ParameterError> {
        if self.resolved {
            return Ok(self.clone());
        }
        let mut tree = IndexMap::with_capacity(self.tree.len());
        for (key, value) in &self.tree {
            let mut chain = vec![key.clone()];
            tree.insert(key.clone(), self.expand_at(value, 1, &mut chain)?);
        }
        Ok(Parameters {
            tree,
            resolved: true,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    fn resolve_key(
        &self,
        key: &str,
        depth: usize,
        chain: &mut Vec<String>,
    ) -> Result<String, ParameterError> {
        if !key.contains('%') {
            return Ok(key.to_string());
        }
        let resolved = self.interpolate(key, depth, chain)?;
        resolved
            .to_interpolated()
            .ok_or_else(|| ParameterError::NonScalarInterpolation {
                key: key.to_string(),
                kind: resolved.kind(),
                template: key.to_string(),
            })
    }

    fn lookup(
        &self,
        key: &str,
        depth: usize,
        chain: &mut Vec<String>,
    ) -> Result<Value, ParameterError> {
        chain.push(key.to_string());
        if depth > self.depth_cap() {
            return Err(ParameterError::ParameterCycle {
                chain: describe_cycle(chain),
            });
        }
        let raw = self
            .raw(key)
            .ok_or_else(|| ParameterError::UnknownParameter {
                key: key.to_string(),
            })?;
        let value = if self.resolved {
            raw.clone()
        } else {
            self.expand_at(raw, depth + 1, chain)?
        };
        chain.pop();
        Ok(value)
    }

    fn expand_at(
        &self,
        value: &Value,
        depth: usize,
        chain: &mut Vec<String>,
    ) -> Result<Value, ParameterError> {
        match value {
            Value::Str(s) if s.contains('%') => self.interpolate(s, depth, chain),
            Value::List(items) => items
                .iter()
                .map(|item| self.expand_at(item, depth, chain))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Map(map) => {
                let mut out = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.expand_at(v, depth, chain)?);
                }
                Ok(Value::Map(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn interpolate(
        &self,
        template: &str,
        depth: usize,
        chain: &mut Vec<String>,
    ) -> Result<Value, ParameterError> {
        let chars: Vec<char> = template.chars().collect();
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut pos = 0;

        while pos < chars.len() {
            let c = chars[pos];
            if c != '%' {
                text.push(c);
                pos += 1;
                continue;
            }
            if chars.get(pos + 1) == Some(&'%') {
                text.push('%');
                pos += 2;
                continue;
            }
            pos += 1;
            match self.parse_reference(&chars, &mut pos, depth, chain)? {
                Some(key) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Ref(key));
                }
                None => text.push('%'),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        if let [Segment::Ref(key)] = segments.as_slice() {
            return self.lookup(key, depth, chain);
        }

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Text(t) => out.push_str(&t),
                Segment::Ref(key) => {
                    let value = self.lookup(&key, depth, chain)?;
                    let piece = value
                        .to_interpolated()
                        .ok_or_else(|| ParameterError::NonScalarInterpolation {
                            key: key.clone(),
                            kind: value.kind(),
                            template: template.to_string(),
                        })?;
                    out.push_str(&piece);
                }
            }
        }
        Ok(Value::Str(out))
    }

    /// Parse a reference body after its opening `%`. On a malformed
    /// reference, rewinds `pos` and returns `None`.
    fn parse_reference(
        &self,
        chars: &[char],
        pos: &mut usize,
        depth: usize,
        chain: &mut Vec<String>,
    ) -> Result<Option<String>, ParameterError> {
        let start = *pos;
        let mut key = String::new();
        loop {
            match chars.get(*pos) {
                Some('%') if key.ends_with('.') => {
                    *pos += 1;
                    match self.parse_reference(chars, pos, depth, chain)? {
                        Some(inner) => {
                            let value = self.lookup(&inner, depth, chain)?;
                            let piece = value.to_interpolated().ok_or_else(|| {
                                ParameterError::NonScalarInterpolation {
                                    key: inner.clone(),
                                    kind: value.kind(),
                                    template: chars.iter().collect(),
                                }
                            })?;
                            key.push_str(&piece);
                        }
                        None => {
                            *pos = start;
                            return Ok(None);
                        }
                    }
                }
                Some('%') if !key.is_empty() => {
                    *pos += 1;
                    return Ok(Some(key));
                }
                Some(c) if is_key_char(*c) => {
                    key.push(*c);
                    *pos += 1;
                }
                _ => {
                    *pos = start;
                    return Ok(None);
                }
            }
        }
    }
}

fn describe_cycle(chain: &[String]) -> String {
    let last = match chain.last() {
        Some(last) => last,
        None => return String::new(),
    };
    let first = chain.iter().position(|k| k == last).unwrap_or(0);
    chain[first..].join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(yaml: &str) -> Parameters {
        Parameters::new(serde_yaml_ng::from_str(yaml).unwrap())
    }

    #[test]
    fn test_kl003_plain_lookup() {
        let p = params("db:\n  host: localhost\n  port: 5432\n");
        assert_eq!(p.get("db.host").unwrap(), Value::from("localhost"));
        assert_eq!(p.get("db.port").unwrap(), Value::Int(5432));
    }

    #[test]
    fn test_kl003_whole_reference_keeps_type() {
        let p = params("port: 8080\nlisten: '%port%'\n");
        assert_eq!(p.get("listen").unwrap(), Value::Int(8080));
    }

    #[test]
    fn test_kl003_mixed_interpolation() {
        let p = params("app_dir: /srv/app\ncache_dir: '%app_dir%/cache'\n");
        assert_eq!(p.get("cache_dir").unwrap(), Value::from("/srv/app/cache"));
        assert_eq!(
            p.expand_str("%cache_dir%/routes").unwrap(),
            Value::from("/srv/app/cache/routes")
        );
    }

    #[test]
    fn test_kl003_nested_reference() {
        let p = params("env: prod\ndb:\n  prod: db.internal\n  dev: localhost\n");
        assert_eq!(
            p.expand_str("%db.%env%%").unwrap(),
            Value::from("db.internal")
        );
        assert_eq!(p.get("db.%env%").unwrap(), Value::from("db.internal"));
    }

    #[test]
    fn test_kl003_escaped_percent() {
        let p = params("rate: 50\n");
        assert_eq!(p.expand_str("%rate%%% off").unwrap(), Value::from("50% off"));
        assert_eq!(p.expand_str("100%% sure").unwrap(), Value::from("100% sure"));
    }

    #[test]
    fn test_kl003_stray_percent_kept() {
        let p = Parameters::default();
        assert_eq!(p.expand_str("50% off").unwrap(), Value::from("50% off"));
    }

    #[test]
    fn test_kl003_unknown_parameter() {
        let p = Parameters::default();
        let err = p.expand_str("%missing%").unwrap_err();
        assert_eq!(
            err,
            ParameterError::UnknownParameter {
                key: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_kl003_cycle_detected() {
        let p = params("a: '%b%'\nb: '%a%'\n");
        let err = p.get("a").unwrap_err();
        match err {
            ParameterError::ParameterCycle { chain } => {
                assert!(chain.contains("a -> b") || chain.contains("b -> a"), "{}", chain);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        assert!(p.resolve().is_err());
    }

    #[test]
    fn test_kl003_self_cycle() {
        let p = params("a: 'x%a%'\n");
        assert!(matches!(
            p.get("a"),
            Err(ParameterError::ParameterCycle { .. })
        ));
    }

    #[test]
    fn test_kl003_non_scalar_interpolation() {
        let p = params("hosts: [a, b]\n");
        let err = p.expand_str("hosts=%hosts%").unwrap_err();
        assert!(matches!(err, ParameterError::NonScalarInterpolation { .. }));
        // a whole reference to a list is fine
        assert_eq!(
            p.expand_str("%hosts%").unwrap(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_kl003_resolve_whole_tree() {
        let p = params("root: /srv\npaths:\n  log: '%root%/log'\n  tmp: '%paths.log%/tmp'\n");
        let resolved = p.resolve().unwrap();
        assert_eq!(
            resolved.raw("paths.tmp"),
            Some(&Value::from("/srv/log/tmp"))
        );
    }

    #[test]
    fn test_kl003_resolved_escapes_not_reexpanded() {
        let p = params("b: x\ntext: 'a%%b%%c'\n");
        let resolved = p.resolve().unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.get("text").unwrap(), Value::from("a%b%c"));
    }

    #[test]
    fn test_kl003_set_dotted() {
        let mut p = Parameters::default();
        p.set("mail.smtp.host", Value::from("mx"));
        p.set("mail.from", Value::from("noreply"));
        assert_eq!(p.get("mail.smtp.host").unwrap(), Value::from("mx"));
        assert_eq!(p.get("mail.from").unwrap(), Value::from("noreply"));
    }

    #[test]
    fn test_kl003_deep_merge() {
        let mut p = params("db:\n  host: a\n  port: 1\n");
        p.merge(serde_yaml_ng::from_str("db:\n  host: b\n").unwrap());
        assert_eq!(p.get("db.host").unwrap(), Value::from("b"));
        assert_eq!(p.get("db.port").unwrap(), Value::Int(1));
    }
}
