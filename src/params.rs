//! Scoped key/value parameter sources.
//!
//! Units read their configuration through [`ParameterProvider`], a typed view
//! on a hierarchical document. The provider keeps a scope stack: after
//! `push_scope("unit_000")` all lookups resolve relative to that scope until
//! the matching `pop_scope`.
//!
//! [`JsonParameterProvider`] implements the trait on top of `serde_json`.
//!
//! # Example
//!
//! ```
//! use unitflow::params::{JsonParameterProvider, ParameterProvider, with_scope};
//!
//! let mut provider = JsonParameterProvider::parse(r#"{
//!     "unit_000": { "NCOMP": 2, "VOLUME": 5.0, "INIT_C": [1.0, 0.0] }
//! }"#).unwrap();
//!
//! let volume = with_scope(&mut provider, "unit_000", |p| p.get_double("VOLUME")).unwrap();
//! assert_eq!(volume, 5.0);
//! assert_eq!(provider.scope_path(), "/");
//! ```

use serde_json::{Map, Value};

use crate::{ConfigError, ConfigResult};

/// Typed, scoped access to configuration values.
///
/// Getters return [`ConfigError::Missing`] for absent keys and
/// [`ConfigError::Invalid`] for type mismatches; both carry the full path.
pub trait ParameterProvider {
    fn get_double(&self, name: &str) -> ConfigResult<f64>;
    fn get_int(&self, name: &str) -> ConfigResult<i32>;
    fn get_uint64(&self, name: &str) -> ConfigResult<u64>;
    fn get_bool(&self, name: &str) -> ConfigResult<bool>;
    fn get_string(&self, name: &str) -> ConfigResult<String>;

    fn get_double_array(&self, name: &str) -> ConfigResult<Vec<f64>>;
    fn get_int_array(&self, name: &str) -> ConfigResult<Vec<i32>>;
    fn get_uint64_array(&self, name: &str) -> ConfigResult<Vec<u64>>;
    fn get_bool_array(&self, name: &str) -> ConfigResult<Vec<bool>>;
    fn get_string_array(&self, name: &str) -> ConfigResult<Vec<String>>;

    /// Returns true if `name` exists in the current scope.
    fn exists(&self, name: &str) -> bool;

    /// Returns true if `name` exists and is an array.
    fn is_array(&self, name: &str) -> bool;

    /// Enters a nested scope.
    fn push_scope(&mut self, scope: &str) -> ConfigResult<()>;

    /// Leaves the innermost scope (no-op at the root).
    fn pop_scope(&mut self);

    /// Path of the current scope, e.g. `/unit_001/sec_000`.
    fn scope_path(&self) -> String;

    fn set_double(&mut self, name: &str, value: f64);
    fn set_int(&mut self, name: &str, value: i32);
    fn set_uint64(&mut self, name: &str, value: u64);
    fn set_bool(&mut self, name: &str, value: bool);
    fn set_string(&mut self, name: &str, value: &str);

    fn set_double_array(&mut self, name: &str, values: &[f64]);
    fn set_int_array(&mut self, name: &str, values: &[i32]);
    fn set_uint64_array(&mut self, name: &str, values: &[u64]);
    fn set_bool_array(&mut self, name: &str, values: &[bool]);
    fn set_string_array(&mut self, name: &str, values: &[String]);

    /// Full path of a key in the current scope.
    fn path_of(&self, name: &str) -> String {
        let scope = self.scope_path();
        if scope.ends_with('/') { format!("{scope}{name}") } else { format!("{scope}/{name}") }
    }
}

/// Runs `f` inside `scope`, popping the scope whatever `f` returns.
pub fn with_scope<P, T, F>(provider: &mut P, scope: &str, f: F) -> ConfigResult<T>
where
    P: ParameterProvider + ?Sized,
    F: FnOnce(&mut P) -> ConfigResult<T>,
{
    provider.push_scope(scope)?;
    let result = f(provider);
    provider.pop_scope();
    result
}

/// Reads an optional double, falling back to `default`.
pub fn get_double_or<P: ParameterProvider + ?Sized>(provider: &P, name: &str, default: f64) -> ConfigResult<f64> {
    if provider.exists(name) { provider.get_double(name) } else { Ok(default) }
}

/// Reads a double array of exactly `len` entries.
pub fn get_double_array_len<P: ParameterProvider + ?Sized>(provider: &P, name: &str, len: usize) -> ConfigResult<Vec<f64>> {
    let values = provider.get_double_array(name)?;
    if values.len() != len {
        return Err(ConfigError::Invalid {
            path: provider.path_of(name),
            reason: format!("expected {len} entries, got {}", values.len()),
        });
    }
    Ok(values)
}

/// Name of the scope holding section-dependent values.
pub fn section_scope(sec_idx: usize) -> String {
    format!("sec_{sec_idx:03}")
}

/// Name of the scope holding a unit operation's configuration.
pub fn unit_scope(unit_idx: usize) -> String {
    format!("unit_{unit_idx:03}")
}

/// [`ParameterProvider`] over a JSON document.
#[derive(Debug, Clone)]
pub struct JsonParameterProvider {
    root: Value,
    scopes: Vec<String>,
}

impl Default for JsonParameterProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonParameterProvider {
    /// Creates a provider over an empty object.
    pub fn new() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    /// Wraps an existing JSON value.
    pub fn from_value(root: Value) -> Self {
        JsonParameterProvider { root, scopes: Vec::new() }
    }

    /// Parses a JSON document.
    pub fn parse(json: &str) -> ConfigResult<Self> {
        serde_json::from_str(json)
            .map(Self::from_value)
            .map_err(|e| ConfigError::Invalid { path: "/".to_string(), reason: e.to_string() })
    }

    /// The underlying document.
    pub fn value(&self) -> &Value {
        &self.root
    }

    fn current(&self) -> &Value {
        self.scopes.iter().fold(&self.root, |v, s| &v[s.as_str()])
    }

    fn current_mut(&mut self) -> &mut Value {
        let mut v = &mut self.root;
        for s in &self.scopes {
            v = &mut v[s.as_str()];
        }
        if !v.is_object() {
            *v = Value::Object(Map::new());
        }
        v
    }

    fn lookup(&self, name: &str) -> ConfigResult<&Value> {
        self.current().get(name).ok_or_else(|| ConfigError::Missing { path: self.path_of(name) })
    }

    fn invalid(&self, name: &str, expected: &str, found: &Value) -> ConfigError {
        ConfigError::Invalid { path: self.path_of(name), reason: format!("expected {expected}, found {found}") }
    }

    fn array<T>(&self, name: &str, expected: &str, convert: impl Fn(&Value) -> Option<T>) -> ConfigResult<Vec<T>> {
        let value = self.lookup(name)?;
        let items = value.as_array().ok_or_else(|| self.invalid(name, "array", value))?;
        items.iter().map(|item| convert(item).ok_or_else(|| self.invalid(name, expected, item))).collect()
    }

    fn insert(&mut self, name: &str, value: Value) {
        if let Value::Object(map) = self.current_mut() {
            map.insert(name.to_string(), value);
        }
    }
}

fn to_int(v: &Value) -> Option<i32> {
    match v {
        Value::Bool(b) => Some(i32::from(*b)),
        _ => v.as_i64().and_then(|i| i32::try_from(i).ok()),
    }
}

fn to_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        _ => v.as_i64().map(|i| i != 0),
    }
}

fn to_string(v: &Value) -> Option<String> {
    v.as_str().map(str::to_string)
}

impl ParameterProvider for JsonParameterProvider {
    fn get_double(&self, name: &str) -> ConfigResult<f64> {
        let v = self.lookup(name)?;
        v.as_f64().ok_or_else(|| self.invalid(name, "number", v))
    }

    fn get_int(&self, name: &str) -> ConfigResult<i32> {
        let v = self.lookup(name)?;
        to_int(v).ok_or_else(|| self.invalid(name, "integer", v))
    }

    fn get_uint64(&self, name: &str) -> ConfigResult<u64> {
        let v = self.lookup(name)?;
        v.as_u64().ok_or_else(|| self.invalid(name, "unsigned integer", v))
    }

    fn get_bool(&self, name: &str) -> ConfigResult<bool> {
        let v = self.lookup(name)?;
        to_bool(v).ok_or_else(|| self.invalid(name, "boolean", v))
    }

    fn get_string(&self, name: &str) -> ConfigResult<String> {
        let v = self.lookup(name)?;
        to_string(v).ok_or_else(|| self.invalid(name, "string", v))
    }

    fn get_double_array(&self, name: &str) -> ConfigResult<Vec<f64>> {
        self.array(name, "number", Value::as_f64)
    }

    fn get_int_array(&self, name: &str) -> ConfigResult<Vec<i32>> {
        self.array(name, "integer", to_int)
    }

    fn get_uint64_array(&self, name: &str) -> ConfigResult<Vec<u64>> {
        self.array(name, "unsigned integer", Value::as_u64)
    }

    fn get_bool_array(&self, name: &str) -> ConfigResult<Vec<bool>> {
        self.array(name, "boolean", to_bool)
    }

    fn get_string_array(&self, name: &str) -> ConfigResult<Vec<String>> {
        self.array(name, "string", to_string)
    }

    fn exists(&self, name: &str) -> bool {
        self.current().get(name).is_some()
    }

    fn is_array(&self, name: &str) -> bool {
        self.current().get(name).is_some_and(Value::is_array)
    }

    fn push_scope(&mut self, scope: &str) -> ConfigResult<()> {
        if !self.current().get(scope).is_some_and(Value::is_object) {
            return Err(ConfigError::MissingScope { path: self.path_of(scope) });
        }
        self.scopes.push(scope.to_string());
        Ok(())
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn scope_path(&self) -> String {
        format!("/{}", self.scopes.join("/"))
    }

    fn set_double(&mut self, name: &str, value: f64) {
        self.insert(name, Value::from(value));
    }

    fn set_int(&mut self, name: &str, value: i32) {
        self.insert(name, Value::from(value));
    }

    fn set_uint64(&mut self, name: &str, value: u64) {
        self.insert(name, Value::from(value));
    }

    fn set_bool(&mut self, name: &str, value: bool) {
        self.insert(name, Value::from(value));
    }

    fn set_string(&mut self, name: &str, value: &str) {
        self.insert(name, Value::from(value));
    }

    fn set_double_array(&mut self, name: &str, values: &[f64]) {
        self.insert(name, Value::from(values.to_vec()));
    }

    fn set_int_array(&mut self, name: &str, values: &[i32]) {
        self.insert(name, Value::from(values.to_vec()));
    }

    fn set_uint64_array(&mut self, name: &str, values: &[u64]) {
        self.insert(name, Value::from(values.to_vec()));
    }

    fn set_bool_array(&mut self, name: &str, values: &[bool]) {
        self.insert(name, Value::from(values.to_vec()));
    }

    fn set_string_array(&mut self, name: &str, values: &[String]) {
        self.insert(name, Value::from(values.to_vec()));
    }
}

impl JsonParameterProvider {
    /// Creates (if needed) and enters a nested scope, for building configurations in code.
    pub fn push_new_scope(&mut self, scope: &str) {
        if !self.current().get(scope).is_some_and(Value::is_object) {
            self.insert(scope, Value::Object(Map::new()));
        }
        self.scopes.push(scope.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> JsonParameterProvider {
        JsonParameterProvider::from_value(json!({
            "unit_001": {
                "NCOMP": 4,
                "IS_KINETIC": 1,
                "VOLUME": 5.0,
                "INLET_TYPE": "PIECEWISE_CUBIC_POLY",
                "sec_000": { "CONST_COEFF": [50.0, 0.0, 0.0, 0.0] }
            }
        }))
    }

    #[test]
    fn test_typed_getters() {
        let mut p = provider();
        p.push_scope("unit_001").unwrap();
        assert_eq!(p.get_int("NCOMP").unwrap(), 4);
        assert_eq!(p.get_uint64("NCOMP").unwrap(), 4);
        assert_eq!(p.get_double("VOLUME").unwrap(), 5.0);
        assert!(p.get_bool("IS_KINETIC").unwrap());
        assert_eq!(p.get_string("INLET_TYPE").unwrap(), "PIECEWISE_CUBIC_POLY");
    }

    #[test]
    fn test_missing_and_invalid_carry_path() {
        let mut p = provider();
        p.push_scope("unit_001").unwrap();
        assert_eq!(p.get_double("FLOW"), Err(ConfigError::Missing { path: "/unit_001/FLOW".to_string() }));
        match p.get_double("INLET_TYPE") {
            Err(ConfigError::Invalid { path, .. }) => assert_eq!(path, "/unit_001/INLET_TYPE"),
            other => panic!("expected invalid parameter, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_scopes_and_arrays() {
        let mut p = provider();
        p.push_scope("unit_001").unwrap();
        p.push_scope(&section_scope(0)).unwrap();
        assert_eq!(p.scope_path(), "/unit_001/sec_000");
        assert!(p.is_array("CONST_COEFF"));
        assert_eq!(p.get_double_array("CONST_COEFF").unwrap(), vec![50.0, 0.0, 0.0, 0.0]);
        assert!(p.push_scope("sec_001").is_err());
        p.pop_scope();
        p.pop_scope();
        p.pop_scope();
        assert_eq!(p.scope_path(), "/");
    }

    #[test]
    fn test_with_scope_pops_on_error() {
        let mut p = provider();
        let result = with_scope(&mut p, "unit_001", |p| p.get_double("MISSING"));
        assert!(result.is_err());
        assert_eq!(p.scope_path(), "/");
    }

    #[test]
    fn test_setters_round_trip() {
        let mut p = JsonParameterProvider::new();
        p.push_new_scope("unit_000");
        p.set_int("NCOMP", 2);
        p.set_double_array("INIT_C", &[1.0, 2.0]);
        p.set_bool("IS_KINETIC", false);
        p.set_string("BINDING", "LANGMUIR");
        p.pop_scope();

        p.push_scope("unit_000").unwrap();
        assert_eq!(p.get_int("NCOMP").unwrap(), 2);
        assert_eq!(p.get_double_array("INIT_C").unwrap(), vec![1.0, 2.0]);
        assert!(!p.get_bool("IS_KINETIC").unwrap());
        assert_eq!(p.get_string("BINDING").unwrap(), "LANGMUIR");
        assert!(!p.exists("VOLUME"));
    }

    #[test]
    fn test_array_length_check() {
        let mut p = provider();
        p.push_scope("unit_001").unwrap();
        p.push_scope("sec_000").unwrap();
        assert!(get_double_array_len(&p, "CONST_COEFF", 4).is_ok());
        assert!(get_double_array_len(&p, "CONST_COEFF", 3).is_err());
        assert_eq!(get_double_or(&p, "LIN_COEFF", 0.0).unwrap(), 0.0);
    }
}
