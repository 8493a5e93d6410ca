//! Declared argument types, coercion, and positional/keyword binding.
//!
//! Mirrors `original_source/pitcrew/task.py`'s `Argument`/`Parameters`
//! machinery: a task declares an ordered list of [`ArgumentDecl`]s, and
//! [`bind_arguments`] walks the declarations against the caller's positional
//! and keyword values exactly once per invocation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CrewError, Result};

/// A bound or default argument value. Return values and outcome payloads
/// reuse this type too, since the wire format (spec §6) is JSON-shaped
/// anyway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    Bytes(Vec<u8>),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    Null,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::Null => "null",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts to a JSON value for the outcome wire format (spec §6): bytes
    /// are emitted as UTF-8 when decodable, otherwise base64.
    pub fn to_wire_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::Null => serde_json::Value::Null,
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_wire_json).collect())
            }
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s.to_owned()),
                Err(_) => {
                    use base64::Engine;
                    serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
                }
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// The declared semantic type of an argument or a return descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Bytes,
    Int,
    Bool,
    /// No type checking is performed.
    Any,
}

impl ArgType {
    fn matches(self, value: &Value) -> bool {
        match self {
            ArgType::Any => true,
            ArgType::Str => matches!(value, Value::Str(_)),
            ArgType::Bytes => matches!(value, Value::Bytes(_)),
            ArgType::Int => matches!(value, Value::Int(_)),
            ArgType::Bool => matches!(value, Value::Bool(_)),
        }
    }

    /// Whether `value` satisfies this declared type, used by return-type
    /// enforcement (spec §4.6) as well as argument binding.
    pub fn value_matches(self, value: &Value) -> bool {
        self.matches(value)
    }

    /// string -> declared type coercion, used when `coerce` is requested.
    fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (ArgType::Bytes, Value::Str(s)) => Value::Bytes(s.into_bytes()),
            (ArgType::Int, Value::Str(s)) => match s.parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Str(s),
            },
            (_, v) => v,
        }
    }
}

/// A single declared argument. Built with [`ArgumentDecl::new`] and the
/// `required`/`default`/`variadic`/`description` builder methods.
#[derive(Debug, Clone)]
pub struct ArgumentDecl {
    pub name: String,
    pub ty: ArgType,
    pub required: bool,
    pub default: Option<Value>,
    pub variadic: bool,
    pub description: String,
}

impl ArgumentDecl {
    pub fn new(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            variadic: false,
            description: String::new(),
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    pub fn variadic(mut self, variadic: bool) -> Self {
        self.variadic = variadic;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// `env` is reserved: it is always implicitly available to a task body
    /// as the environment overlay passed to `sh*`, never as a declared
    /// argument.
    pub fn validate_name(&self) -> Result<()> {
        if self.name == "env" {
            return Err(CrewError::ReservedArgumentName(self.name.clone()));
        }
        Ok(())
    }

    /// Processes one raw value: coerces if requested, applies the default
    /// when absent, and enforces the required/type invariants.
    pub fn process(&self, raw: Option<Value>, coerce: bool) -> Result<Value> {
        let value = match raw {
            Some(v) if coerce => self.ty.coerce(v),
            Some(v) => v,
            None => None.into_iter().next().unwrap_or(Value::Null),
        };
        let value = if raw_is_none(&value) {
            if self.required {
                return Err(CrewError::MissingArgument(self.name.clone()));
            }
            self.default.clone().unwrap_or(Value::Null)
        } else {
            value
        };
        if !value.is_null() && self.ty != ArgType::Any && !self.ty.matches(&value) {
            return Err(CrewError::ArgumentTypeMismatch {
                name: self.name.clone(),
                expected: format!("{:?}", self.ty),
                value: format!("{value:?}"),
            });
        }
        Ok(value)
    }
}

fn raw_is_none(v: &Value) -> bool {
    matches!(v, Value::Null)
}

/// The resolved argument map presented to a task body. Immutable for the
/// duration of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    values: HashMap<String, Value>,
    escaped: HashMap<String, String>,
}

impl Parameters {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// The shell-escaped companion of a string-typed argument, exposed under
    /// the conventional `esc_<name>` accessor (spec §4.5).
    pub fn esc(&self, name: &str) -> Option<&str> {
        self.escaped.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Binds `positional`/`keyword` caller-supplied values against `decls`, in
/// declaration order, per spec §4.5's binding protocol.
pub fn bind_arguments(
    decls: &[ArgumentDecl],
    positional: Vec<Value>,
    mut keyword: HashMap<String, Value>,
) -> Result<Parameters> {
    let mut positional = positional.into_iter();
    let mut values = HashMap::new();
    let mut escaped = HashMap::new();
    for decl in decls {
        decl.validate_name()?;
        let raw = if decl.variadic {
            let rest: Vec<Value> = positional.by_ref().collect();
            if rest.is_empty() {
                keyword.remove(&decl.name)
            } else {
                Some(Value::List(rest))
            }
        } else if decl.required {
            // only required arguments consume a positional value; optional
            // ones must be bound from keywords so a positional value meant
            // for a later required argument isn't stolen
            if let Some(v) = positional.next() {
                Some(v)
            } else {
                keyword.remove(&decl.name)
            }
        } else {
            keyword.remove(&decl.name)
        };
        let bound = decl.process(raw, true)?;
        if let Value::Str(s) = &bound {
            escaped.insert(decl.name.clone(), crate::context::esc(s));
        }
        values.insert(decl.name.clone(), bound);
    }
    let leftover_positional: Vec<Value> = positional.collect();
    if !leftover_positional.is_empty() || !keyword.is_empty() {
        let mut unexpected: Vec<String> =
            leftover_positional.iter().map(|v| format!("{v:?}")).collect();
        unexpected.extend(keyword.keys().cloned());
        return Err(CrewError::UnexpectedArgument(unexpected.join(", ")));
    }
    Ok(Parameters { values, escaped })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn binds_positional_in_order() {
        let decls = vec![
            ArgumentDecl::new("path", ArgType::Str),
            ArgumentDecl::new("content", ArgType::Bytes),
        ];
        let params = bind_arguments(
            &decls,
            vec![Value::from("/tmp/x"), Value::from("abc".as_bytes().to_vec())],
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(params.str("path"), Some("/tmp/x"));
        assert_eq!(params.esc("path"), Some("/tmp/x"));
    }

    #[test]
    fn missing_required_argument_fails() {
        let decls = vec![ArgumentDecl::new("path", ArgType::Str)];
        let err = bind_arguments(&decls, vec![], HashMap::new()).unwrap_err();
        assert!(matches!(err, CrewError::MissingArgument(_)));
    }

    #[test]
    fn unexpected_keyword_fails() {
        let decls = vec![ArgumentDecl::new("path", ArgType::Str)];
        let err =
            bind_arguments(&decls, vec![Value::from("/tmp/x")], kw(&[("bogus", Value::Int(1))]))
                .unwrap_err();
        assert!(matches!(err, CrewError::UnexpectedArgument(_)));
    }

    #[test]
    fn variadic_collects_remaining_positional() {
        let decls = vec![ArgumentDecl::new("items", ArgType::Any).variadic(true)];
        let params = bind_arguments(
            &decls,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(params.get("items"), Some(&Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])));
    }

    #[test]
    fn declaring_env_is_rejected() {
        let decl = ArgumentDecl::new("env", ArgType::Any);
        assert!(matches!(decl.validate_name(), Err(CrewError::ReservedArgumentName(_))));
    }

    #[test]
    fn optional_argument_does_not_steal_a_positional_meant_for_a_later_required_one() {
        let decls = vec![
            ArgumentDecl::new("owner", ArgType::Str).required(false),
            ArgumentDecl::new("path", ArgType::Str),
        ];
        let params = bind_arguments(&decls, vec![Value::from("/tmp/x")], HashMap::new()).unwrap();
        assert_eq!(params.get("owner"), Some(&Value::Null));
        assert_eq!(params.str("path"), Some("/tmp/x"));
    }

    #[test]
    fn optional_argument_binds_from_a_keyword_even_with_positional_values_left() {
        let decls = vec![
            ArgumentDecl::new("path", ArgType::Str),
            ArgumentDecl::new("owner", ArgType::Str).required(false),
        ];
        let params = bind_arguments(
            &decls,
            vec![Value::from("/tmp/x")],
            kw(&[("owner", Value::from("alice"))]),
        )
        .unwrap();
        assert_eq!(params.str("path"), Some("/tmp/x"));
        assert_eq!(params.str("owner"), Some("alice"));
    }
}
