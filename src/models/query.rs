//! Query-related data models.
//!
//! This module defines bound parameters, the compiled-statement contract consumed
//! from an external query compiler, and statement timeout options.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// A decoded result row, keyed by column name.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(serialize_with = "base64_bytes::serialize", skip_deserializing)]
    Bytes(Vec<u8>),
    /// JSON document
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }
}

/// SQL text plus positional bindings, as produced by a query compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    #[serde(default)]
    pub bindings: Vec<QueryParam>,
}

impl CompiledQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
        }
    }

    /// Add a positional binding.
    pub fn with_binding(mut self, param: impl Into<QueryParam>) -> Self {
        self.bindings.push(param.into());
        self
    }
}

/// Contract for anything that can be turned into SQL and bindings.
///
/// The connection layer never builds SQL itself; query builders implement this.
pub trait CompileQuery {
    fn compile(&self) -> CompiledQuery;
}

impl CompileQuery for CompiledQuery {
    fn compile(&self) -> CompiledQuery {
        self.clone()
    }
}

impl CompileQuery for str {
    fn compile(&self) -> CompiledQuery {
        CompiledQuery::new(self)
    }
}

impl CompileQuery for String {
    fn compile(&self) -> CompiledQuery {
        CompiledQuery::new(self.as_str())
    }
}

/// Options for the client-side statement watchdog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutOptions {
    /// Ask the server to cancel the running statement when the watchdog fires.
    /// Ignored by drivers that cannot cancel; the statement keeps running there.
    pub cancel: bool,
}

/// A statement timeout as configured on a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTimeout {
    pub duration: Duration,
    pub options: TimeoutOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(
            QueryParam::String("hello".to_string()).type_name(),
            "string"
        );
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some("x")), QueryParam::String("x".into()));
    }

    #[test]
    fn test_query_param_deserializes_untagged() {
        let params: Vec<QueryParam> =
            serde_json::from_str(r#"[null, true, 7, 1.5, "a", {"k": 1}]"#).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(7),
                QueryParam::Float(1.5),
                QueryParam::String("a".to_string()),
                QueryParam::Json(serde_json::json!({"k": 1})),
            ]
        );
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let json = serde_json::to_string(&QueryParam::Bytes(b"hi".to_vec())).unwrap();
        assert_eq!(json, r#""aGk=""#);
    }

    #[test]
    fn test_compiled_query_builder() {
        let query = CompiledQuery::new("SELECT * FROM users WHERE id = ?")
            .with_binding(1)
            .with_binding("x");
        assert_eq!(query.bindings.len(), 2);
        assert_eq!("SELECT 1".compile().sql, "SELECT 1");
        assert_eq!(query.compile(), query);
    }
}
