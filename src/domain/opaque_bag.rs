//! The `OpaqueBag` type (`SPEC_FULL.md` §9 redesign guidance).
//!
//! Replaces ad-hoc "coerce anything to a dict" helpers from the source
//! system with a single, string-keyed, JSON-serializable value type used for
//! job parameters, log details, and result summaries. All boundary
//! serializers (HTTP bodies, `jsonb` columns) target this type directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A string-keyed bag of JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueBag(Map<String, Value>);

impl OpaqueBag {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for OpaqueBag {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for OpaqueBag {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(format!("expected a JSON object, got {other}")),
        }
    }
}
