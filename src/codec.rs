//! Serialization codec
//!
//! Values are encoded as JSON through `serde_json::Value`, whose object maps
//! are key-ordered, so identical inputs always produce identical bytes.
//! When schema validation is enabled, the schema registered for the longest
//! matching key prefix is checked on both encode and decode.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{CacheError, Schema};

/// JSON codec with optional per-prefix schema validation
#[derive(Debug, Clone, Default)]
pub struct Codec {
    validate: bool,
    /// Sorted by prefix length, longest first
    schemas: Arc<Vec<(String, Schema)>>,
}

impl Codec {
    pub fn new(validate: bool, schemas: Vec<(String, Schema)>) -> Self {
        let mut schemas = schemas;
        schemas.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            validate,
            schemas: Arc::new(schemas),
        }
    }

    pub fn validates(&self) -> bool {
        self.validate
    }

    /// Schema that governs `key`, if validation is on and one is registered
    pub fn schema_for(&self, key: &str) -> Option<&Schema> {
        if !self.validate {
            return None;
        }
        self.schemas
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, schema)| schema)
    }

    /// Convert a value to its JSON tree, validating it for `key`
    pub fn to_value<V: Serialize>(&self, key: &str, value: &V) -> Result<Value, CacheError> {
        let tree = serde_json::to_value(value)?;
        self.validate(key, &tree)?;
        Ok(tree)
    }

    /// Validate a JSON tree for `key` and convert it to `V`
    pub fn from_value<V: DeserializeOwned>(&self, key: &str, tree: Value) -> Result<V, CacheError> {
        self.validate(key, &tree)?;
        Ok(serde_json::from_value(tree)?)
    }

    pub fn encode<V: Serialize>(&self, key: &str, value: &V) -> Result<Vec<u8>, CacheError> {
        let tree = self.to_value(key, value)?;
        Ok(serde_json::to_vec(&tree)?)
    }

    pub fn decode<V: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<V, CacheError> {
        let tree: Value = serde_json::from_slice(bytes)?;
        self.from_value(key, tree)
    }

    /// Check a JSON tree against the schema governing `key`
    pub fn validate(&self, key: &str, tree: &Value) -> Result<(), CacheError> {
        match self.schema_for(key) {
            Some(schema) => schema.validate(tree).map_err(|v| CacheError::Schema {
                key: key.to_owned(),
                path: v.path,
                reason: v.reason,
            }),
            None => Ok(()),
        }
    }
}
