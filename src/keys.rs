//! Backing-store key layout

/// Namespaces caller keys so the cache can share a Redis database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key holding the encoded entry
    pub fn data_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Key holding the lock token for `key`
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}lock:{}", self.prefix, key)
    }

    /// Counter used to version entries written for `key`
    pub fn version_key(&self, key: &str) -> String {
        format!("{}version:{}", self.prefix, key)
    }
}
