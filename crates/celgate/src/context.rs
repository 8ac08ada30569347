//! Caller attribute context.
//!
//! Transport interceptors extract the calling request's metadata into an
//! [`AttributeContext`] before invoking a service validator. The engine
//! never constructs one itself; it only reads it.

use std::collections::BTreeMap;
use std::sync::Arc;

use celgate_cel::value::{MapKey, Value, ValueMap};

/// Case-insensitive header multimap.
///
/// Keys are folded to lowercase on insert and lookup; duplicate keys
/// accumulate values in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .entry(key.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// The first value for a key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values for a key; empty when absent.
    pub fn values(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert into the `map<string, list<string>>` value bound as
    /// `headers` during evaluation.
    pub fn to_value(&self) -> Value {
        let map: ValueMap = self
            .entries
            .iter()
            .map(|(key, values)| {
                let list: Vec<Value> = values.iter().map(|v| Value::from(v.as_str())).collect();
                (MapKey::String(Arc::from(key.as_str())), Value::from(list))
            })
            .collect();
        Value::from(map)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = HeaderMap::new();
        for (key, value) in iter {
            headers.insert(key, value);
        }
        headers
    }
}

/// Metadata about the calling request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeContext {
    /// Full method name being invoked (e.g. `/pkg.v1.Demo/Get`).
    pub operation: String,
    /// Transport protocol (e.g. `grpc`, `grpc-web`, `connect`).
    pub protocol: String,
    /// Peer address of the caller.
    pub peer_address: String,
    /// Peer port of the caller.
    pub peer_port: u32,
    /// Caller-supplied headers.
    pub headers: HeaderMap,
}

impl AttributeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_peer(mut self, address: impl Into<String>, port: u32) -> Self {
        self.peer_address = address.into();
        self.peer_port = port;
        self
    }

    pub fn with_header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Convert into the value bound as `attribute_context`.
    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(
            MapKey::String(Arc::from("operation")),
            Value::from(self.operation.as_str()),
        );
        map.insert(
            MapKey::String(Arc::from("protocol")),
            Value::from(self.protocol.as_str()),
        );
        map.insert(
            MapKey::String(Arc::from("peer_address")),
            Value::from(self.peer_address.as_str()),
        );
        map.insert(
            MapKey::String(Arc::from("peer_port")),
            Value::UInt(self.peer_port as u64),
        );
        map.insert(MapKey::String(Arc::from("headers")), self.headers.to_value());
        Value::from(map)
    }

    /// Short rendering attached to validation failures.
    pub fn summary(&self) -> String {
        format!(
            "operation={} protocol={} peer={}:{}",
            self.operation, self.protocol, self.peer_address, self.peer_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Token", "abc");
        assert_eq!(headers.get("x-token"), Some("abc"));
        assert_eq!(headers.get("X-TOKEN"), Some("abc"));
        assert!(headers.contains_key("x-Token"));
    }

    #[test]
    fn duplicate_keys_accumulate() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "a");
        headers.insert("Accept", "b");
        assert_eq!(headers.values("accept"), &["a", "b"]);
        assert_eq!(headers.get("accept"), Some("a"));
    }

    #[test]
    fn absent_key_is_empty() {
        let headers = HeaderMap::new();
        assert_eq!(headers.get("missing"), None);
        assert!(headers.values("missing").is_empty());
    }

    #[test]
    fn context_to_value_exposes_fields() {
        let ctx = AttributeContext::new()
            .with_operation("/pkg.v1.Demo/Get")
            .with_protocol("grpc")
            .with_peer("10.0.0.1", 50051)
            .with_header("hdr", "v");
        let value = ctx.to_value();
        let Value::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(
            map.get(&MapKey::String(Arc::from("protocol"))),
            Some(&Value::from("grpc"))
        );
    }
}
