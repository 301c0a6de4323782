//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

/// Maximum key length in bytes accepted over HTTP.
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum value size in bytes accepted over HTTP (1 MB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Request body for PUT /set
///
/// # Fields
/// - `key`: The cache key to store the value under
/// - `value`: The value to store
/// - `ttl`: Optional TTL in seconds; omitted uses the server default, 0 never expires
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl SetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if let Some(error) = validate_key(&self.key) {
            return Some(error);
        }
        if self.value.len() > MAX_VALUE_SIZE {
            return Some(format!(
                "Value exceeds maximum size of {} bytes",
                MAX_VALUE_SIZE
            ));
        }
        None
    }
}

/// Request body for POST /incr/:key. The body itself is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncrRequest {
    /// Amount to add (defaults to 1)
    #[serde(default)]
    pub by: Option<i64>,
}

impl IncrRequest {
    pub fn amount(&self) -> i64 {
        self.by.unwrap_or(1)
    }
}

/// Checks a key received over HTTP.
pub fn validate_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return Some("Key cannot be empty".to_string());
    }
    if key.len() > MAX_KEY_LENGTH {
        return Some(format!(
            "Key exceeds maximum length of {} characters",
            MAX_KEY_LENGTH
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_request_deserialize() {
        let json = r#"{"key": "test", "value": "hello"}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.key, "test");
        assert_eq!(req.value, "hello");
        assert!(req.ttl.is_none());
    }

    #[test]
    fn test_set_request_with_ttl() {
        let json = r#"{"key": "test", "value": "hello", "ttl": 60}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.ttl, Some(60));
    }

    #[test]
    fn test_validate_rejects_bad_keys() {
        let empty = SetRequest {
            key: "".to_string(),
            value: "test".to_string(),
            ttl: None,
        };
        assert!(empty.validate().is_some());

        let long = SetRequest {
            key: "x".repeat(MAX_KEY_LENGTH + 1),
            value: "test".to_string(),
            ttl: None,
        };
        assert!(long.validate().unwrap().contains("maximum length"));
    }

    #[test]
    fn test_validate_rejects_large_value() {
        let req = SetRequest {
            key: "k".to_string(),
            value: "x".repeat(MAX_VALUE_SIZE + 1),
            ttl: None,
        };
        assert!(req.validate().unwrap().contains("maximum size"));
    }

    #[test]
    fn test_validate_valid_request() {
        let req = SetRequest {
            key: "valid_key".to_string(),
            value: "test".to_string(),
            ttl: Some(60),
        };
        assert!(req.validate().is_none());
    }

    #[test]
    fn test_incr_request_defaults_to_one() {
        let req: IncrRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.amount(), 1);

        let req: IncrRequest = serde_json::from_str(r#"{"by": -5}"#).unwrap();
        assert_eq!(req.amount(), -5);
    }
}
