use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Property holding the URL of an HTTP endpoint.
pub const ENDPOINT: &str = "endpoint";
/// Property holding a bearer token for an endpoint data reference.
pub const AUTHORIZATION: &str = "authorization";
/// Property holding a filesystem path.
pub const PATH: &str = "path";
/// Property holding a logical bucket name (memory addresses).
pub const BUCKET: &str = "bucket";

/// A typed address: a type tag plus a string-keyed property map.
///
/// The scheduler never interprets the properties; they are read by the
/// source/sink factories and provisioners registered for `address_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    pub fn new(address_type: impl Into<String>) -> Self {
        DataAddress {
            address_type: address_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    /// Look up a property that must be present and non-empty.
    pub fn required_property(&self, key: &str) -> Result<&str, String> {
        match self.property(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(format!(
                "address of type '{}' is missing required property '{}'",
                self.address_type, key
            )),
        }
    }

    /// Interpret a property as a boolean flag (`true`/`1`/`yes`).
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.property(key).map(|v| v.to_ascii_lowercase()),
            Some(ref v) if v == "true" || v == "1" || v == "yes"
        )
    }
}

impl fmt::Display for DataAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Property values may carry secrets; only keys are rendered.
        let keys: Vec<&str> = self.properties.keys().map(|k| k.as_str()).collect();
        write!(f, "{}[{}]", self.address_type, keys.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_property_rejects_blank() {
        let addr = DataAddress::new("File").with_property(PATH, "  ");
        let err = addr.required_property(PATH).unwrap_err();
        assert!(err.contains("'path'"));
    }

    #[test]
    fn flag_accepts_common_truthy_values() {
        for v in ["true", "TRUE", "1", "yes"] {
            assert!(DataAddress::new("File").with_property("staging", v).flag("staging"));
        }
        assert!(!DataAddress::new("File").with_property("staging", "no").flag("staging"));
        assert!(!DataAddress::new("File").flag("staging"));
    }

    #[test]
    fn display_hides_property_values() {
        let addr = DataAddress::new("HttpData").with_property(AUTHORIZATION, "secret");
        assert_eq!(addr.to_string(), "HttpData[authorization]");
    }

    #[test]
    fn serializes_type_tag() {
        let addr = DataAddress::new("Memory").with_property(BUCKET, "in");
        let json = serde_json::to_value(&addr).unwrap();
        assert_eq!(json["type"], "Memory");
        assert_eq!(json["properties"]["bucket"], "in");
    }
}
