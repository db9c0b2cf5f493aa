//! Loosely-typed graph subjects.
//!
//! Registry and sub-domain records are property bags in the style of
//! JSON-LD: an `@id`, an optional `@type`, and open vocabulary. This
//! module gives them a typed view for the properties the gateway
//! interprets, with raw passthrough for everything else — the replica
//! engine may carry vocabulary this crate does not understand, and it
//! must survive a round trip.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An IRI, absolute or relative to the gateway domain.
pub type Iri = String;

/// Build a reference value `{"@id": iri}`.
pub fn reference(iri: impl Into<String>) -> Value {
    serde_json::json!({ "@id": iri.into() })
}

/// A graph subject: identity, optional type, open multi-valued properties.
///
/// Property values are stored raw; a single value and a one-element array
/// are equivalent. All accessors normalize to the array view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject identity, scoped to the enclosing domain
    #[serde(rename = "@id")]
    pub id: Iri,
    /// Subject type, if declared
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// All other properties, passed through uninterpreted
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl Subject {
    /// Create a subject with the given identity.
    pub fn new(id: impl Into<Iri>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder: set the subject type.
    pub fn with_type(mut self, typ: impl Into<String>) -> Self {
        self.typ = Some(typ.into());
        self
    }

    /// Builder: append a property value.
    pub fn with(mut self, prop: impl Into<String>, value: Value) -> Self {
        self.insert_value(&prop.into(), value);
        self
    }

    /// All values of a property, normalized to an array view.
    pub fn values(&self, prop: &str) -> Vec<&Value> {
        match self.properties.get(prop) {
            None | Some(Value::Null) => vec![],
            Some(Value::Array(items)) => items.iter().collect(),
            Some(single) => vec![single],
        }
    }

    /// The first value of a property, if any.
    pub fn first(&self, prop: &str) -> Option<&Value> {
        self.values(prop).into_iter().next()
    }

    /// All string values of a property.
    pub fn strings(&self, prop: &str) -> Vec<String> {
        self.values(prop)
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    }

    /// The first string value of a property.
    pub fn string(&self, prop: &str) -> Option<String> {
        self.first(prop).and_then(|v| v.as_str().map(String::from))
    }

    /// The first boolean value of a property.
    pub fn boolean(&self, prop: &str) -> Option<bool> {
        self.first(prop).and_then(Value::as_bool)
    }

    /// All referenced IRIs of a property. Accepts `{"@id": …}` objects and
    /// bare IRI strings.
    pub fn references(&self, prop: &str) -> Vec<Iri> {
        self.values(prop)
            .into_iter()
            .filter_map(|v| match v {
                Value::String(iri) => Some(iri.clone()),
                Value::Object(obj) => obj.get("@id").and_then(|id| id.as_str().map(String::from)),
                _ => None,
            })
            .collect()
    }

    /// The first byte-valued property, stored as standard base64.
    pub fn bytes(&self, prop: &str) -> Option<Vec<u8>> {
        self.string(prop).and_then(|s| BASE64.decode(s).ok())
    }

    /// Encode bytes for storage as a property value.
    pub fn bytes_value(bytes: &[u8]) -> Value {
        Value::String(BASE64.encode(bytes))
    }

    /// Append a value to a property with set semantics. Returns `false` if
    /// the value was already present.
    pub fn insert_value(&mut self, prop: &str, value: Value) -> bool {
        match self.properties.get_mut(prop) {
            None => {
                self.properties.insert(prop.to_string(), value);
                true
            }
            Some(Value::Array(items)) => {
                if items.contains(&value) {
                    false
                } else {
                    items.push(value);
                    true
                }
            }
            Some(existing) => {
                if *existing == value {
                    false
                } else {
                    let prior = existing.take();
                    *existing = Value::Array(vec![prior, value]);
                    true
                }
            }
        }
    }

    /// Remove a value from a property. Returns `false` if it was absent.
    pub fn remove_value(&mut self, prop: &str, value: &Value) -> bool {
        let Some(existing) = self.properties.get_mut(prop) else {
            return false;
        };
        let removed = match existing {
            Value::Array(items) => {
                let before = items.len();
                items.retain(|v| v != value);
                items.len() < before
            }
            single => {
                if *single == *value {
                    self.properties.remove(prop);
                    return true;
                }
                false
            }
        };
        if matches!(self.properties.get(prop), Some(Value::Array(items)) if items.is_empty()) {
            self.properties.remove(prop);
        }
        removed
    }

    /// Whether the subject declares no properties beyond its identity.
    pub fn is_empty(&self) -> bool {
        self.typ.is_none() && self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_unknown_vocabulary() {
        let json = serde_json::json!({
            "@id": "acme",
            "@type": "Account",
            "email": ["a@ex.org", "b@ex.org"],
            "ex:opaque": { "nested": true }
        });
        let subject: Subject = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(subject.id, "acme");
        assert_eq!(subject.strings("email").len(), 2);
        assert_eq!(serde_json::to_value(&subject).unwrap(), json);
    }

    #[test]
    fn test_single_value_normalizes_to_array_view() {
        let subject = Subject::new("acme").with("email", "a@ex.org".into());
        assert_eq!(subject.strings("email"), ["a@ex.org"]);
        assert_eq!(subject.string("email").unwrap(), "a@ex.org");
    }

    #[test]
    fn test_references_accept_both_forms() {
        let subject = Subject::new("acme")
            .with("subdomain", reference("acme/sd1"))
            .with("subdomain", Value::String("acme/sd2".into()));
        assert_eq!(subject.references("subdomain"), ["acme/sd1", "acme/sd2"]);
    }

    #[test]
    fn test_insert_value_set_semantics() {
        let mut subject = Subject::new("acme");
        assert!(subject.insert_value("email", "a@ex.org".into()));
        assert!(!subject.insert_value("email", "a@ex.org".into()));
        assert!(subject.insert_value("email", "b@ex.org".into()));
        assert_eq!(subject.strings("email").len(), 2);
    }

    #[test]
    fn test_remove_value() {
        let mut subject = Subject::new("acme")
            .with("email", "a@ex.org".into())
            .with("email", "b@ex.org".into());
        assert!(subject.remove_value("email", &"a@ex.org".into()));
        assert!(!subject.remove_value("email", &"a@ex.org".into()));
        assert_eq!(subject.strings("email"), ["b@ex.org"]);
        assert!(subject.remove_value("email", &"b@ex.org".into()));
        assert!(subject.properties.get("email").is_none());
    }

    #[test]
    fn test_bytes_round_trip() {
        let subject = Subject::new(".k1").with("public", Subject::bytes_value(b"\x01\x02\x03"));
        assert_eq!(subject.bytes("public").unwrap(), b"\x01\x02\x03");
    }
}
