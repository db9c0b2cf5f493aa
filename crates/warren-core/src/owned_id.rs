//! Account-owned sub-domain identity.
//!
//! An [`OwnedId`] combines the gateway domain, the owning account name and
//! the sub-domain name. It is the primary key for sub-domain identity and
//! converts deterministically between its representations:
//!
//! 1. Presentation string `[<account>/]<name>[@<gateway>]`
//! 2. Persistence path `[gateway parts reversed…, account, name]`
//! 3. Replica domain name `<name>.<account>.<gateway>`
//! 4. IRI `account/name`, absolute against the gateway domain

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of an account-owned sub-domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnedId {
    /// Dot-separated gateway domain name; empty if relative
    pub gateway: String,
    /// Owning account name; may be empty prior to validation
    pub account: String,
    /// Sub-domain name
    pub name: String,
}

impl OwnedId {
    /// Create an id from its components.
    pub fn new(
        gateway: impl Into<String>,
        account: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            gateway: gateway.into(),
            account: account.into(),
            name: name.into(),
        }
    }

    /// Reconstruct an id from a persistence path, as produced by
    /// [`OwnedId::to_path`].
    pub fn from_path(path: &[String]) -> Option<Self> {
        let mut rev = path.iter().rev();
        let name = rev.next()?.clone();
        let account = rev.next()?.clone();
        let gateway = rev.map(String::as_str).collect::<Vec<_>>().join(".");
        Some(Self {
            gateway,
            account,
            name,
        })
    }

    /// Reconstruct an id from a replica domain name `name.account.gateway`.
    pub fn from_domain(domain: &str) -> Option<Self> {
        let path: Vec<String> = domain.split('.').rev().map(String::from).collect();
        Self::from_path(&path)
    }

    /// Parse an IRI, which may be relative (`account/name`) or absolute
    /// (`http(s)://gateway/account/name`). A relative IRI is resolved
    /// against `gateway` when one is given.
    pub fn from_iri(iri: &str, gateway: Option<&str>) -> Self {
        if let Some(rest) = iri
            .strip_prefix("http://")
            .or_else(|| iri.strip_prefix("https://"))
        {
            let mut parts = rest.split('/');
            let authority = parts.next().unwrap_or_default();
            // Strip any port from the authority
            let host = authority.split(':').next().unwrap_or_default();
            let account = parts.next().unwrap_or_default();
            let name = parts.next().unwrap_or_default();
            Self::new(host, account, name)
        } else {
            let (account, name) = match iri.split_once('/') {
                Some((account, name)) => (account, name),
                None => ("", iri),
            };
            Self::new(gateway.unwrap_or_default(), account, name)
        }
    }

    /// Parse a reference value (`{"@id": iri}` or a bare IRI string).
    pub fn from_reference(value: &serde_json::Value, gateway: Option<&str>) -> Option<Self> {
        let iri = match value {
            serde_json::Value::String(iri) => iri.as_str(),
            serde_json::Value::Object(obj) => obj.get("@id")?.as_str()?,
            _ => return None,
        };
        Some(Self::from_iri(iri, gateway))
    }

    /// Whether a string is a valid id component (`[a-z0-9_-]+`).
    pub fn is_component_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
    }

    /// Check a component id, failing with `BadRequest`.
    pub fn check_component_id(id: &str) -> Result<()> {
        if Self::is_component_id(id) {
            Ok(())
        } else {
            Err(Error::bad_request(format!("invalid identifier {id:?}")))
        }
    }

    /// Whether the gateway part is absent.
    pub fn is_relative(&self) -> bool {
        self.gateway.is_empty()
    }

    /// Whether all present components satisfy the id charset.
    pub fn is_valid(&self) -> bool {
        (self.is_relative() || self.gateway.split('.').all(Self::is_component_id))
            && Self::is_component_id(&self.account)
            && Self::is_component_id(&self.name)
    }

    /// Validate this id, failing with `BadRequest`.
    pub fn validate(self) -> Result<Self> {
        if !self.is_relative() {
            for part in self.gateway.split('.') {
                Self::check_component_id(part)?;
            }
        }
        Self::check_component_id(&self.account)?;
        Self::check_component_id(&self.name)?;
        Ok(self)
    }

    /// Relative directory path suitable for persistence.
    pub fn to_path(&self) -> Vec<String> {
        self.gateway
            .split('.')
            .rev()
            .chain([self.account.as_str(), self.name.as_str()])
            .map(String::from)
            .collect()
    }

    /// The replica domain name for this sub-domain.
    pub fn to_domain(&self) -> String {
        format!("{}.{}.{}", self.name, self.account, self.gateway)
    }

    /// Gateway-relative IRI.
    pub fn to_relative_iri(&self) -> String {
        format!("{}/{}", self.account, self.name)
    }

    /// IRI, absolute if this id carries a gateway domain.
    pub fn to_iri(&self) -> String {
        if self.is_relative() {
            self.to_relative_iri()
        } else {
            format!("http://{}/{}", self.gateway, self.to_relative_iri())
        }
    }

    /// Reference value for use in graph subjects.
    pub fn to_reference(&self) -> serde_json::Value {
        serde_json::json!({ "@id": self.to_iri() })
    }

    /// State identity at a given tick, used to derive ETags.
    pub fn to_state_id(&self, tick: u64) -> String {
        format!("{}?tick={tick}", self.to_iri())
    }
}

impl FromStr for OwnedId {
    type Err = Error;

    /// Parse a presentation string `[<account>/]<name>[@<gateway>]`.
    /// Parsing never fails; use [`OwnedId::validate`] to check components.
    fn from_str(s: &str) -> Result<Self> {
        let (owned, gateway) = match s.split_once('@') {
            Some((owned, gateway)) => (owned, gateway),
            None => (s, ""),
        };
        let (account, name) = match owned.split_once('/') {
            Some((account, name)) => (account, name),
            None => ("", owned),
        };
        Ok(Self::new(gateway, account, name))
    }
}

impl fmt::Display for OwnedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.account.is_empty() {
            write!(f, "{}/", self.account)?;
        }
        write!(f, "{}", self.name)?;
        if !self.gateway.is_empty() {
            write!(f, "@{}", self.gateway)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_full_display_string() {
        let id: OwnedId = "org/ts@gw.net".parse().unwrap();
        assert_eq!(id.name, "ts");
        assert_eq!(id.account, "org");
        assert_eq!(id.gateway, "gw.net");
        assert!(id.is_valid());
        assert!(!id.is_relative());
        assert_eq!(id.to_string(), "org/ts@gw.net");
        assert_eq!(id.to_path(), ["net", "gw", "org", "ts"]);
        assert_eq!(id.to_domain(), "ts.org.gw.net");
        assert_eq!(id.to_iri(), "http://gw.net/org/ts");
        assert_eq!(id.to_relative_iri(), "org/ts");
        assert_eq!(
            id.to_reference(),
            serde_json::json!({"@id": "http://gw.net/org/ts"})
        );
        assert_eq!(id.to_state_id(1), "http://gw.net/org/ts?tick=1");
        assert!(id.validate().is_ok());
    }

    #[test]
    fn test_invalid_components() {
        assert!(!OwnedId::from_iri("org./ts", None).is_valid());
        assert!(!OwnedId::from_iri("org/ts!", None).is_valid());
        assert!(!OwnedId::from_iri("Org/ts", None).is_valid());
    }

    #[test]
    fn test_from_name_only() {
        let id: OwnedId = "ts".parse().unwrap();
        assert_eq!(id.name, "ts");
        assert!(id.account.is_empty());
        assert!(id.gateway.is_empty());
        assert_eq!(id.to_string(), "ts");
        assert!(!id.is_valid());
        assert!(id.validate().is_err());
    }

    #[test]
    fn test_from_account_and_name() {
        let id: OwnedId = "org/ts".parse().unwrap();
        assert_eq!(id.name, "ts");
        assert_eq!(id.account, "org");
        assert!(id.is_relative());
        assert_eq!(id.to_string(), "org/ts");
        assert!(id.validate().is_ok());
    }

    #[test]
    fn test_from_path() {
        let path: Vec<String> = ["net", "gw", "org", "ts"].map(String::from).into();
        let id = OwnedId::from_path(&path).unwrap();
        assert_eq!(id.name, "ts");
        assert_eq!(id.account, "org");
        assert_eq!(id.gateway, "gw.net");
    }

    #[test]
    fn test_from_domain() {
        let id = OwnedId::from_domain("ts.org.gw.net").unwrap();
        assert_eq!(id.name, "ts");
        assert_eq!(id.account, "org");
        assert_eq!(id.gateway, "gw.net");
    }

    #[test]
    fn test_from_relative_iri() {
        let id = OwnedId::from_iri("org/ts", None);
        assert_eq!(id.name, "ts");
        assert_eq!(id.account, "org");
        assert!(id.is_relative());
        assert_eq!(id.to_iri(), "org/ts");
    }

    #[test]
    fn test_from_reference() {
        let id = OwnedId::from_reference(&serde_json::json!({"@id": "org/ts"}), None).unwrap();
        assert_eq!(id, OwnedId::from_iri("org/ts", None));
    }

    #[test]
    fn test_from_absolute_iri() {
        let id = OwnedId::from_iri("https://gw.net/org/ts", None);
        assert_eq!((id.gateway.as_str(), id.account.as_str()), ("gw.net", "org"));
        assert_eq!(id.name, "ts");

        let id = OwnedId::from_iri("org/ts", Some("gw.net"));
        assert_eq!(id.gateway, "gw.net");

        // Port is stripped, trailing path segments ignored
        let id = OwnedId::from_iri("http://gw.net:8080/org/ts/what", None);
        assert_eq!(id.gateway, "gw.net");
        assert_eq!(id.account, "org");
        assert_eq!(id.name, "ts");
    }
}
