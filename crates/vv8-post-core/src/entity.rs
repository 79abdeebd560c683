//! Entity database for first/third-party classification: maps a
//! registrable domain (eTLD+1) to the organisation that owns it and its
//! tracking score.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntityProperty {
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub tracking: f64,
}

impl EntityProperty {
    /// The stand-in for hosts the database does not know: the host is its
    /// own entity, with no tracking signal.
    pub fn unknown(host: &str) -> Self {
        Self { display_name: host.to_string(), tracking: 0.0 }
    }
}

/// Read-only after load; shared by reference across aggregators.
#[derive(Debug, Default)]
pub struct EntityMap {
    entities: HashMap<String, EntityProperty>,
}

impl EntityMap {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let entities = serde_json::from_str(data)?;
        Ok(Self { entities })
    }

    pub fn get(&self, etld_plus_one: &str) -> Option<&EntityProperty> {
        self.entities.get(etld_plus_one)
    }

    /// Entity owning `host`, looked up by its registrable domain. `None`
    /// when the host is unknown to the database.
    pub fn entity_for_host(&self, host: &str) -> Option<&EntityProperty> {
        self.entities.get(&registrable_domain(host))
    }

    /// Entity owning `host`, with the unknown-host fallback applied.
    pub fn entity_for_host_or_unknown(&self, host: &str) -> EntityProperty {
        self.entity_for_host(host)
            .cloned()
            .unwrap_or_else(|| EntityProperty::unknown(host))
    }
}

// Common multi-label public suffixes. Without a full public-suffix list
// in the dependency tree, anything not matched here degrades to the
// last-two-labels rule.
const TWO_LABEL_SUFFIXES: &[&str] = &[
    "ac.uk", "co.uk", "gov.uk", "org.uk", "ltd.uk", "plc.uk", "me.uk", "net.uk",
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp",
    "com.au", "net.au", "org.au", "edu.au", "gov.au",
    "co.nz", "net.nz", "org.nz",
    "com.br", "net.br", "org.br",
    "com.cn", "net.cn", "org.cn", "gov.cn",
    "com.mx", "com.ar", "com.tr", "com.tw", "com.sg", "com.hk", "com.my",
    "co.in", "net.in", "org.in",
    "co.kr", "or.kr",
    "co.za", "org.za",
    "co.id", "or.id",
];

/// Best-effort eTLD+1: the registrable domain of a host name. IPs and
/// single-label hosts pass through unchanged.
pub fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    let last_two = labels[labels.len() - 2..].join(".");
    let take = if TWO_LABEL_SUFFIXES.contains(&last_two.as_str()) { 3 } else { 2 };
    labels[labels.len() - take..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registrable_domain_handles_common_shapes() {
        assert_eq!(registrable_domain("www.example.com"), "example.com");
        assert_eq!(registrable_domain("example.com"), "example.com");
        assert_eq!(registrable_domain("a.b.tracker.co.uk"), "tracker.co.uk");
        assert_eq!(registrable_domain("localhost"), "localhost");
        assert_eq!(registrable_domain("192.168.0.1"), "192.168.0.1");
        assert_eq!(registrable_domain("WWW.Example.COM."), "example.com");
    }

    #[test]
    fn loads_from_disk() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "a.test": { "displayName": "A", "tracking": 0.5 } }"#)
            .unwrap();
        let map = EntityMap::load(file.path()).unwrap();
        assert_eq!(map.get("a.test").unwrap().tracking, 0.5);
    }

    #[test]
    fn looks_up_entities_by_registrable_domain() {
        let map = EntityMap::from_json(
            r#"{ "example.com": { "displayName": "Example Corp", "tracking": 0.8 } }"#,
        )
        .unwrap();
        assert_eq!(
            map.entity_for_host("cdn.example.com").unwrap().display_name,
            "Example Corp"
        );
        assert!(map.entity_for_host("other.net").is_none());
        let fallback = map.entity_for_host_or_unknown("other.net");
        assert_eq!(fallback.display_name, "other.net");
        assert_eq!(fallback.tracking, 0.0);
    }
}
