//! # Port Mapping Table
//!
//! The ingress side routes by a static table loaded once at startup:
//!
//! ```json
//! {
//!   "portMappings": [
//!     { "localPort": 8080, "remoteHost": "10.0.0.7", "remotePort": 22,
//!       "description": "ssh to the bench box" }
//!   ]
//! }
//! ```
//!
//! The table is immutable after load and ordered as written. Malformed
//! documents and duplicate `localPort` entries are fatal; a file that
//! cannot be read at all falls back to one built-in entry, loudly.
//!
//! The frame format carries IPv4 only, so `remoteHost` must be an IPv4
//! literal; `localhost` is accepted as an alias for 127.0.0.1.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

/// One routing rule: clients accepted on `local_port` are tunnelled to
/// `remote_host:remote_port` on the egress side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub local_port: u16,
    #[serde(deserialize_with = "ipv4_or_localhost")]
    pub remote_host: Ipv4Addr,
    pub remote_port: u16,
    pub description: String,
}

impl PortMapping {
    /// The dial target echoed in every Data frame for this mapping.
    pub fn target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_host, self.remote_port)
    }
}

fn ipv4_or_localhost<'de, D>(deserializer: D) -> Result<Ipv4Addr, D::Error>
where
    D: Deserializer<'de>,
{
    let host = String::deserialize(deserializer)?;
    if host == "localhost" {
        return Ok(Ipv4Addr::LOCALHOST);
    }
    host.parse().map_err(|_| {
        serde::de::Error::custom(format!(
            "remoteHost {:?} is not an IPv4 literal (the wire format cannot carry names or IPv6)",
            host
        ))
    })
}

/// The ordered, immutable mapping table. Lookup is by listen port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingTable {
    port_mappings: Vec<PortMapping>,
}

impl MappingTable {
    /// Parse and validate a mapping document.
    pub fn from_json(doc: &str) -> Result<Self> {
        let table: MappingTable =
            serde_json::from_str(doc).context("malformed port-mapping document")?;
        table.validate()?;
        Ok(table)
    }

    /// Load from `path`, falling back to the built-in default mapping when
    /// the file cannot be read. A file that reads but does not parse is
    /// fatal, as is a duplicate `localPort`.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(doc) => {
                let table = Self::from_json(&doc)
                    .with_context(|| format!("loading mappings from {}", path.display()))?;
                info!(
                    path = %path.display(),
                    mappings = table.port_mappings.len(),
                    "loaded port mappings"
                );
                Ok(table)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "mapping file unavailable, using built-in default mapping"
                );
                Ok(Self::fallback())
            }
        }
    }

    /// The built-in single mapping used when no file is available.
    pub fn fallback() -> Self {
        Self {
            port_mappings: vec![PortMapping {
                local_port: 8080,
                remote_host: Ipv4Addr::LOCALHOST,
                remote_port: 22,
                description: "default".to_string(),
            }],
        }
    }

    pub fn from_mappings(port_mappings: Vec<PortMapping>) -> Result<Self> {
        let table = Self { port_mappings };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for mapping in &self.port_mappings {
            if !seen.insert(mapping.local_port) {
                anyhow::bail!("duplicate localPort {} in mapping table", mapping.local_port);
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[PortMapping] {
        &self.port_mappings
    }

    pub fn get(&self, local_port: u16) -> Option<&PortMapping> {
        self.port_mappings
            .iter()
            .find(|m| m.local_port == local_port)
    }

    pub fn is_empty(&self) -> bool {
        self.port_mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "portMappings": [
            { "localPort": 8080, "remoteHost": "127.0.0.1", "remotePort": 9000,
              "description": "echo" },
            { "localPort": 8081, "remoteHost": "10.1.2.3", "remotePort": 22,
              "description": "ssh" }
        ]
    }"#;

    #[test]
    fn parses_camel_case_document() {
        let table = MappingTable::from_json(SAMPLE).unwrap();
        assert_eq!(table.entries().len(), 2);

        let first = table.get(8080).unwrap();
        assert_eq!(first.remote_host, Ipv4Addr::LOCALHOST);
        assert_eq!(first.remote_port, 9000);
        assert_eq!(first.description, "echo");
        assert_eq!(
            first.target(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000)
        );

        assert!(table.get(9999).is_none());
    }

    #[test]
    fn order_is_preserved() {
        let table = MappingTable::from_json(SAMPLE).unwrap();
        let ports: Vec<u16> = table.entries().iter().map(|m| m.local_port).collect();
        assert_eq!(ports, vec![8080, 8081]);
    }

    #[test]
    fn duplicate_local_port_is_fatal() {
        let doc = r#"{
            "portMappings": [
                { "localPort": 8080, "remoteHost": "127.0.0.1", "remotePort": 1,
                  "description": "a" },
                { "localPort": 8080, "remoteHost": "127.0.0.1", "remotePort": 2,
                  "description": "b" }
            ]
        }"#;
        let err = MappingTable::from_json(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate localPort 8080"));
    }

    #[test]
    fn localhost_aliases_loopback() {
        let doc = r#"{
            "portMappings": [
                { "localPort": 8080, "remoteHost": "localhost", "remotePort": 22,
                  "description": "ssh" }
            ]
        }"#;
        let table = MappingTable::from_json(doc).unwrap();
        assert_eq!(table.get(8080).unwrap().remote_host, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn hostnames_and_ipv6_are_rejected() {
        for host in ["bench.example.com", "::1", ""] {
            let doc = format!(
                r#"{{ "portMappings": [ {{ "localPort": 1, "remoteHost": "{host}",
                     "remotePort": 2, "description": "x" }} ] }}"#
            );
            assert!(MappingTable::from_json(&doc).is_err(), "host {host:?}");
        }
    }

    #[test]
    fn missing_port_mappings_key_is_fatal() {
        assert!(MappingTable::from_json("{}").is_err());
        assert!(MappingTable::from_json("not json").is_err());
    }

    #[test]
    fn unreadable_file_falls_back_to_default() {
        let table = MappingTable::load(Path::new("/nonexistent/port-mapping.json")).unwrap();
        assert_eq!(table, MappingTable::fallback());

        let mapping = table.get(8080).unwrap();
        assert_eq!(mapping.remote_host, Ipv4Addr::LOCALHOST);
        assert_eq!(mapping.remote_port, 22);
        assert_eq!(mapping.description, "default");
    }
}
