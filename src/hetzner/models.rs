//! Wire types for the Hetzner Cloud API and their translation into the
//! provider-neutral domain model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Arch, CloudLabels, Image, ImageKind, Location, Price, Server, ServerStatus, ServerType, SshKey,
};

#[derive(Debug, Deserialize)]
pub struct Meta {
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub next_page: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: ApiErrorWire,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorWire {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ServersPage {
    pub servers: Vec<ServerWire>,
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct ServerEnvelope {
    pub server: ServerWire,
}

#[derive(Debug, Deserialize)]
pub struct ServerWire {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub public_net: PublicNetWire,
    pub server_type: ServerTypeRefWire,
    pub datacenter: DatacenterWire,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PublicNetWire {
    pub ipv4: Option<Ipv4Wire>,
}

#[derive(Debug, Deserialize)]
pub struct Ipv4Wire {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerTypeRefWire {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DatacenterWire {
    pub location: LocationWire,
}

#[derive(Debug, Deserialize)]
pub struct ServerTypesPage {
    pub server_types: Vec<ServerTypeWire>,
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct ServerTypeWire {
    pub id: u64,
    pub name: String,
    pub architecture: String,
    #[serde(default)]
    pub prices: Vec<PriceWire>,
}

#[derive(Debug, Deserialize)]
pub struct PriceWire {
    pub location: String,
    pub price_hourly: PriceValueWire,
}

#[derive(Debug, Deserialize)]
pub struct PriceValueWire {
    /// The API encodes monetary values as decimal strings.
    pub gross: String,
}

#[derive(Debug, Deserialize)]
pub struct LocationsPage {
    pub locations: Vec<LocationWire>,
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct LocationWire {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ImagesPage {
    pub images: Vec<ImageWire>,
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct ImageWire {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub architecture: String,
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct SshKeysPage {
    pub ssh_keys: Vec<SshKeyWire>,
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct SshKeyEnvelope {
    pub ssh_key: SshKeyWire,
}

#[derive(Debug, Deserialize)]
pub struct SshKeyWire {
    pub id: u64,
    pub name: String,
    pub public_key: String,
}

#[derive(Debug, Serialize)]
pub struct CreateServerBody {
    pub name: String,
    pub server_type: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub ssh_keys: Vec<u64>,
    pub labels: CloudLabels,
    pub start_after_create: bool,
}

#[derive(Debug, Serialize)]
pub struct UpdateServerBody {
    pub name: String,
    pub labels: CloudLabels,
}

#[derive(Debug, Serialize)]
pub struct RebuildBody {
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSshKeyBody {
    pub name: String,
    pub public_key: String,
}

pub fn server_from_wire(wire: ServerWire) -> Server {
    Server {
        id: wire.id,
        name: wire.name,
        status: status_from_wire(&wire.status),
        server_type: wire.server_type.name,
        location: wire.datacenter.location.name,
        public_ipv4: wire.public_net.ipv4.and_then(|v| v.ip.parse().ok()),
        created_at: wire.created,
        labels: wire.labels.into_iter().collect(),
    }
}

fn status_from_wire(status: &str) -> ServerStatus {
    match status {
        "off" => ServerStatus::Off,
        "initializing" | "starting" | "rebuilding" | "migrating" => ServerStatus::Starting,
        "running" => ServerStatus::Running,
        "stopping" => ServerStatus::Stopping,
        "deleting" => ServerStatus::Deleting,
        _ => ServerStatus::Unknown,
    }
}

pub fn server_type_from_wire(wire: ServerTypeWire) -> ServerType {
    ServerType {
        id: wire.id,
        name: wire.name,
        architecture: arch_from_wire(&wire.architecture),
        prices: wire
            .prices
            .into_iter()
            .filter_map(|price| {
                let hourly = price.price_hourly.gross.parse().ok()?;
                Some(Price {
                    location: price.location,
                    hourly,
                })
            })
            .collect(),
    }
}

fn arch_from_wire(arch: &str) -> Arch {
    match arch {
        "arm" => Arch::Arm,
        _ => Arch::X86,
    }
}

pub fn location_from_wire(wire: LocationWire) -> Location {
    Location {
        id: wire.id,
        name: wire.name,
    }
}

pub fn image_from_wire(wire: ImageWire) -> Image {
    Image {
        id: wire.id,
        kind: match wire.kind.as_str() {
            "snapshot" => ImageKind::Snapshot,
            "backup" => ImageKind::Backup,
            "app" => ImageKind::App,
            _ => ImageKind::System,
        },
        architecture: arch_from_wire(&wire.architecture),
        name: wire.name,
        description: wire.description,
    }
}

pub fn ssh_key_from_wire(wire: SshKeyWire) -> SshKey {
    SshKey {
        id: wire.id,
        name: wire.name,
        public_key: wire.public_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_wire_parses_and_translates() {
        let raw = r#"{
            "id": 42,
            "name": "gha-16178166409-45790311167",
            "status": "running",
            "created": "2026-07-31T11:00:00+00:00",
            "public_net": {"ipv4": {"ip": "159.69.10.1", "blocked": false}},
            "server_type": {"id": 1, "name": "cpx21"},
            "datacenter": {"id": 2, "name": "fsn1-dc14", "location": {"id": 1, "name": "fsn1"}},
            "labels": {"role": "active", "server_type": "cpx21"}
        }"#;
        let wire: ServerWire = serde_json::from_str(raw).unwrap();
        let server = server_from_wire(wire);
        assert_eq!(server.status, ServerStatus::Running);
        assert_eq!(server.server_type, "cpx21");
        assert_eq!(server.location, "fsn1");
        assert_eq!(server.public_ipv4.unwrap().to_string(), "159.69.10.1");
        assert_eq!(server.label("role"), Some("active"));
    }

    #[test]
    fn transitional_statuses_map_to_starting() {
        for status in ["initializing", "starting", "rebuilding"] {
            assert_eq!(status_from_wire(status), ServerStatus::Starting);
        }
        assert_eq!(status_from_wire("off"), ServerStatus::Off);
        assert_eq!(status_from_wire("what"), ServerStatus::Unknown);
    }

    #[test]
    fn price_strings_parse_to_hourly_floats() {
        let raw = r#"{
            "id": 1,
            "name": "cx22",
            "architecture": "x86",
            "prices": [
                {"location": "fsn1", "price_hourly": {"net": "0.0052000000", "gross": "0.0062000000"}},
                {"location": "hel1", "price_hourly": {"net": "bogus", "gross": "bogus"}}
            ]
        }"#;
        let wire: ServerTypeWire = serde_json::from_str(raw).unwrap();
        let server_type = server_type_from_wire(wire);
        assert_eq!(server_type.prices.len(), 1);
        assert!((server_type.prices[0].hourly - 0.0062).abs() < 1e-9);
    }

    #[test]
    fn image_wire_translates_kind_and_arch() {
        let raw = r#"{
            "id": 77,
            "type": "snapshot",
            "architecture": "arm",
            "name": null,
            "description": "ci-base"
        }"#;
        let wire: ImageWire = serde_json::from_str(raw).unwrap();
        let image = image_from_wire(wire);
        assert_eq!(image.kind, ImageKind::Snapshot);
        assert_eq!(image.architecture, Arch::Arm);
        assert_eq!(image.description, "ci-base");
    }
}
