//! Provider-neutral domain types shared by the control loops.
//!
//! The concrete cloud and CI clients translate their wire formats into these
//! types, so the loops never depend on a specific provider SDK.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Cloud-side key/value labels attached to owned servers.
pub type CloudLabels = BTreeMap<String, String>;

pub mod label_keys {
    pub const ROLE: &str = "role";
    pub const SERVER_TYPE: &str = "server_type";
    pub const LOCATION: &str = "location";
    pub const IMAGE: &str = "image";
    pub const RUNNER_LABELS_HASH: &str = "runner_labels_hash";
    pub const SSH_KEYS_HASH: &str = "ssh_keys_hash";
    pub const PROVISIONED_AT: &str = "provisioned_at";
    pub const OFF_SINCE: &str = "off_since";
    pub const PREFIX: &str = "prefix";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Active,
    Recycle,
    Standby,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Active => "active",
            Role::Recycle => "recycle",
            Role::Standby => "standby",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
}

/// A workflow job observed at the CI provider. Identity is `(run_id, id)`.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u64,
    pub run_id: u64,
    pub name: String,
    pub status: JobStatus,
    pub labels: Vec<String>,
}

/// A self-hosted runner observed at the CI provider, named after its server.
#[derive(Clone, Debug)]
pub struct Runner {
    pub id: u64,
    pub name: String,
    pub online: bool,
    pub busy: bool,
    pub labels: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Off,
    Starting,
    Running,
    Stopping,
    Deleting,
    Unknown,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Off => "off",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Unknown => "unknown",
        }
    }
}

/// A cloud server owned by the controller.
#[derive(Clone, Debug)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: ServerStatus,
    pub server_type: String,
    pub location: String,
    pub public_ipv4: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub labels: CloudLabels,
}

impl Server {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Image identity recorded at creation time. The cloud-side image field
    /// goes stale after a rebuild, so the label is the source of truth.
    pub fn image_label(&self) -> Option<&str> {
        self.label(label_keys::IMAGE)
    }

    pub fn ssh_keys_hash(&self) -> Option<&str> {
        self.label(label_keys::SSH_KEYS_HASH)
    }

    /// Seconds since creation, never negative.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    /// Seconds since the last create/rebuild/promotion stamp; falls back to
    /// the creation time when the label is missing or malformed.
    pub fn provisioned_age_seconds(&self, now: DateTime<Utc>) -> i64 {
        let provisioned_at = self
            .label(label_keys::PROVISIONED_AT)
            .and_then(|v| v.parse::<i64>().ok());

        match provisioned_at {
            Some(ts) => (now.timestamp() - ts).max(0),
            None => self.age_seconds(now),
        }
    }
}

/// `floor(age / 1h)`: the number of completed billing hours.
pub fn age_in_hour(age_seconds: i64) -> i64 {
    age_seconds / 3600
}

/// Minute-within-the-current-billing-hour, fractional.
pub fn minute_in_hour(age_seconds: i64) -> f64 {
    (age_seconds % 3600) as f64 / 60.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    System,
    Snapshot,
    Backup,
    App,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86,
    Arm,
}

#[derive(Clone, Debug)]
pub struct Image {
    pub id: u64,
    pub kind: ImageKind,
    pub architecture: Arch,
    pub name: Option<String>,
    pub description: String,
}

impl Image {
    /// Stable identity used in cloud labels and recycle matching.
    pub fn identity(&self) -> String {
        self.id.to_string()
    }
}

/// Hourly price of a server type at one location, in the account currency.
#[derive(Clone, Debug)]
pub struct Price {
    pub location: String,
    pub hourly: f64,
}

#[derive(Clone, Debug)]
pub struct ServerType {
    pub id: u64,
    pub name: String,
    pub architecture: Arch,
    pub prices: Vec<Price>,
}

#[derive(Clone, Debug)]
pub struct Location {
    pub id: u64,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub public_key: String,
}

/// What a queued job asks for, derived from its labels (see `labels.rs`).
#[derive(Clone, Debug)]
pub struct RunnerSpec {
    pub server_type: ServerType,
    pub location: Option<Location>,
    pub image: Image,
    pub setup_script: Option<PathBuf>,
    pub startup_script: Option<PathBuf>,
    /// The job's original CI labels, passed through to the runner.
    pub labels: Vec<String>,
    /// Hash of the controller's SSH key set, fixed for the process lifetime.
    pub ssh_keys_hash: String,
}

impl RunnerSpec {
    /// Stable hash of everything a recycle candidate must match.
    pub fn fingerprint(&self) -> String {
        fingerprint(
            &self.server_type.name,
            self.location.as_ref().map(|l| l.name.as_str()),
            &self.image.identity(),
            &self.ssh_keys_hash,
        )
    }

    pub fn runner_labels_hash(&self) -> String {
        hash_label_set(&self.labels)
    }
}

pub fn fingerprint(
    server_type: &str,
    location: Option<&str>,
    image: &str,
    ssh_keys_hash: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(server_type.as_bytes());
    hasher.update(b"|");
    hasher.update(location.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(image.as_bytes());
    hasher.update(b"|");
    hasher.update(ssh_keys_hash.as_bytes());
    short_hex(hasher.finalize())
}

/// Order-insensitive hash of a CI label set.
pub fn hash_label_set(labels: &[String]) -> String {
    let mut sorted: Vec<&str> = labels.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    for label in sorted {
        hasher.update(label.as_bytes());
        hasher.update(b"\n");
    }
    short_hex(hasher.finalize())
}

/// Hash of the SSH key ids installed on every owned server.
pub fn hash_ssh_key_set(keys: &[SshKey]) -> String {
    let mut ids: Vec<u64> = keys.iter().map(|k| k.id).collect();
    ids.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(&id.to_le_bytes());
    }
    short_hex(hasher.finalize())
}

fn short_hex(hash: blake3::Hash) -> String {
    hash.to_hex().as_str()[..16].to_string()
}

/// CI API rate-limit sample, published by the watch loop.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset: DateTime<Utc>,
}

impl RateLimit {
    pub fn reset_in(&self, now: DateTime<Utc>) -> i64 {
        (self.reset - now).num_seconds().max(0)
    }
}
