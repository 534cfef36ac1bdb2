//! Translates a job's label set into a [`RunnerSpec`]: which server type,
//! location and image to provision, and which setup/startup scripts to run.
//!
//! Reserved labels (optionally behind `label_prefix`) are `type-*`, `in-*`,
//! `image-{arch}-{kind}-{name}`, `setup-*` and `startup-*`. Anything that is
//! neither reserved nor a meta-label passes through to the runner unchanged.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::Config;
use crate::model::{Arch, Image, ImageKind, Location, RunnerSpec, ServerType};

/// Cloud catalogs the resolver validates against. Fetched at startup and
/// refreshed lazily when a resolution misses (the catalog may be stale).
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub server_types: Vec<ServerType>,
    pub locations: Vec<Location>,
    pub images: Vec<Image>,
}

impl Catalog {
    pub fn server_type(&self, name: &str) -> Option<&ServerType> {
        self.server_types.iter().find(|t| t.name == name)
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.name == name)
    }

    pub fn image(&self, want: &ImageRef) -> Option<&Image> {
        self.images.iter().find(|image| {
            if image.kind != want.kind || image.architecture != want.arch {
                return false;
            }
            match want.kind {
                // System and app images are addressed by name, snapshots and
                // backups by description (they have no stable name).
                ImageKind::System | ImageKind::App => {
                    image.name.as_deref() == Some(want.name.as_str())
                }
                ImageKind::Snapshot | ImageKind::Backup => image.description == want.name,
            }
        })
    }
}

/// Parsed but not yet resolved image reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub arch: Arch,
    pub kind: ImageKind,
    pub name: String,
}

impl ImageRef {
    /// Parses the `{arch}:{kind}:{name}` form used by `default_image`.
    pub fn parse(spec: &str, sep: char) -> Result<Self, LabelError> {
        let mut parts = spec.splitn(3, sep);
        let (arch, kind, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(k), Some(n)) if !n.is_empty() => (a, k, n),
            _ => return Err(LabelError::MalformedImage(spec.to_string())),
        };

        let arch = match arch {
            "x86" => Arch::X86,
            "arm" => Arch::Arm,
            _ => return Err(LabelError::MalformedImage(spec.to_string())),
        };
        let kind = match kind {
            "system" => ImageKind::System,
            "snapshot" => ImageKind::Snapshot,
            "backup" => ImageKind::Backup,
            "app" => ImageKind::App,
            _ => return Err(LabelError::MalformedImage(spec.to_string())),
        };

        Ok(Self {
            arch,
            kind,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("more than one {0} label")]
    Duplicate(&'static str),

    #[error("unknown server type: {0}")]
    UnknownServerType(String),

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    #[error("unknown image: {0}")]
    UnknownImage(String),

    #[error("malformed image spec: {0}")]
    MalformedImage(String),

    #[error("label {0} needs the scripts directory to be configured")]
    ScriptsDirUnset(String),

    #[error("script not found: {0}")]
    MissingScript(PathBuf),
}

/// Derives a [`RunnerSpec`] from a job's label set. Deterministic: the same
/// labels and catalog always produce the same spec and fingerprint.
#[derive(Clone, Debug)]
pub struct SpecResolver {
    label_prefix: String,
    meta_labels: HashMap<String, Vec<String>>,
    default_server_type: String,
    default_location: Option<String>,
    default_image: String,
    scripts: Option<PathBuf>,
    ssh_keys_hash: String,
}

impl SpecResolver {
    pub fn new(config: &Config, ssh_keys_hash: String) -> Self {
        Self {
            label_prefix: config.label_prefix.clone(),
            meta_labels: config.meta_label.clone(),
            default_server_type: config.default_server_type.clone(),
            default_location: config.default_location.clone(),
            default_image: config.default_image.clone(),
            scripts: config.scripts.clone(),
            ssh_keys_hash,
        }
    }

    pub fn resolve(&self, labels: &[String], catalog: &Catalog) -> Result<RunnerSpec, LabelError> {
        let expanded = self.expand_meta(labels);

        let mut server_type: Option<String> = None;
        let mut location: Option<String> = None;
        let mut image: Option<ImageRef> = None;
        let mut setup: Option<String> = None;
        let mut startup: Option<String> = None;

        for label in &expanded {
            let lower = label.to_ascii_lowercase();
            let Some(reserved) = lower.strip_prefix(&self.label_prefix) else {
                continue;
            };

            if let Some(value) = reserved.strip_prefix("type-") {
                set_once(&mut server_type, value.to_string(), "type")?;
            } else if let Some(value) = reserved.strip_prefix("in-") {
                set_once(&mut location, value.to_string(), "in")?;
            } else if let Some(value) = reserved.strip_prefix("image-") {
                set_once(&mut image, ImageRef::parse(value, '-')?, "image")?;
            } else if let Some(value) = reserved.strip_prefix("setup-") {
                set_once(&mut setup, value.to_string(), "setup")?;
            } else if let Some(value) = reserved.strip_prefix("startup-") {
                set_once(&mut startup, value.to_string(), "startup")?;
            }
        }

        let server_type = server_type.unwrap_or_else(|| self.default_server_type.clone());
        let server_type = catalog
            .server_type(&server_type)
            .cloned()
            .ok_or(LabelError::UnknownServerType(server_type))?;

        let location = match location.or_else(|| self.default_location.clone()) {
            Some(name) => Some(
                catalog
                    .location(&name)
                    .cloned()
                    .ok_or(LabelError::UnknownLocation(name))?,
            ),
            None => None,
        };

        let image_ref = match image {
            Some(image_ref) => image_ref,
            None => ImageRef::parse(&self.default_image, ':')?,
        };
        let image = catalog
            .image(&image_ref)
            .cloned()
            .ok_or_else(|| LabelError::UnknownImage(image_ref.name.clone()))?;

        Ok(RunnerSpec {
            server_type,
            location,
            image,
            setup_script: self.script_path(setup)?,
            startup_script: self.script_path(startup)?,
            labels: labels.to_vec(),
            ssh_keys_hash: self.ssh_keys_hash.clone(),
        })
    }

    /// One-level meta-label expansion; nested meta-labels are not expanded.
    /// Collisions resolve to the first occurrence.
    fn expand_meta(&self, labels: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(labels.len());
        for label in labels {
            match self.meta_labels.get(label) {
                Some(expansion) => {
                    for expanded in expansion {
                        push_unique(&mut out, expanded);
                    }
                }
                None => push_unique(&mut out, label),
            }
        }
        out
    }

    fn script_path(&self, name: Option<String>) -> Result<Option<PathBuf>, LabelError> {
        let Some(name) = name else {
            return Ok(None);
        };
        let Some(dir) = &self.scripts else {
            return Err(LabelError::ScriptsDirUnset(name));
        };
        let path = dir.join(format!("{name}.sh"));
        if !path.is_file() {
            return Err(LabelError::MissingScript(path));
        }
        Ok(Some(path))
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, category: &'static str) -> Result<(), LabelError> {
    if slot.is_some() {
        return Err(LabelError::Duplicate(category));
    }
    *slot = Some(value);
    Ok(())
}

fn push_unique(out: &mut Vec<String>, label: &str) {
    if !out.iter().any(|existing| existing == label) {
        out.push(label.to_string());
    }
}
