//! Capability traits over the cloud and CI providers.
//!
//! The loops depend only on these two interfaces (plus [`Provision`] for the
//! SSH bootstrap), so they can be exercised against in-memory fakes. The
//! concrete implementations translate provider-specific errors; in
//! particular, a name-uniqueness rejection surfaces as a typed outcome
//! because the naming invariant makes it a success for the caller.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::github::GithubClient;
use crate::hetzner::HetznerClient;
use crate::labels::Catalog;
use crate::model::{
    CloudLabels, Image, Job, Location, RateLimit, Runner, RunnerSpec, Server, ServerType, SshKey,
};

/// Request to create one server, fully determined at plan time.
#[derive(Clone, Debug)]
pub struct CreateServer {
    pub name: String,
    pub server_type: String,
    pub image: Image,
    pub location: Option<String>,
    pub ssh_key_ids: Vec<u64>,
    pub labels: CloudLabels,
}

#[derive(Debug)]
pub enum Created {
    Created(Server),
    /// Another worker already holds the name.
    NameTaken,
}

#[derive(Debug)]
pub enum Renamed {
    Renamed(Server),
    NameTaken,
}

#[async_trait]
pub trait Cloud: Send + Sync {
    async fn servers(&self) -> Result<Vec<Server>>;
    async fn create_server(&self, request: CreateServer) -> Result<Created>;
    async fn get_server(&self, server: &Server) -> Result<Option<Server>>;
    async fn delete_server(&self, server: &Server) -> Result<()>;
    async fn rename_server(
        &self,
        server: &Server,
        new_name: &str,
        labels: &CloudLabels,
    ) -> Result<Renamed>;
    async fn set_labels(&self, server: &Server, labels: &CloudLabels) -> Result<()>;
    async fn rebuild_server(&self, server: &Server, image: &Image) -> Result<()>;
    async fn power_on(&self, server: &Server) -> Result<()>;
    async fn server_types(&self) -> Result<Vec<ServerType>>;
    async fn locations(&self) -> Result<Vec<Location>>;
    async fn images(&self) -> Result<Vec<Image>>;
    async fn ssh_keys(&self) -> Result<Vec<SshKey>>;
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey>;
}

#[async_trait]
pub trait Ci: Send + Sync {
    /// Jobs of queued and in-progress workflow runs, newest run first.
    async fn jobs(&self) -> Result<Vec<Job>>;
    async fn runners(&self) -> Result<Vec<Runner>>;
    async fn registration_token(&self) -> Result<String>;
    async fn remove_runner(&self, runner: &Runner) -> Result<()>;
    async fn rate_limit(&self) -> Result<RateLimit>;
}

/// Drives a freshly created or rebuilt server until its runner is launched.
#[async_trait]
pub trait Provision: Send + Sync {
    async fn provision(&self, server: &Server, spec: &RunnerSpec) -> Result<()>;
}

#[async_trait]
impl Cloud for HetznerClient {
    async fn servers(&self) -> Result<Vec<Server>> {
        Ok(HetznerClient::servers(self).await?)
    }

    async fn create_server(&self, request: CreateServer) -> Result<Created> {
        let ssh_key_ids = request.ssh_key_ids.clone();
        match HetznerClient::create_server(
            self,
            &request.name,
            &request.server_type,
            &request.image,
            request.location.as_deref(),
            &ssh_key_ids,
            &request.labels,
        )
        .await
        {
            Ok(server) => Ok(Created::Created(server)),
            Err(e) if e.is_uniqueness() => Ok(Created::NameTaken),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_server(&self, server: &Server) -> Result<Option<Server>> {
        Ok(HetznerClient::get_server(self, server).await?)
    }

    async fn delete_server(&self, server: &Server) -> Result<()> {
        Ok(HetznerClient::delete_server(self, server).await?)
    }

    async fn rename_server(
        &self,
        server: &Server,
        new_name: &str,
        labels: &CloudLabels,
    ) -> Result<Renamed> {
        match HetznerClient::rename_server(self, server, new_name, labels).await {
            Ok(server) => Ok(Renamed::Renamed(server)),
            Err(e) if e.is_uniqueness() => Ok(Renamed::NameTaken),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_labels(&self, server: &Server, labels: &CloudLabels) -> Result<()> {
        HetznerClient::rename_server(self, server, &server.name, labels).await?;
        Ok(())
    }

    async fn rebuild_server(&self, server: &Server, image: &Image) -> Result<()> {
        Ok(HetznerClient::rebuild_server(self, server, image).await?)
    }

    async fn power_on(&self, server: &Server) -> Result<()> {
        Ok(HetznerClient::power_on(self, server).await?)
    }

    async fn server_types(&self) -> Result<Vec<ServerType>> {
        Ok(HetznerClient::server_types(self).await?)
    }

    async fn locations(&self) -> Result<Vec<Location>> {
        Ok(HetznerClient::locations(self).await?)
    }

    async fn images(&self) -> Result<Vec<Image>> {
        Ok(HetznerClient::images(self).await?)
    }

    async fn ssh_keys(&self) -> Result<Vec<SshKey>> {
        Ok(HetznerClient::ssh_keys(self).await?)
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey> {
        Ok(HetznerClient::create_ssh_key(self, name, public_key).await?)
    }
}

#[async_trait]
impl Ci for GithubClient {
    async fn jobs(&self) -> Result<Vec<Job>> {
        Ok(GithubClient::jobs(self).await?)
    }

    async fn runners(&self) -> Result<Vec<Runner>> {
        Ok(GithubClient::runners(self).await?)
    }

    async fn registration_token(&self) -> Result<String> {
        Ok(GithubClient::registration_token(self).await?)
    }

    async fn remove_runner(&self, runner: &Runner) -> Result<()> {
        Ok(GithubClient::remove_runner(self, runner).await?)
    }

    async fn rate_limit(&self) -> Result<RateLimit> {
        Ok(GithubClient::rate_limit(self).await?)
    }
}

/// Loads the catalogs the label resolver validates against.
pub async fn load_catalog(cloud: &dyn Cloud) -> Result<Catalog> {
    Ok(Catalog {
        server_types: cloud.server_types().await?,
        locations: cloud.locations().await?,
        images: cloud.images().await?,
    })
}

/// Makes sure every configured public key exists at the cloud and returns
/// the key set installed on all owned servers.
pub async fn ensure_ssh_keys(
    cloud: &dyn Cloud,
    key_paths: &[std::path::PathBuf],
) -> Result<Vec<SshKey>> {
    let existing = cloud.ssh_keys().await?;
    let mut keys = Vec::with_capacity(key_paths.len());

    for path in key_paths {
        let material = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read ssh key {}: {e}", path.display()))?;
        let material = material.trim();

        match existing
            .iter()
            .find(|key| same_key_material(&key.public_key, material))
        {
            Some(key) => keys.push(key.clone()),
            None => {
                let name = format!(
                    "github-actions-hetzner-{}",
                    &blake3::hash(material.as_bytes()).to_hex().as_str()[..8]
                );
                let key = cloud.create_ssh_key(&name, material).await?;
                info!(key = %key.name, path = %path.display(), "uploaded ssh key");
                keys.push(key);
            }
        }
    }

    Ok(keys)
}

/// Compares `{type} {base64}` and ignores the trailing comment, which the
/// cloud does not preserve verbatim.
fn same_key_material(a: &str, b: &str) -> bool {
    let head = |key: &str| -> Option<(String, String)> {
        let mut parts = key.split_whitespace();
        Some((parts.next()?.to_string(), parts.next()?.to_string()))
    };
    match (head(a), head(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
