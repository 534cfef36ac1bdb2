//! Typed wrapper over the Hetzner Cloud REST API: servers, server types,
//! locations, images, SSH keys and prices.

mod models;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::model::{CloudLabels, Image, Location, Server, ServerType, SshKey};
use crate::names::ServerNamer;

use models::*;

const API_BASE: &str = "https://api.hetzner.cloud/v1";

#[derive(Debug, Error)]
pub enum HetznerError {
    #[error("failed to build hetzner http client")]
    Build(#[source] reqwest::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("hetzner api returned {status} ({code}) for {url}: {message}")]
    Api {
        status: u16,
        code: String,
        url: String,
        message: String,
    },

    #[error("failed to decode hetzner response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HetznerError {
    /// Name already taken. The naming invariant makes this a success for the
    /// caller: another worker holds the name.
    pub fn is_uniqueness(&self) -> bool {
        matches!(self, HetznerError::Api { code, .. } if code == "uniqueness_error")
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HetznerError::Api { code, .. } if code == "not_found")
    }
}

#[derive(Clone, Debug)]
pub struct HetznerClient {
    http: reqwest::Client,
    namer: ServerNamer,
}

impl HetznerClient {
    pub fn new(token: &str, namer: ServerNamer) -> Result<Self, HetznerError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| HetznerError::Api {
                status: 0,
                code: "invalid_token".into(),
                url: API_BASE.to_string(),
                message: "hetzner token contains invalid header characters".into(),
            })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(HetznerError::Build)?;

        Ok(Self { http, namer })
    }

    /// All controller-owned servers; everything else in the project is
    /// invisible, including on error paths.
    #[instrument(skip(self))]
    pub async fn servers(&self) -> Result<Vec<Server>, HetznerError> {
        let mut servers = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{API_BASE}/servers?per_page=50&page={page}");
            let body: ServersPage = self.get(&url).await?;
            servers.extend(
                body.servers
                    .into_iter()
                    .map(server_from_wire)
                    .filter(|server| self.namer.owns(&server.name)),
            );
            match body.meta.and_then(|m| m.pagination).and_then(|p| p.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(servers)
    }

    #[instrument(skip(self, labels), fields(name = %name, server_type = %server_type, image = %image.identity()))]
    pub async fn create_server(
        &self,
        name: &str,
        server_type: &str,
        image: &Image,
        location: Option<&str>,
        ssh_key_ids: &[u64],
        labels: &CloudLabels,
    ) -> Result<Server, HetznerError> {
        let body = CreateServerBody {
            name: name.to_string(),
            server_type: server_type.to_string(),
            image: image.id.to_string(),
            location: location.map(str::to_string),
            ssh_keys: ssh_key_ids.to_vec(),
            labels: labels.clone(),
            start_after_create: true,
        };
        let envelope: ServerEnvelope = self.post(&format!("{API_BASE}/servers"), &body).await?;
        Ok(server_from_wire(envelope.server))
    }

    #[instrument(skip(self, server), fields(server = %server.name, id = server.id))]
    pub async fn get_server(&self, server: &Server) -> Result<Option<Server>, HetznerError> {
        let url = format!("{API_BASE}/servers/{}", server.id);
        match self.get::<ServerEnvelope>(&url).await {
            Ok(envelope) => Ok(Some(server_from_wire(envelope.server))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, server), fields(server = %server.name, id = server.id))]
    pub async fn delete_server(&self, server: &Server) -> Result<(), HetznerError> {
        let url = format!("{API_BASE}/servers/{}", server.id);
        let response = self.http.delete(&url).send().await?;
        match Self::check(&url, response).await {
            Ok(_) => Ok(()),
            // Already deleted is deleted.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Renames a server and replaces its labels in one update.
    #[instrument(skip(self, server, labels), fields(server = %server.name, new_name = %new_name))]
    pub async fn rename_server(
        &self,
        server: &Server,
        new_name: &str,
        labels: &CloudLabels,
    ) -> Result<Server, HetznerError> {
        let url = format!("{API_BASE}/servers/{}", server.id);
        let body = UpdateServerBody {
            name: new_name.to_string(),
            labels: labels.clone(),
        };
        let response = self.http.put(&url).json(&body).send().await?;
        let body = Self::check(&url, response).await?;
        let envelope: ServerEnvelope = Self::decode(&url, &body)?;
        Ok(server_from_wire(envelope.server))
    }

    #[instrument(skip(self, server), fields(server = %server.name, image = %image.identity()))]
    pub async fn rebuild_server(&self, server: &Server, image: &Image) -> Result<(), HetznerError> {
        let url = format!("{API_BASE}/servers/{}/actions/rebuild", server.id);
        let body = RebuildBody {
            image: image.id.to_string(),
        };
        self.post::<_, serde_json::Value>(&url, &body).await?;
        Ok(())
    }

    #[instrument(skip(self, server), fields(server = %server.name))]
    pub async fn power_on(&self, server: &Server) -> Result<(), HetznerError> {
        let url = format!("{API_BASE}/servers/{}/actions/poweron", server.id);
        match self
            .post::<_, serde_json::Value>(&url, &serde_json::json!({}))
            .await
        {
            Ok(_) => Ok(()),
            // Rebuild may have booted the server already.
            Err(HetznerError::Api { code, .. }) if code == "server_already_started" => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn server_types(&self) -> Result<Vec<ServerType>, HetznerError> {
        let mut server_types = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{API_BASE}/server_types?per_page=50&page={page}");
            let body: ServerTypesPage = self.get(&url).await?;
            server_types.extend(body.server_types.into_iter().map(server_type_from_wire));
            match body.meta.and_then(|m| m.pagination).and_then(|p| p.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(server_types)
    }

    #[instrument(skip(self))]
    pub async fn locations(&self) -> Result<Vec<Location>, HetznerError> {
        let url = format!("{API_BASE}/locations");
        let body: LocationsPage = self.get(&url).await?;
        Ok(body.locations.into_iter().map(location_from_wire).collect())
    }

    #[instrument(skip(self))]
    pub async fn images(&self) -> Result<Vec<Image>, HetznerError> {
        let mut images = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{API_BASE}/images?per_page=50&page={page}");
            let body: ImagesPage = self.get(&url).await?;
            images.extend(body.images.into_iter().map(image_from_wire));
            match body.meta.and_then(|m| m.pagination).and_then(|p| p.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(images)
    }

    #[instrument(skip(self))]
    pub async fn ssh_keys(&self) -> Result<Vec<SshKey>, HetznerError> {
        let url = format!("{API_BASE}/ssh_keys?per_page=50");
        let body: SshKeysPage = self.get(&url).await?;
        Ok(body.ssh_keys.into_iter().map(ssh_key_from_wire).collect())
    }

    #[instrument(skip(self, public_key), fields(name = %name))]
    pub async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<SshKey, HetznerError> {
        let body = CreateSshKeyBody {
            name: name.to_string(),
            public_key: public_key.to_string(),
        };
        let envelope: SshKeyEnvelope = self.post(&format!("{API_BASE}/ssh_keys"), &body).await?;
        Ok(ssh_key_from_wire(envelope.ssh_key))
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, HetznerError> {
        let response = self.http.get(url).send().await?;
        let body = Self::check(url, response).await?;
        Self::decode(url, &body)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, HetznerError> {
        let response = self.http.post(url).json(body).send().await?;
        let body = Self::check(url, response).await?;
        Self::decode(url, &body)
    }

    async fn check(url: &str, response: reqwest::Response) -> Result<String, HetznerError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(body);
        }

        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => (parsed.error.code, parsed.error.message),
            Err(_) => (
                if status == StatusCode::NOT_FOUND {
                    "not_found".to_string()
                } else {
                    "unknown".to_string()
                },
                body,
            ),
        };
        Err(HetznerError::Api {
            status: status.as_u16(),
            code,
            url: url.to_string(),
            message,
        })
    }

    fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, HetznerError> {
        serde_json::from_str(body).map_err(|source| HetznerError::Decode {
            url: url.to_string(),
            source,
        })
    }
}
