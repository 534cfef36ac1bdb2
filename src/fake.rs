//! In-memory `Cloud`/`Ci`/`Provision` implementations for loop tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::model::{
    Arch, CloudLabels, Image, ImageKind, Job, JobStatus, Location, Price, RateLimit, Runner,
    RunnerSpec, Server, ServerStatus, ServerType, SshKey,
};
use crate::providers::{Ci, Cloud, Created, CreateServer, Provision, Renamed};

pub fn server_types() -> Vec<ServerType> {
    let priced = |name: &str, hourly: f64| ServerType {
        id: 0,
        name: name.into(),
        architecture: if name.starts_with("cax") {
            Arch::Arm
        } else {
            Arch::X86
        },
        prices: vec![
            Price {
                location: "fsn1".into(),
                hourly,
            },
            Price {
                location: "hel1".into(),
                hourly,
            },
        ],
    };
    vec![
        priced("cx22", 0.006),
        priced("cpx21", 0.012),
        priced("cax21", 0.009),
    ]
}

pub fn locations() -> Vec<Location> {
    vec![
        Location {
            id: 1,
            name: "fsn1".into(),
        },
        Location {
            id: 2,
            name: "hel1".into(),
        },
    ]
}

pub fn images() -> Vec<Image> {
    vec![Image {
        id: 42,
        kind: ImageKind::System,
        architecture: Arch::X86,
        name: Some("ubuntu-22.04".into()),
        description: "Ubuntu 22.04".into(),
    }]
}

pub fn ssh_keys() -> Vec<SshKey> {
    vec![SshKey {
        id: 9,
        name: "ci".into(),
        public_key: "ssh-ed25519 AAAAC3Nza ci".into(),
    }]
}

pub fn queued_job(run_id: u64, id: u64, labels: &[&str]) -> Job {
    Job {
        id,
        run_id,
        name: format!("job-{id}"),
        status: JobStatus::Queued,
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

pub fn online_runner(name: &str, busy: bool, labels: &[&str]) -> Runner {
    Runner {
        id: name.len() as u64,
        name: name.into(),
        online: true,
        busy,
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct FakeCloud {
    pub servers: Mutex<Vec<Server>>,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub renamed: Mutex<Vec<(String, String)>>,
    pub rebuilt: Mutex<Vec<String>>,
    pub relabeled: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl FakeCloud {
    pub fn with_servers(servers: Vec<Server>) -> Self {
        Self {
            servers: Mutex::new(servers),
            next_id: AtomicU64::new(1000),
            ..Self::default()
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .map(|server| server.name.clone())
            .collect()
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn servers(&self) -> Result<Vec<Server>> {
        Ok(self.servers.lock().unwrap().clone())
    }

    async fn create_server(&self, request: CreateServer) -> Result<Created> {
        let mut servers = self.servers.lock().unwrap();
        if servers.iter().any(|server| server.name == request.name) {
            return Ok(Created::NameTaken);
        }
        let server = Server {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: request.name.clone(),
            status: ServerStatus::Running,
            server_type: request.server_type.clone(),
            location: request.location.clone().unwrap_or_else(|| "fsn1".into()),
            public_ipv4: Some("10.0.0.1".parse().unwrap()),
            created_at: Utc::now(),
            labels: request.labels.clone(),
        };
        servers.push(server.clone());
        self.created.lock().unwrap().push(request.name);
        Ok(Created::Created(server))
    }

    async fn get_server(&self, server: &Server) -> Result<Option<Server>> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == server.id)
            .cloned())
    }

    async fn delete_server(&self, server: &Server) -> Result<()> {
        self.servers.lock().unwrap().retain(|s| s.id != server.id);
        self.deleted.lock().unwrap().push(server.name.clone());
        Ok(())
    }

    async fn rename_server(
        &self,
        server: &Server,
        new_name: &str,
        labels: &CloudLabels,
    ) -> Result<Renamed> {
        let mut servers = self.servers.lock().unwrap();
        if servers
            .iter()
            .any(|s| s.name == new_name && s.id != server.id)
        {
            return Ok(Renamed::NameTaken);
        }
        let Some(stored) = servers.iter_mut().find(|s| s.id == server.id) else {
            anyhow::bail!("server {} not found", server.name);
        };
        self.renamed
            .lock()
            .unwrap()
            .push((stored.name.clone(), new_name.to_string()));
        stored.name = new_name.to_string();
        stored.labels = labels.clone();
        Ok(Renamed::Renamed(stored.clone()))
    }

    async fn set_labels(&self, server: &Server, labels: &CloudLabels) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();
        if let Some(stored) = servers.iter_mut().find(|s| s.id == server.id) {
            stored.labels = labels.clone();
        }
        self.relabeled.lock().unwrap().push(server.name.clone());
        Ok(())
    }

    async fn rebuild_server(&self, server: &Server, _image: &Image) -> Result<()> {
        self.rebuilt.lock().unwrap().push(server.name.clone());
        let mut servers = self.servers.lock().unwrap();
        if let Some(stored) = servers.iter_mut().find(|s| s.id == server.id) {
            stored.status = ServerStatus::Running;
        }
        Ok(())
    }

    async fn power_on(&self, _server: &Server) -> Result<()> {
        Ok(())
    }

    async fn server_types(&self) -> Result<Vec<ServerType>> {
        Ok(server_types())
    }

    async fn locations(&self) -> Result<Vec<Location>> {
        Ok(locations())
    }

    async fn images(&self) -> Result<Vec<Image>> {
        Ok(images())
    }

    async fn ssh_keys(&self) -> Result<Vec<SshKey>> {
        Ok(ssh_keys())
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey> {
        Ok(SshKey {
            id: 100,
            name: name.into(),
            public_key: public_key.into(),
        })
    }
}

#[derive(Default)]
pub struct FakeCi {
    pub jobs: Mutex<Vec<Job>>,
    pub runners: Mutex<Vec<Runner>>,
    pub removed: Mutex<Vec<String>>,
    pub tokens_issued: AtomicU64,
}

impl FakeCi {
    pub fn new(jobs: Vec<Job>, runners: Vec<Runner>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
            runners: Mutex::new(runners),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Ci for FakeCi {
    async fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn runners(&self) -> Result<Vec<Runner>> {
        Ok(self.runners.lock().unwrap().clone())
    }

    async fn registration_token(&self) -> Result<String> {
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!("AAToken{n}"))
    }

    async fn remove_runner(&self, runner: &Runner) -> Result<()> {
        self.runners.lock().unwrap().retain(|r| r.id != runner.id);
        self.removed.lock().unwrap().push(runner.name.clone());
        Ok(())
    }

    async fn rate_limit(&self) -> Result<RateLimit> {
        Ok(RateLimit {
            limit: 5000,
            used: 1,
            remaining: 4999,
            reset: Utc::now(),
        })
    }
}

#[derive(Default)]
pub struct FakeProvision {
    pub provisioned: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl Provision for FakeProvision {
    async fn provision(&self, server: &Server, _spec: &RunnerSpec) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("setup script exited with status 1");
        }
        self.provisioned.lock().unwrap().push(server.name.clone());
        Ok(())
    }
}

/// Owned server scaffold for plan tests.
pub fn server(name: &str, status: ServerStatus, role: &str, server_type: &str) -> Server {
    let mut labels: CloudLabels = BTreeMap::new();
    labels.insert("role".into(), role.into());
    labels.insert("server_type".into(), server_type.into());
    labels.insert("image".into(), "42".into());
    labels.insert("ssh_keys_hash".into(), crate::model::hash_ssh_key_set(&ssh_keys()));
    labels.insert("prefix".into(), "gha".into());
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    Server {
        id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
        name: name.into(),
        status,
        server_type: server_type.into(),
        location: "fsn1".into(),
        public_ipv4: Some("10.0.0.2".parse().unwrap()),
        created_at: Utc::now(),
        labels,
    }
}
