//! Per-server lifecycle tasks dispatched to the worker pool by the loops.
//!
//! Each task is a pure function of state captured at plan time. Conflicts on
//! a server name are resolved by the cloud's uniqueness guarantee: a
//! `NameTaken` outcome means another worker already handled the name, and the
//! task exits successfully.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::model::{label_keys, CloudLabels, Role, RunnerSpec, Server, ServerStatus};
use crate::providers::{Cloud, CreateServer, Created, Provision, Renamed};
use crate::workers::{Event, Mailbox};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a per-server task needs besides its plan entry.
#[derive(Clone)]
pub struct TaskContext {
    pub cloud: Arc<dyn Cloud>,
    pub provisioner: Arc<dyn Provision>,
    pub mailbox: Mailbox,
    pub prefix: String,
    pub ssh_key_ids: Vec<u64>,
    pub ready_timeout: Duration,
}

impl TaskContext {
    /// NEW -> CREATE_SERVER -> WAIT_RUNNING -> provision -> DONE, deleting
    /// the server on any failure along the way.
    #[instrument(skip(self, spec), fields(server = %name, role = role.as_str()))]
    pub async fn create(self, name: String, role: Role, spec: RunnerSpec) -> Result<()> {
        let request = CreateServer {
            name: name.clone(),
            server_type: spec.server_type.name.clone(),
            image: spec.image.clone(),
            location: spec.location.as_ref().map(|l| l.name.clone()),
            ssh_key_ids: self.ssh_key_ids.clone(),
            labels: self.labels_for(role, &spec, spec.location.as_ref().map(|l| l.name.as_str())),
        };

        let server = match self.cloud.create_server(request).await? {
            Created::NameTaken => {
                info!(server = %name, "name already taken, treating as handled");
                return Ok(());
            }
            Created::Created(server) => server,
        };
        info!(server = %name, id = server.id, "server created");

        self.finish(server, spec).await
    }

    /// Rename-and-rebuild of a matched recycle candidate into the active
    /// name: rename, reimage, boot, re-bootstrap.
    #[instrument(skip(self, server, spec), fields(server = %server.name, new_name = %name))]
    pub async fn recycle(self, server: Server, name: String, spec: RunnerSpec) -> Result<()> {
        let mut labels = server.labels.clone();
        self.stamp(&mut labels, Role::Active, &spec, Some(&server.location));

        let server = match self.cloud.rename_server(&server, &name, &labels).await? {
            Renamed::NameTaken => {
                info!(server = %name, "name already taken, treating as handled");
                return Ok(());
            }
            Renamed::Renamed(server) => server,
        };
        info!(server = %server.name, fingerprint = %spec.fingerprint(), "recycled server renamed");

        let prepared = async {
            self.cloud
                .rebuild_server(&server, &spec.image)
                .await
                .context("rebuild failed")?;
            self.cloud.power_on(&server).await.context("power-on failed")
        }
        .await;
        if let Err(e) = prepared {
            self.delete_after_failure(&server).await;
            return Err(e);
        }

        self.finish(server, spec).await
    }

    /// Standby promotion: rename only. The standby's runner is already
    /// registered and online; no reimage, no new registration.
    #[instrument(skip(self, server, spec), fields(server = %server.name, new_name = %name))]
    pub async fn promote(self, server: Server, name: String, spec: RunnerSpec) -> Result<()> {
        let mut labels = server.labels.clone();
        self.stamp(&mut labels, Role::Active, &spec, Some(&server.location));

        match self.cloud.rename_server(&server, &name, &labels).await? {
            Renamed::NameTaken => {
                info!(server = %name, "name already taken, treating as handled");
            }
            Renamed::Renamed(server) => {
                info!(server = %server.name, "standby promoted");
                self.mailbox.send(Event::ServerReady {
                    server: server.name,
                });
            }
        }
        Ok(())
    }

    /// Deletes the eviction victim, then creates the replacement.
    #[instrument(skip(self, victim, spec), fields(victim = %victim.name, server = %name))]
    pub async fn evict_and_create(
        self,
        victim: Server,
        name: String,
        spec: RunnerSpec,
    ) -> Result<()> {
        self.cloud
            .delete_server(&victim)
            .await
            .context("eviction failed")?;
        info!(victim = %victim.name, "evicted recyclable server");
        self.mailbox.send(Event::ServerDeleted {
            server: victim.name.clone(),
        });

        self.create(name, Role::Active, spec).await
    }

    async fn finish(self, server: Server, spec: RunnerSpec) -> Result<()> {
        let provisioned = async {
            let server = self.wait_running(&server).await?;
            self.provisioner.provision(&server, &spec).await?;
            Ok::<_, anyhow::Error>(server)
        }
        .await;

        match provisioned {
            Ok(server) => {
                self.mailbox.send(Event::ServerReady {
                    server: server.name.clone(),
                });
                Ok(())
            }
            Err(e) => {
                self.delete_after_failure(&server).await;
                Err(e)
            }
        }
    }

    async fn wait_running(&self, server: &Server) -> Result<Server> {
        let deadline = Instant::now() + self.ready_timeout;
        let mut current = server.clone();
        loop {
            if current.status == ServerStatus::Running && current.public_ipv4.is_some() {
                return Ok(current);
            }
            if Instant::now() >= deadline {
                bail!(
                    "server {} not running within {:?}",
                    server.name,
                    self.ready_timeout
                );
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
            current = self
                .cloud
                .get_server(server)
                .await?
                .ok_or_else(|| anyhow!("server {} disappeared while starting", server.name))?;
        }
    }

    async fn delete_after_failure(&self, server: &Server) {
        if let Err(e) = self.cloud.delete_server(server).await {
            warn!(server = %server.name, error = %e, "failed to delete server after failure");
        } else {
            info!(server = %server.name, "deleted server after failure");
        }
    }

    fn labels_for(
        &self,
        role: Role,
        spec: &RunnerSpec,
        location: Option<&str>,
    ) -> CloudLabels {
        let mut labels = CloudLabels::new();
        self.stamp(&mut labels, role, spec, location);
        labels.insert(
            label_keys::SERVER_TYPE.into(),
            spec.server_type.name.clone(),
        );
        labels.insert(label_keys::IMAGE.into(), spec.image.identity());
        labels.insert(label_keys::SSH_KEYS_HASH.into(), spec.ssh_keys_hash.clone());
        labels.insert(label_keys::PREFIX.into(), self.prefix.clone());
        labels
    }

    fn stamp(
        &self,
        labels: &mut CloudLabels,
        role: Role,
        spec: &RunnerSpec,
        location: Option<&str>,
    ) {
        labels.insert(label_keys::ROLE.into(), role.as_str().into());
        labels.insert(
            label_keys::RUNNER_LABELS_HASH.into(),
            spec.runner_labels_hash(),
        );
        labels.insert(
            label_keys::PROVISIONED_AT.into(),
            Utc::now().timestamp().to_string(),
        );
        if let Some(location) = location {
            labels.insert(label_keys::LOCATION.into(), location.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeCloud, FakeProvision};
    use crate::model::hash_ssh_key_set;
    use crate::workers::mailbox;
    use std::sync::atomic::Ordering;

    fn spec() -> RunnerSpec {
        RunnerSpec {
            server_type: fake::server_types().remove(0),
            location: None,
            image: fake::images().remove(0),
            setup_script: None,
            startup_script: None,
            labels: vec!["self-hosted".into()],
            ssh_keys_hash: hash_ssh_key_set(&fake::ssh_keys()),
        }
    }

    fn context(cloud: Arc<FakeCloud>, provisioner: Arc<FakeProvision>) -> (TaskContext, crate::workers::MailboxReceiver) {
        let (tx, rx) = mailbox();
        (
            TaskContext {
                cloud,
                provisioner,
                mailbox: tx,
                prefix: "gha".into(),
                ssh_key_ids: vec![9],
                ready_timeout: Duration::from_secs(2),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn create_provisions_and_reports_ready() {
        let cloud = Arc::new(FakeCloud::default());
        let provisioner = Arc::new(FakeProvision::default());
        let (ctx, mut rx) = context(cloud.clone(), provisioner.clone());

        ctx.create("gha-1-2".into(), Role::Active, spec())
            .await
            .unwrap();

        assert_eq!(cloud.server_names(), vec!["gha-1-2"]);
        let server = &cloud.servers.lock().unwrap()[0];
        assert_eq!(server.label(label_keys::ROLE), Some("active"));
        assert_eq!(server.label(label_keys::IMAGE), Some("42"));
        assert!(server.label(label_keys::PROVISIONED_AT).is_some());
        assert_eq!(
            provisioner.provisioned.lock().unwrap().as_slice(),
            ["gha-1-2"]
        );
        assert!(matches!(
            rx.drain().as_slice(),
            [Event::ServerReady { server }] if server == "gha-1-2"
        ));
    }

    #[tokio::test]
    async fn create_on_taken_name_is_a_noop_success() {
        let cloud = Arc::new(FakeCloud::with_servers(vec![fake::server(
            "gha-1-2",
            ServerStatus::Running,
            "active",
            "cx22",
        )]));
        let provisioner = Arc::new(FakeProvision::default());
        let (ctx, mut rx) = context(cloud.clone(), provisioner.clone());

        ctx.create("gha-1-2".into(), Role::Active, spec())
            .await
            .unwrap();

        assert!(cloud.created.lock().unwrap().is_empty());
        assert!(provisioner.provisioned.lock().unwrap().is_empty());
        assert!(rx.drain().is_empty());
    }

    #[tokio::test]
    async fn failed_bootstrap_deletes_the_server() {
        let cloud = Arc::new(FakeCloud::default());
        let provisioner = Arc::new(FakeProvision::default());
        provisioner.fail.store(true, Ordering::SeqCst);
        let (ctx, mut rx) = context(cloud.clone(), provisioner.clone());

        let result = ctx.create("gha-1-2".into(), Role::Active, spec()).await;
        assert!(result.is_err());
        assert!(cloud.server_names().is_empty());
        assert_eq!(cloud.deleted.lock().unwrap().as_slice(), ["gha-1-2"]);
        assert!(rx.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recycle_renames_rebuilds_and_provisions() {
        let recyclable = fake::server("gha-recycle-3", ServerStatus::Off, "recycle", "cx22");
        let cloud = Arc::new(FakeCloud::with_servers(vec![recyclable.clone()]));
        let provisioner = Arc::new(FakeProvision::default());
        let (ctx, mut rx) = context(cloud.clone(), provisioner.clone());

        ctx.recycle(recyclable, "gha-5-6".into(), spec())
            .await
            .unwrap();

        assert_eq!(cloud.server_names(), vec!["gha-5-6"]);
        assert_eq!(cloud.rebuilt.lock().unwrap().len(), 1);
        let server = &cloud.servers.lock().unwrap()[0];
        assert_eq!(server.label(label_keys::ROLE), Some("active"));
        assert_eq!(server.label(label_keys::LOCATION), Some("fsn1"));
        assert!(matches!(
            rx.drain().as_slice(),
            [Event::ServerReady { server }] if server == "gha-5-6"
        ));
    }

    #[tokio::test]
    async fn promote_renames_without_rebuilding() {
        let standby = fake::server("gha-standby-g0-1", ServerStatus::Running, "standby", "cx22");
        let cloud = Arc::new(FakeCloud::with_servers(vec![standby.clone()]));
        let provisioner = Arc::new(FakeProvision::default());
        let (ctx, mut rx) = context(cloud.clone(), provisioner.clone());

        ctx.promote(standby, "gha-5-6".into(), spec()).await.unwrap();

        assert_eq!(cloud.server_names(), vec!["gha-5-6"]);
        assert!(cloud.rebuilt.lock().unwrap().is_empty());
        assert!(provisioner.provisioned.lock().unwrap().is_empty());
        assert_eq!(rx.drain().len(), 1);
    }

    #[tokio::test]
    async fn evict_and_create_deletes_victim_first() {
        let victim = fake::server("gha-recycle-1", ServerStatus::Off, "recycle", "cpx21");
        let cloud = Arc::new(FakeCloud::with_servers(vec![victim.clone()]));
        let provisioner = Arc::new(FakeProvision::default());
        let (ctx, mut rx) = context(cloud.clone(), provisioner.clone());

        ctx.evict_and_create(victim, "gha-5-6".into(), spec())
            .await
            .unwrap();

        assert_eq!(cloud.deleted.lock().unwrap().as_slice(), ["gha-recycle-1"]);
        assert_eq!(cloud.server_names(), vec!["gha-5-6"]);
        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::ServerDeleted { server } if server == "gha-recycle-1"));
    }
}
