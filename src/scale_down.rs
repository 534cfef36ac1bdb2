//! The scale-down loop: one tick walks the three reaping passes in order
//! (powered-off, unused-runner, zombie), then replenishes the standby pools.
//!
//! Like scale-up, each pass plans from a fresh snapshot through pure
//! functions and then executes; the two loops share no mutable state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::api_watch::RateGauge;
use crate::config::Config;
use crate::labels::{Catalog, SpecResolver};
use crate::model::{
    age_in_hour, label_keys, minute_in_hour, Job, JobStatus, Role, Runner, RunnerSpec, Server,
    ServerStatus,
};
use crate::names::{ServerName, ServerNamer};
use crate::providers::{Ci, Cloud};
use crate::tasks::TaskContext;
use crate::workers::{Event, WorkerPool};

const TASK_GRACE: u64 = 900;

#[derive(Debug)]
pub(crate) enum Reaping {
    Delete {
        server: Server,
        reason: &'static str,
    },
    MakeRecyclable {
        server: Server,
        uid: u64,
    },
    /// First time a powered-off server is observed with recycling off;
    /// the stamp starts the `max_powered_off_time` clock.
    StampOffSince {
        server: Server,
    },
}

pub(crate) fn plan_powered_off(
    servers: &[Server],
    config: &Config,
    namer: &ServerNamer,
    now: DateTime<Utc>,
) -> Vec<Reaping> {
    let mut uid = crate::recycle::next_recycle_uid(servers, namer);
    let mut reapings = Vec::new();

    for server in servers {
        if server.status != ServerStatus::Off {
            continue;
        }
        let Some(parsed) = namer.parse(&server.name) else {
            continue;
        };

        if config.recycle {
            let age = server.age_seconds(now);
            let minute = minute_in_hour(age);
            if minute >= config.end_of_life as f64 {
                debug!(
                    server = %server.name,
                    hours_billed = age_in_hour(age) + 1,
                    minute_in_hour = minute,
                    "powered-off server reached end of life"
                );
                reapings.push(Reaping::Delete {
                    server: server.clone(),
                    reason: "end of life reached",
                });
            } else if matches!(
                parsed,
                ServerName::Active { .. } | ServerName::Standby { .. }
            ) {
                reapings.push(Reaping::MakeRecyclable {
                    server: server.clone(),
                    uid,
                });
                uid += 1;
            }
            continue;
        }

        let off_since = server
            .label(label_keys::OFF_SINCE)
            .and_then(|v| v.parse::<i64>().ok());
        match off_since {
            None => reapings.push(Reaping::StampOffSince {
                server: server.clone(),
            }),
            Some(since) if now.timestamp() - since > config.max_powered_off_time as i64 => {
                reapings.push(Reaping::Delete {
                    server: server.clone(),
                    reason: "powered off too long",
                });
            }
            Some(_) => {}
        }
    }

    reapings
}

#[derive(Debug)]
pub(crate) struct RunnerReap {
    pub runner: Runner,
    /// Deleted along with the runner when present.
    pub server: Option<Server>,
    pub reason: &'static str,
}

pub(crate) fn plan_unused_runners(
    servers: &[Server],
    runners: &[Runner],
    jobs: &[Job],
    config: &Config,
    namer: &ServerNamer,
    now: DateTime<Utc>,
) -> Vec<RunnerReap> {
    let server_by_name: HashMap<&str, &Server> = servers
        .iter()
        .map(|server| (server.name.as_str(), server))
        .collect();
    let live_jobs: HashSet<(u64, u64)> = jobs
        .iter()
        .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::InProgress))
        .map(|job| (job.run_id, job.id))
        .collect();

    let mut reapings = Vec::new();
    for runner in runners {
        let server = server_by_name.get(runner.name.as_str()).copied();

        // Offline leftovers whose server is gone can never work again.
        if server.is_none() && !runner.online && !runner.busy {
            reapings.push(RunnerReap {
                runner: runner.clone(),
                server: None,
                reason: "offline runner without a server",
            });
            continue;
        }

        // The timed reap applies to active-named runners only; standby
        // runners idle by design and are managed by the replenisher.
        let Some(ServerName::Active { run_id, job_id }) = namer.parse(&runner.name) else {
            continue;
        };
        if !runner.online || runner.busy || live_jobs.contains(&(run_id, job_id)) {
            continue;
        }
        let Some(server) = server else {
            continue;
        };
        if server.provisioned_age_seconds(now) > config.max_unused_runner_time as i64 {
            reapings.push(RunnerReap {
                runner: runner.clone(),
                server: Some(server.clone()),
                reason: "runner unused past its deadline",
            });
        }
    }

    reapings
}

/// Running active-named servers whose runner never registered. A server
/// serving an in-progress job is spared: a promoted standby works under its
/// old runner name.
pub(crate) fn plan_zombies(
    servers: &[Server],
    runners: &[Runner],
    jobs: &[Job],
    config: &Config,
    namer: &ServerNamer,
    now: DateTime<Utc>,
) -> Vec<Server> {
    let runner_names: HashSet<&str> = runners.iter().map(|runner| runner.name.as_str()).collect();
    let in_progress: HashSet<(u64, u64)> = jobs
        .iter()
        .filter(|job| job.status == JobStatus::InProgress)
        .map(|job| (job.run_id, job.id))
        .collect();

    servers
        .iter()
        .filter(|server| {
            let Some(ServerName::Active { run_id, job_id }) = namer.parse(&server.name) else {
                return false;
            };
            server.status == ServerStatus::Running
                && !runner_names.contains(server.name.as_str())
                && !in_progress.contains(&(run_id, job_id))
                && server.provisioned_age_seconds(now)
                    > config.max_runner_registration_time as i64
        })
        .cloned()
        .collect()
}

#[derive(Debug)]
pub(crate) struct StandbyCreate {
    pub name: String,
    pub spec: RunnerSpec,
}

pub(crate) fn plan_standby(
    servers: &[Server],
    runners: &[Runner],
    config: &Config,
    resolver: &SpecResolver,
    catalog: &Catalog,
    namer: &ServerNamer,
    now: DateTime<Utc>,
) -> Vec<StandbyCreate> {
    let runner_by_name: HashMap<&str, &Runner> = runners
        .iter()
        .map(|runner| (runner.name.as_str(), runner))
        .collect();
    // Servers that have no runner yet but are inside the provisioning window
    // still fill their bucket, so in-flight bootstraps are not duplicated.
    let provisioning_window =
        (config.max_server_ready_time + config.max_runner_registration_time) as i64;

    let mut creations = Vec::new();
    for (group, standby) in config.standby_runners.iter().enumerate() {
        let spec = match resolver.resolve(&standby.labels, catalog) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(group, error = %e, "standby group labels do not resolve");
                continue;
            }
        };

        let prefix = namer.standby_group_prefix(group);
        let members: Vec<&Server> = servers
            .iter()
            .filter(|server| server.name.starts_with(&prefix))
            .collect();

        let current = members
            .iter()
            .filter(|member| match runner_by_name.get(member.name.as_str()) {
                Some(runner) if runner.online => {
                    if standby.replenish_immediately {
                        !runner.busy
                    } else {
                        true
                    }
                }
                _ => member.provisioned_age_seconds(now) < provisioning_window,
            })
            .count();

        let mut used: HashSet<u64> = members
            .iter()
            .filter_map(|member| match namer.parse(&member.name) {
                Some(ServerName::Standby { uid, .. }) => Some(uid),
                _ => None,
            })
            .collect();

        for _ in current..standby.count {
            let uid = (1..).find(|uid| !used.contains(uid)).unwrap();
            used.insert(uid);
            creations.push(StandbyCreate {
                name: namer.standby(group, uid),
                spec: spec.clone(),
            });
        }
    }

    creations
}

pub struct ScaleDown {
    config: Config,
    namer: ServerNamer,
    resolver: SpecResolver,
    cloud: Arc<dyn Cloud>,
    ci: Arc<dyn Ci>,
    catalog: Arc<RwLock<Catalog>>,
    gauge: Arc<RateGauge>,
    pool: WorkerPool,
    tasks: TaskContext,
}

impl ScaleDown {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        namer: ServerNamer,
        resolver: SpecResolver,
        cloud: Arc<dyn Cloud>,
        ci: Arc<dyn Ci>,
        catalog: Arc<RwLock<Catalog>>,
        gauge: Arc<RateGauge>,
        pool: WorkerPool,
        tasks: TaskContext,
    ) -> Self {
        Self {
            config,
            namer,
            resolver,
            cloud,
            ci,
            catalog,
            gauge,
            pool,
            tasks,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.scale_down_interval);
        info!(interval = ?interval, recycle = self.config.recycle, "scale-down loop starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "scale-down tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("scale-down loop stopped");
    }

    #[instrument(skip(self))]
    async fn tick(&mut self) -> Result<()> {
        if self.gauge.exhausted() {
            warn!("api rate limit exhausted, skipping scale-down tick");
            return Ok(());
        }

        let servers = self.cloud.servers().await?;
        let runners: Vec<Runner> = self
            .ci
            .runners()
            .await?
            .into_iter()
            .filter(|runner| self.namer.owns(&runner.name))
            .collect();
        let jobs = self.ci.jobs().await?;
        let now = Utc::now();

        for reaping in plan_powered_off(&servers, &self.config, &self.namer, now) {
            self.execute_reaping(reaping, now).await;
        }

        for reap in plan_unused_runners(&servers, &runners, &jobs, &self.config, &self.namer, now)
        {
            info!(runner = %reap.runner.name, reason = reap.reason, "removing runner");
            if let Err(e) = self.ci.remove_runner(&reap.runner).await {
                warn!(runner = %reap.runner.name, error = %e, "failed to remove runner");
                continue;
            }
            if let Some(server) = reap.server {
                self.delete(&server, reap.reason).await;
            }
        }

        for server in plan_zombies(&servers, &runners, &jobs, &self.config, &self.namer, now) {
            self.delete(&server, "runner never registered").await;
        }

        let catalog = self.catalog.read().await.clone();
        let creations = plan_standby(
            &servers,
            &runners,
            &self.config,
            &self.resolver,
            &catalog,
            &self.namer,
            now,
        );
        let deadline = Duration::from_secs(
            self.config.max_server_ready_time + self.config.max_runner_registration_time
                + TASK_GRACE,
        );
        for creation in creations {
            info!(server = %creation.name, "replenishing standby pool");
            let context = self.tasks.clone();
            let mailbox = context.mailbox.clone();
            let name = creation.name.clone();
            self.pool.submit(creation.name, deadline, mailbox, async move {
                context.create(name, Role::Standby, creation.spec).await
            });
        }

        Ok(())
    }

    async fn execute_reaping(&self, reaping: Reaping, now: DateTime<Utc>) {
        match reaping {
            Reaping::Delete { server, reason } => self.delete(&server, reason).await,
            Reaping::MakeRecyclable { server, uid } => {
                let name = self.namer.recycle(uid);
                let mut labels = server.labels.clone();
                labels.insert(label_keys::ROLE.into(), Role::Recycle.as_str().into());
                labels.insert(label_keys::LOCATION.into(), server.location.clone());
                labels.remove(label_keys::OFF_SINCE);
                match self.cloud.rename_server(&server, &name, &labels).await {
                    Ok(crate::providers::Renamed::Renamed(renamed)) => {
                        info!(server = %server.name, recycled = %renamed.name, "server marked recyclable");
                    }
                    Ok(crate::providers::Renamed::NameTaken) => {
                        debug!(server = %server.name, name = %name, "recycle name already taken");
                    }
                    Err(e) => {
                        warn!(server = %server.name, error = %e, "failed to mark server recyclable");
                    }
                }
            }
            Reaping::StampOffSince { server } => {
                let mut labels = server.labels.clone();
                labels.insert(label_keys::OFF_SINCE.into(), now.timestamp().to_string());
                if let Err(e) = self.cloud.set_labels(&server, &labels).await {
                    warn!(server = %server.name, error = %e, "failed to stamp power-off time");
                }
            }
        }
    }

    async fn delete(&self, server: &Server, reason: &'static str) {
        match self.cloud.delete_server(server).await {
            Ok(()) => {
                info!(server = %server.name, status = server.status.as_str(), reason, "server deleted");
                self.tasks.mailbox.send(Event::ServerDeleted {
                    server: server.name.clone(),
                });
            }
            Err(e) => warn!(server = %server.name, error = %e, "failed to delete server"),
        }
    }
}
