//! The scale-up loop: every tick, load queued jobs, decide per job whether a
//! server already exists, a standby can be promoted, a new server fits under
//! the cap, a recyclable server matches, or an eviction frees a slot, then
//! dispatch the per-server tasks to the worker pool.
//!
//! Planning is a pure function of the snapshot, so a tick is deterministic
//! and the selection invariants are testable without IO.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::api_watch::RateGauge;
use crate::config::Config;
use crate::labels::{Catalog, LabelError, SpecResolver};
use crate::model::{Job, JobStatus, Runner, RunnerSpec, Server};
use crate::model::Role;
use crate::names::{ServerName, ServerNamer};
use crate::providers::{load_catalog, Ci, Cloud};
use crate::recycle::{server_matches_spec, PriceTable, RecyclePool};
use crate::tasks::TaskContext;
use crate::workers::{Event, MailboxReceiver, WorkerPool};

/// Outer safety margin on top of the phase timeouts a task enforces itself.
const TASK_GRACE: u64 = 900;

#[derive(Debug)]
pub(crate) enum Action {
    Create {
        name: String,
        spec: RunnerSpec,
    },
    Promote {
        standby: Server,
        name: String,
        spec: RunnerSpec,
    },
    Recycle {
        server: Server,
        name: String,
        spec: RunnerSpec,
    },
    EvictAndCreate {
        victim: Server,
        name: String,
        spec: RunnerSpec,
    },
}

impl Action {
    pub(crate) fn server_name(&self) -> &str {
        match self {
            Action::Create { name, .. }
            | Action::Promote { name, .. }
            | Action::Recycle { name, .. }
            | Action::EvictAndCreate { name, .. } => name,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub actions: Vec<Action>,
    /// Jobs whose labels failed to resolve this tick: `(run_id, job_id, why)`.
    pub rejected: Vec<(u64, u64, String)>,
    /// Jobs skipped because no capacity could be found this tick.
    pub deferred: usize,
}

pub(crate) struct Snapshot<'a> {
    pub jobs: &'a [Job],
    pub servers: &'a [Server],
    pub runners: &'a [Runner],
    /// Servers reported ready through the mailbox but not yet visible in the
    /// cloud listing (eventual consistency between ticks).
    pub recently_ready: &'a HashSet<String>,
}

pub(crate) fn plan(
    config: &Config,
    namer: &ServerNamer,
    resolver: &SpecResolver,
    catalog: &Catalog,
    prices: &PriceTable,
    snapshot: &Snapshot<'_>,
    now: DateTime<Utc>,
) -> Plan {
    let mut taken: HashSet<String> = snapshot
        .servers
        .iter()
        .map(|server| server.name.clone())
        .chain(snapshot.recently_ready.iter().cloned())
        .collect();

    let mut total = taken.len();
    let mut evicted = false;
    let mut pool = RecyclePool::build(snapshot.servers, snapshot.runners, namer);
    let mut caps = LabelCaps::new(config, snapshot, namer);

    let runner_by_name: HashMap<&str, &Runner> = snapshot
        .runners
        .iter()
        .map(|runner| (runner.name.as_str(), runner))
        .collect();

    // Standby servers with an idle online runner can take a job immediately.
    let mut standbys: Vec<&Server> = snapshot
        .servers
        .iter()
        .filter(|server| {
            matches!(namer.parse(&server.name), Some(ServerName::Standby { .. }))
                && runner_by_name
                    .get(server.name.as_str())
                    .is_some_and(|runner| runner.online && !runner.busy)
        })
        .collect();

    let mut run_counts: HashMap<u64, usize> = HashMap::new();
    for server in snapshot.servers {
        if let Some(ServerName::Active { run_id, .. }) = namer.parse(&server.name) {
            *run_counts.entry(run_id).or_default() += 1;
        }
    }

    let mut plan = Plan::default();

    for job in snapshot.jobs {
        if job.status != JobStatus::Queued {
            continue;
        }
        if !config
            .with_label
            .iter()
            .all(|required| job.labels.contains(required))
        {
            continue;
        }

        let name = namer.active(job.run_id, job.id);
        if taken.contains(&name) {
            continue;
        }

        if let Some(cap) = config.max_runners_in_workflow_run {
            if run_counts.get(&job.run_id).copied().unwrap_or(0) >= cap {
                debug!(run_id = job.run_id, cap, "workflow run at its runner cap");
                continue;
            }
        }

        let spec = match resolver.resolve(&job.labels, catalog) {
            Ok(spec) => spec,
            Err(e) => {
                plan.rejected.push((job.run_id, job.id, e.to_string()));
                continue;
            }
        };

        if caps.would_exceed(&spec.labels) {
            plan.deferred += 1;
            continue;
        }

        let action = if let Some(index) = standbys
            .iter()
            .position(|standby| server_matches_spec(standby, &spec))
        {
            let standby = standbys.remove(index);
            Action::Promote {
                standby: standby.clone(),
                name: name.clone(),
                spec,
            }
        } else if total < config.max_runners {
            total += 1;
            Action::Create {
                name: name.clone(),
                spec,
            }
        } else if let Some(server) = pool.take_match(&spec) {
            Action::Recycle {
                server,
                name: name.clone(),
                spec,
            }
        } else if !evicted {
            match pool.take_victim(config.delete_random, prices, now) {
                Some(victim) => {
                    evicted = true;
                    Action::EvictAndCreate {
                        victim,
                        name: name.clone(),
                        spec,
                    }
                }
                None => {
                    plan.deferred += 1;
                    continue;
                }
            }
        } else {
            // At most one eviction per iteration; the job waits a tick.
            plan.deferred += 1;
            continue;
        };

        debug!(
            job = %job.name,
            run_id = job.run_id,
            job_id = job.id,
            server = action.server_name(),
            "job planned"
        );
        caps.commit(&action);
        *run_counts.entry(job.run_id).or_default() += 1;
        taken.insert(name);
        plan.actions.push(action);
    }

    plan
}

/// Per-label-set cap accounting. A server counts toward a rule when its
/// runner labels are a superset of the rule's labels; labels come from the
/// registered runner, from the queued job that names the server, or from an
/// action planned earlier in this tick.
struct LabelCaps {
    rules: Vec<(Vec<String>, usize)>,
    counts: Vec<usize>,
}

impl LabelCaps {
    fn new(config: &Config, snapshot: &Snapshot<'_>, namer: &ServerNamer) -> Self {
        let rules: Vec<(Vec<String>, usize)> = config
            .max_runners_for_label
            .iter()
            .map(|cap| (cap.labels.clone(), cap.max))
            .collect();
        let mut counts = vec![0; rules.len()];

        let runner_by_name: HashMap<&str, &Runner> = snapshot
            .runners
            .iter()
            .map(|runner| (runner.name.as_str(), runner))
            .collect();
        let job_by_identity: HashMap<(u64, u64), &Job> = snapshot
            .jobs
            .iter()
            .map(|job| ((job.run_id, job.id), job))
            .collect();

        for server in snapshot.servers {
            let labels: Option<&[String]> = match runner_by_name.get(server.name.as_str()) {
                Some(runner) => Some(&runner.labels),
                None => match namer.parse(&server.name) {
                    Some(ServerName::Active { run_id, job_id }) => job_by_identity
                        .get(&(run_id, job_id))
                        .map(|job| job.labels.as_slice()),
                    _ => None,
                },
            };
            if let Some(labels) = labels {
                for (index, (rule, _)) in rules.iter().enumerate() {
                    if subset(rule, labels) {
                        counts[index] += 1;
                    }
                }
            }
        }

        Self { rules, counts }
    }

    fn would_exceed(&self, labels: &[String]) -> bool {
        self.rules
            .iter()
            .zip(&self.counts)
            .any(|((rule, max), count)| subset(rule, labels) && count >= max)
    }

    fn commit(&mut self, action: &Action) {
        let labels = match action {
            Action::Create { spec, .. }
            | Action::Promote { spec, .. }
            | Action::Recycle { spec, .. }
            | Action::EvictAndCreate { spec, .. } => &spec.labels,
        };
        for (index, (rule, _)) in self.rules.iter().enumerate() {
            if subset(rule, labels) {
                self.counts[index] += 1;
            }
        }
    }
}

fn subset(rule: &[String], labels: &[String]) -> bool {
    rule.iter().all(|label| labels.contains(label))
}

pub struct ScaleUp {
    config: Config,
    namer: ServerNamer,
    resolver: SpecResolver,
    cloud: Arc<dyn Cloud>,
    ci: Arc<dyn Ci>,
    catalog: Arc<RwLock<Catalog>>,
    gauge: Arc<RateGauge>,
    pool: WorkerPool,
    tasks: TaskContext,
    events: MailboxReceiver,
    recently_ready: HashSet<String>,
    rejected_logged: HashSet<(u64, u64)>,
}

impl ScaleUp {
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
        events: MailboxReceiver,
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
            events,
            recently_ready: HashSet::new(),
            rejected_logged: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.scale_up_interval);
        info!(interval = ?interval, max_runners = self.config.max_runners, "scale-up loop starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "scale-up tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("scale-up loop stopped");
    }

    #[instrument(skip(self))]
    async fn tick(&mut self) -> Result<()> {
        if self.gauge.exhausted() {
            warn!("api rate limit exhausted, skipping scale-up tick");
            return Ok(());
        }

        self.absorb_events();

        let jobs = self.ci.jobs().await?;
        let servers = self.cloud.servers().await?;
        let runners: Vec<Runner> = self
            .ci
            .runners()
            .await?
            .into_iter()
            .filter(|runner| self.namer.owns(&runner.name))
            .collect();

        self.recently_ready
            .retain(|name| !servers.iter().any(|server| &server.name == name));

        let catalog = self.refreshed_catalog(&jobs).await;
        let prices = PriceTable::from_server_types(&catalog.server_types);

        let snapshot = Snapshot {
            jobs: &jobs,
            servers: &servers,
            runners: &runners,
            recently_ready: &self.recently_ready,
        };
        let plan = plan(
            &self.config,
            &self.namer,
            &self.resolver,
            &catalog,
            &prices,
            &snapshot,
            Utc::now(),
        );

        for (run_id, job_id, reason) in &plan.rejected {
            if self.rejected_logged.insert((*run_id, *job_id)) {
                warn!(run_id, job_id, reason, "job rejected, labels do not resolve");
            }
        }
        if !plan.actions.is_empty() || plan.deferred > 0 {
            info!(
                actions = plan.actions.len(),
                deferred = plan.deferred,
                servers = servers.len(),
                "scale-up plan computed"
            );
        }

        let deadline = Duration::from_secs(
            self.config.max_server_ready_time + self.config.max_runner_registration_time
                + TASK_GRACE,
        );
        for action in plan.actions {
            let context = self.tasks.clone();
            let name = action.server_name().to_string();
            let mailbox = context.mailbox.clone();
            let task = async move {
                match action {
                    Action::Create { name, spec } => context.create(name, Role::Active, spec).await,
                    Action::Promote {
                        standby,
                        name,
                        spec,
                    } => context.promote(standby, name, spec).await,
                    Action::Recycle { server, name, spec } => {
                        context.recycle(server, name, spec).await
                    }
                    Action::EvictAndCreate { victim, name, spec } => {
                        context.evict_and_create(victim, name, spec).await
                    }
                }
            };
            self.pool.submit(name, deadline, mailbox, task);
        }

        Ok(())
    }

    fn absorb_events(&mut self) {
        for event in self.events.drain() {
            match &event {
                Event::ServerReady { server } => {
                    debug!(server = %server, "server reported ready");
                    self.recently_ready.insert(server.clone());
                }
                Event::ServerFailed { server, reason } => {
                    warn!(server = %server, reason = %reason, "server task reported failure");
                    self.recently_ready.remove(server);
                }
                Event::ServerDeleted { server } => {
                    self.recently_ready.remove(server);
                }
            }
        }
    }

    /// The catalog may be stale when a job names a type, location or image
    /// the controller has not seen yet; refresh once and retry before the
    /// job is rejected.
    async fn refreshed_catalog(&self, jobs: &[Job]) -> Catalog {
        let catalog = self.catalog.read().await.clone();

        let unresolved = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Queued)
            .any(|job| {
                matches!(
                    self.resolver.resolve(&job.labels, &catalog),
                    Err(LabelError::UnknownServerType(_))
                        | Err(LabelError::UnknownLocation(_))
                        | Err(LabelError::UnknownImage(_))
                )
            });
        if !unresolved {
            return catalog;
        }

        match load_catalog(self.cloud.as_ref()).await {
            Ok(fresh) => {
                *self.catalog.write().await = fresh.clone();
                fresh
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh catalogs");
                catalog
            }
        }
    }
}
