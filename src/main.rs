mod api_watch;
mod bootstrap;
mod config;
#[cfg(test)]
mod fake;
mod github;
mod hetzner;
mod labels;
mod model;
mod names;
mod providers;
mod recycle;
mod scale_down;
mod scale_up;
mod tasks;
mod workers;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api_watch::RateGauge;
use crate::bootstrap::SshProvisioner;
use crate::config::Config;
use crate::github::GithubClient;
use crate::hetzner::HetznerClient;
use crate::labels::SpecResolver;
use crate::model::hash_ssh_key_set;
use crate::names::ServerNamer;
use crate::providers::{ensure_ssh_keys, load_catalog, Ci, Cloud};
use crate::scale_down::ScaleDown;
use crate::scale_up::ScaleUp;
use crate::tasks::TaskContext;
use crate::workers::WorkerPool;

#[tokio::main]
async fn main() -> ExitCode {
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_target(true))
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "controller failed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let config = Config::load().context("invalid configuration")?;
    let namer = ServerNamer::new(&config.server_prefix);

    let github = Arc::new(GithubClient::new(
        &config.github_token,
        &config.github_repository,
        config.http_cache_dir(),
    )?);
    let hetzner = Arc::new(HetznerClient::new(&config.hetzner_token, namer.clone())?);
    let cloud: Arc<dyn Cloud> = hetzner;
    let ci: Arc<dyn Ci> = github;

    let ssh_keys = ensure_ssh_keys(cloud.as_ref(), &config.ssh_key_paths())
        .await
        .context("failed to prepare ssh keys")?;
    let ssh_key_ids: Vec<u64> = ssh_keys.iter().map(|key| key.id).collect();
    let resolver = SpecResolver::new(&config, hash_ssh_key_set(&ssh_keys));

    let catalog = Arc::new(RwLock::new(
        load_catalog(cloud.as_ref())
            .await
            .context("failed to load cloud catalogs")?,
    ));
    info!(
        repository = %config.github_repository,
        prefix = %config.server_prefix,
        max_runners = config.max_runners,
        "controller starting"
    );

    let gauge = Arc::new(RateGauge::default());
    let pool = WorkerPool::new(config.workers);
    let (mailbox_tx, mailbox_rx) = workers::mailbox();
    let (terminate_tx, terminate_rx) = watch::channel(false);

    let provisioner = Arc::new(SshProvisioner::new(ci.clone(), &config));
    let tasks = TaskContext {
        cloud: cloud.clone(),
        provisioner,
        mailbox: mailbox_tx,
        prefix: config.server_prefix.clone(),
        ssh_key_ids,
        ready_timeout: Duration::from_secs(config.max_server_ready_time),
    };

    let scale_up = ScaleUp::new(
        config.clone(),
        namer.clone(),
        resolver.clone(),
        cloud.clone(),
        ci.clone(),
        catalog.clone(),
        gauge.clone(),
        pool.clone(),
        tasks.clone(),
        mailbox_rx,
    );
    let scale_down = ScaleDown::new(
        config.clone(),
        namer,
        resolver,
        cloud,
        ci.clone(),
        catalog,
        gauge.clone(),
        pool.clone(),
        tasks,
    );

    let mut scale_up_task = tokio::spawn(scale_up.run(terminate_rx.clone()));
    let mut scale_down_task = tokio::spawn(scale_down.run(terminate_rx.clone()));
    let mut watch_task = tokio::spawn(api_watch::run(ci, gauge, terminate_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install handler")?;
    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            ExitCode::from(1)
        }
        _ = sigterm.recv() => {
            info!("termination requested, shutting down");
            ExitCode::from(0)
        }
        // The loops only return on shutdown; an early exit is a crash.
        result = &mut scale_up_task => return loop_crashed("scale-up", result),
        result = &mut scale_down_task => return loop_crashed("scale-down", result),
        result = &mut watch_task => return loop_crashed("api-watch", result),
    };

    let _ = terminate_tx.send(true);
    let drained = tokio::time::timeout(Duration::from_secs(config.terminate_timeout), async {
        let _ = futures::future::join_all([scale_up_task, scale_down_task, watch_task]).await;
        pool.drain().await;
    })
    .await;
    if drained.is_err() {
        error!(
            timeout = config.terminate_timeout,
            "shutdown timed out, orphaning remaining tasks"
        );
    } else {
        info!("shutdown complete");
    }

    Ok(code)
}

fn loop_crashed(name: &str, result: Result<(), tokio::task::JoinError>) -> Result<ExitCode> {
    match result {
        Ok(()) => anyhow::bail!("{name} loop exited unexpectedly"),
        Err(e) => anyhow::bail!("{name} loop crashed: {e}"),
    }
}
