//! SSH bootstrap driver: connects to a freshly created (or rebuilt) server,
//! runs the setup script as root, fetches a fresh registration token, and
//! launches the startup script as the runner user.
//!
//! Host keys are not verified; the server was created seconds ago in a
//! provisioning context and its key is not known anywhere yet. The startup
//! script daemonizes the runner, so returning from here only means the shell
//! command exited; runner liveness is verified asynchronously by scale-down.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::model::{RunnerSpec, Server};
use crate::providers::{Ci, Provision};

const SSH_PORT: u16 = 22;
const SSH_USER: &str = "root";
const RUNNER_USER: &str = "runner";
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Runner-local cache directory exported to the scripts.
const SERVER_CACHE_DIR: &str = "/var/cache/actions-runner";

const DEFAULT_SETUP_SCRIPT: &str = include_str!("../scripts/setup.sh");
const DEFAULT_STARTUP_SCRIPT: &str = include_str!("../scripts/startup.sh");

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("server {0} has no public ipv4 address")]
    MissingAddress(String),

    #[error("failed to load ssh private key {path}")]
    Key {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("ssh not reachable within {0:?}")]
    ConnectTimeout(Duration),

    #[error("ssh public key authentication rejected")]
    AuthRejected,

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("{phase} script exited with status {status}")]
    ScriptFailed { phase: &'static str, status: u32 },

    #[error("{phase} script finished without an exit status")]
    NoExitStatus { phase: &'static str },
}

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshProvisioner {
    ci: Arc<dyn Ci>,
    repository: String,
    runner_group: Option<String>,
    private_key_path: PathBuf,
    ready_timeout: Duration,
}

impl SshProvisioner {
    pub fn new(ci: Arc<dyn Ci>, config: &Config) -> Self {
        Self {
            ci,
            repository: config.github_repository.clone(),
            runner_group: config.runner_group.clone(),
            private_key_path: config.private_key_path(),
            ready_timeout: Duration::from_secs(config.max_server_ready_time),
        }
    }

    async fn connect(
        &self,
        address: IpAddr,
    ) -> Result<client::Handle<AcceptAllHostKeys>, BootstrapError> {
        let keypair =
            russh_keys::load_secret_key(&self.private_key_path, None).map_err(|source| {
                BootstrapError::Key {
                    path: self.private_key_path.clone(),
                    source,
                }
            })?;
        let keypair = Arc::new(keypair);
        let ssh_config = Arc::new(client::Config::default());
        let addr = SocketAddr::new(address, SSH_PORT);

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let attempt = tokio::time::timeout(
                CONNECT_ATTEMPT_TIMEOUT,
                client::connect(ssh_config.clone(), addr, AcceptAllHostKeys),
            )
            .await;

            match attempt {
                Ok(Ok(mut session)) => {
                    if session
                        .authenticate_publickey(SSH_USER, keypair.clone())
                        .await?
                    {
                        return Ok(session);
                    }
                    return Err(BootstrapError::AuthRejected);
                }
                Ok(Err(e)) => debug!(address = %addr, error = %e, "ssh not ready yet"),
                Err(_) => debug!(address = %addr, "ssh connect attempt timed out"),
            }

            if Instant::now() + CONNECT_RETRY_DELAY > deadline {
                return Err(BootstrapError::ConnectTimeout(self.ready_timeout));
            }
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
    }

    fn environment(&self, server: &Server, spec: &RunnerSpec, token: &str) -> Vec<(String, String)> {
        vec![
            ("GITHUB_REPOSITORY".into(), self.repository.clone()),
            ("GITHUB_RUNNER_TOKEN".into(), token.to_string()),
            (
                "GITHUB_RUNNER_GROUP".into(),
                self.runner_group.clone().unwrap_or_default(),
            ),
            ("GITHUB_RUNNER_LABELS".into(), spec.labels.join(",")),
            ("SERVER_TYPE_NAME".into(), spec.server_type.name.clone()),
            (
                "SERVER_LOCATION_NAME".into(),
                spec.location
                    .as_ref()
                    .map(|l| l.name.clone())
                    .unwrap_or_else(|| server.location.clone()),
            ),
            ("CACHE_DIR".into(), SERVER_CACHE_DIR.to_string()),
        ]
    }
}

#[async_trait]
impl Provision for SshProvisioner {
    #[instrument(skip(self, server, spec), fields(server = %server.name, address = ?server.public_ipv4))]
    async fn provision(&self, server: &Server, spec: &RunnerSpec) -> Result<()> {
        let address = server
            .public_ipv4
            .ok_or_else(|| BootstrapError::MissingAddress(server.name.clone()))?;

        let mut session = self.connect(IpAddr::V4(address)).await?;

        let setup = read_script(spec.setup_script.as_deref(), DEFAULT_SETUP_SCRIPT).await?;
        run_script(&mut session, "setup", "bash -s", &setup).await?;
        info!(server = %server.name, "setup script finished");

        // Registration tokens are short-lived; fetch immediately before use.
        let token = self.ci.registration_token().await?;
        let startup = read_script(spec.startup_script.as_deref(), DEFAULT_STARTUP_SCRIPT).await?;
        let command = format!(
            "sudo -u {RUNNER_USER} {} bash -s",
            shell_env(&self.environment(server, spec, &token))
        );
        run_script(&mut session, "startup", &command, &startup).await?;
        info!(server = %server.name, "startup script finished, runner launching");

        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        Ok(())
    }
}

async fn read_script(path: Option<&Path>, fallback: &str) -> Result<Vec<u8>> {
    match path {
        Some(path) => Ok(tokio::fs::read(path).await?),
        None => Ok(fallback.as_bytes().to_vec()),
    }
}

async fn run_script(
    session: &mut client::Handle<AcceptAllHostKeys>,
    phase: &'static str,
    command: &str,
    script: &[u8],
) -> Result<(), BootstrapError> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, command).await?;
    channel.data(script).await?;
    channel.eof().await?;

    let mut status = None;
    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { ref data } => {
                for line in String::from_utf8_lossy(data).lines() {
                    debug!(phase, "{line}");
                }
            }
            ChannelMsg::ExtendedData { ref data, .. } => {
                for line in String::from_utf8_lossy(data).lines() {
                    warn!(phase, "{line}");
                }
            }
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }

    match status {
        Some(0) => Ok(()),
        Some(status) => Err(BootstrapError::ScriptFailed { phase, status }),
        None => Err(BootstrapError::NoExitStatus { phase }),
    }
}

/// `env VAR='value' ...` prefix with single-quote escaping, so the variables
/// survive both the remote shell and `sudo` without requiring `AcceptEnv`.
fn shell_env(environment: &[(String, String)]) -> String {
    let assignments: Vec<String> = environment
        .iter()
        .map(|(key, value)| format!("{key}='{}'", value.replace('\'', r"'\''")))
        .collect();
    format!("env {}", assignments.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_env_quotes_values() {
        let env = vec![
            ("GITHUB_RUNNER_LABELS".to_string(), "self-hosted,type-cx22".to_string()),
            ("GITHUB_RUNNER_GROUP".to_string(), String::new()),
            ("TRICKY".to_string(), "it's".to_string()),
        ];
        let rendered = shell_env(&env);
        assert_eq!(
            rendered,
            r#"env GITHUB_RUNNER_LABELS='self-hosted,type-cx22' GITHUB_RUNNER_GROUP='' TRICKY='it'\''s'"#
        );
    }

    #[test]
    fn default_scripts_are_embedded() {
        assert!(DEFAULT_SETUP_SCRIPT.contains(RUNNER_USER));
        assert!(DEFAULT_STARTUP_SCRIPT.contains("GITHUB_RUNNER_TOKEN"));
    }
}
