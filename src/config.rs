//! Controller configuration: a YAML file under the top-level `config` key,
//! merged with environment-variable fallbacks for the credentials, validated
//! once at startup and immutable for the process lifetime.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github_token: String,
    #[serde(default)]
    pub github_repository: String,
    #[serde(default)]
    pub hetzner_token: String,

    #[serde(default = "defaults::ssh_key")]
    pub ssh_key: PathBuf,
    #[serde(default)]
    pub additional_ssh_keys: Vec<PathBuf>,

    #[serde(default = "defaults::with_label")]
    pub with_label: Vec<String>,
    #[serde(default)]
    pub label_prefix: String,
    #[serde(default)]
    pub meta_label: HashMap<String, Vec<String>>,

    #[serde(default = "defaults::enabled")]
    pub recycle: bool,
    #[serde(default = "defaults::end_of_life")]
    pub end_of_life: u32,
    #[serde(default)]
    pub delete_random: bool,

    #[serde(default = "defaults::max_runners")]
    pub max_runners: usize,
    #[serde(default)]
    pub max_runners_for_label: Vec<LabelCap>,
    #[serde(default)]
    pub max_runners_in_workflow_run: Option<usize>,

    #[serde(default = "defaults::image")]
    pub default_image: String,
    #[serde(default = "defaults::server_type")]
    pub default_server_type: String,
    #[serde(default)]
    pub default_location: Option<String>,

    #[serde(default = "defaults::workers")]
    pub workers: usize,
    #[serde(default)]
    pub scripts: Option<PathBuf>,

    #[serde(default = "defaults::max_powered_off_time")]
    pub max_powered_off_time: u64,
    #[serde(default = "defaults::max_unused_runner_time")]
    pub max_unused_runner_time: u64,
    #[serde(default = "defaults::max_runner_registration_time")]
    pub max_runner_registration_time: u64,
    #[serde(default = "defaults::max_server_ready_time")]
    pub max_server_ready_time: u64,

    #[serde(default = "defaults::tick_interval")]
    pub scale_up_interval: u64,
    #[serde(default = "defaults::tick_interval")]
    pub scale_down_interval: u64,

    #[serde(default)]
    pub standby_runners: Vec<StandbyGroup>,

    #[serde(default = "defaults::server_prefix")]
    pub server_prefix: String,
    #[serde(default)]
    pub runner_group: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "defaults::terminate_timeout")]
    pub terminate_timeout: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LabelCap {
    pub labels: Vec<String>,
    pub max: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StandbyGroup {
    pub labels: Vec<String>,
    pub count: usize,
    #[serde(default)]
    pub replenish_immediately: bool,
}

mod defaults {
    use std::path::PathBuf;

    pub fn ssh_key() -> PathBuf {
        PathBuf::from("~/.ssh/id_rsa.pub")
    }

    pub fn with_label() -> Vec<String> {
        vec!["self-hosted".to_string()]
    }

    pub fn enabled() -> bool {
        true
    }

    pub fn end_of_life() -> u32 {
        50
    }

    pub fn max_runners() -> usize {
        10
    }

    pub fn image() -> String {
        "x86:system:ubuntu-22.04".to_string()
    }

    pub fn server_type() -> String {
        "cx22".to_string()
    }

    pub fn workers() -> usize {
        10
    }

    pub fn max_powered_off_time() -> u64 {
        60
    }

    pub fn max_unused_runner_time() -> u64 {
        120
    }

    pub fn max_runner_registration_time() -> u64 {
        120
    }

    pub fn max_server_ready_time() -> u64 {
        120
    }

    pub fn tick_interval() -> u64 {
        15
    }

    pub fn server_prefix() -> String {
        "gha".to_string()
    }

    pub fn terminate_timeout() -> u64 {
        60
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    File(#[from] config::ConfigError),

    #[error("{0} missing: set it in the config file or the {1} environment variable")]
    MissingCredential(&'static str, &'static str),

    #[error("github_repository must be owner/name, got {0:?}")]
    InvalidRepository(String),

    #[error("end_of_life must be between 1 and 59 minutes, got {0}")]
    InvalidEndOfLife(u32),

    #[error("server_prefix must be lowercase alphanumeric (dashes allowed inside), got {0:?}")]
    InvalidPrefix(String),

    #[error("workers must be at least 1")]
    NoWorkers,

    #[error("ssh key not found: {0}")]
    MissingSshKey(PathBuf),

    #[error("ssh private key not found next to {0} (expected the path without .pub)")]
    MissingPrivateKey(PathBuf),

    #[error("scripts directory not found: {0}")]
    MissingScriptsDir(PathBuf),
}

impl Config {
    /// Loads `config.{yaml,...}` from the working directory, applies the
    /// environment fallbacks and validates.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config"))
            .build()?;

        let mut cfg: Config = settings.get("config")?;
        cfg.apply_env_fallbacks();
        cfg.expand_home();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_fallbacks(&mut self) {
        let fill = |slot: &mut String, var: &str| {
            if slot.is_empty() {
                if let Ok(value) = std::env::var(var) {
                    *slot = value;
                }
            }
        };
        fill(&mut self.github_token, "GITHUB_TOKEN");
        fill(&mut self.github_repository, "GITHUB_REPOSITORY");
        fill(&mut self.hetzner_token, "HETZNER_TOKEN");
    }

    fn expand_home(&mut self) {
        self.ssh_key = expand_tilde(&self.ssh_key);
        for key in &mut self.additional_ssh_keys {
            *key = expand_tilde(key);
        }
        if let Some(scripts) = &self.scripts {
            self.scripts = Some(expand_tilde(scripts));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.github_token.is_empty() {
            return Err(ConfigError::MissingCredential(
                "github_token",
                "GITHUB_TOKEN",
            ));
        }
        if self.hetzner_token.is_empty() {
            return Err(ConfigError::MissingCredential(
                "hetzner_token",
                "HETZNER_TOKEN",
            ));
        }
        if self.github_repository.is_empty() {
            return Err(ConfigError::MissingCredential(
                "github_repository",
                "GITHUB_REPOSITORY",
            ));
        }
        match self.github_repository.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            }
            _ => {
                return Err(ConfigError::InvalidRepository(
                    self.github_repository.clone(),
                ));
            }
        }

        if !(1..=59).contains(&self.end_of_life) {
            return Err(ConfigError::InvalidEndOfLife(self.end_of_life));
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let prefix_ok = !self.server_prefix.is_empty()
            && self
                .server_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.server_prefix.starts_with('-')
            && !self.server_prefix.ends_with('-');
        if !prefix_ok {
            return Err(ConfigError::InvalidPrefix(self.server_prefix.clone()));
        }

        for key in self.ssh_key_paths() {
            if !key.is_file() {
                return Err(ConfigError::MissingSshKey(key));
            }
        }
        if !self.private_key_path().is_file() {
            return Err(ConfigError::MissingPrivateKey(self.ssh_key.clone()));
        }

        if let Some(scripts) = &self.scripts {
            if !scripts.is_dir() {
                return Err(ConfigError::MissingScriptsDir(scripts.clone()));
            }
        }

        Ok(())
    }

    /// The configured public key plus any additional ones, in order.
    pub fn ssh_key_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.ssh_key.clone()];
        paths.extend(self.additional_ssh_keys.iter().cloned());
        paths
    }

    /// The private half of `ssh_key`, used for the bootstrap SSH session.
    pub fn private_key_path(&self) -> PathBuf {
        match self.ssh_key.extension() {
            Some(ext) if ext == "pub" => self.ssh_key.with_extension(""),
            _ => self.ssh_key.clone(),
        }
    }

    pub fn http_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("github-actions-hetzner"))
    }

    /// A valid configuration with test credentials and no filesystem
    /// dependencies; scenario tests tweak individual fields.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "config:\n  github_token: test-token\n  github_repository: acme/widgets\n  hetzner_token: test-token\n",
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap();
        settings.get("config").unwrap()
    }
}

fn expand_tilde(path: &std::path::Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(stripped),
        None => path.to_path_buf(),
    }
}
