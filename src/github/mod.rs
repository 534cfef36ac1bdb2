//! Typed wrapper over the GitHub Actions REST API: workflow runs and jobs,
//! self-hosted runners, registration tokens and rate-limit state.
//!
//! Listing endpoints go through conditional GETs backed by [`cache`], so the
//! 15-second polling loops mostly spend `304 Not Modified` responses, which
//! do not count against the API rate limit.

mod cache;

use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::model::{Job, JobStatus, RateLimit, Runner};

use cache::HttpCache;

const API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("failed to build github http client")]
    Build(#[source] reqwest::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("github api returned {status} for {url}: {message}")]
    Api {
        status: u16,
        url: String,
        message: String,
    },

    #[error("failed to decode github response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to initialize http cache")]
    Cache(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct GithubClient {
    http: reqwest::Client,
    repository: String,
    cache: HttpCache,
}

impl GithubClient {
    pub fn new(token: &str, repository: &str, cache_dir: PathBuf) -> Result<Self, GithubError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GithubError::Api {
                status: 0,
                url: API_BASE.to_string(),
                message: "github token contains invalid header characters".into(),
            })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("github-actions-hetzner"),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(GithubError::Build)?;

        let cache = HttpCache::new(cache_dir, vec!["api.github.com".into()])?;

        Ok(Self {
            http,
            repository: repository.to_string(),
            cache,
        })
    }

    /// Jobs of all currently queued and in-progress workflow runs,
    /// newest run first.
    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn jobs(&self) -> Result<Vec<Job>, GithubError> {
        let mut jobs = Vec::new();
        for run_status in ["queued", "in_progress"] {
            for run in self.runs(run_status).await? {
                let run_jobs: Vec<JobWire> = self
                    .paginated(
                        |page| {
                            format!(
                                "{API_BASE}/repos/{}/actions/runs/{}/jobs?per_page={PER_PAGE}&page={page}",
                                self.repository, run.id
                            )
                        },
                        |body: JobsPage| body.jobs,
                    )
                    .await?;
                jobs.extend(run_jobs.into_iter().filter_map(job_from_wire));
            }
        }
        Ok(jobs)
    }

    async fn runs(&self, status: &str) -> Result<Vec<RunWire>, GithubError> {
        self.paginated(
            |page| {
                format!(
                    "{API_BASE}/repos/{}/actions/runs?status={status}&per_page={PER_PAGE}&page={page}",
                    self.repository
                )
            },
            |body: RunsPage| body.workflow_runs,
        )
        .await
    }

    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn runners(&self) -> Result<Vec<Runner>, GithubError> {
        let wires: Vec<RunnerWire> = self
            .paginated(
                |page| {
                    format!(
                        "{API_BASE}/repos/{}/actions/runners?per_page={PER_PAGE}&page={page}",
                        self.repository
                    )
                },
                |body: RunnersPage| body.runners,
            )
            .await?;
        Ok(wires.into_iter().map(runner_from_wire).collect())
    }

    /// Registration tokens are short-lived; callers fetch one immediately
    /// before handing it to the startup script.
    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn registration_token(&self) -> Result<String, GithubError> {
        let url = format!(
            "{API_BASE}/repos/{}/actions/runners/registration-token",
            self.repository
        );
        let response = self.http.post(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GithubError::Api {
                status: status.as_u16(),
                url,
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body = response.text().await?;
        let token: RegistrationTokenWire =
            serde_json::from_str(&body).map_err(|source| GithubError::Decode { url, source })?;
        Ok(token.token)
    }

    #[instrument(skip(self, runner), fields(repository = %self.repository, runner = %runner.name))]
    pub async fn remove_runner(&self, runner: &Runner) -> Result<(), GithubError> {
        let url = format!(
            "{API_BASE}/repos/{}/actions/runners/{}",
            self.repository, runner.id
        );
        let response = self.http.delete(&url).send().await?;
        let status = response.status();
        // Already gone is as good as removed.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(GithubError::Api {
                status: status.as_u16(),
                url,
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rate_limit(&self) -> Result<RateLimit, GithubError> {
        let body: RateLimitWire = self.get_json(format!("{API_BASE}/rate_limit")).await?;
        let core = body.resources.core;
        Ok(RateLimit {
            limit: core.limit,
            used: core.used,
            remaining: core.remaining,
            reset: Utc
                .timestamp_opt(core.reset, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    async fn paginated<P, T, U, E>(&self, url_for: U, extract: E) -> Result<Vec<T>, GithubError>
    where
        P: DeserializeOwned,
        U: Fn(usize) -> String,
        E: Fn(P) -> Vec<T>,
    {
        let mut items = Vec::new();
        for page in 1.. {
            let body: P = self.get_json(url_for(page)).await?;
            let page_items = extract(body);
            let last = page_items.len() < PER_PAGE;
            items.extend(page_items);
            if last {
                break;
            }
        }
        Ok(items)
    }

    /// GET with ETag revalidation. A 304 re-serves the cached body.
    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, GithubError> {
        let cached = self.cache.load(&url);

        let mut request = self.http.get(&url);
        if let Some(entry) = &cached {
            request = request.header(IF_NONE_MATCH, entry.etag.clone());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                return serde_json::from_str(&entry.body)
                    .map_err(|source| GithubError::Decode { url, source });
            }
        }

        if !status.is_success() {
            return Err(GithubError::Api {
                status: status.as_u16(),
                url,
                message: response.text().await.unwrap_or_default(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        if let Some(etag) = etag {
            self.cache.store(&url, &etag, &body);
        }

        serde_json::from_str(&body).map_err(|source| GithubError::Decode { url, source })
    }
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    workflow_runs: Vec<RunWire>,
}

#[derive(Debug, Deserialize)]
struct RunWire {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<JobWire>,
}

#[derive(Debug, Deserialize)]
struct JobWire {
    id: u64,
    run_id: u64,
    name: String,
    status: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RunnersPage {
    runners: Vec<RunnerWire>,
}

#[derive(Debug, Deserialize)]
struct RunnerWire {
    id: u64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<RunnerLabelWire>,
}

#[derive(Debug, Deserialize)]
struct RunnerLabelWire {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationTokenWire {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitWire {
    resources: RateLimitResourcesWire,
}

#[derive(Debug, Deserialize)]
struct RateLimitResourcesWire {
    core: RateLimitCoreWire,
}

#[derive(Debug, Deserialize)]
struct RateLimitCoreWire {
    limit: u64,
    used: u64,
    remaining: u64,
    reset: i64,
}

fn job_from_wire(wire: JobWire) -> Option<Job> {
    let status = match wire.status.as_str() {
        "queued" => JobStatus::Queued,
        "in_progress" => JobStatus::InProgress,
        "completed" => JobStatus::Completed,
        // waiting/pending jobs are gated on environments or concurrency and
        // must not get a server yet.
        _ => return None,
    };
    Some(Job {
        id: wire.id,
        run_id: wire.run_id,
        name: wire.name,
        status,
        labels: wire.labels,
    })
}

fn runner_from_wire(wire: RunnerWire) -> Runner {
    Runner {
        id: wire.id,
        online: wire.status == "online",
        busy: wire.busy,
        name: wire.name,
        labels: wire.labels.into_iter().map(|label| label.name).collect(),
    }
}
