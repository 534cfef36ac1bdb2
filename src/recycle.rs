//! In-memory index over powered-off recyclable servers, rebuilt from cloud
//! state at the start of each scale-up tick, plus the eviction policy driven
//! by hourly billing granularity.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use tracing::warn;

use crate::model::{
    label_keys, minute_in_hour, Role, Runner, RunnerSpec, Server, ServerStatus, ServerType,
};
use crate::names::{ServerName, ServerNamer};

/// `price_per_hour(server_type, location)`, cached from the server-type
/// catalog at startup and refreshed with it.
#[derive(Clone, Debug, Default)]
pub struct PriceTable {
    hourly: HashMap<(String, String), f64>,
}

impl PriceTable {
    pub fn from_server_types(server_types: &[ServerType]) -> Self {
        let mut hourly = HashMap::new();
        for server_type in server_types {
            for price in &server_type.prices {
                hourly.insert(
                    (server_type.name.clone(), price.location.clone()),
                    price.hourly,
                );
            }
        }
        Self { hourly }
    }

    pub fn hourly(&self, server_type: &str, location: &str) -> Option<f64> {
        self.hourly
            .get(&(server_type.to_string(), location.to_string()))
            .copied()
    }
}

/// Remaining dollar value of the current billing hour on a server.
pub fn unused_budget(server: &Server, prices: &PriceTable, now: DateTime<Utc>) -> f64 {
    let hourly = match prices.hourly(&server.server_type, &server.location) {
        Some(hourly) => hourly,
        None => {
            // No price means no known residual value; such a candidate is the
            // cheapest possible victim.
            warn!(
                server = %server.name,
                server_type = %server.server_type,
                location = %server.location,
                "no price for server type at location"
            );
            return 0.0;
        }
    };

    let minutes_left = 60.0 - minute_in_hour(server.age_seconds(now));
    minutes_left * (hourly / 60.0)
}

#[derive(Debug, Default)]
pub struct RecyclePool {
    candidates: Vec<Server>,
}

impl RecyclePool {
    /// Indexes the powered-off servers carrying the recycle name and tag and
    /// no live runner. A server whose name still shows an online runner at
    /// the CI provider (heartbeat lag, or an ephemeral runner that failed to
    /// deregister after a forced poweroff) is never match- or
    /// eviction-eligible; it stays out of the pool until the registration
    /// clears.
    pub fn build(servers: &[Server], runners: &[Runner], namer: &ServerNamer) -> Self {
        let online: HashSet<&str> = runners
            .iter()
            .filter(|runner| runner.online)
            .map(|runner| runner.name.as_str())
            .collect();

        let candidates = servers
            .iter()
            .filter(|server| {
                server.status == ServerStatus::Off
                    && namer
                        .parse(&server.name)
                        .is_some_and(|name| name.role() == Role::Recycle)
                    && server.label(label_keys::ROLE) == Some("recycle")
                    && !online.contains(server.name.as_str())
            })
            .cloned()
            .collect();
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Removes and returns a candidate strictly matching the spec: equal
    /// server type, image and SSH key set, and equal location when the spec
    /// requests one. A larger server type never matches a smaller request.
    pub fn take_match(&mut self, spec: &RunnerSpec) -> Option<Server> {
        let index = self
            .candidates
            .iter()
            .position(|candidate| server_matches_spec(candidate, spec))?;
        Some(self.candidates.remove(index))
    }

    /// Removes and returns the eviction victim: uniformly random when
    /// `delete_random` is set, otherwise the candidate with the lowest unused
    /// budget, ties broken by oldest creation time.
    pub fn take_victim(
        &mut self,
        delete_random: bool,
        prices: &PriceTable,
        now: DateTime<Utc>,
    ) -> Option<Server> {
        if self.candidates.is_empty() {
            return None;
        }

        let index = if delete_random {
            let indices: Vec<usize> = (0..self.candidates.len()).collect();
            *indices.choose(&mut rand::rng()).unwrap()
        } else {
            let mut best = 0;
            let mut best_budget = f64::INFINITY;
            for (i, candidate) in self.candidates.iter().enumerate() {
                let budget = unused_budget(candidate, prices, now);
                let better = budget < best_budget
                    || (budget == best_budget
                        && candidate.created_at < self.candidates[best].created_at);
                if better {
                    best = i;
                    best_budget = budget;
                }
            }
            best
        };

        Some(self.candidates.remove(index))
    }
}

/// Strict reuse-compatibility: equal server type, image and SSH key set, and
/// equal location when the spec requests one. Also used to decide whether a
/// standby server can serve a job.
pub fn server_matches_spec(candidate: &Server, spec: &RunnerSpec) -> bool {
    if candidate.server_type != spec.server_type.name {
        return false;
    }
    if candidate.image_label() != Some(spec.image.identity().as_str()) {
        return false;
    }
    if candidate.ssh_keys_hash() != Some(spec.ssh_keys_hash.as_str()) {
        return false;
    }
    match &spec.location {
        Some(location) => candidate.location == location.name,
        None => true,
    }
}

/// Next recycle uid: one past the highest uid currently in use, so names
/// preserve creation order across process restarts.
pub fn next_recycle_uid(servers: &[Server], namer: &ServerNamer) -> u64 {
    servers
        .iter()
        .filter_map(|server| match namer.parse(&server.name) {
            Some(ServerName::Recycle { uid }) => Some(uid),
            _ => None,
        })
        .max()
        .map_or(1, |uid| uid + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Arch, CloudLabels, Image, ImageKind, Location, Price};

    fn namer() -> ServerNamer {
        ServerNamer::new("gha")
    }

    fn recyclable(
        uid: u64,
        server_type: &str,
        location: &str,
        image: &str,
        age_seconds: i64,
        now: DateTime<Utc>,
    ) -> Server {
        let mut labels = CloudLabels::new();
        labels.insert(label_keys::ROLE.into(), "recycle".into());
        labels.insert(label_keys::IMAGE.into(), image.into());
        labels.insert(label_keys::SSH_KEYS_HASH.into(), "keys".into());
        Server {
            id: uid,
            name: namer().recycle(uid),
            status: ServerStatus::Off,
            server_type: server_type.into(),
            location: location.into(),
            public_ipv4: None,
            created_at: now - chrono::Duration::seconds(age_seconds),
            labels,
        }
    }

    fn spec(server_type: &str, location: Option<&str>, image_id: u64) -> RunnerSpec {
        RunnerSpec {
            server_type: ServerType {
                id: 0,
                name: server_type.into(),
                architecture: Arch::X86,
                prices: vec![],
            },
            location: location.map(|name| Location {
                id: 0,
                name: name.into(),
            }),
            image: Image {
                id: image_id,
                kind: ImageKind::System,
                architecture: Arch::X86,
                name: Some("ubuntu-22.04".into()),
                description: String::new(),
            },
            setup_script: None,
            startup_script: None,
            labels: vec!["self-hosted".into()],
            ssh_keys_hash: "keys".into(),
        }
    }

    #[test]
    fn pool_only_indexes_powered_off_recycle_servers() {
        let now = Utc::now();
        let mut running = recyclable(1, "cx22", "fsn1", "42", 100, now);
        running.status = ServerStatus::Running;
        let mut active = recyclable(2, "cx22", "fsn1", "42", 100, now);
        active.name = namer().active(1, 2);

        let off = recyclable(3, "cx22", "fsn1", "42", 100, now);
        let pool = RecyclePool::build(&[running, active, off], &[], &namer());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn strict_match_on_type_image_keys_and_location() {
        let now = Utc::now();
        let servers = vec![recyclable(1, "cx22", "fsn1", "42", 100, now)];

        // Exact match, location unspecified.
        let mut pool = RecyclePool::build(&servers, &[], &namer());
        assert!(pool.take_match(&spec("cx22", None, 42)).is_some());

        // A larger type never serves a smaller request.
        let mut pool = RecyclePool::build(&servers, &[], &namer());
        assert!(pool.take_match(&spec("cx11", None, 42)).is_none());

        // Image must be identical.
        let mut pool = RecyclePool::build(&servers, &[], &namer());
        assert!(pool.take_match(&spec("cx22", None, 43)).is_none());

        // Requested location must be equal.
        let mut pool = RecyclePool::build(&servers, &[], &namer());
        assert!(pool.take_match(&spec("cx22", Some("hel1"), 42)).is_none());
        let mut pool = RecyclePool::build(&servers, &[], &namer());
        assert!(pool.take_match(&spec("cx22", Some("fsn1"), 42)).is_some());
    }

    #[test]
    fn candidates_with_a_live_runner_are_excluded() {
        let now = Utc::now();
        // Off at the cloud, but the runner registration still shows online
        // (heartbeat lag after a forced poweroff).
        let server = recyclable(1, "cx22", "fsn1", "42", 100, now);
        let runner = Runner {
            id: 1,
            name: server.name.clone(),
            online: true,
            busy: false,
            labels: vec!["self-hosted".into()],
        };

        let mut pool = RecyclePool::build(&[server.clone()], &[runner.clone()], &namer());
        assert!(pool.is_empty());
        assert!(pool.take_match(&spec("cx22", None, 42)).is_none());
        assert!(pool
            .take_victim(false, &PriceTable::default(), now)
            .is_none());

        // Once the registration drops offline the server is reusable again.
        let mut offline = runner;
        offline.online = false;
        let mut pool = RecyclePool::build(&[server], &[offline], &namer());
        assert_eq!(pool.len(), 1);
        assert!(pool.take_match(&spec("cx22", None, 42)).is_some());
    }

    #[test]
    fn mismatched_ssh_key_set_never_matches() {
        let now = Utc::now();
        let mut server = recyclable(1, "cx22", "fsn1", "42", 100, now);
        server
            .labels
            .insert(label_keys::SSH_KEYS_HASH.into(), "other".into());
        let mut pool = RecyclePool::build(&[server], &[], &namer());
        assert!(pool.take_match(&spec("cx22", None, 42)).is_none());
    }

    #[test]
    fn eviction_picks_lowest_unused_budget() {
        let now = Utc::now();
        // R1: cpx21, 20 min into the hour, $0.012/h -> $0.008 left.
        // R2: cx22, 40 min into the hour, $0.006/h -> $0.002 left.
        let r1 = recyclable(1, "cpx21", "fsn1", "42", 20 * 60, now);
        let r2 = recyclable(2, "cx22", "fsn1", "42", 40 * 60, now);

        let prices = PriceTable::from_server_types(&[
            ServerType {
                id: 1,
                name: "cpx21".into(),
                architecture: Arch::X86,
                prices: vec![Price {
                    location: "fsn1".into(),
                    hourly: 0.012,
                }],
            },
            ServerType {
                id: 2,
                name: "cx22".into(),
                architecture: Arch::X86,
                prices: vec![Price {
                    location: "fsn1".into(),
                    hourly: 0.006,
                }],
            },
        ]);

        assert!((unused_budget(&r1, &prices, now) - 0.008).abs() < 1e-9);
        assert!((unused_budget(&r2, &prices, now) - 0.002).abs() < 1e-9);

        let mut pool = RecyclePool::build(&[r1, r2], &[], &namer());
        let victim = pool.take_victim(false, &prices, now).unwrap();
        assert_eq!(victim.name, "gha-recycle-2");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn eviction_ties_break_by_oldest() {
        let now = Utc::now();
        // Same type, same minute-in-hour (one full billing hour apart).
        let young = recyclable(1, "cx22", "fsn1", "42", 10 * 60, now);
        let old = recyclable(2, "cx22", "fsn1", "42", 3600 + 10 * 60, now);
        let prices = PriceTable::from_server_types(&[ServerType {
            id: 2,
            name: "cx22".into(),
            architecture: Arch::X86,
            prices: vec![Price {
                location: "fsn1".into(),
                hourly: 0.006,
            }],
        }]);

        let mut pool = RecyclePool::build(&[young, old], &[], &namer());
        let victim = pool.take_victim(false, &prices, now).unwrap();
        assert_eq!(victim.name, "gha-recycle-2");
    }

    #[test]
    fn unpriced_candidates_are_free_to_evict() {
        let now = Utc::now();
        let server = recyclable(1, "cx22", "nowhere", "42", 0, now);
        assert_eq!(unused_budget(&server, &PriceTable::default(), now), 0.0);
    }

    #[test]
    fn recycle_uids_preserve_creation_order() {
        let now = Utc::now();
        let namer = namer();
        assert_eq!(next_recycle_uid(&[], &namer), 1);

        let mut standby = recyclable(2, "cx22", "fsn1", "42", 0, now);
        standby.name = namer.standby(0, 9);

        let servers = vec![
            recyclable(3, "cx22", "fsn1", "42", 0, now),
            recyclable(7, "cx22", "fsn1", "42", 0, now),
            standby,
        ];
        assert_eq!(next_recycle_uid(&servers, &namer), 8);
    }
}
