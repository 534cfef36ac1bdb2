//! The server name schema: the single join key between the CI provider and
//! the cloud. A server is controller-owned iff its name carries the prefix.

use crate::model::Role;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerName {
    Active { run_id: u64, job_id: u64 },
    Recycle { uid: u64 },
    Standby { group: usize, uid: u64 },
}

impl ServerName {
    pub fn role(&self) -> Role {
        match self {
            ServerName::Active { .. } => Role::Active,
            ServerName::Recycle { .. } => Role::Recycle,
            ServerName::Standby { .. } => Role::Standby,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerNamer {
    prefix: String,
}

impl ServerNamer {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn active(&self, run_id: u64, job_id: u64) -> String {
        format!("{}-{run_id}-{job_id}", self.prefix)
    }

    pub fn recycle(&self, uid: u64) -> String {
        format!("{}-recycle-{uid}", self.prefix)
    }

    pub fn standby(&self, group: usize, uid: u64) -> String {
        format!("{}-standby-g{group}-{uid}", self.prefix)
    }

    pub fn standby_group_prefix(&self, group: usize) -> String {
        format!("{}-standby-g{group}-", self.prefix)
    }

    /// Everything not carrying the prefix is invisible to the controller.
    pub fn owns(&self, name: &str) -> bool {
        name.len() > self.prefix.len() + 1
            && name.starts_with(&self.prefix)
            && name.as_bytes()[self.prefix.len()] == b'-'
    }

    pub fn parse(&self, name: &str) -> Option<ServerName> {
        if !self.owns(name) {
            return None;
        }
        let rest = &name[self.prefix.len() + 1..];

        if let Some(uid) = rest.strip_prefix("recycle-") {
            return uid.parse().ok().map(|uid| ServerName::Recycle { uid });
        }

        if let Some(rest) = rest.strip_prefix("standby-") {
            let (group, uid) = rest.rsplit_once('-')?;
            let group = group.strip_prefix('g')?.parse().ok()?;
            let uid = uid.parse().ok()?;
            return Some(ServerName::Standby { group, uid });
        }

        let (run_id, job_id) = rest.split_once('-')?;
        Some(ServerName::Active {
            run_id: run_id.parse().ok()?,
            job_id: job_id.parse().ok()?,
        })
    }
}
