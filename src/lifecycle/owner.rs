//! Claim owner identity and liveness.

use std::sync::Mutex;

use sysinfo::{Pid, System};

/// Identity embedded in `Claimed/<owner>/`, rendered `<name>@<host>+<pid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId {
    name: String,
    host: String,
    pid: u32,
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

impl OwnerId {
    pub fn new(name: &str, host: &str, pid: u32) -> Self {
        Self {
            name: sanitize_component(name),
            host: sanitize_component(host),
            pid,
        }
    }

    /// Identity of the current process.
    pub fn local(name: &str) -> Self {
        let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
        Self::new(name, &host, std::process::id())
    }

    /// Parse a claim folder name.
    pub fn parse(raw: &str) -> Option<Self> {
        let (rest, pid) = raw.rsplit_once('+')?;
        let pid = pid.parse().ok()?;
        let (name, host) = rest.split_once('@')?;
        if name.is_empty() || host.is_empty() {
            return None;
        }
        let owner = Self::new(name, host, pid);
        // Reject names that only parse after sanitising.
        (owner.name == name && owner.host == host).then_some(owner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Same logical owner across restarts: name and host match, pid may not.
    pub fn same_identity(&self, other: &OwnerId) -> bool {
        self.name == other.name && self.host == other.host
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}+{}", self.name, self.host, self.pid)
    }
}

/// Whether a claim owner is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// Cannot be checked from here, e.g. another host sharing the vault.
    Unknown,
}

/// Answers liveness questions about claim owners.
pub trait OwnerProbe: Send + Sync {
    fn liveness(&self, owner: &OwnerId) -> Liveness;
}

/// Process-table probe for owners on this host.
pub struct SystemProbe {
    host: String,
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
        Self {
            host: sanitize_component(&host),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerProbe for SystemProbe {
    fn liveness(&self, owner: &OwnerId) -> Liveness {
        if owner.host() != self.host {
            return Liveness::Unknown;
        }
        if owner.pid() == std::process::id() {
            return Liveness::Alive;
        }
        let Ok(mut system) = self.system.lock() else {
            return Liveness::Unknown;
        };
        if system.refresh_process(Pid::from_u32(owner.pid())) {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let owner = OwnerId::new("orch", "box-1.local", 4242);
        assert_eq!(owner.to_string(), "orch@box-1.local+4242");
        assert_eq!(OwnerId::parse("orch@box-1.local+4242"), Some(owner));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(OwnerId::parse("orch"), None);
        assert_eq!(OwnerId::parse("orch@host"), None);
        assert_eq!(OwnerId::parse("orch@host+abc"), None);
        assert_eq!(OwnerId::parse("@host+1"), None);
        assert_eq!(OwnerId::parse("or ch@host+1"), None);
    }

    #[test]
    fn components_are_sanitised() {
        let owner = OwnerId::new("my orch/1", "host@x", 1);
        assert_eq!(owner.to_string(), "my-orch-1@host-x+1");
    }

    #[test]
    fn identity_ignores_pid() {
        let before = OwnerId::new("orch", "h", 100);
        let after = OwnerId::new("orch", "h", 200);
        let other = OwnerId::new("orch", "h2", 100);
        assert!(before.same_identity(&after));
        assert!(!before.same_identity(&other));
        assert_ne!(before, after);
    }

    #[test]
    fn system_probe_sees_this_process() {
        let probe = SystemProbe::new();
        let me = OwnerId::local("test");
        assert_eq!(probe.liveness(&me), Liveness::Alive);

        let elsewhere = OwnerId::new("test", "some-other-host-zz", 1);
        assert_eq!(probe.liveness(&elsewhere), Liveness::Unknown);
    }
}
