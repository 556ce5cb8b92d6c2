/// Service definitions and operational defaults
///
/// Based on the deployment's docker-compose.yml: two stacks (chat, forum),
/// each with an application container, a PostgreSQL database, a Redis cache
/// and a background worker.

use std::fmt;
use std::str::FromStr;

/// One deployable stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    Chat,
    Forum,
}

/// Static description of a service stack
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub app_container: &'static str,
    pub db_container: &'static str,
    pub cache_container: &'static str,
    pub worker_container: &'static str,
    pub db_name: &'static str,
    pub db_role: &'static str,
    /// Data directory, relative to the deploy root
    pub data_dir: &'static str,
    /// Plaintext application log, relative to the deploy root (may not exist)
    pub log_file: &'static str,
    /// Primary HTTP endpoint used for liveness checks
    pub endpoint: &'static str,
    pub expected_status: u16,
}

const CHAT: ServiceSpec = ServiceSpec {
    name: "chat",
    display_name: "Chat (federated messaging)",
    app_container: "chat-app",
    db_container: "chat-db",
    cache_container: "chat-cache",
    worker_container: "chat-worker",
    db_name: "chat",
    db_role: "chat",
    data_dir: "data/chat",
    log_file: "data/chat/chat.log",
    endpoint: "http://127.0.0.1:8008/health",
    expected_status: 200,
};

const FORUM: ServiceSpec = ServiceSpec {
    name: "forum",
    display_name: "Forum (federated link aggregator)",
    app_container: "forum-app",
    db_container: "forum-db",
    cache_container: "forum-cache",
    worker_container: "forum-worker",
    db_name: "forum",
    db_role: "forum",
    data_dir: "data/forum",
    log_file: "data/forum/forum.log",
    endpoint: "http://127.0.0.1:8080/api/v3/site",
    expected_status: 200,
};

impl ServiceKind {
    pub fn all() -> [ServiceKind; 2] {
        [ServiceKind::Chat, ServiceKind::Forum]
    }

    pub fn spec(&self) -> &'static ServiceSpec {
        match self {
            ServiceKind::Chat => &CHAT,
            ServiceKind::Forum => &FORUM,
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    /// Every container belonging to this stack, database first
    pub fn components(&self) -> [&'static str; 4] {
        let spec = self.spec();
        [
            spec.db_container,
            spec.cache_container,
            spec.worker_container,
            spec.app_container,
        ]
    }

    /// Containers other than the database, in start order
    pub fn non_db_components(&self) -> [&'static str; 3] {
        let spec = self.spec();
        [spec.cache_container, spec.worker_container, spec.app_container]
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ServiceKind::Chat),
            "forum" => Ok(ServiceKind::Forum),
            other => Err(format!("unknown service '{}' (expected chat or forum)", other)),
        }
    }
}

/// Reverse proxy container, shared by both stacks (perimeter check only)
pub const PROXY_CONTAINER: &str = "proxy";

/// Intrusion-prevention unit probed via systemctl (perimeter check only)
pub const FAIL2BAN_UNIT: &str = "fail2ban";

/// Credentials generated per service bundle
pub const BUNDLE_CREDENTIALS: &[&str] = &["db_password", "signing_key"];

/// Default artifact retention in days
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Default resource thresholds (percent / load factor per core)
pub const DEFAULT_DISK_WARN_PCT: f64 = 80.0;
pub const DEFAULT_DISK_CRIT_PCT: f64 = 90.0;
pub const DEFAULT_MEM_WARN_PCT: f64 = 85.0;
pub const DEFAULT_MEM_CRIT_PCT: f64 = 95.0;
pub const DEFAULT_LOAD_WARN_FACTOR: f64 = 1.5;
pub const DEFAULT_LOAD_CRIT_FACTOR: f64 = 2.0;

/// Bounded polling defaults for a freshly started database
pub const DEFAULT_DB_READY_ATTEMPTS: u32 = 30;
pub const DEFAULT_DB_READY_INTERVAL_SECS: u64 = 2;

/// Bounded polling defaults for post-restore liveness
pub const DEFAULT_LIVENESS_ATTEMPTS: u32 = 15;
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 2;

/// Default timeout for health checks, seconds
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_parse() {
        assert_eq!("chat".parse::<ServiceKind>().unwrap(), ServiceKind::Chat);
        assert_eq!("forum".parse::<ServiceKind>().unwrap(), ServiceKind::Forum);
        assert!("mail".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_components_database_first() {
        let components = ServiceKind::Chat.components();
        assert_eq!(components[0], "chat-db");
        assert_eq!(components.len(), 4);
    }
}
