//! Service configuration read from `DEPFLOW_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::git::CommitIdentity;
use crate::updater::UpdaterConfig;
use crate::worker::poll::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_LISTEN_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 3000);
const DEFAULT_REMINDER_DELAY_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of the durable key/value store.
    pub state_dir: PathBuf,
    /// Local clone of the VMR.
    pub vmr_path: PathBuf,
    /// Scratch clones of product repositories.
    pub clones_dir: PathBuf,
    pub github_token: Option<String>,
    pub listen_addr: SocketAddr,
    pub reminder_poll_interval: Duration,
    pub updater: UpdaterConfig,
    pub commit_identity: CommitIdentity,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            state_dir: PathBuf::from("./state"),
            vmr_path: PathBuf::from("./vmr"),
            clones_dir: PathBuf::from("./clones"),
            github_token: None,
            listen_addr: DEFAULT_LISTEN_ADDR,
            reminder_poll_interval: DEFAULT_POLL_INTERVAL,
            updater: UpdaterConfig::default(),
            commit_identity: CommitIdentity::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `lookup`. Unset, empty or unparseable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let secs = |name: &str| var(name).and_then(|s| s.trim().parse::<u64>().ok());
        let defaults = Self::default();

        let reminder_delay = secs("DEPFLOW_REMINDER_DELAY_SECS").unwrap_or(DEFAULT_REMINDER_DELAY_SECS);
        let identity = CommitIdentity {
            name: var("DEPFLOW_COMMIT_NAME").unwrap_or(defaults.commit_identity.name),
            email: var("DEPFLOW_COMMIT_EMAIL").unwrap_or(defaults.commit_identity.email),
        };

        ServiceConfig {
            state_dir: var("DEPFLOW_STATE_DIR").map(PathBuf::from).unwrap_or(defaults.state_dir),
            vmr_path: var("DEPFLOW_VMR_PATH").map(PathBuf::from).unwrap_or(defaults.vmr_path),
            clones_dir: var("DEPFLOW_CLONES_DIR").map(PathBuf::from).unwrap_or(defaults.clones_dir),
            github_token: var("DEPFLOW_GITHUB_TOKEN"),
            listen_addr: var("DEPFLOW_LISTEN_ADDR")
                .and_then(|a| a.trim().parse().ok())
                .unwrap_or(defaults.listen_addr),
            reminder_poll_interval: secs("DEPFLOW_REMINDER_POLL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reminder_poll_interval),
            updater: UpdaterConfig {
                default_reminder_delay: chrono::Duration::seconds(reminder_delay as i64),
            },
            commit_identity: identity,
        }
    }
}
