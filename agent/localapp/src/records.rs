//! Records shared through the state store and the keys they live under.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::platform;
use crate::store::{self, StateStore, StoreResult};

pub const LOCK_PREFIX: &str = "lock/";
pub const INSTALLATION_PREFIX: &str = "installation/";
pub const INSTANCE_PREFIX: &str = "config/";

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

pub fn installation_key(host_id: &str) -> String {
    format!("{INSTALLATION_PREFIX}{host_id}")
}

pub fn instance_key(host_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{host_id}")
}

/// Claim on a lease. `owner_pid` is absent for session-owned leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub owner_token: String,
    /// Wall-clock milliseconds since the Unix epoch.
    pub deadline: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
}

impl LockRecord {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.deadline > now_ms && self.owner_pid.map_or(true, platform::is_pid_alive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationRecord {
    pub binary_path: PathBuf,
    /// Opaque validator from the download endpoint (its `ETag`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_tag: Option<String>,
}

/// A helper process believed to be running for one remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningInstance {
    pub host_id: String,
    pub control_file: PathBuf,
    pub rpc_port: u16,
    pub pid: u32,
    pub log_path: PathBuf,
}

impl RunningInstance {
    pub fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.rpc_port)
    }

    pub fn is_alive(&self) -> bool {
        platform::is_pid_alive(self.pid)
    }
}

/// Drop the stored instance for `host_id`, terminating its process first.
///
/// Must be called while holding the host's lease. Failing to terminate is
/// only logged; a leftover process is detected as stale later.
pub async fn discard_instance(
    store: &dyn StateStore,
    host_id: &str,
) -> StoreResult<Option<RunningInstance>> {
    let key = instance_key(host_id);
    let Some(instance) = store::load::<RunningInstance>(store, &key).await? else {
        return Ok(None);
    };

    if instance.is_alive() {
        match platform::terminate(instance.pid) {
            Ok(()) => info!(host = host_id, pid = instance.pid, "terminated helper process"),
            Err(err) => warn!(
                host = host_id,
                pid = instance.pid,
                error = %err,
                "failed to terminate helper process"
            ),
        }
    }

    store::remove(store, &key).await?;
    Ok(Some(instance))
}
