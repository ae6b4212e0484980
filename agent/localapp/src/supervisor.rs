//! Launches the helper as a detached process and records where to reach it.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use localapp_config::SupervisorConfig;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LocalAppError, Result};
use crate::host::RemoteHost;
use crate::platform;
use crate::records::{instance_key, InstallationRecord, RunningInstance};
use crate::store::{self, StateStore};

pub const ENV_HOST: &str = "LCA_HOST";
pub const ENV_SSH_CONFIG: &str = "LCA_SSH_CONFIG";
pub const ENV_API_PORT: &str = "LCA_API_PORT";
pub const ENV_AUTO_TUNNEL: &str = "LCA_AUTO_TUNNEL";
pub const ENV_AUTH_REDIRECT_URL: &str = "LCA_AUTH_REDIRECT_URL";
pub const ENV_VERBOSE: &str = "LCA_VERBOSE";
pub const ENV_TIMEOUT: &str = "LCA_TIMEOUT";

/// How a launch ended. Resolved exactly once per launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The process survived the startup grace window.
    Started { pid: u32 },
    /// The process could not be spawned or exited during startup.
    Failed { cause: String },
}

/// A launch in progress.
#[derive(Debug)]
pub struct Launch {
    pid: Option<u32>,
    outcome: oneshot::Receiver<LaunchOutcome>,
}

impl Launch {
    /// Spawn `command` and watch it for `grace`.
    ///
    /// After a successful start the child keeps being reaped in the
    /// background so its exit is observable through its pid.
    pub fn spawn(mut command: Command, grace: Duration) -> Self {
        let (tx, outcome) = oneshot::channel();

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = tx.send(LaunchOutcome::Failed {
                    cause: format!("spawn failed: {err}"),
                });
                return Self { pid: None, outcome };
            }
        };
        let Some(pid) = child.id() else {
            let _ = tx.send(LaunchOutcome::Failed {
                cause: "process exited before reporting a pid".to_string(),
            });
            return Self { pid: None, outcome };
        };

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let cause = match status {
                        Ok(status) => format!("exited during startup ({status})"),
                        Err(err) => format!("lost track of process: {err}"),
                    };
                    let _ = tx.send(LaunchOutcome::Failed { cause });
                    return;
                }
                _ = tokio::time::sleep(grace) => {
                    let _ = tx.send(LaunchOutcome::Started { pid });
                }
            }

            match child.wait().await {
                Ok(status) => info!(pid, %status, "helper process exited"),
                Err(err) => warn!(pid, error = %err, "failed to reap helper process"),
            }
        });

        Self {
            pid: Some(pid),
            outcome,
        }
    }

    /// Pid of the spawned process, if spawning succeeded.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn outcome(self) -> LaunchOutcome {
        self.outcome.await.unwrap_or_else(|_| LaunchOutcome::Failed {
            cause: "launch watcher stopped".to_string(),
        })
    }
}

pub struct ProcessSupervisor {
    store: Arc<dyn StateStore>,
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(store: Arc<dyn StateStore>, config: SupervisorConfig) -> Self {
        Self { store, config }
    }

    /// Return the running instance for `host`, launching `installation` when
    /// there is none. Must run under the host's lease.
    pub async fn ensure(
        &self,
        host: &RemoteHost,
        installation: &InstallationRecord,
        cancel: &CancellationToken,
    ) -> Result<RunningInstance> {
        let host_id = host.id();
        let key = instance_key(host_id);

        if let Some(instance) = store::load::<RunningInstance>(self.store.as_ref(), &key).await? {
            if instance.is_alive() {
                debug!(host = host_id, pid = instance.pid, "helper already running");
                return Ok(instance);
            }
            info!(host = host_id, pid = instance.pid, "discarding stale helper instance");
            store::remove(self.store.as_ref(), &key).await?;
        }
        if cancel.is_cancelled() {
            return Err(LocalAppError::Cancelled);
        }

        let rpc_port = platform::allocate_port()
            .map_err(|err| LocalAppError::spawn(format!("allocating a local port: {err}")))?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let slug = file_slug(host_id);
        let control_file = std::env::temp_dir().join(format!("localapp-ssh-{slug}-{run_id}.conf"));
        let log_path = self
            .config
            .log_dir
            .join(format!("local-companion-{slug}-{run_id}.log"));

        let log = self.open_log(&log_path).await?;
        let command = self.command(host, installation, rpc_port, &control_file, log)?;
        info!(
            host = host_id,
            binary = %installation.binary_path.display(),
            port = rpc_port,
            log = %log_path.display(),
            "starting helper process"
        );

        let launch = Launch::spawn(command, self.config.startup_grace());
        let spawned_pid = launch.pid();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Some(pid) = spawned_pid {
                    if let Err(err) = platform::terminate(pid) {
                        warn!(host = host_id, pid, error = %err, "failed to stop cancelled helper launch");
                    }
                }
                return Err(LocalAppError::Cancelled);
            }
            outcome = launch.outcome() => outcome,
        };

        let pid = match outcome {
            LaunchOutcome::Started { pid } => pid,
            LaunchOutcome::Failed { cause } => {
                warn!(host = host_id, %cause, log = %log_path.display(), "helper failed to start");
                return Err(LocalAppError::spawn(format!(
                    "{cause}; see {}",
                    log_path.display()
                )));
            }
        };

        let instance = RunningInstance {
            host_id: host_id.to_string(),
            control_file,
            rpc_port,
            pid,
            log_path,
        };
        store::save(self.store.as_ref(), &key, &instance).await?;
        info!(host = host_id, pid, port = rpc_port, "helper process started");
        Ok(instance)
    }

    /// Open the helper's log for appending, creating the log directory first.
    async fn open_log(&self, log_path: &Path) -> Result<File> {
        tokio::fs::create_dir_all(&self.config.log_dir)
            .await
            .map_err(|err| {
                LocalAppError::spawn(format!(
                    "creating log directory {}: {err}",
                    self.config.log_dir.display()
                ))
            })?;
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|err| LocalAppError::spawn(format!("opening {}: {err}", log_path.display())))?;
        Ok(log.into_std().await)
    }

    fn command(
        &self,
        host: &RemoteHost,
        installation: &InstallationRecord,
        rpc_port: u16,
        control_file: &Path,
        log: File,
    ) -> Result<Command> {
        let log_err = log
            .try_clone()
            .map_err(|err| LocalAppError::spawn(format!("duplicating log handle: {err}")))?;

        let mut command = Command::new(&installation.binary_path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .env(ENV_HOST, host.origin())
            .env(ENV_SSH_CONFIG, control_file)
            .env(ENV_API_PORT, rpc_port.to_string())
            .env(ENV_AUTO_TUNNEL, self.config.auto_tunnel.to_string())
            .env(ENV_AUTH_REDIRECT_URL, self.config.auth_redirect_url())
            .env(ENV_VERBOSE, self.config.verbose.to_string());
        if let Some(timeout) = self.config.idle_timeout() {
            command.env(ENV_TIMEOUT, format!("{}s", timeout.as_secs()));
        }
        platform::detach(&mut command);
        Ok(command)
    }
}

/// Host id made safe for use in a file name.
fn file_slug(host_id: &str) -> String {
    host_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
