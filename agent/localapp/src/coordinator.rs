//! Per-host orchestration: install and launch under the host's lease, then
//! talk to the result.

use std::path::PathBuf;
use std::sync::Arc;

use localapp_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::ConnectionBroker;
use crate::error::{LocalAppError, Result};
use crate::host::RemoteHost;
use crate::installer::Installer;
use crate::lease::LeaseLock;
use crate::records::{self, installation_key, instance_key, InstallationRecord, RunningInstance};
use crate::rpc::{ResolveSshConnectionRequest, ResolveSshConnectionResponse};
use crate::store::{self, FsStateStore, StateStore};
use crate::supervisor::ProcessSupervisor;

pub struct AppCoordinator {
    store: Arc<dyn StateStore>,
    leases: LeaseLock,
    installer: Installer,
    supervisor: ProcessSupervisor,
    broker: ConnectionBroker,
    local_app_path: Option<PathBuf>,
}

impl AppCoordinator {
    /// Build every component from `config` around an existing store.
    pub fn new(store: Arc<dyn StateStore>, config: &Config) -> Result<Self> {
        Ok(Self {
            leases: LeaseLock::new(Arc::clone(&store), config.lease.clone()),
            installer: Installer::new(Arc::clone(&store), config.installer.clone())?,
            supervisor: ProcessSupervisor::new(Arc::clone(&store), config.supervisor.clone()),
            broker: ConnectionBroker::new(config.broker.clone())?,
            local_app_path: config.installer.local_app_path.clone(),
            store,
        })
    }

    /// Open the directory store named by the configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = FsStateStore::open(&config.store.state_dir).await?;
        Self::new(Arc::new(store), config)
    }

    /// Assemble from prebuilt components, all sharing `store`.
    pub fn from_parts(
        store: Arc<dyn StateStore>,
        leases: LeaseLock,
        installer: Installer,
        supervisor: ProcessSupervisor,
        broker: ConnectionBroker,
    ) -> Self {
        Self {
            store,
            leases,
            installer,
            supervisor,
            broker,
            local_app_path: None,
        }
    }

    /// Pin the helper binary, bypassing downloads.
    pub fn with_local_app_path(mut self, path: Option<PathBuf>) -> Self {
        self.local_app_path = path;
        self
    }

    /// The live instance for `host`, if any. Read without the lease, so the
    /// answer is advisory.
    pub async fn running(&self, host: &RemoteHost) -> Result<Option<RunningInstance>> {
        let instance =
            store::load::<RunningInstance>(self.store.as_ref(), &instance_key(host.id())).await?;
        Ok(instance.filter(RunningInstance::is_alive))
    }

    /// Make sure a helper is installed and running for `host`.
    pub async fn ensure(
        &self,
        host: &RemoteHost,
        cancel: &CancellationToken,
    ) -> Result<RunningInstance> {
        if let Some(instance) = self.running(host).await? {
            if self.runs_configured_binary(host).await? {
                debug!(host = %host, pid = instance.pid, "reusing running helper");
                return Ok(instance);
            }
            info!(host = %host, pid = instance.pid, "configured helper binary changed");
        }

        let override_path = self.local_app_path.as_deref();
        self.leases
            .with_lock(host.id(), cancel, |token| async move {
                let installation = self.installer.ensure(host, override_path, &token).await?;
                self.supervisor.ensure(host, &installation, &token).await
            })
            .await
    }

    /// Whether the recorded installation is the one a configured override
    /// asks for. Always true without an override.
    async fn runs_configured_binary(&self, host: &RemoteHost) -> Result<bool> {
        let Some(path) = self.local_app_path.as_deref() else {
            return Ok(true);
        };
        let installation =
            store::load::<InstallationRecord>(self.store.as_ref(), &installation_key(host.id()))
                .await?;
        Ok(installation.is_some_and(|record| record.binary_path == path))
    }

    /// Resolve SSH connection details through the host's helper, relaunching
    /// it once if it died underneath us.
    pub async fn resolve_ssh(
        &self,
        host: &RemoteHost,
        request: &ResolveSshConnectionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolveSshConnectionResponse> {
        let instance = self.ensure(host, cancel).await?;
        match self
            .broker
            .resolve_ssh_connection(&instance, request, cancel)
            .await
        {
            Err(LocalAppError::InstanceGone { pid, .. }) => {
                warn!(host = %host, pid, "helper exited; relaunching");
                let instance = self.ensure(host, cancel).await?;
                self.broker
                    .resolve_ssh_connection(&instance, request, cancel)
                    .await
            }
            other => other,
        }
    }

    /// Toggle tunnelling in the running helper. Without a running helper
    /// there is nothing to update.
    pub async fn set_auto_tunnel(
        &self,
        host: &RemoteHost,
        instance_id: &str,
        enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(instance) = self.running(host).await? else {
            debug!(host = %host, "no running helper; auto-tunnel applies on next launch");
            return Ok(());
        };
        match self
            .broker
            .set_auto_tunnel(&instance, instance_id, enabled, cancel)
            .await
        {
            Err(LocalAppError::InstanceGone { .. }) => Ok(()),
            other => other,
        }
    }

    /// Terminate the helper for `host` and forget it.
    pub async fn stop(
        &self,
        host: &RemoteHost,
        cancel: &CancellationToken,
    ) -> Result<Option<RunningInstance>> {
        let stopped = self
            .leases
            .with_lock(host.id(), cancel, |_| async move {
                Ok(records::discard_instance(self.store.as_ref(), host.id()).await?)
            })
            .await?;
        if let Some(instance) = &stopped {
            info!(host = %host, pid = instance.pid, "stopped helper");
        }
        Ok(stopped)
    }
}
