//! Calls into a running helper, riding out the gap between the process
//! starting and its RPC server accepting connections.

use std::future::Future;

use localapp_config::BrokerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LocalAppError, Result};
use crate::records::RunningInstance;
use crate::rpc::{
    AutoTunnelRequest, ResolveSshConnectionRequest, ResolveSshConnectionResponse, RpcChannel,
    RpcError,
};
use crate::schedule::sleep_or_cancel;

#[derive(Debug, Clone)]
pub struct ConnectionBroker {
    client: reqwest::Client,
    config: BrokerConfig,
}

impl ConnectionBroker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .no_proxy()
            .build()
            .map_err(|source| RpcError::Transport {
                method: "client".to_string(),
                source,
            })?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: BrokerConfig) -> Self {
        Self { client, config }
    }

    pub fn channel(&self, instance: &RunningInstance) -> RpcChannel {
        RpcChannel::new(self.client.clone(), instance.rpc_port)
    }

    /// Run `operation` against `instance`, retrying while the process is
    /// alive and its endpoint is not ready.
    ///
    /// A dead process fails with `InstanceGone` before any retry; callers
    /// should ensure a fresh instance. Other RPC failures surface at once.
    pub async fn call<T, F, Fut>(
        &self,
        instance: &RunningInstance,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(RpcChannel) -> Fut,
        Fut: Future<Output = std::result::Result<T, RpcError>>,
    {
        let channel = self.channel(instance);
        let gone = || LocalAppError::InstanceGone {
            host: instance.host_id.clone(),
            pid: instance.pid,
        };
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(LocalAppError::Cancelled);
            }
            if !instance.is_alive() {
                return Err(gone());
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LocalAppError::Cancelled),
                outcome = operation(channel.clone()) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(host = %instance.host_id, port = instance.rpc_port, attempt, "helper endpoint became ready");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !instance.is_alive() {
                warn!(host = %instance.host_id, pid = instance.pid, error = %err, "helper exited during call");
                return Err(gone());
            }
            if !err.is_not_ready() {
                return Err(err.into());
            }

            let not_ready = LocalAppError::EndpointNotReady {
                port: instance.rpc_port,
            };
            debug!(
                host = %instance.host_id,
                attempt,
                error = %err,
                retry_in_ms = self.config.retry_delay_ms,
                "{not_ready}"
            );
            if !sleep_or_cancel(self.config.retry_delay(), cancel).await {
                return Err(LocalAppError::Cancelled);
            }
        }
    }

    pub async fn resolve_ssh_connection(
        &self,
        instance: &RunningInstance,
        request: &ResolveSshConnectionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolveSshConnectionResponse> {
        self.call(instance, cancel, |channel| async move {
            channel.resolve_ssh_connection(request).await
        })
        .await
    }

    pub async fn set_auto_tunnel(
        &self,
        instance: &RunningInstance,
        instance_id: &str,
        enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = AutoTunnelRequest {
            instance_id: instance_id.to_string(),
            enabled,
        };
        self.call(instance, cancel, |channel| {
            let request = &request;
            async move { channel.auto_tunnel(request).await.map(|_| ()) }
        })
        .await
    }
}
