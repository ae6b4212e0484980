//! Client side of the helper's local RPC endpoint.
//!
//! Calls are unary JSON over HTTP: `POST /localapp.v1.LocalApp/<Method>` with
//! the request as the body. Failures carry a `{code, message}` body with a
//! lowercase status code.

use std::error::Error as _;
use std::io;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

pub const SERVICE_PATH: &str = "localapp.v1.LocalApp";
pub const RESOLVE_SSH_CONNECTION: &str = "ResolveSSHConnection";
pub const AUTO_TUNNEL: &str = "AutoTunnel";

#[derive(Debug, Error)]
pub enum RpcError {
    /// Nothing accepted the connection, or it was reset before a response.
    #[error("endpoint {endpoint} unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} failed with status `{code}`: {message}")]
    Status {
        method: String,
        code: String,
        message: String,
    },

    #[error("{method} transport error: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} returned an undecodable response: {reason}")]
    Decode { method: String, reason: String },
}

impl RpcError {
    /// Whether the error means the server is not serving yet rather than
    /// refusing the call.
    pub fn is_not_ready(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::Status { code, .. } => matches!(code.as_str(), "unavailable" | "unknown"),
            Self::Transport { .. } | Self::Decode { .. } => false,
        }
    }
}

/// Error body returned by the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveSshConnectionRequest {
    pub instance_id: String,
    pub workspace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveSshConnectionResponse {
    /// SSH host alias to connect to.
    pub host: String,
    /// Generated SSH config file declaring `host`.
    pub config_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTunnelRequest {
    pub instance_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTunnelResponse {}

/// Connection to one helper's endpoint. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RpcChannel {
    client: reqwest::Client,
    endpoint: String,
}

impl RpcChannel {
    pub fn new(client: reqwest::Client, port: u16) -> Self {
        Self {
            client,
            endpoint: format!("http://localhost:{port}"),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn unary<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{SERVICE_PATH}/{method}", self.endpoint);
        trace!(%url, "rpc call");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| self.classify(method, err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| self.classify(method, err))?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<RpcStatus>(&body).unwrap_or_else(|_| RpcStatus {
                code: code_for_status(status).to_string(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
            return Err(RpcError::Status {
                method: method.to_string(),
                code: detail.code,
                message: detail.message,
            });
        }

        serde_json::from_slice(&body).map_err(|err| RpcError::Decode {
            method: method.to_string(),
            reason: err.to_string(),
        })
    }

    pub async fn resolve_ssh_connection(
        &self,
        request: &ResolveSshConnectionRequest,
    ) -> Result<ResolveSshConnectionResponse, RpcError> {
        self.unary(RESOLVE_SSH_CONNECTION, request).await
    }

    pub async fn auto_tunnel(
        &self,
        request: &AutoTunnelRequest,
    ) -> Result<AutoTunnelResponse, RpcError> {
        self.unary(AUTO_TUNNEL, request).await
    }

    fn classify(&self, method: &str, err: reqwest::Error) -> RpcError {
        if err.is_connect() || is_connection_dropped(&err) {
            RpcError::Unreachable {
                endpoint: self.endpoint.clone(),
                source: err,
            }
        } else {
            RpcError::Transport {
                method: method.to_string(),
                source: err,
            }
        }
    }
}

fn is_connection_dropped(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            );
        }
        source = cause.source();
    }
    false
}

/// Status code for error responses that carry no `{code, message}` body.
fn code_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_argument",
        StatusCode::UNAUTHORIZED => "unauthenticated",
        StatusCode::FORBIDDEN => "permission_denied",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::CONFLICT => "already_exists",
        StatusCode::TOO_MANY_REQUESTS => "resource_exhausted",
        StatusCode::NOT_IMPLEMENTED => "unimplemented",
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            "unavailable"
        }
        StatusCode::INTERNAL_SERVER_ERROR => "internal",
        _ => "unknown",
    }
}
