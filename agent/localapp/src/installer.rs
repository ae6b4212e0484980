//! Keeps a usable helper binary on disk for each remote host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use localapp_config::InstallerConfig;
use reqwest::header::ETAG;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LocalAppError, Result};
use crate::host::RemoteHost;
use crate::platform;
use crate::records::{self, installation_key, InstallationRecord};
use crate::store::{self, StateStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful response from the download endpoint, body not yet consumed.
struct Probe {
    url: String,
    version_tag: Option<String>,
    response: reqwest::Response,
}

pub struct Installer {
    store: Arc<dyn StateStore>,
    client: reqwest::Client,
    config: InstallerConfig,
    binary_name: String,
    /// Host id -> when the download endpoint last confirmed the stored tag.
    confirmed: Mutex<HashMap<String, Instant>>,
}

impl Installer {
    pub fn new(store: Arc<dyn StateStore>, config: InstallerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| LocalAppError::install(format!("building http client: {err}")))?;
        Ok(Self::with_client(store, config, client))
    }

    pub fn with_client(
        store: Arc<dyn StateStore>,
        config: InstallerConfig,
        client: reqwest::Client,
    ) -> Self {
        Self {
            store,
            client,
            config,
            binary_name: platform::helper_binary_name(),
            confirmed: Mutex::new(HashMap::new()),
        }
    }

    /// Use a different published binary name than the running platform's.
    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Return a usable installation for `host`, installing or upgrading it
    /// when needed.
    ///
    /// Must run under the host's lease. A configured `override_path` wins
    /// over anything published by the host and never touches the network.
    pub async fn ensure(
        &self,
        host: &RemoteHost,
        override_path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<InstallationRecord> {
        let host_id = host.id();
        let key = installation_key(host_id);

        let mut current = store::load::<InstallationRecord>(self.store.as_ref(), &key).await?;
        if let Some(record) = &current {
            if !platform::is_executable(&record.binary_path).await {
                info!(host = host_id, path = %record.binary_path.display(), "installed helper is missing or not executable");
                store::remove(self.store.as_ref(), &key).await?;
                self.forget_confirmation(host_id);
                current = None;
            }
        }
        check_cancelled(cancel)?;

        if let Some(path) = override_path {
            return self.use_override(host_id, current, path).await;
        }

        if let Some(record) = &current {
            if self.recently_confirmed(host_id) {
                debug!(host = host_id, "installation confirmed recently; skipping update check");
                return Ok(record.clone());
            }
        }

        let url = host.download_url(&self.binary_name);
        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LocalAppError::Cancelled),
            probe = self.probe(&url) => probe,
        };

        let available = probe.as_ref().ok().map(|probe| probe.version_tag.clone());
        let superseded = matches!(
            (&current, &available),
            (Some(record), Some(tag)) if *tag != record.version_tag
        );
        if superseded {
            if let Some(record) = current.take() {
                info!(
                    host = host_id,
                    installed = ?record.version_tag,
                    available = ?available.flatten(),
                    "helper upgrade available"
                );
                self.invalidate(host_id, &record).await?;
            }
        }

        if let Some(record) = current {
            match &probe {
                Ok(_) => self.confirm(host_id),
                Err(reason) => {
                    warn!(host = host_id, %url, %reason, "update check failed; keeping installed helper")
                }
            }
            return Ok(record);
        }

        let probe = probe.map_err(|reason| LocalAppError::ProbeFailed {
            url: url.clone(),
            reason,
        })?;
        check_cancelled(cancel)?;

        let record = self.download(probe, cancel).await?;
        store::save(self.store.as_ref(), &key, &record).await?;
        self.confirm(host_id);
        info!(
            host = host_id,
            path = %record.binary_path.display(),
            version = ?record.version_tag,
            "installed helper"
        );
        Ok(record)
    }

    async fn use_override(
        &self,
        host_id: &str,
        current: Option<InstallationRecord>,
        path: &Path,
    ) -> Result<InstallationRecord> {
        if let Some(record) = current {
            if record.binary_path == path {
                return Ok(record);
            }
            info!(
                host = host_id,
                previous = %record.binary_path.display(),
                configured = %path.display(),
                "switching to configured helper binary"
            );
            self.invalidate(host_id, &record).await?;
        } else {
            records::discard_instance(self.store.as_ref(), host_id).await?;
        }

        if !platform::is_executable(path).await {
            return Err(LocalAppError::install(format!(
                "configured helper {} is not an executable file",
                path.display()
            )));
        }

        let record = InstallationRecord {
            binary_path: path.to_path_buf(),
            version_tag: None,
        };
        store::save(self.store.as_ref(), &installation_key(host_id), &record).await?;
        Ok(record)
    }

    /// Drop `record` and any instance running it.
    async fn invalidate(&self, host_id: &str, record: &InstallationRecord) -> Result<()> {
        records::discard_instance(self.store.as_ref(), host_id).await?;
        store::remove(self.store.as_ref(), &installation_key(host_id)).await?;
        self.forget_confirmation(host_id);

        // Only binaries we downloaded are ours to delete.
        if record.version_tag.is_some() && record.binary_path.starts_with(&self.config.install_dir) {
            match tokio::fs::remove_file(&record.binary_path).await {
                Ok(()) => debug!(path = %record.binary_path.display(), "removed superseded helper"),
                Err(err) => debug!(path = %record.binary_path.display(), error = %err, "could not remove superseded helper"),
            }
        }
        Ok(())
    }

    async fn probe(&self, url: &str) -> std::result::Result<Probe, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }
        let version_tag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(Probe {
            url: url.to_string(),
            version_tag,
            response,
        })
    }

    async fn download(&self, probe: Probe, cancel: &CancellationToken) -> Result<InstallationRecord> {
        tokio::fs::create_dir_all(&self.config.install_dir)
            .await
            .map_err(|err| {
                LocalAppError::install(format!(
                    "creating {}: {err}",
                    self.config.install_dir.display()
                ))
            })?;

        let path = self.fresh_binary_path();
        debug!(url = %probe.url, path = %path.display(), "downloading helper");

        let written = match tokio::time::timeout(
            self.config.download_timeout(),
            write_body(&path, probe.response, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LocalAppError::install(format!(
                "download from {} timed out",
                probe.url
            ))),
        };
        let finished = match written {
            Ok(()) => platform::make_executable(&path)
                .await
                .map_err(|err| LocalAppError::install(format!("marking {} executable: {err}", path.display()))),
            Err(err) => Err(err),
        };

        if let Err(err) = finished {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(err);
        }

        Ok(InstallationRecord {
            binary_path: path,
            version_tag: probe.version_tag,
        })
    }

    fn fresh_binary_path(&self) -> PathBuf {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let name = match self.binary_name.strip_suffix(".exe") {
            Some(stem) => format!("{stem}-{unique}.exe"),
            None => format!("{}-{unique}", self.binary_name),
        };
        self.config.install_dir.join(name)
    }

    fn recently_confirmed(&self, host_id: &str) -> bool {
        let confirmed = self.confirmed.lock().unwrap_or_else(PoisonError::into_inner);
        confirmed
            .get(host_id)
            .is_some_and(|at| at.elapsed() < self.config.update_check_interval())
    }

    fn confirm(&self, host_id: &str) {
        self.confirmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_id.to_string(), Instant::now());
    }

    fn forget_confirmation(&self, host_id: &str) {
        self.confirmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host_id);
    }
}

async fn write_body(
    path: &Path,
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<()> {
    let write_err = |err: std::io::Error| LocalAppError::install(format!("writing {}: {err}", path.display()));

    let mut file = tokio::fs::File::create(path).await.map_err(write_err)?;
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LocalAppError::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => file.write_all(&bytes).await.map_err(write_err)?,
            Some(Err(err)) => {
                return Err(LocalAppError::install(format!("download interrupted: {err}")))
            }
            None => break,
        }
    }
    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    // Close synchronously; executing a file that is still open for writing
    // fails with ETXTBSY.
    drop(file.into_std().await);
    Ok(())
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(LocalAppError::Cancelled)
    } else {
        Ok(())
    }
}
