use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::error::LocalAppError;

/// A remote backend the helper connects to.
///
/// The identity is the URL authority: host name plus the port when it is not
/// the scheme's default. It keys every lease and record for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    url: Url,
    id: String,
}

impl RemoteHost {
    pub fn parse(input: &str) -> Result<Self, LocalAppError> {
        let input = input.trim();
        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("https://{input}")
        };
        let url = Url::parse(&with_scheme)
            .map_err(|err| LocalAppError::InvalidHost(format!("{input}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LocalAppError::InvalidHost(format!(
                "{input}: unsupported scheme `{}`",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| LocalAppError::InvalidHost(format!("{input}: missing host")))?
            .to_ascii_lowercase();
        let id = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        Ok(Self { url, id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Origin of the host, e.g. `https://example.org:8443`.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    pub fn download_url(&self, binary_name: &str) -> String {
        format!("{}/static/bin/{binary_name}", self.origin())
    }
}

impl FromStr for RemoteHost {
    type Err = LocalAppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
