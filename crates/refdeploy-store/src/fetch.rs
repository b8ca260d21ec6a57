//! URI fetcher for `file://` and `http(s)://` sources.

use std::fs;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::cancel::Cancellable;
use crate::error::{StoreError, StoreResult};

const USER_AGENT: &str = concat!("refdeploy/", env!("CARGO_PKG_VERSION"));
const FETCH_ATTEMPTS: usize = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct Fetcher {
    headers: Vec<(String, String)>,
    client: OnceLock<Client>,
}

impl Clone for Fetcher {
    fn clone(&self) -> Self {
        Self::with_headers(self.headers.clone())
    }
}

/// Join a relative path onto a base URI, tolerating a missing trailing slash.
#[must_use]
pub fn join_uri(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{base}{relative}")
    } else {
        format!("{base}/{relative}")
    }
}

#[must_use]
pub fn is_local_uri(uri: &str) -> bool {
    uri.starts_with("file:")
}

impl Fetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_headers(headers: Vec<(String, String)>) -> Self {
        Self {
            headers,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> StoreResult<&Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| StoreError::Fetch {
                url: String::new(),
                message: format!("failed to build http client: {err}"),
            })?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Fetch `uri`, mapping a missing resource to [`StoreError::NotFound`].
    pub fn fetch(&self, uri: &str, cancellable: &Cancellable) -> StoreResult<Vec<u8>> {
        cancellable.check()?;
        let url = Url::parse(uri).map_err(|_| StoreError::UnsupportedUri(uri.to_string()))?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| StoreError::UnsupportedUri(uri.to_string()))?;
                fs::read(&path).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        StoreError::NotFound(uri.to_string())
                    } else {
                        StoreError::io_path("read", &path, err)
                    }
                })
            }
            "http" | "https" => {
                let mut last_err = None;
                for attempt in 0..FETCH_ATTEMPTS {
                    cancellable.check()?;
                    match self.fetch_http_once(uri) {
                        Ok(data) => return Ok(data),
                        Err(err @ StoreError::NotFound(_)) => return Err(err),
                        Err(err) => {
                            debug!(uri, attempt, error = %err, "fetch attempt failed");
                            last_err = Some(err);
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| StoreError::Fetch {
                    url: uri.to_string(),
                    message: "no attempts left".into(),
                }))
            }
            _ => Err(StoreError::UnsupportedUri(uri.to_string())),
        }
    }

    /// Like [`Fetcher::fetch`] but a missing resource is `Ok(None)`.
    pub fn fetch_optional(&self, uri: &str, cancellable: &Cancellable) -> StoreResult<Option<Vec<u8>>> {
        match self.fetch(uri, cancellable) {
            Ok(data) => Ok(Some(data)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn fetch_http_once(&self, uri: &str) -> StoreResult<Vec<u8>> {
        let fetch_err = |message: String| StoreError::Fetch {
            url: uri.to_string(),
            message,
        };
        let mut request = self.client()?.get(uri);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let mut response = request.send().map_err(|err| fetch_err(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        if !response.status().is_success() {
            return Err(fetch_err(format!("server returned {}", response.status())));
        }
        let mut body = Vec::new();
        response
            .read_to_end(&mut body)
            .map_err(|err| fetch_err(format!("stream error: {err}")))?;
        Ok(body)
    }
}
