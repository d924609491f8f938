//! HTTP session with one remote database
//!
//! Owns the `reqwest` client and its cookie jar. The jar belongs to the
//! session, so separate pulls never share cookies. Credentials found in the
//! remote URL are moved out of it and sent as preemptive basic auth.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use url::Url;

use super::config::{Credentials, ReplicationConfig};
use super::errors::{ReplicationError, ReplicationResult};
use crate::observability::mask_credentials;

/// Shared HTTP state for one replication.
#[derive(Debug)]
pub struct ReplicationSession {
    client: Client,
    cookies: Arc<Jar>,
    remote: Url,
    display: String,
    credentials: Option<Credentials>,
    request_timeout: Option<Duration>,
}

impl ReplicationSession {
    pub fn new(config: &ReplicationConfig) -> ReplicationResult<Self> {
        config.validate()?;

        let mut remote = config.remote.clone();
        let credentials = match &config.credentials {
            Some(credentials) => Some(credentials.clone()),
            None if !remote.username().is_empty() => Some(Credentials {
                username: remote.username().to_string(),
                password: remote.password().unwrap_or_default().to_string(),
            }),
            None => None,
        };
        remote
            .set_username("")
            .and_then(|_| remote.set_password(None))
            .map_err(|_| ReplicationError::config("cannot strip credentials from remote URL"))?;
        remote.set_query(None);
        remote.set_fragment(None);
        if !remote.path().ends_with('/') {
            let path = format!("{}/", remote.path());
            remote.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ReplicationError::config(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ReplicationError::config(format!("invalid value for header '{}'", name)))?;
            headers.insert(name, value);
        }

        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            cookies,
            display: mask_credentials(config.remote.as_str()),
            remote,
            credentials,
            request_timeout: config.request_timeout_ms.map(Duration::from_millis),
        })
    }

    /// The remote database URL, without credentials, ending in `/`.
    pub fn remote(&self) -> &Url {
        &self.remote
    }

    /// The remote URL as it may appear in logs.
    pub fn display_remote(&self) -> &str {
        &self.display
    }

    /// The session's cookie jar.
    pub fn cookies(&self) -> &Arc<Jar> {
        &self.cookies
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Timeout applied to document fetches.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// `<remote>/<segments...>?<query>`; segments are percent-encoded.
    pub fn url_for(&self, segments: &[&str], query: &[(&str, &str)]) -> ReplicationResult<Url> {
        let mut url = self.remote.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ReplicationError::config("remote URL cannot be a base"))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// A GET request carrying the session's credentials.
    pub fn get(&self, url: Url) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            None => request,
        }
    }
}
