use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use std::collections::HashSet;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::token::TokenSource;
use crate::util::{backoff, initial_sleep, retriable_status, user_agent};

/// CDSE hosts that may receive the bearer token after a redirect.
pub const CDSE_TRUSTED_DOMAINS: [&str; 2] = [
    "catalogue.dataspace.copernicus.eu",
    "download.dataspace.copernicus.eu",
];

const MAX_REDIRECTS: usize = 30;

/// HTTP(S) session with bearer authentication.
///
/// Redirects are followed by the session itself so that the `Authorization`
/// header survives hops to the trusted domains; see [`should_strip_auth`].
#[derive(Debug, Clone)]
pub struct Session {
    token: Option<TokenSource>,
    trusted_domains: HashSet<String>,

    retry_max: usize,
    sleep_max: Duration,

    http: HttpClient,
}

impl Session {
    /// Session for the CDSE, trusting [`CDSE_TRUSTED_DOMAINS`].
    pub fn cdse(token: Option<TokenSource>) -> Result<Self> {
        Self::new(token, CDSE_TRUSTED_DOMAINS)
    }

    pub fn new<I, S>(token: Option<TokenSource>, trusted_domains: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_timeout(token, trusted_domains, Duration::from_secs(60))
    }

    pub fn with_timeout<I, S>(
        token: Option<TokenSource>,
        trusted_domains: I,
        timeout: Duration,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent())
                .unwrap_or(HeaderValue::from_static("cdseutils-rs")),
        );

        let http = HttpClient::builder()
            .default_headers(default_headers)
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            token,
            trusted_domains: trusted_domains.into_iter().map(Into::into).collect(),
            retry_max: 5,
            sleep_max: Duration::from_secs(30),
            http,
        })
    }

    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max.max(1);
        self
    }

    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.sleep_max = sleep_max;
        self
    }

    pub fn trusted_domains(&self) -> &HashSet<String> {
        &self.trusted_domains
    }

    pub fn token(&self) -> Option<&TokenSource> {
        self.token.as_ref()
    }

    pub(crate) fn retry_max(&self) -> usize {
        self.retry_max
    }

    pub(crate) fn sleep_max(&self) -> Duration {
        self.sleep_max
    }

    /// GET `url`, following redirects.
    pub fn get(&self, url: &str) -> Result<Response> {
        self.get_with_headers(url, &HeaderMap::new())
    }

    pub(crate) fn get_with_headers(&self, url: &str, headers: &HeaderMap) -> Result<Response> {
        let mut current = Url::parse(url).with_context(|| format!("invalid URL '{}'", url))?;
        let mut authenticated = self.token.is_some();

        for _ in 0..=MAX_REDIRECTS {
            let bearer = match (&self.token, authenticated) {
                (Some(token), true) => Some(token.bearer()?),
                _ => None,
            };

            let resp = self.robust_request(|| {
                let req = self.http.get(current.clone()).headers(headers.clone());
                apply_bearer(req, bearer.as_deref()).send()
            })?;

            if !resp.status().is_redirection() {
                return Ok(resp);
            }
            let Some(location) = resp.headers().get(LOCATION) else {
                return Ok(resp);
            };
            let location = location
                .to_str()
                .map_err(|_| anyhow!("invalid Location header from {}", current))?;
            let next = current
                .join(location)
                .with_context(|| format!("invalid redirect target '{}'", location))?;

            if authenticated && should_strip_auth(&current, &next, &self.trusted_domains) {
                debug!("dropping authorization on redirect to {}", next);
                authenticated = false;
            }
            debug!("redirect {} -> {}", current, next);
            current = next;
        }

        bail!("too many redirects (more than {}) for {}", MAX_REDIRECTS, url)
    }

    fn robust_request<F>(&self, mut f: F) -> Result<Response>
    where
        F: FnMut() -> std::result::Result<Response, reqwest::Error>,
    {
        let mut tries = 0usize;
        let mut sleep = initial_sleep(self.sleep_max);
        loop {
            match f() {
                Ok(resp) => {
                    if retriable_status(resp.status().as_u16()) {
                        tries += 1;
                        if tries >= self.retry_max {
                            return Ok(resp);
                        }
                        warn!(
                            "HTTP {} from {}, retrying in {:?}",
                            resp.status().as_u16(),
                            resp.url(),
                            sleep
                        );
                        thread::sleep(sleep);
                        sleep = backoff(sleep, self.sleep_max);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    tries += 1;
                    if tries >= self.retry_max {
                        return Err(anyhow::Error::new(err).context("could not connect"));
                    }
                    warn!("request failed ({}), retrying in {:?}", err, sleep);
                    thread::sleep(sleep);
                    sleep = backoff(sleep, self.sleep_max);
                }
            }
        }
    }
}

fn apply_bearer(req: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
    match bearer {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

/// Whether the `Authorization` header must be removed when redirecting
/// from `old` to `new`.
///
/// A different host strips authentication unless it is in `trusted`. For the
/// same (or a trusted) host a scheme or port change strips it, except for an
/// `http` to `https` upgrade on the default ports.
pub fn should_strip_auth(old: &Url, new: &Url, trusted: &HashSet<String>) -> bool {
    let new_host = new.host_str();
    if old.host_str() != new_host && !new_host.is_some_and(|h| trusted.contains(h)) {
        return true;
    }

    if old.scheme() == "http"
        && old.port().is_none()
        && new.scheme() == "https"
        && new.port().is_none()
    {
        return false;
    }

    old.scheme() != new.scheme() || old.port() != new.port()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(old: &str, new: &str) -> bool {
        let trusted: HashSet<String> = CDSE_TRUSTED_DOMAINS.iter().map(|s| s.to_string()).collect();
        should_strip_auth(&Url::parse(old).unwrap(), &Url::parse(new).unwrap(), &trusted)
    }

    #[test]
    fn same_host_keeps_auth() {
        assert!(!strip("https://example.com/a", "https://example.com/b"));
        assert!(!strip("https://example.com:443/a", "https://example.com/b"));
    }

    #[test]
    fn foreign_host_strips_auth() {
        assert!(strip("https://catalogue.dataspace.copernicus.eu/x", "https://evil.example/x"));
    }

    #[test]
    fn trusted_host_keeps_auth() {
        assert!(!strip(
            "https://catalogue.dataspace.copernicus.eu/odata/v1/Products(1)/$value",
            "https://download.dataspace.copernicus.eu/odata/v1/Products(1)/$value"
        ));
    }

    #[test]
    fn scheme_and_port_changes() {
        assert!(!strip("http://example.com/a", "https://example.com/a"));
        assert!(strip("https://example.com/a", "http://example.com/a"));
        assert!(strip("https://example.com/a", "https://example.com:8443/a"));
        assert!(strip("http://example.com:8080/a", "https://example.com/a"));
        assert!(strip(
            "https://catalogue.dataspace.copernicus.eu/a",
            "http://download.dataspace.copernicus.eu/a"
        ));
    }
}
