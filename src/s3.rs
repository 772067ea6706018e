use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::AuthData;
use crate::error::{Error, check_response, error_message};
use crate::token::TokenSource;
use crate::util::user_agent;

pub const DEFAULT_S3_KEY_SERVER_URL: &str =
    "https://s3-keys-manager.cloudferro.com/api/user/credentials";

/// S3 endpoint serving the CDSE `eodata` bucket.
pub const CDSE_S3_ENDPOINT_URL: &str = "https://eodata.dataspace.copernicus.eu";

#[derive(Debug, serde::Deserialize)]
struct KeyServerReply {
    access_id: String,
    secret: String,
    expiration_date: String,
}

/// Temporary credentials for the CDSE S3 bucket.
///
/// The credentials are created on the S3 keys manager and deleted from it
/// when the value is dropped (or by [`S3Credentials::delete`]), unless
/// [`S3Credentials::persist`] is called.
pub struct S3Credentials {
    key_server_url: String,
    token: TokenSource,
    credentials: AuthData,
    expiration_date: DateTime<Utc>,
    alive: bool,
    http: HttpClient,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("key_server_url", &self.key_server_url)
            .field("credentials", &self.credentials)
            .field("expiration_date", &self.expiration_date)
            .field("alive", &self.alive)
            .finish()
    }
}

impl S3Credentials {
    /// Creates credentials on the default key server.
    pub fn new(token: impl Into<TokenSource>) -> Result<Self> {
        Self::with_key_server(token, DEFAULT_S3_KEY_SERVER_URL)
    }

    pub fn with_key_server(
        token: impl Into<TokenSource>,
        key_server_url: impl Into<String>,
    ) -> Result<Self> {
        let token = token.into();
        let key_server_url = key_server_url.into();

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent())
                .unwrap_or(HeaderValue::from_static("cdseutils-rs")),
        );
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = HttpClient::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;

        let resp = http
            .post(&key_server_url)
            .bearer_auth(token.bearer()?)
            .send()
            .with_context(|| format!("failed to contact the S3 keys manager {}", key_server_url))?;
        let reply: KeyServerReply = check_response(resp)?
            .json()
            .context("failed to parse the S3 keys manager reply")?;

        let expiration_date = parse_expiration(&reply.expiration_date)?;
        debug!(
            "created S3 credentials {} (expires {})",
            reply.access_id, expiration_date
        );

        Ok(Self {
            key_server_url,
            token,
            credentials: AuthData::new(reply.access_id, reply.secret),
            expiration_date,
            alive: true,
            http,
        })
    }

    pub fn access_id(&self) -> &str {
        &self.credentials.username
    }

    pub fn secret(&self) -> &str {
        &self.credentials.password
    }

    pub fn expiration_date(&self) -> DateTime<Utc> {
        self.expiration_date
    }

    /// `true` until the credentials are deleted or expire.
    pub fn is_valid(&self) -> bool {
        self.alive && Utc::now() < self.expiration_date
    }

    /// Access id and secret as a username/password pair.
    pub fn get(&self) -> Result<&AuthData> {
        if !self.is_valid() {
            return Err(Error::InvalidS3Credentials("credentials have expired").into());
        }
        Ok(&self.credentials)
    }

    /// Deletes the credentials from the key server.
    pub fn delete(mut self) -> Result<()> {
        self.alive = false;
        let status = self.delete_remote()?;
        if status != StatusCode::NO_CONTENT {
            bail!(
                "failed to delete S3 credentials {}: HTTP {}",
                self.access_id(),
                status.as_u16()
            );
        }
        Ok(())
    }

    /// Keeps the credentials on the key server and returns them.
    pub fn persist(mut self) -> AuthData {
        self.alive = false;
        self.credentials.clone()
    }

    fn delete_remote(&self) -> Result<StatusCode> {
        let url = format!(
            "{}/access_id/{}",
            self.key_server_url.trim_end_matches('/'),
            self.credentials.username
        );
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(self.token.bearer()?)
            .send()
            .with_context(|| format!("failed to contact the S3 keys manager {}", url))?;
        let status = resp.status();
        if status != StatusCode::NO_CONTENT {
            let text = resp.text().unwrap_or_default();
            debug!("S3 keys manager replied: {}", error_message(&text));
        }
        Ok(status)
    }
}

impl Drop for S3Credentials {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        match self.delete_remote() {
            Ok(StatusCode::NO_CONTENT) => debug!("deleted S3 credentials {}", self.access_id()),
            Ok(status) => warn!(
                "Failed to delete S3 credentials {}. Status code: {}",
                self.access_id(),
                status.as_u16()
            ),
            Err(e) => warn!(
                "Failed to delete S3 credentials {}: {:#}",
                self.access_id(),
                e
            ),
        }
    }
}

/// Parses ISO 8601 timestamps; values without offset are taken as UTC.
fn parse_expiration(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .with_context(|| format!("invalid expiration date '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiration_formats() {
        let want = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_expiration("2025-03-01T12:30:00Z").unwrap(), want);
        assert_eq!(parse_expiration("2025-03-01T13:30:00+01:00").unwrap(), want);
        assert_eq!(parse_expiration("2025-03-01T12:30:00").unwrap(), want);
        assert_eq!(parse_expiration("2025-03-01T12:30:00.000000").unwrap(), want);
        assert_eq!(parse_expiration("2025-03-01 12:30:00").unwrap(), want);
        assert!(parse_expiration("tomorrow").is_err());
    }
}
