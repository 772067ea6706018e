use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::redirect::Policy;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::auth::{AuthData, resolve_credentials};
use crate::error::{Error, error_message};
use crate::util::user_agent;

pub const DEFAULT_AUTH_SERVER_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";

const CLIENT_ID: &str = "cdse-public";

/// Seconds subtracted from server-side lifetimes.
const EXPIRY_MARGIN_SECS: i64 = 1;

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    refresh_expires_in: i64,
}

struct TokenState {
    access_token: String,
    refresh_token: String,
    access_expires: DateTime<Utc>,
    refresh_expires: DateTime<Utc>,
}

/// Access token for the CDSE APIs.
///
/// The token is refreshed (or regenerated from the stored credentials) by
/// [`CdseToken::get`] once it expires. Share it between clients with
/// [`Arc`]; see [`TokenSource`].
pub struct CdseToken {
    auth_server_url: String,
    auth: AuthData,
    http: HttpClient,
    state: Mutex<TokenState>,
}

impl fmt::Debug for CdseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdseToken")
            .field("auth_server_url", &self.auth_server_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl CdseToken {
    /// Authenticates with credentials from the environment or netrc.
    ///
    /// This is equivalent to `CdseToken::new(None, None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None, None)
    }

    /// Authenticates against `auth_server_url` (default:
    /// [`DEFAULT_AUTH_SERVER_URL`]) and fetches the first access token.
    ///
    /// `username` and `password` must be both given or both omitted; when
    /// omitted they come from `CDSE_USERNAME` / `CDSE_PASSWORD` or from the
    /// netrc entry of the auth server.
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        auth_server_url: Option<String>,
    ) -> Result<Self> {
        let auth_server_url =
            auth_server_url.unwrap_or_else(|| DEFAULT_AUTH_SERVER_URL.to_string());
        let auth = resolve_credentials(username, password, &auth_server_url)?;
        Self::with_auth(auth, auth_server_url)
    }

    /// Authenticates with already resolved credentials.
    pub fn with_auth(auth: AuthData, auth_server_url: impl Into<String>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent())
                .unwrap_or(HeaderValue::from_static("cdseutils-rs")),
        );

        let http = HttpClient::builder()
            .default_headers(default_headers)
            .redirect(Policy::none())
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;

        let now = Utc::now();
        let token = Self {
            auth_server_url: auth_server_url.into(),
            auth,
            http,
            state: Mutex::new(TokenState {
                access_token: String::new(),
                refresh_token: String::new(),
                access_expires: now,
                refresh_expires: now,
            }),
        };

        {
            let mut state = token.lock()?;
            token.password_grant(&mut state)?;
        }
        Ok(token)
    }

    pub fn auth_server_url(&self) -> &str {
        &self.auth_server_url
    }

    pub fn username(&self) -> &str {
        &self.auth.username
    }

    /// Expiration instant of the current access token.
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        Ok(self.lock()?.access_expires)
    }

    /// Returns a valid access token, refreshing it if needed.
    pub fn get(&self) -> Result<String> {
        let mut state = self.lock()?;
        let now = Utc::now();

        if now < state.access_expires {
            return Ok(state.access_token.clone());
        }

        if now < state.refresh_expires {
            debug!("access token expired, refreshing");
            self.refresh_grant(&mut state)?;
        } else {
            debug!("refresh token expired, authenticating again");
            self.password_grant(&mut state)?;
        }
        Ok(state.access_token.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TokenState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("token state lock poisoned"))
    }

    fn password_grant(&self, state: &mut TokenState) -> Result<()> {
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "password"),
            ("username", self.auth.username.as_str()),
            ("password", self.auth.password.as_str()),
        ];
        self.request_token(&form, state)
    }

    fn refresh_grant(&self, state: &mut TokenState) -> Result<()> {
        let refresh_token = state.refresh_token.clone();
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        self.request_token(&form, state)
    }

    fn request_token(&self, form: &[(&str, &str)], state: &mut TokenState) -> Result<()> {
        let now = Utc::now();
        let auth_error = |reason: String| Error::Authentication {
            url: self.auth_server_url.clone(),
            reason,
        };

        let resp = self
            .http
            .post(&self.auth_server_url)
            .form(form)
            .send()
            .map_err(|e| auth_error(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(auth_error(format!("HTTP {}: {}", status.as_u16(), error_message(&text))).into());
        }

        let data: TokenResponse = serde_json::from_str(&text).with_context(|| {
            format!("failed to parse token response from {}", self.auth_server_url)
        })?;

        let access_expires = expiry(now, data.expires_in)
            .ok_or_else(|| auth_error(format!("invalid expires_in: {}", data.expires_in)))?;
        let refresh_expires = expiry(now, data.refresh_expires_in).ok_or_else(|| {
            auth_error(format!("invalid refresh_expires_in: {}", data.refresh_expires_in))
        })?;

        state.access_token = data.access_token;
        state.refresh_token = data.refresh_token;
        state.access_expires = access_expires;
        state.refresh_expires = refresh_expires;

        debug!(
            "obtained access token for {} valid until {}",
            self.auth.username, state.access_expires
        );
        Ok(())
    }
}

/// `now + lifetime - margin`, or `None` when out of range.
fn expiry(now: DateTime<Utc>, lifetime_secs: i64) -> Option<DateTime<Utc>> {
    let secs = lifetime_secs.checked_sub(EXPIRY_MARGIN_SECS)?;
    now.checked_add_signed(TimeDelta::try_seconds(secs)?)
}

/// Bearer token provider: either a fixed string or a managed [`CdseToken`].
#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    Managed(Arc<CdseToken>),
}

impl TokenSource {
    /// Current bearer token value.
    pub fn bearer(&self) -> Result<String> {
        match self {
            TokenSource::Static(s) => Ok(s.clone()),
            TokenSource::Managed(t) => t.get(),
        }
    }
}

impl From<String> for TokenSource {
    fn from(s: String) -> Self {
        TokenSource::Static(s)
    }
}

impl From<&str> for TokenSource {
    fn from(s: &str) -> Self {
        TokenSource::Static(s.to_string())
    }
}

impl From<CdseToken> for TokenSource {
    fn from(t: CdseToken) -> Self {
        TokenSource::Managed(Arc::new(t))
    }
}

impl From<Arc<CdseToken>> for TokenSource {
    fn from(t: Arc<CdseToken>) -> Self {
        TokenSource::Managed(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_applies_margin() {
        let now = Utc::now();
        assert_eq!(expiry(now, 600), Some(now + TimeDelta::seconds(599)));
        assert_eq!(expiry(now, 1), Some(now));
    }

    #[test]
    fn expiry_out_of_range() {
        let now = Utc::now();
        assert_eq!(expiry(now, i64::MAX), None);
        assert_eq!(expiry(now, i64::MIN), None);
    }
}
