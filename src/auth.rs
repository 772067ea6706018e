//! Credentials discovery.
//!
//! Credentials are looked up, in order, from explicit arguments, from the
//! `CDSE_USERNAME` / `CDSE_PASSWORD` environment variables and finally from
//! a netrc file (see [`auth_from_netrc`]).

use std::fmt;
use std::path::Path;

use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::netrc::{Netrc, netrc_path};

/// Username and password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthData {
    pub username: String,
    pub password: String,
}

impl AuthData {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for AuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthData")
            .field("username", &self.username)
            .field("password", &"*****")
            .finish()
    }
}

/// Environment variable prefix used for CDSE credentials.
pub const CDSE_ENV_PREFIX: &str = "CDSE";

/// Gets credentials from the `<PREFIX>_USERNAME` and `<PREFIX>_PASSWORD`
/// environment variables (`USERNAME` / `PASSWORD` with an empty prefix).
///
/// A trailing underscore in `app_prefix` is optional: `"APP"` and `"APP_"`
/// both inspect `APP_USERNAME` and `APP_PASSWORD`.
pub fn auth_from_env(
    default_username: Option<&str>,
    default_password: Option<&str>,
    app_prefix: &str,
) -> Result<AuthData, Error> {
    auth_from_vars(
        |key| std::env::var(key).ok(),
        default_username,
        default_password,
        app_prefix,
    )
}

pub(crate) fn auth_from_vars<F>(
    lookup: F,
    default_username: Option<&str>,
    default_password: Option<&str>,
    app_prefix: &str,
) -> Result<AuthData, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let (username_key, password_key) = env_keys(app_prefix);

    let username = lookup(&username_key).or_else(|| default_username.map(str::to_string));
    let password = lookup(&password_key).or_else(|| default_password.map(str::to_string));

    match (username, password) {
        (Some(username), Some(password)) => Ok(AuthData { username, password }),
        _ => Err(Error::CredentialsNotFound(format!(
            "unable to retrieve username and password from environment variables ({}, {})",
            username_key, password_key
        ))),
    }
}

fn env_keys(app_prefix: &str) -> (String, String) {
    let prefix = app_prefix.trim_end_matches('_');
    if prefix.is_empty() {
        ("USERNAME".to_string(), "PASSWORD".to_string())
    } else {
        (format!("{}_USERNAME", prefix), format!("{}_PASSWORD", prefix))
    }
}

/// Retrieves the credentials for `url` from a netrc file.
///
/// The file is `netrc_path` if given, else the content of `NETRCFILE`,
/// else `~/.netrc`. The full `url` is tried as machine name first, then its
/// host name, then the `default` block.
pub fn auth_from_netrc(url: &str, netrc_path: Option<&Path>) -> anyhow::Result<AuthData> {
    let path = self::netrc_path_or_err(netrc_path)?;
    if !path.is_file() {
        return Err(Error::NetrcNotFound(path).into());
    }

    let db = Netrc::load(&path)?;
    Ok(lookup_netrc(&db, url)?)
}

fn netrc_path_or_err(explicit: Option<&Path>) -> Result<std::path::PathBuf, Error> {
    netrc_path(explicit).ok_or_else(|| {
        Error::CredentialsNotFound("unable to locate the netrc file (no home directory)".into())
    })
}

pub(crate) fn lookup_netrc(db: &Netrc, url: &str) -> Result<AuthData, Error> {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));

    let entry = db
        .machine(url)
        .or_else(|| db.authenticators(host.as_deref().unwrap_or(url)));

    match entry {
        Some(e) => Ok(AuthData::new(e.login.clone(), e.password.clone())),
        None => Err(Error::CredentialsNotFound(format!(
            "unable to get authentication credential for {}",
            url
        ))),
    }
}

/// Resolves credentials for the CDSE identity server at `auth_server_url`.
///
/// Both `username` and `password` must be given, or neither; in the latter
/// case the environment is tried first and the netrc file second.
pub fn resolve_credentials(
    username: Option<String>,
    password: Option<String>,
    auth_server_url: &str,
) -> anyhow::Result<AuthData> {
    match (username, password) {
        (Some(username), Some(password)) => Ok(AuthData { username, password }),
        (None, None) => match auth_from_env(None, None, CDSE_ENV_PREFIX) {
            Ok(auth) => {
                debug!("using credentials from the environment");
                Ok(auth)
            }
            Err(Error::CredentialsNotFound(_)) => {
                debug!("no credentials in the environment, trying netrc");
                auth_from_netrc(auth_server_url, None)
            }
            Err(e) => Err(e.into()),
        },
        _ => Err(Error::IncompleteCredentials.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn prefixed_variables() {
        let env = vars(&[("CDSE_USERNAME", "alice"), ("CDSE_PASSWORD", "pw")]);
        let a = auth_from_vars(&env, None, None, "CDSE").unwrap();
        assert_eq!(a, AuthData::new("alice", "pw"));
        let b = auth_from_vars(&env, None, None, "CDSE_").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_prefix_and_defaults() {
        let env = vars(&[("USERNAME", "bob")]);
        let a = auth_from_vars(&env, None, Some("fallback"), "").unwrap();
        assert_eq!(a, AuthData::new("bob", "fallback"));
    }

    #[test]
    fn missing_password_is_an_error() {
        let env = vars(&[("APP_USERNAME", "bob")]);
        let err = auth_from_vars(&env, None, None, "APP").unwrap_err();
        assert!(matches!(err, Error::CredentialsNotFound(_)));
        assert!(err.to_string().contains("APP_PASSWORD"));
    }

    #[test]
    fn debug_masks_password() {
        let s = format!("{:?}", AuthData::new("alice", "hunter2"));
        assert!(s.contains("alice"));
        assert!(!s.contains("hunter2"));
    }

    #[test]
    fn netrc_lookup_order() {
        let db = Netrc::parse(
            "machine https://h.example/token login full password 1\n\
             machine h.example login host password 2\n",
            Path::new("n"),
        )
        .unwrap();
        assert_eq!(
            lookup_netrc(&db, "https://h.example/token").unwrap().username,
            "full"
        );
        assert_eq!(
            lookup_netrc(&db, "https://h.example/other").unwrap().username,
            "host"
        );
        assert!(matches!(
            lookup_netrc(&db, "https://unknown.example/"),
            Err(Error::CredentialsNotFound(_))
        ));
    }

    #[test]
    fn netrc_default_block_is_the_fallback() {
        let db = Netrc::parse(
            "machine h.example login host password 2
default login anon password guest
",
            Path::new("n"),
        )
        .unwrap();
        assert_eq!(lookup_netrc(&db, "https://h.example/x").unwrap().username, "host");
        assert_eq!(lookup_netrc(&db, "https://other.example/").unwrap().username, "anon");
        assert_eq!(lookup_netrc(&db, "not a url").unwrap().username, "anon");
    }

    #[test]
    fn only_one_of_username_password() {
        let err = resolve_credentials(Some("u".into()), None, "https://x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::IncompleteCredentials)
        ));
    }
}
