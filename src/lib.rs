//! Utilities for the Copernicus Data Space Ecosystem (CDSE).
//!
//! The crate covers the plumbing needed to fetch Sentinel products from the
//! CDSE: credentials discovery, access token management, an HTTP session that
//! keeps authentication across redirects between CDSE hosts, temporary S3
//! credentials and an OData download client.
//!
//! ## Quick start
//! - Provide credentials via `CDSE_USERNAME` / `CDSE_PASSWORD` or a netrc
//!   entry for `identity.dataspace.copernicus.eu`.
//! - Create a [`CdseToken`] and pass it to an [`ODataClient`].
//!
//! ```no_run
//! use anyhow::Result;
//! use cdseutils::{CdseToken, DownloadOptions, ODataClient};
//!
//! fn main() -> Result<()> {
//!     let token = CdseToken::from_env()?;
//!     let client = ODataClient::new(Some(token.into()))?;
//!     let options = DownloadOptions {
//!         outdir: Some("products".into()),
//!         ..DownloadOptions::default()
//!     };
//!     client.download_product("a1b2c3d4-0000-0000-0000-000000000000", &options)?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

mod auth;
mod client;
mod error;
mod geo;
mod netrc;
mod odata;
mod s3;
mod session;
mod token;
mod util;

pub use auth::{AuthData, CDSE_ENV_PREFIX, auth_from_env, auth_from_netrc, resolve_credentials};
pub use client::{
    DEFAULT_CHUNK_SIZE, Download, DownloadOptions, ODataClient, SaveMode, filename_from_headers,
    new_path,
};
pub use error::Error;
pub use geo::{BBox, Dms, deg2dms, dms2deg};
pub use netrc::{Netrc, NetrcEntry};
pub use odata::{CDSE_ODATA_BASE_URL, collections};
pub use s3::{CDSE_S3_ENDPOINT_URL, DEFAULT_S3_KEY_SERVER_URL, S3Credentials};
pub use session::{CDSE_TRUSTED_DOMAINS, Session, should_strip_auth};
pub use token::{CdseToken, DEFAULT_AUTH_SERVER_URL, TokenSource};
