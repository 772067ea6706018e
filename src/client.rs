use anyhow::{Context, Result, anyhow, bail};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Response;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_RANGE, HeaderMap, HeaderValue, RANGE};
use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::thread;
use tracing::{debug, info, warn};

use crate::error::{Error, check_response};
use crate::odata::{CDSE_ODATA_BASE_URL, collections_from};
use crate::session::Session;
use crate::token::TokenSource;
use crate::util::{backoff, initial_sleep, partial_path};

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// What to do when the output file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    Overwrite,
    #[default]
    NoOverwrite,
    Raise,
}

impl SaveMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveMode::Overwrite => "OVERWRITE",
            SaveMode::NoOverwrite => "NO_OVERWRITE",
            SaveMode::Raise => "RAISE",
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaveMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "OVERWRITE" => Ok(SaveMode::Overwrite),
            "NO_OVERWRITE" => Ok(SaveMode::NoOverwrite),
            "RAISE" => Ok(SaveMode::Raise),
            other => bail!(
                "invalid save mode '{}' (expected OVERWRITE, NO_OVERWRITE or RAISE)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Output file name; derived from `Content-Disposition` when `None`.
    pub outfile: Option<PathBuf>,
    /// Directory `outfile` is relative to. Ignored for absolute `outfile`.
    pub outdir: Option<PathBuf>,
    pub chunk_size: usize,
    pub progress: bool,
    pub save_mode: SaveMode,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            outfile: None,
            outdir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress: true,
            save_mode: SaveMode::default(),
        }
    }
}

/// Result of a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    Downloaded(PathBuf),
    /// The file already existed and [`SaveMode::NoOverwrite`] was in effect.
    Skipped(PathBuf),
}

impl Download {
    pub fn path(&self) -> &Path {
        match self {
            Download::Downloaded(p) | Download::Skipped(p) => p,
        }
    }
}

/// OData client for the CDSE.
#[derive(Debug, Clone)]
pub struct ODataClient {
    base_url: String,
    session: Session,
}

impl ODataClient {
    pub fn new(token: Option<TokenSource>) -> Result<Self> {
        Ok(Self {
            base_url: CDSE_ODATA_BASE_URL.to_string(),
            session: Session::cdse(token)?,
        })
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            base_url: CDSE_ODATA_BASE_URL.to_string(),
            session,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Names of the collections available through the OData API.
    pub fn collections(&self) -> Result<Vec<String>> {
        collections_from(&self.session, &self.base_url)
    }

    /// URL of the `$value` (download) resource of a product.
    pub fn product_url(&self, product_id: &str) -> String {
        format!(
            "{}/Products({})/$value",
            self.base_url.trim_end_matches('/'),
            product_id.trim()
        )
    }

    pub fn download_product(&self, product_id: &str, options: &DownloadOptions) -> Result<Download> {
        self.download(&self.product_url(product_id), options)
    }

    /// Downloads each distinct product once, in the order given.
    pub fn download_products<I, S>(&self, product_ids: I, options: &DownloadOptions) -> Result<Vec<Download>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let ids: Vec<String> = product_ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        if ids.len() > 1 && options.outfile.is_some() {
            bail!("an output file name cannot be used when downloading more than one product");
        }

        ids.iter()
            .map(|id| {
                self.download_product(id, options)
                    .with_context(|| format!("failed to download product {}", id))
            })
            .collect()
    }

    /// Downloads the file at `url`.
    ///
    /// Data is written to `<target>.part` and renamed once complete; an
    /// existing partial file is resumed with a `Range` request.
    pub fn download(&self, url: &str, options: &DownloadOptions) -> Result<Download> {
        if options.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }

        let mut target = match &options.outfile {
            Some(outfile) => {
                let path = new_path(outfile, options.outdir.as_deref(), options.save_mode)?;
                if path.exists() && options.save_mode == SaveMode::NoOverwrite {
                    info!("file '{}' already exists, skip download", path.display());
                    return Ok(Download::Skipped(path));
                }
                Some(path)
            }
            None => None,
        };

        let retry_max = self.session.retry_max();
        let mut sleep = initial_sleep(self.session.sleep_max());
        let mut tries = 0usize;

        loop {
            let resume_from = target.as_deref().and_then(partial_len);

            let mut headers = HeaderMap::new();
            if let Some(from) = resume_from {
                headers.insert(RANGE, HeaderValue::from_str(&format!("bytes={}-", from))?);
            }

            let resp = self.session.get_with_headers(url, &headers)?;

            if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                if let (Some(from), Some(path)) = (resume_from, target.as_deref()) {
                    let part = partial_path(path);
                    if content_range_total(resp.headers()) == Some(from) {
                        std::fs::rename(&part, path)
                            .with_context(|| format!("failed to move download to {}", path.display()))?;
                        info!("downloaded '{}'", path.display());
                        return Ok(Download::Downloaded(path.to_path_buf()));
                    }
                    warn!("discarding stale partial download {}", part.display());
                    std::fs::remove_file(&part)
                        .with_context(|| format!("failed to remove {}", part.display()))?;
                    continue;
                }
            }

            let resp = check_response(resp)?;
            let status = resp.status();
            if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
                bail!("Failed to download file. Status code: {}", status.as_u16());
            }

            let path = match &target {
                Some(p) => p.clone(),
                None => {
                    let name = filename_from_headers(resp.headers())?;
                    let path = new_path(Path::new(&name), options.outdir.as_deref(), options.save_mode)?;
                    if path.exists() && options.save_mode == SaveMode::NoOverwrite {
                        info!("file '{}' already exists, skip download", path.display());
                        return Ok(Download::Skipped(path));
                    }
                    target = Some(path.clone());
                    if resume_from.is_none() && partial_len(&path).is_some() {
                        debug!("resuming partial download of {}", path.display());
                        continue;
                    }
                    path
                }
            };

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create directory {}", parent.display()))?;
                }
            }

            let offset = match (status, resume_from) {
                (StatusCode::PARTIAL_CONTENT, Some(from)) => from,
                _ => 0,
            };

            match write_body(resp, &path, offset, options) {
                Ok(()) => {
                    std::fs::rename(partial_path(&path), &path)
                        .with_context(|| format!("failed to move download to {}", path.display()))?;
                    info!("downloaded '{}'", path.display());
                    return Ok(Download::Downloaded(path));
                }
                Err(e) => {
                    tries += 1;
                    if tries >= retry_max {
                        return Err(e.context(format!("download of {} failed", url)));
                    }
                    warn!("download interrupted ({:#}), resuming in {:?}", e, sleep);
                    thread::sleep(sleep);
                    sleep = backoff(sleep, self.session.sleep_max());
                }
            }
        }
    }
}

/// Size of a non-empty `<path>.part`.
fn partial_len(path: &Path) -> Option<u64> {
    std::fs::metadata(partial_path(path))
        .ok()
        .map(|m| m.len())
        .filter(|&n| n > 0)
}

/// Complete length from a `Content-Range: bytes */<length>` header.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes")?;
    rest.rsplit('/').next()?.trim().parse().ok()
}

/// Streams `resp` into `<path>.part`, appending after `offset` bytes.
fn write_body(mut resp: Response, path: &Path, offset: u64, options: &DownloadOptions) -> Result<()> {
    let part = partial_path(path);
    let append = offset > 0;
    let expected = resp.content_length().map(|n| n + offset);

    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&part)
        .with_context(|| format!("failed to open {}", part.display()))?;

    let pb = if options.progress {
        let pb = ProgressBar::new(expected.unwrap_or(0));
        pb.set_style(
            ProgressStyle::with_template(
                "{msg} {spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
            )
            .map(|s| s.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        if let Some(name) = path.file_name() {
            pb.set_message(name.to_string_lossy().into_owned());
        }
        pb.set_position(offset);
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut written = offset;
    let mut buf = vec![0u8; options.chunk_size];
    loop {
        let n = resp.read(&mut buf).context("download interrupted")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
        pb.inc(n as u64);
    }
    out.flush()?;

    if let Some(expected) = expected {
        if written < expected {
            pb.abandon();
            return Err(anyhow!(
                "incomplete download: {} byte(s) out of {}",
                written,
                expected
            ));
        }
    }
    pb.finish_and_clear();
    debug!("wrote {} byte(s) to {}", written, part.display());
    Ok(())
}

static CONTENT_DISPOSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)attachment;\s*filename\s*=\s*(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<bare>[^;\s]+))"#)
        .expect("valid regex")
});

/// Output file name advertised by the server.
pub fn filename_from_headers(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(CONTENT_DISPOSITION)
        .ok_or(Error::MissingFilename)?
        .to_str()
        .map_err(|_| Error::MissingFilename)?;

    let caps = CONTENT_DISPOSITION_RE
        .captures(value)
        .ok_or(Error::MissingFilename)?;
    let raw = caps
        .name("dq")
        .or_else(|| caps.name("sq"))
        .or_else(|| caps.name("bare"))
        .map(|m| m.as_str())
        .unwrap_or("");

    // Never let the server choose the directory.
    let name = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::MissingFilename.into());
    }
    Ok(name.to_string())
}

/// Output path for `outfile`, optionally below `outdir`.
pub fn new_path(outfile: &Path, outdir: Option<&Path>, save_mode: SaveMode) -> Result<PathBuf> {
    let path = match outdir {
        Some(outdir) => {
            if outfile.is_absolute() {
                warn!(
                    "an absolute path has been provided as input ('{}'), the 'outdir' parameter ('{}') will be ignored",
                    outfile.display(),
                    outdir.display()
                );
                outfile.to_path_buf()
            } else {
                outdir.join(outfile)
            }
        }
        None => outfile.to_path_buf(),
    };

    if path.exists() && save_mode == SaveMode::Raise {
        return Err(Error::FileExists(path).into());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disposition(v: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_DISPOSITION, HeaderValue::from_str(v).unwrap());
        h
    }

    #[test]
    fn filename_variants() {
        let cases = [
            ("attachment; filename=\"S1A_IW_SLC.zip\"", "S1A_IW_SLC.zip"),
            ("attachment; filename='S2B.SAFE.zip'", "S2B.SAFE.zip"),
            ("attachment;filename=DEM.tif", "DEM.tif"),
            ("attachment; filename=a.zip; size=10", "a.zip"),
            ("attachment; filename=\"../../etc/passwd\"", "passwd"),
        ];
        for (header, want) in cases {
            assert_eq!(filename_from_headers(&disposition(header)).unwrap(), want, "{header}");
        }
    }

    #[test]
    fn filename_missing_or_unusable() {
        for h in [HeaderMap::new(), disposition("inline"), disposition("attachment; filename=\"..\"")] {
            let err = filename_from_headers(&h).unwrap_err();
            assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingFilename)));
        }
    }

    #[test]
    fn unsatisfied_range_length() {
        let mut h = HeaderMap::new();
        assert_eq!(content_range_total(&h), None);
        h.insert(CONTENT_RANGE, HeaderValue::from_static("bytes */7"));
        assert_eq!(content_range_total(&h), Some(7));
        h.insert(CONTENT_RANGE, HeaderValue::from_static("bytes */*"));
        assert_eq!(content_range_total(&h), None);
    }

    #[test]
    fn save_mode_strings() {
        for m in [SaveMode::Overwrite, SaveMode::NoOverwrite, SaveMode::Raise] {
            assert_eq!(m.to_string().parse::<SaveMode>().unwrap(), m);
        }
        assert_eq!("no-overwrite".parse::<SaveMode>().unwrap(), SaveMode::NoOverwrite);
        assert!("sometimes".parse::<SaveMode>().is_err());
    }

    #[test]
    fn outdir_join_and_absolute_outfile() {
        let p = new_path(Path::new("a.zip"), Some(Path::new("out")), SaveMode::Raise).unwrap();
        assert_eq!(p, PathBuf::from("out/a.zip"));

        let abs = std::env::temp_dir().join("cdseutils-nonexistent-file.zip");
        let p = new_path(&abs, Some(Path::new("out")), SaveMode::Raise).unwrap();
        assert_eq!(p, abs);
    }

    #[test]
    fn product_url_format() {
        let c = ODataClient::new(None).unwrap().with_base_url("https://h.example/odata/v1/");
        assert_eq!(
            c.product_url(" 0a1b-2c "),
            "https://h.example/odata/v1/Products(0a1b-2c)/$value"
        );
    }
}
