use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504 | 429 | 408)
}

pub(crate) fn backoff(current: Duration, max: Duration) -> Duration {
    let next = Duration::from_secs_f64((current.as_secs_f64() * 1.5).max(1.0));
    if next > max { max } else { next }
}

/// First retry delay: one second, capped by `max`.
pub(crate) fn initial_sleep(max: Duration) -> Duration {
    Duration::from_secs(1).min(max)
}

/// `<path>.part`, where an in-progress download is written.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

pub(crate) fn user_agent() -> String {
    format!("cdseutils-rs/{}", env!("CARGO_PKG_VERSION"))
}
