use anyhow::anyhow;
use reqwest::StatusCode;
use reqwest::blocking::Response;
use std::path::PathBuf;

/// Failure kinds callers may want to tell apart.
///
/// Public operations return [`anyhow::Result`]; use
/// [`anyhow::Error::downcast_ref`] to recover one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to get credentials: {0}")]
    CredentialsNotFound(String),

    #[error("both username and password are needed")]
    IncompleteCredentials,

    #[error("'{0}' does not exist")]
    NetrcNotFound(PathBuf),

    #[error("malformed netrc file {path} (line {line}): {message}")]
    Netrc {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("unable to get the access token from {url}: {reason}")]
    Authentication { url: String, reason: String },

    #[error("invalid S3 credentials: {0}")]
    InvalidS3Credentials(&'static str),

    #[error("file or directory already exists: '{0}'")]
    FileExists(PathBuf),

    #[error(
        "no output file name specified and it is not possible to derive it from the response headers"
    )]
    MissingFilename,

    #[error("invalid bounding box: {0}")]
    InvalidBBox(String),
}

/// Error payloads seen across CDSE services.
///
/// The identity server (Keycloak) answers `{"error":..,"error_description":..}`,
/// OData and the S3 keys manager use `{"detail":..}` or `{"message":..}`.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ApiErrorResponse {
    #[serde(default)]
    pub(crate) error: Option<serde_json::Value>,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
    #[serde(default)]
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) detail: Option<serde_json::Value>,
}

impl ApiErrorResponse {
    fn summary(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(e) = &self.error {
            parts.push(value_text(e));
        }
        for s in [&self.error_description, &self.title, &self.message]
            .into_iter()
            .flatten()
        {
            parts.push(s.clone());
        }
        if let Some(d) = &self.detail {
            parts.push(value_text(d));
        }
        parts.retain(|p| !p.is_empty());
        parts.join(": ")
    }
}

fn value_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| v.to_string()),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extracts the human readable part of an error body.
pub(crate) fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(e) => {
            let s = e.summary();
            if s.is_empty() { body.trim().to_string() } else { s }
        }
        Err(_) => body.trim().to_string(),
    }
}

pub(crate) fn format_api_error(status: StatusCode, url: &str, body: &str) -> anyhow::Error {
    let message = error_message(body);

    if status == StatusCode::UNAUTHORIZED {
        return anyhow!(
            "CDSE authentication failed (HTTP {}).\n- Check the credentials in CDSE_USERNAME/CDSE_PASSWORD or in your netrc file\n- Ensure the access token is not expired\n\nServer message: {}\nrequest: {}",
            status.as_u16(),
            message,
            url
        );
    }

    if status == StatusCode::FORBIDDEN {
        return anyhow!(
            "CDSE denied access (HTTP 403).\n- The account may lack the rights for this product or service\n- S3 credentials are limited in number per user; delete unused ones\n\nServer message: {}\nrequest: {}",
            message,
            url
        );
    }

    if status == StatusCode::NOT_FOUND {
        return anyhow!(
            "CDSE resource not found (HTTP 404).\n- Check the product ID or the configured base URL\n\nServer message: {}\nrequest: {}",
            message,
            url
        );
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return anyhow!(
            "CDSE quota exceeded (HTTP 429); reduce the number of concurrent downloads and retry later.\n\nServer message: {}\nrequest: {}",
            message,
            url
        );
    }

    anyhow!(
        "API request failed: HTTP {} for url ({})\n{}",
        status.as_u16(),
        url,
        message
    )
}

/// Passes successful responses through, turns the others into formatted errors.
pub(crate) fn check_response(resp: Response) -> anyhow::Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let text = resp.text().unwrap_or_default();
    Err(format_api_error(status, &url, &text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycloak_error_body() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid user credentials"}"#;
        assert_eq!(error_message(body), "invalid_grant: Invalid user credentials");
    }

    #[test]
    fn odata_detail_object() {
        let body = r#"{"detail":{"message":"Product not found","request_id":"x"}}"#;
        assert_eq!(error_message(body), "Product not found");
    }

    #[test]
    fn non_json_body_is_kept() {
        assert_eq!(error_message("  bad gateway \n"), "bad gateway");
    }

    #[test]
    fn unauthorized_has_remediation() {
        let err = format_api_error(StatusCode::UNAUTHORIZED, "https://x/y", "{}");
        let s = err.to_string();
        assert!(s.contains("HTTP 401"));
        assert!(s.contains("CDSE_USERNAME"));
    }
}
