use anyhow::{Context, Result};
use serde_json::Value;

use crate::error::check_response;
use crate::session::Session;

pub const CDSE_ODATA_BASE_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1";

/// Lists the collections available on the CDSE via the OData API.
///
/// No authentication is needed for this endpoint.
pub fn collections() -> Result<Vec<String>> {
    let session = Session::cdse(None)?;
    collections_from(&session, CDSE_ODATA_BASE_URL)
}

pub(crate) fn collections_from(session: &Session, base_url: &str) -> Result<Vec<String>> {
    let url = format!("{}/Attributes", base_url.trim_end_matches('/'));
    let resp = check_response(session.get(&url)?)?;
    let data: Value = resp
        .json()
        .with_context(|| format!("failed to parse API JSON (url={})", url))?;
    collection_names(&data).with_context(|| format!("unexpected reply from {}", url))
}

fn collection_names(data: &Value) -> Result<Vec<String>> {
    match data {
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        other => anyhow::bail!("expected a JSON object, got {}", kind(other)),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_of_attributes_object() {
        let data = json!({"SENTINEL-1": [], "SENTINEL-2": [{"Name": "cloudCover"}]});
        assert_eq!(
            collection_names(&data).unwrap(),
            vec!["SENTINEL-1".to_string(), "SENTINEL-2".to_string()]
        );
    }

    #[test]
    fn array_reply_is_rejected() {
        let err = collection_names(&json!(["SENTINEL-1"])).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }
}
