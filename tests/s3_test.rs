use anyhow::Result;
use cdseutils::{Error, S3Credentials};
use httpmock::prelude::*;
use serde_json::json;

fn create_mock<'a>(server: &'a MockServer, expiration: &str) -> httpmock::Mock<'a> {
    let expiration = expiration.to_string();
    server.mock(move |when, then| {
        when.method(POST)
            .path("/api/user/credentials")
            .header("authorization", "Bearer tok")
            .header("accept", "application/json");
        then.status(200).json_body(json!({
            "access_id": "AKID",
            "secret": "SECRET",
            "expiration_date": expiration
        }));
    })
}

fn delete_mock(server: &MockServer, status: u16) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(DELETE)
            .path("/api/user/credentials/access_id/AKID")
            .header("authorization", "Bearer tok");
        then.status(status);
    })
}

#[test]
fn credentials_are_deleted_on_drop() -> Result<()> {
    let server = MockServer::start();
    let create = create_mock(&server, "2999-01-01T00:00:00");
    let delete = delete_mock(&server, 204);

    {
        let creds = S3Credentials::with_key_server("tok", server.url("/api/user/credentials"))?;
        assert!(creds.is_valid());
        assert_eq!(creds.access_id(), "AKID");
        assert_eq!(creds.secret(), "SECRET");
        let auth = creds.get()?;
        assert_eq!(auth.username, "AKID");
        assert_eq!(auth.password, "SECRET");
        delete.assert_hits(0);
    }

    create.assert_hits(1);
    delete.assert_hits(1);
    Ok(())
}

#[test]
fn explicit_delete_happens_once() -> Result<()> {
    let server = MockServer::start();
    create_mock(&server, "2999-01-01T00:00:00Z");
    let delete = delete_mock(&server, 204);

    let creds = S3Credentials::with_key_server("tok", server.url("/api/user/credentials"))?;
    creds.delete()?;

    delete.assert_hits(1);
    Ok(())
}

#[test]
fn persisted_credentials_are_kept() -> Result<()> {
    let server = MockServer::start();
    create_mock(&server, "2999-01-01T00:00:00");
    let delete = delete_mock(&server, 204);

    let creds = S3Credentials::with_key_server("tok", server.url("/api/user/credentials"))?;
    let auth = creds.persist();
    assert_eq!(auth.username, "AKID");

    delete.assert_hits(0);
    Ok(())
}

#[test]
fn expired_credentials_are_invalid() -> Result<()> {
    let server = MockServer::start();
    create_mock(&server, "2000-01-01T00:00:00");
    delete_mock(&server, 204);

    let creds = S3Credentials::with_key_server("tok", server.url("/api/user/credentials"))?;
    assert!(!creds.is_valid());
    let err = creds.get().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidS3Credentials(_))
    ));
    Ok(())
}

#[test]
fn failed_delete_is_reported() -> Result<()> {
    let server = MockServer::start();
    create_mock(&server, "2999-01-01T00:00:00");
    let delete = delete_mock(&server, 404);

    let creds = S3Credentials::with_key_server("tok", server.url("/api/user/credentials"))?;
    let err = creds.delete().unwrap_err();
    assert!(err.to_string().contains("404"));
    delete.assert_hits(1);

    // Dropping only logs the failure.
    let creds = S3Credentials::with_key_server("tok", server.url("/api/user/credentials"))?;
    drop(creds);
    delete.assert_hits(2);
    Ok(())
}

#[test]
fn key_server_rejection() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/user/credentials");
        then.status(403).json_body(json!({"detail": "Max number of credentials reached."}));
    });

    let err = S3Credentials::with_key_server("tok", server.url("/api/user/credentials")).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("HTTP 403"));
    assert!(msg.contains("Max number of credentials reached."));
}
