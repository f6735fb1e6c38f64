use anyhow::Result;
use ctfify::adapters::http::BaseApi;
use ctfify::adapters::sqli::{Indicator, SqlLikeOracle};
use ctfify::core::blind::{BlindExtractor, RetryPolicy};
use ctfify::{CtfError, SolverConfig};
use httpmock::prelude::*;
use reqwest::Method;
use std::time::Duration;

#[tokio::test]
async fn test_base_api_sends_default_headers() -> Result<()> {
    let server = MockServer::start();
    let flag_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/admin/flag")
            .header("x-forwarded-for", "127.0.0.1");
        then.status(200).body("flag{local_only}");
    });

    let api = BaseApi::builder(server.base_url())
        .header("X-Forwarded-For", "127.0.0.1")
        .build()?;
    let body = api.get("/admin/flag").await?.text().await?;

    flag_mock.assert();
    assert_eq!(body, "flag{local_only}");
    Ok(())
}

#[tokio::test]
async fn test_base_api_keeps_session_cookie() -> Result<()> {
    let server = MockServer::start();
    let login_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/login")
            .x_www_form_urlencoded_tuple("username", "admin");
        then.status(200)
            .header("Set-Cookie", "session=s3cr3t; Path=/")
            .body("ok");
    });
    let me_mock = server.mock(|when, then| {
        when.method(GET).path("/me").header("cookie", "session=s3cr3t");
        then.status(200).body("hello admin");
    });

    let api = BaseApi::new(&server.base_url())?;
    api.post_form("login", &[("username", "admin")]).await?;
    let body = api.get("me").await?.text().await?;

    login_mock.assert();
    me_mock.assert();
    assert_eq!(body, "hello admin");
    Ok(())
}

#[tokio::test]
async fn test_raw_request_after_login_keeps_session() -> Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/login");
        then.status(200)
            .header("Set-Cookie", "session=s3cr3t; Path=/")
            .body("ok");
    });

    let api = BaseApi::new(&server.base_url())?;
    api.post_form("login", &[("username", "admin")]).await?;

    let raw = String::from_utf8(api.make_raw_request(Method::GET, "/me", |builder| builder)?)?;
    assert!(raw.starts_with("GET /me HTTP/1.1\r\n"));
    assert!(raw.contains("cookie: session=s3cr3t\r\n"));
    Ok(())
}

#[tokio::test]
async fn test_make_raw_request_matches_target() -> Result<()> {
    let server = MockServer::start();
    let api = BaseApi::builder(server.base_url())
        .header("X-Debug", "1")
        .build()?;

    let raw = api.make_raw_request(Method::POST, "/login", |builder| {
        builder.form(&[("username", "admin"), ("password", "x")])
    })?;
    let text = String::from_utf8(raw)?;

    assert!(text.starts_with("POST /login HTTP/1.1\r\n"));
    assert!(text.contains(&format!("host: 127.0.0.1:{}\r\n", server.port())));
    assert!(text.contains("x-debug: 1\r\n"));
    assert!(text.contains("content-length: 25\r\n"));
    assert!(text.ends_with("\r\n\r\nusername=admin&password=x"));
    Ok(())
}

/// 模擬 LIKE 前綴盲注：只有 password 是秘密前綴時回 Welcome
fn mock_prefixes(server: &MockServer, prefixes: &[&str]) {
    for prefix in prefixes {
        server.mock(|when, then| {
            when.method(POST)
                .path("/")
                .x_www_form_urlencoded_tuple("password", *prefix);
            then.status(200).body("Welcome back");
        });
    }
}

#[tokio::test]
async fn test_blind_extraction_against_login_form() -> Result<()> {
    let server = MockServer::start();
    mock_prefixes(&server, &["f", "fl", "fla", "flag"]);

    let api = BaseApi::new(&server.base_url())?;
    let oracle = SqlLikeOracle::new(
        api,
        "/",
        "{known}",
        Indicator::Present("Welcome".to_string()),
    )
    .with_field("username", "admin")
    .with_field("password", "{payload}");

    let extractor = BlindExtractor::new(oracle)
        .with_charset("abfgl".chars())
        .with_concurrency(4);
    let values = extractor.extract("").await?;

    assert_eq!(values, vec!["flag".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_blind_extraction_finds_branching_values() -> Result<()> {
    let server = MockServer::start();
    mock_prefixes(&server, &["a", "ab", "ac", "acd"]);

    let api = BaseApi::new(&server.base_url())?;
    let oracle = SqlLikeOracle::new(api, "/", "{known}", Indicator::Present("Welcome".to_string()))
        .with_field("password", "{payload}");
    let values = BlindExtractor::new(oracle)
        .with_charset("abcd".chars())
        .extract("")
        .await?;

    assert_eq!(values, vec!["ab".to_string(), "acd".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_blind_extraction_from_solver_profile() -> Result<()> {
    let server = MockServer::start();
    mock_prefixes(&server, &["ad", "adm", "admi", "admin"]);

    let config = SolverConfig::from_toml_str(&format!(
        r#"
[target]
url = "{}"
timeout_seconds = 5

[blind]
path = "/"
payload = "{{known}}"
fields = {{ password = "{{payload}}" }}
hit_marker = "Welcome"
charset = "adimn"
known = "a"
concurrency = 2
"#,
        server.base_url()
    ))?;
    config.validate_config()?;

    let values = config.build_extractor()?.extract("a").await?;
    assert_eq!(values, vec!["admin".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_bounded_retry_gives_up_on_dead_target() -> Result<()> {
    // 沒有服務在聽的 port
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let api = BaseApi::builder(format!("127.0.0.1:{}", port))
        .timeout(Duration::from_secs(2))
        .build()?;
    let oracle = SqlLikeOracle::new(api, "/", "{known}", Indicator::Present("Welcome".to_string()))
        .with_field("password", "{payload}");
    let extractor = BlindExtractor::new(oracle)
        .with_charset("a".chars())
        .with_retry(RetryPolicy::bounded(2, Duration::from_millis(1)));

    let err = extractor.extract("").await.unwrap_err();
    assert!(matches!(err, CtfError::HttpError(_)));
    assert!(err.is_retryable());
    Ok(())
}
