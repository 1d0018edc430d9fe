//! Shared HTTP plumbing for the literature sources.
//!
//! Searches are best-effort: a non-success status becomes an error the
//! multi-source search downgrades to a warning. HTTP 429 is retried only when
//! `max_retries` is non-zero.

use crate::config::HttpSettings;
use crate::error::{Result, SysrevError};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::warn;

/// Build a client with the configured timeout, user agent and proxy
pub fn build_client(settings: &HttpSettings, user_agent: &str) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(settings.timeout)
        .cookie_store(true);

    if let Some(proxy_url) = settings.proxy.as_deref() {
        check_proxy_url(proxy_url)?;
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
            SysrevError::Config(format!("Invalid proxy URL '{}': {}", proxy_url, e))
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| SysrevError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Schemes reqwest can actually tunnel through
const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

/// reqwest accepts any URL at build time, so reject unusable ones up front
fn check_proxy_url(proxy_url: &str) -> Result<()> {
    let parsed = url::Url::parse(proxy_url)
        .map_err(|e| SysrevError::Config(format!("Invalid proxy URL '{}': {}", proxy_url, e)))?;
    if !PROXY_SCHEMES.contains(&parsed.scheme()) {
        return Err(SysrevError::Config(format!(
            "Unsupported proxy scheme '{}' in '{}'",
            parsed.scheme(),
            proxy_url
        )));
    }
    if parsed.host_str().unwrap_or_default().is_empty() {
        return Err(SysrevError::Config(format!("Proxy URL '{}' has no host", proxy_url)));
    }
    Ok(())
}

/// Default polite user agent
pub fn polite_user_agent(mailto: &str) -> String {
    format!("sysrev/{} (mailto:{})", env!("CARGO_PKG_VERSION"), mailto)
}

/// Send a request and return the body text.
///
/// `make_request` is called once per attempt since a `RequestBuilder` is
/// consumed by `send`.
pub async fn fetch_text<F>(make_request: F, max_retries: u32, api: &str) -> Result<String>
where
    F: Fn() -> RequestBuilder,
{
    let mut retries = 0;

    loop {
        let response = make_request().send().await?;
        let status = response.status();

        if status.is_success() {
            return response.text().await.map_err(SysrevError::Network);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            if retries < max_retries {
                let backoff = Duration::from_secs(2u64.pow(retries));
                warn!(
                    api = api,
                    retries = retries,
                    backoff_secs = backoff.as_secs(),
                    "Rate limited, backing off"
                );
                tokio::time::sleep(backoff).await;
                retries += 1;
                continue;
            }
            return Err(SysrevError::RateLimited(60));
        }

        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(200).collect();
        return Err(SysrevError::Api {
            code: status.as_u16() as i32,
            message: format!("{} error: {} {}", api, status, preview.trim()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polite_user_agent() {
        let ua = polite_user_agent("me@lab.org");
        assert!(ua.starts_with("sysrev/"));
        assert!(ua.ends_with("(mailto:me@lab.org)"));
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let settings = HttpSettings {
            proxy: Some("ftp://proxy.local:21".to_string()),
            ..Default::default()
        };
        let err = build_client(&settings, "test").expect_err("should fail");
        assert!(matches!(err, SysrevError::Config(_)));
    }

    #[test]
    fn test_proxy_url_schemes() {
        assert!(check_proxy_url("http://127.0.0.1:7890").is_ok());
        assert!(check_proxy_url("socks5h://proxy.local:1080").is_ok());
        assert!(check_proxy_url("not a url").is_err());
        assert!(check_proxy_url("ftp://proxy.local:21").is_err());

        let settings = HttpSettings {
            proxy: Some("http://127.0.0.1:7890".to_string()),
            ..Default::default()
        };
        assert!(build_client(&settings, "test").is_ok());
    }

    #[tokio::test]
    async fn test_fetch_text_error_statuses() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = Client::new();
        let limited = format!("{}/limited", server.uri());
        let err = fetch_text(|| client.get(&limited), 0, "Test API")
            .await
            .expect_err("429 without retries");
        assert!(matches!(err, SysrevError::RateLimited(_)));

        let broken = format!("{}/broken", server.uri());
        match fetch_text(|| client.get(&broken), 2, "Test API").await {
            Err(SysrevError::Api { code, message }) => {
                assert_eq!(code, 503);
                assert!(message.contains("maintenance"));
            }
            other => panic!("expected Api error, got {:?}", other.map(|_| ())),
        }
    }
}
