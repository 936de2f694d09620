use std::time::Duration;

use harvest_core::error::AppError;
use harvest_core::traits::Fetcher;
use reqwest::{Client, StatusCode};
use url::Url;

/// Desktop Chrome user agent; several platforms serve stripped pages to
/// unknown clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

/// HTTP fetcher using reqwest.
///
/// Maps responses onto the error taxonomy the retry layer understands:
/// 429 is a rate limit, 408 and 5xx are transient, other 4xx are permanent.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self { client, timeout })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let target = validate_url(url)?;

        let response = self.client.get(target).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))
    }
}

fn status_error(status: StatusCode, url: &str) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AppError::RateLimitExceeded;
    }
    AppError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

/// Only absolute http(s) URLs are fetchable. Anything else is a bad input
/// row, not a transient failure.
pub fn validate_url(url: &str) -> Result<Url, AppError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidItem("empty URL".into()));
    }
    let parsed =
        Url::parse(trimmed).map_err(|e| AppError::InvalidItem(format!("invalid URL {trimmed}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidItem(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(AppError::InvalidItem(format!("URL has no host: {trimmed}")));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "https://a.com"),
            AppError::RateLimitExceeded
        ));

        let server = status_error(StatusCode::BAD_GATEWAY, "https://a.com");
        assert!(server.is_retryable());

        let gone = status_error(StatusCode::NOT_FOUND, "https://a.com");
        assert!(!gone.is_retryable());
        assert_eq!(gone.to_string(), "HTTP 404 for https://a.com");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://www.youtube.com/watch?v=x").is_ok());
        assert!(validate_url("  http://example.com  ").is_ok());
        assert!(matches!(validate_url(""), Err(AppError::InvalidItem(_))));
        assert!(matches!(validate_url("   "), Err(AppError::InvalidItem(_))));
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(AppError::InvalidItem(_))
        ));
        assert!(matches!(
            validate_url("youtube.com/watch"),
            Err(AppError::InvalidItem(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url_without_network() {
        let fetcher = ReqwestFetcher::new().unwrap();
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidItem(_)));
        assert!(!err.is_retryable());
    }
}
