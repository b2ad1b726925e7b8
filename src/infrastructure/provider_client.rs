//! HTTP client for the scraping provider
//!
//! Every call waits on a shared requests-per-second quota and carries the
//! client timeout. Replies are parsed into [`ParsedResponse`] here so the
//! phases only see interpreted outcomes plus the raw body for the ledger.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client, RequestBuilder, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT},
};
use tracing::{debug, warn};
use url::Url;

use crate::domain::provider_response::{ResponseFormatError, parse_response};
use crate::domain::services::{
    CredentialCheckRequest, ProviderError, ProviderReply, ScrapeRequest, ScrapingProvider,
};
use crate::infrastructure::config::ProviderConfig;

pub struct HttpScrapingProvider {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    base_url: Url,
}

impl HttpScrapingProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );
        if let Some(key) = &config.api_key {
            let name = HeaderName::from_bytes(config.api_key_header.as_bytes())
                .context("Invalid API key header name")?;
            let mut value = HeaderValue::from_str(key).context("Invalid API key")?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second)
                .context("Rate limit must be greater than 0")?,
        );

        // Trailing slash so joins append instead of replacing the last segment.
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).with_context(|| format!("Invalid provider URL {base}"))?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(quota),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::Transport(format!("invalid endpoint {path}: {e}")))
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<ProviderReply, ProviderError> {
        self.rate_limiter.until_ready().await;

        let response = request.send().await.map_err(|e| map_transport_error(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| map_transport_error(&e))?;

        debug!(operation, http_status = status.as_u16(), bytes = body.len(), "Provider replied");
        reply_from(status, body)
    }
}

fn map_transport_error(error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(error.to_string())
    }
}

/// Turns a status and body into a reply, or the error kind the phases act on.
///
/// Error statuses, 429 included, still parse so an index id in the body is
/// kept and the raw body reaches the ledger.
pub fn reply_from(status: StatusCode, body: String) -> Result<ProviderReply, ProviderError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!(bytes = body.len(), "Provider rate limit hit");
    }

    let http_status = status.as_u16();
    match parse_response(http_status, &body) {
        Ok(parsed) => Ok(ProviderReply {
            http_status,
            raw_body: body,
            parsed,
        }),
        Err(ResponseFormatError::Unexpected { body }) => {
            Err(ProviderError::UnexpectedFormat { http_status, body })
        }
    }
}

#[async_trait]
impl ScrapingProvider for HttpScrapingProvider {
    async fn verify_credential(&self, request: &CredentialCheckRequest) -> Result<ProviderReply, ProviderError> {
        let url = self.endpoint("credentials/verify")?;
        self.send(self.client.post(url).json(request), "verify_credential").await
    }

    async fn request_scrape(&self, request: &ScrapeRequest) -> Result<ProviderReply, ProviderError> {
        let url = self.endpoint("scrapes")?;
        self.send(self.client.post(url).json(request), "request_scrape").await
    }

    async fn check_status(&self, index_id: i64) -> Result<ProviderReply, ProviderError> {
        let url = self.endpoint(&format!("scrapes/{index_id}/status"))?;
        self.send(self.client.get(url), "check_status").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider_response::ParsedResponse;

    fn provider(base_url: &str) -> HttpScrapingProvider {
        HttpScrapingProvider::new(&ProviderConfig {
            base_url: base_url.to_string(),
            api_key: Some("secret".into()),
            ..ProviderConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn endpoints_append_to_base_path() {
        let p = provider("https://provider.example.com/api/v2");
        assert_eq!(
            p.endpoint("scrapes/55/status").unwrap().as_str(),
            "https://provider.example.com/api/v2/scrapes/55/status"
        );
        let p = provider("https://provider.example.com/api/v2/");
        assert_eq!(
            p.endpoint("credentials/verify").unwrap().as_str(),
            "https://provider.example.com/api/v2/credentials/verify"
        );
    }

    #[test]
    fn zero_rate_is_rejected() {
        let config = ProviderConfig {
            requests_per_second: 0,
            ..ProviderConfig::default()
        };
        assert!(HttpScrapingProvider::new(&config).is_err());
    }

    #[test]
    fn too_many_requests_keeps_index_and_body() {
        let reply = reply_from(StatusCode::TOO_MANY_REQUESTS, r#"{"IndexId": 555}"#.to_string()).unwrap();
        assert_eq!(reply.http_status, 429);
        assert_eq!(reply.raw_body, r#"{"IndexId": 555}"#);
        assert_eq!(reply.parsed.index_id(), Some(555));

        let reply = reply_from(StatusCode::TOO_MANY_REQUESTS, String::new()).unwrap();
        assert!(matches!(
            reply.parsed,
            ParsedResponse::Error { http_status: 429, index_id: None, .. }
        ));
    }

    #[test]
    fn server_errors_keep_body_and_index() {
        let reply = reply_from(StatusCode::BAD_GATEWAY, r#"{"IndexId": 8}"#.to_string()).unwrap();
        assert_eq!(reply.http_status, 502);
        assert_eq!(reply.parsed.index_id(), Some(8));
        assert!(matches!(reply.parsed, ParsedResponse::Error { .. }));
    }

    #[test]
    fn html_on_success_is_unexpected_format() {
        let err = reply_from(StatusCode::OK, "<html/>".to_string()).unwrap_err();
        assert_eq!(
            err,
            ProviderError::UnexpectedFormat {
                http_status: 200,
                body: "<html/>".into()
            }
        );
    }
}
