//! Fetch plumbing, crawl politeness and the record store for the agency crawler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub mod politeness;
pub mod robots;
pub mod store;

pub use politeness::{Denial, Permit, PolitenessConfig, PolitenessGate};
pub use robots::RobotsTxt;
pub use store::{
    history_snapshot, Claim, CommitReceipt, ListingChange, MemoryRecordStore,
    ReconciliationCommit, RecordStore, StoreError,
};

pub const CRATE_NAME: &str = "immo-storage";

/// Longest error body kept for policy decisions and logs.
const ERROR_BODY_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("request failed for {url}: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    /// Status handed to the politeness gate. Timeouts report as 408.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Timeout { .. } => Some(408),
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport { .. } => None,
        }
    }

    /// Error text plus any response body, for keyword checks like captcha pages.
    pub fn detail(&self) -> String {
        match self {
            Self::HttpStatus { body, .. } if !body.is_empty() => format!("{self}: {body}"),
            _ => self.to_string(),
        }
    }
}

/// Anything that can turn a URL into page content. The crawler only cares about
/// the body or a typed failure, not whether a plain client or a browser did it.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<FetchedPage, FetchError>;
}

/// Round-robin proxy picker shared across scrape tasks.
#[derive(Debug, Default)]
pub struct ProxyRotation {
    proxies: Vec<String>,
    cursor: AtomicUsize,
}

impl ProxyRotation {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_proxy(&self) -> Option<&str> {
        if self.proxies.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        Some(self.proxies[index].as_str())
    }

    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub proxies: Vec<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            proxies: Vec::new(),
        }
    }
}

/// reqwest-backed fetcher. Failures are returned as-is: retrying is left to the
/// next scheduled crawl.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    proxied: HashMap<String, reqwest::Client>,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = Self::builder(&config)
            .build()
            .context("building reqwest client")?;

        let mut proxied = HashMap::new();
        for proxy_url in &config.proxies {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("parsing proxy {proxy_url}"))?;
            let client = Self::builder(&config)
                .proxy(proxy)
                .build()
                .with_context(|| format!("building reqwest client for proxy {proxy_url}"))?;
            proxied.insert(proxy_url.clone(), client);
        }

        Ok(Self {
            client,
            proxied,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    fn builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    fn classify(url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let client = proxy
            .and_then(|p| self.proxied.get(p))
            .unwrap_or(&self.client);

        async {
            let resp = client
                .get(url)
                .send()
                .await
                .map_err(|e| Self::classify(url, e))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.text().await.map_err(|e| Self::classify(url, e))?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");

            if status.is_success() {
                return Ok(FetchedPage {
                    status: status.as_u16(),
                    final_url,
                    body,
                });
            }

            let body = body.chars().take(ERROR_BODY_LIMIT).collect();
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url, proxied = proxy.is_some()))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxies_rotate_round_robin() {
        let rotation = ProxyRotation::new(vec!["http://a:8080".into(), "http://b:8080".into()]);
        assert_eq!(rotation.next_proxy(), Some("http://a:8080"));
        assert_eq!(rotation.next_proxy(), Some("http://b:8080"));
        assert_eq!(rotation.next_proxy(), Some("http://a:8080"));
        assert_eq!(ProxyRotation::default().next_proxy(), None);
    }

    #[test]
    fn fetch_errors_map_to_policy_statuses() {
        let timeout = FetchError::Timeout {
            url: "https://agence.example/".into(),
        };
        assert_eq!(timeout.http_status(), Some(408));

        let captcha = FetchError::HttpStatus {
            status: 403,
            url: "https://agence.example/".into(),
            body: "Please solve the captcha".into(),
        };
        assert_eq!(captcha.http_status(), Some(403));
        assert!(captcha.detail().contains("captcha"));

        let refused = FetchError::Transport {
            url: "https://agence.example/".into(),
            message: "connection refused".into(),
        };
        assert_eq!(refused.http_status(), None);
    }

    #[test]
    fn http_fetcher_builds_with_proxies() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            proxies: vec!["http://127.0.0.1:3128".into()],
            ..Default::default()
        })
        .expect("fetcher");
        assert_eq!(fetcher.proxied.len(), 1);
    }
}
