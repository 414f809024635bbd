//! Discovery feeds and admission of candidate sources into the store.

use async_trait::async_trait;
use chrono::Utc;
use immo_core::SourceCandidate;
use immo_storage::RecordStore;
use tracing::{info, warn};
use url::Url;

use crate::AdapterError;

/// An external feed of candidate agency sites (maps API, directories, search).
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Provenance tag added to every candidate this feed yields.
    fn tag(&self) -> &str;
    async fn discover(&self) -> Result<Vec<SourceCandidate>, AdapterError>;
}

/// A fixed list of candidates, e.g. the agencies declared in `sources.yaml`.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    tag: String,
    candidates: Vec<SourceCandidate>,
}

impl StaticDiscovery {
    pub fn new(tag: impl Into<String>, candidates: Vec<SourceCandidate>) -> Self {
        Self {
            tag: tag.into(),
            candidates,
        }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn discover(&self) -> Result<Vec<SourceCandidate>, AdapterError> {
        Ok(self.candidates.clone())
    }
}

/// Canonical form used to recognise the same site across feeds: lower-case
/// scheme and host, no fragment, no trailing slash.
pub fn normalize_website_url(raw: &str) -> Result<String, AdapterError> {
    let invalid = |reason: &str| AdapterError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https sites can be crawled"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    url.set_fragment(None);

    let mut normalized = String::from(url);
    if let Some(stripped) = normalized.strip_suffix('/') {
        normalized = stripped.to_string();
    }
    Ok(normalized)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    pub discovered: usize,
    pub admitted: usize,
    pub merged: usize,
    pub rejected: usize,
}

/// Runs every feed and admits its candidates. A failing feed is logged and
/// skipped; the others still run.
pub async fn admit_candidates(
    store: &dyn RecordStore,
    feeds: &[&dyn DiscoverySource],
) -> Result<AdmissionReport, AdapterError> {
    let mut report = AdmissionReport::default();
    for feed in feeds {
        let candidates = match feed.discover().await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(feed = feed.tag(), error = %err, "discovery feed failed");
                continue;
            }
        };
        report.discovered += candidates.len();

        for mut candidate in candidates {
            let normalized = match normalize_website_url(&candidate.website_url) {
                Ok(url) => url,
                Err(err) => {
                    warn!(feed = feed.tag(), error = %err, "rejecting candidate");
                    report.rejected += 1;
                    continue;
                }
            };
            let domain = Url::parse(&normalized)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            candidate.website_url = normalized;
            candidate.discovered_from.insert(feed.tag().to_string());

            let (_, inserted) = store.admit_source(candidate, domain, Utc::now()).await?;
            if inserted {
                report.admitted += 1;
            } else {
                report.merged += 1;
            }
        }
    }
    info!(
        discovered = report.discovered,
        admitted = report.admitted,
        merged = report.merged,
        rejected = report.rejected,
        "discovery finished"
    );
    Ok(report)
}
