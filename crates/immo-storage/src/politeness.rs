//! Per-domain crawl politeness: robots.txt, throttling and rate-limit accounting.
//!
//! One gate is built per process and shared by every scrape task. All state is
//! keyed by domain; domains never affect each other.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::robots::RobotsTxt;
use crate::{FetchError, Fetcher};

const MIN_DELAY: Duration = Duration::from_millis(500);
const WINDOW: Duration = Duration::from_secs(3600);
const RATE_LIMIT_BLOCK: Duration = Duration::from_secs(3600);
const CHALLENGE_BLOCK: Duration = Duration::from_secs(2 * 3600);
const CHALLENGE_KEYWORDS: &[&str] = &["captcha", "challenge"];

#[derive(Debug, Clone)]
pub struct PolitenessConfig {
    pub user_agent: String,
    /// Lowest delay any domain may run at, overrides included. Never below 0.5s.
    pub min_delay: Duration,
    pub default_delay: Duration,
    pub max_requests_per_hour: usize,
}

impl PolitenessConfig {
    fn floor(&self) -> Duration {
        self.min_delay.max(MIN_DELAY)
    }
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            user_agent: "immo-crawler/0.1".to_string(),
            min_delay: MIN_DELAY,
            default_delay: Duration::from_secs(2),
            max_requests_per_hour: 100,
        }
    }
}

/// Why a request was refused. Refusals are normal skips, not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    InvalidUrl(String),
    Blocked { domain: String, remaining: Duration },
    RateLimited { domain: String, max_per_hour: usize },
    Robots { url: String },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(url) => write!(f, "cannot derive a domain from {url}"),
            Self::Blocked { domain, remaining } => write!(
                f,
                "domain {domain} is temporarily blocked for another {}s",
                remaining.as_secs()
            ),
            Self::RateLimited {
                domain,
                max_per_hour,
            } => write!(f, "rate limit exceeded for {domain} (max {max_per_hour}/hour)"),
            Self::Robots { url } => write!(f, "{url} is disallowed by robots.txt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permit {
    Allowed,
    Denied(Denial),
}

impl Permit {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug)]
struct DomainState {
    delay: Duration,
    max_per_hour: usize,
    last_request: Option<Instant>,
    window: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    robots: Option<Arc<RobotsTxt>>,
}

impl DomainState {
    fn new(config: &PolitenessConfig) -> Self {
        Self {
            delay: config.default_delay.max(config.floor()),
            max_per_hour: config.max_requests_per_hour.max(1),
            last_request: None,
            window: VecDeque::new(),
            blocked_until: None,
            robots: None,
        }
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn block_for(&mut self, now: Instant, duration: Duration) {
        let until = now + duration;
        // blocks only ever extend
        self.blocked_until = Some(self.blocked_until.map_or(until, |u| u.max(until)));
    }
}

pub struct PolitenessGate {
    config: PolitenessConfig,
    fetcher: Arc<dyn Fetcher>,
    domains: Mutex<HashMap<String, DomainState>>,
}

impl PolitenessGate {
    /// `fetcher` is only used to load robots.txt files.
    pub fn new(config: PolitenessConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    pub fn domain_of(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// Overrides the throttle for one domain. Delay is floored at the configured
    /// minimum and the hourly cap at 1.
    pub async fn set_domain_policy(&self, domain: &str, delay: Duration, max_requests_per_hour: usize) {
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_ascii_lowercase())
            .or_insert_with(|| DomainState::new(&self.config));
        state.delay = delay.max(self.config.floor());
        state.max_per_hour = max_requests_per_hour.max(1);
        info!(domain, delay_secs = state.delay.as_secs_f64(), max_per_hour = state.max_per_hour, "domain policy set");
    }

    pub async fn permit(&self, url: &str) -> Permit {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return Permit::Denied(Denial::InvalidUrl(url.to_string())),
        };
        let Some(domain) = parsed.host_str().map(|h| h.to_ascii_lowercase()) else {
            return Permit::Denied(Denial::InvalidUrl(url.to_string()));
        };

        let cached_robots = {
            let mut domains = self.domains.lock().await;
            let state = domains
                .entry(domain.clone())
                .or_insert_with(|| DomainState::new(&self.config));
            let now = Instant::now();

            if let Some(until) = state.blocked_until {
                if now < until {
                    return Permit::Denied(Denial::Blocked {
                        domain,
                        remaining: until - now,
                    });
                }
                state.blocked_until = None;
            }

            state.prune_window(now);
            if state.window.len() >= state.max_per_hour {
                warn!(domain = %domain, requests = state.window.len(), "hourly request budget exhausted");
                state.block_for(now, RATE_LIMIT_BLOCK);
                return Permit::Denied(Denial::RateLimited {
                    domain,
                    max_per_hour: state.max_per_hour,
                });
            }
            state.robots.clone()
        };

        let robots = match cached_robots {
            Some(robots) => Some(robots),
            None => self.load_robots(&parsed, &domain).await,
        };

        let Some(robots) = robots else {
            return Permit::Allowed;
        };
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        if robots.is_allowed(&path) {
            Permit::Allowed
        } else {
            warn!(url, "robots.txt disallows");
            Permit::Denied(Denial::Robots {
                url: url.to_string(),
            })
        }
    }

    /// Fetches and caches robots.txt. A missing file caches an allow-all ruleset;
    /// a failed fetch is not cached and the caller proceeds as allowed.
    async fn load_robots(&self, parsed: &Url, domain: &str) -> Option<Arc<RobotsTxt>> {
        let robots_url = format!("{}://{}/robots.txt", parsed.scheme(), parsed.authority());
        let robots = match self.fetcher.fetch(&robots_url, None).await {
            Ok(page) => RobotsTxt::parse(&self.config.user_agent, &page.body),
            Err(FetchError::HttpStatus { status, .. }) if (400..500).contains(&status) => {
                debug!(domain, status, "no robots.txt, allowing all");
                RobotsTxt::allow_all()
            }
            Err(err) => {
                warn!(domain, error = %err, "could not read robots.txt, allowing");
                return None;
            }
        };
        let robots = Arc::new(robots);

        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(&self.config));
        if let Some(crawl_delay) = robots.crawl_delay() {
            if crawl_delay > state.delay {
                state.delay = crawl_delay;
            }
        }
        state.robots = Some(robots.clone());
        Some(robots)
    }

    /// Waits out the domain's delay since its previous request, then records
    /// this request. Concurrent callers on one domain queue behind each other.
    pub async fn wait_before_request(&self, domain: &str) {
        let slot = {
            let mut domains = self.domains.lock().await;
            let state = domains
                .entry(domain.to_ascii_lowercase())
                .or_insert_with(|| DomainState::new(&self.config));
            let now = Instant::now();
            let ready_at = state.last_request.map_or(now, |last| last + state.delay);
            let slot = ready_at.max(now);
            state.last_request = Some(slot);
            state.window.push_back(slot);
            slot
        };

        let now = Instant::now();
        if slot > now {
            debug!(domain, wait_ms = (slot - now).as_millis() as u64, "throttling");
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Adapts the domain's policy to a response. Adjustments only ever tighten.
    pub async fn report_outcome(&self, domain: &str, http_status: Option<u16>, error_text: &str) {
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_ascii_lowercase())
            .or_insert_with(|| DomainState::new(&self.config));
        let now = Instant::now();

        match http_status {
            Some(429) => {
                state.delay *= 2;
                state.block_for(now, RATE_LIMIT_BLOCK);
                warn!(domain, delay_secs = state.delay.as_secs_f64(), "rate limited by remote, blocking for 1h");
            }
            Some(403) => {
                let lower = error_text.to_lowercase();
                if CHALLENGE_KEYWORDS.iter().any(|k| lower.contains(k)) {
                    state.block_for(now, CHALLENGE_BLOCK);
                    warn!(domain, "challenge page detected, blocking for 2h");
                } else {
                    warn!(domain, "access forbidden");
                }
            }
            Some(status) if status == 408 || status >= 500 => {
                state.delay = state.delay.mul_f64(1.5);
                warn!(domain, status, delay_secs = state.delay.as_secs_f64(), "server trouble, slowing down");
            }
            _ => {}
        }
    }

    pub async fn delay_for(&self, domain: &str) -> Duration {
        let domains = self.domains.lock().await;
        domains
            .get(&domain.to_ascii_lowercase())
            .map(|s| s.delay)
            .unwrap_or_else(|| self.config.default_delay.max(self.config.floor()))
    }

    pub async fn is_blocked(&self, domain: &str) -> bool {
        let domains = self.domains.lock().await;
        domains
            .get(&domain.to_ascii_lowercase())
            .and_then(|s| s.blocked_until)
            .is_some_and(|until| Instant::now() < until)
    }
}
