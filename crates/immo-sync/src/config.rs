//! Environment configuration and the `sources.yaml` registry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use immo_core::{Coordinates, SourceCandidate};
use immo_storage::{HttpClientConfig, PolitenessConfig, PolitenessGate};
use serde::Deserialize;
use tokio::fs;

use crate::notify::SearchAlert;

/// Provenance tag of agencies declared in the registry file.
pub const REGISTRY_TAG: &str = "sources_file";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources_file: PathBuf,
    pub state_file: PathBuf,
    pub export_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub min_delay: Duration,
    pub default_delay: Duration,
    pub max_requests_per_hour: usize,
    pub proxies: Vec<String>,
    pub cron_full: String,
    pub cron_priority: String,
    pub cron_stats: String,
    pub cron_cleanup: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());

        Self {
            sources_file: PathBuf::from(text("IMMO_SOURCES_FILE", "./sources.yaml")),
            state_file: PathBuf::from(text("IMMO_STATE_FILE", "./state/immo-state.json")),
            export_dir: PathBuf::from(text("IMMO_EXPORT_DIR", "./exports")),
            user_agent: text("IMMO_USER_AGENT", "immo-crawler/0.1"),
            http_timeout_secs: parsed("IMMO_HTTP_TIMEOUT_SECS").map_or(30, |v| v as u64),
            batch_size: parsed("IMMO_BATCH_SIZE").map_or(10, |v| (v as usize).max(1)),
            batch_pause: Duration::from_secs_f64(
                parsed("IMMO_BATCH_PAUSE_SECS").unwrap_or(5.0).max(0.0),
            ),
            min_delay: Duration::from_secs_f64(
                parsed("IMMO_MIN_DELAY_SECS").unwrap_or(0.5).max(0.5),
            ),
            default_delay: Duration::from_secs_f64(
                parsed("IMMO_DEFAULT_DELAY_SECS").unwrap_or(2.0).max(0.5),
            ),
            max_requests_per_hour: parsed("IMMO_MAX_REQUESTS_PER_HOUR")
                .map_or(100, |v| (v as usize).max(1)),
            proxies: lookup("IMMO_PROXIES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            cron_full: text("IMMO_CRON_FULL", "0 0 2 * * *"),
            cron_priority: text("IMMO_CRON_PRIORITY", "0 0 */6 * * *"),
            cron_stats: text("IMMO_CRON_STATS", "0 0 * * * *"),
            cron_cleanup: text("IMMO_CRON_CLEANUP", "0 0 3 * * *"),
        }
    }

    pub fn politeness(&self) -> PolitenessConfig {
        PolitenessConfig {
            user_agent: self.user_agent.clone(),
            min_delay: self.min_delay,
            default_delay: self.default_delay,
            max_requests_per_hour: self.max_requests_per_hour,
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            proxies: self.proxies.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub agencies: Vec<AgencyEntry>,
    #[serde(default)]
    pub politeness: Vec<DomainPolicy>,
    #[serde(default)]
    pub marketplaces: Option<MarketplaceSelection>,
    #[serde(default)]
    pub alerts: Vec<SearchAlert>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgencyEntry {
    pub name: String,
    pub website_url: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub discovered_from: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainPolicy {
    pub domain: String,
    pub delay_secs: f64,
    pub max_requests_per_hour: usize,
}

/// Portals to seed as sources. An empty `keys` list means every known portal.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketplaceSelection {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub postal_codes: Vec<String>,
}

impl SourcesFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn agency_candidates(&self) -> Vec<SourceCandidate> {
        self.agencies
            .iter()
            .map(|agency| {
                let mut discovered_from: BTreeSet<String> =
                    agency.discovered_from.iter().cloned().collect();
                discovered_from.insert(REGISTRY_TAG.to_string());
                SourceCandidate {
                    name: agency.name.clone(),
                    website_url: agency.website_url.clone(),
                    address: agency.address.clone(),
                    phone: agency.phone.clone(),
                    coordinates: agency.latitude.zip(agency.longitude).map(
                        |(latitude, longitude)| Coordinates {
                            latitude,
                            longitude,
                        },
                    ),
                    discovered_from,
                }
            })
            .collect()
    }

    pub async fn apply_politeness(&self, gate: &PolitenessGate) {
        for policy in &self.politeness {
            gate.set_domain_policy(
                &policy.domain,
                Duration::from_secs_f64(policy.delay_secs.max(0.0)),
                policy.max_requests_per_hour,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.sources_file, PathBuf::from("./sources.yaml"));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_pause, Duration::from_secs(5));
        assert_eq!(config.default_delay, Duration::from_secs(2));
        assert_eq!(config.min_delay, Duration::from_millis(500));
        assert_eq!(config.max_requests_per_hour, 100);
        assert!(config.proxies.is_empty());
        assert_eq!(config.cron_full, "0 0 2 * * *");
    }

    #[test]
    fn env_values_are_parsed_and_floored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("IMMO_DEFAULT_DELAY_SECS", "0.1"),
            ("IMMO_MIN_DELAY_SECS", "1.5"),
            ("IMMO_MAX_REQUESTS_PER_HOUR", "0"),
            ("IMMO_BATCH_SIZE", "3"),
            ("IMMO_PROXIES", "http://a:3128, ,http://b:3128"),
            ("IMMO_HTTP_TIMEOUT_SECS", "nope"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.default_delay, Duration::from_millis(500));
        assert_eq!(config.politeness().min_delay, Duration::from_millis(1500));
        assert_eq!(config.max_requests_per_hour, 1);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.proxies, vec!["http://a:3128", "http://b:3128"]);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.http_client().proxies.len(), 2);
    }

    #[test]
    fn sources_file_yields_tagged_candidates() {
        let file = SourcesFile::from_yaml_str(
            r#"
agencies:
  - name: Agence des Lilas
    website_url: https://agence-lilas.example
    latitude: 45.76
    longitude: 4.83
    discovered_from: [google_maps]
  - name: Cabinet Rive Gauche
    website_url: rive-gauche.example
politeness:
  - domain: agence-lilas.example
    delay_secs: 5
    max_requests_per_hour: 20
alerts:
  - id: t3-lyon
    recipient: acheteur@example.org
    postal_codes: ["69003"]
    price_max: 300000
"#,
        )
        .unwrap();
        let candidates = file.agency_candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].discovered_from.contains("google_maps"));
        assert!(candidates[1].discovered_from.contains(REGISTRY_TAG));
        assert_eq!(candidates[0].coordinates.map(|c| c.latitude), Some(45.76));
        assert!(candidates[1].coordinates.is_none());
        assert_eq!(file.politeness[0].max_requests_per_hour, 20);
        assert_eq!(file.alerts[0].price_max, Some(300_000));
        assert!(file.marketplaces.is_none());
    }
}
