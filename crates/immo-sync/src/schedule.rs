//! Independent cron cadences feeding the shared scrape engine.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::engine::ScrapeEngine;
use crate::fingerprint::run_cleanup;
use crate::stats::StatisticsAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    Full,
    Priority,
    Stats,
    Cleanup,
}

impl Cadence {
    pub const ALL: [Cadence; 4] = [Self::Full, Self::Priority, Self::Stats, Self::Cleanup];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full_crawl",
            Self::Priority => "priority_crawl",
            Self::Stats => "stats",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceCrons {
    pub full: String,
    pub priority: String,
    pub stats: String,
    pub cleanup: String,
}

impl CadenceCrons {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            full: config.cron_full.clone(),
            priority: config.cron_priority.clone(),
            stats: config.cron_stats.clone(),
            cleanup: config.cron_cleanup.clone(),
        }
    }

    pub fn cron_for(&self, cadence: Cadence) -> &str {
        match cadence {
            Cadence::Full => &self.full,
            Cadence::Priority => &self.priority,
            Cadence::Stats => &self.stats,
            Cadence::Cleanup => &self.cleanup,
        }
    }
}

/// Each cadence is its own timer. Overlap between cadences is harmless: a
/// source that is already being scraped is not claimed again.
#[derive(Clone)]
pub struct SchedulingLoop {
    engine: Arc<ScrapeEngine>,
    crons: CadenceCrons,
}

impl SchedulingLoop {
    pub fn new(engine: Arc<ScrapeEngine>, crons: CadenceCrons) -> Self {
        Self { engine, crons }
    }

    /// Runs one cadence now.
    pub async fn trigger(&self, cadence: Cadence) -> Result<()> {
        let store = self.engine.store().as_ref();
        match cadence {
            Cadence::Full => {
                self.engine.full_crawl().await?;
            }
            Cadence::Priority => {
                self.engine.priority_crawl(Utc::now()).await?;
            }
            Cadence::Stats => {
                StatisticsAggregator.recompute(store, Utc::now()).await?;
            }
            Cadence::Cleanup => {
                run_cleanup(store).await?;
            }
        }
        Ok(())
    }

    /// Registers one job per cadence. The caller starts and shuts down the
    /// returned scheduler.
    pub async fn build(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cadence in Cadence::ALL {
            let cron = self.crons.cron_for(cadence);
            let this = self.clone();
            let job = Job::new_async(cron, move |_uuid, _l| {
                let this = this.clone();
                Box::pin(async move {
                    info!(%cadence, "scheduled cadence triggered");
                    if let Err(err) = this.trigger(cadence).await {
                        error!(%cadence, error = %err, "scheduled cadence failed");
                    }
                })
            })
            .with_context(|| format!("creating {cadence} job for cron {cron}"))?;
            sched
                .add(job)
                .await
                .with_context(|| format!("adding {cadence} job"))?;
        }
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use immo_storage::{
        FetchError, FetchedPage, Fetcher, MemoryRecordStore, PolitenessConfig, PolitenessGate,
    };

    struct Offline;

    #[async_trait]
    impl Fetcher for Offline {
        async fn fetch(&self, url: &str, _proxy: Option<&str>) -> Result<FetchedPage, FetchError> {
            Err(FetchError::Transport {
                url: url.to_string(),
                message: "offline".into(),
            })
        }
    }

    fn scheduling_loop(crons: CadenceCrons) -> SchedulingLoop {
        let fetcher: Arc<dyn Fetcher> = Arc::new(Offline);
        let gate = Arc::new(PolitenessGate::new(PolitenessConfig::default(), fetcher.clone()));
        let engine = ScrapeEngine::new(Arc::new(MemoryRecordStore::new()), gate, fetcher);
        SchedulingLoop::new(Arc::new(engine), crons)
    }

    #[test]
    fn crons_come_from_config() {
        let config = SyncConfig::from_lookup(|key| {
            (key == "IMMO_CRON_STATS").then(|| "0 30 * * * *".to_string())
        });
        let crons = CadenceCrons::from_config(&config);
        assert_eq!(crons.cron_for(Cadence::Stats), "0 30 * * * *");
        assert_eq!(crons.cron_for(Cadence::Full), "0 0 2 * * *");
    }

    #[tokio::test]
    async fn every_cadence_can_be_triggered_on_an_empty_store() {
        let looped = scheduling_loop(CadenceCrons::from_config(&SyncConfig::from_lookup(|_| None)));
        for cadence in Cadence::ALL {
            looped.trigger(cadence).await.unwrap();
        }
        assert!(looped.build().await.is_ok());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let mut crons = CadenceCrons::from_config(&SyncConfig::from_lookup(|_| None));
        crons.cleanup = "every tuesday".into();
        let err = scheduling_loop(crons).build().await.err().unwrap();
        assert!(err.to_string().contains("cleanup"));
    }
}
