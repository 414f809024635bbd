use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use immo_adapters::{admit_candidates, StaticDiscovery};
use immo_core::{
    ChangeKind, ListingRecord, RunStatus, ScrapeStatus, SourceCandidate, SourceId,
};
use immo_storage::{
    FetchError, FetchedPage, Fetcher, MemoryRecordStore, PolitenessConfig, PolitenessGate,
    RecordStore,
};
use immo_sync::{
    engine_with_fetcher, run_cleanup, NotificationService, ScrapeEngine, ScrapeOutcome,
    SourcesFile, StatisticsAggregator, SyncConfig,
};

const LILAS: &str = "https://agence-lilas.example/annonces";

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/agencies")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[derive(Clone)]
enum Reply {
    Page(String),
    Status(u16, String),
    Timeout,
}

/// Serves canned replies per URL. robots.txt defaults to 404, anything else
/// unknown fails as a transport error.
#[derive(Default)]
struct ScriptedFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    requested: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn serve(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    fn page(&self, url: &str, fixture_name: &str) {
        self.serve(url, Reply::Page(fixture(fixture_name)));
    }

    fn unplug(&self, url: &str) {
        self.replies.lock().unwrap().remove(url);
    }

    fn requested(&self, url: &str) -> bool {
        self.requested.lock().unwrap().iter().any(|u| u == url)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _proxy: Option<&str>) -> Result<FetchedPage, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        let reply = self.replies.lock().unwrap().get(url).cloned();
        match reply {
            Some(Reply::Page(body)) => Ok(FetchedPage {
                status: 200,
                final_url: url.to_string(),
                body,
            }),
            Some(Reply::Status(status, body)) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
                body,
            }),
            Some(Reply::Timeout) => Err(FetchError::Timeout {
                url: url.to_string(),
            }),
            None if url.ends_with("/robots.txt") => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
                body: String::new(),
            }),
            None => Err(FetchError::Transport {
                url: url.to_string(),
                message: "connection refused".into(),
            }),
        }
    }
}

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<String>>);

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify_matching_alerts(&self, listing: &ListingRecord) -> anyhow::Result<usize> {
        self.0.lock().unwrap().push(listing.source_url.clone());
        Ok(1)
    }
}

struct Harness {
    store: Arc<MemoryRecordStore>,
    fetcher: Arc<ScriptedFetcher>,
    notified: Arc<RecordingNotifier>,
    engine: ScrapeEngine,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let notified = Arc::new(RecordingNotifier::default());
        let gate = Arc::new(PolitenessGate::new(
            PolitenessConfig::default(),
            fetcher.clone(),
        ));
        let engine = ScrapeEngine::new(store.clone(), gate, fetcher.clone())
            .with_batching(10, Duration::from_secs(5))
            .with_notifier(notified.clone());
        Self {
            store,
            fetcher,
            notified,
            engine,
        }
    }

    async fn admit(&self, name: &str, url: &str) -> SourceId {
        let feed = StaticDiscovery::new(
            "test_registry",
            vec![SourceCandidate {
                name: name.into(),
                website_url: url.into(),
                address: None,
                phone: None,
                coordinates: None,
                discovered_from: BTreeSet::new(),
            }],
        );
        admit_candidates(self.store.as_ref(), &[&feed]).await.unwrap();
        self.store.source_by_url(url).await.unwrap().unwrap().id
    }

    async fn scrape(&self, id: SourceId) -> ScrapeOutcome {
        self.engine.scrape_source(id).await.unwrap()
    }

    async fn active(&self, id: SourceId) -> Vec<ListingRecord> {
        self.store.active_listings_for_source(id).await.unwrap()
    }

    async fn listing_at(&self, url: &str) -> ListingRecord {
        self.store
            .listings()
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.source_url == url)
            .unwrap_or_else(|| panic!("no listing at {url}"))
    }
}

/// One `.annonce` card as agency sites write them.
fn card(title: &str, price: &str, address: &str, hrefs: &[&str]) -> String {
    let links: String = hrefs
        .iter()
        .map(|href| format!(r#"<a href="{href}">lien</a>"#))
        .collect();
    format!(
        r#"<div class="annonce"><h2 class="title">{title}</h2><span class="price">{price}</span><span class="address">{address}</span>{links}</div>"#
    )
}

fn agency_page(cards: &[String]) -> String {
    format!(
        r#"<!DOCTYPE html><html lang="fr"><body><main id="resultats">{}</main></body></html>"#,
        cards.concat()
    )
}

fn counts(outcome: ScrapeOutcome) -> immo_sync::ReconciliationCounts {
    match outcome {
        ScrapeOutcome::Succeeded(counts) => counts,
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn listings_appear_and_disappear_across_crawls() {
    let h = Harness::new();
    let lilas = h.admit("Agence des Lilas", LILAS).await;

    h.fetcher.page(LILAS, "lilas_crawl1.html");
    assert_eq!(counts(h.scrape(lilas).await).created, 1);
    let u1 = h.listing_at("https://agence-lilas.example/biens/u1").await;
    assert_eq!(u1.content.price, Some(250_000));
    assert_eq!(u1.content.postal_code.as_deref(), Some("69004"));
    assert_eq!(u1.content.photos, vec!["https://agence-lilas.example/photos/u1-sejour.jpg"]);
    assert!(u1.content.coordinates.is_some());
    assert_eq!(u1.quality_score, 1.0);

    h.fetcher.page(LILAS, "lilas_crawl2.html");
    let second = counts(h.scrape(lilas).await);
    assert_eq!((second.found, second.created, second.updated, second.removed), (2, 1, 0, 0));
    assert_eq!(h.active(lilas).await.len(), 2);
    assert_eq!(h.store.change_events(Some(u1.id)).await.unwrap().len(), 1);
    assert_eq!(h.store.listing(u1.id).await.unwrap().unwrap(), u1);

    h.fetcher.page(LILAS, "lilas_crawl3.html");
    let third = counts(h.scrape(lilas).await);
    assert_eq!((third.created, third.removed), (0, 1));
    let active = h.active(lilas).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].source_url, "https://agence-lilas.example/biens/u2");

    let u1_after = h.store.listing(u1.id).await.unwrap().unwrap();
    assert!(!u1_after.is_active);
    let kinds: Vec<ChangeKind> = h
        .store
        .change_events(Some(u1.id))
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![ChangeKind::Created, ChangeKind::Removed]);

    let source = h.store.source(lilas).await.unwrap().unwrap();
    assert_eq!(source.status, ScrapeStatus::Success);
    assert_eq!(source.active_listings, 1);
    assert_eq!(source.total_listings, 2);
    assert_eq!(
        *h.notified.0.lock().unwrap(),
        vec![
            "https://agence-lilas.example/biens/u1".to_string(),
            "https://agence-lilas.example/biens/u2".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn recrawling_an_unchanged_page_is_idempotent() {
    let h = Harness::new();
    let lilas = h.admit("Agence des Lilas", LILAS).await;
    h.fetcher.page(LILAS, "lilas_crawl2.html");

    assert_eq!(counts(h.scrape(lilas).await).created, 2);
    let events_before = h.store.change_events(None).await.unwrap().len();

    let again = counts(h.scrape(lilas).await);
    assert_eq!((again.created, again.updated, again.removed), (0, 0, 0));
    assert_eq!(h.store.change_events(None).await.unwrap().len(), events_before);
    assert_eq!(h.store.scrape_runs(Some(lilas)).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cross_source_duplicates_are_collapsed_before_rollups() {
    let h = Harness::new();
    let rhone = h.admit("Rhône Immobilier", "https://agence-rhone.example/annonces").await;
    let saone = h.admit("Saône Habitat", "https://saone-habitat.example/annonces").await;
    h.fetcher.page("https://agence-rhone.example/annonces", "rhone_wordpress.html");
    h.fetcher.page("https://saone-habitat.example/annonces", "saone_custom.html");

    // the unpriced terrain is dropped by extraction
    assert_eq!(counts(h.scrape(rhone).await).created, 1);
    assert_eq!(counts(h.scrape(saone).await).created, 2);

    let original = h
        .listing_at("https://agence-rhone.example/biens/studio-bellecour/")
        .await;
    let exact = h.listing_at("https://saone-habitat.example/annonces/sb-1").await;
    assert_eq!(exact.fingerprint, original.fingerprint);
    assert_eq!(exact.duplicate_of, Some(original.id));

    let report = run_cleanup(h.store.as_ref()).await.unwrap();
    assert_eq!(report.exact_duplicates, 0);
    assert_eq!(report.near_duplicates, 1);
    assert_eq!(report.marked, 1);
    let near = h.listing_at("https://saone-habitat.example/annonces/sb-2").await;
    assert_eq!(near.duplicate_of, Some(original.id));

    let rollups = StatisticsAggregator
        .recompute(h.store.as_ref(), Utc::now())
        .await
        .unwrap();
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0].postal_code, "69002");
    assert_eq!(rollups[0].active_listings, 1);
    assert_eq!(rollups[0].median_price, Some(98_000));
    assert_eq!(h.store.rollups().await.unwrap(), rollups);
}

#[tokio::test(start_paused = true)]
async fn five_consecutive_failures_block_a_source() {
    let h = Harness::new();
    let url = "https://agence-fragile.example/annonces";
    let fragile = h.admit("Agence Fragile", url).await;

    for _ in 0..4 {
        assert!(matches!(
            h.scrape(fragile).await,
            ScrapeOutcome::Failed { blocked: false, .. }
        ));
    }
    let source = h.store.source(fragile).await.unwrap().unwrap();
    assert_eq!(source.status, ScrapeStatus::Failed);
    assert_eq!(source.error_count, 4);

    h.fetcher.page(url, "lilas_crawl1.html");
    counts(h.scrape(fragile).await);
    let source = h.store.source(fragile).await.unwrap().unwrap();
    assert_eq!(source.error_count, 0);
    assert_eq!(source.last_error, None);

    h.fetcher.unplug(url);
    for attempt in 1..=5 {
        let outcome = h.scrape(fragile).await;
        let expect_blocked = attempt == 5;
        assert!(
            matches!(outcome, ScrapeOutcome::Failed { blocked, .. } if blocked == expect_blocked),
            "attempt {attempt}: {outcome:?}"
        );
    }
    let source = h.store.source(fragile).await.unwrap().unwrap();
    assert_eq!(source.status, ScrapeStatus::Blocked);
    assert!(source.last_error.unwrap().contains("connection refused"));

    assert_eq!(h.scrape(fragile).await, ScrapeOutcome::NotClaimed);
    assert_eq!(h.engine.full_crawl().await.unwrap().attempted, 0);

    let runs = h.store.scrape_runs(Some(fragile)).await.unwrap();
    assert_eq!(runs.len(), 10);
    assert_eq!(runs.iter().filter(|r| r.status == RunStatus::Success).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limiting_slows_and_blocks_the_domain() {
    let h = Harness::new();
    let url = "https://agence-saturee.example/annonces";
    let domain = "agence-saturee.example";
    let saturee = h.admit("Agence Saturée", url).await;
    h.fetcher
        .serve(url, Reply::Status(429, "Too Many Requests".into()));

    let before = h.engine.gate().delay_for(domain).await;
    assert!(matches!(h.scrape(saturee).await, ScrapeOutcome::Failed { .. }));
    assert!(h.engine.gate().delay_for(domain).await > before);
    assert!(h.engine.gate().is_blocked(domain).await);

    match h.scrape(saturee).await {
        ScrapeOutcome::Skipped { reason } => assert!(reason.contains("temporarily blocked")),
        other => panic!("expected a skip, got {other:?}"),
    }
    let source = h.store.source(saturee).await.unwrap().unwrap();
    assert_eq!(source.status, ScrapeStatus::Failed);
    assert_eq!(source.error_count, 1);

    tokio::time::advance(Duration::from_secs(3601)).await;
    h.fetcher.page(url, "lilas_crawl1.html");
    assert_eq!(counts(h.scrape(saturee).await).created, 1);
}

#[tokio::test(start_paused = true)]
async fn robots_disallow_is_a_skip_not_a_failure() {
    let h = Harness::new();
    let url = "https://agence-privee.example/annonces";
    let privee = h.admit("Agence Privée", url).await;
    h.fetcher.serve(
        "https://agence-privee.example/robots.txt",
        Reply::Page("User-agent: *\nDisallow: /annonces\n".into()),
    );
    h.fetcher.page(url, "lilas_crawl1.html");

    match h.scrape(privee).await {
        ScrapeOutcome::Skipped { reason } => assert!(reason.contains("robots.txt")),
        other => panic!("expected a skip, got {other:?}"),
    }
    assert!(!h.fetcher.requested(url));

    let source = h.store.source(privee).await.unwrap().unwrap();
    assert_eq!(source.status, ScrapeStatus::Pending);
    assert_eq!(source.error_count, 0);
    let runs = h.store.scrape_runs(Some(privee)).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn a_page_without_listings_counts_as_a_failure() {
    let h = Harness::new();
    let url = "https://agence-du-parc.example";
    let parc = h.admit("Agence du Parc", url).await;
    h.fetcher.page(url, "no_listings.html");

    match h.scrape(parc).await {
        ScrapeOutcome::Failed { error, blocked } => {
            assert!(error.contains("no listings extracted"));
            assert!(!blocked);
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(h.store.source(parc).await.unwrap().unwrap().error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn full_crawl_runs_sources_in_bounded_batches() {
    let h = Harness::new();
    let lilas = h.admit("Agence des Lilas", LILAS).await;
    let parc = h.admit("Agence du Parc", "https://agence-du-parc.example").await;
    h.fetcher.page(LILAS, "lilas_crawl2.html");
    h.fetcher.page("https://agence-du-parc.example", "no_listings.html");

    let report = h.engine.full_crawl().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.created, 2);
    assert_eq!(
        h.store.source(lilas).await.unwrap().unwrap().status,
        ScrapeStatus::Success
    );
    assert_eq!(
        h.store.source(parc).await.unwrap().unwrap().status,
        ScrapeStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn sources_file_overrides_reach_the_gate() {
    let sources = SourcesFile::from_yaml_str(
        r#"
politeness:
  - domain: agence-lilas.example
    delay_secs: 5
    max_requests_per_hour: 20
alerts:
  - id: maisons
    recipient: famille@example.org
    property_type: house
"#,
    )
    .unwrap();
    let config = SyncConfig::from_lookup(|_| None);
    let fetcher = Arc::new(ScriptedFetcher::default());
    let store = Arc::new(MemoryRecordStore::new());
    let engine = engine_with_fetcher(&config, store, &sources, fetcher).await;

    assert_eq!(
        engine.gate().delay_for("agence-lilas.example").await,
        Duration::from_secs(5)
    );
    assert_eq!(
        engine.gate().delay_for("ailleurs.example").await,
        Duration::from_secs(2)
    );
}

#[tokio::test(start_paused = true)]
async fn relisted_duplicate_becomes_canonical_once_its_price_diverges() {
    let h = Harness::new();
    let croix = "https://maisons-croix.example/annonces";
    let fourviere = "https://habitat-fourviere.example/annonces";
    let first = h.admit("Maisons de la Croix", croix).await;
    let second = h.admit("Habitat Fourvière", fourviere).await;
    let maison = |price: &str| {
        agency_page(&[card(
            "Maison de ville avec jardin",
            price,
            "8 rue Sala 69002 Lyon",
            &["/biens/sala"],
        )])
    };
    h.fetcher.serve(croix, Reply::Page(maison("500 000 €")));
    h.fetcher.serve(fourviere, Reply::Page(maison("500 000 €")));

    assert_eq!(counts(h.scrape(first).await).created, 1);
    assert_eq!(counts(h.scrape(second).await).created, 1);
    let original = h.listing_at("https://maisons-croix.example/biens/sala").await;
    let relisted = h.listing_at("https://habitat-fourviere.example/biens/sala").await;
    assert_eq!(relisted.duplicate_of, Some(original.id));

    h.fetcher.serve(fourviere, Reply::Page(maison("450 000 €")));
    let update = counts(h.scrape(second).await);
    assert_eq!((update.created, update.updated, update.removed), (0, 1, 0));

    let relisted = h.store.listing(relisted.id).await.unwrap().unwrap();
    assert_eq!(relisted.content.price, Some(450_000));
    assert_ne!(relisted.fingerprint, original.fingerprint);
    assert_eq!(relisted.duplicate_of, None);
    let kinds: Vec<ChangeKind> = h
        .store
        .change_events(Some(relisted.id))
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![ChangeKind::Created, ChangeKind::Updated]);

    let rollups = StatisticsAggregator
        .recompute(h.store.as_ref(), Utc::now())
        .await
        .unwrap();
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0].active_listings, 2);
    assert_eq!(rollups[0].price_min, Some(450_000));
    assert_eq!(rollups[0].price_max, Some(500_000));
}

#[tokio::test(start_paused = true)]
async fn a_listing_back_after_removal_is_a_new_record_linked_to_the_old_one() {
    let h = Harness::new();
    let lilas = h.admit("Agence des Lilas", LILAS).await;
    let u1_url = "https://agence-lilas.example/biens/u1";

    h.fetcher.page(LILAS, "lilas_crawl1.html");
    counts(h.scrape(lilas).await);
    let original = h.listing_at(u1_url).await;

    h.fetcher.page(LILAS, "lilas_crawl3.html");
    assert_eq!(counts(h.scrape(lilas).await).removed, 1);

    h.fetcher.page(LILAS, "lilas_crawl1.html");
    let back = counts(h.scrape(lilas).await);
    assert_eq!((back.created, back.removed), (1, 1));

    let active = h.active(lilas).await;
    assert_eq!(active.len(), 1);
    let relisted = &active[0];
    assert_eq!(relisted.source_url, u1_url);
    assert_ne!(relisted.id, original.id);
    assert_eq!(relisted.fingerprint, original.fingerprint);
    assert_eq!(relisted.duplicate_of, Some(original.id));

    let original_after = h.store.listing(original.id).await.unwrap().unwrap();
    assert!(!original_after.is_active);
    let original_kinds: Vec<ChangeKind> = h
        .store
        .change_events(Some(original.id))
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(original_kinds, vec![ChangeKind::Created, ChangeKind::Removed]);
    let relisted_events = h.store.change_events(Some(relisted.id)).await.unwrap();
    assert_eq!(relisted_events.len(), 1);
    assert_eq!(relisted_events[0].kind, ChangeKind::Created);
}

#[tokio::test(start_paused = true)]
async fn a_timed_out_fetch_fails_and_slows_the_domain() {
    let h = Harness::new();
    let url = "https://agence-lente.example/annonces";
    let domain = "agence-lente.example";
    let lente = h.admit("Agence Lente", url).await;
    h.fetcher.serve(url, Reply::Timeout);

    assert_eq!(h.engine.gate().delay_for(domain).await, Duration::from_secs(2));
    match h.scrape(lente).await {
        ScrapeOutcome::Failed { error, blocked } => {
            assert!(error.contains("timed out"));
            assert!(!blocked);
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(h.engine.gate().delay_for(domain).await, Duration::from_secs(3));
    assert!(!h.engine.gate().is_blocked(domain).await);

    let source = h.store.source(lente).await.unwrap().unwrap();
    assert_eq!(source.status, ScrapeStatus::Failed);
    assert_eq!(source.error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn absurd_prices_do_not_break_rollups() {
    let h = Harness::new();
    let url = "https://agence-prestige.example/annonces";
    let prestige = h.admit("Agence Prestige", url).await;
    let price = "9 999 999 999 999 999 999 €";
    h.fetcher.serve(
        url,
        Reply::Page(agency_page(&[
            card("Château des Brotteaux", price, "2 quai de Serbie 69006 Lyon", &["/biens/chateau"]),
            card("Hôtel particulier Foch", price, "40 avenue Foch 69006 Lyon", &["/biens/hotel"]),
        ])),
    );
    assert_eq!(counts(h.scrape(prestige).await).created, 2);

    let rollups = StatisticsAggregator
        .recompute(h.store.as_ref(), Utc::now())
        .await
        .unwrap();
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0].postal_code, "69006");
    assert_eq!(rollups[0].active_listings, 2);
    assert_eq!(rollups[0].average_price, Some(9_999_999_999_999_999_999));
}

#[tokio::test(start_paused = true)]
async fn shared_phone_links_do_not_hide_removed_listings() {
    let h = Harness::new();
    let url = "https://agence-guillotiere.example/annonces";
    let guillotiere = h.admit("Agence de la Guillotière", url).await;
    let t2 = card(
        "T2 Guillotière",
        "150 000 €",
        "3 rue de Marseille 69007 Lyon",
        &["tel:0478000000", "/biens/a"],
    );
    let t3 = card(
        "T3 Jean Macé",
        "210 000 €",
        "18 avenue Jean Jaurès 69007 Lyon",
        &["tel:0478000000", "mailto:contact@agence-guillotiere.example", "/biens/b"],
    );

    h.fetcher.serve(url, Reply::Page(agency_page(&[t2.clone(), t3])));
    assert_eq!(counts(h.scrape(guillotiere).await).created, 2);
    let mut urls: Vec<String> = h
        .active(guillotiere)
        .await
        .into_iter()
        .map(|l| l.source_url)
        .collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://agence-guillotiere.example/biens/a",
            "https://agence-guillotiere.example/biens/b",
        ]
    );

    h.fetcher.serve(url, Reply::Page(agency_page(&[t2])));
    assert_eq!(counts(h.scrape(guillotiere).await).removed, 1);
    let gone = h.listing_at("https://agence-guillotiere.example/biens/b").await;
    assert!(!gone.is_active);
    assert_eq!(h.active(guillotiere).await.len(), 1);
}
