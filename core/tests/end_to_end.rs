//! End-to-end pipeline scenarios (spec §8). Each test wires a real
//! `Orchestrator` against in-memory fakes for `Store`/`ProductFeed`/
//! `TeamExtractor`/`ProfileFinder` plus, where an HTTP-shaped collaborator is
//! exercised, a `wiremock` server standing in for the email-finder adapter —
//! the same split the teacher's own integration suite draws between fakes
//! for its queue/store layer and `wiremock` for outbound HTTP.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use launchscout_core::ai_service::AiService;
use launchscout_core::browser_pool::BrowserPool;
use launchscout_core::cache::Cache;
use launchscout_core::config::{
    Config, Credentials, FeatureToggles, RawConfig, ScraperConfig, WorkerPoolConfig,
};
use launchscout_core::domain::campaign::CampaignStatus;
use launchscout_core::domain::{
    CampaignProgress, Company, CompanyKey, ControlAction, ControlCommand, ProcessingLogEntry,
    Prospect, StageOutcome, SystemStatus, TeamMember,
};
use launchscout_core::email_finder::EmailFinder;
use launchscout_core::error::AppError;
use launchscout_core::http_client::HttpClient;
use launchscout_core::llm::Registry;
use launchscout_core::notifier::Notifier;
use launchscout_core::orchestrator::{CampaignRequest, Orchestrator};
use launchscout_core::rate_limiter::RateLimiter;
use launchscout_core::scrapers::{ProductFeed, ProfileFinder, TeamExtractor};
use launchscout_core::store::{ProspectFilter, ProspectPatch, Store};

fn company(name: &str, domain: Option<&str>) -> Company {
    Company {
        name: name.to_string(),
        domain: domain.map(str::to_string),
        product_url: None,
        description: None,
        launch_timestamp: None,
    }
}

fn member(name: &str, company_name: &str) -> TeamMember {
    TeamMember {
        name: name.to_string(),
        role: "Engineer".into(),
        company_name: company_name.to_string(),
        profile_url: None,
    }
}

/// In-memory `Store`. Prospect writes and log entries are applied
/// synchronously (unbuffered), unlike campaign-progress snapshots, which the
/// orchestrator only flushes periodically — log entries are therefore the
/// reliable signal these tests poll on.
struct FakeStore {
    prospects: Mutex<HashMap<String, Prospect>>,
    next_id: AtomicU32,
    processed: Mutex<HashSet<CompanyKey>>,
    logs: Mutex<Vec<ProcessingLogEntry>>,
    campaign: AsyncMutex<Option<CampaignProgress>>,
    control_queue: Mutex<Vec<ControlCommand>>,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            prospects: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            processed: Mutex::new(HashSet::new()),
            logs: Mutex::new(Vec::new()),
            campaign: AsyncMutex::new(None),
            control_queue: Mutex::new(Vec::new()),
        }
    }

    fn seed_processed(&self, key: CompanyKey) {
        self.processed.lock().unwrap().insert(key);
    }

    fn prospects_snapshot(&self) -> Vec<Prospect> {
        self.prospects.lock().unwrap().values().cloned().collect()
    }

    fn logs_for_step(&self, step: &str) -> Vec<ProcessingLogEntry> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.step == step)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn upsert_prospect(&self, prospect: &Prospect) -> Result<String, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut stored = prospect.clone();
        stored.id = Some(id.clone());
        self.processed
            .lock()
            .unwrap()
            .insert(CompanyKey::from_name(&stored.company));
        self.prospects.lock().unwrap().insert(id.clone(), stored);
        Ok(id)
    }

    async fn update_prospect_fields(&self, id: &str, patch: &ProspectPatch) -> Result<(), AppError> {
        let mut guard = self.prospects.lock().unwrap();
        if let Some(p) = guard.get_mut(id) {
            if let Some(v) = &patch.email {
                p.email = Some(v.clone());
            }
            if let Some(v) = patch.email_confidence {
                p.email_confidence = Some(v);
            }
            if let Some(v) = &patch.email_subject {
                p.email_subject = Some(v.clone());
            }
            if let Some(v) = &patch.email_body {
                p.email_body = Some(v.clone());
            }
            if let Some(v) = patch.email_generation_status {
                p.email_generation_status = v;
            }
            if let Some(v) = patch.email_delivery_status {
                p.email_delivery_status = v;
            }
            if let Some(v) = patch.generated_at {
                p.generated_at = Some(v);
            }
            if let Some(v) = patch.sent_at {
                p.sent_at = Some(v);
            }
        }
        Ok(())
    }

    async fn get_processed_companies(&self) -> Result<HashSet<CompanyKey>, AppError> {
        Ok(self.processed.lock().unwrap().clone())
    }

    async fn find_prospects(&self, _: &ProspectFilter) -> Result<Vec<Prospect>, AppError> {
        Ok(self.prospects_snapshot())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), AppError> {
        self.logs.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn upsert_system_status(&self, _: &SystemStatus) -> Result<(), AppError> {
        Ok(())
    }

    async fn upsert_campaign(&self, progress: &CampaignProgress) -> Result<(), AppError> {
        *self.campaign.lock().await = Some(progress.clone());
        Ok(())
    }

    async fn get_campaign(&self, _: &str) -> Result<Option<CampaignProgress>, AppError> {
        Ok(self.campaign.lock().await.clone())
    }

    async fn read_control_commands(
        &self,
        _campaign_id: &str,
        since_ts: chrono::DateTime<Utc>,
    ) -> Result<Vec<ControlCommand>, AppError> {
        Ok(self
            .control_queue
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.seen_ts > since_ts)
            .cloned()
            .collect())
    }

    async fn post_control_command(
        &self,
        _campaign_id: &str,
        command: &ControlCommand,
    ) -> Result<(), AppError> {
        self.control_queue.lock().unwrap().push(command.clone());
        Ok(())
    }
}

struct FakeFeed {
    companies: Vec<Company>,
}

#[async_trait]
impl ProductFeed for FakeFeed {
    async fn list(
        &self,
        limit: usize,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<Company>, AppError> {
        Ok(self.companies.iter().take(limit).cloned().collect())
    }
}

struct FakeTeamExtractor {
    members_by_company: HashMap<String, Vec<TeamMember>>,
    per_call_delay: Duration,
}

#[async_trait]
impl TeamExtractor for FakeTeamExtractor {
    async fn extract(
        &self,
        company: &Company,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Vec<TeamMember> {
        if !self.per_call_delay.is_zero() {
            tokio::time::sleep(self.per_call_delay).await;
        }
        self.members_by_company
            .get(&company.name)
            .cloned()
            .unwrap_or_default()
    }
}

struct NoOpProfileFinder;

#[async_trait]
impl ProfileFinder for NoOpProfileFinder {
    async fn find(
        &self,
        _member: &TeamMember,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Option<String> {
        None
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<FakeStore>,
}

#[allow(clippy::too_many_arguments)]
fn build_harness(
    feed: Arc<dyn ProductFeed>,
    team_extractor: Arc<dyn TeamExtractor>,
    email_finder_base_url: Option<String>,
    max_workers: usize,
    control_check_interval_s: u64,
) -> Harness {
    let raw = RawConfig {
        credentials: Credentials {
            store_base_url: Some("http://store.test".into()),
            email_finder_api_key: email_finder_base_url.as_ref().map(|_| "test-key".to_string()),
            email_finder_base_url: email_finder_base_url.clone(),
            ..Default::default()
        },
        worker_pool: WorkerPoolConfig {
            max_workers,
            batch_size: 5,
            delay_between_batches_s: 0,
            per_stage_timeout_s: 10,
            retry_budget: 1,
        },
        features: FeatureToggles {
            ai_parsing: false,
            product_analysis: false,
            enhanced_personalization: false,
            interactive_controls: true,
            notifications: false,
        },
        scraper: ScraperConfig {
            product_feed_url: "http://feed.test".into(),
            ..ScraperConfig::default()
        },
        control_check_interval_s: Some(control_check_interval_s),
        ..Default::default()
    };

    let config = Arc::new(Config::from_raw(raw).expect("valid test config"));
    let rate_limiter = Arc::new(RateLimiter::new(&HashMap::new()));
    let http = Arc::new(HttpClient::new(rate_limiter, Duration::from_secs(5), 1));
    let browser_pool = Arc::new(BrowserPool::new(1, Duration::from_secs(60)));
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::new(true, 100, 10, cache_dir.into_path(), Duration::from_secs(3600)));
    let ai = Arc::new(AiService::new(Arc::new(Registry::new("unused")), cache, 250, 0.0));
    let profile_finder: Arc<dyn ProfileFinder> = Arc::new(NoOpProfileFinder);
    let email_finder = email_finder_base_url
        .map(|base_url| Arc::new(EmailFinder::new(Arc::clone(&http), base_url, "test-key")));
    let store = Arc::new(FakeStore::new());
    let notifier = Arc::new(Notifier::new(Arc::clone(&store) as Arc<dyn Store>));

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        http,
        browser_pool,
        ai,
        feed,
        team_extractor,
        profile_finder,
        email_finder,
        None,
        Arc::clone(&store) as Arc<dyn Store>,
        notifier,
    ));

    Harness { orchestrator, store }
}

fn pause_command() -> ControlCommand {
    ControlCommand {
        action: ControlAction::Pause,
        requested_by: "operator".into(),
        seen_ts: Utc::now(),
    }
}

fn resume_command() -> ControlCommand {
    ControlCommand {
        action: ControlAction::Resume,
        requested_by: "operator".into(),
        seen_ts: Utc::now(),
    }
}

fn stop_command() -> ControlCommand {
    ControlCommand {
        action: ControlAction::Stop,
        requested_by: "operator".into(),
        seen_ts: Utc::now(),
    }
}

/// Scenario 1: 3 launched companies, 2 team members each, email discovery
/// succeeds for everyone — a clean, fully successful campaign.
#[tokio::test]
async fn happy_path_discovers_and_stores_every_prospect() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/find"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": "person@example.com",
            "confidence": 0.8,
            "quota_exceeded": false,
        })))
        .mount(&mock_server)
        .await;

    let companies = vec![
        company("Acme", Some("acme.io")),
        company("Beta", Some("beta.io")),
        company("Gamma", Some("gamma.io")),
    ];
    let mut members = HashMap::new();
    for c in &companies {
        members.insert(
            c.name.clone(),
            vec![member("Alice", &c.name), member("Bob", &c.name)],
        );
    }

    let feed = Arc::new(FakeFeed { companies });
    let team_extractor = Arc::new(FakeTeamExtractor {
        members_by_company: members,
        per_call_delay: Duration::ZERO,
    });
    let harness = build_harness(feed, team_extractor, Some(mock_server.uri()), 3, 30);

    let snapshot = harness
        .orchestrator
        .run_campaign(CampaignRequest {
            id: "happy-path".into(),
            name: "happy path".into(),
            limit: 3,
            generate_emails: false,
            send_emails: false,
        })
        .await
        .expect("campaign should complete");

    assert_eq!(snapshot.status, CampaignStatus::Completed);
    assert_eq!(snapshot.processed_count, 3);
    assert_eq!(snapshot.successful_companies, 3);
    assert_eq!(snapshot.prospects_found, 6);
    assert_eq!(snapshot.success_rate, 1.0);

    let prospects = harness.store.prospects_snapshot();
    assert_eq!(prospects.len(), 6);
    for p in prospects {
        assert_eq!(p.email_confidence, Some(0.8));
        assert!(p.email.is_some());
    }
}

/// Scenario 2: a company already present in Store is skipped with a Dedup
/// log entry; only the genuinely new company is processed.
#[tokio::test]
async fn already_processed_company_is_deduped_not_reprocessed() {
    let acme = company("Acme", None);
    let beta = company("Beta", None);

    let mut members = HashMap::new();
    members.insert("Beta".to_string(), vec![member("Carol", "Beta")]);
    members.insert("Acme".to_string(), vec![member("Dave", "Acme")]);

    let feed = Arc::new(FakeFeed {
        companies: vec![acme.clone(), beta],
    });
    let team_extractor = Arc::new(FakeTeamExtractor {
        members_by_company: members,
        per_call_delay: Duration::ZERO,
    });
    let harness = build_harness(feed, team_extractor, None, 2, 30);
    harness.store.seed_processed(acme.key());

    let snapshot = harness
        .orchestrator
        .run_campaign(CampaignRequest {
            id: "dedup".into(),
            name: "dedup".into(),
            limit: 2,
            generate_emails: false,
            send_emails: false,
        })
        .await
        .expect("campaign should complete");

    assert_eq!(snapshot.status, CampaignStatus::Completed);
    assert_eq!(snapshot.processed_count, 2);
    assert_eq!(snapshot.successful_companies, 1);

    let dedup_logs = harness.store.logs_for_step("Dedup");
    let skipped: Vec<_> = dedup_logs
        .iter()
        .filter(|e| e.outcome == StageOutcome::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].company, "Acme");

    let prospects = harness.store.prospects_snapshot();
    assert_eq!(prospects.len(), 1);
    assert_eq!(prospects[0].name, "Carol");
}

/// Scenario 3: 4 companies processed; one company's members all degrade at
/// the email-finder stage (`QuotaExceeded`) without failing the company
/// outright, and the degradation is reflected in `error_count`.
#[tokio::test]
async fn quota_exceeded_degrades_only_the_affected_company() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/find"))
        .and(query_param("domain", "quota.io"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": null,
            "confidence": null,
            "quota_exceeded": true,
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/find"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": "person@example.com",
            "confidence": 0.7,
            "quota_exceeded": false,
        })))
        .mount(&mock_server)
        .await;

    let companies = vec![
        company("A", Some("a.io")),
        company("B", Some("b.io")),
        company("C", Some("c.io")),
        company("D", Some("quota.io")),
    ];
    let mut members = HashMap::new();
    members.insert("A".to_string(), vec![member("A1", "A")]);
    members.insert("B".to_string(), vec![member("B1", "B")]);
    members.insert("C".to_string(), vec![member("C1", "C")]);
    members.insert("D".to_string(), vec![member("D1", "D"), member("D2", "D")]);

    let feed = Arc::new(FakeFeed { companies });
    let team_extractor = Arc::new(FakeTeamExtractor {
        members_by_company: members,
        per_call_delay: Duration::ZERO,
    });
    let harness = build_harness(feed, team_extractor, Some(mock_server.uri()), 4, 30);

    let snapshot = harness
        .orchestrator
        .run_campaign(CampaignRequest {
            id: "partial-failure".into(),
            name: "partial failure".into(),
            limit: 4,
            generate_emails: false,
            send_emails: false,
        })
        .await
        .expect("campaign should complete");

    assert_eq!(snapshot.status, CampaignStatus::Completed);
    assert_eq!(snapshot.processed_count, 4);
    assert_eq!(snapshot.successful_companies, 4);
    assert!(
        snapshot.error_count >= 2,
        "both of D's members should register a degraded-lookup error, got {}",
        snapshot.error_count
    );

    let prospects = harness.store.prospects_snapshot();
    let (with_email, without_email): (Vec<_>, Vec<_>) =
        prospects.iter().partition(|p| p.email.is_some());
    assert_eq!(with_email.len(), 3);
    assert_eq!(without_email.len(), 2);
    assert!(without_email.iter().all(|p| p.company == "D"));
}

/// Scenario 4: a Pause control command parks every worker between stages;
/// a subsequent Resume lets the campaign run to completion having skipped
/// no company and reprocessed none.
#[tokio::test]
async fn pause_parks_workers_and_resume_completes_the_campaign() {
    const PER_COMPANY_DELAY: Duration = Duration::from_millis(150);

    let companies: Vec<Company> = (1..=20).map(|i| company(&format!("Company{i}"), None)).collect();
    let feed = Arc::new(FakeFeed { companies });
    let team_extractor = Arc::new(FakeTeamExtractor {
        members_by_company: HashMap::new(),
        per_call_delay: PER_COMPANY_DELAY,
    });
    let harness = build_harness(feed, team_extractor, None, 1, 1);
    let store = Arc::clone(&harness.store);
    let orchestrator = Arc::clone(&harness.orchestrator);

    let handle = tokio::spawn(async move {
        orchestrator
            .run_campaign(CampaignRequest {
                id: "pause-resume".into(),
                name: "pause resume".into(),
                limit: 20,
                generate_emails: false,
                send_emails: false,
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .post_control_command("pause-resume", &pause_command())
        .await
        .unwrap();

    // Past the control poller's first 1s tick: pause should now be in effect.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let count_after_pause = store.logs_for_step("TeamExtraction").len();
    assert!(
        count_after_pause >= 1 && count_after_pause < 20,
        "pause should land mid-campaign, got {count_after_pause} companies processed"
    );

    tokio::time::sleep(Duration::from_millis(900)).await;
    let count_while_paused = store.logs_for_step("TeamExtraction").len();
    assert_eq!(
        count_while_paused, count_after_pause,
        "no further company should advance while paused"
    );

    store
        .post_control_command("pause-resume", &resume_command())
        .await
        .unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(8), handle)
        .await
        .expect("campaign should finish after resume")
        .unwrap()
        .expect("campaign should not error");

    assert_eq!(snapshot.status, CampaignStatus::Completed);
    assert_eq!(snapshot.processed_count, 20);
    let seen_companies: HashSet<String> = store
        .logs_for_step("TeamExtraction")
        .into_iter()
        .map(|e| e.company)
        .collect();
    assert_eq!(seen_companies.len(), 20, "no company should be processed twice");
}

/// Scenario 5: a Stop control command cancels the campaign before every
/// company has been processed; the run ends with an undrained queue and no
/// current company in progress.
#[tokio::test]
async fn stop_cancels_the_campaign_before_completion() {
    const PER_COMPANY_DELAY: Duration = Duration::from_millis(150);

    let companies: Vec<Company> = (1..=20).map(|i| company(&format!("Company{i}"), None)).collect();
    let feed = Arc::new(FakeFeed { companies });
    let team_extractor = Arc::new(FakeTeamExtractor {
        members_by_company: HashMap::new(),
        per_call_delay: PER_COMPANY_DELAY,
    });
    let harness = build_harness(feed, team_extractor, None, 1, 1);
    let store = Arc::clone(&harness.store);
    let orchestrator = Arc::clone(&harness.orchestrator);

    let handle = tokio::spawn(async move {
        orchestrator
            .run_campaign(CampaignRequest {
                id: "stop".into(),
                name: "stop".into(),
                limit: 20,
                generate_emails: false,
                send_emails: false,
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    store.post_control_command("stop", &stop_command()).await.unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(8), handle)
        .await
        .expect("campaign should wind down after stop")
        .unwrap()
        .expect("campaign should not error");

    assert_eq!(snapshot.status, CampaignStatus::Failed);
    assert!(
        snapshot.processed_count < 20,
        "stop should cut the campaign short, got {}",
        snapshot.processed_count
    );
    assert!(snapshot.current_company.is_none());
}
