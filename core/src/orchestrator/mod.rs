//! The pipeline orchestrator (spec §4.C12) — the hard part. A bounded
//! worker pool drives the eight-stage per-company pipeline, a single
//! aggregator task owns `CampaignProgress`, and a background poller
//! translates Store-persisted `ControlCommand`s into local pause/resume/
//! stop/priority-insert signals. Grounded on the teacher's `PromptQueue` +
//! `tokio::spawn`-per-job shape in `main.rs`, generalized from "one job
//! type, no pause/resume" to the full state machine spec.md requires.

mod queue;
mod progress;

pub use queue::{Lane, PriorityQueue, WorkItem};
pub use progress::{ProgressAggregator, ProgressDelta};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ai_service::{AiService, EmailTemplate, ProfileFallback};
use crate::browser_pool::BrowserPool;
use crate::cache::Cache;
use crate::config::Config;
use crate::domain::{
    Company, CompanyKey, ControlAction, ControlCommand, EmailDeliveryStatus,
    EmailGenerationStatus, Prospect, ProcessingLogEntry, StageOutcome, TeamMember,
};
use crate::domain::campaign::{CampaignProgress, CampaignStatus};
use crate::email_finder::EmailFinder;
use crate::email_sender::{EmailSender, OutboundEmail};
use crate::error::{AppError, ErrorKind};
use crate::http_client::HttpClient;
use crate::notifier::{NotificationEvent, NotificationKind, Notifier};
use crate::scrapers::{ProductFeed, ProfileFinder, TeamExtractor};
use crate::store::{ProspectFilter, ProspectPatch, Store};

/// What one `run_campaign` invocation is asked to do. Mirrors the CLI's
/// `run-campaign` / `discover` distinction: `generate_emails`/`send_emails`
/// both false is exactly `discover`.
#[derive(Debug, Clone)]
pub struct CampaignRequest {
    pub id: String,
    pub name: String,
    pub limit: u64,
    pub generate_emails: bool,
    pub send_emails: bool,
}

/// The terminal outcome of a single company's pipeline run, used by the
/// worker to decide what progress delta to emit.
#[derive(Debug)]
struct CompanyOutcome {
    prospects_found: u64,
    emails_generated: u64,
    emails_sent: u64,
    successful: bool,
}

impl CompanyOutcome {
    fn empty() -> Self {
        Self {
            prospects_found: 0,
            emails_generated: 0,
            emails_sent: 0,
            successful: false,
        }
    }
}

/// Everything a per-company pipeline stage needs. Shared (via `Arc`) across
/// every worker in the pool; nothing here is mutated except through the
/// interior-synchronized subsystems it references.
struct PipelineCtx {
    config: Arc<Config>,
    http: Arc<HttpClient>,
    browser_pool: Arc<BrowserPool>,
    ai: Arc<AiService>,
    team_extractor: Arc<dyn TeamExtractor>,
    profile_finder: Arc<dyn ProfileFinder>,
    email_finder: Option<Arc<EmailFinder>>,
    email_sender: Option<Arc<EmailSender>>,
    store: Arc<dyn Store>,
    campaign_id: String,
    worker_id: u32,
    generate_emails: bool,
    send_emails: bool,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    deltas: mpsc::UnboundedSender<ProgressDelta>,
    claimed: Arc<StdMutex<HashSet<CompanyKey>>>,
}

/// Parks the calling task while the campaign is paused, waking on resume or
/// cancellation. Called between every pipeline stage (spec §4.C12).
async fn park_if_paused(paused: &mut watch::Receiver<bool>, cancel: &CancellationToken) {
    loop {
        if *paused.borrow() {
            tokio::select! {
                _ = paused.changed() => continue,
                _ = cancel.cancelled() => return,
            }
        }
        return;
    }
}

/// Retries a stage closure on `Transient`/`RateLimited` failures with
/// exponential backoff + jitter, bounded by the configured retry budget;
/// `RateLimited` with an explicit `Retry-After` waits at least that long.
/// Any other error kind (including `QuotaExceeded`, `Permanent`, `Auth`) is
/// returned immediately — those are not retried within the run (spec §7).
async fn with_stage_retry<T, F, Fut>(
    cancel: &CancellationToken,
    retry_budget: u32,
    mut f: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                let retryable = matches!(e.kind(), ErrorKind::Transient | ErrorKind::RateLimited);
                if !retryable || attempt >= retry_budget {
                    return Err(e);
                }
                let floor = match &e {
                    AppError::RateLimited {
                        retry_after: Some(d),
                    } => *d,
                    _ => Duration::from_millis(0),
                };
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt.min(6)));
                let jitter = Duration::from_millis(fastrand_jitter(attempt));
                let wait = floor.max(backoff) + jitter;
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                }
            }
        }
    }
}

/// Deterministic pseudo-jitter without pulling in a `rand` dependency the
/// teacher doesn't already carry — varies by attempt so concurrent workers
/// retrying the same stage don't thunder-herd in lockstep.
fn fastrand_jitter(attempt: u32) -> u64 {
    (blake3::hash(&attempt.to_le_bytes()).as_bytes()[0] as u64) % 250
}

async fn log_stage(
    ctx: &PipelineCtx,
    company: &str,
    step: &str,
    outcome: StageOutcome,
    started: Instant,
    details: impl Into<String>,
    error: Option<String>,
    prospects_found_delta: u64,
    emails_found_delta: u64,
) {
    let entry = ProcessingLogEntry {
        ts: Utc::now(),
        worker_id: ctx.worker_id,
        campaign: ctx.campaign_id.clone(),
        company: company.to_string(),
        step: step.to_string(),
        outcome,
        duration_s: started.elapsed().as_secs_f64(),
        details: details.into(),
        error,
        prospects_found_delta,
        emails_found_delta,
    };
    if let Err(e) = ctx.store.append_log(&entry).await {
        tracing::warn!(campaign = %ctx.campaign_id, step, error = %e, "failed to append processing log entry");
    }
}

/// Fetches a page's rendered text for AI consumption, falling back to the
/// browser pool only when a plain GET fails, the same escalation every
/// scraper in this crate uses.
async fn fetch_text(ctx: &PipelineCtx, url: &str) -> Option<String> {
    if ctx.cancel.is_cancelled() {
        return None;
    }
    let via_http = ctx
        .http
        .execute("profile_finder", reqwest::Method::GET, url, |b| b, &ctx.cancel)
        .await;
    if let Ok(resp) = via_http {
        if let Ok(text) = resp.text().await {
            return Some(text);
        }
    }
    let session = ctx
        .browser_pool
        .acquire(&format!("worker-{}", ctx.worker_id), Duration::from_secs(15))
        .await
        .ok()?;
    let tab = session
        .load(url, &crate::browser_pool::LoadHints::default(), Duration::from_secs(15))
        .ok();
    let html = tab.and_then(|t| session.html(&t).ok());
    let healthy = html.is_some();
    ctx.browser_pool.release(session, healthy);
    html
}

/// A single member's profile resolution + email lookup + AI parse,
/// resolved concurrently (with a per-company sub-limit) inside `process_company`.
struct ResolvedMember {
    member: TeamMember,
    email: Option<crate::email_finder::EmailMatch>,
    ai_profile: Option<serde_json::Value>,
}

async fn resolve_member(
    ctx: &PipelineCtx,
    mut member: TeamMember,
    domain: Option<&str>,
) -> ResolvedMember {
    // Stage 3: profile resolution.
    if member.profile_url.is_none() {
        member.profile_url = ctx.profile_finder.find(&member, &ctx.cancel).await;
    }

    // Stage 4: email finding. Missing domain or a quota error is not fatal
    // to the member — they're simply stored without an email.
    let email = if let (Some(finder), Some(domain)) = (&ctx.email_finder, domain) {
        match with_stage_retry(&ctx.cancel, ctx.config.worker_pool().retry_budget, || {
            finder.find(domain, &member.name, &ctx.cancel)
        })
        .await
        {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(member = %member.name, error = %e, "email lookup degraded");
                ctx.deltas.send(ProgressDelta::Error).ok();
                None
            }
        }
    } else {
        None
    };

    // Stage 5 (per-member half): AI profile parsing, only if a profile page
    // was found and AI parsing is enabled.
    let ai_profile = if ctx.config.features().ai_parsing {
        if let Some(url) = &member.profile_url {
            if let Some(html) = fetch_text(ctx, url).await {
                let fallback = ProfileFallback {
                    name: Some(member.name.clone()),
                    current_role: Some(member.role.clone()),
                };
                let envelope = ctx.ai.parse_profile(&html, Some(fallback), &ctx.cancel).await;
                envelope.data.and_then(|p| serde_json::to_value(p).ok())
            } else {
                None
            }
        } else {
            None
        }
    } else {
        None
    };

    ResolvedMember {
        member,
        email,
        ai_profile,
    }
}

/// The eight-stage per-company pipeline (spec §4.C12, §5 step-by-step).
/// Returns the outcome used to compute the campaign's progress deltas; it
/// never propagates an `Err` upward except `Cancelled` — every other
/// failure degrades a single stage and is logged, per spec §7's
/// "a stage-level error removes only that stage's contribution" policy.
async fn process_company(ctx: &PipelineCtx, company: Company) -> Result<CompanyOutcome, AppError> {
    let mut paused = ctx.paused.clone();
    let company_name = company.name.clone();
    let key = company.key();

    ctx.deltas
        .send(ProgressDelta::CurrentCompany(company_name.clone()))
        .ok();

    // Stage 1: dedup check.
    ctx.deltas
        .send(ProgressDelta::CurrentStep("dedup".into()))
        .ok();
    let started = Instant::now();
    {
        let already_claimed = !ctx.claimed.lock().unwrap().insert(key.clone());
        let already_processed = if already_claimed {
            true
        } else {
            match ctx.store.get_processed_companies().await {
                Ok(processed) => processed.contains(&key),
                Err(_) => false,
            }
        };
        if already_processed {
            log_stage(
                ctx,
                &company_name,
                "Dedup",
                StageOutcome::Skipped,
                started,
                "company already processed",
                None,
                0,
                0,
            )
            .await;
            return Ok(CompanyOutcome::empty());
        }
    }
    log_stage(ctx, &company_name, "Dedup", StageOutcome::Completed, started, "new company", None, 0, 0).await;

    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    park_if_paused(&mut paused, &ctx.cancel).await;
    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    // Stage 2: team extraction.
    ctx.deltas
        .send(ProgressDelta::CurrentStep("team_extraction".into()))
        .ok();
    let started = Instant::now();
    let members = ctx.team_extractor.extract(&company, &ctx.cancel).await;
    if members.is_empty() {
        log_stage(
            ctx,
            &company_name,
            "TeamExtraction",
            StageOutcome::Skipped,
            started,
            "no team members found",
            None,
            0,
            0,
        )
        .await;
        return Ok(CompanyOutcome::empty());
    }
    log_stage(
        ctx,
        &company_name,
        "TeamExtraction",
        StageOutcome::Completed,
        started,
        format!("{} members found", members.len()),
        None,
        0,
        0,
    )
    .await;

    park_if_paused(&mut paused, &ctx.cancel).await;
    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    // Stages 3-5: per-member profile resolution, email finding, AI parsing,
    // fanned out with a per-company sub-limit.
    ctx.deltas
        .send(ProgressDelta::CurrentStep("resolve_members".into()))
        .ok();
    let started = Instant::now();
    let sub_limit = Arc::new(tokio::sync::Semaphore::new(4));
    let domain = company.domain.clone();
    let resolved: Vec<ResolvedMember> = futures::future::join_all(members.into_iter().map(|member| {
        let sub_limit = Arc::clone(&sub_limit);
        let domain = domain.clone();
        async move {
            let _permit = sub_limit.acquire().await;
            resolve_member(ctx, member, domain.as_deref()).await
        }
    }))
    .await;
    let emails_found = resolved.iter().filter(|r| r.email.is_some()).count() as u64;
    log_stage(
        ctx,
        &company_name,
        "ResolveMembers",
        StageOutcome::Completed,
        started,
        format!("{} members resolved, {emails_found} emails found", resolved.len()),
        None,
        0,
        emails_found,
    )
    .await;

    park_if_paused(&mut paused, &ctx.cancel).await;
    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    // Stage 5 (company half): product analysis, once per company.
    let product_analysis = if ctx.config.features().product_analysis {
        let text = company
            .description
            .clone()
            .unwrap_or_else(|| company_name.clone());
        let envelope = ctx.ai.analyze_product(&text, &ctx.cancel).await;
        envelope.data
    } else {
        None
    };

    // Stage 6: store. Each prospect is written atomically; a partial
    // company (some members stored, some not) is still a success if at
    // least one was stored.
    ctx.deltas
        .send(ProgressDelta::CurrentStep("store".into()))
        .ok();
    let started = Instant::now();
    let mut stored: Vec<Prospect> = Vec::new();
    for resolved in resolved {
        let mut prospect = Prospect::new(
            resolved.member.name.clone(),
            resolved.member.role.clone(),
            company_name.clone(),
            "product_feed".into(),
        );
        prospect.profile_url = resolved.member.profile_url.clone();
        if let Some(email_match) = &resolved.email {
            prospect.email = Some(email_match.email.clone());
            prospect.email_confidence = Some(email_match.confidence);
        }
        prospect.ai_profile_json = resolved.ai_profile.clone();
        prospect.ai_product_json = product_analysis
            .as_ref()
            .and_then(|a| serde_json::to_value(a).ok());

        match with_stage_retry(&ctx.cancel, ctx.config.worker_pool().retry_budget, || {
            ctx.store.upsert_prospect(&prospect)
        })
        .await
        {
            Ok(id) => {
                prospect.id = Some(id);
                stored.push(prospect);
            }
            Err(e) => {
                tracing::warn!(company = %company_name, prospect = %prospect.name, error = %e, "failed to store prospect");
            }
        }
    }
    log_stage(
        ctx,
        &company_name,
        "Store",
        if stored.is_empty() {
            StageOutcome::Failed
        } else {
            StageOutcome::Completed
        },
        started,
        format!("{} prospects stored", stored.len()),
        None,
        stored.len() as u64,
        0,
    )
    .await;

    if stored.is_empty() {
        return Ok(CompanyOutcome {
            prospects_found: 0,
            emails_generated: 0,
            emails_sent: 0,
            successful: false,
        });
    }

    park_if_paused(&mut paused, &ctx.cancel).await;
    if ctx.cancel.is_cancelled() {
        return Ok(CompanyOutcome {
            prospects_found: stored.len() as u64,
            emails_generated: 0,
            emails_sent: 0,
            successful: true,
        });
    }

    let mut emails_generated = 0u64;
    let mut emails_sent = 0u64;

    // Stage 7: email generation (optional).
    if ctx.generate_emails && ctx.config.features().ai_parsing {
        ctx.deltas
            .send(ProgressDelta::CurrentStep("generate_emails".into()))
            .ok();
        let started = Instant::now();
        for prospect in stored.iter_mut() {
            let profile: Option<crate::ai_service::ParsedProfile> = prospect
                .ai_profile_json
                .clone()
                .and_then(|v| serde_json::from_value(v).ok());
            let envelope = ctx
                .ai
                .generate_email(
                    prospect,
                    EmailTemplate::ColdOutreach,
                    profile.as_ref(),
                    product_analysis.as_ref(),
                    None,
                    None,
                    &ctx.cancel,
                )
                .await;
            if let Some(email) = envelope.data {
                prospect.email_subject = Some(email.subject.clone());
                prospect.email_body = Some(email.body.clone());
                prospect.personalization_blob = Some(email.body.clone());
                let status = if envelope.success {
                    EmailGenerationStatus::Generated
                } else {
                    EmailGenerationStatus::Failed
                };
                prospect.email_generation_status = status;
                prospect.generated_at = Some(Utc::now());
                if envelope.success {
                    emails_generated += 1;
                }
                if let Some(id) = &prospect.id {
                    let patch = ProspectPatch {
                        email_subject: prospect.email_subject.clone(),
                        email_body: prospect.email_body.clone(),
                        personalization_blob: prospect.personalization_blob.clone(),
                        email_generation_status: Some(status),
                        generated_at: prospect.generated_at,
                        ..Default::default()
                    };
                    let _ = ctx.store.update_prospect_fields(id, &patch).await;
                }
            }
        }
        log_stage(
            ctx,
            &company_name,
            "GenerateEmails",
            StageOutcome::Completed,
            started,
            format!("{emails_generated} emails generated"),
            None,
            0,
            0,
        )
        .await;
    }

    park_if_paused(&mut paused, &ctx.cancel).await;

    // Stage 8: email send (optional), gated on generation having produced a
    // subject/body and the operator's send policy.
    if ctx.send_emails
        && !ctx.cancel.is_cancelled()
        && !ctx.config.email_policy().email_review_required
    {
        if let Some(sender) = &ctx.email_sender {
            ctx.deltas
                .send(ProgressDelta::CurrentStep("send_emails".into()))
                .ok();
            let started = Instant::now();
            for prospect in stored.iter_mut() {
                if prospect.email_generation_status != EmailGenerationStatus::Generated {
                    continue;
                }
                let Some(email) = &prospect.email else { continue };
                let outbound = OutboundEmail {
                    to: email.clone(),
                    subject: prospect.email_subject.clone().unwrap_or_default(),
                    html: None,
                    text: prospect.email_body.clone(),
                    reply_to: ctx.config.email_policy().sender_identity.clone(),
                    tags: vec!["launchscout".into()],
                    prospect_id: prospect.id.clone().unwrap_or_default(),
                };
                match sender.send(outbound, &ctx.cancel).await {
                    Ok(outcome)
                        if outcome.status == crate::email_sender::SendStatus::Sent =>
                    {
                        prospect.email_delivery_status = EmailDeliveryStatus::Sent;
                        prospect.email_generation_status = EmailGenerationStatus::Sent;
                        prospect.sent_at = Some(Utc::now());
                        emails_sent += 1;
                        if let Some(id) = &prospect.id {
                            let patch = ProspectPatch {
                                email_delivery_status: Some(EmailDeliveryStatus::Sent),
                                email_generation_status: Some(EmailGenerationStatus::Sent),
                                sent_at: prospect.sent_at,
                                ..Default::default()
                            };
                            let _ = ctx.store.update_prospect_fields(id, &patch).await;
                        }
                    }
                    Ok(_) | Err(_) => {
                        prospect.email_delivery_status = EmailDeliveryStatus::Failed;
                        if let Some(id) = &prospect.id {
                            let patch = ProspectPatch {
                                email_delivery_status: Some(EmailDeliveryStatus::Failed),
                                ..Default::default()
                            };
                            let _ = ctx.store.update_prospect_fields(id, &patch).await;
                        }
                    }
                }
            }
            log_stage(
                ctx,
                &company_name,
                "SendEmails",
                StageOutcome::Completed,
                started,
                format!("{emails_sent} emails sent"),
                None,
                0,
                0,
            )
            .await;
        }
    }

    Ok(CompanyOutcome {
        prospects_found: stored.len() as u64,
        emails_generated,
        emails_sent,
        successful: true,
    })
}

/// Owns every subsystem handle the pipeline needs. Constructed once by
/// `Runtime` (see `lib.rs`) and never cloned except as `Arc<Orchestrator>`.
pub struct Orchestrator {
    config: Arc<Config>,
    http: Arc<HttpClient>,
    browser_pool: Arc<BrowserPool>,
    ai: Arc<AiService>,
    feed: Arc<dyn ProductFeed>,
    team_extractor: Arc<dyn TeamExtractor>,
    profile_finder: Arc<dyn ProfileFinder>,
    email_finder: Option<Arc<EmailFinder>>,
    email_sender: Option<Arc<EmailSender>>,
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    next_worker_id: AtomicU32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        http: Arc<HttpClient>,
        browser_pool: Arc<BrowserPool>,
        ai: Arc<AiService>,
        feed: Arc<dyn ProductFeed>,
        team_extractor: Arc<dyn TeamExtractor>,
        profile_finder: Arc<dyn ProfileFinder>,
        email_finder: Option<Arc<EmailFinder>>,
        email_sender: Option<Arc<EmailSender>>,
        store: Arc<dyn Store>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            http,
            browser_pool,
            ai,
            feed,
            team_extractor,
            profile_finder,
            email_finder,
            email_sender,
            store,
            notifier,
            next_worker_id: AtomicU32::new(0),
        }
    }

    fn pipeline_ctx(
        &self,
        campaign_id: &str,
        worker_id: u32,
        request: &CampaignRequest,
        cancel: CancellationToken,
        paused: watch::Receiver<bool>,
        deltas: mpsc::UnboundedSender<ProgressDelta>,
        claimed: Arc<StdMutex<HashSet<CompanyKey>>>,
    ) -> PipelineCtx {
        PipelineCtx {
            config: Arc::clone(&self.config),
            http: Arc::clone(&self.http),
            browser_pool: Arc::clone(&self.browser_pool),
            ai: Arc::clone(&self.ai),
            team_extractor: Arc::clone(&self.team_extractor),
            profile_finder: Arc::clone(&self.profile_finder),
            email_finder: self.email_finder.clone(),
            email_sender: self.email_sender.clone(),
            store: Arc::clone(&self.store),
            campaign_id: campaign_id.to_string(),
            worker_id,
            generate_emails: request.generate_emails,
            send_emails: request.send_emails,
            cancel,
            paused,
            deltas,
            claimed,
        }
    }

    /// Runs a single company through the pipeline outside of any campaign
    /// machinery — backs the CLI's `process-company` subcommand.
    pub async fn process_single_company(&self, company: Company) -> Result<(), AppError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let (_paused_tx, paused_rx) = watch::channel(false);
        let ctx = self.pipeline_ctx(
            "adhoc",
            0,
            &CampaignRequest {
                id: "adhoc".into(),
                name: "adhoc".into(),
                limit: 1,
                generate_emails: false,
                send_emails: false,
            },
            CancellationToken::new(),
            paused_rx,
            tx,
            Arc::new(StdMutex::new(HashSet::new())),
        );
        process_company(&ctx, company).await?;
        Ok(())
    }

    /// Drives a full campaign end to end: discovery, dedup, worker pool,
    /// progress aggregation, control-channel polling, and the
    /// NotStarted→Running→{Paused,Completed,Failed} state machine.
    pub async fn run_campaign(&self, request: CampaignRequest) -> Result<CampaignProgress, AppError> {
        let progress = Arc::new(Mutex::new(CampaignProgress::new(
            request.id.clone(),
            request.name.clone(),
            request.limit,
        )));
        let (delta_tx, delta_rx) = mpsc::unbounded_channel::<ProgressDelta>();
        let aggregator = ProgressAggregator::spawn(
            Arc::clone(&progress),
            delta_rx,
            Arc::clone(&self.store),
            Duration::from_secs(2),
        );

        delta_tx.send(ProgressDelta::Status(CampaignStatus::Running)).ok();

        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let queue = Arc::new(PriorityQueue::new(self.config.worker_pool().max_workers * 4 + 1));
        let claimed: Arc<StdMutex<HashSet<CompanyKey>>> = Arc::new(StdMutex::new(HashSet::new()));

        if request.limit == 0 {
            queue.close();
            delta_tx.send(ProgressDelta::Status(CampaignStatus::Completed)).ok();
            drop(delta_tx);
            aggregator.await.ok();
            let snapshot = progress.lock().await.clone();
            self.notify_completion(&snapshot).await;
            return Ok(snapshot);
        }

        // Control poller.
        let control_handle = {
            let store = Arc::clone(&self.store);
            let campaign_id = request.id.clone();
            let interval = self.config.control_check_interval();
            let cancel = cancel.clone();
            let queue = Arc::clone(&queue);
            let delta_tx = delta_tx.clone();
            let enabled = self.config.features().interactive_controls;
            tokio::spawn(async move {
                if !enabled {
                    return;
                }
                control_poller(store, campaign_id, interval, cancel, paused_tx, queue, delta_tx).await
            })
        };

        // Producer: lists candidates and paces enqueuement in batches.
        // Dedup filtering is left entirely to each company's own pipeline
        // stage 1 (below) so the Dedup-stage `Skipped` log entry (spec
        // §4.C12 step 1, §8 scenario 2) is always emitted for an
        // already-processed company rather than silently dropped upstream.
        let producer_handle = {
            let feed = Arc::clone(&self.feed);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let limit = request.limit as usize;
            let batch_size = self.config.worker_pool().batch_size.max(1);
            let delay = Duration::from_secs(self.config.worker_pool().delay_between_batches_s);
            tokio::spawn(async move {
                let candidates = match feed.list(limit, &cancel).await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "product feed listing failed");
                        Vec::new()
                    }
                };

                for (i, batch) in candidates.chunks(batch_size).enumerate() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if i > 0 {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                    for company in batch {
                        if queue.push(company.clone(), Lane::Normal, &cancel).await.is_err() {
                            break;
                        }
                    }
                }
                queue.close();
            })
        };

        // Worker pool.
        let mut worker_handles = Vec::with_capacity(self.config.worker_pool().max_workers);
        for _ in 0..self.config.worker_pool().max_workers {
            let worker_id = self.next_worker_id.fetch_add(1, Relaxed);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let ctx = self.pipeline_ctx(
                &request.id,
                worker_id,
                &request,
                cancel.clone(),
                paused_rx.clone(),
                delta_tx.clone(),
                Arc::clone(&claimed),
            );
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let Some(item) = queue.pop(&cancel).await else {
                        break;
                    };
                    match process_company(&ctx, item.company).await {
                        Ok(outcome) => {
                            ctx.deltas
                                .send(ProgressDelta::Processed {
                                    prospects_found: outcome.prospects_found,
                                    emails_generated: outcome.emails_generated,
                                    emails_sent: outcome.emails_sent,
                                    successful: outcome.successful,
                                })
                                .ok();
                        }
                        Err(AppError::Cancelled) => break,
                        Err(_) => {
                            ctx.deltas.send(ProgressDelta::Error).ok();
                        }
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }));
        }

        producer_handle.await.ok();
        for handle in worker_handles {
            handle.await.ok();
        }

        // Stop the control poller now that there is nothing left to pause
        // or prioritize.
        cancel.cancel();
        control_handle.await.ok();

        delta_tx.send(ProgressDelta::ClearCurrentCompany).ok();
        delta_tx
            .send(ProgressDelta::Status(CampaignStatus::Completed))
            .ok();
        drop(delta_tx);
        aggregator.await.ok();

        let snapshot = progress.lock().await.clone();
        self.notify_completion(&snapshot).await;
        Ok(snapshot)
    }

    async fn notify_completion(&self, snapshot: &CampaignProgress) {
        if !self.config.features().notifications {
            return;
        }
        let kind = match snapshot.status {
            CampaignStatus::Completed => NotificationKind::CampaignCompleted {
                campaign_id: snapshot.id.clone(),
                prospects_found: snapshot.prospects_found,
                emails_sent: snapshot.emails_sent,
            },
            CampaignStatus::Failed => NotificationKind::CampaignFailed {
                campaign_id: snapshot.id.clone(),
                reason: format!("{} errors during run", snapshot.error_count),
            },
            _ => return,
        };
        self.notifier.notify(NotificationEvent {
            kind,
            campaign_id: snapshot.id.clone(),
        });
    }

    /// Backs `generate-emails` / `generate-emails-recent`: runs only the
    /// email-generation stage over an already-stored set of prospects.
    pub async fn generate_emails_for(&self, mut prospects: Vec<Prospect>) -> Result<u64, AppError> {
        let mut generated = 0u64;
        let cancel = CancellationToken::new();
        for prospect in prospects.iter_mut() {
            let envelope = self
                .ai
                .generate_email(prospect, EmailTemplate::ColdOutreach, None, None, None, None, &cancel)
                .await;
            let Some(email) = envelope.data else { continue };
            prospect.email_subject = Some(email.subject);
            prospect.email_body = Some(email.body);
            let status = if envelope.success {
                EmailGenerationStatus::Generated
            } else {
                EmailGenerationStatus::Failed
            };
            prospect.email_generation_status = status;
            prospect.generated_at = Some(Utc::now());
            if envelope.success {
                generated += 1;
            }
            if let Some(id) = &prospect.id {
                let patch = ProspectPatch {
                    email_subject: prospect.email_subject.clone(),
                    email_body: prospect.email_body.clone(),
                    email_generation_status: Some(status),
                    generated_at: prospect.generated_at,
                    ..Default::default()
                };
                self.store.update_prospect_fields(id, &patch).await?;
            }
        }
        Ok(generated)
    }

    /// Backs `send-emails-recent`: batched send over prospects whose
    /// `email_generation_status = Generated`, skipping any already `Sent`
    /// (idempotent per spec §8).
    pub async fn send_generated_emails(
        &self,
        limit: usize,
        batch_size: usize,
        inter_batch_delay: Duration,
    ) -> Result<u64, AppError> {
        let Some(sender) = &self.email_sender else {
            return Err(AppError::Config("email sender not configured".into()));
        };
        let mut prospects = self
            .store
            .find_prospects(&ProspectFilter {
                email_generation_status: Some(EmailGenerationStatus::Generated),
                ..Default::default()
            })
            .await?;
        prospects.truncate(limit);

        let cancel = CancellationToken::new();
        let outbound: Vec<(String, OutboundEmail)> = prospects
            .iter()
            .filter_map(|p| {
                let email = p.email.clone()?;
                let id = p.id.clone()?;
                Some((
                    id.clone(),
                    OutboundEmail {
                        to: email,
                        subject: p.email_subject.clone().unwrap_or_default(),
                        html: None,
                        text: p.email_body.clone(),
                        reply_to: self.config.email_policy().sender_identity.clone(),
                        tags: vec!["launchscout".into()],
                        prospect_id: id,
                    },
                ))
            })
            .collect();

        let (ids, emails): (Vec<String>, Vec<OutboundEmail>) = outbound.into_iter().unzip();
        let results = sender
            .send_batch(emails, batch_size, inter_batch_delay, &cancel)
            .await;

        let mut sent = 0u64;
        for (id, result) in ids.into_iter().zip(results) {
            let patch = match result {
                Ok(outcome) if outcome.status == crate::email_sender::SendStatus::Sent => {
                    sent += 1;
                    ProspectPatch {
                        email_delivery_status: Some(EmailDeliveryStatus::Sent),
                        email_generation_status: Some(EmailGenerationStatus::Sent),
                        sent_at: Some(Utc::now()),
                        ..Default::default()
                    }
                }
                _ => ProspectPatch {
                    email_delivery_status: Some(EmailDeliveryStatus::Failed),
                    ..Default::default()
                },
            };
            self.store.update_prospect_fields(&id, &patch).await?;
        }
        Ok(sent)
    }
}

/// Polls `Store.read_control_commands` at `interval`, translating each into
/// a local signal. Idempotent by `ControlCommand::idempotency_key`:
/// commands already applied within this poller's lifetime are skipped.
async fn control_poller(
    store: Arc<dyn Store>,
    campaign_id: String,
    interval: Duration,
    cancel: CancellationToken,
    paused_tx: watch::Sender<bool>,
    queue: Arc<PriorityQueue>,
    deltas: mpsc::UnboundedSender<ProgressDelta>,
) {
    let mut since = Utc::now();
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        let commands = match store.read_control_commands(&campaign_id, since).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(campaign = %campaign_id, error = %e, "control command poll failed");
                continue;
            }
        };

        for cmd in commands {
            if cmd.seen_ts > since {
                since = cmd.seen_ts;
            }
            let key = cmd.idempotency_key(&campaign_id);
            if !seen.insert(key) {
                continue;
            }
            apply_control_command(&cmd, &cancel, &paused_tx, &queue, &deltas).await;
        }
    }
}

async fn apply_control_command(
    cmd: &ControlCommand,
    cancel: &CancellationToken,
    paused_tx: &watch::Sender<bool>,
    queue: &Arc<PriorityQueue>,
    deltas: &mpsc::UnboundedSender<ProgressDelta>,
) {
    match &cmd.action {
        ControlAction::Pause => {
            paused_tx.send(true).ok();
            deltas.send(ProgressDelta::Status(CampaignStatus::Paused)).ok();
        }
        ControlAction::Resume => {
            paused_tx.send(false).ok();
            deltas.send(ProgressDelta::Status(CampaignStatus::Running)).ok();
        }
        ControlAction::Stop => {
            let drained = queue.is_closed() && queue.is_empty();
            let status = if drained {
                CampaignStatus::Completed
            } else {
                CampaignStatus::Failed
            };
            deltas.send(ProgressDelta::Status(status)).ok();
            deltas.send(ProgressDelta::ClearCurrentCompany).ok();
            cancel.cancel();
        }
        ControlAction::InsertPriority { company_ref } => {
            let company = Company {
                name: company_ref.clone(),
                domain: None,
                product_url: None,
                description: None,
                launch_timestamp: None,
            };
            queue.push(company, Lane::Priority, cancel).await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32 as StdAtomicU32, Ordering};

    #[test]
    fn jitter_varies_by_attempt() {
        let a = fastrand_jitter(0);
        let b = fastrand_jitter(1);
        assert_ne!(a, b, "different attempts should usually produce different jitter");
    }

    #[tokio::test]
    async fn park_if_paused_returns_immediately_when_not_paused() {
        let (_tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let mut rx = rx;
        tokio::time::timeout(Duration::from_millis(50), park_if_paused(&mut rx, &cancel))
            .await
            .expect("should not block when not paused");
    }

    #[tokio::test]
    async fn park_if_paused_unblocks_on_resume() {
        let (tx, rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        let mut rx2 = rx.clone();
        let counter = Arc::new(StdAtomicU32::new(0));
        let counter2 = Arc::clone(&counter);
        let handle = tokio::spawn(async move {
            park_if_paused(&mut rx2, &cancel).await;
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tx.send(false).unwrap();
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn park_if_paused_unblocks_on_cancel() {
        let (_tx, rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        let mut rx2 = rx;
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move {
            park_if_paused(&mut rx2, &cancel2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("should unblock on cancellation")
            .unwrap();
    }
}
