//! Command-line entrypoint. `clap` derive subcommands mirror the external
//! interface table exactly; the teacher's own binary takes no CLI arguments
//! at all (it's an always-on server), so the subcommand shape here is
//! pulled from the broader pack rather than generalized from teacher code.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use launchscout_core::config::Config;
use launchscout_core::domain::{Company, ControlAction, ControlCommand};
use launchscout_core::orchestrator::CampaignRequest;
use launchscout_core::store::{ProspectFilter, Store};
use launchscout_core::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "launchscout", about = "Company-launch prospecting pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a campaign.
    RunCampaign {
        #[arg(long)]
        limit: u64,
        #[arg(long)]
        generate_emails: bool,
        #[arg(long)]
        send_emails: bool,
        #[arg(long)]
        campaign_name: Option<String>,
    },
    /// Start a campaign with no email stages.
    Discover {
        #[arg(long)]
        limit: u64,
    },
    /// Single-company pipeline.
    ProcessCompany {
        name: String,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Run email-generation stage only, over an explicit prospect id list.
    GenerateEmails {
        #[arg(long, value_delimiter = ',')]
        prospect_ids: Vec<String>,
    },
    /// Run email-generation stage only, over recently stored prospects.
    GenerateEmailsRecent {
        #[arg(long)]
        limit: u64,
    },
    /// Run send stage on already-Generated prospects.
    SendEmailsRecent {
        #[arg(long)]
        limit: u64,
        #[arg(long, default_value_t = 20)]
        batch_size: usize,
        #[arg(long, default_value_t = 2)]
        delay: u64,
    },
    /// Inject a pause control command for a running campaign.
    PauseCampaign {
        #[arg(long)]
        campaign_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Read a campaign's current progress.
    CampaignStatus {
        #[arg(long)]
        campaign_id: String,
    },
    /// Run Config validation and LLM provider connection smoke tests.
    ValidateConfig,
}

/// Exit codes per the external interface table: 0 success, 1 configuration
/// invalid, 2 fatal orchestration error, 3 partial (campaign completed with
/// failures).
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_PARTIAL: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_env("RUST_LOG"))
        .with(tracing_subscriber::fmt::Layer::default())
        .init();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(errors) => {
            for e in errors {
                eprintln!("config error: {e}");
            }
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    if matches!(cli.command, Command::ValidateConfig) {
        return validate_config(config).await;
    }

    let runtime = match Runtime::new(config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to construct runtime: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match cli.command {
        Command::RunCampaign {
            limit,
            generate_emails,
            send_emails,
            campaign_name,
        } => {
            run_campaign(
                &runtime,
                campaign_name.unwrap_or_else(|| "run-campaign".into()),
                limit,
                generate_emails,
                send_emails,
            )
            .await
        }
        Command::Discover { limit } => {
            run_campaign(&runtime, "discover".into(), limit, false, false).await
        }
        Command::ProcessCompany { name, domain } => {
            let company = Company {
                name,
                domain,
                product_url: None,
                description: None,
                launch_timestamp: None,
            };
            match runtime.orchestrator.process_single_company(company).await {
                Ok(()) => ExitCode::from(EXIT_OK),
                Err(e) => {
                    eprintln!("pipeline failed: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Command::GenerateEmails { prospect_ids } => {
            let prospects = match collect_by_ids(&runtime, &prospect_ids).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("failed to load prospects: {e}");
                    return ExitCode::from(EXIT_FATAL);
                }
            };
            let requested = prospects.len() as u64;
            match runtime.orchestrator.generate_emails_for(prospects).await {
                Ok(generated) => finish_partial(generated, requested),
                Err(e) => {
                    eprintln!("email generation failed: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Command::GenerateEmailsRecent { limit } => {
            let prospects = match runtime
                .store
                .find_prospects(&ProspectFilter::default())
                .await
            {
                Ok(mut p) => {
                    p.truncate(limit as usize);
                    p
                }
                Err(e) => {
                    eprintln!("failed to load prospects: {e}");
                    return ExitCode::from(EXIT_FATAL);
                }
            };
            let requested = prospects.len() as u64;
            match runtime.orchestrator.generate_emails_for(prospects).await {
                Ok(generated) => finish_partial(generated, requested),
                Err(e) => {
                    eprintln!("email generation failed: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Command::SendEmailsRecent {
            limit,
            batch_size,
            delay,
        } => {
            match runtime
                .orchestrator
                .send_generated_emails(limit as usize, batch_size, std::time::Duration::from_secs(delay))
                .await
            {
                Ok(_sent) => ExitCode::from(EXIT_OK),
                Err(e) => {
                    eprintln!("email send failed: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Command::PauseCampaign { campaign_id, reason } => {
            let command = ControlCommand {
                action: ControlAction::Pause,
                requested_by: reason,
                seen_ts: chrono::Utc::now(),
            };
            match runtime.store.post_control_command(&campaign_id, &command).await {
                Ok(()) => ExitCode::from(EXIT_OK),
                Err(e) => {
                    eprintln!("failed to post control command: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Command::CampaignStatus { campaign_id } => match runtime.store.get_campaign(&campaign_id).await {
            Ok(Some(progress)) => {
                println!("{}", serde_json::to_string_pretty(&progress).unwrap_or_default());
                ExitCode::from(EXIT_OK)
            }
            Ok(None) => {
                eprintln!("no such campaign: {campaign_id}");
                ExitCode::from(EXIT_FATAL)
            }
            Err(e) => {
                eprintln!("failed to read campaign status: {e}");
                ExitCode::from(EXIT_FATAL)
            }
        },
        Command::ValidateConfig => unreachable!("handled above"),
    }
}

async fn run_campaign(
    runtime: &Runtime,
    name: String,
    limit: u64,
    generate_emails: bool,
    send_emails: bool,
) -> ExitCode {
    let request = CampaignRequest {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        limit,
        generate_emails,
        send_emails,
    };
    match runtime.orchestrator.run_campaign(request).await {
        Ok(progress) => {
            println!("{}", serde_json::to_string_pretty(&progress).unwrap_or_default());
            if progress.error_count > 0 {
                ExitCode::from(EXIT_PARTIAL)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(e) => {
            eprintln!("campaign failed: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn collect_by_ids(
    runtime: &Runtime,
    ids: &[String],
) -> Result<Vec<launchscout_core::domain::Prospect>, launchscout_core::error::AppError> {
    let all = runtime.store.find_prospects(&ProspectFilter::default()).await?;
    Ok(all
        .into_iter()
        .filter(|p| p.id.as_deref().is_some_and(|id| ids.iter().any(|i| i == id)))
        .collect())
}

fn finish_partial(done: u64, requested: u64) -> ExitCode {
    if requested == 0 || done == requested {
        ExitCode::from(EXIT_OK)
    } else {
        ExitCode::from(EXIT_PARTIAL)
    }
}

async fn validate_config(config: Config) -> ExitCode {
    match Runtime::new(config) {
        Ok(runtime) => {
            let validations = runtime.llm_registry.validate_all_providers().await;
            let mut ok = true;
            for (name, validation) in validations {
                if !validation.ok {
                    ok = false;
                    for err in &validation.errors {
                        eprintln!("llm provider {name}: {err}");
                    }
                }
            }
            println!("configuration valid");
            if ok {
                ExitCode::from(EXIT_OK)
            } else {
                ExitCode::from(EXIT_PARTIAL)
            }
        }
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            ExitCode::from(EXIT_CONFIG_INVALID)
        }
    }
}
