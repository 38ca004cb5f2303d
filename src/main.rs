//! # Ritmo: follow-up cadence runner
//!
//! Usage:
//!   ritmo run                                  # Claim loop (every poll_interval_secs)
//!   ritmo pass                                 # One claim pass, JSON summary
//!   ritmo mark-sent <quote> --org acme --value 1800 --email rita@client.pt
//!   ritmo status <quote> won                   # Business status change
//!   ritmo show <quote>                         # Quote, events and tasks as JSON

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ritmo_channels::{LogEmailTransport, SmtpEmailTransport, TemplateSet};
use ritmo_core::RitmoConfig;
use ritmo_core::traits::{EmailTransport, OrgDirectory};
use ritmo_core::types::{BusinessStatus, CancelReason, Contact};
use ritmo_scheduler::claims::default_worker_id;
use ritmo_scheduler::{
    BusinessCalendar, CadenceDb, CadenceGenerator, ClaimProcessor, ConfigOrgDirectory,
    LoopSettings, spawn_scheduler,
};

#[derive(Parser)]
#[command(
    name = "ritmo",
    version,
    about = "⏱️ Ritmo: follow-up cadences for sent quotes"
)]
struct Cli {
    /// Config file (default: ~/.ritmo/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path, overrides [database].path
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run claim passes until Ctrl-C
    Run {
        /// Render emails to the log instead of sending
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single claim pass and print its summary
    Pass {
        #[arg(long)]
        dry_run: bool,
    },
    /// A quote was sent (or resent): start a new cadence run
    MarkSent {
        quote_id: String,
        #[arg(long)]
        org: String,
        #[arg(long, default_value_t = 0.0)]
        value: f64,
        #[arg(long)]
        title: Option<String>,
        /// RFC 3339 send instant (default: now)
        #[arg(long)]
        sent_at: Option<String>,
        #[arg(long)]
        contact_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Record a business status change (draft, sent, negotiation, won, lost)
    Status { quote_id: String, status: String },
    /// Cancel a quote's pending follow-ups
    Cancel { quote_id: String },
    /// Mark an event done by hand
    Complete { event_id: String },
    /// Mark a follow-up task done
    CompleteTask { task_id: String },
    /// Skip an event
    Skip { event_id: String },
    /// Print a quote with its events and tasks
    Show { quote_id: String },
    /// Validate the configuration and exit
    CheckConfig,
    /// Write a default config to ~/.ritmo/config.toml if none exists
    InitConfig,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<RitmoConfig> {
    let mut config = match &cli.config {
        Some(path) => RitmoConfig::load_from(&expand_path(path))?,
        None => RitmoConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_db(config: &RitmoConfig) -> Result<Arc<CadenceDb>> {
    let path = config.database.expanded_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = CadenceDb::open(&path, config.database.busy_timeout_ms)
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(db))
}

fn email_transport(config: &RitmoConfig, dry_run: bool) -> Result<Arc<dyn EmailTransport>> {
    let templates = TemplateSet::from_config(&config.email);
    if dry_run {
        return Ok(Arc::new(LogEmailTransport::new(templates)));
    }
    if config.email.smtp_host.trim().is_empty() {
        tracing::warn!("⚠️ email.smtp_host not set, emails will only be logged");
        return Ok(Arc::new(LogEmailTransport::new(templates)));
    }
    Ok(Arc::new(SmtpEmailTransport::new(&config.email, templates)?))
}

fn processor(config: &RitmoConfig, db: Arc<CadenceDb>, dry_run: bool) -> Result<ClaimProcessor> {
    let calendar = BusinessCalendar::from_config(&config.calendar)?;
    let worker_id = config
        .scheduler
        .worker_id
        .clone()
        .unwrap_or_else(default_worker_id);
    Ok(ClaimProcessor::new(
        db.clone(),
        calendar,
        Arc::new(ConfigOrgDirectory::from_config(config)),
        db,
        email_transport(config, dry_run)?,
    )
    .with_worker_id(worker_id)
    .with_max_attempts(config.scheduler.max_attempts))
}

fn generator(config: &RitmoConfig, db: Arc<CadenceDb>) -> Result<CadenceGenerator> {
    Ok(CadenceGenerator::new(
        db,
        BusinessCalendar::from_config(&config.calendar)?,
        config.cadence.clone(),
    ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "ritmo=debug,ritmo_scheduler=debug,ritmo_channels=debug"
    } else {
        "ritmo=info,ritmo_scheduler=info,ritmo_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::InitConfig = cli.command {
        let path = RitmoConfig::default_path();
        if path.exists() {
            println!("⚠️  {} already exists.", path.display());
        } else {
            RitmoConfig::default().save()?;
            println!("✅ Wrote {}", path.display());
        }
        return Ok(());
    }

    let config = load_config(&cli)?;

    match &cli.command {
        // Handled before the config is loaded.
        Command::InitConfig => {}
        Command::CheckConfig => {
            BusinessCalendar::from_config(&config.calendar)?;
            println!("✅ Configuration OK");
            println!("   Database: {}", config.database.expanded_path().display());
            println!("   Timezone: {}", config.calendar.default_timezone);
            println!("   Organizations: {}", config.organizations.len());
        }
        Command::Run { dry_run } => {
            let db = open_db(&config)?;
            let processor = Arc::new(processor(&config, db, *dry_run)?);
            let settings = LoopSettings {
                poll_interval_secs: config.scheduler.poll_interval_secs,
                batch_size: config.scheduler.batch_size,
                claim_timeout_minutes: config.scheduler.claim_timeout_minutes,
            };
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let runner = tokio::spawn(spawn_scheduler(processor, settings, shutdown_rx));
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down...");
            shutdown_tx.send(true).ok();
            let totals = runner.await?;
            print_json(&totals)?;
        }
        Command::Pass { dry_run } => {
            let db = open_db(&config)?;
            let processor = processor(&config, db, *dry_run)?;
            let summary = processor
                .run_claim_pass(
                    config.scheduler.batch_size,
                    config.scheduler.claim_timeout_minutes,
                )
                .await?;
            print_json(&summary)?;
        }
        Command::MarkSent {
            quote_id,
            org,
            value,
            title,
            sent_at,
            contact_name,
            email,
            phone,
        } => {
            let db = open_db(&config)?;
            let sent_at = match sent_at {
                Some(s) => DateTime::parse_from_rfc3339(s)
                    .with_context(|| format!("invalid --sent-at '{s}'"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            if let Some(title) = title {
                let mut quote = db
                    .find_quote(quote_id)?
                    .unwrap_or_else(|| ritmo_core::types::Quote::draft(quote_id, org, title, *value));
                quote.title = title.clone();
                db.upsert_quote(&quote)?;
            }
            if contact_name.is_some() || email.is_some() || phone.is_some() {
                db.upsert_contact(
                    quote_id,
                    &Contact {
                        name: contact_name.clone().unwrap_or_default(),
                        email: email.clone(),
                        phone: phone.clone(),
                    },
                )?;
            }
            let timezone = ConfigOrgDirectory::from_config(&config)
                .org_timezone(org)
                .await?;
            let run = generator(&config, db)?
                .generate_cadence_events(quote_id, org, sent_at, *value, &timezone)?;
            print_json(&run)?;
        }
        Command::Status { quote_id, status } => {
            let status: BusinessStatus = status.parse()?;
            let db = open_db(&config)?;
            let cancelled = generator(&config, db)?.on_business_status_change(quote_id, status)?;
            println!("Quote {quote_id} → {status} ({cancelled} follow-up(s) cancelled)");
        }
        Command::Cancel { quote_id } => {
            let db = open_db(&config)?;
            let cancelled =
                generator(&config, db)?.cancel_pending_cadence(quote_id, CancelReason::Manual)?;
            println!("Quote {quote_id}: {cancelled} follow-up(s) cancelled");
        }
        Command::Complete { event_id } => {
            let db = open_db(&config)?;
            let stage = processor(&config, db, true)?.complete_event(event_id)?;
            match stage {
                Some(stage) => println!("Event {event_id} completed, quote now at {stage}"),
                None => println!("Event {event_id} completed"),
            }
        }
        Command::CompleteTask { task_id } => {
            let db = open_db(&config)?;
            let stage = processor(&config, db, true)?.complete_task(task_id)?;
            match stage {
                Some(stage) => println!("Task {task_id} completed, quote now at {stage}"),
                None => println!("Task {task_id} completed"),
            }
        }
        Command::Skip { event_id } => {
            let db = open_db(&config)?;
            processor(&config, db, true)?.skip_event(event_id)?;
            println!("Event {event_id} skipped");
        }
        Command::Show { quote_id } => {
            let db = open_db(&config)?;
            let quote = db.get_quote(quote_id)?;
            let events = db.events_for_quote(quote_id)?;
            let tasks = db.tasks_for_quote(quote_id)?;
            print_json(&serde_json::json!({
                "quote": quote,
                "events": events,
                "tasks": tasks,
            }))?;
        }
    }

    Ok(())
}
