//! filegate - command-line front end for the approval core.
//!
//! Exposes the public engine operations for panels and operators, and
//! hosts the background placement retry worker. Authentication happens
//! upstream; the acting username is passed with `--actor` (or the
//! `FILEGATE_ACTOR` environment variable) and resolved through the
//! configured identity source.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use filegate_core::archive::ArchiveKind;
use filegate_core::config::EngineConfig;
use filegate_core::deadline::Deadline;
use filegate_core::engine::ApprovalEngine;
use filegate_core::error::EngineError;
use filegate_core::listing::{ListFilter, SortKey};
use filegate_core::submission::{Submission, SubmissionState};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// filegate - multi-role file approval workflow
#[derive(Parser, Debug)]
#[command(name = "filegate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "filegate.toml")]
    config: PathBuf,

    /// Acting username (authentication happens upstream)
    #[arg(short, long, env = "FILEGATE_ACTOR")]
    actor: Option<String>,

    /// Per-operation deadline in seconds
    #[arg(long, default_value = "30")]
    deadline_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit an uploaded file for team-leader review
    Submit {
        /// Path of the uploaded artifact
        upload_path: PathBuf,
        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,
        /// Free-form tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Withdraw a submission awaiting team-leader review
    Withdraw {
        /// Submission id
        id: String,
    },
    /// Forward a submission to the admin stage
    TlApprove {
        /// Submission id
        id: String,
    },
    /// Reject a submission at the team-leader stage
    TlReject {
        /// Submission id
        id: String,
        /// Rejection reason
        #[arg(long)]
        reason: String,
    },
    /// Render the final approval
    AdminApprove {
        /// Submission id
        id: String,
    },
    /// Render the final rejection
    AdminReject {
        /// Submission id
        id: String,
        /// Rejection reason
        #[arg(long)]
        reason: String,
    },
    /// Comment on a submission
    Comment {
        /// Submission id
        id: String,
        /// Comment body
        body: String,
    },
    /// Show one submission (live queue or archives)
    Show {
        /// Submission id
        id: String,
    },
    /// List visible submissions
    List {
        /// Keep only this state (wire form, e.g. PENDING_ADMIN)
        #[arg(long)]
        state: Option<String>,
        /// Keep only this team
        #[arg(long)]
        team: Option<String>,
        /// Keep only this submitter
        #[arg(long)]
        submitter: Option<String>,
        /// Substring match over filename, description, and submitter
        #[arg(long)]
        text: Option<String>,
        /// Sort key: submitted-at, filename, submitter, state
        #[arg(long, default_value = "submitted-at")]
        sort: String,
    },
    /// Show archived submissions of one outcome
    Archive {
        /// Outcome: approved, rejected-admin, rejected-tl, withdrawn
        kind: String,
    },
    /// Show the actor's notification inbox
    Inbox {
        /// Only unread notifications
        #[arg(long)]
        unread_only: bool,
    },
    /// Mark one notification read
    MarkRead {
        /// Notification id
        notification_id: String,
    },
    /// Mark the whole inbox read
    MarkAllRead,
    /// Show open manual-placement requests
    Requests,
    /// Run placement retry sweeps
    Worker {
        /// Run one sweep and exit
        #[arg(long)]
        once: bool,
    },
    /// One-shot ingest of a legacy monolithic comments document
    MigrateComments {
        /// Path of the legacy comments file
        legacy_file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let config = if cli.config.exists() {
        EngineConfig::from_file(&cli.config).context("failed to load configuration")?
    } else {
        info!(config = %cli.config.display(), "no config file found, using defaults");
        EngineConfig::default()
    };
    let retry_interval = Duration::from_secs(config.retry_interval_seconds);

    let engine = ApprovalEngine::with_file_identity(config);
    if engine.degraded() {
        warn!("shared store unreachable: operating in degraded mode");
    }

    let deadline = Deadline::after(Duration::from_secs(cli.deadline_seconds));
    match run(&cli, &engine, deadline, retry_interval) {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<EngineError>() {
            Some(engine_err) => bail!("{}: {engine_err}", engine_err.code()),
            None => Err(e),
        },
    }
}

#[allow(clippy::too_many_lines)]
fn run(
    cli: &Cli,
    engine: &ApprovalEngine,
    deadline: Deadline,
    retry_interval: Duration,
) -> Result<()> {
    match &cli.command {
        Command::Submit {
            upload_path,
            description,
            tags,
        } => {
            let outcome = engine.submit(
                actor(cli)?,
                upload_path,
                description,
                tags.clone(),
                deadline,
            )?;
            println!("submitted {}", outcome.submission.id);
        },
        Command::Withdraw { id } => {
            engine.withdraw(actor(cli)?, id, deadline)?;
            println!("withdrawn {id}");
        },
        Command::TlApprove { id } => {
            let outcome = engine.tl_approve(actor(cli)?, id, deadline)?;
            println!("{id} -> {}", outcome.submission.state);
        },
        Command::TlReject { id, reason } => {
            let outcome = engine.tl_reject(actor(cli)?, id, reason, deadline)?;
            println!("{id} -> {}", outcome.submission.state);
        },
        Command::AdminApprove { id } => {
            let outcome = engine.admin_approve(actor(cli)?, id, deadline)?;
            let placement = outcome
                .submission
                .placement_outcome
                .map_or("unknown", |o| o.as_str());
            println!("{id} -> {} (placement: {placement})", outcome.submission.state);
        },
        Command::AdminReject { id, reason } => {
            let outcome = engine.admin_reject(actor(cli)?, id, reason, deadline)?;
            println!("{id} -> {}", outcome.submission.state);
        },
        Command::Comment { id, body } => {
            engine.add_comment(actor(cli)?, id, body, deadline)?;
            println!("comment recorded on {id}");
        },
        Command::Show { id } => {
            let submission = engine.get(actor(cli)?, id)?;
            println!("{}", serde_json::to_string_pretty(&submission)?);
        },
        Command::List {
            state,
            team,
            submitter,
            text,
            sort,
        } => {
            let filter = ListFilter {
                state: state
                    .as_deref()
                    .map(|s| {
                        SubmissionState::parse(s)
                            .ok_or_else(|| anyhow::anyhow!("unknown state: {s}"))
                    })
                    .transpose()?,
                team: team.clone(),
                submitter: submitter.clone(),
                text: text.clone(),
                sort: parse_sort(sort)?,
            };
            let result = engine.list(actor(cli)?, &filter, deadline)?;
            for sub in &result.submissions {
                print_row(sub);
            }
            let c = result.counts;
            println!(
                "total {} | pending-tl {} | pending-admin {} | approved {} | rejected {} | withdrawn {}",
                c.total,
                c.pending_team_leader,
                c.pending_admin,
                c.approved,
                c.rejected,
                c.withdrawn
            );
        },
        Command::Archive { kind } => {
            let kind = parse_archive_kind(kind)?;
            for sub in engine.archived(actor(cli)?, kind)? {
                print_row(&sub);
            }
        },
        Command::Inbox { unread_only } => {
            for n in engine.get_inbox(actor(cli)?, *unread_only)? {
                let flag = if n.read { " " } else { "*" };
                println!("{flag} {}  {:<16} {}  {}", n.id, n.kind.as_str(), n.at, n.payload);
            }
        },
        Command::MarkRead { notification_id } => {
            engine.mark_read(actor(cli)?, notification_id, deadline)?;
            println!("marked {notification_id} read");
        },
        Command::MarkAllRead => {
            let flipped = engine.mark_all_read(actor(cli)?, deadline)?;
            println!("marked {flipped} notifications read");
        },
        Command::Requests => {
            for request in engine.placement_requests()? {
                println!(
                    "{}  {} -> {}  ({})",
                    request.submission_id,
                    request.from.display(),
                    request.to.display(),
                    request.reason
                );
            }
        },
        Command::Worker { once } => run_worker(engine, retry_interval, *once)?,
        Command::MigrateComments { legacy_file } => {
            let stats = engine.migrate_legacy_comments(legacy_file, deadline)?;
            println!(
                "migrated {} comments across {} threads ({} skipped)",
                stats.imported, stats.threads, stats.skipped
            );
        },
    }
    Ok(())
}

fn actor(cli: &Cli) -> Result<&str> {
    cli.actor
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("this command needs --actor (or FILEGATE_ACTOR)"))
}

fn parse_sort(raw: &str) -> Result<SortKey> {
    match raw.to_lowercase().as_str() {
        "submitted-at" | "submitted_at" => Ok(SortKey::SubmittedAt),
        "filename" => Ok(SortKey::Filename),
        "submitter" => Ok(SortKey::Submitter),
        "state" => Ok(SortKey::State),
        other => bail!("unknown sort key: {other}"),
    }
}

fn parse_archive_kind(raw: &str) -> Result<ArchiveKind> {
    match raw.to_lowercase().as_str() {
        "approved" => Ok(ArchiveKind::Approved),
        "rejected-admin" | "rejected_admin" => Ok(ArchiveKind::RejectedByAdmin),
        "rejected-tl" | "rejected_tl" => Ok(ArchiveKind::RejectedByTeamLeader),
        "withdrawn" => Ok(ArchiveKind::Withdrawn),
        other => bail!("unknown archive kind: {other}"),
    }
}

fn print_row(sub: &Submission) {
    println!(
        "{}  {:<24} {:<10} {:<10} {}",
        sub.id,
        sub.state.as_str(),
        sub.submitter_username,
        sub.submitter_team,
        sub.original_filename
    );
}

/// The placement retry worker: one sweep per interval.
fn run_worker(engine: &ApprovalEngine, interval: Duration, once: bool) -> Result<()> {
    info!(interval_secs = interval.as_secs(), once, "placement retry worker started");
    loop {
        match engine.retry_placements(Deadline::after(interval)) {
            Ok(stats) => {
                if stats.scanned > 0 {
                    info!(
                        scanned = stats.scanned,
                        promoted = stats.promoted,
                        failed = stats.failed,
                        "placement sweep complete"
                    );
                }
            },
            Err(e) => warn!(error = %e, "placement sweep failed"),
        }
        if once {
            return Ok(());
        }
        std::thread::sleep(interval);
    }
}
