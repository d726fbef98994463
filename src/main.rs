//! mail-triage command-line front end
//!
//! Thin collaborator over the [`mail_triage`] library: loads configuration,
//! runs one command, and prints a JSON envelope to stdout. Logs go to stderr.

use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use mail_triage::analysis::Analyzer;
use mail_triage::config::{ServerPreset, TriageConfig};
use mail_triage::errors::{AppError, AppResult};
use mail_triage::filter::RecordFilter;
use mail_triage::gemini::GeminiClient;
use mail_triage::models::{Envelope, Meta, Priority, SearchFilter};
use mail_triage::pipeline::{AnalyzeMode, Pipeline};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Fetch recent mail over IMAP and triage it with a generative model
///
/// Settings come from `MAIL_TRIAGE_*` environment variables (optionally in a
/// `.env` file); flags override them for one run.
#[derive(Debug, Parser)]
#[command(name = "mail-triage", version, about)]
struct Cli {
    /// Host preset used when no explicit host is set
    #[arg(long, global = true, value_enum)]
    preset: Option<ServerPreset>,
    /// Explicit IMAP host
    #[arg(long, global = true)]
    host: Option<String>,
    /// Account identifier
    #[arg(long, global = true)]
    user: Option<String>,
    /// Folder to read
    #[arg(long, global = true)]
    folder: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in, check the server, and log out
    Verify,
    /// List the newest messages without analysis
    List(FetchArgs),
    /// List the newest messages and analyze each one
    Triage(TriageArgs),
    /// List models that can generate content
    Models,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Maximum number of messages, newest first
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// Server-side subject filter
    #[arg(long)]
    subject: Option<String>,
}

#[derive(Debug, Args)]
struct TriageArgs {
    #[command(flatten)]
    fetch: FetchArgs,
    /// Keep only records mentioning this text
    #[arg(long)]
    keyword: Option<String>,
    /// Keep only records with this priority
    #[arg(long, value_parser = parse_priority)]
    priority: Option<Priority>,
    /// Keep only records with this category
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorOutput<'a> {
    code: &'a str,
    message: String,
    detail: String,
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    match Priority::parse(value) {
        Priority::Unknown if !value.trim().eq_ignore_ascii_case("unknown") => Err(format!(
            "unknown priority '{value}'; expected high, medium, low or unknown"
        )),
        priority => Ok(priority),
    }
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, runs one command and
/// writes its envelope to stdout. Ctrl-C cancels an in-progress fetch; the
/// session is still logged out.
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received; cancelling");
            on_interrupt.cancel();
        }
    });

    let started = Instant::now();
    match run(cli, &cancel).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "command failed");
            let output = ErrorOutput {
                code: e.code(),
                message: e.user_message(),
                detail: e.to_string(),
            };
            let envelope = Envelope {
                summary: "command failed".to_owned(),
                data: output,
                meta: Meta::now(duration_ms(started)),
            };
            if let Ok(text) = serde_json::to_string_pretty(&envelope) {
                println!("{text}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, cancel: &CancellationToken) -> AppResult<String> {
    let started = Instant::now();
    let mut config = TriageConfig::load_from_env()?;
    if let Some(preset) = cli.preset {
        config.preset = preset;
    }
    if let Some(host) = cli.host {
        config.host = Some(host);
    }
    if let Some(user) = cli.user {
        config.user = Some(user);
    }
    if let Some(folder) = cli.folder {
        config.session.folder = folder;
    }

    let client = GeminiClient::new(&config.analysis)?;
    match cli.command {
        Command::Models => {
            let api_key = config.api_key()?;
            let models = client.list_models(&api_key).await?;
            let summary = format!("{} models support content generation", models.len());
            render(started, summary, models)
        }
        Command::Verify => {
            let credentials = config.credentials()?;
            let pipeline = Pipeline::new(
                config.session.clone(),
                Analyzer::new(client, &config.analysis),
            );
            let report = pipeline.verify(&credentials).await?;
            let summary = format!("logged in to {} in {} ms", report.host, report.latency_ms);
            render(started, summary, report)
        }
        Command::List(args) => {
            let credentials = config.credentials()?;
            let pipeline = Pipeline::new(
                config.session.clone(),
                Analyzer::new(client, &config.analysis),
            );
            let filter = SearchFilter::from_query(args.subject.as_deref());
            let list = pipeline
                .list_messages(&credentials, &filter, args.limit, cancel)
                .await?;
            let summary = format!("{} messages from {}", list.len(), config.session.folder);
            render(started, summary, list.records())
        }
        Command::Triage(args) => {
            let credentials = config.credentials()?;
            let api_key = config.api_key()?;
            let pipeline = Pipeline::new(
                config.session.clone(),
                Analyzer::new(client, &config.analysis),
            );
            let filter = SearchFilter::from_query(args.fetch.subject.as_deref());
            let list = pipeline
                .list_messages(&credentials, &filter, args.fetch.limit, cancel)
                .await?;
            pipeline
                .analyze_all(&api_key, &list, AnalyzeMode::UseCached)
                .await;

            let projection = RecordFilter {
                keyword: args.keyword,
                priority: args.priority,
                category: args.category,
            };
            let records = list.filtered(&projection);
            let summary = format!(
                "{} of {} messages analyzed and shown",
                records.len(),
                list.len()
            );
            render(started, summary, records)
        }
    }
}

fn render<T: Serialize>(started: Instant, summary: String, data: T) -> AppResult<String> {
    let envelope = Envelope {
        summary,
        data,
        meta: Meta::now(duration_ms(started)),
    };
    serde_json::to_string_pretty(&envelope)
        .map_err(|e| AppError::invalid(format!("cannot render output: {e}")))
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command, parse_priority};
    use mail_triage::models::Priority;

    #[test]
    fn triage_flags_parse_into_filters() {
        let cli = Cli::try_parse_from([
            "mail-triage",
            "--preset",
            "outlook",
            "triage",
            "--limit",
            "3",
            "--subject",
            "invoice",
            "--priority",
            "high",
        ])
        .expect("valid arguments");
        assert!(matches!(cli.preset, Some(mail_triage::config::ServerPreset::Outlook)));
        match cli.command {
            Command::Triage(args) => {
                assert_eq!(args.fetch.limit, 3);
                assert_eq!(args.fetch.subject.as_deref(), Some("invoice"));
                assert_eq!(args.priority, Some(Priority::High));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn priority_flag_rejects_unrecognized_values() {
        assert_eq!(parse_priority("Medium"), Ok(Priority::Medium));
        assert_eq!(parse_priority("unknown"), Ok(Priority::Unknown));
        assert!(parse_priority("urgent").is_err());
    }
}
