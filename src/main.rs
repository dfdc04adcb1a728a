use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::admission::{Admission, AdmissionRequest, Pipeline};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::ScopeType;
use gatekeeper::store::{self, ListKind};
use gatekeeper::{Administration, Timestamp};

/// Gatekeeper - request admission control
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about = "Evaluate requests against rate limits, lists and bot detection")]
struct Cli {
    /// Configuration file (YAML); GATEKEEPER__* variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one request, optionally several times in a row
    Check {
        /// Caller IP
        #[arg(long)]
        ip: String,

        /// Request path
        #[arg(long)]
        path: String,

        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,

        /// User-Agent header
        #[arg(long)]
        user_agent: Option<String>,

        /// Client fingerprint for callers sharing an IP
        #[arg(long)]
        fingerprint: Option<String>,

        /// Number of times to send the request
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Simulated spacing between repeated requests, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Print each admission as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate JSON-lines requests and print one admission per line
    Replay {
        /// Input file; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Show the rate limit key, list membership and counter state of a caller
    Stats {
        /// Scope type (ip, user, ip_user, ...)
        #[arg(long, default_value = "ip")]
        scope: ScopeType,

        /// Caller IP (or other identifier)
        #[arg(long)]
        identifier: String,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        user: Option<String>,
    },

    /// Manage the whitelist and blacklist
    List {
        #[arg(value_enum)]
        list: ListArg,

        #[command(subcommand)]
        action: ListAction,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListArg {
    Whitelist,
    Blacklist,
}

impl From<ListArg> for ListKind {
    fn from(list: ListArg) -> Self {
        match list {
            ListArg::Whitelist => ListKind::Whitelist,
            ListArg::Blacklist => ListKind::Blacklist,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ListAction {
    /// Add an IP or user id
    Add {
        identifier: String,

        /// Expire the entry after this many seconds
        #[arg(long)]
        expire_secs: Option<u64>,
    },
    /// Remove an IP or user id
    Remove { identifier: String },
    /// Print the live entries
    Show,
}

/// One line of `replay` output.
#[derive(Serialize)]
struct AdmissionLine<'a> {
    status: u16,
    headers: BTreeMap<String, String>,
    #[serde(flatten)]
    admission: &'a Admission,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    let store = store::open(&config.store)
        .await
        .context("failed to open counter store")?;
    let pipeline = Pipeline::new(config, store);

    match cli.command {
        Command::Check {
            ip,
            path,
            user,
            user_agent,
            fingerprint,
            repeat,
            interval_ms,
            json,
        } => {
            let start = Timestamp::now();
            for i in 0..repeat.max(1) {
                let mut request = AdmissionRequest::new(
                    ip.clone(),
                    path.clone(),
                    start + Duration::from_millis(interval_ms * i as u64),
                );
                request.user_id = user.clone();
                request.user_agent = user_agent.clone();
                request.fingerprint = fingerprint.clone();

                let admission = pipeline.admit(&request).await;
                if json {
                    println!("{}", render_json(&pipeline, &admission)?);
                } else {
                    println!("#{:<3} {}", i + 1, describe(&pipeline, &admission));
                }
            }
        }

        Command::Replay { input } => {
            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    Box::new(BufReader::new(file))
                }
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };

            tokio::select! {
                result = replay(&pipeline, reader) => result?,
                _ = shutdown_signal() => {}
            }

            let snapshot = pipeline.metrics().snapshot();
            info!(
                total = snapshot.total(),
                allowed = snapshot.allowed,
                denied = snapshot.denied,
                challenged = snapshot.challenged,
                fail_open = snapshot.fail_open,
                "Replay finished"
            );
        }

        Command::Stats {
            scope,
            identifier,
            endpoint,
            user,
        } => {
            let admin = Administration::for_pipeline(&pipeline);
            let stats = admin
                .stats(scope, &identifier, endpoint.as_deref(), user.as_deref(), Timestamp::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::List { list, action } => {
            let admin = Administration::for_pipeline(&pipeline);
            let list = ListKind::from(list);
            let now = Timestamp::now();

            match action {
                ListAction::Add {
                    identifier,
                    expire_secs,
                } => {
                    let entry = admin
                        .list_add(list, &identifier, expire_secs.map(Duration::from_secs), now)
                        .await?;
                    println!("{}", serde_json::to_string(&entry)?);
                }
                ListAction::Remove { identifier } => {
                    if !admin.list_remove(list, &identifier).await? {
                        warn!(list = %list, identifier = %identifier, "Identifier was not listed");
                    }
                }
                ListAction::Show => {
                    for entry in admin.list(list, now).await? {
                        println!("{}", serde_json::to_string(&entry)?);
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn replay(
    pipeline: &Pipeline,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
) -> anyhow::Result<()> {
    let mut lines = reader.lines();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request: AdmissionRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping malformed request");
                continue;
            }
        };

        let admission = pipeline.admit(&request).await;
        println!("{}", render_json(pipeline, &admission)?);
    }

    Ok(())
}

fn render_json(pipeline: &Pipeline, admission: &Admission) -> anyhow::Result<String> {
    let (status, headers) = pipeline.render(admission);
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    Ok(serde_json::to_string(&AdmissionLine {
        status: status.as_u16(),
        headers,
        admission,
    })?)
}

fn describe(pipeline: &Pipeline, admission: &Admission) -> String {
    let (status, headers) = pipeline.render(admission);
    let mut line = format!("{} {:?}", status.as_u16(), admission.decision);
    for (name, value) in &headers {
        line.push_str(&format!(" {}={}", name, value.to_str().unwrap_or_default()));
    }
    if admission.degraded {
        line.push_str(" (degraded)");
    }
    line
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
