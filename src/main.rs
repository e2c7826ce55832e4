//! # loom
//!
//! Command-line front end for the answer-stream engine: replay a recorded
//! element stream, ask a live endpoint, and inspect stored threads.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use loom_core::ids::ThreadId;
use loom_core::messages::{Answer, AnswerStatus};
use loom_core::source::ElementSource;
use loom_engine::{CoordinatorConfig, SessionCoordinator, StartRequest};
use loom_settings::{LoomSettings, StreamSettings};
use loom_store::{Database, MessageRepo, ThreadRepo};
use loom_telemetry::{LogQuery, TelemetryConfig, TelemetryGuard};
use loom_transport::{HttpElementSource, ReplaySource};

#[derive(Parser, Debug)]
#[command(name = "loom", about = "Assemble streamed answers into stored threads")]
struct Cli {
    /// Settings file (defaults to `~/.loom/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// SQLite database path (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recorded NDJSON element stream and print the finalized answer.
    Replay {
        file: PathBuf,
        #[arg(long, default_value = "replayed question")]
        question: String,
        /// Existing thread to append to; a new thread is created otherwise.
        #[arg(long)]
        thread: Option<String>,
        /// Use a throwaway in-memory database.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Stream a live answer from the configured endpoint.
    Ask {
        question: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        /// Environment variable holding the bearer token.
        #[arg(long)]
        token_env: Option<String>,
    },
    /// List threads, most recently updated first.
    Threads {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Print a thread and its messages.
    Show { thread_id: String },
    /// Query persisted warn+ logs, newest first.
    Logs {
        /// Show this level and anything more severe (`warn` or `error`).
        #[arg(long, default_value = "warn")]
        level: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

fn coordinator_config(stream: &StreamSettings) -> CoordinatorConfig {
    CoordinatorConfig {
        inactivity_timeout: stream.inactivity_timeout(),
        max_thinking_nodes: stream.max_thinking_nodes,
        max_content_bytes: stream.max_content_bytes,
    }
}

fn telemetry_config(settings: &LoomSettings) -> TelemetryConfig {
    let level = |name: &str| {
        loom_settings::parse_level(name).and_then(|l| l.parse::<tracing::Level>().ok())
    };
    let telemetry = &settings.telemetry;
    TelemetryConfig {
        log_level: level(&telemetry.log_level).unwrap_or(tracing::Level::INFO),
        module_levels: telemetry
            .module_levels
            .iter()
            .filter_map(|(target, name)| Some((target.clone(), level(name)?)))
            .collect(),
        log_to_sqlite: telemetry.log_to_sqlite,
        log_db_path: telemetry.log_db_path.clone(),
    }
}

fn open_database(settings: &LoomSettings, ephemeral: bool) -> Result<Database> {
    if ephemeral {
        return Database::in_memory().context("Failed to open in-memory database");
    }
    let path = &settings.store.db_path;
    Database::open(path).with_context(|| format!("Failed to open database: {}", path.display()))
}

/// Default thread name: the question, cut to a readable length.
fn thread_name_for(question: &str) -> String {
    const MAX_CHARS: usize = 60;
    let trimmed = question.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_CHARS).collect();
    format!("{}…", cut.trim_end())
}

fn resolve_thread(db: &Database, thread: Option<String>, question: &str) -> Result<ThreadId> {
    let repo = ThreadRepo::new(db.clone());
    match thread {
        Some(raw) => {
            let id = ThreadId::from_raw(raw);
            if !repo.exists(&id)? {
                bail!("thread {id} not found");
            }
            Ok(id)
        }
        None => Ok(repo.create(&thread_name_for(question), None)?.id),
    }
}

async fn run_stream(
    source: Arc<dyn ElementSource>,
    db: Database,
    config: CoordinatorConfig,
    request: StartRequest,
) -> Result<Arc<Answer>> {
    let coordinator = SessionCoordinator::new(source, db).with_config(config);
    let handle = coordinator.start(request).await?;
    tracing::info!(stream_id = %handle.id(), thread_id = %handle.thread_id(), "stream started");

    let answer = tokio::select! {
        answer = handle.wait() => answer?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(stream_id = %handle.id(), "interrupted, cancelling stream");
            handle.cancel();
            handle.wait().await?
        }
    };
    Ok(answer)
}

fn print_answer(answer: &Answer) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(answer)?);
    if answer.status == AnswerStatus::Errored {
        let message = answer
            .metadata
            .error_message
            .as_deref()
            .unwrap_or("unknown error");
        bail!("answer stream failed: {message}");
    }
    Ok(())
}

fn log_query(
    level: &str,
    thread: Option<String>,
    stream: Option<String>,
    limit: u32,
) -> Result<LogQuery> {
    let Some(min_level) = loom_settings::parse_level(level).and_then(|l| l.parse::<tracing::Level>().ok()) else {
        bail!("unknown log level {level:?}");
    };
    Ok(LogQuery {
        min_level,
        thread_id: thread,
        stream_id: stream,
        limit,
    })
}

fn query_logs(guard: &TelemetryGuard, query: &LogQuery) -> Result<()> {
    let Some(sink) = guard.logs() else {
        bail!("log persistence is disabled (telemetry.logToSqlite = false)");
    };
    let records = sink.query(query)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => loom_settings::load_settings_from_path(path),
        None => loom_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(db_path) = cli.db_path {
        settings.store.db_path = db_path;
    }

    let telemetry = loom_telemetry::init_telemetry(telemetry_config(&settings));
    let config = coordinator_config(&settings.stream);

    match cli.command {
        Command::Replay {
            file,
            question,
            thread,
            ephemeral,
        } => {
            let db = open_database(&settings, ephemeral)?;
            let thread_id = resolve_thread(&db, thread, &question)?;
            let source: Arc<dyn ElementSource> = Arc::new(ReplaySource::new(file));
            let answer =
                run_stream(source, db, config, StartRequest::new(thread_id, question)).await?;
            print_answer(&answer)
        }
        Command::Ask {
            question,
            thread,
            endpoint,
            token_env,
        } => {
            let Some(endpoint) = endpoint.or_else(|| settings.transport.endpoint.clone()) else {
                bail!("no endpoint configured; pass --endpoint or set transport.endpoint");
            };
            let source: Arc<dyn ElementSource> = Arc::new(HttpElementSource::new(
                &endpoint,
                settings.transport.connect_timeout(),
            )?);

            let db = open_database(&settings, false)?;
            let thread_id = resolve_thread(&db, thread, &question)?;
            let mut request = StartRequest::new(thread_id, question);
            if let Some(var) = token_env {
                let token = std::env::var(&var)
                    .with_context(|| format!("token variable {var} is not set"))?;
                request = request.with_auth_token(SecretString::from(token));
            }

            let answer = run_stream(source, db, config, request).await?;
            print_answer(&answer)
        }
        Command::Threads { limit } => {
            let db = open_database(&settings, false)?;
            let threads = ThreadRepo::new(db).list(limit, 0)?;
            println!("{}", serde_json::to_string_pretty(&threads)?);
            Ok(())
        }
        Command::Show { thread_id } => {
            let db = open_database(&settings, false)?;
            let id = ThreadId::from_raw(thread_id);
            let thread = ThreadRepo::new(db.clone())
                .get(&id)
                .with_context(|| format!("thread {id} not found"))?;
            let messages = MessageRepo::new(db).list(&id)?;
            let out = serde_json::json!({ "thread": thread, "messages": messages });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::Logs {
            level,
            thread,
            stream,
            limit,
        } => query_logs(&telemetry, &log_query(&level, thread, stream, limit)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stream_settings_map_onto_coordinator_config() {
        let stream = StreamSettings {
            inactivity_timeout_secs: 7,
            max_thinking_nodes: 12,
            max_content_bytes: 2048,
        };
        let config = coordinator_config(&stream);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(7));
        assert_eq!(config.max_thinking_nodes, 12);
        assert_eq!(config.max_content_bytes, 2048);
        assert_eq!(
            coordinator_config(&StreamSettings::default()),
            CoordinatorConfig::default()
        );
    }

    #[test]
    fn telemetry_level_falls_back_to_info() {
        let mut settings = LoomSettings::default();
        settings.telemetry.log_level = "debug".into();
        assert_eq!(telemetry_config(&settings).log_level, tracing::Level::DEBUG);
        settings.telemetry.log_level = "chatty".into();
        assert_eq!(telemetry_config(&settings).log_level, tracing::Level::INFO);
    }

    #[test]
    fn module_levels_reach_the_filter() {
        let mut settings = LoomSettings::default();
        settings.telemetry.log_level = "WARNING".into();
        settings
            .telemetry
            .module_levels
            .insert("loom_transport".into(), "debug".into());
        settings
            .telemetry
            .module_levels
            .insert("loom_engine".into(), "trace".into());
        let config = telemetry_config(&settings);
        assert_eq!(
            config.filter_directive(),
            "warn,loom_engine=trace,loom_transport=debug"
        );
    }

    #[test]
    fn log_flags_build_query() {
        let query = log_query("ERROR", Some("thr_1".into()), Some("strm_1".into()), 5).unwrap();
        assert_eq!(query.min_level, tracing::Level::ERROR);
        assert_eq!(query.thread_id.as_deref(), Some("thr_1"));
        assert_eq!(query.stream_id.as_deref(), Some("strm_1"));
        assert_eq!(query.limit, 5);
        assert!(log_query("loud", None, None, 5).is_err());
    }

    #[test]
    fn thread_names_are_truncated() {
        assert_eq!(thread_name_for("  why is the sky blue?  "), "why is the sky blue?");
        let long = "a".repeat(100);
        let name = thread_name_for(&long);
        assert_eq!(name.chars().count(), 61);
        assert!(name.ends_with('…'));
    }

    #[tokio::test]
    async fn replay_runs_through_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.ndjson");
        std::fs::write(
            &path,
            concat!(
                "{\"type\":\"thread_metadata\",\"patch\":{\"thread_name\":\"Sky\"}}\n",
                "{\"type\":\"response_chunk\",\"text\":\"Blue light scatters.\"}\n",
                "{\"type\":\"done\"}\n",
            ),
        )
        .unwrap();

        let db = Database::in_memory().unwrap();
        let thread_id = resolve_thread(&db, None, "why is the sky blue?").unwrap();
        let answer = run_stream(
            Arc::new(ReplaySource::new(&path)),
            db.clone(),
            CoordinatorConfig::default(),
            StartRequest::new(thread_id.clone(), "why is the sky blue?"),
        )
        .await
        .unwrap();

        assert_eq!(answer.status, AnswerStatus::Complete);
        assert_eq!(answer.content, "Blue light scatters.");
        print_answer(&answer).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(MessageRepo::new(db.clone()).count(&thread_id).unwrap(), 2);
        assert_eq!(ThreadRepo::new(db).get(&thread_id).unwrap().name, "Sky");
    }

    #[test]
    fn unknown_thread_is_rejected() {
        let db = Database::in_memory().unwrap();
        assert!(resolve_thread(&db, Some("thr_missing".into()), "q").is_err());
    }
}
