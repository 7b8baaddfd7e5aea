#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use tierwise::audit::{AuditSink, JsonlAuditSink};
use tierwise::evaluation::run_synthetic_suite;
use tierwise::merger::MergeOptions;
use tierwise::node::Ranking;
use tierwise::reducer::{ReducerSnapshot, TournamentReducer};
use tierwise::session::{MergeSession, MergeStatus, ReductionSession, SessionError, SessionStatus};
use tierwise::store::{new_session_id, SqliteSessionStore};
use tierwise::Decision;

#[derive(Parser)]
#[command(name = "tierwise", version, about = "Human-judged tiered ranking")]
struct Cli {
    /// SQLite database (defaults to $TIERWISE_DB, then .tierwise.sqlite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or replace a category's item pool
    CategoryAdd {
        #[arg(long)]
        id: String,
        /// Comma-separated item identifiers
        #[arg(long, value_delimiter = ',', required = true)]
        items: Vec<String>,
    },
    /// Append categories to a rater's rotation
    Assign {
        #[arg(long)]
        rater: String,
        #[arg(long = "category", required = true)]
        categories: Vec<String>,
    },
    /// Rank the rater's categories interactively (decisions on stdin)
    Rank {
        #[arg(long)]
        rater: String,
        /// Write the audit log here instead of the database
        #[arg(long)]
        audit_jsonl: Option<PathBuf>,
    },
    /// Merge rankings interactively (decisions on stdin)
    Merge {
        /// JSON array of rankings; omit to resume `--session`
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        session: Option<String>,
        /// JSON merge options ({"group_by": 1, "window_policy": "carry"})
        #[arg(long)]
        options: Option<PathBuf>,
        /// Write the merged ranking here as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print a stored session
    Show {
        #[arg(long)]
        session: String,
    },
    /// Export the audit tables to JSONL
    AuditExport {
        #[arg(long)]
        out: PathBuf,
    },
    /// Run synthetic evaluation suite
    Eval {
        #[arg(long)]
        case: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let db = cli.db.unwrap_or_else(SqliteSessionStore::default_path);

    match cli.command {
        Commands::CategoryAdd { id, items } => {
            let store = SqliteSessionStore::new(db)?;
            let items: Vec<String> = items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
            store.put_category(&id, &items).await?;
            println!("category {id}: {} items", items.len());
        }
        Commands::Assign { rater, categories } => {
            let store = SqliteSessionStore::new(db)?;
            store.assign_categories(&rater, &categories).await?;
            println!("assigned {} categories to {rater}", categories.len());
        }
        Commands::Rank { rater, audit_jsonl } => {
            let store = Arc::new(SqliteSessionStore::new(db)?);
            let _lock = store.lock_exclusive()?;
            let mut worker = None;
            let sink: Arc<dyn AuditSink> = match audit_jsonl {
                Some(path) => {
                    let (sink, jsonl_worker) = JsonlAuditSink::new(path)?;
                    worker = Some(jsonl_worker);
                    Arc::new(sink)
                }
                None => store.clone(),
            };
            let session = ReductionSession::resume(store.clone(), &rater)
                .await?
                .with_audit(sink);
            run_rank(session).await?;
            if let Some(worker) = worker {
                worker.join()?;
            }
        }
        Commands::Merge {
            input,
            session,
            options,
            out,
        } => {
            let store = Arc::new(SqliteSessionStore::new(db)?);
            let _lock = store.lock_exclusive()?;
            let session = match (input, session) {
                (Some(input), session_id) => {
                    let rankings: Vec<Ranking> =
                        serde_json::from_str(&std::fs::read_to_string(input)?)?;
                    let options = match options {
                        Some(path) => MergeOptions::from_path(path)?,
                        None => MergeOptions::default(),
                    };
                    let session_id = session_id.unwrap_or_else(new_session_id);
                    MergeSession::start(store.clone(), &session_id, rankings, options).await?
                }
                (None, Some(session_id)) => MergeSession::resume(store.clone(), &session_id).await?,
                (None, None) => return Err("merge requires --input or --session".into()),
            };
            let session = session.with_audit(store.clone());
            println!("session {}", session.session_id());
            if let Some(merged) = run_merge(session).await? {
                let line = serde_json::to_string(&merged)?;
                match out {
                    Some(path) => std::fs::write(path, format!("{line}\n"))?,
                    None => println!("merged: {line}"),
                }
            }
        }
        Commands::Show { session } => {
            let store = SqliteSessionStore::new(db)?;
            let record = store
                .session_record(&session)
                .await?
                .ok_or_else(|| format!("unknown session: {session}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if let (Some(state), "reducer") = (&record.state, record.kind.as_str()) {
                let snapshot: ReducerSnapshot = serde_json::from_value(state.clone())?;
                let reducer = TournamentReducer::from_snapshot(snapshot)?;
                if let Some(tree) = reducer.render_champion() {
                    println!("champion: {tree}");
                }
            }
        }
        Commands::AuditExport { out } => {
            let store = SqliteSessionStore::new(db)?;
            let written = store.export_audit_jsonl(out).await?;
            println!("exported {written} audit events");
        }
        Commands::Eval { case, out } => {
            let results = run_synthetic_suite(case.as_deref())?;
            let mut file = File::create(out)?;
            for result in &results {
                let line = serde_json::to_string(result)?;
                writeln!(file, "{line}")?;
            }
        }
    }

    Ok(())
}

enum Input {
    Decision(Decision),
    Retry,
    Quit,
}

/// Prompts on stdout and reads one command from stdin. `None` on EOF.
fn prompt(lines: &mut impl Iterator<Item = io::Result<String>>, question: &str) -> Option<Input> {
    loop {
        println!("{question}");
        print!("> ");
        io::stdout().flush().ok();
        let line = match lines.next()? {
            Ok(line) => line,
            Err(_) => return None,
        };
        match line.trim() {
            "q" | "quit" => return Some(Input::Quit),
            "retry" => return Some(Input::Retry),
            other => match other.parse::<Decision>() {
                Ok(decision) => return Some(Input::Decision(decision)),
                Err(err) => eprintln!("{err}"),
            },
        }
    }
}

async fn run_rank(
    mut session: ReductionSession<SqliteSessionStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    if let Some(pool) = session.pool() {
        println!("category {} ({} items)", pool.category_id, pool.items.len());
    }
    loop {
        if !session.is_synced() {
            match prompt(&mut lines, "state not saved; type retry or quit") {
                Some(Input::Retry) => {
                    if let Err(err) = session.retry_persist().await {
                        eprintln!("{err}");
                    }
                    continue;
                }
                _ => return Ok(()),
            }
        }
        let Some((left, right)) = session.current_pair() else {
            if matches!(session.status(), SessionStatus::Exhausted { .. }) {
                println!("all categories complete");
            }
            return Ok(());
        };
        let question = format!("{} ? {}", left.join(","), right.join(","));

        let decision = match prompt(&mut lines, &question) {
            Some(Input::Decision(decision)) => decision,
            Some(Input::Retry) => continue,
            Some(Input::Quit) | None => return Ok(()),
        };
        match session.submit(decision).await {
            Ok(SessionStatus::AwaitingDecision) => {}
            Ok(SessionStatus::CategoryComplete { classes, next }) => {
                println!("classes: {}", serde_json::to_string(&classes)?);
                println!("category {} ({} items)", next.category_id, next.items.len());
            }
            Ok(SessionStatus::Exhausted { classes }) => {
                if let Some(classes) = classes {
                    println!("classes: {}", serde_json::to_string(&classes)?);
                }
                println!("all categories complete");
                return Ok(());
            }
            Err(SessionError::Store(err)) => eprintln!("write failed: {err}"),
            Err(err) => eprintln!("{err}"),
        }
    }
}

async fn run_merge(
    mut session: MergeSession<SqliteSessionStore>,
) -> Result<Option<Ranking>, Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        if let MergeStatus::Done { merged } = session.status() {
            if session.is_synced() {
                return Ok(Some(merged));
            }
        }
        if !session.is_synced() {
            match prompt(&mut lines, "state not saved; type retry or quit") {
                Some(Input::Retry) => {
                    if let Err(err) = session.retry_persist().await {
                        eprintln!("{err}");
                    }
                    continue;
                }
                _ => return Ok(None),
            }
        }
        let Some((element, pivot)) = session.current_pair() else {
            return Ok(None);
        };
        let question = format!("{} ? {}", element.join(","), pivot.join(","));

        let decision = match prompt(&mut lines, &question) {
            Some(Input::Decision(decision)) => decision,
            Some(Input::Retry) => continue,
            Some(Input::Quit) | None => return Ok(None),
        };
        if let Err(err) = session.submit(decision).await {
            eprintln!("{err}");
        }
    }
}
