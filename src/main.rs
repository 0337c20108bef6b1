use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use ulid::Ulid;

use blockcal::config::Config;
use blockcal::engine::{Calendar, Granularity};
use blockcal::gateway::PersistenceGateway;
use blockcal::http::{local_id, HttpGateway};
use blockcal::model::{BlockKind, Candidate, Ms, Recurrence, RecurrencePattern};
use blockcal::store::LocalStore;

/// blockcal - manage blocked periods of a listing's calendar
#[derive(Debug, Parser)]
#[command(name = "blockcal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored blocks of a resource
    List {
        #[arg(long, short, value_parser = parse_id)]
        resource: Ulid,
    },
    /// Show the day, week or month view around a date
    Query {
        #[arg(long, short, value_parser = parse_id)]
        resource: Ulid,
        #[arg(long, short)]
        date: NaiveDate,
        #[arg(long, default_value = "day")]
        view: Granularity,
    },
    /// Block a time period
    Block {
        #[arg(long, short, value_parser = parse_id)]
        resource: Ulid,
        /// RFC 3339, or `YYYY-MM-DDTHH:MM` in the configured offset
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "owner-block")]
        kind: BlockKind,
        #[arg(long)]
        reason: Option<String>,
        /// Repeat daily, weekly, weekdays or weekends
        #[arg(long, requires = "until")]
        repeat: Option<RecurrencePattern>,
        /// Last date that may carry a repetition
        #[arg(long)]
        until: Option<NaiveDate>,
    },
    /// Block every day of the view around a date
    BlockView {
        #[arg(long, short, value_parser = parse_id)]
        resource: Ulid,
        #[arg(long, short)]
        date: NaiveDate,
        #[arg(long)]
        view: Granularity,
    },
    /// Remove a block
    Remove {
        #[arg(long, short, value_parser = parse_id)]
        resource: Ulid,
        #[arg(long, value_parser = parse_id)]
        id: Ulid,
    },
    /// Free windows of a day
    Open {
        #[arg(long, short, value_parser = parse_id)]
        resource: Ulid,
        #[arg(long, short)]
        date: NaiveDate,
    },
    /// Rewrite the local WAL
    Compact {
        /// Compact even below the configured threshold
        #[arg(long)]
        force: bool,
    },
}

/// Remote integer ids or ULIDs.
fn parse_id(raw: &str) -> Result<Ulid, String> {
    if let Ok(n) = raw.parse::<u64>() {
        return Ok(local_id(n));
    }
    Ulid::from_string(raw).map_err(|e| format!("not an id: {e}"))
}

fn parse_instant(raw: &str, tz: FixedOffset) -> Result<Ms, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    let local = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| format!("{raw}: {e}"))?;
    local
        .and_local_timezone(tz)
        .single()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| format!("{raw}: not a valid local time"))
}

fn print(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    blockcal::observability::init(config.metrics_port)?;

    let mut local = None;
    let gateway: Arc<dyn PersistenceGateway> = match &config.api {
        Some(api) => {
            info!(url = %api.base_url, "using remote API");
            Arc::new(HttpGateway::new(api, &config.credentials)?)
        }
        None => {
            std::fs::create_dir_all(&config.data_dir)?;
            let store = Arc::new(LocalStore::open(config.wal_path())?);
            local = Some(store.clone());
            store
        }
    };
    let tz = config.utc_offset;
    let calendar = Calendar::with_policy(gateway, tz, config.policy);

    match cli.command {
        Command::List { resource } => print(&calendar.intervals(resource).await?)?,
        Command::Query { resource, date, view } => print(&calendar.query(resource, date, view).await?)?,
        Command::Block {
            resource,
            start,
            end,
            kind,
            reason,
            repeat,
            until,
        } => {
            let mut candidate = Candidate::new(parse_instant(&start, tz)?, parse_instant(&end, tz)?, kind);
            if let Some(reason) = reason {
                candidate = candidate.with_reason(reason);
            }
            if let (Some(pattern), Some(until)) = (repeat, until) {
                candidate = candidate.with_recurrence(Recurrence { pattern, until });
            }
            let applied = calendar.propose(resource, candidate).await?;
            print(&json!({ "message": applied.message(), "result": applied }))?;
        }
        Command::BlockView { resource, date, view } => {
            let applied = calendar.block_entire_view(resource, date, view).await?;
            print(&json!({ "message": applied.message(), "result": applied }))?;
        }
        Command::Remove { resource, id } => {
            let removal = calendar.remove(resource, id).await?;
            print(&json!({ "id": id, "result": removal }))?;
        }
        Command::Open { resource, date } => print(&calendar.open_spans(resource, date).await?)?,
        Command::Compact { force } => {
            let Some(store) = &local else {
                return Err("compact needs the local store (unset BLOCKCAL_API_URL)".into());
            };
            let threshold = if force { 0 } else { config.compact_threshold };
            let ran = store.compact_if_needed(threshold).await?;
            print(&json!({ "compacted": ran }))?;
            return Ok(());
        }
    }

    if let Some(store) = local
        && store.compact_if_needed(config.compact_threshold).await?
    {
        info!("WAL compacted");
    }
    Ok(())
}
