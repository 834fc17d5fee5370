//! Tally CLI - Track income and expenses from the command line
//!
//! Works fully offline; point it at an account with TALLY_OWNER and
//! TALLY_API_URL to mirror records to the server.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use tally_core::merge::MergeService;
use tally_core::models::{NewTransaction, SyncReport};
use tally_core::remote::{HttpRemoteClient, RemoteConfig};
use tally_core::router::DataRouter;
use tally_core::store::TransactionStore;
use tally_core::sync::SyncEngine;
use tally_core::{
    OwnerContext, OwnerId, SyncStatus, Transaction, TransactionId, TransactionKind,
};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Track income and expenses from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a transaction
    #[command(alias = "new")]
    Add {
        /// Amount in major units, e.g. 12.50
        amount: String,
        /// Spending/income category
        category: String,
        /// Free-form description
        description: Vec<String>,
        /// Record as income instead of an expense
        #[arg(long)]
        income: bool,
        /// Transaction date (YYYY-MM-DD, today when omitted)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
        /// Merchant name
        #[arg(long)]
        merchant: Option<String>,
    },
    /// List transactions, newest first
    List {
        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Include archived transactions
        #[arg(long)]
        archived: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a transaction
    Delete {
        /// Transaction ID
        id: String,
    },
    /// Income/expense summary over a date range (current month by default)
    Summary {
        /// Range start (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        from: Option<String>,
        /// Range end (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        to: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile local records with the remote store
    Sync,
    /// Move a guest's local history into the signed-in account and sync
    Merge {
        /// Guest owner id to absorb
        guest: String,
    },
    /// Show un-synced record count and last sync time
    Pending,
    /// List recently detected sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Remote(#[from] tally_core::remote::RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid amount '{0}': expected a positive value like 12.50")]
    InvalidAmount(String),
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Invalid transaction ID: {0}")]
    InvalidTransactionId(String),
    #[error(
        "This command needs an account. Set TALLY_OWNER and TALLY_API_URL (and optionally TALLY_API_TOKEN)."
    )]
    AccountRequired,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally=warn".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Some(Commands::Add {
            amount,
            category,
            description,
            income,
            date,
            merchant,
        }) => {
            let session = open_session(&db_path).await?;
            run_add(
                &session,
                &amount,
                &category,
                &description.join(" "),
                income,
                date.as_deref(),
                merchant,
            )
            .await?;
        }
        Some(Commands::List {
            limit,
            archived,
            json,
        }) => {
            let session = open_session(&db_path).await?;
            run_list(&session, limit, archived, json).await?;
        }
        Some(Commands::Delete { id }) => {
            let session = open_session(&db_path).await?;
            run_delete(&session, &id).await?;
        }
        Some(Commands::Summary { from, to, json }) => {
            let session = open_session(&db_path).await?;
            run_summary(&session, from.as_deref(), to.as_deref(), json).await?;
        }
        Some(Commands::Sync) => {
            let session = open_session(&db_path).await?;
            run_sync(&session).await?;
        }
        Some(Commands::Merge { guest }) => {
            let session = open_session(&db_path).await?;
            run_merge(&session, &guest).await?;
        }
        Some(Commands::Pending) => {
            let session = open_session(&db_path).await?;
            run_pending(&session).await?;
        }
        Some(Commands::Conflicts { limit }) => {
            let session = open_session(&db_path).await?;
            run_conflicts(&session, limit).await?;
        }
        None => {
            Cli::command().print_help().map_err(CliError::Io)?;
            println!();
        }
    }

    Ok(())
}

/// One opened database plus the owner context resolved from the environment
struct Session {
    store: TransactionStore,
    router: DataRouter<HttpRemoteClient>,
    engine: SyncEngine<HttpRemoteClient>,
    ctx: OwnerContext,
    /// True when real API settings were found in the environment
    configured: bool,
}

/// Remote API settings resolved from the environment
struct ApiSettings {
    owner: String,
    base_url: String,
    token: Option<String>,
}

fn api_settings_from_env() -> Option<ApiSettings> {
    let owner = env::var("TALLY_OWNER").ok().filter(|v| !v.trim().is_empty())?;
    let base_url = env::var("TALLY_API_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())?;
    let token = env::var("TALLY_API_TOKEN")
        .ok()
        .filter(|v| !v.trim().is_empty());
    Some(ApiSettings {
        owner,
        base_url,
        token,
    })
}

async fn open_session(db_path: &Path) -> Result<Session, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = tally_core::db::Database::open(db_path).await?;
    let store = TransactionStore::new(db.connection().clone());

    let (ctx, remote, configured) = match api_settings_from_env() {
        Some(settings) => {
            let mut config = RemoteConfig::new(settings.base_url)?;
            if let Some(token) = settings.token {
                config = config.with_auth_token(token);
            }
            let client = HttpRemoteClient::new(config)?;
            (
                OwnerContext::authenticated(OwnerId::new(settings.owner)?),
                client,
                true,
            )
        }
        None => {
            // Offline-only session. The placeholder client is never called:
            // nothing dispatches to the remote for a guest context.
            let owner = env::var("TALLY_OWNER").unwrap_or_else(|_| "local".to_string());
            let config = RemoteConfig::new("http://localhost:1")?;
            let client = HttpRemoteClient::new(config)?;
            (OwnerContext::guest(OwnerId::new(owner)?), client, false)
        }
    };

    let remote = Arc::new(remote);
    let router = DataRouter::new(store.clone(), Arc::clone(&remote));
    let engine = SyncEngine::new(store.clone(), remote);

    Ok(Session {
        store,
        router,
        engine,
        ctx,
        configured,
    })
}

async fn run_add(
    session: &Session,
    amount: &str,
    category: &str,
    description: &str,
    income: bool,
    date: Option<&str>,
    merchant: Option<String>,
) -> Result<(), CliError> {
    let amount_minor = parse_amount_minor(amount)?;
    let date = match date {
        Some(raw) => parse_date(raw)?,
        None => Utc::now().date_naive(),
    };
    let kind = if income {
        TransactionKind::Income
    } else {
        TransactionKind::Expense
    };

    let tx = session
        .router
        .create(
            &session.ctx,
            NewTransaction {
                date,
                category: category.to_string(),
                description: description.to_string(),
                amount_minor,
                kind,
                merchant,
            },
        )
        .await?;
    // The process is about to exit; give the background push a chance
    session.router.drain_pushes().await;

    println!("{}", tx.id);
    Ok(())
}

async fn run_list(
    session: &Session,
    limit: usize,
    archived: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let mut transactions = session.router.get_all(&session.ctx, archived).await?;
    transactions.truncate(limit);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&transactions)?);
    } else {
        for line in format_transaction_lines(&transactions) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_delete(session: &Session, id: &str) -> Result<(), CliError> {
    let id = parse_transaction_id(id)?;
    session.router.delete(&session.ctx, &id).await?;
    session.router.drain_pushes().await;
    println!("{id}");
    Ok(())
}

async fn run_summary(
    session: &Session,
    from: Option<&str>,
    to: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let today = Utc::now().date_naive();
    let from = match from {
        Some(raw) => parse_date(raw)?,
        None => month_start(today),
    };
    let to = match to {
        Some(raw) => parse_date(raw)?,
        None => today,
    };

    let summary = session.router.get_analytics(&session.ctx, from, to).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{from} .. {to}");
    println!("  income   {:>12}", format_amount(summary.income_minor));
    println!("  expenses {:>12}", format_amount(summary.expense_minor));
    println!("  net      {:>12}", format_amount(summary.net_minor()));
    if !summary.by_category.is_empty() {
        println!();
        for category in &summary.by_category {
            println!(
                "  {:<16} {:>12}  ({})",
                category.category,
                format_amount(category.net_minor),
                category.count
            );
        }
    }
    Ok(())
}

async fn run_sync(session: &Session) -> Result<(), CliError> {
    if !session.configured {
        return Err(CliError::AccountRequired);
    }
    let report = session.engine.sync(&session.ctx).await?;
    print_sync_report(&report);
    Ok(())
}

async fn run_merge(session: &Session, guest: &str) -> Result<(), CliError> {
    if !session.configured {
        return Err(CliError::AccountRequired);
    }
    let guest = OwnerId::new(guest)?;
    let service = MergeService::new(session.store.clone(), session.engine.clone());
    let report = service.merge_guest_data(&guest, &session.ctx).await?;
    print_sync_report(&report);
    Ok(())
}

async fn run_pending(session: &Session) -> Result<(), CliError> {
    let pending = session.router.pending_count(&session.ctx).await?;
    println!("pending changes: {pending}");
    match session.store.last_synced_at(&session.ctx.owner_id).await? {
        Some(at) => println!("last sync: {}", format_timestamp(at)),
        None => println!("last sync: never"),
    }
    Ok(())
}

async fn run_conflicts(session: &Session, limit: usize) -> Result<(), CliError> {
    let conflicts = session.store.list_conflicts(limit).await?;
    if conflicts.is_empty() {
        println!("no conflicts recorded");
        return Ok(());
    }
    for conflict in conflicts {
        println!(
            "{}  {}  local@{}  remote@{}",
            format_timestamp(conflict.detected_at),
            conflict.transaction_id,
            conflict.local_updated_at,
            conflict.incoming_updated_at
        );
    }
    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    println!(
        "uploaded {}  downloaded {}  deleted {}  conflicts {}",
        report.uploaded, report.downloaded, report.deleted, report.conflicts
    );
    for error in &report.errors {
        eprintln!("warning: {error}");
    }
    if report.success() {
        println!("Sync completed");
    } else {
        println!("Sync finished with {} failure(s)", report.errors.len());
    }
}

fn format_transaction_lines(transactions: &[Transaction]) -> Vec<String> {
    transactions
        .iter()
        .map(|tx| {
            let short_id = tx.id.to_string().chars().take(8).collect::<String>();
            let amount = format_amount(tx.signed_amount_minor());
            let marker = status_marker(tx.sync_status);
            format!(
                "{short_id}  {}  {amount:>12}  {:<14}  {}{marker}",
                tx.date, tx.category, tx.description
            )
        })
        .collect()
}

const fn status_marker(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Synced => "",
        SyncStatus::Local | SyncStatus::PendingUpload => "  *",
        SyncStatus::PendingDelete => "  (deleting)",
    }
}

/// Parse a major-unit amount like "12.50" into positive minor units
fn parse_amount_minor(raw: &str) -> Result<i64, CliError> {
    let trimmed = raw.trim();
    let invalid = || CliError::InvalidAmount(raw.to_string());

    let (major, cents) = match trimmed.split_once('.') {
        Some((major, frac)) => {
            if frac.is_empty() || frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let mut frac = frac.to_string();
            while frac.len() < 2 {
                frac.push('0');
            }
            (major, frac.parse::<i64>().map_err(|_| invalid())?)
        }
        None => (trimmed, 0),
    };

    if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let major: i64 = major.parse().map_err(|_| invalid())?;
    let minor = major
        .checked_mul(100)
        .and_then(|m| m.checked_add(cents))
        .ok_or_else(invalid)?;
    if minor == 0 {
        return Err(invalid());
    }
    Ok(minor)
}

fn format_amount(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

fn parse_date(raw: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| CliError::InvalidDate(raw.to_string()))
}

fn parse_transaction_id(raw: &str) -> Result<TransactionId, CliError> {
    raw.trim()
        .parse::<TransactionId>()
        .map_err(|_| CliError::InvalidTransactionId(raw.to_string()))
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn format_timestamp(unix_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(unix_ms)
        .map_or_else(|| unix_ms.to_string(), |dt| dt.format("%Y-%m-%d %H:%M").to_string())
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TALLY_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("tally.db")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{
        format_amount, format_transaction_lines, month_start, open_session, parse_amount_minor,
        parse_date, parse_transaction_id, run_add, run_delete, CliError, Session,
    };
    use chrono::NaiveDate;
    use tally_core::models::SyncStatus;

    #[test]
    fn parse_amount_minor_accepts_major_and_cents() {
        assert_eq!(parse_amount_minor("12.50").unwrap(), 1250);
        assert_eq!(parse_amount_minor("12.5").unwrap(), 1250);
        assert_eq!(parse_amount_minor("12").unwrap(), 1200);
        assert_eq!(parse_amount_minor(" 7.03 ").unwrap(), 703);
    }

    #[test]
    fn parse_amount_minor_rejects_bad_input() {
        for raw in ["", "abc", "12.345", "12.", "-4", "0", "0.00", "1,50"] {
            assert!(
                matches!(parse_amount_minor(raw), Err(CliError::InvalidAmount(_))),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn format_amount_renders_sign_and_cents() {
        assert_eq!(format_amount(1250), "12.50");
        assert_eq!(format_amount(-703), "-7.03");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(0), "0.00");
    }

    #[test]
    fn parse_date_requires_iso_format() {
        assert_eq!(
            parse_date("2024-05-17").unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
        );
        assert!(matches!(
            parse_date("17/05/2024"),
            Err(CliError::InvalidDate(_))
        ));
    }

    #[test]
    fn parse_transaction_id_rejects_garbage() {
        assert!(matches!(
            parse_transaction_id("not-a-uuid"),
            Err(CliError::InvalidTransactionId(_))
        ));
    }

    #[test]
    fn month_start_clamps_to_first_day() {
        assert_eq!(
            month_start(NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
    }

    async fn guest_session(db_path: &PathBuf) -> Session {
        // No TALLY_API_URL in the test environment, so this resolves to a
        // guest session that never touches the network
        open_session(db_path).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_list_delete_round_trip_offline() {
        let db_path = unique_test_db_path();
        let session = guest_session(&db_path).await;

        run_add(
            &session,
            "12.50",
            "groceries",
            "weekly shop",
            false,
            Some("2024-05-17"),
            None,
        )
        .await
        .unwrap();

        let listed = session
            .router
            .get_all(&session.ctx, true)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].amount_minor, 1250);
        assert_eq!(listed[0].sync_status, SyncStatus::Local);

        let lines = format_transaction_lines(&listed);
        assert!(lines[0].contains("-12.50"));
        assert!(lines[0].contains("groceries"));
        assert!(lines[0].ends_with('*'));

        run_delete(&session, &listed[0].id.to_string())
            .await
            .unwrap();
        assert!(session
            .router
            .get_all(&session.ctx, true)
            .await
            .unwrap()
            .is_empty());

        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_requires_account_configuration() {
        let db_path = unique_test_db_path();
        let session = guest_session(&db_path).await;

        let error = super::run_sync(&session).await.unwrap_err();
        assert!(matches!(error, CliError::AccountRequired));

        cleanup_db_files(&db_path);
    }

    fn unique_test_db_path() -> PathBuf {
        static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_nanos());
        let sequence = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("tally-cli-test-{timestamp}-{sequence}.db"))
    }

    fn cleanup_db_files(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
    }
}
