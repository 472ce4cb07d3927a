//! `points` command surface over the SQLite-backed ledger.
//!
//! - [`run_cli`] executes a parsed [`Cli`] and writes JSON to stdout.
//! - [`run_cli_to`] does the same against any writer, for embedding and tests.
//! - [`run_command`] executes a single [`Command`] against an existing engine.
//!
//! Logs go to stderr through [`init_tracing`] so stdout stays machine-readable.

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use points_ledger_core::{
    lot_lifetime_from_days, parse_minor_units, parse_rfc3339_utc, Clock, EarnRequest,
    HistoryFilter, IssueSeverity, JournalKind, LedgerCheck, LedgerConfig, LedgerEngine, LedgerError, LedgerStore, UserId,
};
use points_ledger_store_sqlite::SqliteLedgerStore;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "points")]
#[command(about = "Expiring reward-points ledger")]
pub struct Cli {
    #[arg(long, default_value = "./points_ledger.sqlite3")]
    db: PathBuf,

    /// TOML file with rates, lot lifetime, lock timeout and rounding.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Credit points for a purchase (idempotent per --reference).
    Earn(EarnArgs),
    /// Redeem points, soonest-expiring lots first.
    Redeem(RedeemArgs),
    /// Retire lots past their validity.
    Expire(ExpireArgs),
    /// Show a user's current balance.
    Balance(UserArgs),
    /// List a user's lots with their remaining amounts and states.
    Lots(UserArgs),
    /// List a user's journal entries, optionally filtered.
    History(HistoryArgs),
    /// Audit balances against lots; exits non-zero when unhealthy.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct EarnArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    reference: String,
    /// Purchase amount as a decimal with at most two fractional digits.
    #[arg(long)]
    amount: String,
    #[arg(long)]
    category: String,
    #[arg(long)]
    occurred_at: Option<String>,
    #[arg(long)]
    lifetime_days: Option<i64>,
    #[arg(long)]
    product_code: Option<String>,
}

#[derive(Debug, Args)]
pub struct RedeemArgs {
    #[arg(long)]
    user: i64,
    #[arg(long, allow_negative_numbers = true)]
    points: i64,
}

#[derive(Debug, Args)]
pub struct ExpireArgs {
    /// Evaluate expiry as of this RFC3339 UTC instant instead of the clock.
    #[arg(long, conflicts_with = "every")]
    now: Option<String>,
    /// Repeat the sweep every N seconds.
    #[arg(long, requires = "runs")]
    every: Option<u64>,
    /// Number of sweeps when running on a cadence.
    #[arg(long, requires = "every")]
    runs: Option<u32>,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: i64,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    until: Option<String>,
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Earn,
    Redeem,
    Expire,
}

#[derive(Debug, Serialize)]
struct BalanceView {
    user_id: UserId,
    balance: i64,
}

/// Installs the stderr subscriber. `POINTS_LOG` overrides the filter and
/// `POINTS_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("POINTS_LOG")
        .unwrap_or_else(|_| EnvFilter::new("points_ledger=info,warn"));

    let format = env::var("POINTS_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    let _ = match format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_cli_to(cli, &mut out)
}

pub fn run_cli_to<W: Write>(cli: Cli, out: &mut W) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_command_with_db(&cli.db, config, cli.command, out)
}

pub fn run_command_with_db<W: Write>(
    db_path: &Path,
    config: LedgerConfig,
    command: Command,
    out: &mut W,
) -> Result<()> {
    let store = SqliteLedgerStore::open_and_migrate(db_path)?;
    let mut engine = LedgerEngine::new(store, config)?;
    run_command(command, &mut engine, out)
}

pub fn run_command<S: LedgerStore, C: Clock, W: Write>(
    command: Command,
    engine: &mut LedgerEngine<S, C>,
    out: &mut W,
) -> Result<()> {
    match command {
        Command::Earn(args) => {
            let request = EarnRequest {
                user_id: UserId(args.user),
                external_reference: args.reference,
                amount_minor: parse_minor_units(&args.amount)?,
                category: args.category,
                occurred_at: match args.occurred_at.as_deref() {
                    Some(raw) => parse_rfc3339_utc(raw)?,
                    None => engine.clock().now(),
                },
                lot_lifetime: args
                    .lifetime_days
                    .map(|days| {
                        lot_lifetime_from_days(days).ok_or_else(|| {
                            LedgerError::InvalidInput(format!(
                                "lifetime_days is out of range: {days}"
                            ))
                        })
                    })
                    .transpose()?,
                product_code: args.product_code,
            };
            let result = engine.earn(&request)?;
            write_json(out, &result)
        }
        Command::Redeem(args) => {
            let result = engine.redeem(UserId(args.user), args.points)?;
            write_json(out, &result)
        }
        Command::Expire(args) => run_expire(&args, engine, out),
        Command::Balance(args) => {
            let user_id = UserId(args.user);
            let balance = engine.current_balance(user_id)?;
            write_json(out, &BalanceView { user_id, balance })
        }
        Command::Lots(args) => {
            let lots = engine.lots(UserId(args.user))?;
            write_json(out, &lots)
        }
        Command::History(args) => {
            let filter = HistoryFilter {
                from: args.from.as_deref().map(parse_rfc3339_utc).transpose()?,
                until: args.until.as_deref().map(parse_rfc3339_utc).transpose()?,
                kind: args.kind.map(map_kind),
                limit: args.limit,
            };
            let entries = engine.history(UserId(args.user), &filter)?;
            write_json(out, &entries)
        }
        Command::Check(args) => {
            let check = engine.check()?;
            if args.json {
                write_json(out, &check)?;
            } else {
                print_ledger_check(out, &check)?;
            }

            if !check.healthy {
                return Err(anyhow!(
                    "ledger consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .filter(|item| item.severity == IssueSeverity::Error)
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}

fn run_expire<S: LedgerStore, C: Clock, W: Write>(
    args: &ExpireArgs,
    engine: &mut LedgerEngine<S, C>,
    out: &mut W,
) -> Result<()> {
    let (Some(every), Some(runs)) = (args.every, args.runs) else {
        let now = match args.now.as_deref() {
            Some(raw) => parse_rfc3339_utc(raw)?,
            None => engine.clock().now(),
        };
        let summary = engine.expire_due(now)?;
        return write_json(out, &summary);
    };

    for run in 1..=runs {
        let now = engine.clock().now();
        let summary = engine.expire_due(now)?;
        writeln!(out, "{}", serde_json::to_string(&summary)?)?;
        out.flush()?;
        info!(run, runs, every_secs = every, "expiry cadence tick");

        if run < runs {
            std::thread::sleep(std::time::Duration::from_secs(every));
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    let Some(path) = path else {
        return Ok(LedgerConfig::default());
    };

    let raw = std::fs::read_to_string(path).map_err(|err| {
        LedgerError::Configuration(format!("failed to read config {}: {err}", path.display()))
    })?;
    Ok(LedgerConfig::from_toml_str(&raw)?)
}

fn map_kind(value: KindArg) -> JournalKind {
    match value {
        KindArg::Earn => JournalKind::Earn,
        KindArg::Redeem => JournalKind::Redeem,
        KindArg::Expire => JournalKind::Expire,
    }
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn print_ledger_check<W: Write>(out: &mut W, check: &LedgerCheck) -> Result<()> {
    writeln!(out, "contract={}", check.contract_version)?;
    writeln!(out, "users_checked={}", check.users_checked)?;
    writeln!(out, "healthy={}", if check.healthy { "yes" } else { "no" })?;
    for item in &check.issues {
        let severity = match item.severity {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        let user = item
            .user_id
            .map_or_else(|| "-".to_string(), |user_id| user_id.to_string());
        writeln!(out, "{severity}:{}:user={user}:{}", item.code, item.message)?;
    }
    if check.issues.iter().any(|item| item.code == "expiry_pending") {
        writeln!(out, "hint=run `points expire` to retire overdue lots")?;
    }
    Ok(())
}

/// Renders an error as `error[<kind>]: <message>`. Failures that are not
/// ledger errors (opening the database, an unhealthy check) report as
/// `storage_failure`.
#[must_use]
pub fn render_error(err: &anyhow::Error) -> String {
    match err
        .chain()
        .find_map(|cause| cause.downcast_ref::<LedgerError>())
    {
        Some(ledger_err) => format!("error[{}]: {ledger_err}", ledger_err.kind().as_str()),
        None => format!("error[storage_failure]: {err:#}"),
    }
}
