use std::path::PathBuf;

use anyhow::Context;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod db;
mod models;
mod reconcile;
mod report;
mod session;
mod source;
mod upstream;

use models::ClassAttendanceEntry;
use session::{BlobStore, SessionStore, StoredUser};
use source::{AttendanceSource, FixtureSource, RollCallClient, Submission};

const MAX_SESSION_HOURS: i64 = 24 * 366;
const MAX_SINCE_DAYS: i64 = 3650;

#[derive(Parser)]
#[command(name = "rollcall-attendance")]
#[command(about = "Reconcile the day's class schedule against roll-call sign records", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Config {
    /// Roll-call backend endpoint
    #[arg(long, global = true, env = "ROLLCALL_BASE_URL", default_value = source::DEFAULT_BASE_URL)]
    base_url: String,
    /// Read saved responses from this directory instead of calling the backend
    #[arg(long, global = true, env = "ROLLCALL_FIXTURES")]
    fixtures: Option<PathBuf>,
    /// Session key to use instead of the stored session
    #[arg(long, global = true, env = "ROLLCALL_SESSION_KEY", hide_env_values = true)]
    session_key: Option<String>,
    /// Session store file
    #[arg(long, global = true, env = "ROLLCALL_STORE", default_value = ".rollcall/session.json")]
    store: PathBuf,
    /// Hours a stored session stays valid
    #[arg(
        long,
        global = true,
        env = "ROLLCALL_SESSION_HOURS",
        default_value_t = session::DEFAULT_EXPIRY_HOURS,
        value_parser = clap::value_parser!(i64).range(1..=MAX_SESSION_HOURS)
    )]
    session_hours: i64,
    /// Device code sent with sign-ins and sign-outs; defaults to the stored one
    #[arg(long, global = true, env = "ROLLCALL_PHONE_CODE", hide_env_values = true)]
    phone_code: Option<String>,
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, env = "ROLLCALL_LOG", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the reconciled day
    Show {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Write a markdown report for the day
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "attendance.md")]
        out: PathBuf,
    },
    /// Export the reconciled day as CSV
    Export {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "attendance.csv")]
        csv: PathBuf,
    },
    /// Manage the stored session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Create or upgrade the archive schema
    InitDb,
    /// Store the reconciled day in the archive
    Archive {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List archived classes
    History {
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(1..=MAX_SINCE_DAYS))]
        since_days: i64,
    },
    /// Count archived anomalies per lesson
    Summary {
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=MAX_SINCE_DAYS))]
        since_days: i64,
    },
    /// Sign in to one of the day's classes
    SignIn {
        /// Class number as printed by `show`
        #[arg(long)]
        lesson: usize,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Sign out of one of the day's classes
    SignOut {
        /// Class number as printed by `show`
        #[arg(long)]
        lesson: usize,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Save a session key
    Set {
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "")]
        user_name: String,
        #[arg(long, default_value = "")]
        user_code: String,
        /// Device code issued at login
        #[arg(long, default_value = "")]
        client_id: String,
    },
    /// Show the stored session
    Show,
    /// Forget the stored session
    Clear {
        /// Remove the whole store file, not just the session
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rollcall_attendance={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

impl Config {
    fn sessions(&self) -> anyhow::Result<SessionStore> {
        let expiry = Duration::try_hours(self.session_hours.max(1))
            .with_context(|| format!("session length of {} hours is out of range", self.session_hours))?;
        Ok(SessionStore::new(BlobStore::new(&self.store)).with_expiry(expiry))
    }

    fn live_client(&self) -> anyhow::Result<RollCallClient> {
        anyhow::ensure!(
            self.fixtures.is_none(),
            "sign-in and sign-out need the live backend, not --fixtures"
        );
        RollCallClient::new(self.base_url.clone()).context("failed to build HTTP client")
    }

    /// Explicit code first, then the one saved with the session.
    fn phone_code(&self) -> anyhow::Result<String> {
        if let Some(code) = self.phone_code.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(code.to_string());
        }
        let stored = self.sessions()?.load_user().context("failed to read session store")?;
        stored
            .map(|user| user.client_id)
            .filter(|id| !id.trim().is_empty())
            .context("no device code; pass --phone-code or run `session set --client-id <ID>`")
    }

    fn attendance_source(&self) -> anyhow::Result<Box<dyn AttendanceSource>> {
        Ok(match &self.fixtures {
            Some(dir) => {
                info!(dir = %dir.display(), "using fixture responses");
                Box::new(FixtureSource::new(dir))
            }
            None => Box::new(
                RollCallClient::new(self.base_url.clone()).context("failed to build HTTP client")?,
            ),
        })
    }

    /// Explicit key first, then the stored session. Blank means logged out.
    fn session_key(&self) -> anyhow::Result<String> {
        if let Some(key) = self.session_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_string());
        }
        let stored = self
            .sessions()?
            .session_key(Utc::now())
            .context("failed to read session store")?;
        Ok(stored.unwrap_or_default())
    }

    async fn reconcile_day(&self, date: NaiveDate) -> anyhow::Result<Vec<ClassAttendanceEntry>> {
        let source = self.attendance_source()?;
        let session_key = self.session_key()?;
        if session_key.is_empty() {
            eprintln!(
                "No session key. Run `rollcall-attendance session set --token <KEY>` or set ROLLCALL_SESSION_KEY."
            );
        }
        let now = Local::now().naive_local();
        let entries = reconcile::reconcile(source.as_ref(), date, &session_key, now)
            .await
            .with_context(|| format!("failed to reconcile attendance for {date}"))?;
        info!(%date, entries = entries.len(), "reconciled attendance");
        Ok(entries)
    }

    /// Reconciles `date` against the live backend and returns class `lesson`
    /// with the client and session key needed to submit for it.
    async fn live_class(
        &self,
        date: NaiveDate,
        lesson: usize,
        now: NaiveDateTime,
    ) -> anyhow::Result<(RollCallClient, String, ClassAttendanceEntry)> {
        let client = self.live_client()?;
        let session_key = self.session_key()?;
        anyhow::ensure!(
            !session_key.is_empty(),
            "no session key; run `rollcall-attendance session set --token <KEY>` or set ROLLCALL_SESSION_KEY"
        );
        let entries = reconcile::reconcile(&client, date, &session_key, now)
            .await
            .with_context(|| format!("failed to reconcile attendance for {date}"))?;
        let entry = pick_class(entries, lesson)
            .with_context(|| format!("no class #{lesson} with a sign record on {date}"))?;
        Ok((client, session_key, entry))
    }
}

fn pick_class(entries: Vec<ClassAttendanceEntry>, lesson: usize) -> Option<ClassAttendanceEntry> {
    entries.into_iter().find(|entry| entry.order_index == lesson)
}

async fn connect_db() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance for archive commands")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// The `since_days` days up to and including `until`.
fn window(until: NaiveDate, since_days: i64) -> anyhow::Result<(NaiveDate, NaiveDate)> {
    let since = Duration::try_days(since_days.max(1))
        .and_then(|span| until.checked_sub_signed(span))
        .with_context(|| format!("a window of {since_days} days reaches past the calendar"))?;
    Ok((since, until))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level);
    let config = &cli.config;

    match cli.command {
        Commands::Show { date, json } => {
            let entries = config.reconcile_day(date.unwrap_or_else(today)).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            if entries.is_empty() {
                println!("No classes to show.");
                return Ok(());
            }

            for entry in &entries {
                println!("{}", report::entry_line(entry));
            }
        }
        Commands::Report { date, out } => {
            let date = date.unwrap_or_else(today);
            let entries = config.reconcile_day(date).await?;
            let report = report::build_day_report(date, Local::now().naive_local(), &entries);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { date, csv } => {
            let entries = config.reconcile_day(date.unwrap_or_else(today)).await?;
            let file = std::fs::File::create(&csv)
                .with_context(|| format!("failed to create {}", csv.display()))?;
            report::write_csv(&entries, file)?;
            println!("Exported {} classes to {}.", entries.len(), csv.display());
        }
        Commands::Session { action } => {
            let sessions = config.sessions()?;
            match action {
                SessionAction::Set {
                    token,
                    user_name,
                    user_code,
                    client_id,
                } => {
                    anyhow::ensure!(!token.trim().is_empty(), "token must not be empty");
                    sessions.save_user(
                        &StoredUser {
                            token,
                            user_name,
                            user_code,
                            client_id,
                        },
                        Utc::now(),
                    )?;
                    println!("Session saved to {}.", sessions.path().display());
                }
                SessionAction::Show => match sessions.load_user()? {
                    Some(user) => {
                        let state = if sessions.is_expired(Utc::now())? {
                            "expired"
                        } else {
                            "active"
                        };
                        let saved = sessions
                            .saved_at()?
                            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        println!(
                            "{} ({}) session {}, saved {}",
                            user.user_name, user.user_code, state, saved
                        );
                    }
                    None => println!("No stored session."),
                },
                SessionAction::Clear { all: false } => {
                    sessions.clear_user()?;
                    println!("Session cleared.");
                }
                SessionAction::Clear { all: true } => {
                    BlobStore::new(&config.store).clear()?;
                    println!("Removed {}.", config.store.display());
                }
            }
        }
        Commands::InitDb => {
            let pool = connect_db().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Archive { date } => {
            let date = date.unwrap_or_else(today);
            let entries = config.reconcile_day(date).await?;
            let pool = connect_db().await?;
            let written = db::archive_entries(&pool, &entries).await?;
            println!("Archived {written} classes for {date}.");
        }
        Commands::History { since_days } => {
            let (since, until) = window(today(), since_days)?;
            let pool = connect_db().await?;
            let history = db::fetch_history(&pool, since, until).await?;

            if history.is_empty() {
                println!("No archived classes for this window.");
                return Ok(());
            }

            for entry in history {
                println!(
                    "{} #{} {} ({}): {}",
                    entry.lesson_date,
                    entry.order_index,
                    entry.lesson_name,
                    entry.class_room_name,
                    entry
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| entry.situation.to_string())
                );
            }
        }
        Commands::Summary { since_days } => {
            let (since, until) = window(today(), since_days)?;
            let pool = connect_db().await?;
            let counts = db::fetch_situation_counts(&pool, since, until).await?;
            print!("{}", report::build_summary(since, until, &counts));
        }
        Commands::SignIn { lesson, date } => {
            let now = Local::now().naive_local();
            let phone_code = config.phone_code()?;
            let (client, session_key, entry) =
                config.live_class(date.unwrap_or_else(today), lesson, now).await?;
            let submission = Submission::sign_in(&entry, now)?;
            client.sign_in(&session_key, &submission, &phone_code).await?;
            let kind = if submission.late { "late" } else { "on time" };
            println!("Signed in to #{} {} ({kind}).", entry.order_index, entry.lesson_name);
        }
        Commands::SignOut { lesson, date } => {
            let now = Local::now().naive_local();
            let phone_code = config.phone_code()?;
            let (client, session_key, entry) =
                config.live_class(date.unwrap_or_else(today), lesson, now).await?;
            let submission = Submission::sign_out(&entry, now)?;
            client.sign_out(&session_key, &submission, &phone_code).await?;
            println!("Signed out of #{} {}.", entry.order_index, entry.lesson_name);
        }
    }

    Ok(())
}
