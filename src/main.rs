use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod error;
mod identity;
mod leaderboard;
mod models;
mod quiz;
mod report;
mod store;

use config::{Config, ProviderKind};
use identity::{IdentityProvider, MockIdentityProvider, Session, SignedTokenProvider};
use models::{Identity, LanguageId, NewWeek};
use quiz::QuizContentService;
use store::{DocumentStore, MemoryStore};

#[derive(Parser)]
#[command(name = "chapter-quiz")]
#[command(about = "Weekly quiz, solutions and leaderboard for the chapter", long_about = None)]
struct Cli {
    /// Use a JSON snapshot file as the document store instead of Postgres
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import graded submissions from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Rank participants across every week
    Leaderboard {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Print the full ranking as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown leaderboard report
    Report {
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value = "leaderboard.md")]
        out: PathBuf,
    },
    /// Rebuild the cached leaderboard from user scores
    RefreshCache {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the cached leaderboard
    Cached,
    /// List open weeks and their questions
    Weeks,
    /// Show solutions and explanations for a week
    Solutions {
        #[arg(long)]
        week: i64,
        #[arg(long, default_value = "python")]
        language: String,
    },
    /// Create the next week from a JSON file with a title and up to three questions
    CreateWeek {
        #[arg(long)]
        file: PathBuf,
        /// Keep the week hidden until published
        #[arg(long)]
        hidden: bool,
    },
    /// Open or hide a week
    PublishWeek {
        #[arg(long)]
        week: i64,
        #[arg(long)]
        hide: bool,
    },
    /// Print the number the next created week will get
    NextWeek,
    /// Submit answers for a week as the signed-in participant
    Submit {
        #[arg(long)]
        week: i64,
        /// JSON array with one answer (or null) per question
        #[arg(long)]
        answers: PathBuf,
        /// Identity token from the sign-in page
        #[arg(long, env = "QUIZ_CREDENTIAL", default_value = "")]
        credential: String,
    },
    /// Issue a signed identity token
    IssueToken {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        photo_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chapter_quiz=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    if let Commands::IssueToken {
        email,
        name,
        photo_url,
    } = &cli.command
    {
        let provider = SignedTokenProvider::new(config.session_secret.clone());
        let token = provider.issue(&Identity {
            name: name.clone(),
            email: email.clone(),
            photo_url: photo_url.clone(),
        })?;
        println!("{token}");
        return Ok(());
    }

    let store: Box<dyn DocumentStore> = match &cli.snapshot {
        Some(path) => Box::new(
            MemoryStore::open(path)
                .await
                .with_context(|| format!("failed to open snapshot {}", path.display()))?,
        ),
        None => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(config.require_database_url()?)
                .await
                .context("failed to connect to Postgres")?;

            if matches!(cli.command, Commands::InitDb) {
                db::init_db(&pool).await?;
                println!("Schema ready.");
                return Ok(());
            }
            Box::new(db::PgStore::new(pool))
        }
    };
    let store = store.as_ref();

    match cli.command {
        Commands::InitDb => {
            println!("Snapshot stores need no schema.");
        }
        Commands::Seed => {
            if db::seed(store).await? {
                println!("Seed data inserted.");
            } else {
                println!("Weeks already exist; seed skipped.");
            }
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(store, &csv).await?;
            println!("Inserted {inserted} submissions from {}.", csv.display());
        }
        Commands::Leaderboard { limit, json } => {
            let board = leaderboard::load_leaderboard(store)
                .await
                .context("failed to build the leaderboard")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&board)?);
                return Ok(());
            }
            if board.is_empty() {
                println!("No submissions recorded yet.");
                return Ok(());
            }

            println!("Top participants:");
            for participant in board.iter().take(limit) {
                println!(
                    "{:>3}. {} ({}) {} points, {} brownie, {} solved, streak {}",
                    participant.rank,
                    report::display_name(participant),
                    participant.email,
                    participant.total_points,
                    participant.brownie_points,
                    participant.questions_completed,
                    participant.streak
                );
            }
        }
        Commands::Report { top, out } => {
            let documents = store
                .weekly_documents()
                .await
                .context("failed to load weekly submissions")?;
            let board = leaderboard::aggregate(&documents);
            let report = report::build_report(chrono::Utc::now(), top, &board, &documents);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::RefreshCache { limit } => {
            let cache =
                leaderboard::refresh_cache(store, limit.unwrap_or(config.cache_limit)).await?;
            println!("Cached {} entries at {}.", cache.count, cache.updated_at);
        }
        Commands::Cached => match store.cached_leaderboard().await? {
            Some(cache) => {
                println!("Cached leaderboard from {}:", cache.updated_at);
                for entry in &cache.entries {
                    println!("{:>3}. {} ({}) {}", entry.rank, entry.name, entry.email, entry.score);
                }
            }
            None => println!("No cached leaderboard yet; run refresh-cache."),
        },
        Commands::Weeks => {
            let weeks = QuizContentService::new(store).visible_weeks().await?;
            if weeks.is_empty() {
                println!("No weeks are open.");
            }
            for week in weeks {
                println!("Week {}: {}", week.week_no, week.title);
                for (position, question) in week.questions.iter().enumerate() {
                    println!("  Q{} {}: {}", position + 1, question.title, question.description);
                    for case in &question.test_cases {
                        println!("      test: {case}");
                    }
                }
            }
        }
        Commands::Solutions { week, language } => {
            let quiz = QuizContentService::new(store);
            let archived = quiz.archived_week(week).await?;
            let preferred = LanguageId::new(&language);
            println!("Week {} solutions: {}", archived.week_no, archived.title);
            for view in quiz::solutions_for(&archived, &preferred, &config.fallback_language) {
                println!("## {}", view.title);
                match view.solution {
                    Some(resolved) => {
                        if let Some(language) = resolved.language {
                            println!("({language})");
                        }
                        println!("{}", resolved.text);
                    }
                    None => println!("No solution published."),
                }
                if let Some(explanation) = view.explanation {
                    println!("Explanation: {explanation}");
                }
            }
        }
        Commands::CreateWeek { file, hidden } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let new_week: NewWeek = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid week definition", file.display()))?;
            let week = QuizContentService::new(store)
                .create_week(new_week, !hidden)
                .await?;
            println!(
                "Created week {} ({} questions{}).",
                week.week_no,
                week.questions.len(),
                if week.visible { "" } else { ", hidden" }
            );
        }
        Commands::PublishWeek { week, hide } => {
            QuizContentService::new(store)
                .set_visibility(week, !hide)
                .await?;
            println!("Week {week} is now {}.", if hide { "hidden" } else { "open" });
        }
        Commands::NextWeek => {
            let next = QuizContentService::new(store).next_week_number().await?;
            println!("{next}");
        }
        Commands::Submit {
            week,
            answers,
            credential,
        } => {
            let raw = std::fs::read_to_string(&answers)
                .with_context(|| format!("failed to read {}", answers.display()))?;
            let answers: Vec<Option<String>> = serde_json::from_str(&raw)
                .context("answers must be a JSON array of strings or nulls")?;

            let session = Session::start(identity_provider(&config), &config.allowed_email_domain);
            let mut changes = session.subscribe();
            let watcher = tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    match changes.borrow_and_update().clone() {
                        Some(user) => tracing::debug!(email = %user.email, "session signed in"),
                        None => tracing::debug!("session signed out"),
                    }
                }
            });

            let identity = session.sign_in(&credential).await?;
            let result = QuizContentService::new(store)
                .submit_answers(&session, week, answers)
                .await;
            session.sign_out().await;
            drop(session);
            let _ = watcher.await;

            let sheet = result?;
            println!(
                "Recorded answers for week {} as {} at {}.",
                sheet.week_no, identity.email, sheet.submitted_at
            );
        }
        Commands::IssueToken { .. } => {}
    }

    Ok(())
}

fn identity_provider(config: &Config) -> Box<dyn IdentityProvider> {
    match config.identity_provider {
        ProviderKind::Mock => Box::new(MockIdentityProvider::new(config.mock_identity.clone())),
        ProviderKind::SignedToken => {
            Box::new(SignedTokenProvider::new(config.session_secret.clone()))
        }
    }
}
