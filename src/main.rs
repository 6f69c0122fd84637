use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use feedgate::config::Config;
use feedgate::feed::{refresh_all, LinkProcessor, ProcessSummary};
use feedgate::resolver::{LinkResolver, RateLimiter, ReqwestTransport};
use feedgate::retry::{classify, RetryQueue};
use feedgate::storage::{Database, DatabaseError};
use feedgate::util::{validate_url, SsrfGuard};

/// Get the config directory path (~/.config/feedgate/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedgate"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedgate",
    version,
    about = "Resolve news-aggregator links to publisher URLs"
)]
struct Args {
    /// Config file (default: ~/.config/feedgate/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides database_path from the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one aggregator link and print the publisher URL
    Resolve { link: String },
    /// Check a URL against the SSRF boundary
    CheckUrl { url: String },
    /// Classify an error description as retryable or permanent
    Classify { description: String },
    /// Subscribe to a feed
    AddFeed {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Fetch all feeds, then resolve pending article links
    Refresh,
    /// Re-run resolutions whose retry time has come
    RetryDue,
    /// Show article counts per resolution status
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match &args.command {
        Command::Resolve { link } => resolve(&args, &config, link).await,
        Command::CheckUrl { url } => check_url(&args, url).await,
        Command::Classify { description } => {
            let class = classify(description);
            if args.json {
                println!("{}", serde_json::json!({ "class": class }));
            } else {
                println!("{}", serde_json::to_value(class)?.as_str().unwrap_or("unknown"));
            }
            Ok(())
        }
        Command::AddFeed { url, title } => {
            validate_url(url).with_context(|| format!("Refusing feed URL {url}"))?;
            let db = open_db(&args, &config, &config_dir).await?;
            let id = db.insert_feed(url, title.as_deref()).await?;
            if args.json {
                println!("{}", serde_json::json!({ "feed_id": id, "url": url }));
            } else {
                println!("Added feed {id}: {url}");
            }
            Ok(())
        }
        Command::Refresh => {
            let db = open_db(&args, &config, &config_dir).await?;
            let feeds = db.get_feeds().await.context("Failed to load feeds")?;
            let results = refresh_all(&db, &SsrfGuard::default(), feeds, &config.fetch_config()).await;
            let new_articles: usize = results.iter().filter_map(|r| r.result.as_ref().ok()).sum();
            let feed_errors = results.iter().filter(|r| r.result.is_err()).count();
            if !args.json {
                println!(
                    "Fetched {} feeds: {} new articles, {} errors",
                    results.len(),
                    new_articles,
                    feed_errors
                );
            }

            let summary = processor(&config, db)
                .process_pending(config.batch_size)
                .await?;
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "feeds": results.len(),
                        "feed_errors": feed_errors,
                        "new_articles": new_articles,
                        "links": summary,
                    })
                );
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        Command::RetryDue => {
            let db = open_db(&args, &config, &config_dir).await?;
            let summary = processor(&config, db)
                .process_due(Utc::now(), config.batch_size)
                .await?;
            if args.json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        Command::Stats => {
            let db = open_db(&args, &config, &config_dir).await?;
            let counts = db.status_counts().await?;
            if args.json {
                println!("{}", serde_json::to_string(&counts)?);
            } else {
                println!("pending:  {}", counts.pending);
                println!("retrying: {}", counts.retrying);
                println!("success:  {}", counts.success);
                println!("failed:   {}", counts.failed);
            }
            Ok(())
        }
    }
}

fn build_resolver(config: &Config) -> LinkResolver {
    let resolver_config = config.resolver_config();
    LinkResolver::new(
        SsrfGuard::default(),
        Arc::new(ReqwestTransport::new(resolver_config.fetch_timeout)),
        Arc::new(RateLimiter::new(resolver_config.rate_limit_spacing)),
        resolver_config,
    )
}

fn processor(config: &Config, db: Database) -> LinkProcessor<Database> {
    let queue = RetryQueue::new(db, config.retry_config());
    LinkProcessor::new(Arc::new(build_resolver(config)), Arc::new(queue))
        .with_concurrency(config.concurrency)
}

async fn resolve(args: &Args, config: &Config, link: &str) -> Result<()> {
    match build_resolver(config).resolve(link).await {
        Ok(url) => {
            if args.json {
                println!("{}", serde_json::json!({ "resolved_url": url.as_str() }));
            } else {
                println!("{url}");
            }
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({ "error": message, "class": classify(&message) })
                );
                std::process::exit(1);
            }
            Err(anyhow::anyhow!(e).context(format!("Could not resolve {link}")))
        }
    }
}

async fn check_url(args: &Args, url: &str) -> Result<()> {
    match SsrfGuard::default().validate(url).await {
        Ok(pinned) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({ "allowed": true, "address": pinned.addr().to_string() })
                );
            } else {
                println!("allowed ({})", pinned.addr());
            }
            Ok(())
        }
        Err(e) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({ "allowed": false, "reason": e.to_string() })
                );
                std::process::exit(1);
            }
            Err(anyhow::anyhow!(e).context(format!("Rejected {url}")))
        }
    }
}

async fn open_db(args: &Args, config: &Config, config_dir: &std::path::Path) -> Result<Database> {
    let db_path = match args.db.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
            }
            // User-only access; the database holds fetched URLs and error text
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            config_dir.join("feedgate.db")
        }
    };

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(db_path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: the database is locked by another feedgate process. Try again shortly.");
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn print_summary(summary: &ProcessSummary) {
    println!(
        "Links: {} resolved, {} scheduled for retry, {} failed",
        summary.resolved, summary.scheduled, summary.failed
    );
    if summary.errors > 0 {
        eprintln!(
            "Warning: {} outcomes could not be recorded (see logs)",
            summary.errors
        );
    }
}
