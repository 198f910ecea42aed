use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::Parser;
use shared::{io, Collaborators, Credentials, LedgerError, Pipeline, RunOptions, Settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "daily-briefing")]
#[command(about = "Collect, deduplicate and classify the day's tech news into a Markdown briefing")]
struct Args {
    /// Day to brief (YYYY-MM-DD). Defaults to yesterday.
    #[arg(short, long)]
    date: Option<NaiveDate>,

    /// Directory for the Markdown briefing
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Settings file (defaults to ~/.config/daily-briefing/briefing.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only write the local briefing, even if remote output is configured
    #[arg(long)]
    skip_remote: bool,
}

fn yesterday() -> NaiveDate {
    let today = Local::now().date_naive();
    today.pred_opt().unwrap_or(today)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    let credentials = Credentials::from_env();
    let run_date = args.date.unwrap_or_else(yesterday);

    println!("\n📰 {} for {}", settings.briefing.title, run_date);
    println!(
        "   {} sources, LLM provider {:?}",
        settings.sources.iter().filter(|s| s.enabled).count(),
        settings.llm.provider
    );

    let mut options = RunOptions::from_settings(&settings, run_date, args.output)?;
    options.skip_remote = args.skip_remote;

    let collaborators = Collaborators::from_settings(&settings, &credentials, &io::default_cache_path()?)?;
    let pipeline = Pipeline::new(settings, collaborators);

    println!("\n⏳ Collecting and processing (this may take a few minutes)...");
    let outcome = match pipeline.run(&options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(LedgerError::Locked { path, holder }) = e.downcast_ref::<LedgerError>() {
                eprintln!("\n✗ Another run holds the prediction ledger ({}).", holder);
                eprintln!("  If no run is active, remove {} and try again.", path.display());
            }
            return Err(e);
        }
    };

    let stats = &outcome.briefing.stats;
    println!(
        "\n✓ Collected {} items, {} articles after normalization ({} dropped)",
        stats.collected_payloads, stats.articles, stats.dropped_payloads
    );
    if !stats.failed_sources.is_empty() {
        println!("⚠ Sources that failed: {}", stats.failed_sources.join(", "));
    }
    println!(
        "✓ {} events, {} articles kept, {} follow-ups merged away",
        stats.clusters, stats.retained_articles, stats.dropped_followups
    );
    if stats.uncategorized > 0 {
        println!("⚠ {} events could not be classified", stats.uncategorized);
    }
    println!("✓ {} key-person statements", stats.mentions);

    let tracker = &outcome.tracker;
    println!(
        "✓ Predictions: {} due, {} resolved, {} expired, {} new",
        tracker.became_due.len(),
        tracker.resolved.len(),
        tracker.expired.len(),
        tracker.created.len()
    );

    println!("\n📝 Markdown saved to: {}", outcome.markdown_path.display());
    println!("💾 Briefing data saved to: {}", outcome.json_path.display());

    match (&outcome.published, &outcome.remote_error) {
        (Some(doc), _) => println!("☁️  Published to Feishu: document {} ({} blocks)", doc.document_id, doc.blocks),
        (None, Some(error)) => {
            println!("⚠ Remote publishing failed: {}", error);
            println!("  Retry later with: publish-briefing --file {}", outcome.json_path.display());
        }
        (None, None) => {}
    }

    println!("\n✅ Done!");

    Ok(())
}
