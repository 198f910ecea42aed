use anyhow::{Context, Result};
use clap::Parser;
use shared::publisher::DocumentPublisher;
use shared::{io, Briefing, Credentials, FeishuPublisher, MarkdownRenderer, Settings};
use std::io::{self as stdio, Write as _};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "publish-briefing")]
#[command(about = "Publish a saved daily briefing as a Feishu document")]
struct Args {
    /// Path to a saved briefing JSON file (if not provided, will list available files)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Settings file (defaults to ~/.config/daily-briefing/briefing.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,
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

    let (path, briefing) = match args.file {
        Some(path) => {
            let briefing = io::load_briefing(&path)?;
            (path, briefing)
        }
        None => select_briefing()?,
    };
    println!("📖 Loaded briefing: {}", path.display());

    let mut remote = settings.remote.clone();
    remote.enabled = true;
    let publisher = FeishuPublisher::from_settings(&remote, &credentials)?.ok_or_else(|| {
        anyhow::anyhow!("FEISHU_APP_ID and FEISHU_APP_SECRET must be set to publish")
    })?;

    println!("\n📝 Rendering Markdown...");
    let markdown = MarkdownRenderer::render(&briefing);

    println!("☁️  Publishing to Feishu...");
    let title = format!("{} {}", briefing.title, briefing.run_date.format("%Y-%m-%d"));
    let document = publisher
        .publish(&title, &markdown)
        .await
        .context("Failed to publish briefing")?;

    println!(
        "✓ Created document {} with {} blocks",
        document.document_id, document.blocks
    );
    println!("\n✅ Done!");

    Ok(())
}

fn select_briefing() -> Result<(PathBuf, Briefing)> {
    let dir = io::get_default_briefings_dir()?;
    let mut briefings = io::list_briefings(&dir)?;

    if briefings.is_empty() {
        anyhow::bail!("No saved briefings found in {}", dir.display());
    }

    println!("Available briefings:\n");
    for (i, (_, briefing)) in briefings.iter().enumerate() {
        println!(
            "  {}) {} · {} ({} events, generated {})",
            i + 1,
            briefing.title,
            briefing.run_date,
            briefing.stats.clusters,
            briefing.generated_at.format("%Y-%m-%d %H:%M")
        );
    }

    print!("\nSelect briefing (1-{}): ", briefings.len());
    stdio::stdout().flush()?;

    let mut input = String::new();
    stdio::stdin().read_line(&mut input)?;

    let selection: usize = input
        .trim()
        .parse()
        .context("Invalid selection. Please enter a number.")?;

    if selection < 1 || selection > briefings.len() {
        anyhow::bail!("Selection out of range. Please choose 1-{}", briefings.len());
    }

    Ok(briefings.swap_remove(selection - 1))
}
