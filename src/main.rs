use better_morning::config::CollectionConfig;
use better_morning::history::HistoryStore;
use better_morning::llm::HttpModelClient;
use better_morning::pipeline::Pipeline;
use better_morning::render::{ChromiumRenderer, PageRenderer};
use better_morning::types::ContentKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "better-morning", about = "Feed ingestion and admission pipeline")]
struct Args {
    /// Collection TOML files to process.
    #[arg(required = true)]
    collections: Vec<PathBuf>,

    /// Override the state directory from the collection configs.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Run every stage but skip the history commit.
    #[arg(long)]
    dry_run: bool,

    /// Max concurrent headless pages; 0 disables the rendered tier.
    #[arg(long, default_value_t = 2)]
    render_pages: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let renderer: Option<Arc<dyn PageRenderer>> = if args.render_pages == 0 {
        None
    } else {
        match ChromiumRenderer::launch(args.render_pages).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "headless browser unavailable, rendered tier disabled");
                None
            }
        }
    };

    let mut failures = 0usize;
    for path in &args.collections {
        let mut config = match CollectionConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %path.display(), error = %e, "skipping unloadable collection");
                failures += 1;
                continue;
            }
        };
        if let Some(dir) = &args.state_dir {
            config.state_dir = dir.clone();
        }

        let history = HistoryStore::new(&config.state_dir);
        let model = Arc::new(HttpModelClient::new(config.llm.clone()));
        let pipeline = Pipeline::new(history, model, renderer.clone());

        // One collection's failure never aborts its siblings.
        let run = match pipeline.run_collection(&config).await {
            Ok(run) => run,
            Err(e) => {
                error!(collection = %config.name, error = %e, "collection run failed");
                failures += 1;
                continue;
            }
        };

        for outcome in &run.report.feeds {
            info!(
                feed = %outcome.feed_name,
                status = ?outcome.status,
                found = outcome.found,
                admitted = outcome.admitted,
                retries = outcome.retries,
                error = outcome.error.as_deref().unwrap_or("-"),
                "feed outcome"
            );
        }

        // Downstream summarization and delivery live outside this core;
        // print what would be handed over.
        for entry in &run.entries {
            let size = match entry.content_kind {
                ContentKind::Pdf => entry
                    .raw_content
                    .as_ref()
                    .map(|b| format!("{} bytes (pdf)", b.len()))
                    .unwrap_or_default(),
                ContentKind::Text => format!("{} chars", entry.text().len()),
            };
            println!(
                "[{}] {} | {} ({size})",
                entry.feed_name, entry.title, entry.link
            );
        }

        if args.dry_run {
            info!(collection = %config.name, "dry run, skipping history commit");
            continue;
        }
        if let Err(e) = pipeline.commit(&config, &run).await {
            error!(collection = %config.name, error = %e, "history commit failed");
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} collection(s) failed");
    }
    Ok(())
}
