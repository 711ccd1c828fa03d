//! Kebab - headless batch media downloader.
//!
//! Resolves every URL given on the command line, downloads them with a
//! bounded worker pool, and prints a reconciliation report.

mod args;
mod logging;

use std::collections::HashMap;
use std::process::ExitCode;

use args::{Args, USAGE};
use kebab_core::{
    AppConfig, ConfigManager, DownloadItem, DownloadService, ItemId, QueueEvent,
    ReconciliationReport, format_duration,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("kebab: {e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    if args.help {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let logging_config = if args.verbose {
        logging::LoggingConfig::development()
    } else {
        logging::LoggingConfig::auto()
    };
    // Downloads still work without file logs
    let _guard = match logging::init(&logging_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("kebab: {e}");
            None
        }
    };

    info!("Starting Kebab");

    match run(&args).await {
        Ok(summary) => {
            println!("{}", summary.report);
            for failure in &summary.report.failures {
                println!("  failed: {} ({})", failure.name, failure.reason);
            }
            if summary.report.is_clean() && summary.rejected == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("kebab: {e}");
            ExitCode::FAILURE
        }
    }
}

/// What a run produced.
struct Summary {
    report: ReconciliationReport,
    /// URLs that could not be resolved or queued.
    rejected: usize,
}

/// Load the configuration, apply overrides, and persist it when asked.
fn prepare_config(args: &Args) -> kebab_core::Result<AppConfig> {
    let mut manager = match &args.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };

    if args.reset_config {
        manager.reset()?;
        info!("Configuration reset to defaults");
    }

    let mut config = manager.config().clone();
    args.apply(&mut config)?;
    config.pool.validate()?;

    if args.save_config {
        manager.update(config.clone())?;
        println!("Saved configuration to {}", manager.path().display());
    }
    Ok(config)
}

async fn run(args: &Args) -> kebab_core::Result<Summary> {
    let config = prepare_config(args)?;

    if args.urls.is_empty() {
        return Ok(Summary {
            report: ReconciliationReport::default(),
            rejected: 0,
        });
    }

    info!("Downloading into {}", config.download_root.display());
    let download_type = config.default_download_type;
    let service = DownloadService::from_config(config);

    let mut rejected = 0;
    for url in &args.urls {
        match service.enqueue(url, download_type).await {
            Ok(ids) => info!("Queued {} item(s) from {}", ids.len(), url),
            Err(e) => {
                warn!("Skipping {}: {}", url, e);
                eprintln!("Skipping {url}: {e}");
                rejected += 1;
            }
        }
    }

    if service.stats().await.pending_count == 0 {
        return Ok(Summary {
            report: ReconciliationReport::default(),
            rejected,
        });
    }

    let handle = service.start()?;
    let mut console = Console::default();
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = service.recv_event() => match event {
                Some(QueueEvent::Drained(_)) | None => break,
                Some(event) => console.render(&event),
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    continue;
                }
                let cancelled = service.cancel_all().await;
                eprintln!("Interrupted, cancelling {cancelled} item(s)");
            }
        }
    }

    let report = handle.await.map_err(std::io::Error::other)?;
    Ok(Summary { report, rejected })
}

/// Renders queue events as lines on stdout.
#[derive(Default)]
struct Console {
    names: HashMap<ItemId, String>,
    last_overall: u32,
}

impl Console {
    fn render(&mut self, event: &QueueEvent) {
        match event {
            QueueEvent::ItemAdded(item) => {
                println!("{}", queued_line(item));
                self.names.insert(item.id, item.display_name().to_string());
            }
            QueueEvent::ItemStarted { item_id } => println!("started  {}", self.name(*item_id)),
            QueueEvent::ItemProgress {
                overall_percent, ..
            } => {
                // Whole percent steps only
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let overall = overall_percent.floor() as u32;
                if overall > self.last_overall {
                    self.last_overall = overall;
                    println!("progress {overall}%");
                }
            }
            QueueEvent::ItemPaused { item_id } => println!("paused   {}", self.name(*item_id)),
            QueueEvent::ItemResumed { item_id } => println!("resumed  {}", self.name(*item_id)),
            QueueEvent::ItemCompleted { item_id } => println!("done     {}", self.name(*item_id)),
            QueueEvent::ItemFailed { item_id, error } => {
                println!("failed   {}: {}", self.name(*item_id), error);
            }
            QueueEvent::ItemCancelled { item_id } => {
                println!("cancelled {}", self.name(*item_id));
            }
            QueueEvent::ItemRemoved { .. }
            | QueueEvent::ItemRetried { .. }
            | QueueEvent::QueueCleared
            | QueueEvent::Drained(_) => {}
        }
    }

    fn name(&self, id: ItemId) -> &str {
        self.names.get(&id).map_or("?", String::as_str)
    }
}

/// Line printed when an item joins the queue.
fn queued_line(item: &DownloadItem) -> String {
    let mut line = format!("queued   {}", item.display_name());
    if let Some(secs) = item.request.duration_seconds {
        line.push_str(&format!(" [{}]", format_duration(secs)));
    }
    if let Some(thumbnail) = &item.request.thumbnail_url {
        line.push_str(&format!(" (thumbnail: {thumbnail})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use kebab_core::{DownloadQueue, DownloadRequest, StreamKind, StreamVariant};
    use tempfile::TempDir;

    fn request(title: &str) -> DownloadRequest {
        DownloadRequest::new(
            "https://example.com/watch",
            StreamVariant::new(StreamKind::Audio, "https://cdn.example.com/a.m4a"),
            "/tmp/kebab/Audio/a.m4a",
        )
        .with_title(title)
    }

    async fn queued(request: DownloadRequest) -> DownloadItem {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request).await.unwrap();
        queue.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_queued_line_shows_duration_and_thumbnail() {
        let item = queued(
            request("Song")
                .with_duration(215)
                .with_thumbnail("https://img.example.com/song.jpg"),
        )
        .await;
        assert_eq!(
            queued_line(&item),
            "queued   Song [3:35] (thumbnail: https://img.example.com/song.jpg)"
        );
    }

    #[tokio::test]
    async fn test_queued_line_without_metadata() {
        let item = queued(request("Plain")).await;
        assert_eq!(queued_line(&item), "queued   Plain");
    }

    #[test]
    fn test_prepare_config_saves_only_when_asked() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        let root = temp_dir.path().join("media");

        let args = Args {
            config: Some(path.clone()),
            root: Some(root.clone()),
            workers: Some(5),
            ..Args::default()
        };
        let config = prepare_config(&args).unwrap();
        assert_eq!(config.pool.worker_count, 5);
        assert_eq!(AppConfig::load_from(&path).unwrap().pool.worker_count, 3);

        let saved = prepare_config(&Args {
            save_config: true,
            ..args
        })
        .unwrap();
        let stored = AppConfig::load_from(&path).unwrap();
        assert_eq!(stored, saved);
        assert_eq!(stored.download_root, root);
    }

    #[test]
    fn test_prepare_config_reset_restores_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        prepare_config(&Args {
            config: Some(path.clone()),
            root: Some(temp_dir.path().join("media")),
            workers: Some(7),
            save_config: true,
            ..Args::default()
        })
        .unwrap();

        let config = prepare_config(&Args {
            config: Some(path.clone()),
            reset_config: true,
            ..Args::default()
        })
        .unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());
    }
}
