//! Restricted Downloader Bot - Main Entry Point
//!
//! A Telegram bot that fetches media from restricted channels through the
//! user's own account and sends it back to them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use restricted_downloader_bot::commands::{CommandHandler, HandlerDeps};
use restricted_downloader_bot::config::{BotSettings, TelegramConfig, UserStore};
use restricted_downloader_bot::maintenance::Maintenance;
use restricted_downloader_bot::memory::MemoryMonitor;
use restricted_downloader_bot::pipeline::ReplyChannel;
use restricted_downloader_bot::queue::{DownloadQueue, ProcessorMessage, QueueLimits, QueueProcessor};
use restricted_downloader_bot::session::{SessionLimits, SessionManager};
use restricted_downloader_bot::telegram::{
    BotReply, GrammersConnector, PhoneLogin, TelegramError, run_bot,
};
use restricted_downloader_bot::transfer::{BudgetLimits, ConnectionBudget, TransferEngine};

type Handler = CommandHandler<GrammersConnector, PhoneLogin, BotReply>;

/// Telegram bot that downloads media from restricted channels.
#[derive(Parser, Debug)]
#[command(name = "downloader_bot")]
#[command(about = "Download media from restricted Telegram channels with your own account")]
#[command(version)]
struct Args {
    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Users file, overrides `USERS_PATH`.
    #[arg(short, long)]
    users: Option<PathBuf>,
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    if let Err(e) = dotenvy::from_filename(&args.env_file) {
        debug!("Could not load .env file ({}): {}", args.env_file, e);
    }

    let tg_config = TelegramConfig::from_env()
        .context("Failed to load Telegram configuration from environment")?;

    let mut settings = BotSettings::from_env_with_defaults();
    if let Some(users) = args.users {
        settings.users_path = users;
    }
    settings.validate().context("Invalid bot settings")?;

    info!(
        "Limits: {} concurrent, {} queued, {} sessions, {} connections{}",
        settings.max_concurrent,
        settings.max_queue,
        settings.max_sessions,
        settings.total_connections,
        if settings.constrained {
            " (constrained host)"
        } else {
            ""
        }
    );

    let users = Arc::new(
        UserStore::open(settings.users_path.clone(), settings.free_daily_limit)
            .with_context(|| format!("Failed to open users file {}", settings.users_path.display()))?,
    );

    std::fs::create_dir_all(&settings.downloads_dir).with_context(|| {
        format!("Failed to create downloads folder {}", settings.downloads_dir.display())
    })?;
    std::fs::create_dir_all(&tg_config.sessions_dir).with_context(|| {
        format!("Failed to create sessions folder {}", tg_config.sessions_dir.display())
    })?;

    // Queue and its processor
    let (queue, mut reports) = DownloadQueue::with_reports(QueueLimits {
        max_concurrent: settings.max_concurrent,
        max_queue: settings.max_queue,
        job_timeout: settings.job_timeout(),
    });
    let queue = Arc::new(queue);
    let (processor_tx, processor_rx) = mpsc::channel::<ProcessorMessage>(32);
    let processor = QueueProcessor::new(Arc::clone(&queue), settings.stale_queue_age());
    let processor_handle = tokio::spawn(async move {
        processor.run(processor_rx).await;
    });

    // Transfers, sessions and login
    let budget = Arc::new(ConnectionBudget::new(BudgetLimits {
        total: settings.total_connections,
        min_per_transfer: settings.min_connections,
        max_per_transfer: settings.max_connections,
        acquire_timeout: settings.acquire_timeout(),
    }));
    let engine = TransferEngine::new(budget);

    let connector = GrammersConnector::new(tg_config.clone());
    let sessions = Arc::new(SessionManager::new(
        connector.clone(),
        SessionLimits {
            max_sessions: settings.max_sessions,
            idle_timeout: settings.idle_timeout(),
        },
    ));
    let login = Arc::new(PhoneLogin::new(connector));
    let memory = Arc::new(Mutex::new(MemoryMonitor::default()));
    memory.lock().await.snapshot("startup");

    let shutdown = CancellationToken::new();

    let maintenance = Maintenance::new(
        Arc::clone(&queue),
        Arc::clone(&sessions),
        Arc::clone(&memory),
        settings.downloads_dir.clone(),
    );
    let maintenance_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { maintenance.run(shutdown).await }
    });

    let handler: Arc<Handler> = Arc::new(CommandHandler::new(HandlerDeps {
        queue: Arc::clone(&queue),
        sessions: Arc::clone(&sessions),
        login,
        engine,
        users,
        memory,
        downloads_dir: settings.downloads_dir.clone(),
        thumbnails_dir: settings.thumbnails_dir.clone(),
    }));

    // Job reports back to users
    let reports_handle = tokio::spawn({
        let handler = Arc::clone(&handler);
        async move {
            while let Some(report) = reports.recv().await {
                debug!(
                    "Job for user {} ended: {:?} after {:?}",
                    report.user_id, report.outcome, report.elapsed
                );
                handler.handle_report(report).await;
            }
        }
    });

    info!("Starting downloader bot...");

    let bot_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        let handler = Arc::clone(&handler);
        let processor_tx = processor_tx.clone();
        async move {
            run_bot(&tg_config, shutdown, move |message, reply| {
                let handler = Arc::clone(&handler);
                let processor_tx = processor_tx.clone();
                tokio::spawn(async move {
                    let Some(result) = handler.try_handle(message.user_id, &message.text, &reply).await else {
                        return;
                    };
                    if result.trigger_promotion {
                        let _ = processor_tx.send(ProcessorMessage::TriggerPromotion).await;
                    }
                    if let Err(e) = reply.send_text(&result.message).await {
                        warn!("Failed to reply to user {}: {:#}", message.user_id, e);
                    }
                });
            })
            .await
        }
    });

    info!("Bot is running. Use Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = wait_bot(bot_handle) => {
            if let Err(e) = result {
                error!("Bot stopped: {:#}", e);
            }
        }
    }

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    let _ = processor_tx.send(ProcessorMessage::Shutdown).await;
    let _ = processor_handle.await;

    let cancelled = queue.cancel_all().await;
    if cancelled > 0 {
        info!("Cancelled {} jobs", cancelled);
    }
    sessions.disconnect_all().await;
    let _ = maintenance_handle.await;
    drop(handler);
    reports_handle.abort();

    Ok(())
}

async fn wait_bot(handle: JoinHandle<Result<(), TelegramError>>) -> Result<()> {
    handle
        .await
        .context("Bot task panicked")?
        .context("Bot failed")
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
