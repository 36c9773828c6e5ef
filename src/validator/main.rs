//! Standalone checker for the bot's limits and users file.
//!
//! Resolves the settings exactly as the bot would (environment plus host
//! detection), prints them, and validates them together with the users file.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;

// Import from the main crate
use restricted_downloader_bot::config::{BotSettings, UserDirectory, is_constrained_host};
use restricted_downloader_bot::transfer::files::{readable_size, readable_time, size_limit};
use restricted_downloader_bot::transfer::{BudgetLimits, ConnectionBudget, tier_connections};

/// Limits checker.
#[derive(Parser, Debug)]
#[command(name = "check_limits")]
#[command(about = "Prints and validates the effective limits of the downloader bot")]
#[command(version)]
struct Args {
    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Users file, overrides `USERS_PATH`.
    #[arg(short, long)]
    users: Option<PathBuf>,

    /// Show connection grants per file size.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = dotenvy::from_filename(&args.env_file) {
        println!("(no env file loaded from {}: {e})", args.env_file);
    }

    let mut settings = BotSettings::from_env_with_defaults();
    if let Some(users) = args.users {
        settings.users_path = users;
    }

    print_settings(&settings);

    let mut errors = 0;

    match settings.validate() {
        Ok(()) => println!("✓ Limits are valid"),
        Err(e) => {
            errors += 1;
            println!("✗ Invalid limits: {e}");
        }
    }

    errors += check_users(&settings);

    if args.verbose && errors == 0 {
        print_grants(&settings);
    }

    println!();
    if errors == 0 {
        println!("✓ Configuration is valid!");
        ExitCode::SUCCESS
    } else {
        println!("✗ Validation failed: {errors} error(s)");
        ExitCode::FAILURE
    }
}

fn print_settings(settings: &BotSettings) {
    println!(
        "Host: {}\n",
        if is_constrained_host() {
            "constrained (Render/Replit)"
        } else {
            "standard"
        }
    );
    println!("Queue:");
    println!("  Concurrent downloads: {}", settings.max_concurrent);
    println!("  Queue size:           {}", settings.max_queue);
    println!("  Job timeout:          {}", readable_time(settings.job_timeout_secs));
    println!("  Stale queue age:      {}", readable_time(settings.stale_queue_age().as_secs()));
    println!("Sessions:");
    println!("  Max sessions:         {}", settings.max_sessions);
    println!("  Idle timeout:         {}", readable_time(settings.idle_timeout().as_secs()));
    println!("Connections:");
    println!("  Total:                {}", settings.total_connections);
    println!(
        "  Per transfer:         {}..={}",
        settings.min_connections, settings.max_connections
    );
    println!("  Wait timeout:         {}", readable_time(settings.acquire_timeout_secs));
    println!("Users:");
    println!("  Users file:           {}", settings.users_path.display());
    println!("  Free daily limit:     {}", settings.free_daily_limit);
    println!("  Free size limit:      {}", readable_size(size_limit(false)));
    println!("  Premium size limit:   {}", readable_size(size_limit(true)));
    println!("  Downloads folder:     {}\n", settings.downloads_dir.display());
}

fn check_users(settings: &BotSettings) -> usize {
    let directory = match UserDirectory::load_or_default(&settings.users_path) {
        Ok(directory) => directory,
        Err(e) => {
            println!("✗ Failed to load users file: {e}");
            return 1;
        }
    };

    match directory.validate(Local::now().date_naive()) {
        Ok(()) => {
            println!(
                "✓ Users file is valid ({} admins, {} premium, {} with usage)",
                directory.admins.len() + usize::from(directory.owner_id.is_some()),
                directory.premium.len(),
                directory.usage.len()
            );
            0
        }
        Err(e) => {
            println!("✗ Invalid users file: {e}");
            1
        }
    }
}

/// Shows what a lone transfer of each size would be granted.
fn print_grants(settings: &BotSettings) {
    let budget = std::sync::Arc::new(ConnectionBudget::new(BudgetLimits {
        total: settings.total_connections,
        min_per_transfer: settings.min_connections,
        max_per_transfer: settings.max_connections,
        acquire_timeout: settings.acquire_timeout(),
    }));

    println!("\nConnection grants for a single transfer:");
    for size in [5 * 1024, 50 * 1024, 500 * 1024, 5 * 1024 * 1024, 50 * 1024 * 1024] {
        let granted = budget
            .try_acquire(size)
            .map_or(0, |lease| lease.connections());
        println!(
            "  {:>10}: tier {:>2}, granted {:>2}",
            readable_size(size),
            tier_connections(size),
            granted
        );
    }
}
