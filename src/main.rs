//! Inventory Notifier CLI - prints live inventory notifications.
//!
//! This is the main binary entry point. See the `inventory_notifier`
//! library for the core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inventory_notifier::credentials::{ChainedCredential, EnvCredential, KeyringCredential};
use inventory_notifier::dispatch::{
    DesktopSink, NotificationPermission, PermissionHandle, SoundPreference, SoundSink, ToastSink,
};
use inventory_notifier::supervisor::{destination_for, lookup_identity};
use inventory_notifier::{AutoConnector, Config, NotificationClient};
use mimalloc::MiMalloc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "inventory-notifier")]
#[command(version, about = "Real-time inventory notifications in your terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print notifications until interrupted
    Listen {
        /// Ring the terminal bell for each notification
        #[arg(long)]
        sound: bool,
        /// Emit desktop notifications (OSC 777)
        #[arg(long)]
        desktop: bool,
        /// Do not print toast lines
        #[arg(long)]
        quiet: bool,
    },
    /// Show the user the stored credential belongs to
    Whoami,
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Credential lookup order: `INVNOTIFY_TOKEN`, then the OS keyring.
fn credential_chain() -> ChainedCredential {
    ChainedCredential::new()
        .with(EnvCredential::default())
        .with(KeyringCredential::default())
}

async fn listen(config: Config, sound: bool, desktop: bool, quiet: bool) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let client = NotificationClient::new(
        config.client_options(),
        Arc::new(AutoConnector::new(config.transport)),
        Arc::new(credential_chain()),
    );

    if config.toast_enabled && !quiet {
        client.add_sink(ToastSink::stdout());
    }
    client.add_sink(SoundSink::stdout(SoundPreference::new(
        sound || config.sound_enabled,
    )));
    let permission = if desktop || config.desktop_notifications {
        NotificationPermission::Granted
    } else {
        NotificationPermission::Default
    };
    client.add_sink(DesktopSink::stdout(PermissionHandle::new(permission)));

    let user = client
        .connect()
        .await
        .context("Notifications unavailable")?;
    println!(
        "Listening for notifications as {} on {} (Ctrl-C to stop)",
        user, config.server_url
    );

    let mut state = client.watch_state();
    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                log::debug!("State: {} (attempts={})", snapshot.state, snapshot.reconnect_attempts);
            }
            () = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    println!("Shutting down...");
    client.disconnect().await;
    Ok(())
}

async fn whoami(config: &Config) -> Result<()> {
    let (_, user) = lookup_identity(Arc::new(credential_chain())).await?;
    let destination = destination_for(&config.destination, &user)?;
    println!("user:        {user}");
    println!("destination: {destination}");
    println!("server:      {}", config.server_url);
    Ok(())
}

fn init_logging() {
    // Log to a file so toast lines on stdout stay readable.
    // Use INVNOTIFY_LOG_FILE or <config dir>/inventory-notifier.log
    let log_path = match std::env::var("INVNOTIFY_LOG_FILE") {
        Ok(path) => Some(std::path::PathBuf::from(path)),
        Err(_) => Config::config_dir()
            .ok()
            .map(|dir| dir.join("inventory-notifier.log")),
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    match log_path.map(|path| std::fs::File::create(&path).map_err(|e| (path, e))) {
        Some(Ok(file)) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Some(Err((path, e))) => {
            eprintln!("Warning: cannot create log file {}: {e}", path.display());
        }
        None => {}
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    // Set up panic hook to log panics before the default report
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Listen {
            sound,
            desktop,
            quiet,
        } => listen(config, sound, desktop, quiet).await?,
        Commands::Whoami => whoami(&config).await?,
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
        }
    }

    Ok(())
}
