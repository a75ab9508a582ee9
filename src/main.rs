//! treefs - Lazily materialized filesystem over a content-addressed store
//!
//! Usage:
//!   treefs init                     - Write a default configuration
//!   treefs import <dir>             - Snapshot a directory into the object store
//!   treefs mount <mount_point>      - Mount the configured snapshot
//!   treefs unmount <mount_point>    - Unmount
//!   treefs checkout <snapshot>      - Discard local changes and switch snapshot
//!   treefs status                   - Show mount state
//!   treefs journal [--since N]      - Print journal deltas

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use treefs::{
    config::Config,
    fs::FuseBridge,
    inodes::GenerationSource,
    journal::Journal,
    model::Hash,
    mount::JOURNAL_DIR,
    status,
    store::DirBackingStore,
    MountRuntime,
};

#[derive(Parser)]
#[command(name = "treefs")]
#[command(author = "treefs Contributors")]
#[command(version)]
#[command(about = "Lazily materialized filesystem over a content-addressed store")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/treefs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Init {
        /// Data directory holding the overlay and object store
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Import a local directory as a new snapshot
    Import {
        /// Directory to import
        source: PathBuf,

        /// Make the new snapshot the configured one
        #[arg(long)]
        select: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Discard local changes and move to another snapshot
    Checkout {
        /// Snapshot id (hex)
        snapshot: String,
    },

    /// Show mount status
    Status,

    /// Print journal deltas
    Journal {
        /// First sequence number to print
        #[arg(long, default_value_t = 0)]
        since: u64,

        /// Clear a corrupt journal so the mount can start again
        #[arg(long)]
        repair: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { data_dir } => cmd_init(config_path, data_dir),
        Commands::Import { source, select } => cmd_import(config_path, &source, select),
        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(config_path, &mount_point, allow_other),
        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),
        Commands::Checkout { snapshot } => cmd_checkout(config_path, &snapshot),
        Commands::Status => cmd_status(config_path),
        Commands::Journal { since, repair } => cmd_journal(config_path, since, repair),
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load(config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("starting async runtime")
}

fn cmd_init(config_path: &Path, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Initializing treefs...");

    let config = match data_dir {
        Some(dir) => Config::with_root(&dir),
        None => Config::default(),
    };

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    info!("");
    info!("Next steps:");
    info!("  1. Run 'treefs import --select <dir>' to create a snapshot");
    info!("  2. Run 'treefs mount <mount_point>' to mount it");

    Ok(())
}

fn cmd_import(config_path: &Path, source: &Path, select: bool) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    config.ensure_directories()?;

    let store = DirBackingStore::open(&config.store.backing_dir)?;
    let commit = store
        .import_directory(source)
        .with_context(|| format!("importing {:?}", source))?;
    println!("{}", commit);

    if select {
        config.snapshot = Some(commit.to_hex());
        config.save(config_path)?;
        info!("Snapshot {} selected", commit);
    }
    Ok(())
}

fn cmd_mount(config_path: &Path, mount_point: &Path, allow_other: bool) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other |= allow_other;

    let runtime = runtime()?;
    let generations = GenerationSource::new();
    let mount = runtime
        .block_on(MountRuntime::from_config(&config, &generations))
        .context("initializing mount")?;
    let mount = Arc::new(mount);

    std::fs::create_dir_all(mount_point)?;
    info!("Mounting snapshot {} at {:?}", mount.snapshot(), mount_point);

    let mut options = vec![
        fuser::MountOption::FSName("treefs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    let publisher = runtime.spawn(status::publish_periodically(
        mount.clone(),
        status::PUBLISH_INTERVAL,
    ));

    let bridge = FuseBridge::new(mount.clone(), runtime.handle().clone());
    let session = fuser::mount2(bridge, mount_point, &options).context("FUSE session failed");

    publisher.abort();
    if let Err(e) = status::withdraw(&config.overlay_dir) {
        error!("Failed to remove status file: {}", e);
    }
    session?;
    mount.shutdown()?;
    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> anyhow::Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if !output.status.success() {
        bail!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    info!("Unmounted successfully");
    Ok(())
}

/// Fail if a running mount owns the overlay directory
fn ensure_not_mounted(config: &Config) -> anyhow::Result<()> {
    if let Some(live) = status::read_live(&config.overlay_dir)? {
        bail!(
            "{:?} is mounted by process {}; unmount it first",
            config.overlay_dir,
            live.pid
        );
    }
    Ok(())
}

fn cmd_checkout(config_path: &Path, snapshot: &str) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    let target = Hash::from_hex(snapshot).context("parsing snapshot id")?;
    ensure_not_mounted(&config)?;

    let runtime = runtime()?;
    runtime.block_on(async {
        let mount = MountRuntime::from_config(&config, &GenerationSource::new()).await?;
        mount.reset_to_snapshot(target).await?;
        mount.shutdown()
    })?;

    config.snapshot = Some(target.to_hex());
    config.save(config_path)?;
    info!("Checked out {}", target);
    Ok(())
}

fn cmd_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("treefs Status");
    println!("=============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Overlay directory: {:?}", config.overlay_dir);
    println!("Object directory: {:?}", config.store.backing_dir);
    println!(
        "Local object cache: {}",
        if config.store.local_cache_enabled { "enabled" } else { "disabled" }
    );

    println!();
    match status::read_live(&config.overlay_dir)? {
        Some(live) => {
            println!(
                "Mounted by process {} (as of {})",
                live.pid,
                live.updated.to_rfc3339()
            );
            println!("{}", serde_json::to_string_pretty(&live.mount)?);
        }
        None => {
            let offline = status::offline(&config.overlay_dir, config.journal.max_deltas)
                .context("reading journal")?;
            println!("Not mounted");
            println!("{}", serde_json::to_string_pretty(&offline)?);
        }
    }
    Ok(())
}

fn cmd_journal(config_path: &Path, since: u64, repair: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    ensure_not_mounted(&config)?;
    let journal = Journal::open(&config.overlay_dir.join(JOURNAL_DIR), config.journal.max_deltas)
        .context("opening journal")?;

    if repair {
        journal.repair()?;
        info!("Journal repaired, next sequence {}", journal.next_sequence());
    }

    for delta in journal.get_deltas_since(since)? {
        let delta = delta?;
        let from = delta
            .from
            .map(|h| h.to_hex())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>8}  {}  {} -> {}  {}",
            delta.sequence,
            delta.time.to_rfc3339(),
            &from[..from.len().min(12)],
            &delta.to.to_hex()[..12],
            delta.changed_paths.join(" ")
        );
    }
    journal.flush()?;
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
