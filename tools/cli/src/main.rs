//! Sanctuary CLI - Command line client for the reader sync engine.
//!
//! Applies reader mutations against the local store, delivers them to the
//! configured sync API and reports what is still pending.

mod config;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sanctuary_common::{Bookmark, Device, EntityId, ReaderSettings, ReadingSession, ReadingStatus, ThemePreset};
use sanctuary_remote::{HttpRemoteClient, MemoryRemote, RemoteSyncClient};
use sanctuary_storage::create_default_registry;
use sanctuary_sync::{EngineConfig, FlushOutcome, SyncEngine};

use crate::config::{default_config_path, ClientConfig};

#[derive(Parser)]
#[command(name = "sanctuary")]
#[command(about = "Sanctuary - Offline-first reader sync client")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file.
    Setup {
        /// Base URL of the sync API.
        #[arg(long)]
        api_base_url: Option<String>,

        /// Bearer token for the sync API.
        #[arg(long)]
        token: Option<String>,

        /// Directory of the local store.
        #[arg(long)]
        store_root: Option<PathBuf>,

        /// Keep every change local.
        #[arg(long)]
        local_only: bool,
    },

    /// Fetch the remote library and settings and merge them.
    Pull,

    /// List books in the local library.
    List,

    /// Record a new reading position.
    Progress {
        /// Book id.
        book: String,

        /// Percentage read (0-100).
        percent: f64,

        /// Location (EPUB CFI) of the position.
        location: String,
    },

    /// Add or remove a bookmark.
    Bookmark {
        /// Book id.
        book: String,

        /// Location (EPUB CFI) of the bookmark.
        cfi: String,

        /// Bookmark label.
        #[arg(short, long, default_value = "Bookmark")]
        title: String,

        /// Remove instead of add.
        #[arg(short, long)]
        remove: bool,
    },

    /// Toggle the favorite flag of a book.
    Favorite {
        /// Book id.
        book: String,
    },

    /// Move a book to a reading list: "to-read", "reading" or "finished".
    Shelve {
        /// Book id.
        book: String,

        /// Target list.
        status: String,
    },

    /// Queue a reading session.
    Session {
        /// Book id.
        book: String,

        /// Reading time in seconds.
        #[arg(short, long)]
        duration: u64,

        /// Pages turned.
        #[arg(short, long, default_value = "0")]
        pages: u32,
    },

    /// Show or change reader settings.
    Settings {
        /// Theme: "paper", "ivory" or "ink".
        #[arg(long)]
        theme: Option<String>,

        /// Font scale factor.
        #[arg(long)]
        font_scale: Option<f32>,
    },

    /// Deliver everything pending now.
    Flush,

    /// Show sync status and pending mutations.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder().with_target(false).compact();
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::Setup {
        api_base_url,
        token,
        store_root,
        local_only,
    } = cli.command
    {
        return cmd_setup(&config_path, api_base_url, token, store_root, local_only);
    }

    let config = ClientConfig::load(&config_path)?;
    let engine = open_engine(&config).await?;
    let explicit_flush = matches!(cli.command, Commands::Flush);

    let result = match cli.command {
        Commands::Setup { .. } => Ok(()),
        Commands::Pull => cmd_pull(&engine).await,
        Commands::List => cmd_list(&engine),
        Commands::Progress {
            book,
            percent,
            location,
        } => cmd_progress(&engine, &book, percent, &location).await,
        Commands::Bookmark {
            book,
            cfi,
            title,
            remove,
        } => cmd_bookmark(&engine, &book, cfi, title, remove).await,
        Commands::Favorite { book } => cmd_favorite(&engine, &book).await,
        Commands::Shelve { book, status } => cmd_shelve(&engine, &book, &status).await,
        Commands::Session {
            book,
            duration,
            pages,
        } => cmd_session(&engine, &book, duration, pages).await,
        Commands::Settings { theme, font_scale } => cmd_settings(&engine, theme, font_scale).await,
        Commands::Flush => cmd_flush(&engine).await,
        Commands::Status => cmd_status(&engine),
    };

    // Hand queued work to the remote before exiting.
    if config.is_online() && !explicit_flush {
        report_flush(&engine).await;
    }
    engine.dispose().await;
    result
}

/// Build an engine from the client config.
async fn open_engine(config: &ClientConfig) -> Result<SyncEngine> {
    let store = create_default_registry()
        .resolve(&config.store, config.store_config.clone())
        .with_context(|| format!("Failed to open store '{}'", config.store))?;

    let remote: Arc<dyn RemoteSyncClient> = match &config.api_base_url {
        Some(url) => {
            let mut client = HttpRemoteClient::new(url).context("Invalid API base URL")?;
            if let Some(token) = &config.token {
                client = client.with_token(token.clone());
            }
            Arc::new(client)
        }
        None => Arc::new(MemoryRemote::new()),
    };

    let engine_config = EngineConfig::default().with_sync_enabled(config.is_online());
    let engine = SyncEngine::new(remote, store, engine_config);
    engine.init().await.context("Failed to load local state")?;
    Ok(engine)
}

fn parse_id(raw: &str) -> Result<EntityId> {
    EntityId::new(raw).context("Invalid id")
}

/// Write a config file.
fn cmd_setup(
    path: &PathBuf,
    api_base_url: Option<String>,
    token: Option<String>,
    store_root: Option<PathBuf>,
    local_only: bool,
) -> Result<()> {
    let mut config = ClientConfig::load(path)?;
    if api_base_url.is_some() {
        config.api_base_url = api_base_url;
    }
    if token.is_some() {
        config.token = token;
    }
    if let Some(root) = store_root {
        config.store = "local".to_string();
        config.store_config = serde_json::json!({ "root": root.to_string_lossy() });
    }
    config.sync_enabled = !local_only;
    config.save(path)?;

    println!("Config written to {}", path.display());
    println!(
        "  API: {}",
        config.api_base_url.as_deref().unwrap_or("(none, local only)")
    );
    println!("  Store: {}", config.store);
    Ok(())
}

/// Fetch and merge the remote library and settings.
async fn cmd_pull(engine: &SyncEngine) -> Result<()> {
    if !engine.config().sync_enabled {
        anyhow::bail!("Sync is disabled; configure an API with `sanctuary setup`");
    }

    let report = engine
        .refresh_library()
        .await
        .context("Failed to fetch library")?;
    engine
        .refresh_settings()
        .await
        .context("Failed to fetch settings")?;

    println!("Library updated:");
    println!("  Adopted: {}", report.adopted);
    println!("  Merged with local edits: {}", report.merged);
    println!("  Kept local only: {}", report.kept_local);
    println!("  Removed: {}", report.dropped.len());
    Ok(())
}

/// List books.
fn cmd_list(engine: &SyncEngine) -> Result<()> {
    let books = engine.library();
    if books.is_empty() {
        println!("Library is empty.");
        return Ok(());
    }

    for book in books {
        let dirty = if engine.library_state().is_protected(&book.id) {
            " *"
        } else {
            ""
        };
        let favorite = if book.favorite { " [fav]" } else { "" };
        println!(
            "  {} {:>3}% {:?} {} - {}{}{}",
            book.id, book.progress_percent, book.status, book.title, book.author, favorite, dirty
        );
    }
    Ok(())
}

async fn cmd_progress(engine: &SyncEngine, book: &str, percent: f64, location: &str) -> Result<()> {
    let id = parse_id(book)?;
    let item = engine
        .update_progress(&id, percent, location)
        .await
        .context("Failed to update progress")?;
    println!("{} at {}% ({:?})", item.title, item.progress_percent, item.status);
    Ok(())
}

async fn cmd_bookmark(
    engine: &SyncEngine,
    book: &str,
    cfi: String,
    title: String,
    remove: bool,
) -> Result<()> {
    let id = parse_id(book)?;
    let item = if remove {
        engine.remove_bookmark(&id, &cfi).await
    } else {
        engine.add_bookmark(&id, Bookmark { cfi, title }).await
    }
    .context("Failed to update bookmarks")?;
    println!("{} has {} bookmarks", item.title, item.bookmarks.len());
    Ok(())
}

async fn cmd_favorite(engine: &SyncEngine, book: &str) -> Result<()> {
    let id = parse_id(book)?;
    let item = engine
        .toggle_favorite(&id)
        .await
        .context("Failed to toggle favorite")?;
    println!(
        "{} is {}",
        item.title,
        if item.favorite { "a favorite" } else { "no longer a favorite" }
    );
    Ok(())
}

async fn cmd_shelve(engine: &SyncEngine, book: &str, status: &str) -> Result<()> {
    let status = match status {
        "to-read" => ReadingStatus::ToRead,
        "reading" => ReadingStatus::Reading,
        "finished" => ReadingStatus::Finished,
        _ => anyhow::bail!("Invalid status. Use: to-read, reading, or finished"),
    };
    let id = parse_id(book)?;
    let item = engine
        .set_reading_status(&id, status)
        .await
        .context("Failed to change reading list")?;
    println!("{} moved to {:?}", item.title, item.status);
    Ok(())
}

async fn cmd_session(engine: &SyncEngine, book: &str, duration: u64, pages: u32) -> Result<()> {
    let book_id = parse_id(book)?;
    if engine.book(&book_id).is_none() {
        warn!("Book {} is not in the local library", book_id);
    }

    let ended_at = Utc::now();
    let session = ReadingSession {
        id: parse_id(&uuid::Uuid::new_v4().to_string())?,
        book_id,
        started_at: ended_at - chrono::Duration::seconds(duration as i64),
        ended_at: Some(ended_at),
        duration_sec: duration,
        pages_advanced: pages,
        device: Device::Desktop,
    };
    info!("Queueing session {}", session.id);
    engine.record_session(session).await;
    Ok(())
}

async fn cmd_settings(engine: &SyncEngine, theme: Option<String>, font_scale: Option<f32>) -> Result<()> {
    let settings = if theme.is_none() && font_scale.is_none() {
        engine.settings()
    } else {
        let theme = match theme.as_deref() {
            None => None,
            Some("paper") => Some(ThemePreset::Paper),
            Some("ivory") => Some(ThemePreset::Ivory),
            Some("ink") => Some(ThemePreset::Ink),
            Some(_) => anyhow::bail!("Invalid theme. Use: paper, ivory, or ink"),
        };
        engine
            .save_settings(|current| ReaderSettings {
                theme_preset: theme.unwrap_or(current.theme_preset),
                font_scale: font_scale.unwrap_or(current.font_scale),
                ..current.clone()
            })
            .await
            .context("Failed to save settings")?
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

async fn cmd_flush(engine: &SyncEngine) -> Result<()> {
    if !engine.config().sync_enabled {
        println!("Sync is disabled; nothing to deliver.");
        return Ok(());
    }
    report_flush(engine).await;
    Ok(())
}

async fn report_flush(engine: &SyncEngine) {
    let report = engine.flush().await;
    for (name, outcome) in [("progress", report.progress), ("sessions", report.sessions)] {
        match outcome {
            FlushOutcome::Drained { delivered: 0 } => {}
            FlushOutcome::Drained { delivered } => {
                info!("Delivered {} {} updates", delivered, name)
            }
            FlushOutcome::Failed {
                delivered,
                remaining,
                ..
            } => warn!(
                "Delivered {} {} updates, {} still pending",
                delivered, name, remaining
            ),
            FlushOutcome::Coalesced | FlushOutcome::Disposed => {}
        }
    }
    let resynced = engine.resync_dirty().await;
    if resynced > 0 {
        info!("Pushed {} books with earlier failed changes", resynced);
    }
}

fn cmd_status(engine: &SyncEngine) -> Result<()> {
    println!("Sync: {:?}", engine.status());
    println!("  Enabled: {}", engine.config().sync_enabled);

    let pending = engine.progress_queue().snapshot();
    println!("  Queued progress updates: {}", pending.len());
    for entry in pending {
        println!(
            "    {} -> {}",
            entry.entity_id(),
            serde_json::to_string(entry.payload())?
        );
    }
    println!("  Queued sessions: {}", engine.session_queue().len());

    let dirty = engine.library_state().dirty_ids();
    if !dirty.is_empty() {
        println!("  Books with unsent changes:");
        for id in dirty {
            println!("    {}", id);
        }
    }
    Ok(())
}
