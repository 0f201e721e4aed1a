// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Eye-Fi card emulator
//!
//! Speaks the card side of the protocol against an upload server: opens a
//! session, announces each photo, and uploads it as a tar archive with its
//! integrity digest. Useful for exercising a server without a camera.
//!
//! # Flow
//!
//! ```text
//! ┌──────────────┐  StartSession    ┌──────────────┐
//! │     Card     │ ───────────────> │    Server    │
//! │  (emulator)  │  GetPhotoStatus  │              │
//! │              │ ───────────────> │              │
//! │              │  UploadPhoto     │              │
//! │              │ ───────────────> │   (sink)     │
//! └──────────────┘                  └──────────────┘
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eyefi_core::{
    client::{CardClient, PhotoFile},
    config::CardClientConfig,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "eyefi-card")]
#[command(about = "Eye-Fi Card - Emulates a wireless SD card uploading photos", long_about = None)]
struct Args {
    /// Path to configuration file (ignored if --env-mode is set)
    #[arg(short, long, default_value = "config/card.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Load configuration from EYEFI_CARD_* environment variables
    #[arg(long, default_value = "false")]
    env_mode: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a session and verify the server knows our upload key
    Session,

    /// Upload photos, one archive per file
    Upload {
        /// Photos to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Send MarkLastPhotoInRoll after the last upload
        #[arg(long)]
        mark_last: bool,
    },
}

/// Transfer mode reported by cards in normal upload mode
const TRANSFER_MODE: &str = "2";

/// Read a photo from disk under its bare file name
fn read_photo(path: &Path) -> Result<PhotoFile> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("No usable file name in {}", path.display()))?
        .to_string();
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(PhotoFile { name, data })
}

/// Cards name the archive after the photo it carries
fn archive_name(photo: &PhotoFile) -> String {
    format!("{}.tar", photo.name)
}

async fn open_session(client: &CardClient) -> Result<()> {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let session = client
        .start_session(TRANSFER_MODE, &timestamp)
        .await
        .context("StartSession failed")?;
    info!(
        snonce = %session.snonce.to_hex(),
        upsync_allowed = session.upsync_allowed,
        "Server authenticated"
    );
    Ok(())
}

async fn upload(client: &CardClient, files: &[PathBuf], mark_last: bool) -> Result<()> {
    open_session(client).await?;

    let mut failed = 0;
    for path in files {
        let photo = read_photo(path)?;
        let name = archive_name(&photo);

        let status = client
            .get_photo_status(&name, photo.data.len() as u64)
            .await
            .with_context(|| format!("GetPhotoStatus failed for {}", name))?;
        info!(file = %name, file_id = status.file_id, "Photo announced");

        let accepted = client
            .upload_photo(&name, status.file_id, std::slice::from_ref(&photo))
            .await
            .with_context(|| format!("Upload failed for {}", name))?;
        if accepted {
            info!(file = %name, bytes = photo.data.len(), "Photo uploaded");
        } else {
            warn!(file = %name, "Server rejected upload");
            failed += 1;
        }
    }

    if mark_last {
        client
            .mark_last_photo_in_roll()
            .await
            .context("MarkLastPhotoInRoll failed")?;
        info!("Roll marked complete");
    }

    if failed > 0 {
        bail!("{} of {} upload(s) rejected", failed, files.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    info!("SceyeFi Card v{}", eyefi_core::VERSION);

    // Load configuration
    let config = if args.env_mode {
        info!("Loading configuration from environment variables");
        CardClientConfig::from_env().context("Failed to load configuration from environment")?
    } else {
        info!("Loading configuration from file: {:?}", args.config);
        CardClientConfig::from_file(&args.config).context("Failed to load configuration from file")?
    };

    info!("Server: {}", config.server_url);
    let client = CardClient::from_config(&config).context("Failed to create client")?;

    match args.command {
        Command::Session => open_session(&client).await,
        Command::Upload { files, mark_last } => upload(&client, &files, mark_last).await,
    }
}
