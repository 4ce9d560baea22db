//! amtunnel entry point.
//!
//! ```text
//! amtunnel send <uri> [--name N]             Upload a file, URL or data URI to stdout
//! amtunnel receive [--start N] [--out-dir D] Save a download arriving on stdin
//! amtunnel unpack <out>                      Rebuild a file from an upload on stdin
//! amtunnel --config <path>                   Load a custom config TOML
//! amtunnel --gen-config [path]               Write default config to a file or stdout
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use amtunnel_cli::config::{LoggingConfig, TunnelConfig};
use amtunnel_cli::storage::FsStorage;
use amtunnel_cli::transfer;
use amtunnel_core::metadata::KEY_FILENAME;
use amtunnel_core::{BulkFileMetadata, BulkFileUploader, pty_channel};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "amtunnel", about = "Bulk file transfer over a terminal byte stream")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "amtunnel.toml")]
    config: PathBuf,

    /// Write the default configuration to PATH (stdout when omitted) and exit.
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "-")]
    gen_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a source as framed lines on stdout.
    Send {
        /// File path, `file://`, `http(s)://` or `data:` URI.
        uri: String,
        /// File name announced to the receiver.
        #[arg(long)]
        name: Option<String>,
    },
    /// Receive an application-mode download from stdin.
    Receive {
        /// Metadata length; read from the first input line when omitted.
        #[arg(long)]
        start: Option<usize>,
        /// Directory for received files (overrides the config).
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Rebuild a file from an upload stream on stdin.
    Unpack {
        /// Output file path.
        out: PathBuf,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if let Some(path) = cli.gen_config {
        if path.as_os_str() == "-" {
            println!("{}", TunnelConfig::default_toml()?);
        } else {
            TunnelConfig::write_default(&path)?;
            eprintln!("wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let Some(command) = cli.command else {
        return Err("no command given; see --help".into());
    };

    // Load config.
    let (config, origin) = TunnelConfig::load(&cli.config);
    init_tracing(&config.logging)?;
    info!("amtunnel v{}", env!("CARGO_PKG_VERSION"));
    origin.report(&cli.config);

    match command {
        Commands::Send { uri, name } => {
            let (writer, reader) = pty_channel(config.pty_buffer_size());
            let (uploader, events) =
                BulkFileUploader::new(uri, writer, config.to_upload_options());
            let uploader = match name {
                Some(name) => {
                    uploader.with_metadata(BulkFileMetadata::new().with(KEY_FILENAME, name))
                }
                None => uploader,
            };

            // Ctrl-C handler.
            let handle = uploader.handle();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                warn!("Ctrl-C received; aborting upload");
                handle.abort();
            });

            let bytes = transfer::send(uploader, events, reader, tokio::io::stdout()).await?;
            info!(bytes, "send done");
        }
        Commands::Receive { start, out_dir } => {
            let dir = out_dir.unwrap_or_else(|| config.download.output_dir.clone());
            let storage = FsStorage::new(dir, config.write_high_water_mark());
            let saved = transfer::receive(
                tokio::io::stdin(),
                start,
                storage,
                config.to_download_options(),
                tokio::io::stdout(),
            )
            .await?;
            for path in saved {
                info!("received {}", path.display());
            }
        }
        Commands::Unpack { out } => {
            let summary = transfer::unpack(tokio::io::stdin(), &out).await?;
            info!(bytes = summary.bytes, "unpacked to {}", out.display());
        }
    }

    Ok(())
}

/// Log to stderr, or to the configured file; `RUST_LOG` wins over the
/// configured level. Stdout carries protocol lines.
fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.file.is_empty() {
        builder.with_writer(std::io::stderr).init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)?;
        builder.with_writer(Mutex::new(file)).with_ansi(false).init();
    }
    Ok(())
}
