//! Configuration for the amtunnel binary.

use std::path::{Path, PathBuf};

use amtunnel_core::upload::{DEFAULT_PTY_BUFFER_SIZE, DEFAULT_SOURCE_CHUNK_SIZE};
use amtunnel_core::{DownloadOptions, UploadOptions, download::DEFAULT_CREATED_THRESHOLD};
use serde::{Deserialize, Serialize};

/// Smallest pty budget that still holds one full upload line.
const MIN_PTY_BUFFER_SIZE: usize = 1024;

/// Smallest filesystem buffer that still holds one full download frame.
const MIN_HIGH_WATER_MARK: usize = 4096;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Inbound transfer settings.
    pub download: DownloadConfig,
    /// Outbound transfer settings.
    pub upload: UploadConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Inbound transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Bytes written before a partial file is announced.
    pub created_threshold: usize,
    /// Bytes the filesystem sink buffers before asking for a pause.
    pub write_high_water_mark: usize,
    /// Directory received files are written into.
    pub output_dir: PathBuf,
}

/// Outbound transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes allowed in flight toward the pty.
    pub pty_buffer_size: usize,
    /// Read size for file and inline sources.
    pub source_chunk_size: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            created_threshold: DEFAULT_CREATED_THRESHOLD,
            write_high_water_mark: 64 * 1024,
            output_dir: PathBuf::from("."),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pty_buffer_size: DEFAULT_PTY_BUFFER_SIZE,
            source_chunk_size: DEFAULT_SOURCE_CHUNK_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File,
    /// No readable file; defaults in use.
    Missing,
    /// The file did not parse; defaults in use.
    Invalid(String),
}

impl ConfigOrigin {
    /// Log how the configuration at `path` was obtained. Call once a
    /// subscriber is installed.
    pub fn report(&self, path: &Path) {
        match self {
            Self::File => tracing::debug!("loaded config from {}", path.display()),
            Self::Missing => tracing::info!("no config at {}; using defaults", path.display()),
            Self::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> (Self, ConfigOrigin) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigOrigin::File),
                Err(e) => (Self::default(), ConfigOrigin::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigOrigin::Missing),
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        std::fs::write(path, Self::default_toml().map_err(std::io::Error::other)?)
    }

    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    pub fn to_download_options(&self) -> DownloadOptions {
        DownloadOptions {
            created_threshold: self.download.created_threshold,
        }
    }

    pub fn to_upload_options(&self) -> UploadOptions {
        UploadOptions {
            source_chunk_size: self.upload.source_chunk_size.max(1),
        }
    }

    pub fn pty_buffer_size(&self) -> usize {
        self.upload.pty_buffer_size.max(MIN_PTY_BUFFER_SIZE)
    }

    pub fn write_high_water_mark(&self) -> usize {
        self.download.write_high_water_mark.max(MIN_HIGH_WATER_MARK)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&TunnelConfig::default()).unwrap();
        assert!(text.contains("created_threshold"));
        assert!(text.contains("pty_buffer_size"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&TunnelConfig::default()).unwrap();
        let parsed: TunnelConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.download.created_threshold, 1024);
        assert_eq!(parsed.upload.pty_buffer_size, 16 * 1024);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: TunnelConfig = toml::from_str("[upload]\nsource_chunk_size = 512\n").unwrap();
        assert_eq!(parsed.upload.source_chunk_size, 512);
        assert_eq!(parsed.upload.pty_buffer_size, DEFAULT_PTY_BUFFER_SIZE);
        assert_eq!(parsed.download.output_dir, PathBuf::from("."));
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let mut cfg = TunnelConfig::default();
        cfg.upload.pty_buffer_size = 0;
        cfg.upload.source_chunk_size = 0;
        cfg.download.write_high_water_mark = 0;
        assert_eq!(cfg.pty_buffer_size(), MIN_PTY_BUFFER_SIZE);
        assert_eq!(cfg.to_upload_options().source_chunk_size, 1);
        assert_eq!(cfg.write_high_water_mark(), MIN_HIGH_WATER_MARK);
    }

    #[test]
    fn load_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("amtunnel.toml");
        std::fs::write(&path, "download = 7").unwrap();
        let (cfg, origin) = TunnelConfig::load(&path);
        assert_eq!(cfg.download.created_threshold, DEFAULT_CREATED_THRESHOLD);
        assert!(matches!(origin, ConfigOrigin::Invalid(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, origin) = TunnelConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(origin, ConfigOrigin::Missing);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn written_default_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("amtunnel.toml");
        assert!(TunnelConfig::write_default(&path).is_err());

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        TunnelConfig::write_default(&path).unwrap();
        let (cfg, origin) = TunnelConfig::load(&path);
        assert_eq!(origin, ConfigOrigin::File);
        assert_eq!(cfg.upload.source_chunk_size, DEFAULT_SOURCE_CHUNK_SIZE);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            TunnelConfig::default_toml().unwrap()
        );
    }
}
