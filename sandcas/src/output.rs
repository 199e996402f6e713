//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sandcas_core::{CacheEntry, DownloadResult, FileInfo};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Check if JSON mode is enabled.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write raw bytes to stdout (text mode file contents).
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut handle = self.stdout.lock();
        handle.write_all(bytes)?;
        handle.flush()?;
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error message with its context chain.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Render seconds since the epoch as an RFC 3339 UTC timestamp.
pub fn format_timestamp(secs: f64) -> String {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(whole as i64, nanos)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| secs.to_string())
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub cache_dir: String,
    pub algorithm: String,
}

/// Output for `info` command.
#[derive(Debug, Serialize)]
pub struct InfoOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    #[serde(flatten)]
    pub info: FileInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

/// Output for `cat` command.
#[derive(Debug, Serialize)]
pub struct CatOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub size: usize,
    pub content: String,
}

/// Output for `write` command.
#[derive(Debug, Serialize)]
pub struct WriteOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub size: usize,
}

/// Output for commands acting on one path (`rm`, `mkdir`).
#[derive(Debug, Serialize)]
pub struct PathOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
}

/// Output for `mv` and `cp` commands.
#[derive(Debug, Serialize)]
pub struct TransferOutput {
    pub success: bool,
    pub result_code: u8,
    pub from: String,
    pub to: String,
}

/// Output for `ls` command.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub entries: Vec<String>,
}

/// Output for `download` command.
#[derive(Debug, Serialize)]
pub struct DownloadOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub result: DownloadResult,
}

/// Output for `asset resolve` and `asset fetch` commands.
#[derive(Debug, Serialize)]
pub struct AssetOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub entry: CacheEntry,
    pub cache_file: String,
}

/// Output for `asset prune` command.
#[derive(Debug, Serialize)]
pub struct PruneOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

/// Output for `clean-staging` command.
#[derive(Debug, Serialize)]
pub struct CleanStagingOutput {
    pub success: bool,
    pub result_code: u8,
    pub removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(1_700_000_000.75), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_info_output_flattens() {
        let output = InfoOutput {
            success: true,
            result_code: 0,
            path: "a.txt".to_string(),
            info: FileInfo {
                exists: true,
                is_directory: false,
                size: Some(3),
                modification_time: Some(0.0),
                hash: None,
                uri: "file:///sandbox/a.txt".to_string(),
            },
            modified: Some(format_timestamp(0.0)),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["exists"], true);
        assert_eq!(json["size"], 3);
        assert_eq!(json["uri"], "file:///sandbox/a.txt");
        assert!(json.get("hash").is_none());
    }

    #[test]
    fn test_output_writer_mode() {
        assert!(OutputWriter::new(true).is_json());
        assert!(!OutputWriter::new(false).is_json());
    }
}
