mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use output::{
    AssetOutput, CatOutput, CleanStagingOutput, DownloadOutput, InfoOutput, InitOutput, LsOutput,
    OutputWriter, PathOutput, PruneOutput, TransferOutput, WriteOutput, format_timestamp,
};
use sandcas_core::{
    AssetCache, CacheEntry, DeleteOptions, DownloadOptions, Downloader, FileStore, Hash,
    InfoOptions, Manifest, MkdirOptions,
};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Sandcas - A sandboxed file store with a content-addressed download cache
#[derive(Parser)]
#[command(name = "sandcas")]
#[command(about = "Sandboxed file store with a content-addressed download cache", long_about = None)]
#[command(version)]
struct Cli {
    /// Sandbox root directory (defaults to SANDCAS_ROOT env var, then the config file)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file (defaults to ~/.config/sandcas/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new sandbox
    Init,

    /// Show metadata for a path
    Info {
        /// Logical path
        path: String,

        /// Resolve relative to the cache directory
        #[arg(long)]
        cache: bool,

        /// Compute the content digest
        #[arg(long)]
        md5: bool,
    },

    /// Output file content to stdout
    Cat {
        /// Logical path
        path: String,
    },

    /// Write a file from --content or stdin
    Write {
        /// Logical path
        path: String,

        /// Content to write (reads stdin if omitted)
        #[arg(long)]
        content: Option<String>,
    },

    /// Delete a file or directory
    Rm {
        /// Logical path
        path: String,

        /// Succeed if the path does not exist
        #[arg(long)]
        idempotent: bool,
    },

    /// Move a file or directory, replacing the destination
    Mv {
        from: String,
        to: String,
    },

    /// Copy a file or directory, replacing the destination
    Cp {
        from: String,
        to: String,
    },

    /// Create a directory
    Mkdir {
        /// Logical path
        path: String,

        /// Create missing parents; succeed if the directory exists
        #[arg(short = 'p', long)]
        parents: bool,
    },

    /// List directory entries (the sandbox root if no path given)
    Ls {
        /// Logical path
        path: Option<String>,
    },

    /// Download a URL into the sandbox
    Download {
        /// Remote URL (http or https)
        url: String,

        /// Destination logical path
        path: String,

        /// Report the content digest
        #[arg(long)]
        md5: bool,

        /// Expected digest (hex); the download fails if it does not match
        #[arg(long, value_name = "HASH")]
        expect: Option<String>,
    },

    /// Manage cached assets
    #[command(subcommand)]
    Asset(AssetCommands),

    /// Remove stale staging files left by interrupted operations
    CleanStaging {
        /// Minimum age of entries to remove, in seconds
        #[arg(long, default_value_t = 86400)]
        max_age_secs: u64,
    },
}

#[derive(Subcommand)]
enum AssetCommands {
    /// Show manifest metadata for an asset
    Resolve {
        /// Asset identifier
        id: String,

        /// Asset manifest (defaults to the configured manifest)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Download an asset into the cache unless already present
    Fetch {
        /// Asset identifier
        id: String,

        /// Asset manifest (defaults to the configured manifest)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Delete cache files not referenced by the manifest
    Prune {
        /// Dry run - show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Asset manifest (defaults to the configured manifest)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

/// Resolved settings shared by all commands.
struct App {
    config: Config,
    root: PathBuf,
    output: OutputWriter,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let output = OutputWriter::new(cli.json);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            output.write_error(&err, 1);
            return ExitCode::from(1);
        }
    };
    init_tracing(cli.verbose, &config.logging.level);

    // Determine sandbox root: CLI arg > SANDCAS_ROOT env var > config file
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| config.sandbox.root.clone());
    let app = App {
        config,
        root,
        output,
    };

    match run(&app, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = result_code(&err);
            app.output.write_error(&err, code);
            ExitCode::from(code)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = Config::load(&path)?;
    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Init => cmd_init(app),
        Commands::Info { path, cache, md5 } => cmd_info(app, &path, cache, md5).await,
        Commands::Cat { path } => cmd_cat(app, &path).await,
        Commands::Write { path, content } => cmd_write(app, &path, content).await,
        Commands::Rm { path, idempotent } => cmd_rm(app, &path, idempotent).await,
        Commands::Mv { from, to } => cmd_mv(app, &from, &to).await,
        Commands::Cp { from, to } => cmd_cp(app, &from, &to).await,
        Commands::Mkdir { path, parents } => cmd_mkdir(app, &path, parents).await,
        Commands::Ls { path } => cmd_ls(app, path.as_deref().unwrap_or("")).await,
        Commands::Download {
            url,
            path,
            md5,
            expect,
        } => cmd_download(app, &url, &path, md5, expect.as_deref()).await,
        Commands::Asset(asset_cmd) => match asset_cmd {
            AssetCommands::Resolve { id, manifest } => cmd_asset_resolve(app, &id, manifest).await,
            AssetCommands::Fetch { id, manifest } => cmd_asset_fetch(app, &id, manifest).await,
            AssetCommands::Prune { dry_run, manifest } => {
                cmd_asset_prune(app, dry_run, manifest).await
            }
        },
        Commands::CleanStaging { max_age_secs } => cmd_clean_staging(app, max_age_secs).await,
    }
}

/// Map a failure to a process exit code.
fn result_code(err: &anyhow::Error) -> u8 {
    use sandcas_core::Error;

    match err.chain().find_map(|e| e.downcast_ref::<Error>()) {
        Some(Error::NotFound { .. } | Error::UnknownAsset { .. }) => 2,
        Some(Error::OutOfScope { .. }) => 3,
        Some(
            Error::AlreadyExists { .. }
            | Error::ParentMissing { .. }
            | Error::NotADirectory { .. }
            | Error::IsADirectory { .. },
        ) => 4,
        Some(Error::Transport { .. } | Error::InvalidUrl { .. }) => 5,
        Some(Error::Integrity { .. }) => 6,
        _ => 1,
    }
}

impl App {
    fn open_store(&self) -> Result<FileStore> {
        FileStore::open(&self.root, self.config.store_options())
            .with_context(|| format!("Failed to open sandbox at {}", self.root.display()))
    }

    fn downloader(&self) -> Result<Downloader> {
        let store = self.open_store()?;
        Downloader::with_http(store, &self.config.transport_options())
            .context("Failed to create HTTP transport")
    }

    async fn asset_cache(&self, manifest: Option<PathBuf>) -> Result<AssetCache> {
        let path = manifest
            .or_else(|| self.config.cache.manifest.clone())
            .context("No asset manifest configured (use --manifest or [cache] manifest)")?;
        let manifest = Manifest::load(&path, self.config.algorithm())
            .await
            .with_context(|| format!("Failed to load manifest: {}", path.display()))?;
        Ok(AssetCache::new(
            self.downloader()?,
            manifest,
            self.config.cache.prefix.clone(),
        ))
    }
}

fn cmd_init(app: &App) -> Result<()> {
    let store = FileStore::init(&app.root, app.config.store_options())
        .with_context(|| format!("Failed to initialize sandbox at {}", app.root.display()))?;

    let output_data = InitOutput {
        success: true,
        result_code: 0,
        root: store.root().display().to_string(),
        cache_dir: store.cache_dir().display().to_string(),
        algorithm: store.algorithm().as_str().to_string(),
    };

    app.output.write(&output_data, || {
        format!(
            "Initialized sandcas sandbox at {}\nAlgorithm: {}\n",
            store.root().display(),
            store.algorithm().as_str()
        )
    })
}

async fn cmd_info(app: &App, path: &str, cache: bool, md5: bool) -> Result<()> {
    let store = app.open_store()?;
    let info = store
        .info(path, InfoOptions { cache, hash: md5 })
        .await
        .with_context(|| format!("Failed to get info for {}", path))?;

    let output_data = InfoOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        modified: info.modification_time.map(format_timestamp),
        info,
    };

    app.output.write(&output_data, || {
        let info = &output_data.info;
        if !info.exists {
            return format!("Path: {}\nExists: false\nURI: {}\n", path, info.uri);
        }
        let mut text = format!(
            "Path: {}\nType: {}\n",
            path,
            if info.is_directory { "directory" } else { "file" }
        );
        if let Some(size) = info.size {
            text.push_str(&format!("Size: {} bytes\n", size));
        }
        if let Some(modified) = &output_data.modified {
            text.push_str(&format!("Modified: {}\n", modified));
        }
        if let Some(hash) = &info.hash {
            text.push_str(&format!("Hash ({}): {}\n", hash.algorithm(), hash));
        }
        text.push_str(&format!("URI: {}\n", info.uri));
        text
    })
}

async fn cmd_cat(app: &App, path: &str) -> Result<()> {
    let store = app.open_store()?;
    let bytes = store
        .read(path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;

    if !app.output.is_json() {
        return app.output.write_raw(&bytes);
    }

    let output_data = CatOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        size: bytes.len(),
        content: String::from_utf8_lossy(&bytes).into_owned(),
    };
    app.output.write(&output_data, String::new)
}

async fn cmd_write(app: &App, path: &str, content: Option<String>) -> Result<()> {
    let bytes = match content {
        Some(content) => content.into_bytes(),
        None => {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("Refusing to read content from a terminal; pipe data or use --content");
            }
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    let store = app.open_store()?;
    store
        .write(path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path))?;

    let output_data = WriteOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        size: bytes.len(),
    };
    app.output.write(&output_data, || {
        format!("Wrote {} bytes to {}\n", bytes.len(), path)
    })
}

async fn cmd_rm(app: &App, path: &str, idempotent: bool) -> Result<()> {
    let store = app.open_store()?;
    store
        .delete(path, DeleteOptions { idempotent })
        .await
        .with_context(|| format!("Failed to delete {}", path))?;

    let output_data = PathOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
    };
    app.output
        .write(&output_data, || format!("Deleted {}\n", path))
}

async fn cmd_mv(app: &App, from: &str, to: &str) -> Result<()> {
    let store = app.open_store()?;
    store
        .move_path(from, to)
        .await
        .with_context(|| format!("Failed to move {} to {}", from, to))?;

    let output_data = TransferOutput {
        success: true,
        result_code: 0,
        from: from.to_string(),
        to: to.to_string(),
    };
    app.output
        .write(&output_data, || format!("Moved {} -> {}\n", from, to))
}

async fn cmd_cp(app: &App, from: &str, to: &str) -> Result<()> {
    let store = app.open_store()?;
    store
        .copy_path(from, to)
        .await
        .with_context(|| format!("Failed to copy {} to {}", from, to))?;

    let output_data = TransferOutput {
        success: true,
        result_code: 0,
        from: from.to_string(),
        to: to.to_string(),
    };
    app.output
        .write(&output_data, || format!("Copied {} -> {}\n", from, to))
}

async fn cmd_mkdir(app: &App, path: &str, parents: bool) -> Result<()> {
    let store = app.open_store()?;
    store
        .make_directory(
            path,
            MkdirOptions {
                intermediates: parents,
            },
        )
        .await
        .with_context(|| format!("Failed to create directory {}", path))?;

    let output_data = PathOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
    };
    app.output
        .write(&output_data, || format!("Created directory {}\n", path))
}

async fn cmd_ls(app: &App, path: &str) -> Result<()> {
    let store = app.open_store()?;
    let entries = store
        .read_directory(path)
        .await
        .with_context(|| format!("Failed to list {}", if path.is_empty() { "." } else { path }))?;

    let output_data = LsOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        entries,
    };
    app.output.write(&output_data, || {
        output_data
            .entries
            .iter()
            .map(|name| format!("{}\n", name))
            .collect()
    })
}

async fn cmd_download(
    app: &App,
    url: &str,
    path: &str,
    md5: bool,
    expect: Option<&str>,
) -> Result<()> {
    let expected_hash = expect
        .map(|hex| Hash::parse_hex(hex).with_context(|| format!("Invalid hash: {}", hex)))
        .transpose()?;

    let downloader = app.downloader()?;
    let result = downloader
        .download(
            url,
            path,
            DownloadOptions {
                hash: md5,
                expected_hash,
            },
        )
        .await
        .with_context(|| format!("Failed to download {}", url))?;

    let output_data = DownloadOutput {
        success: true,
        result_code: 0,
        result,
    };
    app.output.write(&output_data, || {
        let result = &output_data.result;
        let mut text = format!(
            "Downloaded {} -> {}\nStatus: {}\nSize: {} bytes\n",
            url, result.uri, result.status, result.size
        );
        if let Some(hash) = &result.hash {
            text.push_str(&format!("Hash ({}): {}\n", hash.algorithm(), hash));
        }
        text
    })
}

fn asset_output(cache: &AssetCache, entry: CacheEntry) -> AssetOutput {
    AssetOutput {
        success: true,
        result_code: 0,
        cache_file: cache.cache_file_name(&entry),
        entry,
    }
}

fn asset_text(output_data: &AssetOutput) -> String {
    let entry = &output_data.entry;
    let mut text = format!(
        "Id: {}\nName: {}\nType: {}\nHash: {}\n",
        entry.id, entry.name, entry.kind, entry.hash
    );
    if let (Some(width), Some(height)) = (entry.width, entry.height) {
        text.push_str(&format!("Dimensions: {}x{}\n", width, height));
    }
    text.push_str(&format!("URL: {}\nCache file: {}\n", entry.url, output_data.cache_file));
    if let Some(local_uri) = &entry.local_uri {
        text.push_str(&format!("Local URI: {}\n", local_uri));
    }
    text
}

async fn cmd_asset_resolve(app: &App, id: &str, manifest: Option<PathBuf>) -> Result<()> {
    let cache = app.asset_cache(manifest).await?;
    let entry = cache
        .resolve(id)
        .with_context(|| format!("Failed to resolve asset {}", id))?;

    let output_data = asset_output(&cache, entry);
    app.output.write(&output_data, || asset_text(&output_data))
}

async fn cmd_asset_fetch(app: &App, id: &str, manifest: Option<PathBuf>) -> Result<()> {
    let cache = app.asset_cache(manifest).await?;
    let entry = cache
        .download(id)
        .await
        .with_context(|| format!("Failed to fetch asset {}", id))?;

    let output_data = asset_output(&cache, entry);
    app.output.write(&output_data, || asset_text(&output_data))
}

async fn cmd_asset_prune(app: &App, dry_run: bool, manifest: Option<PathBuf>) -> Result<()> {
    let cache = app.asset_cache(manifest).await?;
    let stats = cache
        .prune(dry_run)
        .await
        .context("Failed to prune asset cache")?;

    let output_data = PruneOutput {
        success: true,
        result_code: 0,
        dry_run,
        files_deleted: stats.files_deleted,
        bytes_freed: stats.bytes_freed,
    };
    app.output.write(&output_data, || {
        if dry_run {
            format!(
                "Dry run - no files deleted\nWould delete {} files\nWould free {} bytes\n",
                stats.files_deleted, stats.bytes_freed
            )
        } else {
            format!(
                "Deleted {} files\nFreed {} bytes\n",
                stats.files_deleted, stats.bytes_freed
            )
        }
    })
}

async fn cmd_clean_staging(app: &App, max_age_secs: u64) -> Result<()> {
    let store = app.open_store()?;
    let removed = store
        .cleanup_stale_staging(Duration::from_secs(max_age_secs))
        .await
        .context("Failed to clean staging directory")?;

    let output_data = CleanStagingOutput {
        success: true,
        result_code: 0,
        removed,
    };
    app.output.write(&output_data, || {
        format!("Removed {} stale staging entries\n", removed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags_after_command() {
        let cli = Cli::try_parse_from([
            "sandcas", "ls", "docs", "--json", "--verbose", "--root", "/tmp/box",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/box")));
        assert!(matches!(cli.command, Commands::Ls { path: Some(ref p) } if p == "docs"));
    }

    #[test]
    fn test_parse_download() {
        let cli = Cli::try_parse_from([
            "sandcas",
            "download",
            "https://example.com/a.png",
            "a.png",
            "--md5",
            "--expect",
            "1e02045c10b8f1145edc7c8375998f87",
        ])
        .unwrap();
        match cli.command {
            Commands::Download {
                url,
                path,
                md5,
                expect,
            } => {
                assert_eq!(url, "https://example.com/a.png");
                assert_eq!(path, "a.png");
                assert!(md5);
                assert_eq!(expect.as_deref(), Some("1e02045c10b8f1145edc7c8375998f87"));
            }
            _ => panic!("expected download command"),
        }
    }

    #[test]
    fn test_parse_mkdir_parents_short() {
        let cli = Cli::try_parse_from(["sandcas", "mkdir", "-p", "a/b/c"]).unwrap();
        assert!(matches!(cli.command, Commands::Mkdir { parents: true, .. }));
    }

    #[test]
    fn test_parse_asset_prune() {
        let cli =
            Cli::try_parse_from(["sandcas", "asset", "prune", "--dry-run", "--manifest", "m.json"])
                .unwrap();
        match cli.command {
            Commands::Asset(AssetCommands::Prune { dry_run, manifest }) => {
                assert!(dry_run);
                assert_eq!(manifest, Some(PathBuf::from("m.json")));
            }
            _ => panic!("expected asset prune command"),
        }
    }

    #[test]
    fn test_parse_clean_staging_default() {
        let cli = Cli::try_parse_from(["sandcas", "clean-staging"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::CleanStaging {
                max_age_secs: 86400
            }
        ));
    }

    #[test]
    fn test_missing_command_fails() {
        assert!(Cli::try_parse_from(["sandcas"]).is_err());
    }

    #[test]
    fn test_result_codes() {
        let err = anyhow::Error::new(sandcas_core::Error::out_of_scope("../x"))
            .context("Failed to write ../x");
        assert_eq!(result_code(&err), 3);

        let err = anyhow::Error::new(sandcas_core::Error::not_found("/x"));
        assert_eq!(result_code(&err), 2);

        let err = anyhow::Error::new(sandcas_core::Error::integrity("/x", "aa", "bb"));
        assert_eq!(result_code(&err), 6);

        assert_eq!(result_code(&anyhow::anyhow!("plain failure")), 1);
    }
}
