use anyhow::{Context, Result};
use bucketsync_lib::logging::{default_config_dir, init_logging, LogConfig};
use bucketsync_lib::{
    LocalFileStorage, ProgressUiFactory, RemoteConfig, S3ObjectStorage, SyncConfig, SyncEngine,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upload a directory to an S3-compatible bucket, skipping unchanged files.
#[derive(Debug, Parser)]
#[command(name = "bucketsync", version, about)]
struct Cli {
    /// Directory to upload
    source_dir: PathBuf,

    /// Target bucket
    bucket: String,

    /// Key prefix inside the bucket
    #[arg(long)]
    prefix: Option<String>,

    /// Delete objects that no longer exist locally
    #[arg(long)]
    remove_deleted: bool,

    /// Compute and report the changes without applying them
    #[arg(long)]
    dry_run: bool,

    /// Parallel uploads and deletes
    #[arg(long, short = 'c')]
    concurrency: Option<usize>,

    /// Do not draw progress bars
    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Endpoint of an S3-compatible service
    #[arg(long, env = "S3_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Directory holding config.json
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log: Option<PathBuf>,
}

impl Cli {
    fn sync_config(&self, config_dir: &std::path::Path) -> SyncConfig {
        let mut config = SyncConfig::load(config_dir);
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        config.remove_deleted |= self.remove_deleted;
        config.dry_run |= self.dry_run;
        config.quiet |= self.quiet;
        config
    }

    fn remote_config(&self, config_dir: &std::path::Path) -> RemoteConfig {
        let mut remote = RemoteConfig::load(config_dir);
        remote.bucket = self.bucket.clone();
        if let Some(ref region) = self.region {
            remote.region = region.clone();
        }
        remote.prefix = self.prefix.clone().or(remote.prefix);
        remote.endpoint = self.endpoint.clone().or(remote.endpoint);
        remote.access_key = self.access_key.clone().or(remote.access_key);
        remote.secret_key = self.secret_key.clone().or(remote.secret_key);
        remote
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    init_logging(&LogConfig::load(&config_dir), cli.log.as_deref())
        .context("failed to initialize logging")?;

    let config = cli.sync_config(&config_dir);
    let remote = cli.remote_config(&config_dir);

    anyhow::ensure!(
        cli.source_dir.is_dir(),
        "source {} is not a directory",
        cli.source_dir.display()
    );
    if config.dry_run {
        tracing::info!("dry run: nothing will be uploaded or deleted");
    }

    let file_storage = Arc::new(LocalFileStorage::new(&cli.source_dir, config.dry_run));
    let object_storage = Arc::new(
        S3ObjectStorage::new(&remote, config.dry_run)
            .with_context(|| format!("failed to configure bucket {}", remote.bucket))?,
    );
    let engine = SyncEngine::new(
        Arc::new(ProgressUiFactory::new(config.quiet)),
        object_storage,
        file_storage,
        config.concurrency,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling sync");
            on_signal.cancel();
        }
    });

    engine
        .synchronize(&cancel, config.remove_deleted)
        .await
        .context("sync failed")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        SyncConfig {
            concurrency: 4,
            ..Default::default()
        }
        .save(dir.path())
        .unwrap();

        let cli = Cli::parse_from([
            "bucketsync",
            "./site",
            "backups",
            "--prefix",
            "www",
            "--remove-deleted",
            "--region",
            "eu-west-1",
        ]);
        let config = cli.sync_config(dir.path());
        assert_eq!(config.concurrency, 4);
        assert!(config.remove_deleted);
        assert!(!config.dry_run);

        let remote = cli.remote_config(dir.path());
        assert_eq!(remote.bucket, "backups");
        assert_eq!(remote.region, "eu-west-1");
        assert_eq!(remote.prefix.as_deref(), Some("www"));
    }
}
