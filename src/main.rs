//! upload-kit -- upload files and mint presigned URLs for S3, GCS and Azure.
//!
//! Provider, bucket and credentials default from the YAML config; every one
//! of them can be overridden per invocation.  Results are printed to stdout
//! as JSON, logs go to stderr.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use upload_kit::config::{load_config, Config, LoggingConfig};
use upload_kit::{CloudProvider, PresignOptions, UploadData, UploadManager, UploadOptions};

const DEFAULT_CONFIG_PATH: &str = "upload-kit.yaml";

/// Command-line arguments for upload-kit.
#[derive(Parser, Debug)]
#[command(
    name = "upload-kit",
    version,
    about = "Upload files to AWS S3, Google Cloud Storage or Azure Blob Storage"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file.
    Upload {
        /// File to upload.
        file: PathBuf,

        /// Destination object key.
        #[arg(short, long)]
        key: String,

        /// Bucket or container; defaults to `upload.default_bucket`.
        #[arg(short, long)]
        bucket: Option<String>,

        /// Content type; guessed from the file extension when omitted.
        #[arg(long)]
        mime_type: Option<String>,

        /// aws, gcp or azure; defaults to `upload.default_provider`.
        #[arg(short, long)]
        provider: Option<CloudProvider>,

        /// Fail on an empty file.
        #[arg(long)]
        required: bool,
    },

    /// Print a presigned upload URL.
    Presign {
        /// Destination object key.
        #[arg(short, long)]
        key: String,

        /// Bucket or container; defaults to `upload.default_bucket`.
        #[arg(short, long)]
        bucket: Option<String>,

        /// Content type bound into the signature.
        #[arg(long)]
        mime_type: Option<String>,

        /// aws, gcp or azure; defaults to `upload.default_provider`.
        #[arg(short, long)]
        provider: Option<CloudProvider>,

        /// URL lifetime in seconds.
        #[arg(short, long)]
        expires_in: Option<u64>,
    },
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

/// Load the config file; a missing default file means "no defaults".
fn read_config(path: &str) -> anyhow::Result<Config> {
    if path == DEFAULT_CONFIG_PATH && !Path::new(path).exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

/// Open `path` as upload data. Empty files become an empty buffer so
/// `--required` can reject them.
async fn open_upload(path: &Path) -> anyhow::Result<UploadData> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(UploadData::from(Vec::new()));
    }
    debug!("Streaming {} ({} bytes)", path.display(), len);
    Ok(UploadData::from_stream(tokio_util::io::ReaderStream::new(file)))
}

fn guess_mime_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first_raw().map(str::to_string)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = read_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    upload_kit::metrics::describe_metrics();

    let manager = UploadManager::new();
    manager.configure(config.global_upload_config());
    let default_bucket = config.upload.default_bucket.clone();

    match cli.command {
        Command::Upload {
            file,
            key,
            bucket,
            mime_type,
            provider,
            required,
        } => {
            let mut options = UploadOptions::new(key).required(required);
            options.bucket = bucket.or(default_bucket);
            options.mime_type = mime_type.or_else(|| guess_mime_type(&file));
            options.provider = provider;

            let data = open_upload(&file).await?;
            let result = manager.upload_file(data, options).await?;
            info!("Uploaded {} to {}", file.display(), result.url);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Presign {
            key,
            bucket,
            mime_type,
            provider,
            expires_in,
        } => {
            let mut options = PresignOptions::new(key);
            options.bucket = bucket.or(default_bucket);
            options.mime_type = mime_type;
            options.provider = provider;
            options.expires_in = expires_in;

            let presigned = manager.generate_presigned_url(options).await?;
            println!("{}", serde_json::to_string_pretty(&presigned)?);
        }
    }

    Ok(())
}
