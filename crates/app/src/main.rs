use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use docvault_core::{
    run_server, AppState, DelegatedCredential, DriveConfig, DriveStore, FileOutcome, GeminiConfig,
    GeminiLabeler, InMemoryObjectStore, IngestionPipeline, LabelStrategy, Labeler, LabelerOptions,
    MetadataIndex, ObjectFilter, ObjectStore, PipelineOptions, PredictConfig, PredictLabeler,
    QueryResolver, ServerOptions, SqliteIndex, StorageConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    /// Google Drive v3 over REST.
    Drive,
    /// Process memory; everything is lost on exit.
    Memory,
}

#[derive(Parser)]
#[command(name = "docvault", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// API key for the managed generateContent labeler. Tried first when set.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-1.5-flash")]
    gemini_model: String,

    #[arg(
        long,
        env = "GEMINI_ENDPOINT",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    gemini_endpoint: String,

    /// Raw prediction endpoint used after the managed labeler.
    #[arg(long, env = "PREDICT_ENDPOINT")]
    predict_endpoint: Option<String>,

    #[arg(long, env = "PREDICT_API_KEY", hide_env_values = true)]
    predict_api_key: Option<String>,

    /// Label used when every labeling strategy fails. Without it the file is reported as failed.
    #[arg(long, env = "DOCVAULT_FALLBACK_LABEL")]
    fallback_label: Option<String>,

    /// Per-call labeling timeout in seconds.
    #[arg(long, env = "DOCVAULT_LABEL_TIMEOUT_SECS", default_value = "30")]
    label_timeout_secs: u64,

    #[arg(long, env = "DOCVAULT_STORE", value_enum, default_value = "drive")]
    store: StoreKind,

    #[arg(long, env = "DRIVE_API_BASE", default_value = "https://www.googleapis.com")]
    drive_api_base: String,

    #[arg(long, env = "DRIVE_UPLOAD_BASE", default_value = "https://www.googleapis.com")]
    drive_upload_base: String,

    /// Remote folder every document is filed under.
    #[arg(long, env = "DOCVAULT_CONTAINER", default_value = "DocVault")]
    container: String,

    /// Directory for transient upload copies. Defaults to the system temp dir.
    #[arg(long, env = "DOCVAULT_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,

    #[arg(long, env = "DOCVAULT_INDEX", default_value = "docvault.db")]
    index_path: PathBuf,

    /// Whole-batch timeout in seconds; 0 disables it.
    #[arg(long, env = "DOCVAULT_REQUEST_TIMEOUT_SECS", default_value = "120")]
    request_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the upload/query HTTP API.
    Serve {
        #[arg(long, env = "DOCVAULT_BIND", default_value = "127.0.0.1:3000")]
        bind: String,

        #[arg(long, env = "DOCVAULT_MAX_UPLOAD_BYTES", default_value = "52428800")]
        max_upload_bytes: usize,
    },
    /// Label and store every file under a folder.
    Ingest {
        #[arg(long)]
        folder: PathBuf,

        /// Delegated storage credential (bearer token).
        #[arg(long, env = "DOCVAULT_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Resolve a free-text request to a stored document.
    Query {
        #[arg(long)]
        text: String,

        #[arg(long, env = "DOCVAULT_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// List stored objects whose name contains a label fragment.
    List {
        #[arg(long, default_value = "")]
        label: String,

        #[arg(long, env = "DOCVAULT_TOKEN", hide_env_values = true)]
        token: String,
    },
}

fn build_labeler(cli: &Cli) -> anyhow::Result<Labeler> {
    let timeout = Duration::from_secs(cli.label_timeout_secs);
    let mut strategies: Vec<Box<dyn LabelStrategy>> = Vec::new();

    if let Some(api_key) = cli.gemini_api_key.as_deref().filter(|key| !key.trim().is_empty()) {
        strategies.push(Box::new(GeminiLabeler::new(GeminiConfig {
            endpoint: cli.gemini_endpoint.clone(),
            model: cli.gemini_model.clone(),
            api_key: api_key.to_string(),
            timeout,
        })?));
    }

    if let Some(endpoint) = cli.predict_endpoint.as_deref().filter(|url| !url.trim().is_empty()) {
        strategies.push(Box::new(PredictLabeler::new(PredictConfig {
            endpoint: endpoint.to_string(),
            api_key: cli.predict_api_key.clone(),
            timeout,
        })?));
    }

    if strategies.is_empty() {
        warn!("no labeling backend configured, set GEMINI_API_KEY or PREDICT_ENDPOINT");
    }

    Ok(Labeler::new(
        strategies,
        LabelerOptions {
            fallback_label: cli.fallback_label.clone(),
            ..LabelerOptions::default()
        },
    ))
}

fn build_store(cli: &Cli) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match cli.store {
        StoreKind::Drive => Arc::new(DriveStore::new(DriveConfig {
            api_base: cli.drive_api_base.clone(),
            upload_base: cli.drive_upload_base.clone(),
            ..DriveConfig::default()
        })?),
        StoreKind::Memory => Arc::new(InMemoryObjectStore::new()),
    };
    Ok(store)
}

fn pipeline_options(cli: &Cli) -> PipelineOptions {
    let defaults = PipelineOptions::default();
    PipelineOptions {
        container_name: cli.container.clone(),
        upload_dir: cli.upload_dir.clone().unwrap_or(defaults.upload_dir),
        request_timeout: (cli.request_timeout_secs > 0)
            .then(|| Duration::from_secs(cli.request_timeout_secs)),
    }
}

fn credential(token: &str) -> anyhow::Result<DelegatedCredential> {
    DelegatedCredential::new(token).context("storage token is empty")
}

fn print_outcome(outcome: &FileOutcome) {
    match outcome {
        FileOutcome::Stored {
            original_file_name,
            label,
            storage_ref,
            warning,
        } => {
            println!("{original_file_name} -> {label} ({})", storage_ref.web_link);
            if let Some(warning) = warning {
                println!("  warning: {warning}");
            }
        }
        FileOutcome::Failed {
            original_file_name,
            error,
        } => println!("{original_file_name} failed: {error}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let labeler = Arc::new(build_labeler(&cli)?);
    let index: Arc<dyn MetadataIndex> = Arc::new(
        SqliteIndex::connect(&cli.index_path)
            .await
            .with_context(|| format!("opening index {}", cli.index_path.display()))?,
    );
    let storage = Arc::new(StorageConnector::new(build_store(&cli)?));
    let options = pipeline_options(&cli);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        labelers = ?labeler.strategy_names(),
        store = storage.backend(),
        "docvault boot"
    );

    match &cli.command {
        Command::Serve {
            bind,
            max_upload_bytes,
        } => {
            let state = AppState {
                pipeline: IngestionPipeline::new(
                    labeler.clone(),
                    storage.clone(),
                    index.clone(),
                    options,
                ),
                resolver: QueryResolver::new(labeler, index.clone()),
                storage,
                index,
            };
            let server = ServerOptions {
                bind: bind.clone(),
                max_upload_bytes: *max_upload_bytes,
            };
            run_server(&server, state).await?;
        }
        Command::Ingest { folder, token } => {
            let session = storage.open_session(&credential(token)?).await?;
            let pipeline = IngestionPipeline::new(labeler, storage, index, options);
            let report = pipeline.ingest_folder(&session, folder).await?;

            for outcome in &report.results {
                print_outcome(outcome);
            }
            println!(
                "{} stored, {} failed at {}",
                report.stored_count(),
                report.failed_count(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Query { text, token } => {
            let session = storage.open_session(&credential(token)?).await?;
            let resolution = QueryResolver::new(labeler, index)
                .resolve(&session.owner, text)
                .await?;
            println!("label: {}", resolution.label);
            match resolution.storage_ref {
                Some(reference) => {
                    println!("found: {}", reference.web_link);
                    println!("  object_id={}", reference.object_id);
                }
                None => println!("not found"),
            }
        }
        Command::List { label, token } => {
            let session = storage.open_session(&credential(token)?).await?;
            let container = storage
                .get_or_create_container(&session, &options.container_name)
                .await?;
            let filter = ObjectFilter {
                name_contains: Some(label.clone()).filter(|label| !label.is_empty()),
                mime_type: None,
            };

            let objects = storage
                .list_objects(&session.credential, &container, &filter)
                .await?;
            for object in &objects {
                println!(
                    "{} [{}] {}",
                    object.name, object.mime_type, object.reference.web_link
                );
            }
            println!("{} object(s) in {}", objects.len(), options.container_name);
        }
    }

    Ok(())
}
