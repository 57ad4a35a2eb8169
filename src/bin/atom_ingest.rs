use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atom_dataset_ingest::config::{Config, ConfigLoader, FeedRequest, ResolvedConfig};
use atom_dataset_ingest::domain::{FeedUrl, SchemaKind};
use atom_dataset_ingest::error::IngestError;
use atom_dataset_ingest::output::JsonOutput;
use atom_dataset_ingest::persister::AtomPersister;
use atom_dataset_ingest::retrieval::{
    FileRetriever, QueueRetriever, RetrievalWorker, SkipRetriever,
};
use atom_dataset_ingest::schema::SchemaRegistry;
use atom_dataset_ingest::store::JsonStore;
use atom_dataset_ingest::transport::HttpFeedSource;
use atom_dataset_ingest::walker::{self, FeedWalker};

#[derive(Parser)]
#[command(name = "atom-ingest")]
#[command(about = "Idempotent ingestion of Atom/RSS dataset feeds")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    store: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Ingest every unseen entry of the given or configured feeds")]
    Run(RunArgs),
    #[command(about = "Print the ingestion schemas, installing them if necessary")]
    Schemas(SchemasArgs),
}

#[derive(Args)]
struct RunArgs {
    feeds: Vec<FeedUrl>,

    #[arg(long)]
    no_download: bool,
}

#[derive(Args)]
struct SchemasArgs {
    #[arg(long)]
    kind: Option<SchemaKind>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::MissingConfig
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::InvalidFeedUrl(_)
        | IngestError::InvalidSchemaKind(_) => 2,
        IngestError::FeedHttp(_)
        | IngestError::FeedStatus { .. }
        | IngestError::FeedRead(_)
        | IngestError::FeedParse { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut resolved = load_config(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        resolved.store_path = store;
    }
    let store = Arc::new(JsonStore::open(resolved.store_path.clone())?);

    match cli.command {
        Commands::Run(args) => run_ingest(args, resolved, store),
        Commands::Schemas(args) => run_schemas(args, &store),
    }
}

/// An explicit `--config` must exist; the default file is optional.
fn load_config(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
    match ConfigLoader::resolve(path) {
        Err(IngestError::MissingConfig) => ConfigLoader::resolve_config(Config::default()),
        other => other,
    }
}

fn run_ingest(args: RunArgs, config: ResolvedConfig, store: Arc<JsonStore>) -> miette::Result<()> {
    let feeds = if args.feeds.is_empty() {
        config.feeds
    } else {
        args.feeds
            .into_iter()
            .map(|url| FeedRequest { url, name: None })
            .collect()
    };
    if feeds.is_empty() {
        return Err(IngestError::MissingConfig.into());
    }

    let source = HttpFeedSource::new(config.credentials.clone())?;
    let (retriever, worker): (Arc<dyn FileRetriever>, Option<RetrievalWorker>) =
        if args.no_download {
            (Arc::new(SkipRetriever), None)
        } else {
            let (queue, worker) =
                QueueRetriever::spawn(config.files_dir.clone(), config.credentials.clone())?;
            (Arc::new(queue), Some(worker))
        };

    let walkers = feeds.into_iter().map(|feed| {
        let name = feed.name.unwrap_or_else(|| feed.url.to_string());
        info!(feed = %name, "feed.ingest");
        let persister = AtomPersister::new(Arc::clone(&store), Arc::clone(&retriever));
        FeedWalker::new(feed.url, source.clone(), persister)
    });
    let (reports, first_error) = walker::ingest_all(walkers);

    // The worker only returns once every queue handle is gone.
    drop(retriever);
    if let Some(worker) = worker {
        let summary = worker.finish()?;
        info!(
            completed = summary.completed,
            failed = summary.failed,
            "retrieval.finished"
        );
    }

    JsonOutput::print_reports(&reports).into_diagnostic()?;
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_schemas(args: SchemasArgs, store: &JsonStore) -> miette::Result<()> {
    let schemas = match args.kind {
        Some(kind) => vec![SchemaRegistry::get_schema(store, kind)?],
        None => SchemaRegistry::get_schemas(store)?,
    };
    JsonOutput::print_schemas(&schemas).into_diagnostic()?;
    Ok(())
}
