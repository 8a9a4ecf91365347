//! ragcore: ingest documents and ask questions against them.

mod commands;
mod files;

use std::path::PathBuf;

use clap::Parser;
use ragcore_retrieval::{DEFAULT_SCOPE, RagConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Retrieval-augmented question answering over local documents
#[derive(Parser, Debug)]
#[command(name = "ragcore", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for records and the saved index
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Chunk, embed, and store files or directories
    Ingest {
        /// Files or directories to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Scope to store the documents under
        #[arg(short, long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },
    /// Ask a question
    Query {
        question: String,

        #[arg(short, long, default_value = DEFAULT_SCOPE)]
        scope: String,

        /// Maximum number of sources to retrieve
        #[arg(short = 'k', long)]
        max_results: Option<usize>,

        /// Print tokens as they are generated
        #[arg(long)]
        stream: bool,

        /// Print only the retrieved sources, without generating an answer
        #[arg(long, conflicts_with = "stream")]
        retrieve_only: bool,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show index, record, cache, and pool statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the index from stored records
    Rebuild {
        /// Only rebuild this scope
        #[arg(short, long)]
        scope: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<RagConfig> {
    let mut config = match &cli.config {
        Some(path) => RagConfig::load(path)?,
        None => RagConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Ingest { paths, scope } => commands::ingest(config, &paths, &scope).await,
        Command::Query {
            question,
            scope,
            max_results,
            stream,
            retrieve_only,
            json,
        } => {
            let request = commands::QueryRequest {
                question,
                scope,
                max_results,
                stream,
                retrieve_only,
                json,
            };
            commands::query(config, request).await
        }
        Command::Stats { json } => commands::stats(config, json),
        Command::Rebuild { scope } => commands::rebuild(config, scope.as_deref()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_query() {
        let cli = Cli::parse_from([
            "ragcore",
            "--data-dir",
            "/tmp/rag",
            "query",
            "what is tokio?",
            "-k",
            "3",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rag")));
        match cli.command {
            Command::Query {
                question,
                scope,
                max_results,
                stream,
                ..
            } => {
                assert_eq!(question, "what is tokio?");
                assert_eq!(scope, DEFAULT_SCOPE);
                assert_eq!(max_results, Some(3));
                assert!(!stream);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_stream_conflicts_with_retrieve_only() {
        let parsed =
            Cli::try_parse_from(["ragcore", "query", "q", "--stream", "--retrieve-only"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_load_config_applies_data_dir() {
        let cli = Cli::parse_from(["ragcore", "--data-dir", "/tmp/rag", "stats"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.records_path(), PathBuf::from("/tmp/rag/records.json"));
    }
}
