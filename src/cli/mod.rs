//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "kbsearch",
    version,
    author = "neur0map",
    about = "Hybrid keyword + semantic search over policy documents",
    long_about = "kbsearch chunks a directory of policy documents, indexes the chunks in a BM25 \
                  keyword index and an HNSW vector index, and answers questions by fusing both \
                  rankings and reranking the shortlist."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/kbsearch/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply (e.g., "offline", "precise")
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chunk and index every document in a directory
    Build {
        /// Directory of .md, .markdown and .txt files
        dir: PathBuf,

        /// Delete existing indexes before building
        #[arg(long)]
        fresh: bool,

        /// Print the build report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search the indexed documents
    Search {
        /// Search query text
        query: String,

        /// Number of results to return
        #[arg(short = 'k', long = "top-k", default_value = "5")]
        top_k: usize,

        /// Return the fused order without reranking
        #[arg(long)]
        no_rerank: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics
    Stats,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_search_args() {
        let cli = Cli::try_parse_from([
            "kbsearch",
            "--profile",
            "offline",
            "search",
            "remote work policy",
            "-k",
            "3",
            "--no-rerank",
        ])
        .unwrap();

        assert_eq!(cli.profile.as_deref(), Some("offline"));
        match cli.command {
            Commands::Search {
                query,
                top_k,
                no_rerank,
                json,
            } => {
                assert_eq!(query, "remote work policy");
                assert_eq!(top_k, 3);
                assert!(no_rerank);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_build_args() {
        let cli = Cli::try_parse_from(["kbsearch", "build", "./policies", "--fresh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Build { fresh: true, json: false, .. }
        ));
    }
}
