use kbsearch::cli::{Cli, Commands, ConfigAction};
use kbsearch::config::Config;
use kbsearch::error::{KbError, Result};
use kbsearch::ingest::DirectorySource;
use kbsearch::pipeline::{format_answer, Pipeline};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Handle commands
    match cli.command {
        Commands::Build { dir, fresh, json } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_build(&config, &dir, fresh, json).await?;
        }
        Commands::Search {
            query,
            top_k,
            no_rerank,
            json,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_search(&config, &query, top_k, !no_rerank, json).await?;
        }
        Commands::Stats => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_stats(&config).await?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "kbsearch=debug" } else { "kbsearch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn cmd_build(config: &Config, dir: &Path, fresh: bool, json: bool) -> Result<()> {
    if fresh {
        remove_indexes(config)?;
    }

    let pipeline = Pipeline::from_config(config)?;
    let source = DirectorySource::new(dir);
    let report = pipeline.build_index(&source).await?;

    if json {
        println!("{}", to_json(&report, "Failed to serialize build report")?);
        return Ok(());
    }

    println!("✓ Index built from {}", dir.display());
    println!("  Documents: {} seen, {} indexed", report.documents_seen, report.documents_indexed);
    println!("  Chunks:    {} produced, {} replaced", report.chunks_produced, report.chunks_replaced);
    println!(
        "  Stored:    {} keyword, {} vector",
        report.sparse_indexed, report.dense_indexed
    );

    if report.has_failures() {
        println!("\n⚠ {} document(s) failed:", report.failures.len());
        for failure in &report.failures {
            println!("  - {}: {}", failure.source_id, failure.reason);
        }
    }

    Ok(())
}

async fn cmd_search(
    config: &Config,
    query: &str,
    top_k: usize,
    use_reranking: bool,
    json: bool,
) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling search");
            on_interrupt.cancel();
        }
    });

    let answer = pipeline
        .search_with_cancel(query, top_k, use_reranking, &cancel)
        .await?;

    if json {
        println!("{}", to_json(&answer, "Failed to serialize answer")?);
    } else {
        print!("{}", format_answer(&answer));
    }

    Ok(())
}

async fn cmd_stats(config: &Config) -> Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let stats = pipeline.stats().await?;

    println!("Data directory: {}", config.storage.resolved_data_dir().display());
    println!("  Keyword index: {} chunks", stats.sparse_chunks);
    println!("  Vector index:  {} chunks", stats.dense_chunks);
    println!(
        "  Embedding:     {:?} / {} ({} dims)",
        config.embedding.provider, config.embedding.model, config.embedding.dimension
    );
    println!("  Reranking:     {}", pipeline.rerank_mode());

    if stats.sparse_chunks != stats.dense_chunks {
        println!("\n⚠ Index counts differ; run 'kbsearch build --fresh <DIR>' to rebuild");
    }

    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, profile)?;
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            if !config.profiles.is_empty() {
                let mut names: Vec<&String> = config.profiles.keys().collect();
                names.sort();
                let names: Vec<&str> = names.into_iter().map(|n| n.as_str()).collect();
                println!("  Profiles: {}", names.join(", "));
            }
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            let mut config = Config::default();
            config.touch();
            config.save(&path)?;

            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'kbsearch config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        kbsearch::config::ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}

/// Delete the keyword index directory and vector snapshot
fn remove_indexes(config: &Config) -> Result<()> {
    let sparse = config.storage.sparse_dir();
    if sparse.is_dir() {
        tracing::info!("Removing keyword index at {}", sparse.display());
        std::fs::remove_dir_all(&sparse).map_err(|e| KbError::Io {
            source: e,
            context: format!("Failed to remove keyword index: {:?}", sparse),
        })?;
    }

    let dense = config.storage.dense_snapshot();
    if dense.is_file() {
        tracing::info!("Removing vector snapshot at {}", dense.display());
        std::fs::remove_file(&dense).map_err(|e| KbError::Io {
            source: e,
            context: format!("Failed to remove vector snapshot: {:?}", dense),
        })?;
    }

    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T, context: &str) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| KbError::Json {
        source: e,
        context: context.to_string(),
    })
}
