mod artifact;
mod capture;
mod checkpoint;
mod codec;
mod extract;
mod llm;
mod memory;
mod normalize;
mod pipeline;
mod prompt;
mod record;
mod repair;
mod settings;
mod source;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::extract::Extractor;
use crate::llm::GroqClient;
use crate::memory::CategoryMemory;
use crate::prompt::PromptVariant;
use crate::settings::Settings;
use crate::source::SourceTable;

#[derive(Parser)]
#[command(
    name = "comp_enricher",
    about = "LLM enrichment of student-competition Instagram captions"
)]
struct Cli {
    /// Caption table to enrich (overrides ENRICH_INPUT_PATH)
    #[arg(long)]
    input: Option<PathBuf>,
    /// Enriched artifact (overrides ENRICH_OUTPUT_PATH)
    #[arg(long)]
    output: Option<PathBuf>,
    /// Checkpoint database (overrides ENRICH_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn a captured Instagram JSON dump into a caption table
    Capture {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Extract structured fields for every caption not yet processed
    Enrich {
        /// Max rows to process (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Retry rows stored as Unclassified
    Repair {
        /// Max rows to repair (default: all Unclassified)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Load an existing enriched CSV into the checkpoint log
    Import {
        #[arg(long)]
        artifact: PathBuf,
    },
    /// Rewrite the enriched CSV from the checkpoint log
    Export,
    /// Write the one-hot dashboard table from the enriched CSV
    Normalize {
        #[arg(long)]
        output: PathBuf,
    },
    /// Show checkpoint statistics
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load()?;
    if let Some(p) = cli.input {
        settings.input_path = p;
    }
    if let Some(p) = cli.output {
        settings.output_path = p;
    }
    if let Some(p) = cli.db {
        settings.db_path = p;
    }
    info!(
        input = ?settings.input_path,
        output = ?settings.output_path,
        db = ?settings.db_path,
        "Settings loaded"
    );

    let result = match cli.command {
        Commands::Capture { input, output } => capture::run(&input, &output).map(|_| ()),
        Commands::Enrich { limit } => {
            let conn = open_checkpoint(&settings)?;
            checkpoint::bootstrap(&conn, &settings.output_path)?;
            let source = read_source(&settings)?;
            let client = GroqClient::new(&settings.api_key()?, &settings.base_url, settings.timeout())?;
            let extractor = Extractor::new(
                &client,
                settings.model.as_str(),
                PromptVariant::Enrich,
                settings.enrich_policy(),
            );
            let mut memory = CategoryMemory::seed();
            let summary = pipeline::run_enrichment(
                &conn,
                &source,
                &extractor,
                &mut memory,
                &pipeline::EnrichOptions {
                    output_path: settings.output_path.clone(),
                    checkpoint_every: settings.checkpoint_every,
                    limit,
                },
            )?;
            summary.print();
            println!("Category memory holds {} labels.", memory.len());
            Ok(())
        }
        Commands::Repair { limit } => {
            let conn = open_checkpoint(&settings)?;
            checkpoint::bootstrap(&conn, &settings.output_path)?;
            let source = read_source(&settings)?;
            let client = GroqClient::new(&settings.api_key()?, &settings.base_url, settings.timeout())?;
            let extractor = Extractor::new(
                &client,
                settings.repair_model.as_str(),
                PromptVariant::Repair,
                settings.repair_policy(),
            );
            let summary = repair::run_repair(
                &conn,
                &source,
                &extractor,
                &mut CategoryMemory::seed(),
                &repair::RepairOptions {
                    output_path: settings.output_path.clone(),
                    checkpoint_every: settings.repair_checkpoint_every,
                    pacing: settings.repair_pacing(),
                    limit,
                },
            )?;
            summary.print();
            Ok(())
        }
        Commands::Import { artifact } => {
            let conn = open_checkpoint(&settings)?;
            let stats = checkpoint::import_artifact(&conn, &artifact)?;
            println!(
                "Imported {} rows ({} zombie rows, {} undecodable rows ignored).",
                stats.imported, stats.zombies, stats.undecodable
            );
            Ok(())
        }
        Commands::Export => {
            let conn = open_checkpoint(&settings)?;
            let state = checkpoint::load(&conn)?;
            if state.results.is_empty() {
                println!("Checkpoint is empty. Run 'enrich' or 'import' first.");
                return Ok(());
            }
            let source = read_source(&settings)?;
            let saved = artifact::persist(&settings.output_path, &source, &state.results)?;
            println!(
                "Wrote {} rows to {:?} ({} results without a source row).",
                saved.rows, settings.output_path, saved.orphaned
            );
            Ok(())
        }
        Commands::Normalize { output } => {
            normalize::run(&settings.output_path, &output).map(|_| ())
        }
        Commands::Stats => {
            let conn = open_checkpoint(&settings)?;
            let s = checkpoint::get_stats(&conn)?;
            println!("Stored rows: {}", s.total);
            for (category, n) in &s.by_category {
                println!("  {:<14} {}", category, n);
            }
            println!("By origin:");
            for (origin, n) in &s.by_origin {
                println!("  {:<14} {}", origin, n);
            }
            if !s.recent_runs.is_empty() {
                println!("\nRecent runs:");
                for run in &s.recent_runs {
                    println!(
                        "  #{:<4} {:<7} {} -> {} | {} processed, {} extracted, {} failed, {} skipped{}",
                        run.id,
                        run.pass,
                        run.started_at,
                        run.finished_at.as_deref().unwrap_or("(unfinished)"),
                        run.summary.processed,
                        run.summary.extracted,
                        run.summary.failed,
                        run.summary.skipped,
                        if run.summary.stopped { ", stopped" } else { "" }
                    );
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_checkpoint(settings: &Settings) -> anyhow::Result<rusqlite::Connection> {
    let conn = checkpoint::connect(&settings.db_path)?;
    checkpoint::init_schema(&conn)?;
    Ok(conn)
}

fn read_source(settings: &Settings) -> anyhow::Result<SourceTable> {
    SourceTable::read(
        &settings.input_path,
        &settings.text_column,
        settings.id_column.as_deref(),
    )
    .context("Failed to load captions; check ENRICH_INPUT_PATH and ENRICH_TEXT_COLUMN")
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
