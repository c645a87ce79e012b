//! Second sweep over rows stored as `Unclassified`.
//!
//! Unlike enrichment, a row that still fails here is left untouched so the
//! next repair run can pick it up again.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::artifact;
use crate::checkpoint::{self, Origin, Pass, RunSummary};
use crate::extract::{Extractor, Outcome};
use crate::memory::CategoryMemory;
use crate::pipeline::progress_bar;
use crate::source::SourceTable;

pub struct RepairOptions {
    pub output_path: PathBuf,
    pub checkpoint_every: usize,
    /// Sleep after every model call, whatever its outcome.
    pub pacing: Duration,
    pub limit: Option<usize>,
}

pub fn run_repair(
    conn: &Connection,
    source: &SourceTable,
    extractor: &Extractor<'_>,
    memory: &mut CategoryMemory,
    opts: &RepairOptions,
) -> Result<RunSummary> {
    let skipped_cells = memory.rehydrate(
        checkpoint::category_cells(conn, true)?
            .iter()
            .map(String::as_str),
    );
    info!(
        categories = memory.len(),
        skipped_cells, "Relearned categories from classified rows"
    );

    let queue = checkpoint::fetch_unclassified(conn, opts.limit)?;
    if queue.is_empty() {
        println!("Nothing to repair.");
        return Ok(RunSummary::default());
    }
    println!("Repairing {} Unclassified rows...", queue.len());

    let mut results = checkpoint::load(conn)?.results;
    let run_id = checkpoint::begin_run(conn, Pass::Repair)?;
    let mut summary = RunSummary::default();
    let mut since_save = 0usize;
    let pb = progress_bar(queue.len());

    for stored in queue {
        pb.inc(1);
        let Some(row) = source.get(stored.original_index) else {
            warn!(
                original_index = stored.original_index,
                "no source row for stored result, skipping"
            );
            summary.skipped += 1;
            continue;
        };

        let outcome = extractor.extract(source.caption(row), memory);
        match outcome {
            Outcome::Extracted(e) => {
                let mut fields = stored.fields;
                e.reply.apply_to(&mut fields);
                checkpoint::save_result(conn, stored.original_index, &fields, Origin::Repair, e.attempts)?;
                results.insert(stored.original_index, fields);
                summary.extracted += 1;
                summary.processed += 1;
                since_save += 1;
            }
            Outcome::Failed { reason, .. } => {
                warn!(
                    original_index = stored.original_index,
                    reason = %reason,
                    "repair failed, leaving row as is"
                );
                summary.failed += 1;
            }
            Outcome::Rejected => {
                summary.skipped += 1;
                continue;
            }
            Outcome::Stop(reason) => {
                pb.suspend(|| println!("\nDaily limit reached ({}). Saving and stopping.", reason));
                summary.stopped = true;
                break;
            }
        }

        if since_save >= opts.checkpoint_every.max(1) {
            artifact::persist(&opts.output_path, source, &results)?;
            since_save = 0;
        }
        thread::sleep(opts.pacing);
    }
    pb.finish_and_clear();

    artifact::persist(&opts.output_path, source, &results)?;
    checkpoint::finish_run(conn, run_id, &summary)?;
    Ok(summary)
}
