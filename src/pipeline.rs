//! Enrichment driver: resume from the checkpoint log, extract every source
//! row not yet processed, and keep the artifact current.

use std::path::PathBuf;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::artifact;
use crate::checkpoint::{self, Origin, Pass, RunSummary};
use crate::extract::{Extractor, Outcome};
use crate::memory::CategoryMemory;
use crate::record::ExtractedFields;
use crate::source::SourceTable;

pub struct EnrichOptions {
    pub output_path: PathBuf,
    /// Rewrite the artifact after this many newly processed rows.
    pub checkpoint_every: usize,
    pub limit: Option<usize>,
}

pub(crate) fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

pub fn run_enrichment(
    conn: &Connection,
    source: &SourceTable,
    extractor: &Extractor<'_>,
    memory: &mut CategoryMemory,
    opts: &EnrichOptions,
) -> Result<RunSummary> {
    let state = checkpoint::load(conn)?;
    let skipped_cells = memory.rehydrate(
        checkpoint::category_cells(conn, false)?
            .iter()
            .map(String::as_str),
    );
    info!(
        categories = memory.len(),
        skipped_cells, "Rehydrated category memory"
    );

    let pending: Vec<_> = source
        .rows()
        .iter()
        .filter(|row| !state.processed.contains(&row.original_index))
        .take(opts.limit.unwrap_or(usize::MAX))
        .collect();
    let mut results = state.results;

    println!(
        "Resumed {} rows, processing {} of {} remaining...",
        results.len(),
        pending.len(),
        source.len().saturating_sub(state.processed.len())
    );

    let run_id = checkpoint::begin_run(conn, Pass::Enrich)?;
    let mut summary = RunSummary::default();
    let mut since_save = 0usize;
    let pb = progress_bar(pending.len());

    for row in pending {
        pb.inc(1);
        let (fields, attempts) = match extractor.extract(source.caption(row), memory) {
            Outcome::Extracted(e) => {
                summary.extracted += 1;
                (e.fields, e.attempts)
            }
            Outcome::Failed { attempts, reason } => {
                warn!(
                    original_index = row.original_index,
                    reason = %reason,
                    "extraction failed, storing fallback"
                );
                summary.failed += 1;
                (ExtractedFields::fallback(), attempts)
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
        };

        checkpoint::save_result(conn, row.original_index, &fields, Origin::Enrich, attempts)?;
        results.insert(row.original_index, fields);
        summary.processed += 1;
        since_save += 1;

        if since_save >= opts.checkpoint_every.max(1) {
            artifact::persist(&opts.output_path, source, &results)?;
            since_save = 0;
        }
    }
    pb.finish_and_clear();

    let saved = artifact::persist(&opts.output_path, source, &results)?;
    checkpoint::finish_run(conn, run_id, &summary)?;

    info!(
        rows = saved.rows,
        categories = memory.len(),
        "Saved {:?}",
        opts.output_path
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::checkpoint::memory_conn;
    use crate::extract::RetryPolicy;
    use crate::llm::mock::MockLlmClient;
    use crate::llm::LlmError;
    use crate::prompt::PromptVariant;
    use crate::record::{Audience, PostCategory};

    const SOURCE: &str = "date,clean_text\n\
        2025-03-01,Lomba Web Design untuk SMA gratis tim 1-3 orang\n\
        2025-03-02,Giveaway merchandise untuk followers setia\n\
        2025-03-03,short\n\
        2025-03-04,Lomba esai nasional untuk mahasiswa 2025\n\
        2025-03-05,Webinar karir data science bersama praktisi\n";

    const WEB: &str = r#"{"post_category": "COMPETITION", "comp_category": ["Web Development"],
        "target_audience": ["SMA"], "min_team_size": 1, "max_team_size": 3, "registration_fee": 0}"#;
    const GIVEAWAY: &str = r#"{"post_category": "GIVEAWAY", "comp_category": null, "target_audience": ["Umum"]}"#;
    const ESSAY: &str = r#"{"post_category": "COMPETITION", "comp_category": ["Essay Writing"],
        "target_audience": ["Mahasiswa"], "registration_fee": 35000}"#;
    const WEBINAR: &str = r#"{"post_category": "WEBINAR", "comp_category": [], "target_audience": ["Umum"]}"#;

    fn source() -> SourceTable {
        SourceTable::from_reader(SOURCE.as_bytes(), "clean_text", None).unwrap()
    }

    fn client() -> MockLlmClient {
        MockLlmClient::failing(LlmError::Http {
            status: 500,
            body: "unexpected caption".into(),
        })
        .when("Lomba Web Design", Ok(WEB))
        .when("Giveaway merchandise", Ok(GIVEAWAY))
        .when("Lomba esai", Ok(ESSAY))
        .when("Webinar karir", Ok(WEBINAR))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            rate_limit_base: Duration::ZERO,
            rate_limit_step: Duration::ZERO,
        }
    }

    fn opts(dir: &tempfile::TempDir, every: usize) -> EnrichOptions {
        EnrichOptions {
            output_path: dir.path().join("enriched.csv"),
            checkpoint_every: every,
            limit: None,
        }
    }

    #[test]
    fn end_to_end_fields_reach_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let conn = memory_conn();
        let client = client();
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let mut memory = CategoryMemory::seed();

        let summary = run_enrichment(&conn, &source(), &ex, &mut memory, &opts(&dir, 50)).unwrap();
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.extracted, 4);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.stopped);

        let scan = artifact::read_results(&dir.path().join("enriched.csv")).unwrap();
        let web = scan.results.iter().find(|r| r.original_index == 0).unwrap();
        assert_eq!(web.fields.post_category, PostCategory::Competition);
        assert_eq!(web.fields.comp_category, Some(vec!["Web Development".to_string()]));
        assert_eq!(web.fields.target_audience, vec![Audience::Sma]);
        assert_eq!((web.fields.min_team_size, web.fields.max_team_size), (Some(1), Some(3)));
        assert_eq!(web.fields.registration_fee, 0);

        let ids: Vec<i64> = scan.results.iter().map(|r| r.original_index).collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);
    }

    #[test]
    fn resume_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conn = memory_conn();
        let client = client();
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let path = dir.path().join("enriched.csv");

        run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &opts(&dir, 50)).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        let calls = client.calls();

        let summary =
            run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &opts(&dir, 50)).unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(client.calls(), calls);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn zombie_rows_in_old_artifact_are_reprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        // rows 0 and 1 done; rows 3 and 4 are blank placeholders from a bad merge
        std::fs::write(
            &path,
            "date,clean_text,post_category,comp_category,organizer,target_audience,min_team_size,max_team_size,registration_fee,original_index\n\
             2025-03-01,x,COMPETITION,['Web Development'],,['SMA'],1.0,3.0,0,0.0\n\
             2025-03-02,x,GIVEAWAY,,,['Umum'],,,0,1.0\n\
             2025-03-04,x,,,,,,,,\n\
             2025-03-05,x,,,,,,,,\n",
        )
        .unwrap();

        let conn = memory_conn();
        let stats = checkpoint::bootstrap(&conn, &path).unwrap().unwrap();
        assert_eq!((stats.imported, stats.zombies), (2, 2));
        assert_eq!(
            checkpoint::load(&conn).unwrap().processed,
            HashSet::from([0, 1])
        );

        let client = client();
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let summary =
            run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &opts(&dir, 50)).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(client.calls(), 2);

        let scan = artifact::read_results(&path).unwrap();
        assert_eq!(scan.zombies, 0);
        assert_eq!(scan.results.len(), 4);
    }

    #[test]
    fn failures_store_fallback_and_memory_covers_output() {
        let dir = tempfile::tempdir().unwrap();
        let conn = memory_conn();
        let client = MockLlmClient::failing(LlmError::Transport("reset".into()))
            .when("Lomba esai", Ok(ESSAY));
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let mut memory = CategoryMemory::seed();

        let summary = run_enrichment(&conn, &source(), &ex, &mut memory, &opts(&dir, 1)).unwrap();
        assert_eq!(summary.extracted, 1);
        assert_eq!(summary.failed, 3);

        let scan = artifact::read_results(&dir.path().join("enriched.csv")).unwrap();
        let unclassified = scan
            .results
            .iter()
            .filter(|r| r.fields.is_unclassified())
            .count();
        assert_eq!(unclassified, 3);
        for stored in &scan.results {
            for label in stored.fields.categories() {
                assert!(memory.contains(label), "{} missing from memory", label);
            }
        }
        assert!(memory.contains("Essay Writing"));
    }

    #[test]
    fn stop_saves_progress_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let conn = memory_conn();
        let client = client()
            .then(Ok(WEB))
            .then(Err(LlmError::QuotaExhausted("tokens per day".into())));
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());

        let summary =
            run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &opts(&dir, 50)).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.processed, 1);

        let scan = artifact::read_results(&dir.path().join("enriched.csv")).unwrap();
        assert_eq!(scan.results.len(), 1);
        assert_eq!(checkpoint::load(&conn).unwrap().processed, HashSet::from([0]));
    }

    #[test]
    fn artifact_never_outgrows_results() {
        let dir = tempfile::tempdir().unwrap();
        let conn = memory_conn();
        let client = client();
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let mut o = opts(&dir, 1);
        o.limit = Some(2);

        let summary = run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &o).unwrap();
        assert_eq!(summary.processed, 2);
        let scan = artifact::read_results(&o.output_path).unwrap();
        assert_eq!(scan.results.len(), 2);
        assert!(scan.results.iter().all(|r| r.original_index >= 0));
    }

    #[test]
    fn artifact_is_rewritten_every_n_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        let seen: Rc<RefCell<Vec<(usize, usize)>>> = Rc::default();
        let log = Rc::clone(&seen);
        let watched = path.clone();
        let client = client().inspect(move |call| {
            let rows = artifact::read_results(&watched)
                .map(|scan| scan.results.len())
                .unwrap_or(0);
            log.borrow_mut().push((call, rows));
        });
        let conn = memory_conn();
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());

        let summary =
            run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &opts(&dir, 2)).unwrap();
        assert_eq!(summary.processed, 4);
        // the short caption at row 2 never reaches the model
        assert_eq!(*seen.borrow(), vec![(1, 0), (2, 0), (3, 2), (4, 2)]);
        assert_eq!(artifact::read_results(&path).unwrap().results.len(), 4);
    }

    #[test]
    fn exhausted_rate_limit_stores_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let conn = memory_conn();
        let client = MockLlmClient::failing(LlmError::RateLimited { retry_after: None });
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let mut o = opts(&dir, 50);
        o.limit = Some(1);

        let summary = run_enrichment(&conn, &source(), &ex, &mut CategoryMemory::seed(), &o).unwrap();
        assert_eq!((summary.processed, summary.failed), (1, 1));
        assert!(!summary.stopped);
        assert_eq!(client.calls(), 3);

        let state = checkpoint::load(&conn).unwrap();
        assert_eq!(state.results[&0], ExtractedFields::fallback());
        let scan = artifact::read_results(&o.output_path).unwrap();
        assert_eq!(scan.results.len(), 1);
        assert!(scan.results[0].fields.is_unclassified());
    }

    #[test]
    fn imported_labels_are_cleaned_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        std::fs::write(
            &path,
            "date,clean_text,post_category,comp_category,organizer,target_audience,min_team_size,max_team_size,registration_fee,original_index\n\
             2025-03-01,x,COMPETITION,\"[' Robotics ', 'None', 'nan']\",,['SMA'],1.0,3.0,0,0.0\n",
        )
        .unwrap();

        let conn = memory_conn();
        checkpoint::bootstrap(&conn, &path).unwrap();
        let client = client();
        let ex = Extractor::new(&client, "m", PromptVariant::Enrich, policy());
        let mut memory = CategoryMemory::seed();
        run_enrichment(&conn, &source(), &ex, &mut memory, &opts(&dir, 50)).unwrap();

        let scan = artifact::read_results(&path).unwrap();
        let robotics = scan.results.iter().find(|r| r.original_index == 0).unwrap();
        assert_eq!(robotics.fields.comp_category, Some(vec!["Robotics".to_string()]));
        for stored in &scan.results {
            for label in stored.fields.categories() {
                assert!(memory.contains(label), "{} missing from memory", label);
            }
        }
        assert!(!std::fs::read_to_string(&path).unwrap().contains("None"));
    }
}
