//! Checkpoint log: the durable record of which source rows have been
//! extracted and what came out. The enriched CSV is regenerated from this
//! log; the log itself is never inferred from the CSV except on first start.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use tracing::{debug, info, warn};

use crate::artifact;
use crate::codec;
use crate::record::{clean_labels, Audience, ExtractedFields, PostCategory, StoredResult};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS extractions (
            original_index   INTEGER PRIMARY KEY,
            post_category    TEXT NOT NULL,
            comp_category    TEXT,
            organizer        TEXT,
            target_audience  TEXT NOT NULL,
            min_team_size    INTEGER,
            max_team_size    INTEGER,
            registration_fee INTEGER NOT NULL DEFAULT 0,
            origin           TEXT NOT NULL CHECK(origin IN ('enrich','repair','import')),
            attempts         INTEGER NOT NULL DEFAULT 0,
            updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_extractions_category ON extractions(post_category);

        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            pass        TEXT NOT NULL CHECK(pass IN ('enrich','repair')),
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT,
            processed   INTEGER NOT NULL DEFAULT 0,
            extracted   INTEGER NOT NULL DEFAULT 0,
            failed      INTEGER NOT NULL DEFAULT 0,
            skipped     INTEGER NOT NULL DEFAULT 0,
            stopped     BOOLEAN NOT NULL DEFAULT 0
        );
        ",
    )?;
    Ok(())
}

/// Where a stored result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Enrich,
    Repair,
    Import,
}

impl Origin {
    fn as_str(&self) -> &'static str {
        match self {
            Origin::Enrich => "enrich",
            Origin::Repair => "repair",
            Origin::Import => "import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Enrich,
    Repair,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Enrich => "enrich",
            Pass::Repair => "repair",
        }
    }
}

/// Counts reported at the end of a pass and kept in the `runs` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub extracted: usize,
    /// Rows that exhausted their attempts (fallback stored, or left as is).
    pub failed: usize,
    pub skipped: usize,
    pub stopped: bool,
}

impl RunSummary {
    pub fn print(&self) {
        println!(
            "Processed {} rows ({} extracted, {} failed, {} skipped){}.",
            self.processed,
            self.extracted,
            self.failed,
            self.skipped,
            if self.stopped { ", stopped early" } else { "" }
        );
    }
}

/// Resume point reconstructed from the log.
#[derive(Debug, Default)]
pub struct ResumeState {
    pub processed: HashSet<i64>,
    pub results: BTreeMap<i64, ExtractedFields>,
    /// Stored rows that could not be decoded and are treated as not processed.
    pub discarded: usize,
}

const SELECT_RESULTS: &str = "SELECT original_index, post_category, comp_category, organizer,
        target_audience, min_team_size, max_team_size, registration_fee
    FROM extractions";

pub fn load(conn: &Connection) -> Result<ResumeState> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY original_index", SELECT_RESULTS))?;
    let rows = stmt
        .query_map([], |row| Ok(decode_row(row)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut state = ResumeState::default();
    for decoded in rows {
        match decoded? {
            Some(stored) => {
                state.processed.insert(stored.original_index);
                state.results.insert(stored.original_index, stored.fields);
            }
            None => state.discarded += 1,
        }
    }

    info!(
        valid = state.processed.len(),
        discarded = state.discarded,
        "Loaded checkpoint"
    );
    Ok(state)
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<Option<StoredResult>> {
    let original_index: i64 = row.get(0)?;
    let post_category: String = row.get(1)?;
    let comp_category: Option<String> = row.get(2)?;
    let organizer: Option<String> = row.get(3)?;
    let target_audience: String = row.get(4)?;
    let min_team_size: Option<i64> = row.get(5)?;
    let max_team_size: Option<i64> = row.get(6)?;
    let registration_fee: i64 = row.get(7)?;

    let Some(post_category) = PostCategory::parse_stored(&post_category) else {
        debug!(original_index, post_category = %post_category, "undecodable post_category in checkpoint");
        return Ok(None);
    };

    let list = |cell: Option<&str>| cell.and_then(|c| codec::decode_list(c).ok().flatten());
    let size = |n: Option<i64>| n.and_then(|n| u32::try_from(n).ok()).filter(|n| *n > 0);

    Ok(Some(StoredResult {
        original_index,
        fields: ExtractedFields {
            post_category,
            comp_category: list(comp_category.as_deref()).map(clean_labels),
            organizer,
            target_audience: list(Some(&target_audience))
                .unwrap_or_default()
                .iter()
                .filter_map(|a| Audience::parse(a))
                .collect(),
            min_team_size: size(min_team_size),
            max_team_size: size(max_team_size),
            registration_fee: u64::try_from(registration_fee).unwrap_or(0),
        },
    }))
}

pub fn is_empty(conn: &Connection) -> Result<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM extractions", [], |r| r.get(0))?;
    Ok(n == 0)
}

/// Insert or replace the result for one row identity.
pub fn save_result(
    conn: &Connection,
    original_index: i64,
    fields: &ExtractedFields,
    origin: Origin,
    attempts: u32,
) -> Result<()> {
    conn.execute(
        "INSERT INTO extractions (
            original_index, post_category, comp_category, organizer, target_audience,
            min_team_size, max_team_size, registration_fee, origin, attempts
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(original_index) DO UPDATE SET
            post_category    = excluded.post_category,
            comp_category    = excluded.comp_category,
            organizer        = excluded.organizer,
            target_audience  = excluded.target_audience,
            min_team_size    = excluded.min_team_size,
            max_team_size    = excluded.max_team_size,
            registration_fee = excluded.registration_fee,
            origin           = excluded.origin,
            attempts         = excluded.attempts,
            updated_at       = datetime('now')",
        params![
            original_index,
            fields.post_category.as_str(),
            fields.comp_category.as_deref().map(codec::encode_list),
            fields.organizer,
            codec::encode_list(&fields.audience_labels()),
            fields.min_team_size,
            fields.max_team_size,
            i64::try_from(fields.registration_fee).unwrap_or(i64::MAX),
            origin.as_str(),
            attempts,
        ],
    )?;
    Ok(())
}

/// Raw `comp_category` cells, optionally leaving out `Unclassified` rows.
pub fn category_cells(conn: &Connection, skip_unclassified: bool) -> Result<Vec<String>> {
    let sql = if skip_unclassified {
        "SELECT comp_category FROM extractions
         WHERE comp_category IS NOT NULL AND post_category != 'Unclassified'"
    } else {
        "SELECT comp_category FROM extractions WHERE comp_category IS NOT NULL"
    };
    let mut stmt = conn.prepare(sql)?;
    let cells = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(cells)
}

/// The repair queue, in identity order.
pub fn fetch_unclassified(conn: &Connection, limit: Option<usize>) -> Result<Vec<StoredResult>> {
    let sql = format!(
        "{} WHERE post_category = 'Unclassified' ORDER BY original_index{}",
        SELECT_RESULTS,
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| decode_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().flatten().collect())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    pub zombies: usize,
    pub undecodable: usize,
}

/// Load a previously written enriched CSV into the log. Rows without an
/// `original_index` are zombie rows left by a faulty merge and are dropped.
pub fn import_artifact(conn: &Connection, path: &Path) -> Result<ImportStats> {
    let scan = artifact::read_results(path)?;
    let tx = conn.unchecked_transaction()?;
    for stored in &scan.results {
        save_result(&tx, stored.original_index, &stored.fields, Origin::Import, 0)?;
    }
    tx.commit()?;

    let stats = ImportStats {
        imported: scan.results.len(),
        zombies: scan.zombies,
        undecodable: scan.undecodable,
    };
    info!(
        imported = stats.imported,
        zombies = stats.zombies,
        undecodable = stats.undecodable,
        "Imported existing artifact {:?}",
        path
    );
    Ok(stats)
}

/// Seed an empty log from an artifact left by an earlier run, if any.
pub fn bootstrap(conn: &Connection, artifact_path: &Path) -> Result<Option<ImportStats>> {
    if !is_empty(conn)? || !artifact_path.exists() {
        return Ok(None);
    }
    println!("Found existing output file, checking for valid progress...");
    match import_artifact(conn, artifact_path) {
        Ok(stats) => {
            println!(
                "  Resumed {} valid rows (ignored {} empty/null rows).",
                stats.imported,
                stats.zombies + stats.undecodable
            );
            Ok(Some(stats))
        }
        Err(e) => {
            warn!("Could not read existing artifact: {:#}. Starting fresh.", e);
            Ok(None)
        }
    }
}

pub fn begin_run(conn: &Connection, pass: Pass) -> Result<i64> {
    conn.execute("INSERT INTO runs (pass) VALUES (?1)", params![pass.as_str()])?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(conn: &Connection, run_id: i64, summary: &RunSummary) -> Result<()> {
    conn.execute(
        "UPDATE runs SET finished_at = datetime('now'), processed = ?2, extracted = ?3,
            failed = ?4, skipped = ?5, stopped = ?6
         WHERE id = ?1",
        params![
            run_id,
            summary.processed as i64,
            summary.extracted as i64,
            summary.failed as i64,
            summary.skipped as i64,
            summary.stopped,
        ],
    )?;
    Ok(())
}

pub struct RunRow {
    pub id: i64,
    pub pass: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub summary: RunSummary,
}

pub struct CheckpointStats {
    pub total: i64,
    pub by_category: Vec<(String, i64)>,
    pub by_origin: Vec<(String, i64)>,
    pub recent_runs: Vec<RunRow>,
}

pub fn get_stats(conn: &Connection) -> Result<CheckpointStats> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM extractions", [], |r| r.get(0))?;

    let grouped = |column: &str| -> Result<Vec<(String, i64)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {col}, COUNT(*) FROM extractions GROUP BY {col} ORDER BY COUNT(*) DESC",
            col = column
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    };

    let mut stmt = conn.prepare(
        "SELECT id, pass, started_at, finished_at, processed, extracted, failed, skipped, stopped
         FROM runs ORDER BY id DESC LIMIT 5",
    )?;
    let recent_runs = stmt
        .query_map([], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                pass: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                summary: RunSummary {
                    processed: row.get::<_, i64>(4)? as usize,
                    extracted: row.get::<_, i64>(5)? as usize,
                    failed: row.get::<_, i64>(6)? as usize,
                    skipped: row.get::<_, i64>(7)? as usize,
                    stopped: row.get(8)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CheckpointStats {
        total,
        by_category: grouped("post_category")?,
        by_origin: grouped("origin")?,
        recent_runs,
    })
}

#[cfg(test)]
pub(crate) fn memory_conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    conn
}
