//! The enriched CSV: source rows that have a result, joined with the
//! extracted columns. Rows without a result are never written.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use csv::StringRecord;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::codec;
use crate::record::{ExtractedFields, StoredResult, EXTRACTED_COLUMNS};
use crate::source::SourceTable;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub rows: usize,
    /// Results whose identity is not in the source table.
    pub orphaned: usize,
}

/// Rewrite the artifact at `path`. The file is written next to its
/// destination and renamed into place, so a crash leaves the previous
/// artifact intact.
pub fn persist(
    path: &Path,
    source: &SourceTable,
    results: &BTreeMap<i64, ExtractedFields>,
) -> Result<PersistStats> {
    let dir = match path.parent().filter(|d| !d.as_os_str().is_empty()) {
        Some(d) => {
            std::fs::create_dir_all(d).with_context(|| format!("Failed to create {:?}", d))?;
            d
        }
        None => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    let stats = write_artifact(&mut tmp, source, results)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {:?}", path))?;

    if stats.orphaned > 0 {
        warn!(orphaned = stats.orphaned, "results without a source row were not written");
    }
    debug!(rows = stats.rows, "Saved artifact {:?}", path);
    Ok(stats)
}

/// Left join of the source rows restricted to `results`' identities.
/// Source columns that share a name with an extracted column are replaced.
pub fn write_artifact<W: Write>(
    writer: W,
    source: &SourceTable,
    results: &BTreeMap<i64, ExtractedFields>,
) -> Result<PersistStats> {
    let kept: Vec<usize> = source
        .headers()
        .iter()
        .enumerate()
        .filter(|(_, h)| !EXTRACTED_COLUMNS.contains(&h.trim()))
        .map(|(i, _)| i)
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header: Vec<&str> = kept.iter().filter_map(|&i| source.headers().get(i)).collect();
    header.extend(EXTRACTED_COLUMNS);
    wtr.write_record(&header)?;

    let mut rows = 0usize;
    for row in source.rows() {
        let Some(fields) = results.get(&row.original_index) else {
            continue;
        };
        let mut record: Vec<String> = kept
            .iter()
            .map(|&i| row.record.get(i).unwrap_or_default().to_string())
            .collect();
        record.extend(fields.to_cells());
        record.push(row.original_index.to_string());
        wtr.write_record(&record)?;
        rows += 1;
    }
    wtr.flush()?;

    Ok(PersistStats {
        rows,
        orphaned: results.len() - rows,
    })
}

/// Results recovered from an artifact on disk.
#[derive(Debug, Default)]
pub struct ArtifactScan {
    pub results: Vec<StoredResult>,
    /// Rows with an empty `original_index`.
    pub zombies: usize,
    /// Rows with an identity but no recognisable `post_category`.
    pub undecodable: usize,
}

pub fn read_results(path: &Path) -> Result<ArtifactScan> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    scan_results(file).with_context(|| format!("Failed to read artifact {:?}", path))
}

pub fn scan_results<R: Read>(reader: R) -> Result<ArtifactScan> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);
    let index_col = position("original_index").context("artifact has no original_index column")?;

    let mut scan = ArtifactScan::default();
    let mut seen: BTreeMap<i64, usize> = BTreeMap::new();
    for record in rdr.records() {
        let record: StringRecord = record?;
        let Some(original_index) = record.get(index_col).and_then(codec::parse_int) else {
            scan.zombies += 1;
            continue;
        };
        let cell = |name: &str| position(name).and_then(|i| record.get(i));
        match ExtractedFields::from_cells(cell) {
            Some(fields) => match seen.get(&original_index) {
                // a later duplicate replaces the earlier one
                Some(&pos) => scan.results[pos].fields = fields,
                None => {
                    seen.insert(original_index, scan.results.len());
                    scan.results.push(StoredResult {
                        original_index,
                        fields,
                    });
                }
            },
            None => scan.undecodable += 1,
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Audience, ExtractionReply, PostCategory};

    const SOURCE: &str = "date,clean_text\n\
        2025-01-01,caption one is long enough\n\
        2025-01-02,caption two is long enough\n\
        2025-01-03,caption three is long enough\n\
        2025-01-04,caption four is long enough\n";

    fn source() -> SourceTable {
        SourceTable::from_reader(SOURCE.as_bytes(), "clean_text", None).unwrap()
    }

    fn fields(json: &str) -> ExtractedFields {
        ExtractionReply::parse(json).unwrap().to_fields()
    }

    fn render(results: &BTreeMap<i64, ExtractedFields>) -> (String, PersistStats) {
        let mut buf = Vec::new();
        let stats = write_artifact(&mut buf, &source(), results).unwrap();
        (String::from_utf8(buf).unwrap(), stats)
    }

    #[test]
    fn writes_only_rows_with_results() {
        let mut results = BTreeMap::new();
        results.insert(1, fields(r#"{"post_category": "COMPETITION", "comp_category": ["Essay"], "registration_fee": 10000}"#));
        results.insert(3, fields(r#"{"post_category": "WEBINAR", "target_audience": ["Mahasiswa"]}"#));

        let (text, stats) = render(&results);
        assert_eq!(stats, PersistStats { rows: 2, orphaned: 0 });

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "date,clean_text,post_category,comp_category,organizer,target_audience,min_team_size,max_team_size,registration_fee,original_index"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("2025-01-02,caption two is long enough,COMPETITION,"));
        assert!(lines[1].ends_with(",10000,1"));
        assert!(lines[2].starts_with("2025-01-04,caption four is long enough,WEBINAR,,"));
        assert!(lines[2].ends_with(",3"));
    }

    #[test]
    fn joins_by_identity_not_position() {
        let csv = "post_id,clean_text\n1,first caption text\n2,second caption text\n3,third caption text\n4,fourth caption text\n";
        let source = SourceTable::from_reader(csv.as_bytes(), "clean_text", Some("post_id")).unwrap();
        let mut results = BTreeMap::new();
        results.insert(2, fields(r#"{"post_category": "WEBINAR"}"#));
        results.insert(4, fields(r#"{"post_category": "GIVEAWAY", "registration_fee": 0}"#));

        let mut buf = Vec::new();
        write_artifact(&mut buf, &source, &results).unwrap();
        let scan = scan_results(buf.as_slice()).unwrap();
        let ids: Vec<i64> = scan.results.iter().map(|r| r.original_index).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(scan.results[0].fields, results[&2]);
        assert_eq!(scan.results[1].fields, results[&4]);

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("2,second caption text,WEBINAR"));
        assert!(text.contains("4,fourth caption text,GIVEAWAY"));
    }

    #[test]
    fn orphaned_results_are_counted_not_written() {
        let mut results = BTreeMap::new();
        results.insert(0, ExtractedFields::fallback());
        results.insert(99, ExtractedFields::fallback());
        let (text, stats) = render(&results);
        assert_eq!(stats, PersistStats { rows: 1, orphaned: 1 });
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn colliding_source_columns_are_replaced() {
        let csv = "clean_text,post_category\nsome caption text,stale\n";
        let source = SourceTable::from_reader(csv.as_bytes(), "clean_text", None).unwrap();
        let mut results = BTreeMap::new();
        results.insert(0, ExtractedFields::fallback());
        let mut buf = Vec::new();
        write_artifact(&mut buf, &source, &results).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("stale"));
        assert_eq!(text.lines().next().unwrap().matches("post_category").count(), 1);
    }

    #[test]
    fn persist_replaces_file_and_scans_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("enriched.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "old contents").unwrap();

        let mut results = BTreeMap::new();
        results.insert(2, fields(r#"{"post_category": "COMPETITION", "comp_category": ["Web Development"],
            "target_audience": ["SMA"], "min_team_size": 1, "max_team_size": 3, "registration_fee": 0}"#));
        let stats = persist(&path, &source(), &results).unwrap();
        assert_eq!(stats.rows, 1);

        let scan = read_results(&path).unwrap();
        assert_eq!(scan.zombies, 0);
        assert_eq!(scan.results.len(), 1);
        let stored = &scan.results[0];
        assert_eq!(stored.original_index, 2);
        assert_eq!(stored.fields.post_category, PostCategory::Competition);
        assert_eq!(stored.fields.comp_category, Some(vec!["Web Development".to_string()]));
        assert_eq!(stored.fields.target_audience, vec![Audience::Sma]);
        assert_eq!(stored.fields, results[&2]);

        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn scan_counts_zombies_and_undecodable_rows() {
        let csv = "post_category,original_index\nCOMPETITION,1\n,\nWEBINAR,nan\n???,4\nOTHER,1.0\n";
        let scan = scan_results(csv.as_bytes()).unwrap();
        assert_eq!(scan.zombies, 2);
        assert_eq!(scan.undecodable, 1);
        assert_eq!(scan.results.len(), 1);
        assert_eq!(scan.results[0].fields.post_category, PostCategory::Other);
    }

    #[test]
    fn scan_requires_identity_column() {
        assert!(scan_results("post_category\nCOMPETITION\n".as_bytes()).is_err());
    }
}
